//! Bulk import and scoring service for workplace safety records.
//!
//! Accepts OSHA establishment-level injury summaries as CSV sheets,
//! maps arbitrary column headers onto canonical fields, resolves each
//! row to a stable location identity and a parent company, maintains
//! per-identity rolling history across filing years, aggregates
//! locations into company documents, and computes a weighted safety
//! score for every company touched by the batch.
//!
//! The crate is transport-agnostic. Callers hand it parsed sheets (or
//! names resolvable through a [`store::files::FileStore`]) and poll
//! progress by nonce; persistence goes through the [`store::Collection`]
//! trait so the same pipeline runs against the in-memory store used in
//! tests or any document database an integrator wires up.

pub mod aggregate;
pub mod fieldmap;
pub mod gate;
pub mod history;
pub mod merge;
pub mod naics;
pub mod pipeline;
pub mod progress;
pub mod rescore;
pub mod resolver;
pub mod revalidate;
pub mod scheduler;
pub mod score;
pub mod service;
pub mod store;
pub mod weights;

pub use pipeline::{ImportPipeline, RunOptions};
pub use progress::{ImportProgress, JobRegistry};
pub use service::IngestService;
