//! # WSI Common Library
//!
//! Shared code for the WSI safety-statistics services including:
//! - Persisted document models (Location, Company, IndustryInfo, scores)
//! - Pure safety-metric calculators (TRIR, DART, average work week)
//! - Tokenization and search-field generation
//! - Fuzzy string-similarity capability
//! - Configuration loading
//! - Common error types

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod similarity;
pub mod text;

pub use error::{Error, Result};
pub use similarity::{JaroWinkler, Similarity};
