//! Typed entry points for the embedding application.
//!
//! Each method is one transport-agnostic operation: start an import
//! from an uploaded file or inline rows, poll a running job, trigger a
//! full rescore, or merge duplicate locations. All of them are
//! admin-only through the [`AdminGate`] seam.

use std::sync::Arc;
use tracing::info;

use wsi_common::models::{CsvSheet, ScoreWeights};
use wsi_common::{Error, Result};

use crate::gate::{AdminGate, RequestContext};
use crate::merge::MergeOutcome;
use crate::pipeline::{ImportPipeline, RunOptions};
use crate::progress::ImportProgress;
use crate::store::files::FileStore;

/// Where an import's rows come from.
#[derive(Debug, Clone)]
pub enum ImportSource {
    /// A file previously stored through [`IngestService::upload_file`].
    File(String),
    /// Rows carried directly in the request.
    Inline(CsvSheet),
}

pub struct IngestService {
    pipeline: Arc<ImportPipeline>,
    files: Arc<dyn FileStore>,
    gate: Arc<dyn AdminGate>,
}

impl IngestService {
    pub fn new(
        pipeline: Arc<ImportPipeline>,
        files: Arc<dyn FileStore>,
        gate: Arc<dyn AdminGate>,
    ) -> Self {
        IngestService {
            pipeline,
            files,
            gate,
        }
    }

    fn authorize(&self, ctx: &RequestContext) -> Result<()> {
        if self.gate.is_admin(ctx) {
            Ok(())
        } else {
            Err(Error::Forbidden("admin session required".into()))
        }
    }

    /// Store raw CSV bytes for a later import.
    pub async fn upload_file(
        &self,
        ctx: &RequestContext,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.authorize(ctx)?;
        info!(name, size = bytes.len(), "file uploaded");
        self.files.put(name, bytes).await
    }

    /// Kick off an import and return the initial progress snapshot; the
    /// run continues in the background under the snapshot's nonce.
    pub async fn begin_import(
        &self,
        ctx: &RequestContext,
        source: ImportSource,
        mut options: RunOptions,
    ) -> Result<ImportProgress> {
        self.authorize(ctx)?;
        let sheet = match source {
            ImportSource::File(name) => {
                let sheet = self.files.read_sheet(&name).await?;
                options.filename.get_or_insert(name);
                sheet
            }
            ImportSource::Inline(sheet) => sheet,
        };
        self.pipeline.begin_import(sheet, options).await
    }

    /// Progress of a running (or recently finished) job.
    pub fn poll_import(&self, ctx: &RequestContext, nonce: &str) -> Result<ImportProgress> {
        self.authorize(ctx)?;
        self.pipeline
            .registry()
            .get(nonce)
            .map(|handle| handle.snapshot())
            .ok_or_else(|| Error::NotFound(format!("no running import with nonce {nonce}")))
    }

    /// Rescore every latest company, optionally storing new weights first.
    pub async fn recalculate_all_scores(
        &self,
        ctx: &RequestContext,
        new_weights: Option<ScoreWeights>,
    ) -> Result<ImportProgress> {
        self.authorize(ctx)?;
        self.pipeline.recalculate_all_scores(new_weights).await
    }

    /// Merge duplicate locations; the first id is the surviving record.
    pub async fn merge_locations(
        &self,
        ctx: &RequestContext,
        ids: &[String],
    ) -> Result<MergeOutcome> {
        self.authorize(ctx)?;
        self.pipeline.merge_locations(ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::StaticToken;
    use crate::revalidate::SummaryPages;
    use crate::store::files::MemoryFileStore;
    use crate::store::Store;
    use wsi_common::config::TomlConfig;

    fn service(gate: Arc<dyn AdminGate>) -> IngestService {
        let pipeline = ImportPipeline::new(
            Store::in_memory(),
            Arc::new(SummaryPages),
            TomlConfig::default(),
        );
        IngestService::new(pipeline, Arc::new(MemoryFileStore::new()), gate)
    }

    #[tokio::test]
    async fn non_admins_are_rejected() {
        let svc = service(Arc::new(StaticToken::new("s3cret")));
        let err = svc
            .upload_file(&RequestContext::default(), "a.csv", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn file_import_round_trip() {
        let svc = service(Arc::new(crate::gate::AllowAll));
        let ctx = RequestContext::default();
        let csv = b"Company Name,EIN,Year Filing For,Annual Average Employees,Total Hours Worked\n\
Acme Corp,12-3456789,2023,10,20000\n"
            .to_vec();
        svc.upload_file(&ctx, "osha.csv", csv).await.unwrap();

        let progress = svc
            .begin_import(
                &ctx,
                ImportSource::File("osha.csv".to_owned()),
                RunOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(progress.filename, "osha.csv");
        assert!(progress.total_tasks >= 1);

        // The job is registered under the returned nonce straight away.
        let polled = svc.poll_import(&ctx, &progress.nonce).unwrap();
        assert_eq!(polled.filename, "osha.csv");
    }

    #[tokio::test]
    async fn polling_unknown_nonce_is_not_found() {
        let svc = service(Arc::new(crate::gate::AllowAll));
        let err = svc
            .poll_import(&RequestContext::default(), "nope")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
