//! Full-catalog score recalculation.
//!
//! Triggered when score weights change. Walks every latest company
//! document page by page, recomputes its composite score against the
//! industry history, and patches only the `wsi_score` field so the rest
//! of the document is untouched. Progress is reported through the same
//! registry imports use.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use wsi_common::models::{Company, ScoreWeights};
use wsi_common::Result;

use crate::progress::{ImportProgress, ProgressHandle};
use crate::score::calc_score;
use crate::store::{BulkOp, Filter, PatchOp, Query};

use crate::pipeline::ImportPipeline;

const PAGE_SIZE: usize = 95;
const NAICS_SCORE_YEARS: usize = 3;

impl ImportPipeline {
    /// Optionally store new weights, then rescore every latest company
    /// in the background. Returns the initial progress snapshot.
    pub async fn recalculate_all_scores(
        self: &Arc<Self>,
        new_weights: Option<ScoreWeights>,
    ) -> Result<ImportProgress> {
        if let Some(weights) = new_weights {
            self.weights.set(weights).await?;
        }

        let latest = Query::new().filter(Filter::eq("isLatest", true));
        let total = self.store.companies.count(&latest).await?;
        let progress = ProgressHandle::new("rescore".to_owned(), "Rescoring");
        progress.add_total(total);
        self.registry.insert(Arc::clone(&progress));

        let pipeline = Arc::clone(self);
        let handle = Arc::clone(&progress);
        let snapshot = progress.snapshot();
        tokio::spawn(async move {
            let nonce = handle.nonce().to_owned();
            if let Err(e) = pipeline.rescore_all(&handle).await {
                warn!(nonce = %nonce, error = %e, "rescore failed");
                handle.set_task("Failed");
            } else {
                handle.set_task("Done!");
            }
            pipeline.registry.finish(&nonce);
        });
        Ok(snapshot)
    }

    async fn rescore_all(&self, progress: &ProgressHandle) -> Result<()> {
        let weights = self.weights.get().await?;
        info!(weights = ?weights, "rescoring all companies");

        let mut offset = 0usize;
        let mut scored = 0usize;
        loop {
            let query = Query::new()
                .filter(Filter::eq("isLatest", true))
                .offset(offset)
                .limit(PAGE_SIZE);
            let page = self.store.companies.query_page(&query, PAGE_SIZE).await?;
            if page.items.is_empty() {
                break;
            }

            let mut ops = Vec::with_capacity(page.items.len());
            for item in &page.items {
                let company: Company = serde_json::from_value(item.clone())?;
                let history = match company.industry.as_ref().and_then(|i| i.naics_code) {
                    Some(code) => self.naics.lookup(code, NAICS_SCORE_YEARS).await?,
                    None => Vec::new(),
                };
                let score = calc_score(&company, &weights, &history, false);
                ops.push(BulkOp::Patch {
                    id: company.id,
                    ops: vec![PatchOp::set("wsi_score", serde_json::to_value(&score)?)],
                });
            }
            scored += ops.len();
            self.flush_patches(ops, progress).await?;

            match page.continuation {
                Some(next) => offset = next,
                None => break,
            }
        }
        info!(companies = scored, "rescore complete");
        Ok(())
    }

    /// Apply a batch of patches, requeueing throttled items until the
    /// store accepts everything.
    async fn flush_patches(
        &self,
        mut ops: Vec<BulkOp>,
        progress: &ProgressHandle,
    ) -> Result<()> {
        while !ops.is_empty() {
            let results = self.store.companies.bulk(&ops).await?;
            let mut retry = Vec::new();
            for (op, result) in ops.into_iter().zip(results) {
                if result.is_throttled() {
                    retry.push(op);
                } else {
                    if !result.is_success() {
                        warn!(
                            id = op.target_id().unwrap_or_default(),
                            status = result.status,
                            "score patch failed"
                        );
                    }
                    progress.add_completed(1);
                }
            }
            if !retry.is_empty() {
                debug!(retries = retry.len(), "store throttled, backing off");
                tokio::time::sleep(Duration::from_millis(self.config.import.rescore_retry_ms))
                    .await;
            }
            ops = retry;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revalidate::SummaryPages;
    use crate::store::Store;
    use wsi_common::config::TomlConfig;

    fn pipeline() -> Arc<ImportPipeline> {
        ImportPipeline::new(
            Store::in_memory(),
            Arc::new(SummaryPages),
            TomlConfig::default(),
        )
    }

    fn company(id: &str, year: i32, trir: f64) -> Company {
        let mut c = Company::new(id.to_owned(), year);
        c.id = id.to_owned();
        c.is_latest = true;
        c.total_hours_worked = 2_000_000.0;
        c.metrics.trir = trir;
        c
    }

    #[tokio::test]
    async fn patches_every_latest_company() {
        let p = pipeline();
        for i in 0..3 {
            p.store
                .companies
                .upsert(serde_json::to_value(company(&format!("c{i}"), 2023, 0.0)).unwrap())
                .await
                .unwrap();
        }

        let snapshot = p.recalculate_all_scores(None).await.unwrap();
        assert_eq!(snapshot.total_tasks, 3);

        // Poll until the background task drains.
        for _ in 0..200 {
            tokio::task::yield_now().await;
            let done = p
                .registry
                .get(&snapshot.nonce)
                .map(|h| h.snapshot().completed_tasks >= 3)
                .unwrap_or(true);
            if done {
                break;
            }
        }
        for i in 0..3 {
            let doc = p
                .store
                .companies
                .read(&format!("c{i}"))
                .await
                .unwrap()
                .unwrap();
            let stored: Company = serde_json::from_value(doc).unwrap();
            // No incidents and no history leaves a perfect score.
            assert_eq!(stored.wsi_score.unwrap().score, 100);
        }
    }

    #[tokio::test]
    async fn new_weights_are_persisted_before_scoring() {
        let p = pipeline();
        let weights = ScoreWeights {
            trir: 5.0,
            ..ScoreWeights::default()
        };
        p.recalculate_all_scores(Some(weights)).await.unwrap();
        assert_eq!(p.weights.get().await.unwrap().trir, 5.0);
    }
}
