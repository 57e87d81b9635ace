//! Industry-average and error-record uploads at the tail of a run.

use std::collections::VecDeque;
use tracing::{debug, warn};

use wsi_common::models::{ErrorTask, IndustryInfo, Metric};
use wsi_common::Result;

use crate::store::BulkOp;

use super::{ImportPipeline, ProcessingState};

/// Finalize each industry tally (sums become averages) and upsert them.
pub(super) async fn upload_industries(
    p: &ImportPipeline,
    state: &ProcessingState,
) -> Result<()> {
    state.progress.set_task("Calculating industry averages");

    let mut pending: VecDeque<IndustryInfo> = {
        let mut map = state.industry_map.lock().expect("industry map poisoned");
        map.drain().map(|(_, industry)| finalize(industry)).collect()
    };
    debug!(industries = pending.len(), "uploading industry averages");

    let tuner = p.tuner();
    while !pending.is_empty() {
        let n = pending.len().min(tuner.size());
        let batch: Vec<IndustryInfo> = pending.drain(..n).collect();
        let ops = batch
            .iter()
            .map(BulkOp::upsert)
            .collect::<Result<Vec<_>>>()?;
        let results = p.store.industry_info.bulk(&ops).await?;

        let mut retries = 0;
        for (industry, result) in batch.into_iter().zip(results) {
            if result.is_throttled() {
                retries += 1;
                pending.push_back(industry);
            } else if !result.is_success() {
                warn!(id = %industry.id, status = result.status, "industry upsert failed");
                state.progress.add_total(1);
                state.errors.lock().expect("error list poisoned").push(
                    wsi_common::models::ErrorRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        task: ErrorTask::UploadIndustry,
                        col: None,
                        msg: format!("store returned status {}", result.status),
                        data: serde_json::to_value(&industry).ok(),
                        filename: state.progress.filename().to_owned(),
                        nonce: state.progress.nonce().to_owned(),
                        created: chrono::Utc::now(),
                    },
                );
                state.progress.add_completed(1);
            } else {
                state.progress.add_completed(1);
            }
        }
        tuner.record(retries);
    }
    Ok(())
}

fn finalize(mut industry: IndustryInfo) -> IndustryInfo {
    let n = industry.num_locations.max(1) as f64;
    for m in Metric::ALL {
        industry.averages.set(m, industry.averages.get(m) / n);
    }
    if let Some(sum) = industry.average_score {
        industry.average_score = Some(sum / n);
    }
    industry
}

/// Persist every error accumulated during the run.
pub(super) async fn upload_errors(p: &ImportPipeline, state: &ProcessingState) -> Result<()> {
    state.progress.set_task("Logging errors");

    let mut pending: VecDeque<_> = {
        let mut errors = state.errors.lock().expect("error list poisoned");
        errors.drain(..).collect()
    };
    if pending.is_empty() {
        return Ok(());
    }
    debug!(errors = pending.len(), "uploading error records");

    let tuner = p.tuner();
    while !pending.is_empty() {
        let n = pending.len().min(tuner.size());
        let batch: Vec<_> = pending.drain(..n).collect();
        let ops = batch
            .iter()
            .map(BulkOp::upsert)
            .collect::<Result<Vec<_>>>()?;
        let results = p.store.errors.bulk(&ops).await?;
        let mut retries = 0;
        for (record, result) in batch.into_iter().zip(results) {
            if result.is_throttled() {
                retries += 1;
                pending.push_back(record);
            } else {
                if !result.is_success() {
                    warn!(task = ?record.task, status = result.status, "error record failed to upload");
                }
                state.progress.add_completed(1);
            }
        }
        tuner.record(retries);
    }
    Ok(())
}
