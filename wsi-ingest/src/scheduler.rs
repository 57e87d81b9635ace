//! Concurrency plumbing for the import pipeline.
//!
//! Parse workers claim row indices from a shared counter so the pool
//! drains the input without partitioning it up front. Finished records
//! land on queues that an uploader empties in adaptive batches: a batch
//! that draws any throttled responses shrinks the next one, a clean
//! batch grows it, always within a fixed window.

use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use chrono::Utc;
use wsi_common::models::{ErrorRecord, ErrorTask};
use wsi_common::Result;

use crate::progress::ProgressHandle;
use crate::store::{BulkOp, Collection};

/// Batch size that reacts to store throttling.
pub struct BatchTuner {
    size: AtomicUsize,
    min: usize,
    max: usize,
}

impl BatchTuner {
    pub fn new(start: usize, min: usize, max: usize) -> Self {
        BatchTuner {
            size: AtomicUsize::new(start.clamp(min, max)),
            min,
            max,
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Shrink after a throttled batch, grow after a clean one.
    pub fn record(&self, throttled: usize) {
        let cur = self.size.load(Ordering::Relaxed);
        let next = if throttled > 0 { cur - 1 } else { cur + 1 };
        self.size.store(next.clamp(self.min, self.max), Ordering::Relaxed);
    }
}

/// Run `task(idx)` for every index in `0..total` across a pool of
/// workers, each claiming the next unclaimed index.
pub async fn run_claimed<F, Fut>(workers: usize, total: usize, task: F)
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = ()>,
{
    let next = AtomicUsize::new(0);
    let task = &task;
    let next = &next;
    let pool = (0..workers.max(1)).map(|_| async move {
        loop {
            let idx = next.fetch_add(1, Ordering::Relaxed);
            if idx >= total {
                break;
            }
            task(idx).await;
        }
    });
    futures::future::join_all(pool).await;
}

/// Shared queues and counters for one entity type's uploads.
pub struct UploadChannel {
    pub upserts: Mutex<VecDeque<Value>>,
    pub patches: Mutex<VecDeque<BulkOp>>,
    pub uploaded: AtomicUsize,
    pub errored: AtomicUsize,
}

impl UploadChannel {
    pub fn new() -> Self {
        UploadChannel {
            upserts: Mutex::new(VecDeque::new()),
            patches: Mutex::new(VecDeque::new()),
            uploaded: AtomicUsize::new(0),
            errored: AtomicUsize::new(0),
        }
    }

    pub fn push_upsert(&self, doc: Value) {
        self.upserts.lock().expect("upsert queue poisoned").push_back(doc);
    }

    pub fn push_patch(&self, op: BulkOp) {
        self.patches.lock().expect("patch queue poisoned").push_back(op);
    }

    pub fn record_error(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    fn take_upserts(&self, max: usize) -> Vec<Value> {
        let mut queue = self.upserts.lock().expect("upsert queue poisoned");
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    fn take_patches(&self, max: usize) -> Vec<BulkOp> {
        let mut queue = self.patches.lock().expect("patch queue poisoned");
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    fn queues_empty(&self) -> bool {
        self.upserts.lock().expect("upsert queue poisoned").is_empty()
            && self.patches.lock().expect("patch queue poisoned").is_empty()
    }

    pub fn accounted(&self) -> usize {
        self.uploaded.load(Ordering::Relaxed) + self.errored.load(Ordering::Relaxed)
    }
}

impl Default for UploadChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains an [`UploadChannel`] into a collection until every one of
/// `total` expected records is accounted for by an upload or an error,
/// and both queues are empty.
pub struct Uploader {
    pub col: Arc<dyn Collection>,
    pub channel: Arc<UploadChannel>,
    pub tuner: Arc<BatchTuner>,
    pub progress: Arc<ProgressHandle>,
    pub errors: Arc<Mutex<Vec<ErrorRecord>>>,
    pub upsert_task: ErrorTask,
    pub patch_task: ErrorTask,
    pub idle: Duration,
    pub label: &'static str,
}

impl Uploader {
    pub async fn run(&self, total: usize) -> Result<()> {
        debug!(total, kind = self.label, "uploader started");
        loop {
            let drained = self.channel.accounted() >= total && self.channel.queues_empty();
            if drained {
                break;
            }
            if self.channel.queues_empty() {
                tokio::time::sleep(self.idle).await;
                continue;
            }
            self.drain_once().await?;
        }
        debug!(kind = self.label, "uploader finished");
        Ok(())
    }

    /// One pass over both queues: a single upsert batch and a single
    /// patch batch, requeueing anything the store throttles.
    async fn drain_once(&self) -> Result<()> {
        let upsert_batch = self.channel.take_upserts(self.tuner.size());
        if !upsert_batch.is_empty() {
            let batch_len = upsert_batch.len();
            let ops: Vec<BulkOp> =
                upsert_batch.iter().cloned().map(BulkOp::Upsert).collect();
            let results = self.col.bulk(&ops).await?;
            let mut retries = 0;
            for (doc, result) in upsert_batch.into_iter().zip(results) {
                if result.is_throttled() {
                    retries += 1;
                    self.channel.push_upsert(doc);
                } else if !result.is_success() {
                    // Failed items count as handled: their error
                    // record gets uploaded instead.
                    self.progress.add_both(1);
                    self.push_error(self.upsert_task, result.status, doc);
                } else {
                    self.progress.add_completed(1);
                }
            }
            self.tuner.record(retries);
            self.channel
                .uploaded
                .fetch_add(batch_len - retries, Ordering::Relaxed);
            debug!(
                uploaded = self.channel.uploaded.load(Ordering::Relaxed),
                kind = self.label,
                batch_size = self.tuner.size(),
                "upsert batch finished"
            );
        }

        let patch_batch = self.channel.take_patches(self.tuner.size());
        if !patch_batch.is_empty() {
            let results = self.col.bulk(&patch_batch).await?;
            let mut retries = 0;
            for (op, result) in patch_batch.into_iter().zip(results) {
                if result.is_throttled() {
                    retries += 1;
                    self.channel.push_patch(op);
                } else if !result.is_success() {
                    self.progress.add_both(1);
                    let detail = op
                        .target_id()
                        .map(str::to_owned)
                        .unwrap_or_default();
                    self.push_error(self.patch_task, result.status, Value::String(detail));
                } else {
                    self.progress.add_completed(1);
                }
            }
            self.tuner.record(retries);
        }
        Ok(())
    }

    fn push_error(&self, task: ErrorTask, status: u16, data: Value) {
        warn!(?task, status, kind = self.label, "bulk item failed");
        self.errors.lock().expect("error list poisoned").push(ErrorRecord {
            id: Uuid::new_v4().to_string(),
            task,
            col: None,
            msg: format!("store returned status {status}"),
            data: Some(data),
            filename: self.progress.filename().to_owned(),
            nonce: self.progress.nonce().to_owned(),
            created: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCollection;
    use serde_json::json;

    #[test]
    fn tuner_stays_in_window() {
        let tuner = BatchTuner::new(41, 40, 100);
        tuner.record(3);
        assert_eq!(tuner.size(), 40);
        tuner.record(1);
        assert_eq!(tuner.size(), 40);
        for _ in 0..100 {
            tuner.record(0);
        }
        assert_eq!(tuner.size(), 100);
    }

    #[tokio::test]
    async fn claimed_indices_cover_range_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = Arc::clone(&seen);
        run_claimed(4, 25, |idx| {
            let seen = Arc::clone(&seen_ref);
            async move {
                seen.lock().unwrap().push(idx);
            }
        })
        .await;
        let mut indices = seen.lock().unwrap().clone();
        indices.sort_unstable();
        assert_eq!(indices, (0..25).collect::<Vec<_>>());
    }

    fn uploader(col: Arc<MemoryCollection>) -> (Uploader, Arc<UploadChannel>) {
        let channel = Arc::new(UploadChannel::new());
        let uploader = Uploader {
            col,
            channel: Arc::clone(&channel),
            tuner: Arc::new(BatchTuner::new(60, 40, 100)),
            progress: ProgressHandle::new("t.csv", "Uploading"),
            errors: Arc::new(Mutex::new(Vec::new())),
            upsert_task: ErrorTask::UploadLocation,
            patch_task: ErrorTask::PatchLocation,
            idle: Duration::from_millis(5),
            label: "locations",
        };
        (uploader, channel)
    }

    #[tokio::test]
    async fn throttled_items_are_requeued_and_batch_shrinks() {
        let col = Arc::new(MemoryCollection::new("locations"));
        col.throttle_once("doc-3");
        let (uploader, channel) = uploader(Arc::clone(&col));
        for i in 0..10 {
            channel.push_upsert(json!({"id": format!("doc-{i}")}));
        }
        // First pass sees the 429: the doc is requeued, not stored, and
        // the next batch is one smaller.
        uploader.drain_once().await.unwrap();
        assert_eq!(col.len().await, 9);
        assert!(col.read("doc-3").await.unwrap().is_none());
        assert_eq!(uploader.tuner.size(), 59);
        // The retry pass stores it and the clean batch grows the size back.
        uploader.run(10).await.unwrap();
        assert_eq!(col.len().await, 10);
        assert!(col.read("doc-3").await.unwrap().is_some());
        assert_eq!(channel.uploaded.load(Ordering::Relaxed), 10);
        assert_eq!(uploader.tuner.size(), 60);
        assert!(uploader.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_items_become_error_records() {
        let col = Arc::new(MemoryCollection::new("locations"));
        let (uploader, channel) = uploader(Arc::clone(&col));
        channel.push_upsert(json!({"id": "ok"}));
        channel.push_upsert(json!({"missing_id": true}));
        uploader.run(2).await.unwrap();
        let errors = uploader.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].task, ErrorTask::UploadLocation);
        assert_eq!(col.len().await, 1);
    }

    #[tokio::test]
    async fn leftover_patches_are_flushed_before_exit() {
        let col = Arc::new(MemoryCollection::new("locations"));
        col.upsert(json!({"id": "old", "isLatest": true})).await.unwrap();
        let (uploader, channel) = uploader(Arc::clone(&col));
        channel.push_upsert(json!({"id": "new"}));
        channel.push_patch(BulkOp::Patch {
            id: "old".into(),
            ops: vec![crate::store::PatchOp::set("isLatest", false)],
        });
        uploader.run(1).await.unwrap();
        let doc = col.read("old").await.unwrap().unwrap();
        assert_eq!(doc["isLatest"], false);
    }
}
