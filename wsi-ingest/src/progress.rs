//! Nonce-keyed progress tracking for background jobs.
//!
//! Imports and rescores run detached from the caller, who polls by
//! nonce. Task totals grow while work is discovered (each new company
//! or industry adds tasks), so percent-complete can move backwards.
//! Finished jobs linger for a grace period before being dropped so a
//! final poll still sees the completed state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Poll snapshot for one background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportProgress {
    pub nonce: String,
    pub filename: String,
    pub task: String,
    #[serde(rename = "totalTasks")]
    pub total_tasks: usize,
    #[serde(rename = "completedTasks")]
    pub completed_tasks: usize,
    /// Public page paths whose caches are stale after this job.
    #[serde(rename = "revalidateUrls")]
    pub revalidate_urls: Vec<String>,
}

/// Live counters one job's workers update concurrently.
pub struct ProgressHandle {
    nonce: String,
    filename: String,
    task: Mutex<String>,
    total: AtomicUsize,
    completed: AtomicUsize,
    revalidate_urls: Mutex<Vec<String>>,
}

impl ProgressHandle {
    pub fn new(filename: impl Into<String>, task: impl Into<String>) -> Arc<Self> {
        Arc::new(ProgressHandle {
            nonce: Uuid::new_v4().to_string(),
            filename: filename.into(),
            task: Mutex::new(task.into()),
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            revalidate_urls: Mutex::new(Vec::new()),
        })
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn set_task(&self, task: impl Into<String>) {
        *self.task.lock().expect("task lock poisoned") = task.into();
    }

    pub fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_completed(&self, n: usize) {
        self.completed.fetch_add(n, Ordering::Relaxed);
    }

    /// One unit of work that was only just discovered and is already done.
    pub fn add_both(&self, n: usize) {
        self.add_total(n);
        self.add_completed(n);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn push_revalidate_url(&self, url: String) {
        let mut urls = self.revalidate_urls.lock().expect("url lock poisoned");
        if !urls.contains(&url) {
            urls.push(url);
        }
    }

    pub fn revalidate_url_count(&self) -> usize {
        self.revalidate_urls.lock().expect("url lock poisoned").len()
    }

    pub fn snapshot(&self) -> ImportProgress {
        ImportProgress {
            nonce: self.nonce.clone(),
            filename: self.filename.clone(),
            task: self.task.lock().expect("task lock poisoned").clone(),
            total_tasks: self.total.load(Ordering::Relaxed),
            completed_tasks: self.completed.load(Ordering::Relaxed),
            revalidate_urls: self
                .revalidate_urls
                .lock()
                .expect("url lock poisoned")
                .clone(),
        }
    }
}

/// All currently pollable jobs.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, Arc<ProgressHandle>>>>,
    gc_delay: Duration,
}

impl JobRegistry {
    pub fn new(gc_delay: Duration) -> Self {
        JobRegistry {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            gc_delay,
        }
    }

    pub fn insert(&self, handle: Arc<ProgressHandle>) {
        self.jobs
            .write()
            .expect("registry lock poisoned")
            .insert(handle.nonce().to_owned(), handle);
    }

    pub fn get(&self, nonce: &str) -> Option<Arc<ProgressHandle>> {
        self.jobs
            .read()
            .expect("registry lock poisoned")
            .get(nonce)
            .cloned()
    }

    /// Schedule removal of a finished job after the grace period.
    pub fn finish(&self, nonce: &str) {
        let jobs = Arc::clone(&self.jobs);
        let nonce = nonce.to_owned();
        let delay = self.gc_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            jobs.write().expect("registry lock poisoned").remove(&nonce);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_grow_retroactively() {
        let handle = ProgressHandle::new("f.csv", "Parsing");
        handle.add_total(10);
        handle.add_completed(10);
        // Work discovered after the fact increases the denominator.
        handle.add_total(5);
        let snap = handle.snapshot();
        assert_eq!(snap.total_tasks, 15);
        assert_eq!(snap.completed_tasks, 10);
    }

    #[tokio::test]
    async fn finished_jobs_are_dropped_after_grace() {
        tokio::time::pause();
        let registry = JobRegistry::new(Duration::from_secs(10));
        let handle = ProgressHandle::new("f.csv", "Parsing");
        let nonce = handle.nonce().to_owned();
        registry.insert(handle);
        registry.finish(&nonce);
        assert!(registry.get(&nonce).is_some());
        // Let the spawned gc task register its sleep before the clock moves.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(registry.get(&nonce).is_none());
    }

    #[test]
    fn revalidate_urls_deduplicate() {
        let handle = ProgressHandle::new("f.csv", "Parsing");
        handle.push_revalidate_url("/summary/acme".into());
        handle.push_revalidate_url("/summary/acme".into());
        assert_eq!(handle.snapshot().revalidate_urls.len(), 1);
    }
}
