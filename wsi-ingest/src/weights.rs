//! TTL-cached score weights from the statics collection.
//!
//! Weights are read on every score calculation, so they are cached for
//! a few seconds; a rescore that changes them writes through and
//! invalidates so the new values apply immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use wsi_common::models::ScoreWeights;
use wsi_common::Result;

use crate::store::{read_typed, BulkOp, Collection};

pub const WEIGHTS_DOC_ID: &str = "wsi_score_weights";

pub struct WeightsCache {
    statics: Arc<dyn Collection>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, ScoreWeights)>>,
}

impl WeightsCache {
    pub fn new(statics: Arc<dyn Collection>, ttl: Duration) -> Self {
        WeightsCache {
            statics,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Current weights, from cache when fresh. Falls back to compiled
    /// defaults when no weights document has ever been stored.
    pub async fn get(&self) -> Result<ScoreWeights> {
        let mut cached = self.cached.lock().await;
        if let Some((at, weights)) = cached.as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(*weights);
            }
        }
        let weights = read_typed::<StoredWeights>(self.statics.as_ref(), WEIGHTS_DOC_ID)
            .await?
            .map(|doc| doc.weights)
            .unwrap_or_default();
        *cached = Some((Instant::now(), weights));
        Ok(weights)
    }

    /// Persist new weights and drop the cached copy.
    pub async fn set(&self, weights: ScoreWeights) -> Result<()> {
        let doc = StoredWeights {
            id: WEIGHTS_DOC_ID.to_owned(),
            weights,
        };
        self.statics
            .bulk(&[BulkOp::upsert(&doc)?])
            .await?;
        debug!("score weights updated");
        *self.cached.lock().await = None;
        Ok(())
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoredWeights {
    id: String,
    #[serde(flatten)]
    weights: ScoreWeights,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCollection;

    #[tokio::test]
    async fn defaults_when_unset() {
        let cache = WeightsCache::new(
            Arc::new(MemoryCollection::new("statics")),
            Duration::from_secs(10),
        );
        assert_eq!(cache.get().await.unwrap(), ScoreWeights::default());
    }

    #[tokio::test]
    async fn set_invalidates_cache() {
        let cache = WeightsCache::new(
            Arc::new(MemoryCollection::new("statics")),
            Duration::from_secs(600),
        );
        assert_eq!(cache.get().await.unwrap().trir, 2.0);
        let new_weights = ScoreWeights {
            trir: 3.5,
            ..ScoreWeights::default()
        };
        cache.set(new_weights).await.unwrap();
        assert_eq!(cache.get().await.unwrap().trir, 3.5);
    }

    #[tokio::test]
    async fn stale_entries_are_refetched() {
        let statics = Arc::new(MemoryCollection::new("statics"));
        let cache = WeightsCache::new(Arc::clone(&statics) as Arc<dyn Collection>, Duration::ZERO);
        assert_eq!(cache.get().await.unwrap().dart, 2.0);
        let doc = StoredWeights {
            id: WEIGHTS_DOC_ID.to_owned(),
            weights: ScoreWeights {
                dart: 1.0,
                ..ScoreWeights::default()
            },
        };
        statics
            .upsert(serde_json::to_value(&doc).unwrap())
            .await
            .unwrap();
        // TTL of zero means every read goes back to the store.
        assert_eq!(cache.get().await.unwrap().dart, 1.0);
    }
}
