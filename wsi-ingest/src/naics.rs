//! Cached NAICS reference data from the statics collection.
//!
//! One static document per filing year carries a `codes` map of NAICS
//! code string to caption and industry-average rates. Government
//! spreadsheets sometimes append extra digits to a code (12345 where
//! the published code is 1234), so lookups retry with trailing digits
//! stripped until something matches.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use wsi_common::models::NaicsInfo;
use wsi_common::Result;

use crate::store::{query_typed, Collection, Filter, Order, Query};

/// One `type = "naics"` static document, most recent years first.
#[derive(Debug, Clone, Deserialize)]
struct NaicsYearDoc {
    year_filing_for: i32,
    #[serde(default)]
    codes: HashMap<String, NaicsEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct NaicsEntry {
    #[serde(default)]
    caption: String,
    trir: Option<f64>,
    dart: Option<f64>,
}

pub struct NaicsCatalog {
    statics: Arc<dyn Collection>,
    years_back: usize,
    cache: Mutex<Option<Arc<Vec<NaicsYearDoc>>>>,
}

impl NaicsCatalog {
    pub fn new(statics: Arc<dyn Collection>, years_back: usize) -> Self {
        NaicsCatalog {
            statics,
            years_back,
            cache: Mutex::new(None),
        }
    }

    /// Caption for a code in its most recent year, if the catalog knows it.
    pub async fn caption(&self, code: u32) -> Result<Option<String>> {
        let hits = self.lookup(code, 1).await?;
        Ok(hits.into_iter().next().map(|n| n.caption))
    }

    /// Up to `num_years` entries for a code, newest year first.
    ///
    /// Each year searches the full code, then the code with trailing
    /// digits removed one at a time. Years with no match at any prefix
    /// are skipped.
    pub async fn lookup(&self, code: u32, num_years: usize) -> Result<Vec<NaicsInfo>> {
        let docs = self.load().await?;
        let code_str = code.to_string();
        let mut results = Vec::new();
        for doc in docs.iter().take(num_years) {
            for end in (1..=code_str.len()).rev() {
                if let Some(entry) = doc.codes.get(&code_str[..end]) {
                    results.push(NaicsInfo {
                        year_filing_for: doc.year_filing_for,
                        caption: entry.caption.clone(),
                        trir: entry.trir,
                        dart: entry.dart,
                    });
                    break;
                }
            }
        }
        Ok(results)
    }

    async fn load(&self) -> Result<Arc<Vec<NaicsYearDoc>>> {
        let mut cache = self.cache.lock().await;
        if let Some(docs) = cache.as_ref() {
            return Ok(Arc::clone(docs));
        }
        let query = Query::new()
            .filter(Filter::eq("type", "naics"))
            .order_by("year_filing_for", Order::Desc)
            .limit(self.years_back);
        let docs: Vec<NaicsYearDoc> = query_typed(self.statics.as_ref(), &query).await?;
        debug!(years = docs.len(), "loaded naics reference data");
        let docs = Arc::new(docs);
        *cache = Some(Arc::clone(&docs));
        Ok(docs)
    }
}
