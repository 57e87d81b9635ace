//! In-memory [`Collection`] used by tests and the default wiring.
//!
//! Documents live in a `HashMap` behind an async `RwLock`. Filter
//! evaluation walks dotted field paths into the JSON value. A small
//! fault hook lets tests mark document ids that should be throttled
//! exactly once, exercising the 429 requeue path in the uploader.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use tokio::sync::RwLock;

use wsi_common::{Error, Result};

use super::{BulkItemResult, BulkOp, Collection, Filter, Order, Page, PatchOp, Query};

pub struct MemoryCollection {
    name: &'static str,
    docs: RwLock<HashMap<String, Value>>,
    throttle_once: StdMutex<HashSet<String>>,
}

impl MemoryCollection {
    pub fn new(name: &'static str) -> Self {
        MemoryCollection {
            name,
            docs: RwLock::new(HashMap::new()),
            throttle_once: StdMutex::new(HashSet::new()),
        }
    }

    /// Mark a document id so the next bulk write touching it reports a
    /// 429 instead of applying. The mark clears after firing once.
    pub fn throttle_once(&self, id: impl Into<String>) {
        self.throttle_once
            .lock()
            .expect("throttle set poisoned")
            .insert(id.into());
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    fn take_throttle(&self, id: &str) -> bool {
        self.throttle_once
            .lock()
            .expect("throttle set poisoned")
            .remove(id)
    }

    async fn matching(&self, query: &Query) -> Vec<Value> {
        let docs = self.docs.read().await;
        let mut hits: Vec<&Value> = docs
            .values()
            .filter(|doc| query.filters.iter().all(|f| eval_filter(doc, f)))
            .collect();
        if let Some((field, order)) = &query.order_by {
            hits.sort_by(|a, b| {
                let ord = compare_field(a, b, field);
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        } else {
            // Stable iteration for tests.
            hits.sort_by(|a, b| compare_field(a, b, "id"));
        }
        hits.into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    async fn query(&self, query: &Query) -> Result<Vec<Value>> {
        Ok(self.matching(query).await)
    }

    async fn query_page(&self, query: &Query, max: usize) -> Result<Page> {
        let mut probe = query.clone();
        probe.limit = Some(max + 1);
        let mut items = self.matching(&probe).await;
        let continuation = if items.len() > max {
            items.truncate(max);
            Some(query.offset + max)
        } else {
            None
        };
        Ok(Page {
            items,
            continuation,
        })
    }

    async fn count(&self, query: &Query) -> Result<usize> {
        Ok(self.matching(query).await.len())
    }

    async fn read(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.docs.read().await.get(id).cloned())
    }

    async fn upsert(&self, doc: Value) -> Result<()> {
        let id = doc_id(&doc)?;
        self.docs.write().await.insert(id, doc);
        Ok(())
    }

    async fn bulk(&self, ops: &[BulkOp]) -> Result<Vec<BulkItemResult>> {
        let mut docs = self.docs.write().await;
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            if let Some(id) = op.target_id() {
                if self.take_throttle(id) {
                    results.push(BulkItemResult::throttled());
                    continue;
                }
            }
            let status = match op {
                BulkOp::Upsert(doc) => match doc_id(doc) {
                    Ok(id) => {
                        docs.insert(id, doc.clone());
                        200
                    }
                    Err(_) => 400,
                },
                BulkOp::Patch { id, ops } => match docs.get_mut(id) {
                    Some(doc) => {
                        for patch in ops {
                            apply_patch(doc, patch);
                        }
                        200
                    }
                    None => 404,
                },
                BulkOp::Delete { id } => {
                    if docs.remove(id).is_some() {
                        204
                    } else {
                        404
                    }
                }
            };
            results.push(BulkItemResult { status });
        }
        Ok(results)
    }
}

fn doc_id(doc: &Value) -> Result<String> {
    doc.get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidInput("document is missing an id".into()))
}

/// Walk a dotted field path into a JSON value.
fn field_at<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn eval_filter(doc: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(field, value) => {
            field_at(doc, field).is_some_and(|v| values_equal(v, value))
        }
        Filter::Ne(field, value) => {
            !field_at(doc, field).is_some_and(|v| values_equal(v, value))
        }
        Filter::ArrayContains(field, value) => field_at(doc, field)
            .and_then(Value::as_array)
            .is_some_and(|arr| arr.iter().any(|v| values_equal(v, value))),
        Filter::Or(alternatives) => alternatives.iter().any(|f| eval_filter(doc, f)),
        Filter::And(conjuncts) => conjuncts.iter().all(|f| eval_filter(doc, f)),
    }
}

fn compare_field(a: &Value, b: &Value, field: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let va = field_at(a, field);
    let vb = field_at(b, field);
    match (va, vb) {
        (Some(x), Some(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx.partial_cmp(&fy).unwrap_or(Ordering::Equal),
            _ => x
                .as_str()
                .unwrap_or_default()
                .cmp(y.as_str().unwrap_or_default()),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn apply_patch(doc: &mut Value, patch: &PatchOp) {
    match patch {
        PatchOp::Set { path, value } => {
            if let Some(slot) = slot_at(doc, path) {
                *slot = value.clone();
            }
        }
        PatchOp::Incr { path, amount } => {
            if let Some(slot) = slot_at(doc, path) {
                let cur = slot.as_f64().unwrap_or(0.0);
                *slot = Value::from(cur + amount);
            }
        }
    }
}

/// Mutable slot for a dotted path, creating intermediate objects.
fn slot_at<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut cur = doc;
    for part in path.split('.') {
        let obj = cur.as_object_mut()?;
        cur = obj.entry(part.to_owned()).or_insert(Value::Null);
        if cur.is_null() {
            *cur = Value::Object(serde_json::Map::new());
        }
    }
    Some(cur)
}

impl std::fmt::Debug for MemoryCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCollection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn eq_and_array_contains_filters() {
        let col = MemoryCollection::new("t");
        col.upsert(json!({"id": "a", "place": "acme", "tokens": ["acme", "steel"]}))
            .await
            .unwrap();
        col.upsert(json!({"id": "b", "place": "other", "tokens": ["other"]}))
            .await
            .unwrap();

        let q = Query::new().filter(Filter::eq("place", "acme"));
        assert_eq!(col.count(&q).await.unwrap(), 1);

        let q = Query::new()
            .filter(Filter::array_contains("tokens", "steel"))
            .filter(Filter::array_contains("tokens", "acme"));
        let hits = col.query(&q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], "a");
    }

    #[tokio::test]
    async fn order_and_pages() {
        let col = MemoryCollection::new("t");
        for year in [2020, 2023, 2021, 2022] {
            col.upsert(json!({"id": format!("d{year}"), "year_filing_for": year}))
                .await
                .unwrap();
        }
        let q = Query::new().order_by("year_filing_for", Order::Desc);
        let hits = col.query(&q).await.unwrap();
        assert_eq!(hits[0]["year_filing_for"], 2023);

        let page = col.query_page(&q, 3).await.unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.continuation, Some(3));
        let rest = col
            .query_page(&q.clone().offset(3), 3)
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.continuation, None);
    }

    #[tokio::test]
    async fn bulk_patch_and_delete() {
        let col = MemoryCollection::new("t");
        col.upsert(json!({"id": "a", "n": 1.0, "nested": {"x": "old"}}))
            .await
            .unwrap();
        let results = col
            .bulk(&[
                BulkOp::Patch {
                    id: "a".into(),
                    ops: vec![PatchOp::incr("n", 2.0), PatchOp::set("nested.x", "new")],
                },
                BulkOp::Delete { id: "ghost".into() },
            ])
            .await
            .unwrap();
        assert!(results[0].is_success());
        assert_eq!(results[1].status, 404);
        let doc = col.read("a").await.unwrap().unwrap();
        assert_eq!(doc["n"], 3.0);
        assert_eq!(doc["nested"]["x"], "new");
    }

    #[tokio::test]
    async fn throttle_fires_once() {
        let col = MemoryCollection::new("t");
        col.throttle_once("a");
        let op = BulkOp::Upsert(json!({"id": "a"}));
        let first = col.bulk(std::slice::from_ref(&op)).await.unwrap();
        assert!(first[0].is_throttled());
        assert!(col.read("a").await.unwrap().is_none());
        let second = col.bulk(std::slice::from_ref(&op)).await.unwrap();
        assert!(second[0].is_success());
        assert!(col.read("a").await.unwrap().is_some());
    }
}
