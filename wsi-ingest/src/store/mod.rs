//! Document-store abstraction the pipeline persists through.
//!
//! Collections hold JSON documents keyed by their `id` field. Writes go
//! through [`BulkOp`] batches whose per-item results carry an HTTP-style
//! status code, so a throttled item (429) can be requeued without
//! failing the batch. Queries are conjunctive filters with optional
//! ordering and paging.

pub mod files;
pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use wsi_common::{Error, Result};

/// Status code a store returns for an item it refused under load.
pub const STATUS_THROTTLED: u16 = 429;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals value. Numeric comparison tolerates i64/f64 mixing.
    Eq(String, Value),
    /// Field does not equal value (missing fields match).
    Ne(String, Value),
    /// Array-valued field contains the value.
    ArrayContains(String, Value),
    /// Any of the nested filters matches.
    Or(Vec<Filter>),
    /// All of the nested filters match.
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::ArrayContains(field.into(), value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Conjunction of filters with optional ordering and paging.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Order)>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    pub fn filter(mut self, f: Filter) -> Self {
        self.filters.push(f);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A single field mutation applied to an existing document.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Set { path: String, value: Value },
    Incr { path: String, amount: f64 },
}

impl PatchOp {
    pub fn set(path: impl Into<String>, value: impl Into<Value>) -> Self {
        PatchOp::Set {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn incr(path: impl Into<String>, amount: f64) -> Self {
        PatchOp::Incr {
            path: path.into(),
            amount,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BulkOp {
    /// Insert or fully replace the document carried in the value.
    Upsert(Value),
    /// Apply field mutations to the document with the given id.
    Patch { id: String, ops: Vec<PatchOp> },
    /// Remove the document with the given id.
    Delete { id: String },
}

impl BulkOp {
    pub fn upsert<T: Serialize>(doc: &T) -> Result<Self> {
        Ok(BulkOp::Upsert(serde_json::to_value(doc)?))
    }

    /// The document id this operation targets, when determinable.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            BulkOp::Upsert(v) => v.get("id").and_then(Value::as_str),
            BulkOp::Patch { id, .. } => Some(id),
            BulkOp::Delete { id } => Some(id),
        }
    }
}

/// Per-item outcome of a bulk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkItemResult {
    pub status: u16,
}

impl BulkItemResult {
    pub fn ok() -> Self {
        BulkItemResult { status: 200 }
    }

    pub fn throttled() -> Self {
        BulkItemResult {
            status: STATUS_THROTTLED,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_throttled(&self) -> bool {
        self.status == STATUS_THROTTLED
    }
}

/// One page of query results plus the offset to continue from.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<Value>,
    pub continuation: Option<usize>,
}

#[async_trait]
pub trait Collection: Send + Sync {
    async fn query(&self, query: &Query) -> Result<Vec<Value>>;

    /// Like [`Collection::query`] but returns at most `max` items and a
    /// continuation offset when more remain.
    async fn query_page(&self, query: &Query, max: usize) -> Result<Page>;

    async fn count(&self, query: &Query) -> Result<usize>;

    async fn read(&self, id: &str) -> Result<Option<Value>>;

    async fn upsert(&self, doc: Value) -> Result<()>;

    async fn bulk(&self, ops: &[BulkOp]) -> Result<Vec<BulkItemResult>>;
}

/// Run a query and deserialize every hit into `T`.
pub async fn query_typed<T: DeserializeOwned>(
    col: &dyn Collection,
    query: &Query,
) -> Result<Vec<T>> {
    let hits = col.query(query).await?;
    hits.into_iter()
        .map(|v| serde_json::from_value(v).map_err(Error::from))
        .collect()
}

/// Read a single document and deserialize it into `T`.
pub async fn read_typed<T: DeserializeOwned>(
    col: &dyn Collection,
    id: &str,
) -> Result<Option<T>> {
    match col.read(id).await? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

/// The collections the pipeline writes to, bundled for wiring.
#[derive(Clone)]
pub struct Store {
    pub locations: Arc<dyn Collection>,
    pub companies: Arc<dyn Collection>,
    pub industry_info: Arc<dyn Collection>,
    pub errors: Arc<dyn Collection>,
    pub statics: Arc<dyn Collection>,
}

impl Store {
    /// Fresh in-memory store, one collection per concern.
    pub fn in_memory() -> Self {
        Store {
            locations: Arc::new(memory::MemoryCollection::new("locations")),
            companies: Arc::new(memory::MemoryCollection::new("companies")),
            industry_info: Arc::new(memory::MemoryCollection::new("industry_info")),
            errors: Arc::new(memory::MemoryCollection::new("errors")),
            statics: Arc::new(memory::MemoryCollection::new("statics")),
        }
    }
}
