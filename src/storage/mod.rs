// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage instance contract.
//!
//! The replication protocol never talks to a database directly. Fork, meta
//! and (for local-to-local replication) master instances are all consumed
//! through [`StorageInstance`]:
//!
//! | Operation | Used by |
//! |-----------|---------|
//! | `bulk_write` | downstream apply, conflict writes, meta rows, checkpoints |
//! | `find_documents_by_id` | assumed-master lookups, current fork state |
//! | `query` / `count` | callers and tests |
//! | `get_changed_documents_since` | upstream initial sync, storage-as-master pulls |
//! | `change_stream` | upstream live changes, storage-as-master streams |
//! | `close` / `remove` | replication cancel/remove |
//!
//! Two implementations ship with the crate: [`MemoryStorage`] and
//! [`SqliteStorage`]. Both use `{ "id", "lwt" }` checkpoints and order their
//! change scans by `(lwt, id)`.
//!
//! # Example
//!
//! ```rust,no_run
//! use doc_replication::storage::{MemoryStorage, StorageInstance, BulkWriteRow};
//! use doc_replication::document::StoredDocument;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), doc_replication::storage::StorageError> {
//! let fork = MemoryStorage::new("fork");
//! let doc = StoredDocument::insert("a", json!({"v": 1}));
//! let result = fork.bulk_write(vec![BulkWriteRow::insert(doc)], "app").await?;
//! assert!(result.error.is_empty());
//! # Ok(())
//! # }
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::checkpoint::Checkpoint;
use crate::document::StoredDocument;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>;

/// Buffered change batches per subscriber before it is considered lagging.
pub const CHANGE_STREAM_CAPACITY: usize = 1024;

/// HTTP-like status of a revision conflict in a bulk write.
pub const CONFLICT_STATUS: u16 = 409;

/// Errors raised by storage instances.
///
/// Revision conflicts are NOT errors at this level: they are reported per
/// row in [`BulkWriteResponse::error`].
#[derive(Error, Debug)]
pub enum StorageError {
    /// The instance was closed or removed.
    #[error("storage instance is closed")]
    Closed,

    /// A document or checkpoint could not be encoded/decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite backend error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// A checkpoint that this instance did not produce.
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// One row of a bulk write.
///
/// `previous` is the state the writer believes is current. A mismatch with
/// the stored revision yields a 409 for that row.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteRow {
    pub previous: Option<StoredDocument>,
    pub document: StoredDocument,
}

impl BulkWriteRow {
    /// Row for a document that is expected not to exist yet.
    pub fn insert(document: StoredDocument) -> Self {
        Self {
            previous: None,
            document,
        }
    }

    /// Row that replaces `previous`.
    pub fn update(previous: StoredDocument, document: StoredDocument) -> Self {
        Self {
            previous: Some(previous),
            document,
        }
    }
}

/// Per-row failure of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteError {
    pub status: u16,
    pub document_id: String,
    pub write_row: BulkWriteRow,
    /// Stored state at the time of the write (set for 409).
    pub document_in_db: Option<StoredDocument>,
}

impl BulkWriteError {
    pub fn conflict(write_row: BulkWriteRow, document_in_db: Option<StoredDocument>) -> Self {
        Self {
            status: CONFLICT_STATUS,
            document_id: write_row.document.id.clone(),
            write_row,
            document_in_db,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status == CONFLICT_STATUS
    }
}

/// Outcome of a bulk write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResponse {
    pub success: Vec<StoredDocument>,
    pub error: Vec<BulkWriteError>,
}

/// Result of a changed-since scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedDocuments {
    pub documents: Vec<StoredDocument>,
    /// Position after the last returned document, or the input checkpoint when empty.
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A single document change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub document_id: String,
    pub document: StoredDocument,
    pub previous: Option<StoredDocument>,
}

impl ChangeEvent {
    /// Event for `document` replacing `previous`.
    pub fn new(document: StoredDocument, previous: Option<StoredDocument>) -> Self {
        let operation = if document.deleted {
            ChangeOperation::Delete
        } else if previous.as_ref().map(|p| p.deleted).unwrap_or(true) {
            ChangeOperation::Insert
        } else {
            ChangeOperation::Update
        };
        Self {
            operation,
            document_id: document.id.clone(),
            document,
            previous,
        }
    }
}

/// All changes of one bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEventBulk {
    pub events: Vec<ChangeEvent>,
    /// Checkpoint covering every event in this batch.
    pub checkpoint: Checkpoint,
    /// Context string passed to `bulk_write`.
    pub context: String,
}

/// Simple equality query.
///
/// `selector` keys compare against payload fields, plus `id` and `_deleted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub selector: Map<String, Value>,
    /// Ascending sort field. Ties and missing values fall back to `id`.
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl Query {
    /// Every live document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Documents whose `field` equals `value`.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        let mut selector = Map::new();
        selector.insert(field.into(), value);
        Self {
            selector,
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, field: impl Into<String>) -> Self {
        self.sort = Some(field.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &StoredDocument) -> bool {
        if doc.deleted && !self.include_deleted {
            return false;
        }
        self.selector.iter().all(|(field, expected)| {
            field_value(doc, field).as_ref() == Some(expected)
        })
    }

    /// Filter, sort and page `docs`.
    pub fn apply(&self, docs: impl IntoIterator<Item = StoredDocument>) -> Vec<StoredDocument> {
        let mut matched: Vec<StoredDocument> = docs.into_iter().filter(|d| self.matches(d)).collect();
        let sort = self.sort.as_deref();
        matched.sort_by(|a, b| {
            let by_field = match sort {
                Some(field) => compare_values(field_value(a, field).as_ref(), field_value(b, field).as_ref()),
                None => Ordering::Equal,
            };
            by_field.then_with(|| a.id.cmp(&b.id))
        });
        let limit = self.limit.unwrap_or(usize::MAX);
        matched.into_iter().skip(self.skip).take(limit).collect()
    }
}

fn field_value(doc: &StoredDocument, field: &str) -> Option<Value> {
    match field {
        "id" => Some(Value::String(doc.id.clone())),
        "_deleted" => Some(Value::Bool(doc.deleted)),
        other => doc.data.get(other).cloned(),
    }
}

/// Missing < null < bool < number < string; arrays and objects compare equal.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Position in an `(lwt, id)` ordered change scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwtCheckpoint {
    pub id: String,
    pub lwt: f64,
}

impl LwtCheckpoint {
    pub fn of(doc: &StoredDocument) -> Self {
        Self {
            id: doc.id.clone(),
            lwt: doc.meta.lwt,
        }
    }

    pub fn parse(checkpoint: &Checkpoint) -> StorageResult<Self> {
        serde_json::from_value(checkpoint.as_value().clone())
            .map_err(|e| StorageError::InvalidCheckpoint(format!("{}: {}", checkpoint, e)))
    }

    /// True if `doc` comes strictly after this position.
    pub fn is_before(&self, doc: &StoredDocument) -> bool {
        match doc.meta.lwt.partial_cmp(&self.lwt) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Equal) => doc.id > self.id,
            _ => false,
        }
    }

    /// Order of two `(lwt, id)` checkpoints. `None` if either has another shape.
    pub fn compare(a: &Checkpoint, b: &Checkpoint) -> Option<Ordering> {
        let (a, b) = (Self::parse(a).ok()?, Self::parse(b).ok()?);
        Some(a.lwt.partial_cmp(&b.lwt)?.then_with(|| a.id.cmp(&b.id)))
    }

    pub fn into_checkpoint(self) -> Checkpoint {
        Checkpoint::from(serde_json::json!({ "id": self.id, "lwt": self.lwt }))
    }
}

/// Trait defining what the protocol needs from a document store.
///
/// Implementations must linearize bulk writes: change batches are emitted
/// in write order and their checkpoints increase monotonically.
pub trait StorageInstance: Send + Sync + 'static {
    /// Instance name (for logging).
    fn name(&self) -> &str;

    /// Write all rows. Conflicting rows land in `error` with status 409.
    fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str) -> BoxFuture<'_, BulkWriteResponse>;

    /// Point lookups. Tombstones are only returned with `include_deleted`.
    fn find_documents_by_id(
        &self,
        ids: &[String],
        include_deleted: bool,
    ) -> BoxFuture<'_, HashMap<String, StoredDocument>>;

    fn query(&self, query: &Query) -> BoxFuture<'_, Vec<StoredDocument>>;

    fn count(&self, query: &Query) -> BoxFuture<'_, usize>;

    /// Up to `limit` documents changed after `checkpoint`, tombstones included.
    fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> BoxFuture<'_, ChangedDocuments>;

    /// Order of two checkpoints produced by this instance, if it can tell.
    ///
    /// Without an order the most recently recorded checkpoint wins.
    fn compare_checkpoints(&self, _a: &Checkpoint, _b: &Checkpoint) -> Option<Ordering> {
        None
    }

    /// Subscribe to change batches written after this call.
    fn change_stream(&self) -> broadcast::Receiver<Arc<ChangeEventBulk>>;

    /// Release resources. Further operations fail with [`StorageError::Closed`].
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Delete all persisted data and close.
    fn remove(&self) -> BoxFuture<'_, ()>;
}
