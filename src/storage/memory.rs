// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory storage instance.
//!
//! Holds documents in a `HashMap` behind a mutex. Bulk writes are stamped
//! with `_meta.lwt`, applied and published on the change stream while the
//! lock is held, so change batches and `(lwt, id)` scans both follow commit
//! order.

use super::{
    BoxFuture, BulkWriteError, BulkWriteResponse, BulkWriteRow, ChangeEvent, ChangeEventBulk,
    ChangedDocuments, LwtCheckpoint, Query, StorageError, StorageInstance, StorageResult,
    CHANGE_STREAM_CAPACITY,
};
use crate::checkpoint::Checkpoint;
use crate::document::{DocumentMeta, StoredDocument};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Storage instance that lives only as long as the process.
pub struct MemoryStorage {
    name: String,
    documents: Mutex<HashMap<String, StoredDocument>>,
    changes: broadcast::Sender<Arc<ChangeEventBulk>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Self {
            name: name.into(),
            documents: Mutex::new(HashMap::new()),
            changes,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of stored documents, tombstones included.
    pub fn len(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, StoredDocument>>> {
        self.documents
            .lock()
            .map_err(|_| StorageError::Backend(format!("{}: document map poisoned", self.name)))
    }

    fn write_rows(&self, rows: Vec<BulkWriteRow>, context: &str) -> StorageResult<BulkWriteResponse> {
        self.check_open()?;
        let mut documents = self.lock()?;
        let mut response = BulkWriteResponse::default();
        let mut events = Vec::new();

        for row in rows {
            let current = documents.get(&row.document.id);
            let expected = row.previous.as_ref().map(|p| &p.rev);
            if current.map(|c| &c.rev) != expected {
                response.error.push(BulkWriteError::conflict(row, current.cloned()));
                continue;
            }
            let mut document = row.document;
            document.meta = DocumentMeta::now();
            let previous = documents.insert(document.id.clone(), document.clone());
            events.push(ChangeEvent::new(document.clone(), previous));
            response.success.push(document);
        }

        if let Some(last) = events.last() {
            let checkpoint = LwtCheckpoint::of(&last.document).into_checkpoint();
            let bulk = ChangeEventBulk {
                events,
                checkpoint,
                context: context.to_string(),
            };
            // No subscribers is fine
            let _ = self.changes.send(Arc::new(bulk));
        }

        debug!(
            storage = %self.name,
            context,
            written = response.success.len(),
            conflicts = response.error.len(),
            "Bulk write"
        );
        Ok(response)
    }

    fn changed_since(&self, limit: usize, checkpoint: Option<&Checkpoint>) -> StorageResult<ChangedDocuments> {
        self.check_open()?;
        let position = checkpoint.map(LwtCheckpoint::parse).transpose()?;
        let documents = self.lock()?;

        let mut changed: Vec<StoredDocument> = documents
            .values()
            .filter(|doc| position.as_ref().map(|p| p.is_before(doc)).unwrap_or(true))
            .cloned()
            .collect();
        changed.sort_by(|a, b| {
            a.meta
                .lwt
                .partial_cmp(&b.meta.lwt)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        changed.truncate(limit);

        let checkpoint = match changed.last() {
            Some(last) => Some(LwtCheckpoint::of(last).into_checkpoint()),
            None => checkpoint.cloned(),
        };
        Ok(ChangedDocuments {
            documents: changed,
            checkpoint,
        })
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("name", &self.name)
            .field("documents", &self.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl StorageInstance for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str) -> BoxFuture<'_, BulkWriteResponse> {
        let result = self.write_rows(rows, context);
        Box::pin(async move { result })
    }

    fn find_documents_by_id(
        &self,
        ids: &[String],
        include_deleted: bool,
    ) -> BoxFuture<'_, HashMap<String, StoredDocument>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            self.check_open()?;
            let documents = self.lock()?;
            Ok(ids
                .iter()
                .filter_map(|id| documents.get(id))
                .filter(|doc| include_deleted || !doc.deleted)
                .map(|doc| (doc.id.clone(), doc.clone()))
                .collect())
        })
    }

    fn query(&self, query: &Query) -> BoxFuture<'_, Vec<StoredDocument>> {
        let query = query.clone();
        Box::pin(async move {
            self.check_open()?;
            let snapshot: Vec<StoredDocument> = self.lock()?.values().cloned().collect();
            Ok(query.apply(snapshot))
        })
    }

    fn count(&self, query: &Query) -> BoxFuture<'_, usize> {
        let query = Query {
            skip: 0,
            limit: None,
            ..query.clone()
        };
        Box::pin(async move {
            self.check_open()?;
            let documents = self.lock()?;
            Ok(documents.values().filter(|d| query.matches(d)).count())
        })
    }

    fn compare_checkpoints(&self, a: &Checkpoint, b: &Checkpoint) -> Option<std::cmp::Ordering> {
        LwtCheckpoint::compare(a, b)
    }

    fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> BoxFuture<'_, ChangedDocuments> {
        let result = self.changed_since(limit, checkpoint);
        Box::pin(async move { result })
    }

    fn change_stream(&self) -> broadcast::Receiver<Arc<ChangeEventBulk>> {
        self.changes.subscribe()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn remove(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.lock()?.clear();
            Ok(())
        })
    }
}
