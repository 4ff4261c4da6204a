// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication handler contracts.
//!
//! Two layers talk to the master:
//!
//! ```text
//!  transport (user code)            protocol (this crate)
//!  ─────────────────────            ─────────────────────
//!  PullHandler::pull        ─┐
//!  PullHandler::stream      ─┼─► ReplicationHandler ─► downstream / upstream
//!  PushHandler::push        ─┘     master_changes_since
//!                                  master_change_stream
//!                                  master_write
//! ```
//!
//! Transport handlers only move data and report failures as
//! [`HandlerError`]. The orchestrator wraps them into a
//! [`ReplicationHandler`] that adds retries, modifiers and events.
//! The protocol itself never retries.
//!
//! [`StorageReplicationHandler`] exposes a local storage instance as a
//! master, for local-to-local replication and migrations.

use crate::checkpoint::Checkpoint;
use crate::conflict::ConflictHandler;
use crate::document::{DocumentState, StoredDocument};
use crate::error::{ReplicationError, Result};
use crate::storage::{BulkWriteRow, StorageInstance};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Type alias for boxed handler futures (reduces trait signature complexity).
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Result of a transport handler call.
pub type TransportResult<T> = std::result::Result<T, HandlerError>;

/// Boxed future returned by transport handlers.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>;

/// Document transform applied on the way in (pull) or out (push).
pub type DocumentModifier = Arc<dyn Fn(DocumentState) -> DocumentState + Send + Sync>;

/// Write context used by [`StorageReplicationHandler::master_write`].
pub const MASTER_WRITE_CONTEXT: &str = "replication-master-write";

/// Failure reported by a transport handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// A batch of master documents and the checkpoint after them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentsWithCheckpoint {
    pub documents: Vec<DocumentState>,
    pub checkpoint: Option<Checkpoint>,
}

impl DocumentsWithCheckpoint {
    pub fn empty(checkpoint: Option<Checkpoint>) -> Self {
        Self {
            documents: Vec::new(),
            checkpoint,
        }
    }
}

/// Item of the master change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PullStreamItem {
    /// Documents changed on master.
    Batch(DocumentsWithCheckpoint),
    /// The stream may have missed changes; run a checkpoint iteration.
    Resync,
}

/// One row of a `masterWrite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteToMasterRow {
    /// What the fork believes master holds. `None` for documents master never had.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumed_master_state: Option<DocumentState>,
    pub new_document_state: DocumentState,
}

/// What the protocol needs from a master.
///
/// `master_write` returns the real master state of every refused row;
/// an empty result means everything was accepted.
pub trait ReplicationHandler: Send + Sync + 'static {
    fn master_changes_since(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> HandlerFuture<'_, DocumentsWithCheckpoint>;

    /// Ongoing master changes. Called once per protocol run.
    fn master_change_stream(&self) -> BoxStream<'static, PullStreamItem>;

    fn master_write(&self, rows: Vec<WriteToMasterRow>) -> HandlerFuture<'_, Vec<DocumentState>>;

    /// Order of two master checkpoints, if the master format allows one.
    fn compare_checkpoints(&self, _a: &Checkpoint, _b: &Checkpoint) -> Option<Ordering> {
        None
    }
}

/// Transport side of the downstream.
pub trait PullHandler: Send + Sync + 'static {
    /// Up to `batch_size` documents changed after `checkpoint`.
    fn pull(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> TransportFuture<'_, DocumentsWithCheckpoint>;

    /// Live changes, if the transport can push them.
    fn stream(&self) -> Option<BoxStream<'static, PullStreamItem>> {
        None
    }

    /// Order of two checkpoints returned by `pull`. `None` keeps the latest.
    fn compare_checkpoints(&self, _a: &Checkpoint, _b: &Checkpoint) -> Option<Ordering> {
        None
    }
}

/// Transport side of the upstream.
pub trait PushHandler: Send + Sync + 'static {
    /// Write `rows` to master. Returns the master state of each conflicting row.
    fn push(&self, rows: Vec<WriteToMasterRow>) -> TransportFuture<'_, Vec<DocumentState>>;
}

/// Turn a broadcast subscription into a change stream.
///
/// A lagged receiver has lost items, so it yields a RESYNC and keeps going.
pub fn broadcast_stream<T, F>(receiver: broadcast::Receiver<T>, map: F) -> BoxStream<'static, PullStreamItem>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> Option<PullStreamItem> + Send + Sync + 'static,
{
    stream::unfold((receiver, map), |(mut receiver, map)| async move {
        loop {
            match receiver.recv().await {
                Ok(item) => {
                    if let Some(out) = map(item) {
                        return Some((out, (receiver, map)));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change stream lagged, requesting resync");
                    return Some((PullStreamItem::Resync, (receiver, map)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// A storage instance acting as master.
pub struct StorageReplicationHandler {
    instance: Arc<dyn StorageInstance>,
    conflict_handler: Arc<dyn ConflictHandler>,
    keep_meta: bool,
}

impl StorageReplicationHandler {
    pub fn new(instance: Arc<dyn StorageInstance>, conflict_handler: Arc<dyn ConflictHandler>) -> Self {
        Self {
            instance,
            conflict_handler,
            keep_meta: false,
        }
    }

    /// Hand out `_rev`/`_meta` with every document.
    pub fn with_keep_meta(mut self, keep_meta: bool) -> Self {
        self.keep_meta = keep_meta;
        self
    }

    async fn write(&self, rows: Vec<WriteToMasterRow>) -> Result<Vec<DocumentState>> {
        let mut by_id: HashMap<String, WriteToMasterRow> = HashMap::with_capacity(rows.len());
        let mut order = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.new_document_state.id.clone();
            if by_id.insert(id.clone(), row).is_none() {
                order.push(id);
            }
        }

        let master = self.instance.find_documents_by_id(&order, true).await?;
        let mut conflicts = Vec::new();
        let mut writes = Vec::new();

        for id in &order {
            let Some(row) = by_id.remove(id) else {
                continue;
            };
            let new_state = row.new_document_state.without_meta();
            match (master.get(id), row.assumed_master_state) {
                (None, _) => writes.push(BulkWriteRow::insert(StoredDocument::write(&new_state, None))),
                (Some(current), None) => conflicts.push(current.to_state(self.keep_meta)),
                (Some(current), Some(assumed)) => {
                    let real = current.to_state(false);
                    if self.conflict_handler.is_equal(&assumed, &real) {
                        let document = StoredDocument::write(&new_state, Some(&current.rev));
                        writes.push(BulkWriteRow::update(current.clone(), document));
                    } else {
                        conflicts.push(current.to_state(self.keep_meta));
                    }
                }
            }
        }

        if !writes.is_empty() {
            let response = self.instance.bulk_write(writes, MASTER_WRITE_CONTEXT).await?;
            for error in response.error {
                if !error.is_conflict() {
                    return Err(ReplicationError::Internal(format!(
                        "master write for {} failed with status {}",
                        error.document_id, error.status
                    )));
                }
                if let Some(in_db) = error.document_in_db {
                    conflicts.push(in_db.to_state(self.keep_meta));
                }
            }
        }

        debug!(
            master = %self.instance.name(),
            rows = order.len(),
            conflicts = conflicts.len(),
            "Master write"
        );
        Ok(conflicts)
    }
}

impl ReplicationHandler for StorageReplicationHandler {
    fn master_changes_since(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> HandlerFuture<'_, DocumentsWithCheckpoint> {
        Box::pin(async move {
            let changed = self
                .instance
                .get_changed_documents_since(batch_size, checkpoint.as_ref())
                .await?;
            if changed.documents.is_empty() {
                return Ok(DocumentsWithCheckpoint::empty(checkpoint));
            }
            Ok(DocumentsWithCheckpoint {
                documents: changed
                    .documents
                    .iter()
                    .map(|d| d.to_state(self.keep_meta))
                    .collect(),
                checkpoint: changed.checkpoint,
            })
        })
    }

    fn master_change_stream(&self) -> BoxStream<'static, PullStreamItem> {
        let keep_meta = self.keep_meta;
        broadcast_stream(self.instance.change_stream(), move |bulk| {
            Some(PullStreamItem::Batch(DocumentsWithCheckpoint {
                documents: bulk
                    .events
                    .iter()
                    .map(|event| event.document.to_state(keep_meta))
                    .collect(),
                checkpoint: Some(bulk.checkpoint.clone()),
            }))
        })
    }

    fn master_write(&self, rows: Vec<WriteToMasterRow>) -> HandlerFuture<'_, Vec<DocumentState>> {
        Box::pin(self.write(rows))
    }

    fn compare_checkpoints(&self, a: &Checkpoint, b: &Checkpoint) -> Option<Ordering> {
        self.instance.compare_checkpoints(a, b)
    }
}

// Storage-as-transport: lets a local instance be the remote of a full replication.

impl PullHandler for StorageReplicationHandler {
    fn pull(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> TransportFuture<'_, DocumentsWithCheckpoint> {
        Box::pin(async move {
            self.master_changes_since(checkpoint, batch_size)
                .await
                .map_err(|e| HandlerError(e.to_string()))
        })
    }

    fn stream(&self) -> Option<BoxStream<'static, PullStreamItem>> {
        Some(self.master_change_stream())
    }

    fn compare_checkpoints(&self, a: &Checkpoint, b: &Checkpoint) -> Option<Ordering> {
        ReplicationHandler::compare_checkpoints(self, a, b)
    }
}

impl PushHandler for StorageReplicationHandler {
    fn push(&self, rows: Vec<WriteToMasterRow>) -> TransportFuture<'_, Vec<DocumentState>> {
        Box::pin(async move { self.write(rows).await.map_err(|e| HandlerError(e.to_string())) })
    }
}
