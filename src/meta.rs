// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication meta rows.
//!
//! Every replication owns a meta storage instance. It holds two kinds of
//! rows, both keyed by `identifier|itemId|isCheckpoint`:
//!
//! ```text
//! sync-users|up|1      → { checkpointData: {...} }                 (checkpoint, per direction)
//! sync-users|a|0       → { docData: {id: "a", v: 2},                (assumed master state)
//!                          forkRevision: "3-…",
//!                          isResolvedConflict: "4-…" }
//! ```
//!
//! `docData` is what the fork believes master holds for the document.
//! `forkRevision` is the fork revision that was accepted by master with that
//! state. `isResolvedConflict` marks a state that was written into the fork
//! by conflict resolution.
//!
//! Meta rows are only ever written by this replication's own engines, so a
//! 409 on a meta write just means the other direction got there first. The
//! write is rebased on the stored row and retried.

use crate::checkpoint::Checkpoint;
use crate::document::{DocumentState, StoredDocument};
use crate::storage::{BulkWriteRow, StorageError, StorageInstance, StorageResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Write context used for meta rows.
pub const META_WRITE_CONTEXT: &str = "replication-meta";

/// Attempts before a meta write that keeps hitting 409 gives up.
const META_CONFLICT_MAX_ATTEMPTS: u32 = 16;

/// Primary key of a meta row.
pub fn meta_document_id(identifier: &str, item_id: &str, is_checkpoint: bool) -> String {
    format!("{}|{}|{}", identifier, item_id, if is_checkpoint { "1" } else { "0" })
}

/// Payload of a meta row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRow {
    pub identifier: String,
    pub item_id: String,
    /// `"1"` for checkpoint rows, `"0"` for document rows.
    pub is_checkpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_data: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_data: Option<DocumentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_resolved_conflict: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_revision: Option<String>,
}

impl MetaRow {
    pub fn checkpoint(identifier: &str, direction: &str, checkpoint: Checkpoint) -> Self {
        Self {
            identifier: identifier.to_string(),
            item_id: direction.to_string(),
            is_checkpoint: "1".to_string(),
            checkpoint_data: Some(checkpoint),
            doc_data: None,
            is_resolved_conflict: None,
            fork_revision: None,
        }
    }

    pub fn document(identifier: &str, doc_data: DocumentState) -> Self {
        Self {
            identifier: identifier.to_string(),
            item_id: doc_data.id.clone(),
            is_checkpoint: "0".to_string(),
            checkpoint_data: None,
            doc_data: Some(doc_data),
            is_resolved_conflict: None,
            fork_revision: None,
        }
    }

    pub fn id(&self) -> String {
        meta_document_id(&self.identifier, &self.item_id, self.is_checkpoint == "1")
    }

    pub fn from_document(doc: &StoredDocument) -> StorageResult<Self> {
        Ok(serde_json::from_value(Value::Object(doc.data.clone()))?)
    }

    /// Stored document for this row, following `previous`.
    pub fn to_document(&self, previous: Option<&StoredDocument>) -> StorageResult<StoredDocument> {
        let data = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let state = DocumentState {
            id: self.id(),
            deleted: false,
            rev: None,
            meta: None,
            data,
        };
        Ok(StoredDocument::write(&state, previous.map(|p| &p.rev)))
    }

    /// Bulk write row replacing `previous`.
    pub fn to_write_row(&self, previous: Option<&StoredDocument>) -> StorageResult<BulkWriteRow> {
        Ok(BulkWriteRow {
            previous: previous.cloned(),
            document: self.to_document(previous)?,
        })
    }
}

/// What the fork believes master holds for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct AssumedMasterState {
    pub doc_data: DocumentState,
    pub is_resolved_conflict: Option<String>,
    pub fork_revision: Option<String>,
    /// The meta row itself, needed as `previous` for the next write.
    pub meta_document: StoredDocument,
}

/// Load assumed master states for `ids`. Documents without a row are absent.
pub async fn get_assumed_master_state(
    meta: &dyn StorageInstance,
    identifier: &str,
    ids: &[String],
) -> StorageResult<HashMap<String, AssumedMasterState>> {
    let meta_ids: Vec<String> = ids
        .iter()
        .map(|id| meta_document_id(identifier, id, false))
        .collect();
    let rows = meta.find_documents_by_id(&meta_ids, true).await?;

    let mut out = HashMap::with_capacity(rows.len());
    for (_, meta_document) in rows {
        let row = MetaRow::from_document(&meta_document)?;
        let Some(doc_data) = row.doc_data else {
            continue;
        };
        out.insert(
            row.item_id,
            AssumedMasterState {
                doc_data,
                is_resolved_conflict: row.is_resolved_conflict,
                fork_revision: row.fork_revision,
                meta_document,
            },
        );
    }
    Ok(out)
}

/// Meta row write recording `doc_data` as the master state of its document.
pub fn assumed_master_write_row(
    identifier: &str,
    doc_data: &DocumentState,
    previous: Option<&StoredDocument>,
    is_resolved_conflict: Option<String>,
    fork_revision: Option<String>,
) -> StorageResult<BulkWriteRow> {
    let row = MetaRow {
        is_resolved_conflict,
        fork_revision,
        ..MetaRow::document(identifier, doc_data.clone())
    };
    row.to_write_row(previous)
}

/// Write meta rows, rebasing rows that hit 409 on the stored state.
///
/// Returns the number of rows written. Storage errors other than 409
/// propagate.
pub async fn write_meta_rows(
    meta: &dyn StorageInstance,
    mut rows: Vec<BulkWriteRow>,
    context: &str,
) -> StorageResult<usize> {
    let mut written = 0;
    let mut attempts = 0;

    while !rows.is_empty() {
        attempts += 1;
        let response = meta.bulk_write(rows, context).await?;
        written += response.success.len();

        let mut retry = Vec::new();
        for error in response.error {
            if !error.is_conflict() {
                return Err(StorageError::Backend(format!(
                    "meta write for {} failed with status {}",
                    error.document_id, error.status
                )));
            }
            let previous = error.document_in_db;
            let row = MetaRow::from_document(&error.write_row.document)?;
            retry.push(row.to_write_row(previous.as_ref())?);
        }

        if !retry.is_empty() {
            if attempts >= META_CONFLICT_MAX_ATTEMPTS {
                warn!(rows = retry.len(), attempts, "Meta write kept conflicting, giving up");
                return Err(StorageError::Backend(format!(
                    "meta write still conflicting after {} attempts",
                    attempts
                )));
            }
            debug!(rows = retry.len(), attempts, "Meta write conflict, rebasing");
            crate::metrics::record_meta_conflict_retry(retry.len());
        }
        rows = retry;
    }

    Ok(written)
}
