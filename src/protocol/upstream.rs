// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Upstream: fork → master.
//!
//! # Cycle
//!
//! ```text
//! collect ids ─► re-read fork ─► filter against meta ─► masterWrite (chunks)
//!                                                         │
//!                     ┌───────────────────────────────────┤
//!                     ▼                                   ▼
//!            accepted: commit meta            refused: resolve conflict,
//!                                             write resolution into fork
//!                     └──────────────┬────────────────────┘
//!                                    ▼
//!                           queue up checkpoint
//! ```
//!
//! Change events written by our own downstream only advance the checkpoint.
//! The initial sync iterates `getChangedDocumentsSince` on the fork and runs
//! again while it keeps producing conflict writes.

use super::types::{ReplicationStats, Stamped, UpTask};
use super::{downstream_write_context, wait_true, ProtocolState, UP_CONFLICT_WRITE_CONTEXT};
use crate::checkpoint::{Checkpoint, Direction};
use crate::conflict::{resolved_fork_document, ConflictInput, ConflictOutput, ResolvedConflict};
use crate::document::{DocumentState, StoredDocument};
use crate::error::{ReplicationError, Result};
use crate::handler::WriteToMasterRow;
use crate::meta::{assumed_master_write_row, get_assumed_master_state, write_meta_rows, AssumedMasterState, META_WRITE_CONTEXT};
use crate::metrics;
use crate::storage::BulkWriteRow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

pub(super) async fn run(state: Arc<ProtocolState>, mut tasks: mpsc::UnboundedReceiver<Stamped<UpTask>>) {
    let span = info_span!("upstream", identifier = %state.identifier());

    async move {
        info!("Starting upstream");
        if let Err(e) = state.apply_initial_checkpoint(Direction::Up).await {
            state.report_error(Direction::Up, e);
        }

        let mut canceled = state.events.canceled.subscribe();
        let downstream_context = downstream_write_context(state.identifier());
        // Stamp of the latest initial sync start
        let mut initial_sync_start = 0u64;

        loop {
            let first = tokio::select! {
                biased;
                _ = wait_true(&mut canceled) => break,
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            // resume() resyncs, so nothing dropped here is lost
            if state.is_stopped() {
                let mut dropped = 1;
                while tasks.try_recv().is_ok() {
                    dropped += 1;
                }
                state.up_tasks.start(dropped);
                state.up_tasks.finish();
                debug!(tasks = dropped, "Dropping upstream tasks while stopped");
                continue;
            }

            state.events.active_up.set(true);
            if let (Some(delay), UpTask::Changes(_)) = (state.input.wait_before_persist, &first.task) {
                tokio::select! {
                    biased;
                    _ = wait_true(&mut canceled) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let mut batch = vec![first];
            while let Ok(task) = tasks.try_recv() {
                batch.push(task);
            }

            state.up_tasks.start(batch.len());
            let started = Instant::now();

            process_tasks(&state, batch, &downstream_context, &mut initial_sync_start).await;

            metrics::record_cycle(state.identifier(), Direction::Up, started.elapsed());
            state.up_tasks.finish();
            if state.up_tasks.is_idle() {
                state.events.active_up.set(false);
            }
        }

        state.events.active_up.set(false);
        info!("Upstream stopped");
    }
    .instrument(span)
    .await
}

async fn process_tasks(
    state: &ProtocolState,
    batch: Vec<Stamped<UpTask>>,
    downstream_context: &str,
    initial_sync_start: &mut u64,
) {
    ReplicationStats::bump(&state.stats.up_process_tasks);
    if state.is_stopped() {
        debug!(tasks = batch.len(), "Dropping upstream tasks while stopped");
        return;
    }

    let mut ids = OrderedIds::default();
    let mut checkpoint: Option<Checkpoint> = None;
    let mut resync = false;

    for Stamped { seq, task } in batch {
        if seq < *initial_sync_start {
            continue;
        }
        match task {
            UpTask::Resync => resync = true,
            UpTask::Changes(bulk) => {
                checkpoint = state.checkpoints.newest(Direction::Up, checkpoint, Some(bulk.checkpoint.clone()));
                if bulk.context == downstream_context {
                    continue;
                }
                for event in &bulk.events {
                    ids.push(&event.document_id);
                }
            }
        }
    }

    // Everything drained here is older than the iteration about to start
    let result = if resync {
        initial_sync(state, initial_sync_start).await
    } else if ids.is_empty() && checkpoint.is_none() {
        Ok(())
    } else {
        persist_to_master(state, ids.into_vec(), checkpoint).await.map(|_| ())
    };
    if let Err(e) = result {
        state.report_error(Direction::Up, e);
    }
}

/// Push everything changed in the fork since the stored checkpoint.
async fn initial_sync(state: &ProtocolState, initial_sync_start: &mut u64) -> Result<()> {
    ReplicationStats::bump(&state.stats.up_initial_sync);
    metrics::record_resync(state.identifier(), Direction::Up);

    loop {
        *initial_sync_start = state.stamp();
        let mut had_conflict_writes = false;

        loop {
            if state.is_stopped() {
                debug!("Initial sync stopped at batch boundary");
                return Ok(());
            }
            let checkpoint = state.checkpoints.get_last_checkpoint(Direction::Up).await?;
            let changed = state
                .input
                .fork
                .get_changed_documents_since(state.input.push_batch_size, checkpoint.as_ref())
                .await?;
            if changed.documents.is_empty() {
                break;
            }
            let ids = changed.documents.into_iter().map(|d| d.id).collect();
            had_conflict_writes |= persist_to_master(state, ids, changed.checkpoint).await?;
        }

        if !had_conflict_writes {
            break;
        }
        debug!("Initial sync wrote conflict resolutions, running again");
    }

    if !state.events.first_sync_done_up.get() {
        info!("Upstream first sync done");
    }
    state.events.first_sync_done_up.set(true);
    Ok(())
}

/// A row about to be pushed, with what is needed to commit it.
struct PendingRow {
    row: WriteToMasterRow,
    fork_doc: StoredDocument,
    meta_document: Option<StoredDocument>,
}

/// Push the current fork state of `ids`. Returns true if conflict
/// resolutions were written into the fork.
async fn persist_to_master(state: &ProtocolState, ids: Vec<String>, checkpoint: Option<Checkpoint>) -> Result<bool> {
    ReplicationStats::bump(&state.stats.up_persist_to_master);
    let identifier = state.identifier();

    let fork_docs = state.input.fork.find_documents_by_id(&ids, true).await?;
    let mut assumed = get_assumed_master_state(state.input.meta.as_ref(), identifier, &ids).await?;

    let mut pending = Vec::new();
    let mut skipped = 0;
    for id in &ids {
        let Some(fork_doc) = fork_docs.get(id) else {
            continue;
        };
        let assumed_state = assumed.remove(id);
        if already_on_master(state, fork_doc, assumed_state.as_ref()) {
            skipped += 1;
            continue;
        }
        let (assumed_master_state, meta_document) = match assumed_state {
            Some(a) => (Some(a.doc_data), Some(a.meta_document)),
            None => (None, None),
        };
        pending.push(PendingRow {
            row: WriteToMasterRow {
                assumed_master_state,
                new_document_state: fork_doc.to_state(state.input.keep_meta),
            },
            fork_doc: fork_doc.clone(),
            meta_document,
        });
    }
    metrics::record_documents_skipped(identifier, skipped);

    let mut had_conflict_writes = false;
    let mut pushed = 0;
    for chunk in pending.chunks(state.input.push_batch_size.max(1)) {
        if state.is_canceled() {
            return Err(ReplicationError::Canceled);
        }
        let rows: Vec<WriteToMasterRow> = chunk.iter().map(|p| p.row.clone()).collect();
        let conflicts = state.input.handler.master_write(rows).await?;
        if state.is_canceled() {
            return Err(ReplicationError::Canceled);
        }

        let mut conflicts_by_id: HashMap<String, DocumentState> = HashMap::with_capacity(conflicts.len());
        for conflict in conflicts {
            conflicts_by_id.insert(conflict.id.clone(), conflict);
        }

        let mut meta_rows = Vec::new();
        let mut accepted = Vec::new();
        for p in chunk {
            if conflicts_by_id.contains_key(&p.fork_doc.id) {
                continue;
            }
            meta_rows.push(assumed_master_write_row(
                identifier,
                &p.row.new_document_state,
                p.meta_document.as_ref(),
                None,
                Some(p.fork_doc.rev.to_string()),
            )?);
            accepted.push(p.row.clone());
        }
        if !meta_rows.is_empty() {
            write_meta_rows(state.input.meta.as_ref(), meta_rows, META_WRITE_CONTEXT).await?;
        }
        pushed += accepted.len();
        for row in accepted {
            state.events.processed_up.emit(row);
        }

        if !conflicts_by_id.is_empty() {
            ReplicationStats::bump(&state.stats.up_persist_to_master_had_conflicts);
            metrics::record_conflicts(identifier, conflicts_by_id.len());
            had_conflict_writes |= resolve_conflicts(state, chunk, conflicts_by_id).await?;
        }
    }
    metrics::record_documents_pushed(identifier, pushed);

    debug!(
        documents = ids.len(),
        pushed,
        skipped,
        had_conflict_writes,
        "Persisted fork changes"
    );

    if let Some(checkpoint) = checkpoint {
        state.checkpoints.set_checkpoint(Direction::Up, checkpoint);
    }
    Ok(had_conflict_writes)
}

/// Master already holds this fork state.
fn already_on_master(state: &ProtocolState, fork_doc: &StoredDocument, assumed: Option<&AssumedMasterState>) -> bool {
    let Some(assumed) = assumed else {
        return false;
    };
    if assumed.fork_revision.as_deref() == Some(fork_doc.rev.to_string().as_str()) {
        return true;
    }
    state
        .input
        .conflict_handler
        .is_equal(&assumed.doc_data, &fork_doc.to_state(false))
}

/// Resolve refused rows and write the resolutions into the fork.
async fn resolve_conflicts(
    state: &ProtocolState,
    chunk: &[PendingRow],
    mut conflicts: HashMap<String, DocumentState>,
) -> Result<bool> {
    let identifier = state.identifier();
    let mut fork_writes = Vec::new();
    let mut equal_meta_rows = Vec::new();
    let mut resolved_by_id: HashMap<String, (DocumentState, Option<StoredDocument>)> = HashMap::new();

    for p in chunk {
        let id = &p.fork_doc.id;
        let Some(real_master_state) = conflicts.remove(id) else {
            continue;
        };
        let input = ConflictInput {
            new_document_state: p.row.new_document_state.clone(),
            assumed_master_state: p.row.assumed_master_state.clone(),
            real_master_state: real_master_state.clone(),
        };
        match state.input.conflict_handler.resolve(&input) {
            ConflictOutput::Equal => {
                debug!(id = %id, "Conflict with equal content");
                equal_meta_rows.push(assumed_master_write_row(
                    identifier,
                    &real_master_state,
                    p.meta_document.as_ref(),
                    None,
                    Some(p.fork_doc.rev.to_string()),
                )?);
            }
            ConflictOutput::Resolved(output) => {
                state.events.resolved_conflicts.emit(ResolvedConflict {
                    input,
                    output: output.clone(),
                });
                let document = resolved_fork_document(&output, Some(&p.fork_doc));
                fork_writes.push(BulkWriteRow::update(p.fork_doc.clone(), document));
                resolved_by_id.insert(id.clone(), (real_master_state, p.meta_document.clone()));
            }
        }
    }
    for id in conflicts.keys() {
        warn!(id = %id, "Master returned a conflict for a document that was not pushed");
    }

    if !equal_meta_rows.is_empty() {
        write_meta_rows(state.input.meta.as_ref(), equal_meta_rows, META_WRITE_CONTEXT).await?;
    }
    if fork_writes.is_empty() {
        return Ok(false);
    }

    let response = state.input.fork.bulk_write(fork_writes, UP_CONFLICT_WRITE_CONTEXT).await?;
    for error in &response.error {
        if error.is_conflict() {
            // A newer fork write exists and will be pushed on its own
            debug!(id = %error.document_id, "Fork changed before conflict resolution was written");
            continue;
        }
        return Err(ReplicationError::Internal(format!(
            "conflict write for {} failed with status {}",
            error.document_id, error.status
        )));
    }

    let mut meta_rows = Vec::with_capacity(response.success.len());
    for written in &response.success {
        let Some((real_master_state, meta_document)) = resolved_by_id.get(&written.id) else {
            continue;
        };
        meta_rows.push(assumed_master_write_row(
            identifier,
            real_master_state,
            meta_document.as_ref(),
            Some(written.rev.to_string()),
            None,
        )?);
    }
    if !meta_rows.is_empty() {
        write_meta_rows(state.input.meta.as_ref(), meta_rows, META_WRITE_CONTEXT).await?;
    }

    let written = response.success.len();
    ReplicationStats::bump(&state.stats.up_persist_to_master_conflict_writes);
    metrics::record_conflict_writes(identifier, written);
    Ok(written > 0)
}

/// Document ids in first-seen order, without duplicates.
#[derive(Default)]
struct OrderedIds {
    seen: HashSet<String>,
    order: Vec<String>,
}

impl OrderedIds {
    fn push(&mut self, id: &str) {
        if self.seen.insert(id.to_string()) {
            self.order.push(id.to_string());
        }
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn into_vec(self) -> Vec<String> {
        self.order
    }
}
