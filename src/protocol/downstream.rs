// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Downstream: master → fork.
//!
//! One worker task drains the downstream queue. A drained run is processed
//! in order:
//!
//! - `Changes` batches are concatenated and their checkpoints stacked
//! - a `Resync` first flushes what was collected, then iterates
//!   `masterChangesSince` until master returns an empty batch
//!
//! Master documents overwrite the fork unconditionally. Documents whose
//! content already matches the fork are not rewritten, only their assumed
//! master state is recorded.

use super::types::{DownTask, ReplicationStats, Stamped};
use super::{downstream_write_context, wait_true, ProtocolState};
use crate::checkpoint::{Checkpoint, Direction};
use crate::document::{DocumentState, StoredDocument};
use crate::error::{ReplicationError, Result};
use crate::handler::DocumentsWithCheckpoint;
use crate::meta::{assumed_master_write_row, get_assumed_master_state, write_meta_rows, META_WRITE_CONTEXT};
use crate::metrics;
use crate::storage::BulkWriteRow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, Instrument};

pub(super) async fn run(state: Arc<ProtocolState>, mut tasks: mpsc::UnboundedReceiver<Stamped<DownTask>>) {
    let span = info_span!("downstream", identifier = %state.identifier());

    async move {
        info!("Starting downstream");
        if let Err(e) = state.apply_initial_checkpoint(Direction::Down).await {
            state.report_error(Direction::Down, e);
        }

        let mut canceled = state.events.canceled.subscribe();
        // Stamp of the latest masterChangesSince request
        let mut last_requested = 0u64;

        loop {
            let first = tokio::select! {
                biased;
                _ = wait_true(&mut canceled) => break,
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            let mut batch = vec![first];
            while let Ok(task) = tasks.try_recv() {
                batch.push(task);
            }

            state.down_tasks.start(batch.len());
            if state.is_stopped() {
                state.down_tasks.finish();
                debug!(tasks = batch.len(), "Dropping downstream tasks while stopped");
                continue;
            }
            state.events.active_down.set(true);
            let started = Instant::now();

            process_tasks(&state, batch, &mut last_requested).await;

            metrics::record_cycle(state.identifier(), Direction::Down, started.elapsed());
            state.down_tasks.finish();
            if state.down_tasks.is_idle() {
                state.events.active_down.set(false);
            }
        }

        state.events.active_down.set(false);
        info!("Downstream stopped");
    }
    .instrument(span)
    .await
}

async fn process_tasks(state: &ProtocolState, batch: Vec<Stamped<DownTask>>, last_requested: &mut u64) {
    let mut documents: Vec<DocumentState> = Vec::new();
    let mut checkpoint: Option<Checkpoint> = None;

    for Stamped { seq, task } in batch {
        if state.is_stopped() {
            debug!("Dropping downstream tasks while stopped");
            return;
        }
        if seq < *last_requested {
            continue;
        }
        match task {
            DownTask::Changes(changes) => {
                ReplicationStats::bump(&state.stats.down_process_changes);
                documents.extend(changes.documents);
                checkpoint = state.checkpoints.newest(Direction::Down, checkpoint, changes.checkpoint);
            }
            DownTask::Resync => {
                if let Err(e) = flush(state, &mut documents, &mut checkpoint).await {
                    state.report_error(Direction::Down, e);
                    return;
                }
                if let Err(e) = resync(state, last_requested).await {
                    state.report_error(Direction::Down, e);
                    return;
                }
            }
        }
    }

    if let Err(e) = flush(state, &mut documents, &mut checkpoint).await {
        state.report_error(Direction::Down, e);
    }
}

async fn flush(state: &ProtocolState, documents: &mut Vec<DocumentState>, checkpoint: &mut Option<Checkpoint>) -> Result<()> {
    if documents.is_empty() && checkpoint.is_none() {
        return Ok(());
    }
    let documents = std::mem::take(documents);
    let checkpoint = checkpoint.take();
    persist_from_master(state, documents, checkpoint).await
}

/// Iterate master from the stored checkpoint until it has nothing more.
async fn resync(state: &ProtocolState, last_requested: &mut u64) -> Result<()> {
    ReplicationStats::bump(&state.stats.down_resync_once);
    metrics::record_resync(state.identifier(), Direction::Down);

    loop {
        if state.is_stopped() {
            debug!("Resync stopped at batch boundary");
            return Ok(());
        }
        let checkpoint = state.checkpoints.get_last_checkpoint(Direction::Down).await?;
        *last_requested = state.stamp();

        let page = state
            .input
            .handler
            .master_changes_since(checkpoint.clone(), state.input.pull_batch_size)
            .await?;
        if state.is_canceled() {
            return Err(ReplicationError::Canceled);
        }
        if page.documents.is_empty() {
            break;
        }

        let next = Checkpoint::stack_all([checkpoint, page.checkpoint]);
        persist_from_master(state, page.documents, next).await?;
    }

    if !state.events.first_sync_done_down.get() {
        info!("Downstream first sync done");
    }
    state.events.first_sync_done_down.set(true);
    Ok(())
}

/// Write master documents into the fork, record their assumed master
/// state, then queue the checkpoint.
async fn persist_from_master(
    state: &ProtocolState,
    documents: Vec<DocumentState>,
    checkpoint: Option<Checkpoint>,
) -> Result<()> {
    ReplicationStats::bump(&state.stats.down_persist_from_master);
    let identifier = state.identifier();

    // Latest state per id wins
    let mut order = Vec::with_capacity(documents.len());
    let mut by_id: HashMap<String, DocumentState> = HashMap::with_capacity(documents.len());
    for doc in documents {
        if !by_id.contains_key(&doc.id) {
            order.push(doc.id.clone());
        }
        by_id.insert(doc.id.clone(), doc);
    }
    metrics::record_documents_pulled(identifier, order.len());

    let fork_docs = state.input.fork.find_documents_by_id(&order, true).await?;
    let assumed = get_assumed_master_state(state.input.meta.as_ref(), identifier, &order).await?;

    let mut writes = Vec::new();
    let mut meta_rows = Vec::new();
    let mut unchanged = 0;

    for id in &order {
        let Some(master_state) = by_id.get(id) else {
            continue;
        };
        let fork_state = fork_docs.get(id);
        let assumed_state = assumed.get(id);

        if let Some(fork_doc) = fork_state {
            if fork_doc.content_eq(master_state) {
                unchanged += 1;
                let fork_rev = fork_doc.rev.to_string();
                let recorded = assumed_state
                    .map(|a| a.doc_data.content_eq(master_state) && a.fork_revision.as_deref() == Some(fork_rev.as_str()))
                    .unwrap_or(false);
                if !recorded {
                    meta_rows.push(assumed_master_write_row(
                        identifier,
                        master_state,
                        assumed_state.map(|a| &a.meta_document),
                        None,
                        Some(fork_rev),
                    )?);
                }
                continue;
            }
        }

        let document = match (&master_state.rev, state.input.keep_meta) {
            (Some(rev), true) => StoredDocument::with_revision(master_state, rev.clone()),
            _ => StoredDocument::write(master_state, fork_state.map(|f| &f.rev)),
        };
        writes.push(BulkWriteRow {
            previous: fork_state.cloned(),
            document,
        });
    }

    let mut applied = Vec::new();
    if !writes.is_empty() {
        let response = state
            .input
            .fork
            .bulk_write(writes, &downstream_write_context(identifier))
            .await?;

        for error in response.error {
            if error.is_conflict() {
                // A local write won the race; the upstream pushes it
                debug!(id = %error.document_id, "Fork changed during downstream write");
                continue;
            }
            return Err(ReplicationError::Internal(format!(
                "fork write for {} failed with status {}",
                error.document_id, error.status
            )));
        }

        for written in response.success {
            let Some(master_state) = by_id.get(&written.id) else {
                continue;
            };
            meta_rows.push(assumed_master_write_row(
                identifier,
                master_state,
                assumed.get(&written.id).map(|a| &a.meta_document),
                None,
                Some(written.rev.to_string()),
            )?);
            applied.push(master_state.clone());
        }
    }

    if !meta_rows.is_empty() {
        write_meta_rows(state.input.meta.as_ref(), meta_rows, META_WRITE_CONTEXT).await?;
    }

    metrics::record_documents_applied(identifier, applied.len());
    metrics::record_documents_unchanged(identifier, unchanged);
    debug!(
        documents = order.len(),
        applied = applied.len(),
        unchanged,
        "Persisted master changes"
    );

    if !applied.is_empty() {
        state.events.processed_down.emit(DocumentsWithCheckpoint {
            documents: applied,
            checkpoint: checkpoint.clone(),
        });
    }

    if let Some(checkpoint) = checkpoint {
        state.checkpoints.set_checkpoint(Direction::Down, checkpoint);
    }
    Ok(())
}
