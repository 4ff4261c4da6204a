// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication protocol between a fork and its master.
//!
//! [`replicate_storage_instance`] wires one fork instance, its meta instance
//! and a [`ReplicationHandler`] together and spawns four tasks:
//!
//! ```text
//!  master change stream ──► master forwarder ──► downstream ──► fork
//!                                  │ RESYNC                       │
//!                                  ▼                              ▼
//!  fork change stream ───► fork forwarder ─────► upstream ──► masterWrite
//! ```
//!
//! # Tasks and the Protocol Clock
//!
//! Every task handed to an engine is stamped with a strictly increasing
//! sequence number. The downstream drops tasks stamped before its latest
//! `masterChangesSince` request, the upstream drops tasks stamped before its
//! latest initial sync started: the iteration already covered them.
//!
//! # Pause and Cancel
//!
//! While paused the forwarders drop incoming changes and the engines drop
//! queued tasks; iterations stop at the next batch boundary. [`resume`]
//! queues one RESYNC per direction so nothing missed while paused is lost.
//! Cancel is terminal: engines stop, checkpoint writes are drained and every
//! event channel is completed.
//!
//! The protocol never retries a handler call. A failing cycle is reported
//! on the `error` channel and abandoned; the next RESYNC or change picks the
//! work up again.
//!
//! [`resume`]: ProtocolState::resume

mod downstream;
mod types;
mod upstream;

pub use types::{ProtocolEvents, ReplicationErrorEvent, ReplicationStats, StatsSnapshot, TaskTracker};

use crate::checkpoint::{Checkpoint, CheckpointStore, Direction};
use crate::conflict::{ConflictHandler, DefaultConflictHandler};
use crate::error::{ReplicationError, Result};
use crate::handler::{PullStreamItem, ReplicationHandler};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::storage::{ChangeEventBulk, StorageError, StorageInstance};
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::{DownTask, Stamped, UpTask};

/// Write context of conflict resolutions written into the fork.
pub const UP_CONFLICT_WRITE_CONTEXT: &str = "replication-up-write-conflict";

/// Default number of documents per pull/push batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// How often `await_in_sync` re-evaluates the idle predicate.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Consecutive idle polls needed before the replication counts as in sync.
const IDLE_POLLS_REQUIRED: u32 = 2;

/// How long cancel waits for an engine to finish its cycle.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Write context of documents the downstream writes into the fork.
pub fn downstream_write_context(identifier: &str) -> String {
    format!("replication-downstream-{}", identifier)
}

/// Everything a protocol run needs.
pub struct ProtocolInput {
    /// Scopes meta rows and checkpoints.
    pub identifier: String,
    pub fork: Arc<dyn StorageInstance>,
    /// Exclusively owned by this replication.
    pub meta: Arc<dyn StorageInstance>,
    pub handler: Arc<dyn ReplicationHandler>,
    pub conflict_handler: Arc<dyn ConflictHandler>,
    pub pull_batch_size: usize,
    pub push_batch_size: usize,
    /// Push `_rev`/`_meta` and keep the `_rev` of pulled documents.
    pub keep_meta: bool,
    /// Delay before live fork changes are pushed.
    pub wait_before_persist: Option<Duration>,
    /// Used when no upstream checkpoint is stored yet.
    pub initial_checkpoint_up: Option<Checkpoint>,
    /// Used when no downstream checkpoint is stored yet.
    pub initial_checkpoint_down: Option<Checkpoint>,
    /// Backoff for failed checkpoint writes.
    pub checkpoint_retry: RetryConfig,
}

impl ProtocolInput {
    pub fn new(
        identifier: impl Into<String>,
        fork: Arc<dyn StorageInstance>,
        meta: Arc<dyn StorageInstance>,
        handler: Arc<dyn ReplicationHandler>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            fork,
            meta,
            handler,
            conflict_handler: Arc::new(DefaultConflictHandler),
            pull_batch_size: DEFAULT_BATCH_SIZE,
            push_batch_size: DEFAULT_BATCH_SIZE,
            keep_meta: false,
            wait_before_persist: None,
            initial_checkpoint_up: None,
            initial_checkpoint_down: None,
            checkpoint_retry: RetryConfig::daemon(),
        }
    }
}

/// A running protocol.
pub struct ProtocolState {
    pub(crate) input: ProtocolInput,
    pub(crate) checkpoints: CheckpointStore,
    pub events: ProtocolEvents,
    pub stats: ReplicationStats,
    pub(crate) up_tasks: TaskTracker,
    pub(crate) down_tasks: TaskTracker,
    clock: AtomicU64,
    canceling: AtomicBool,
    down_sender: Mutex<Option<mpsc::UnboundedSender<Stamped<DownTask>>>>,
    up_sender: Mutex<Option<mpsc::UnboundedSender<Stamped<UpTask>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Start replicating `input.fork` with `input.handler` as master.
///
/// Must be called inside a tokio runtime. The fork change stream is
/// subscribed before anything else, so no fork write can fall between the
/// initial sync and the live stream.
pub fn replicate_storage_instance(input: ProtocolInput) -> Arc<ProtocolState> {
    let fork_changes = input.fork.change_stream();
    let master_changes = input.handler.master_change_stream();
    let (down_tx, down_rx) = mpsc::unbounded_channel();
    let (up_tx, up_rx) = mpsc::unbounded_channel();

    let checkpoints = CheckpointStore::new(
        Arc::clone(&input.meta),
        input.identifier.clone(),
        input.checkpoint_retry.clone(),
    );
    let fork = Arc::clone(&input.fork);
    checkpoints.set_order(
        Direction::Up,
        Arc::new(move |a: &Checkpoint, b: &Checkpoint| fork.compare_checkpoints(a, b)),
    );
    let handler = Arc::clone(&input.handler);
    checkpoints.set_order(
        Direction::Down,
        Arc::new(move |a: &Checkpoint, b: &Checkpoint| handler.compare_checkpoints(a, b)),
    );

    info!(
        identifier = %input.identifier,
        fork = %input.fork.name(),
        pull_batch_size = input.pull_batch_size,
        push_batch_size = input.push_batch_size,
        "Starting replication protocol"
    );

    let state = Arc::new(ProtocolState {
        input,
        checkpoints,
        events: ProtocolEvents::new(),
        stats: ReplicationStats::default(),
        up_tasks: TaskTracker::default(),
        down_tasks: TaskTracker::default(),
        clock: AtomicU64::new(0),
        canceling: AtomicBool::new(false),
        down_sender: Mutex::new(Some(down_tx)),
        up_sender: Mutex::new(Some(up_tx)),
        handles: Mutex::new(Vec::new()),
    });

    let weak = Arc::downgrade(&state);
    state.checkpoints.on_write_failure(Arc::new(move |direction: Direction, error: StorageError| {
        if let Some(state) = weak.upgrade() {
            state.report_error(direction, ReplicationError::from(error));
        }
    }));

    // Both engines start with a full checkpoint iteration
    state.enqueue_down(DownTask::Resync);
    state.enqueue_up(UpTask::Resync);

    let handles = vec![
        tokio::spawn(downstream::run(Arc::clone(&state), down_rx)),
        tokio::spawn(upstream::run(Arc::clone(&state), up_rx)),
        tokio::spawn(forward_master_changes(Arc::clone(&state), master_changes)),
        tokio::spawn(forward_fork_changes(Arc::clone(&state), fork_changes)),
    ];
    if let Ok(mut guard) = state.handles.lock() {
        guard.extend(handles);
    }

    state
}

impl ProtocolState {
    pub fn identifier(&self) -> &str {
        &self.input.identifier
    }

    pub fn fork(&self) -> &Arc<dyn StorageInstance> {
        &self.input.fork
    }

    pub fn meta(&self) -> &Arc<dyn StorageInstance> {
        &self.input.meta
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn is_paused(&self) -> bool {
        self.events.paused.get()
    }

    pub fn is_canceled(&self) -> bool {
        self.events.canceled.get()
    }

    /// Paused or canceled: no new work may start.
    pub(crate) fn is_stopped(&self) -> bool {
        self.is_paused() || self.is_canceled()
    }

    /// Stop scheduling new work. In-flight handler calls run to completion.
    pub fn pause(&self) {
        if self.is_canceled() {
            return;
        }
        info!(identifier = %self.identifier(), "Pausing replication protocol");
        self.events.paused.set(true);
    }

    /// Undo [`pause`](Self::pause) and catch up with one RESYNC per direction.
    pub fn resume(&self) {
        if self.is_canceled() || !self.is_paused() {
            return;
        }
        info!(identifier = %self.identifier(), "Resuming replication protocol");
        self.events.paused.set(false);
        self.resync();
    }

    /// Queue a checkpoint iteration in both directions.
    pub fn resync(&self) {
        self.enqueue_down(DownTask::Resync);
        self.enqueue_up(UpTask::Resync);
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Take a stamp from the protocol clock.
    pub(crate) fn stamp(&self) -> u64 {
        self.tick()
    }

    fn enqueue_down(&self, task: DownTask) {
        let seq = self.tick();
        let Ok(guard) = self.down_sender.lock() else {
            return;
        };
        let Some(sender) = guard.as_ref() else {
            return;
        };
        self.down_tasks.enqueued();
        if sender.send(Stamped { seq, task }).is_err() {
            self.down_tasks.discard();
            return;
        }
        ReplicationStats::bump(&self.stats.down_add_new_task);
    }

    fn enqueue_up(&self, task: UpTask) {
        let seq = self.tick();
        let Ok(guard) = self.up_sender.lock() else {
            return;
        };
        let Some(sender) = guard.as_ref() else {
            return;
        };
        self.up_tasks.enqueued();
        if sender.send(Stamped { seq, task }).is_err() {
            self.up_tasks.discard();
        }
    }

    /// Store the configured initial checkpoint if none is stored yet.
    pub(crate) async fn apply_initial_checkpoint(&self, direction: Direction) -> Result<()> {
        let initial = match direction {
            Direction::Up => self.input.initial_checkpoint_up.clone(),
            Direction::Down => self.input.initial_checkpoint_down.clone(),
        };
        let Some(initial) = initial else {
            return Ok(());
        };
        if self.checkpoints.get_last_checkpoint(direction).await?.is_none() {
            debug!(direction = %direction, checkpoint = %initial, "Using initial checkpoint");
            self.checkpoints.set_checkpoint(direction, initial);
        }
        Ok(())
    }

    /// Publish the failure of a background cycle.
    pub(crate) fn report_error(&self, direction: Direction, error: ReplicationError) {
        if error.is_interruption() {
            debug!(direction = %direction, "Cycle interrupted");
            return;
        }
        if matches!(error, ReplicationError::Storage(_)) {
            metrics::record_storage_error(self.identifier(), direction);
        }
        error!(direction = %direction, error = %error, "Replication cycle failed");
        self.events.error.emit(ReplicationErrorEvent {
            direction,
            error: Arc::new(error),
        });
    }

    /// Resolves once both directions finished their first full pass.
    pub async fn await_first_in_sync(&self) -> Result<()> {
        for direction in [Direction::Up, Direction::Down] {
            let mut done = self.events.first_sync_done(direction).subscribe();
            let mut canceled = self.events.canceled.subscribe();
            tokio::select! {
                biased;
                reached = wait_true(&mut done) => {
                    if !reached {
                        return Err(ReplicationError::Canceled);
                    }
                }
                _ = wait_true(&mut canceled) => return Err(ReplicationError::Canceled),
            }
        }
        Ok(())
    }

    /// Resolves once nothing is left to replicate in either direction.
    pub async fn await_in_sync(&self) -> Result<()> {
        self.await_first_in_sync().await?;
        let mut idle_polls = 0;
        loop {
            if self.is_canceled() {
                return Err(ReplicationError::Canceled);
            }
            if self.is_idle().await? {
                idle_polls += 1;
                if idle_polls >= IDLE_POLLS_REQUIRED {
                    return Ok(());
                }
            } else {
                idle_polls = 0;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// No queued or running task, no pending checkpoint write and no fork
    /// change after the upstream checkpoint.
    pub async fn is_idle(&self) -> Result<bool> {
        if !self.engines_idle() || !self.checkpoints.is_drained() {
            return Ok(false);
        }
        let checkpoint = self.checkpoints.get_last_checkpoint(Direction::Up).await?;
        let changed = self
            .input
            .fork
            .get_changed_documents_since(1, checkpoint.as_ref())
            .await?;
        Ok(changed.documents.is_empty() && self.engines_idle())
    }

    fn engines_idle(&self) -> bool {
        self.up_tasks.is_idle() && self.down_tasks.is_idle()
    }

    /// Stop both engines, flush checkpoints and complete all event channels.
    ///
    /// Idempotent. Does not close the fork or the meta instance.
    pub async fn cancel(&self) {
        if self.canceling.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(identifier = %self.identifier(), "Canceling replication protocol");
        self.events.canceled.set(true);

        if let Ok(mut guard) = self.down_sender.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.up_sender.lock() {
            guard.take();
        }

        let handles: Vec<_> = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during cancel"),
                Err(_) => {
                    warn!(task = i + 1, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        if tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, self.checkpoints.drain())
            .await
            .is_err()
        {
            warn!("Checkpoint queue did not drain before cancel");
        }
        self.checkpoints.cancel();
        self.events.complete();
        info!(identifier = %self.identifier(), "Replication protocol canceled");
    }
}

/// Wait until `rx` holds `true`. Returns `false` if it closed while false.
pub(crate) async fn wait_true(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|value| *value).await.is_ok()
}

async fn forward_master_changes(state: Arc<ProtocolState>, mut stream: BoxStream<'static, PullStreamItem>) {
    let mut canceled = state.events.canceled.subscribe();
    loop {
        let item = tokio::select! {
            biased;
            _ = wait_true(&mut canceled) => break,
            item = stream.next() => item,
        };
        let Some(item) = item else {
            debug!(identifier = %state.identifier(), "Master change stream ended");
            break;
        };
        ReplicationStats::bump(&state.stats.down_master_change_stream_emit);
        match item {
            // resume() resyncs anyway
            PullStreamItem::Resync => {
                if !state.is_paused() {
                    state.resync();
                }
            }
            PullStreamItem::Batch(batch) => {
                if state.is_paused() {
                    continue;
                }
                state.enqueue_down(DownTask::Changes(batch));
            }
        }
    }
}

async fn forward_fork_changes(state: Arc<ProtocolState>, mut changes: broadcast::Receiver<Arc<ChangeEventBulk>>) {
    let mut canceled = state.events.canceled.subscribe();
    loop {
        let next = tokio::select! {
            biased;
            _ = wait_true(&mut canceled) => break,
            next = changes.recv() => next,
        };
        match next {
            Ok(bulk) => {
                ReplicationStats::bump(&state.stats.up_fork_change_stream_emit);
                if state.is_paused() {
                    continue;
                }
                state.enqueue_up(UpTask::Changes(bulk));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(identifier = %state.identifier(), skipped, "Fork change stream lagged, requesting resync");
                if !state.is_paused() {
                    state.enqueue_up(UpTask::Resync);
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(identifier = %state.identifier(), "Fork change stream closed");
                break;
            }
        }
    }
}
