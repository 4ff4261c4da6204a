// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Protocol bookkeeping: statistics, event channels and task tracking.

use crate::checkpoint::Direction;
use crate::conflict::ResolvedConflict;
use crate::error::ReplicationError;
use crate::events::{EventChannel, StateChannel};
use crate::handler::{DocumentsWithCheckpoint, WriteToMasterRow};
use crate::storage::ChangeEventBulk;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Internal counters of one protocol run.
///
/// Cheap to bump from the engines; read them through [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct ReplicationStats {
    pub down_add_new_task: AtomicU64,
    pub down_process_changes: AtomicU64,
    pub down_resync_once: AtomicU64,
    pub down_master_change_stream_emit: AtomicU64,
    pub down_persist_from_master: AtomicU64,

    pub up_fork_change_stream_emit: AtomicU64,
    pub up_persist_to_master: AtomicU64,
    pub up_persist_to_master_conflict_writes: AtomicU64,
    pub up_persist_to_master_had_conflicts: AtomicU64,
    pub up_process_tasks: AtomicU64,
    pub up_initial_sync: AtomicU64,
}

/// Point-in-time copy of [`ReplicationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub down_add_new_task: u64,
    pub down_process_changes: u64,
    pub down_resync_once: u64,
    pub down_master_change_stream_emit: u64,
    pub down_persist_from_master: u64,
    pub up_fork_change_stream_emit: u64,
    pub up_persist_to_master: u64,
    pub up_persist_to_master_conflict_writes: u64,
    pub up_persist_to_master_had_conflicts: u64,
    pub up_process_tasks: u64,
    pub up_initial_sync: u64,
}

impl ReplicationStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            down_add_new_task: get(&self.down_add_new_task),
            down_process_changes: get(&self.down_process_changes),
            down_resync_once: get(&self.down_resync_once),
            down_master_change_stream_emit: get(&self.down_master_change_stream_emit),
            down_persist_from_master: get(&self.down_persist_from_master),
            up_fork_change_stream_emit: get(&self.up_fork_change_stream_emit),
            up_persist_to_master: get(&self.up_persist_to_master),
            up_persist_to_master_conflict_writes: get(&self.up_persist_to_master_conflict_writes),
            up_persist_to_master_had_conflicts: get(&self.up_persist_to_master_had_conflicts),
            up_process_tasks: get(&self.up_process_tasks),
            up_initial_sync: get(&self.up_initial_sync),
        }
    }
}

/// An error raised by a background cycle.
#[derive(Debug, Clone)]
pub struct ReplicationErrorEvent {
    pub direction: Direction,
    pub error: Arc<ReplicationError>,
}

/// Everything the protocol publishes.
#[derive(Debug)]
pub struct ProtocolEvents {
    pub canceled: StateChannel<bool>,
    pub paused: StateChannel<bool>,
    pub active_up: StateChannel<bool>,
    pub active_down: StateChannel<bool>,
    pub first_sync_done_up: StateChannel<bool>,
    pub first_sync_done_down: StateChannel<bool>,
    /// Rows master accepted.
    pub processed_up: EventChannel<WriteToMasterRow>,
    /// Master batches applied to the fork.
    pub processed_down: EventChannel<DocumentsWithCheckpoint>,
    pub resolved_conflicts: EventChannel<ResolvedConflict>,
    pub error: EventChannel<ReplicationErrorEvent>,
}

impl ProtocolEvents {
    pub fn new() -> Self {
        Self {
            canceled: StateChannel::new(false),
            paused: StateChannel::new(false),
            active_up: StateChannel::new(false),
            active_down: StateChannel::new(false),
            first_sync_done_up: StateChannel::new(false),
            first_sync_done_down: StateChannel::new(false),
            processed_up: EventChannel::new(),
            processed_down: EventChannel::new(),
            resolved_conflicts: EventChannel::new(),
            error: EventChannel::new(),
        }
    }

    pub fn active(&self, direction: Direction) -> &StateChannel<bool> {
        match direction {
            Direction::Up => &self.active_up,
            Direction::Down => &self.active_down,
        }
    }

    pub fn first_sync_done(&self, direction: Direction) -> &StateChannel<bool> {
        match direction {
            Direction::Up => &self.first_sync_done_up,
            Direction::Down => &self.first_sync_done_down,
        }
    }

    /// Close every channel. State channels keep their last value.
    pub fn complete(&self) {
        self.active_up.set(false);
        self.active_down.set(false);
        for state in [
            &self.canceled,
            &self.paused,
            &self.active_up,
            &self.active_down,
            &self.first_sync_done_up,
            &self.first_sync_done_down,
        ] {
            state.complete();
        }
        self.processed_up.complete();
        self.processed_down.complete();
        self.resolved_conflicts.complete();
        self.error.complete();
    }
}

impl Default for ProtocolEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Queued and running work of one engine.
///
/// `start` marks the worker busy before it takes tasks off the queue, so a
/// reader that checks `queued` first and `running` second never sees an
/// idle engine while a task changes hands.
#[derive(Debug, Default)]
pub struct TaskTracker {
    queued: AtomicUsize,
    running: AtomicBool,
}

impl TaskTracker {
    pub fn enqueued(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn start(&self, taken: usize) {
        self.running.store(true, Ordering::SeqCst);
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(taken)));
    }

    /// Undo an `enqueued` whose task never reached the worker.
    pub fn discard(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_idle(&self) -> bool {
        self.queued.load(Ordering::SeqCst) == 0 && !self.running.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

/// A task stamped with the protocol clock at enqueue time.
#[derive(Debug, Clone)]
pub(crate) struct Stamped<T> {
    pub seq: u64,
    pub task: T,
}

/// Work for the downstream.
#[derive(Debug, Clone)]
pub(crate) enum DownTask {
    Changes(DocumentsWithCheckpoint),
    Resync,
}

/// Work for the upstream.
#[derive(Debug, Clone)]
pub(crate) enum UpTask {
    Changes(Arc<ChangeEventBulk>),
    Resync,
}
