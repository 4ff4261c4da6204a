// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoints and their persistence.
//!
//! A [`Checkpoint`] is an opaque JSON value produced by whichever side is
//! being read (the fork for `up`, the master for `down`). The protocol
//! never interprets it beyond stacking two of them together, and comparing
//! them when the producing side supplies a [`CheckpointOrder`].
//!
//! # Stacking
//!
//! ```text
//! stack({id: "a", lwt: 1}, {lwt: 5})  =  {id: "a", lwt: 5}
//! stack({...}, "opaque-token")         =  "opaque-token"
//! ```
//!
//! # Queued Writes
//!
//! [`CheckpointStore::set_checkpoint`] returns immediately. The value is
//! cached in memory and a write job is appended to the direction's FIFO
//! queue:
//!
//! ```text
//! set(up, c1) ─► cache[up] = c1 ─► queue[up]: write #1
//! set(up, c2) ─► cache[up] = c2 ─► queue[up]: write #2
//!                                   write #1 sees #2 was issued → skipped
//! ```
//!
//! Each write carries a per-direction sequence number; a job whose sequence
//! is older than the latest issued one is dropped. With an order set for the
//! direction, a value older than the current one is ignored outright and a
//! newer stored row is never overwritten, so the checkpoint only moves
//! forward. Failed writes are retried inside the queue with backoff until
//! the retry budget runs out or the store is canceled.

use crate::document::StoredDocument;
use crate::meta::{meta_document_id, MetaRow, META_WRITE_CONTEXT};
use crate::queue::SerialQueue;
use crate::resilience::RetryConfig;
use crate::storage::{StorageError, StorageInstance, StorageResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, error, warn};

/// Order of two checkpoints of one direction. `None` when they cannot be compared.
pub type CheckpointOrder = Arc<dyn Fn(&Checkpoint, &Checkpoint) -> Option<std::cmp::Ordering> + Send + Sync>;

/// Called when a checkpoint write is abandoned after its last retry.
pub type WriteFailureSink = Arc<dyn Fn(Direction, StorageError) + Send + Sync>;

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Fork → master.
    Up,
    /// Master → fork.
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque replication position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(Value);

impl Checkpoint {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Merge `later` over `self`: object keys of `later` win, anything else replaces.
    pub fn stack(self, later: Checkpoint) -> Checkpoint {
        match (self.0, later.0) {
            (Value::Object(mut base), Value::Object(newer)) => {
                for (key, value) in newer {
                    base.insert(key, value);
                }
                Checkpoint(Value::Object(base))
            }
            (_, newer) => Checkpoint(newer),
        }
    }

    /// Stack a sequence of optional checkpoints, oldest first.
    pub fn stack_all<I>(checkpoints: I) -> Option<Checkpoint>
    where
        I: IntoIterator<Item = Option<Checkpoint>>,
    {
        checkpoints
            .into_iter()
            .flatten()
            .fold(None, |acc: Option<Checkpoint>, next| {
                Some(match acc {
                    Some(base) => base.stack(next),
                    None => next,
                })
            })
    }
}

impl From<Value> for Checkpoint {
    fn from(value: Value) -> Self {
        Checkpoint(value)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-direction state of the store.
struct DirectionState {
    queue: SerialQueue,
    /// Latest value handed to `set_checkpoint`
    current: Mutex<Option<Checkpoint>>,
    /// Sequence of the latest `set_checkpoint`
    issued: AtomicU64,
    /// Sequence of the latest value written to disk
    persisted: AtomicU64,
    /// Stored row, used as `previous` for the next write
    row: tokio::sync::Mutex<Option<StoredDocument>>,
    order: OnceLock<CheckpointOrder>,
}

impl DirectionState {
    fn new(direction: Direction) -> Self {
        Self {
            queue: SerialQueue::new(format!("checkpoint-{}", direction)),
            current: Mutex::new(None),
            issued: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            row: tokio::sync::Mutex::new(None),
            order: OnceLock::new(),
        }
    }

    /// True if `a` is known to sort before `b`.
    fn is_older(&self, a: &Checkpoint, b: &Checkpoint) -> bool {
        self.order
            .get()
            .is_some_and(|order| order(a, b) == Some(std::cmp::Ordering::Less))
    }
}

struct Inner {
    meta: Arc<dyn StorageInstance>,
    identifier: String,
    retry: RetryConfig,
    canceled: AtomicBool,
    on_failure: OnceLock<WriteFailureSink>,
    up: DirectionState,
    down: DirectionState,
}

impl Inner {
    fn direction(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    fn row_id(&self, direction: Direction) -> String {
        meta_document_id(&self.identifier, direction.as_str(), true)
    }

    async fn load_row(&self, direction: Direction) -> StorageResult<Option<StoredDocument>> {
        let id = self.row_id(direction);
        let mut found = self
            .meta
            .find_documents_by_id(std::slice::from_ref(&id), true)
            .await?;
        Ok(found.remove(&id))
    }

    /// Persist `checkpoint` as sequence `seq`, retrying until done or canceled.
    async fn write(&self, direction: Direction, seq: u64, checkpoint: Checkpoint) {
        let state = self.direction(direction);
        let mut attempt = 0;

        loop {
            if state.issued.load(Ordering::SeqCst) > seq || state.persisted.load(Ordering::SeqCst) >= seq {
                debug!(direction = %direction, seq, "Newer checkpoint queued, skipping");
                return;
            }

            match self.try_write(direction, &checkpoint).await {
                Ok(()) => {
                    state.persisted.fetch_max(seq, Ordering::SeqCst);
                    crate::metrics::record_checkpoint_write(&self.identifier, direction, true);
                    return;
                }
                Err(WriteOutcome::Conflict(in_db)) => {
                    // Someone else wrote the row; rebase and go again immediately
                    *state.row.lock().await = in_db;
                    crate::metrics::record_meta_conflict_retry(1);
                }
                Err(WriteOutcome::Failed(e)) => {
                    crate::metrics::record_checkpoint_write(&self.identifier, direction, false);
                    if self.canceled.load(Ordering::SeqCst) {
                        warn!(direction = %direction, error = %e, "Dropping checkpoint write after cancel");
                        return;
                    }
                    attempt += 1;
                    if self.retry.exhausted(attempt) {
                        error!(direction = %direction, error = %e, attempt, seq, "Checkpoint write failed, giving up");
                        *state.row.lock().await = None;
                        if let Some(report) = self.on_failure.get() {
                            report(direction, e);
                        }
                        return;
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        direction = %direction,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Checkpoint write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    // Force a fresh read of the row on the next attempt
                    *state.row.lock().await = None;
                }
            }
        }
    }

    async fn try_write(&self, direction: Direction, checkpoint: &Checkpoint) -> Result<(), WriteOutcome> {
        let state = self.direction(direction);
        let mut row_guard = state.row.lock().await;

        if row_guard.is_none() {
            *row_guard = self.load_row(direction).await.map_err(WriteOutcome::Failed)?;
        }
        let previous = row_guard.clone();

        if let Some(prev) = previous.as_ref() {
            let stored = MetaRow::from_document(prev).map_err(WriteOutcome::Failed)?;
            if let Some(stored) = stored.checkpoint_data.as_ref() {
                if stored == checkpoint || state.is_older(checkpoint, stored) {
                    return Ok(());
                }
            }
        }

        let row = MetaRow::checkpoint(&self.identifier, direction.as_str(), checkpoint.clone())
            .to_write_row(previous.as_ref())
            .map_err(WriteOutcome::Failed)?;
        let response = self
            .meta
            .bulk_write(vec![row], META_WRITE_CONTEXT)
            .await
            .map_err(WriteOutcome::Failed)?;

        if let Some(written) = response.success.into_iter().next() {
            *row_guard = Some(written);
            return Ok(());
        }
        match response.error.into_iter().next() {
            Some(error) if error.is_conflict() => Err(WriteOutcome::Conflict(error.document_in_db)),
            Some(error) => Err(WriteOutcome::Failed(StorageError::Backend(format!(
                "checkpoint write failed with status {}",
                error.status
            )))),
            None => Err(WriteOutcome::Failed(StorageError::Backend(
                "checkpoint write returned no result".to_string(),
            ))),
        }
    }
}

enum WriteOutcome {
    Conflict(Option<StoredDocument>),
    Failed(StorageError),
}

/// Checkpoint persistence for one replication, backed by its meta instance.
#[derive(Clone)]
pub struct CheckpointStore {
    inner: Arc<Inner>,
}

impl CheckpointStore {
    pub fn new(meta: Arc<dyn StorageInstance>, identifier: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                meta,
                identifier: identifier.into(),
                retry,
                canceled: AtomicBool::new(false),
                on_failure: OnceLock::new(),
                up: DirectionState::new(Direction::Up),
                down: DirectionState::new(Direction::Down),
            }),
        }
    }

    /// Compare checkpoints of `direction` with `order` from now on. Only the first call counts.
    pub fn set_order(&self, direction: Direction, order: CheckpointOrder) {
        if self.inner.direction(direction).order.set(order).is_err() {
            debug!(direction = %direction, "Checkpoint order already set");
        }
    }

    /// Report abandoned writes to `sink`. Only the first call counts.
    pub fn on_write_failure(&self, sink: WriteFailureSink) {
        if self.inner.on_failure.set(sink).is_err() {
            debug!("Checkpoint failure sink already set");
        }
    }

    /// Fold `next` into `acc`, unless `next` is known to be older.
    pub fn newest(&self, direction: Direction, acc: Option<Checkpoint>, next: Option<Checkpoint>) -> Option<Checkpoint> {
        match (acc, next) {
            (Some(acc), Some(next)) if self.inner.direction(direction).is_older(&next, &acc) => Some(acc),
            (acc, next) => Checkpoint::stack_all([acc, next]),
        }
    }

    /// Latest checkpoint for `direction`: the newest queued value, else the stored row.
    ///
    /// `None` means nothing was processed yet and a full initial sync is needed.
    pub async fn get_last_checkpoint(&self, direction: Direction) -> StorageResult<Option<Checkpoint>> {
        if let Some(current) = self.current(direction) {
            return Ok(Some(current));
        }

        let state = self.inner.direction(direction);
        let row = self.inner.load_row(direction).await?;
        let checkpoint = match row.as_ref() {
            Some(doc) => MetaRow::from_document(doc)?.checkpoint_data,
            None => None,
        };

        let mut cached_row = state.row.lock().await;
        if cached_row.is_none() {
            *cached_row = row;
        }
        if let Ok(mut current) = state.current.lock() {
            if current.is_none() {
                *current = checkpoint.clone();
            }
        }
        Ok(checkpoint)
    }

    /// Newest checkpoint handed to [`set_checkpoint`](Self::set_checkpoint), if any.
    pub fn current(&self, direction: Direction) -> Option<Checkpoint> {
        self.inner
            .direction(direction)
            .current
            .lock()
            .ok()
            .and_then(|c| c.clone())
    }

    /// Record `checkpoint` and queue its persistence. Never blocks.
    ///
    /// A checkpoint older than the current one is ignored.
    pub fn set_checkpoint(&self, direction: Direction, checkpoint: Checkpoint) {
        let state = self.inner.direction(direction);
        let seq = {
            let mut current = state.current.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = current.as_ref() {
                if state.is_older(&checkpoint, existing) {
                    debug!(direction = %direction, checkpoint = %checkpoint, current = %existing, "Ignoring older checkpoint");
                    return;
                }
            }
            *current = Some(checkpoint.clone());
            state.issued.fetch_add(1, Ordering::SeqCst) + 1
        };

        let inner = Arc::clone(&self.inner);
        let accepted = state.queue.push(async move {
            inner.write(direction, seq, checkpoint).await;
        });
        if !accepted {
            debug!(direction = %direction, seq, "Checkpoint queue closed, write dropped");
        }
    }

    /// Wait until both directions have no queued writes.
    pub async fn drain(&self) {
        self.inner.up.queue.idle().await;
        self.inner.down.queue.idle().await;
    }

    /// True if no checkpoint write is queued or running.
    pub fn is_drained(&self) -> bool {
        self.inner.up.queue.is_empty() && self.inner.down.queue.is_empty()
    }

    /// Stop retrying failed writes and refuse new ones. Queued writes still get one try.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.up.queue.close();
        self.inner.down.queue.close();
    }

    /// Stored checkpoints per direction (for diagnostics).
    pub async fn stored(&self) -> StorageResult<HashMap<Direction, Checkpoint>> {
        let mut out = HashMap::new();
        for direction in [Direction::Up, Direction::Down] {
            if let Some(doc) = self.inner.load_row(direction).await? {
                if let Some(cp) = MetaRow::from_document(&doc)?.checkpoint_data {
                    out.insert(direction, cp);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("identifier", &self.inner.identifier)
            .field("up", &self.current(Direction::Up))
            .field("down", &self.current(Direction::Down))
            .finish()
    }
}
