//! Mock master transport for testing.
//!
//! Serves a [`MemoryStorage`] as the remote master and records every pull
//! and push. Failures, streaming and in-flight pushes are controllable.

use doc_replication::conflict::DefaultConflictHandler;
use doc_replication::handler::TransportFuture;
use doc_replication::storage::MemoryStorage;
use doc_replication::{
    Checkpoint, DocumentState, DocumentsWithCheckpoint, HandlerError, PullHandler, PullStreamItem, PushHandler,
    ReplicationHandler, StorageReplicationHandler, WriteToMasterRow,
};
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

/// Mock transport that records all calls.
///
/// # Example
/// ```rust,ignore
/// let mock = Arc::new(MockMaster::new(master.clone()));
///
/// // Fail the next two pushes
/// mock.fail_pushes(2);
///
/// // Assert what was pushed
/// let pushes = mock.pushes();
/// assert_eq!(pushes.len(), 3);
/// ```
pub struct MockMaster {
    inner: StorageReplicationHandler,
    /// Recorded push() calls, one entry per call
    pushes: Mutex<Vec<Vec<WriteToMasterRow>>>,
    /// Counter for pull calls
    pull_count: AtomicUsize,
    /// Fail this many upcoming pulls
    failing_pulls: AtomicUsize,
    /// Fail this many upcoming pushes
    failing_pushes: AtomicUsize,
    /// Fail every call while set
    offline: AtomicBool,
    /// Hand out the master change stream
    streaming: AtomicBool,
    /// Pushes wait while false
    push_gate: watch::Sender<bool>,
    /// Signalled when a push call starts
    push_started: Notify,
}

impl MockMaster {
    /// A reachable, streaming master.
    pub fn new(master: Arc<MemoryStorage>) -> Self {
        let (push_gate, _) = watch::channel(true);
        Self {
            inner: StorageReplicationHandler::new(master, Arc::new(DefaultConflictHandler)),
            pushes: Mutex::new(Vec::new()),
            pull_count: AtomicUsize::new(0),
            failing_pulls: AtomicUsize::new(0),
            failing_pushes: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            streaming: AtomicBool::new(true),
            push_gate,
            push_started: Notify::new(),
        }
    }

    /// A master without a live stream; only RESYNC brings changes in.
    pub fn polling(master: Arc<MemoryStorage>) -> Self {
        let mock = Self::new(master);
        mock.streaming.store(false, Ordering::SeqCst);
        mock
    }

    // =========================================================================
    // Failure Injection
    // =========================================================================

    pub fn fail_pulls(&self, count: usize) {
        self.failing_pulls.store(count, Ordering::SeqCst);
    }

    pub fn fail_pushes(&self, count: usize) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make pushes block until [`release_pushes`](Self::release_pushes).
    pub fn hold_pushes(&self) {
        self.push_gate.send_replace(false);
    }

    pub fn release_pushes(&self) {
        self.push_gate.send_replace(true);
    }

    /// Resolves once a push call has started.
    pub async fn push_started(&self) {
        self.push_started.notified().await;
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    /// All push calls so far.
    pub fn pushes(&self) -> Vec<Vec<WriteToMasterRow>> {
        self.pushes.lock().unwrap().clone()
    }

    /// All pushed rows, flattened.
    pub fn pushed_rows(&self) -> Vec<WriteToMasterRow> {
        self.pushes().into_iter().flatten().collect()
    }

    pub fn pull_count(&self) -> usize {
        self.pull_count.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl PullHandler for MockMaster {
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> TransportFuture<'_, DocumentsWithCheckpoint> {
        Box::pin(async move {
            self.pull_count.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) || Self::take_failure(&self.failing_pulls) {
                return Err(HandlerError::from("master unreachable"));
            }
            self.inner
                .master_changes_since(checkpoint, batch_size)
                .await
                .map_err(|e| HandlerError(e.to_string()))
        })
    }

    fn stream(&self) -> Option<BoxStream<'static, PullStreamItem>> {
        if self.streaming.load(Ordering::SeqCst) {
            Some(self.inner.master_change_stream())
        } else {
            None
        }
    }

    fn compare_checkpoints(&self, a: &Checkpoint, b: &Checkpoint) -> Option<std::cmp::Ordering> {
        ReplicationHandler::compare_checkpoints(&self.inner, a, b)
    }
}

impl PushHandler for MockMaster {
    fn push(&self, rows: Vec<WriteToMasterRow>) -> TransportFuture<'_, Vec<DocumentState>> {
        Box::pin(async move {
            self.push_started.notify_one();
            let mut gate = self.push_gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;

            if self.offline.load(Ordering::SeqCst) || Self::take_failure(&self.failing_pushes) {
                return Err(HandlerError::from("master unreachable"));
            }
            self.pushes.lock().unwrap().push(rows.clone());
            self.inner
                .master_write(rows)
                .await
                .map_err(|e| HandlerError(e.to_string()))
        })
    }
}
