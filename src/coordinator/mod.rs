// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication orchestrator.
//!
//! The public face of a replication. Ties together:
//! - the fork instance and its exclusively owned meta instance
//! - user pull/push handlers via [`transport::TransportHandler`]
//! - the protocol engines via [`crate::protocol::replicate_storage_instance`]
//!
//! # Architecture
//!
//! [`ReplicationState`] manages the lifecycle:
//! 1. `start()` launches the protocol and bridges its events to the public ones
//! 2. transport failures are retried inside the handler, so the protocol never sees them
//! 3. `pause()`/`start()` stop and resume scheduling, `cancel()` tears everything down
//!
//! Lifecycle operations are serialized: two `start()` calls racing each
//! other launch one protocol.

mod registry;
mod transport;
mod types;

pub use registry::ReplicationRegistry;
pub use types::{ReplicationEvents, ReplicationStatus};

use crate::checkpoint::Checkpoint;
use crate::config::ReplicationConfig;
use crate::conflict::{ConflictHandler, DefaultConflictHandler};
use crate::error::{ReplicationError, Result};
use crate::events::{EventChannel, StateChannel};
use crate::handler::{
    DocumentModifier, DocumentsWithCheckpoint, PullHandler, PullStreamItem, PushHandler, ReplicationHandler,
};
use crate::metrics;
use crate::protocol::{replicate_storage_instance, wait_true, ProtocolInput, ProtocolState};
use crate::storage::StorageInstance;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transport::{TransportHandler, TransportParts};

/// How long cancel waits for bridge tasks.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to build a replication.
pub struct ReplicationOptions {
    pub config: ReplicationConfig,
    /// The local instance being replicated. Shared with the application.
    pub fork: Arc<dyn StorageInstance>,
    /// Holds checkpoints and assumed master states. Owned by the replication,
    /// closed on cancel.
    pub meta: Arc<dyn StorageInstance>,
    pub pull: Option<Arc<dyn PullHandler>>,
    pub push: Option<Arc<dyn PushHandler>>,
    pub pull_modifier: Option<DocumentModifier>,
    pub push_modifier: Option<DocumentModifier>,
    pub conflict_handler: Arc<dyn ConflictHandler>,
    /// Connectivity flag. Turning true cuts retry waits short.
    pub online: Option<watch::Receiver<bool>>,
    pub initial_checkpoint_up: Option<Checkpoint>,
    pub initial_checkpoint_down: Option<Checkpoint>,
}

impl ReplicationOptions {
    pub fn new(config: ReplicationConfig, fork: Arc<dyn StorageInstance>, meta: Arc<dyn StorageInstance>) -> Self {
        Self {
            config,
            fork,
            meta,
            pull: None,
            push: None,
            pull_modifier: None,
            push_modifier: None,
            conflict_handler: Arc::new(DefaultConflictHandler),
            online: None,
            initial_checkpoint_up: None,
            initial_checkpoint_down: None,
        }
    }

    pub fn with_pull(mut self, pull: Arc<dyn PullHandler>) -> Self {
        self.pull = Some(pull);
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushHandler>) -> Self {
        self.push = Some(push);
        self
    }

    /// Transform every pulled document before it reaches the fork.
    pub fn with_pull_modifier(mut self, modifier: DocumentModifier) -> Self {
        self.pull_modifier = Some(modifier);
        self
    }

    /// Transform both states of every pushed row.
    pub fn with_push_modifier(mut self, modifier: DocumentModifier) -> Self {
        self.push_modifier = Some(modifier);
        self
    }

    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = handler;
        self
    }

    pub fn with_online(mut self, online: watch::Receiver<bool>) -> Self {
        self.online = Some(online);
        self
    }

    /// Checkpoints used when the meta instance has none stored yet.
    pub fn with_initial_checkpoints(mut self, up: Option<Checkpoint>, down: Option<Checkpoint>) -> Self {
        self.initial_checkpoint_up = up;
        self.initial_checkpoint_down = down;
        self
    }
}

/// A replication between a fork instance and a remote master.
pub struct ReplicationState {
    config: ReplicationConfig,
    fork: Arc<dyn StorageInstance>,
    meta: Arc<dyn StorageInstance>,
    conflict_handler: Arc<dyn ConflictHandler>,
    initial_checkpoint_up: Option<Checkpoint>,
    initial_checkpoint_down: Option<Checkpoint>,

    transport: Arc<TransportHandler>,
    events: Arc<ReplicationEvents>,
    status: StateChannel<ReplicationStatus>,

    /// True while paused or canceled. Aborts transport retry waits.
    stop_tx: watch::Sender<bool>,

    /// Serializes start/pause/cancel/remove.
    lifecycle: tokio::sync::Mutex<()>,

    /// Set once the protocol is launched.
    protocol: watch::Sender<Option<Arc<ProtocolState>>>,

    /// Event bridges and the live interval ticker.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Build a replication and, if `auto_start` is set, start it in the background.
///
/// Must be called inside a tokio runtime.
pub fn replicate(options: ReplicationOptions) -> Result<Arc<ReplicationState>> {
    let state = ReplicationState::new(options)?;
    if state.config.auto_start {
        let replication = Arc::clone(&state);
        tokio::spawn(async move {
            match replication.start().await {
                Ok(()) => {}
                Err(e) if replication.status().is_terminal() => {
                    debug!(identifier = %replication.identifier(), error = %e, "Auto start skipped")
                }
                Err(e) => error!(identifier = %replication.identifier(), error = %e, "Replication failed to start"),
            }
        });
    }
    Ok(state)
}

impl ReplicationState {
    /// Create a replication in `Created` state. Call [`start()`](Self::start) to run it.
    pub fn new(options: ReplicationOptions) -> Result<Arc<Self>> {
        options.config.validate()?;
        if options.pull.is_none() && options.push.is_none() {
            return Err(ReplicationError::Config(
                "a replication needs a pull handler, a push handler, or both".to_string(),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (protocol, _) = watch::channel(None);
        let events = Arc::new(ReplicationEvents::new());

        let transport = Arc::new(TransportHandler::new(TransportParts {
            identifier: options.config.identifier.clone(),
            pull: options.pull,
            push: options.push,
            pull_modifier: options.pull_modifier,
            push_modifier: options.push_modifier,
            retry: options.config.retry_config(),
            live: options.config.live,
            online: options.online,
            stop: stop_rx,
            events: Arc::clone(&events),
        }));

        metrics::set_replication_state(&options.config.identifier, "Created");
        Ok(Arc::new(Self {
            config: options.config,
            fork: options.fork,
            meta: options.meta,
            conflict_handler: options.conflict_handler,
            initial_checkpoint_up: options.initial_checkpoint_up,
            initial_checkpoint_down: options.initial_checkpoint_down,
            transport,
            events,
            status: StateChannel::new(ReplicationStatus::Created),
            stop_tx,
            lifecycle: tokio::sync::Mutex::new(()),
            protocol,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn status(&self) -> ReplicationStatus {
        self.status.get()
    }

    /// Watch lifecycle changes.
    pub fn status_receiver(&self) -> watch::Receiver<ReplicationStatus> {
        self.status.subscribe()
    }

    pub fn events(&self) -> &ReplicationEvents {
        &self.events
    }

    /// The running protocol, once started.
    pub fn protocol(&self) -> Option<Arc<ProtocolState>> {
        self.protocol.borrow().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.status() == ReplicationStatus::Paused
    }

    pub fn is_canceled(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn fork(&self) -> &Arc<dyn StorageInstance> {
        &self.fork
    }

    pub fn meta(&self) -> &Arc<dyn StorageInstance> {
        &self.meta
    }

    fn set_status(&self, status: ReplicationStatus) {
        self.status.set(status);
        metrics::set_replication_state(self.identifier(), &status.to_string());
    }

    /// Start replicating, or resume after [`pause()`](Self::pause).
    ///
    /// Idempotent while running. A one-shot (`live: false`) replication
    /// returns once it has converged and canceled itself.
    pub async fn start(&self) -> Result<()> {
        let guard = self.lifecycle.lock().await;
        let status = self.status();
        match status {
            ReplicationStatus::Running => return Ok(()),
            ReplicationStatus::Canceled | ReplicationStatus::Removed => {
                return Err(ReplicationError::InvalidState {
                    expected: "Created or Paused".to_string(),
                    actual: status.to_string(),
                });
            }
            ReplicationStatus::Paused => {
                self.stop_tx.send_replace(false);
                if let Some(protocol) = self.protocol() {
                    protocol.resume();
                }
                self.set_status(ReplicationStatus::Running);
                info!(identifier = %self.identifier(), "Replication resumed");
                return Ok(());
            }
            ReplicationStatus::Created => {}
        }

        let protocol = self.launch();
        self.set_status(ReplicationStatus::Running);
        info!(
            identifier = %self.identifier(),
            live = self.config.live,
            pull_batch_size = self.config.pull.batch_size,
            push_batch_size = self.config.push.batch_size,
            "Replication running"
        );

        if self.config.live {
            return Ok(());
        }

        // One-shot: converge, then cancel. Cancel needs the lifecycle lock.
        drop(guard);
        match protocol.await_in_sync().await {
            Ok(()) => {
                info!(identifier = %self.identifier(), "One-shot replication converged");
                self.cancel().await
            }
            Err(ReplicationError::Canceled) => Ok(()),
            Err(e) => {
                let _ = self.cancel().await;
                Err(e)
            }
        }
    }

    /// Launch the protocol and the tasks bridging it to the public events.
    fn launch(&self) -> Arc<ProtocolState> {
        let handler: Arc<dyn ReplicationHandler> = self.transport.clone();
        let mut input = ProtocolInput::new(
            self.config.identifier.clone(),
            Arc::clone(&self.fork),
            Arc::clone(&self.meta),
            handler,
        );
        input.conflict_handler = Arc::clone(&self.conflict_handler);
        input.pull_batch_size = self.config.pull.batch_size;
        input.push_batch_size = self.config.push.batch_size;
        input.keep_meta = self.config.keep_meta;
        input.wait_before_persist = self.config.wait_before_persist_duration();
        input.initial_checkpoint_up = self.initial_checkpoint_up.clone();
        input.initial_checkpoint_down = self.initial_checkpoint_down.clone();

        let protocol = replicate_storage_instance(input);

        // Subscribe before yielding so no early event is missed
        let errors = protocol.events.error.subscribe();
        let resolved = protocol.events.resolved_conflicts.subscribe();
        let applied = protocol.events.processed_down.subscribe();

        let mut handles = vec![
            tokio::spawn(bridge_active(
                Arc::clone(&protocol),
                Arc::clone(&self.events),
                self.identifier().to_string(),
            )),
            tokio::spawn(bridge_events(errors, Arc::clone(&self.events), |e| &e.error)),
            tokio::spawn(bridge_events(resolved, Arc::clone(&self.events), |e| &e.resolved_conflicts)),
            tokio::spawn(bridge_received(applied, Arc::clone(&self.events))),
        ];

        if self.config.live {
            if let Some(period) = self.config.live_interval_duration() {
                debug!(identifier = %self.identifier(), period_ms = period.as_millis() as u64, "Live interval enabled");
                handles.push(tokio::spawn(run_live_interval(
                    Arc::clone(&protocol),
                    Arc::clone(&self.transport),
                    period,
                )));
            }
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        self.protocol.send_replace(Some(Arc::clone(&protocol)));
        protocol
    }

    /// Stop scheduling new work. In-flight handler calls finish and commit.
    ///
    /// No-op unless running.
    pub async fn pause(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.status() != ReplicationStatus::Running {
            return Ok(());
        }
        self.stop_tx.send_replace(true);
        if let Some(protocol) = self.protocol() {
            protocol.pause();
        }
        self.set_status(ReplicationStatus::Paused);
        info!(identifier = %self.identifier(), "Replication paused");
        Ok(())
    }

    /// Stop for good: engines, checkpoint queue, meta instance, events.
    ///
    /// Idempotent.
    pub async fn cancel(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.cancel_locked().await
    }

    async fn cancel_locked(&self) -> Result<()> {
        if self.status().is_terminal() {
            return Ok(());
        }
        info!(identifier = %self.identifier(), "Canceling replication");
        self.stop_tx.send_replace(true);
        self.events.canceled.set(true);

        if let Some(protocol) = self.protocol() {
            protocol.cancel().await;
        }

        let handles: Vec<_> = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(TASK_DRAIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during cancel"),
                Err(_) => {
                    warn!(task = i + 1, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        let closed = self.meta.close().await;
        self.events.complete();
        metrics::set_active(self.identifier(), false);
        self.set_status(ReplicationStatus::Canceled);

        match closed {
            Ok(()) => {
                info!(identifier = %self.identifier(), "Replication canceled");
                Ok(())
            }
            Err(e) => {
                warn!(identifier = %self.identifier(), error = %e, "Failed to close meta instance");
                Err(e.into())
            }
        }
    }

    /// Cancel, then delete everything the meta instance holds.
    pub async fn remove(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.status() == ReplicationStatus::Removed {
            return Ok(());
        }
        self.cancel_locked().await?;
        self.meta.remove().await?;
        self.set_status(ReplicationStatus::Removed);
        info!(identifier = %self.identifier(), "Replication removed");
        Ok(())
    }

    async fn wait_for_protocol(&self) -> Result<Arc<ProtocolState>> {
        let mut protocol = self.protocol.subscribe();
        let mut canceled = self.events.canceled.subscribe();
        tokio::select! {
            biased;
            started = protocol.wait_for(|p| p.is_some()) => match started {
                Ok(p) => (*p).clone().ok_or(ReplicationError::Canceled),
                Err(_) => Err(ReplicationError::Canceled),
            },
            _ = wait_true(&mut canceled) => Err(ReplicationError::Canceled),
        }
    }

    /// Resolves after the first full pass in both directions.
    ///
    /// Waits for `start()` if the replication has not been started yet.
    pub async fn await_initial_replication(&self) -> Result<()> {
        let protocol = self.wait_for_protocol().await?;
        protocol.await_first_in_sync().await
    }

    /// Resolves once nothing is left to replicate in either direction.
    pub async fn await_in_sync(&self) -> Result<()> {
        let protocol = self.wait_for_protocol().await?;
        protocol.await_in_sync().await
    }

    /// Ask both directions for a checkpoint iteration.
    ///
    /// Use when the master signals changes the stream could not carry.
    pub fn re_sync(&self) {
        self.transport.emit(PullStreamItem::Resync);
    }

    /// Feed a batch of master documents into the master change stream.
    pub fn emit_event(&self, batch: DocumentsWithCheckpoint) {
        self.transport.emit(PullStreamItem::Batch(batch));
    }
}

/// Public `active` follows the protocol's per-direction flags.
async fn bridge_active(protocol: Arc<ProtocolState>, events: Arc<ReplicationEvents>, identifier: String) {
    let mut up = protocol.events.active_up.subscribe();
    let mut down = protocol.events.active_down.subscribe();
    loop {
        let active = *up.borrow_and_update() || *down.borrow_and_update();
        events.active.set(active);
        metrics::set_active(&identifier, active);

        let changed = tokio::select! {
            r = up.changed() => r,
            r = down.changed() => r,
        };
        if changed.is_err() {
            break;
        }
    }
    events.active.set(false);
}

/// Re-emit protocol events on a public channel until the protocol completes them.
async fn bridge_events<T>(
    mut source: broadcast::Receiver<T>,
    events: Arc<ReplicationEvents>,
    target: fn(&ReplicationEvents) -> &EventChannel<T>,
) where
    T: Clone + Send + 'static,
{
    loop {
        match source.recv().await {
            Ok(event) => {
                target(&events).emit(event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event bridge lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Publish `received` for every master document written into the fork.
async fn bridge_received(mut source: broadcast::Receiver<DocumentsWithCheckpoint>, events: Arc<ReplicationEvents>) {
    loop {
        match source.recv().await {
            Ok(batch) => {
                for document in batch.documents {
                    events.received.emit(document);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Received bridge lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Periodic RESYNC for pull handlers without a live stream.
async fn run_live_interval(protocol: Arc<ProtocolState>, transport: Arc<TransportHandler>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // First tick fires immediately; the protocol already starts with a RESYNC
    ticker.tick().await;
    let mut canceled = protocol.events.canceled.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = wait_true(&mut canceled) => break,
            _ = ticker.tick() => {
                if !protocol.is_stopped() {
                    transport.emit(PullStreamItem::Resync);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentState, StoredDocument};
    use crate::handler::StorageReplicationHandler;
    use crate::storage::{BulkWriteRow, MemoryStorage, StorageError};
    use serde_json::{json, Value};

    struct Setup {
        fork: Arc<MemoryStorage>,
        meta: Arc<MemoryStorage>,
        master: Arc<MemoryStorage>,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                fork: Arc::new(MemoryStorage::new("fork")),
                meta: Arc::new(MemoryStorage::new("meta")),
                master: Arc::new(MemoryStorage::new("master")),
            }
        }

        fn options(&self, config: ReplicationConfig) -> ReplicationOptions {
            let remote = Arc::new(StorageReplicationHandler::new(
                self.master.clone(),
                Arc::new(DefaultConflictHandler),
            ));
            ReplicationOptions::new(config, self.fork.clone(), self.meta.clone())
                .with_pull(remote.clone())
                .with_push(remote)
        }
    }

    fn config(identifier: &str) -> ReplicationConfig {
        ReplicationConfig {
            auto_start: false,
            ..ReplicationConfig::for_testing(identifier)
        }
    }

    async fn put(storage: &MemoryStorage, id: &str, data: Value) {
        let current = storage
            .find_documents_by_id(&[id.to_string()], true)
            .await
            .unwrap()
            .remove(id);
        let document = StoredDocument::write(&DocumentState::new(id, data), current.as_ref().map(|c| &c.rev));
        let response = storage
            .bulk_write(vec![BulkWriteRow { previous: current, document }], "test")
            .await
            .unwrap();
        assert!(response.error.is_empty());
    }

    async fn get(storage: &MemoryStorage, id: &str) -> Option<StoredDocument> {
        storage
            .find_documents_by_id(&[id.to_string()], true)
            .await
            .unwrap()
            .remove(id)
    }

    #[test]
    fn test_new_requires_a_handler() {
        let s = Setup::new();
        let options = ReplicationOptions::new(config("rep"), s.fork.clone(), s.meta.clone());
        assert!(matches!(ReplicationState::new(options), Err(ReplicationError::Config(_))));
    }

    #[test]
    fn test_new_validates_config() {
        let s = Setup::new();
        let options = s.options(config(""));
        assert!(matches!(ReplicationState::new(options), Err(ReplicationError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_replicates_both_ways() {
        let s = Setup::new();
        put(&s.master, "m", json!({"from": "master"})).await;
        put(&s.fork, "f", json!({"from": "fork"})).await;

        let replication = ReplicationState::new(s.options(config("rep"))).unwrap();
        assert_eq!(replication.status(), ReplicationStatus::Created);
        replication.start().await.unwrap();
        replication.start().await.unwrap();
        assert_eq!(replication.status(), ReplicationStatus::Running);

        replication.await_in_sync().await.unwrap();
        assert!(get(&s.fork, "m").await.is_some());
        assert!(get(&s.master, "f").await.is_some());

        replication.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let s = Setup::new();
        let replication = ReplicationState::new(s.options(config("rep"))).unwrap();
        replication.start().await.unwrap();
        replication.await_in_sync().await.unwrap();

        replication.pause().await.unwrap();
        assert!(replication.is_paused());
        put(&s.fork, "while-paused", json!({})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(get(&s.master, "while-paused").await.is_none());
        assert!(!replication.events().active.get());

        replication.start().await.unwrap();
        assert_eq!(replication.status(), ReplicationStatus::Running);
        replication.await_in_sync().await.unwrap();
        assert!(get(&s.master, "while-paused").await.is_some());

        replication.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let s = Setup::new();
        let replication = ReplicationState::new(s.options(config("rep"))).unwrap();
        replication.start().await.unwrap();
        replication.await_initial_replication().await.unwrap();

        replication.cancel().await.unwrap();
        replication.cancel().await.unwrap();
        assert_eq!(replication.status(), ReplicationStatus::Canceled);
        assert!(replication.events().canceled.get());
        assert!(replication.events().received.is_complete());
        assert!(replication.events().sent.is_complete());

        // Meta instance is closed
        assert!(matches!(
            s.meta.find_documents_by_id(&["x".to_string()], true).await,
            Err(StorageError::Closed)
        ));

        match replication.start().await {
            Err(ReplicationError::InvalidState { actual, .. }) => assert_eq!(actual, "Canceled"),
            other => panic!("expected InvalidState, got {:?}", other),
        }
        assert!(matches!(replication.await_in_sync().await, Err(ReplicationError::Canceled)));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let s = Setup::new();
        let replication = ReplicationState::new(s.options(config("rep"))).unwrap();
        replication.cancel().await.unwrap();
        assert_eq!(replication.status(), ReplicationStatus::Canceled);
        assert!(matches!(
            replication.await_initial_replication().await,
            Err(ReplicationError::Canceled)
        ));
    }

    #[tokio::test]
    async fn test_remove_deletes_meta_data() {
        let s = Setup::new();
        put(&s.fork, "a", json!({})).await;
        let replication = ReplicationState::new(s.options(config("rep"))).unwrap();
        replication.start().await.unwrap();
        replication.await_in_sync().await.unwrap();
        assert!(!s.meta.is_empty());

        replication.remove().await.unwrap();
        assert_eq!(replication.status(), ReplicationStatus::Removed);
        assert!(s.meta.is_empty());
        // Fork data is untouched
        assert!(get(&s.fork, "a").await.is_some());
    }

    #[tokio::test]
    async fn test_one_shot_cancels_itself() {
        let s = Setup::new();
        put(&s.master, "m", json!({})).await;
        let replication = ReplicationState::new(s.options(ReplicationConfig {
            live: false,
            ..config("rep")
        }))
        .unwrap();

        replication.start().await.unwrap();
        assert_eq!(replication.status(), ReplicationStatus::Canceled);
        assert!(get(&s.fork, "m").await.is_some());
        assert!(replication.start().await.is_err());
    }

    #[tokio::test]
    async fn test_emit_event_feeds_downstream() {
        let s = Setup::new();
        let replication = ReplicationState::new(
            ReplicationOptions::new(config("rep"), s.fork.clone(), s.meta.clone()).with_pull(Arc::new(
                StorageReplicationHandler::new(s.master.clone(), Arc::new(DefaultConflictHandler)),
            )),
        )
        .unwrap();
        replication.start().await.unwrap();
        replication.await_in_sync().await.unwrap();
        let mut received = replication.events().received.subscribe();

        replication.emit_event(DocumentsWithCheckpoint {
            documents: vec![DocumentState::new("pushed-by-server", json!({"v": 1}))],
            checkpoint: None,
        });
        assert_eq!(received.recv().await.unwrap().id, "pushed-by-server");
        replication.await_in_sync().await.unwrap();
        assert!(get(&s.fork, "pushed-by-server").await.is_some());

        replication.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_re_sync_picks_up_silent_master_changes() {
        let s = Setup::new();
        let remote = Arc::new(StorageReplicationHandler::new(
            s.master.clone(),
            Arc::new(DefaultConflictHandler),
        ));
        // Non-streaming pull: only RESYNC brings changes in
        struct PollOnly(Arc<StorageReplicationHandler>);
        impl PullHandler for PollOnly {
            fn pull(
                &self,
                checkpoint: Option<Checkpoint>,
                batch_size: usize,
            ) -> crate::handler::TransportFuture<'_, DocumentsWithCheckpoint> {
                self.0.pull(checkpoint, batch_size)
            }
        }

        let replication = ReplicationState::new(
            ReplicationOptions::new(config("rep"), s.fork.clone(), s.meta.clone())
                .with_pull(Arc::new(PollOnly(remote))),
        )
        .unwrap();
        replication.start().await.unwrap();
        replication.await_in_sync().await.unwrap();

        put(&s.master, "late", json!({})).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(get(&s.fork, "late").await.is_none());

        replication.re_sync();
        for _ in 0..100 {
            if get(&s.fork, "late").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(get(&s.fork, "late").await.is_some());
        replication.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_replicate_auto_starts() {
        let s = Setup::new();
        put(&s.master, "m", json!({})).await;
        let replication = replicate(s.options(ReplicationConfig::for_testing("rep"))).unwrap();
        replication.await_initial_replication().await.unwrap();
        assert_eq!(replication.status(), ReplicationStatus::Running);
        assert!(get(&s.fork, "m").await.is_some());
        replication.cancel().await.unwrap();
    }
}
