// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport adapter.
//!
//! Wraps the user's [`PullHandler`]/[`PushHandler`] into the
//! [`ReplicationHandler`] the protocol talks to, adding:
//!
//! - retries with the configured backoff, cut short when the online
//!   signal turns true and aborted on pause/cancel
//! - pull/push modifiers
//! - `sent`/`error` events
//!
//! `received` is not emitted here: the orchestrator publishes it once the
//! protocol has written the documents into the fork.
//!
//! An aborted retry wait surfaces as [`ReplicationError::Interrupted`]: the
//! protocol abandons the cycle without committing meta or checkpoints.

use super::types::ReplicationEvents;
use crate::checkpoint::{Checkpoint, Direction};
use crate::document::DocumentState;
use crate::error::{ReplicationError, Result};
use crate::handler::{
    broadcast_stream, DocumentModifier, DocumentsWithCheckpoint, HandlerFuture, PullHandler, PullStreamItem,
    PushHandler, ReplicationHandler, WriteToMasterRow,
};
use crate::metrics;
use crate::protocol::ReplicationErrorEvent;
use crate::resilience::{await_retry, RetryConfig, RetryWait};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Buffered injected stream items before the protocol's subscription lags.
const REMOTE_EVENTS_CAPACITY: usize = 1024;

pub(crate) struct TransportHandler {
    identifier: String,
    pull: Option<Arc<dyn PullHandler>>,
    push: Option<Arc<dyn PushHandler>>,
    pull_modifier: Option<DocumentModifier>,
    push_modifier: Option<DocumentModifier>,
    retry: RetryConfig,
    live: bool,
    online: Option<watch::Receiver<bool>>,
    /// True while paused or canceled.
    stop: watch::Receiver<bool>,
    /// Items injected through `emit`.
    remote_events: broadcast::Sender<PullStreamItem>,
    events: Arc<ReplicationEvents>,
}

pub(crate) struct TransportParts {
    pub identifier: String,
    pub pull: Option<Arc<dyn PullHandler>>,
    pub push: Option<Arc<dyn PushHandler>>,
    pub pull_modifier: Option<DocumentModifier>,
    pub push_modifier: Option<DocumentModifier>,
    pub retry: RetryConfig,
    pub live: bool,
    pub online: Option<watch::Receiver<bool>>,
    pub stop: watch::Receiver<bool>,
    pub events: Arc<ReplicationEvents>,
}

impl TransportHandler {
    pub(crate) fn new(parts: TransportParts) -> Self {
        let (remote_events, _) = broadcast::channel(REMOTE_EVENTS_CAPACITY);
        Self {
            identifier: parts.identifier,
            pull: parts.pull,
            push: parts.push,
            pull_modifier: parts.pull_modifier,
            push_modifier: parts.push_modifier,
            retry: parts.retry,
            live: parts.live,
            online: parts.online,
            stop: parts.stop,
            remote_events,
            events: parts.events,
        }
    }

    /// Inject an item into the master change stream.
    pub(crate) fn emit(&self, item: PullStreamItem) {
        if self.remote_events.send(item).is_err() {
            debug!(identifier = %self.identifier, "No master stream subscriber, dropping injected item");
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Report a failed call and wait before the next attempt.
    async fn wait_before_retry(&self, direction: Direction, error: ReplicationError, attempt: usize) -> Result<()> {
        metrics::record_handler_error(&self.identifier, direction);
        let delay = self.retry.delay_for_attempt(attempt);
        warn!(
            identifier = %self.identifier,
            direction = %direction,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Handler call failed, retrying"
        );
        self.events.error.emit(ReplicationErrorEvent {
            direction,
            error: Arc::new(error),
        });

        let outcome = await_retry(delay, self.online.clone(), self.stop.clone()).await;
        let label = match outcome {
            RetryWait::Elapsed => "elapsed",
            RetryWait::Online => "online",
            RetryWait::Stopped => "stopped",
        };
        metrics::record_retry_wait(&self.identifier, direction, label);
        match outcome {
            RetryWait::Stopped => Err(ReplicationError::Interrupted),
            RetryWait::Elapsed | RetryWait::Online => Ok(()),
        }
    }

    async fn pull_with_retry(
        &self,
        pull: &dyn PullHandler,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> Result<DocumentsWithCheckpoint> {
        let mut attempt = 0;
        loop {
            if self.stopped() {
                return Err(ReplicationError::Interrupted);
            }
            match pull.pull(checkpoint.clone(), batch_size).await {
                Ok(page) => {
                    return Ok(apply_pull_modifier(page, self.pull_modifier.as_ref()));
                }
                Err(e) => {
                    attempt += 1;
                    let error = ReplicationError::pull(checkpoint.as_ref(), e.0);
                    self.wait_before_retry(Direction::Down, error, attempt).await?;
                }
            }
        }
    }

    async fn push_with_retry(&self, push: &dyn PushHandler, rows: Vec<WriteToMasterRow>) -> Result<Vec<DocumentState>> {
        let rows: Vec<WriteToMasterRow> = rows
            .into_iter()
            .map(|row| match &self.push_modifier {
                Some(modify) => WriteToMasterRow {
                    assumed_master_state: row.assumed_master_state.map(|s| modify(s)),
                    new_document_state: modify(row.new_document_state),
                },
                None => row,
            })
            .collect();
        let pushed_ids: HashSet<&str> = rows.iter().map(|r| r.new_document_state.id.as_str()).collect();

        let mut attempt = 0;
        loop {
            if self.stopped() {
                return Err(ReplicationError::Interrupted);
            }
            let error = match push.push(rows.clone()).await {
                Ok(conflicts) => {
                    let unknown = conflicts
                        .iter()
                        .find(|c| !pushed_ids.contains(c.id.as_str()))
                        .map(|c| c.id.clone());
                    match unknown {
                        None => {
                            for row in &rows {
                                self.events.sent.emit(row.new_document_state.clone());
                            }
                            return Ok(conflicts
                                .into_iter()
                                .map(|c| match &self.pull_modifier {
                                    Some(modify) => modify(c),
                                    None => c,
                                })
                                .collect());
                        }
                        Some(id) => {
                            ReplicationError::MalformedPushResult(format!("conflict for {} which was not pushed", id))
                        }
                    }
                }
                Err(e) => ReplicationError::push(rows.len(), e.0),
            };
            attempt += 1;
            self.wait_before_retry(Direction::Up, error, attempt).await?;
        }
    }
}

/// Apply the pull modifier to a master batch.
fn apply_pull_modifier(mut page: DocumentsWithCheckpoint, modifier: Option<&DocumentModifier>) -> DocumentsWithCheckpoint {
    if let Some(modify) = modifier {
        page.documents = page.documents.into_iter().map(|d| modify(d)).collect();
    }
    page
}

impl ReplicationHandler for TransportHandler {
    fn master_changes_since(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> HandlerFuture<'_, DocumentsWithCheckpoint> {
        Box::pin(async move {
            match &self.pull {
                Some(pull) => self.pull_with_retry(pull.as_ref(), checkpoint, batch_size).await,
                None => Ok(DocumentsWithCheckpoint::empty(None)),
            }
        })
    }

    fn master_change_stream(&self) -> BoxStream<'static, PullStreamItem> {
        let has_pull = self.pull.is_some();
        let modifier = self.pull_modifier.clone();
        let map = move |item: PullStreamItem| match item {
            PullStreamItem::Resync => Some(PullStreamItem::Resync),
            PullStreamItem::Batch(_) if !has_pull => None,
            PullStreamItem::Batch(page) => Some(PullStreamItem::Batch(apply_pull_modifier(page, modifier.as_ref()))),
        };

        let injected = broadcast_stream(self.remote_events.subscribe(), map.clone());
        let live_stream = if self.live {
            self.pull.as_ref().and_then(|pull| pull.stream())
        } else {
            None
        };
        match live_stream {
            Some(live) => stream::select(injected, live.filter_map(move |item| futures::future::ready(map(item))))
                .boxed(),
            None => injected,
        }
    }

    fn master_write(&self, rows: Vec<WriteToMasterRow>) -> HandlerFuture<'_, Vec<DocumentState>> {
        Box::pin(async move {
            match &self.push {
                Some(push) => self.push_with_retry(push.as_ref(), rows).await,
                None => Ok(Vec::new()),
            }
        })
    }

    fn compare_checkpoints(&self, a: &Checkpoint, b: &Checkpoint) -> Option<std::cmp::Ordering> {
        self.pull.as_ref()?.compare_checkpoints(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, TransportFuture};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Pull handler that fails a fixed number of times first.
    struct FlakyPull {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyPull {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PullHandler for FlakyPull {
        fn pull(&self, checkpoint: Option<Checkpoint>, _batch_size: usize) -> TransportFuture<'_, DocumentsWithCheckpoint> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(HandlerError::from("offline"));
                }
                Ok(DocumentsWithCheckpoint {
                    documents: vec![DocumentState::new("a", json!({"v": 1}))],
                    checkpoint,
                })
            })
        }
    }

    /// Push handler returning canned conflicts.
    struct CannedPush {
        conflicts: Mutex<Vec<Vec<DocumentState>>>,
        received: Mutex<Vec<Vec<WriteToMasterRow>>>,
    }

    impl CannedPush {
        fn new(conflicts: Vec<Vec<DocumentState>>) -> Self {
            Self {
                conflicts: Mutex::new(conflicts),
                received: Mutex::new(Vec::new()),
            }
        }
    }

    impl PushHandler for CannedPush {
        fn push(&self, rows: Vec<WriteToMasterRow>) -> TransportFuture<'_, Vec<DocumentState>> {
            Box::pin(async move {
                self.received.lock().unwrap().push(rows);
                let mut conflicts = self.conflicts.lock().unwrap();
                if conflicts.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(conflicts.remove(0))
                }
            })
        }
    }

    fn parts(stop: watch::Receiver<bool>, events: Arc<ReplicationEvents>) -> TransportParts {
        TransportParts {
            identifier: "rep".to_string(),
            pull: None,
            push: None,
            pull_modifier: None,
            push_modifier: None,
            retry: RetryConfig::constant(Duration::from_millis(5)),
            live: true,
            online: None,
            stop,
            events,
        }
    }

    #[tokio::test]
    async fn test_pull_retries_and_reports_errors() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let events = Arc::new(ReplicationEvents::new());
        let mut errors = events.error.subscribe();
        let mut received = events.received.subscribe();
        let pull = Arc::new(FlakyPull::new(2));

        let mut p = parts(stop_rx, Arc::clone(&events));
        p.pull = Some(pull.clone());
        let transport = TransportHandler::new(p);

        let page = transport.master_changes_since(None, 10).await.unwrap();
        assert_eq!(page.documents.len(), 1);
        assert_eq!(pull.calls.load(Ordering::SeqCst), 3);

        for _ in 0..2 {
            let event = errors.recv().await.unwrap();
            assert_eq!(event.direction, Direction::Down);
            assert!(matches!(*event.error, ReplicationError::Pull { .. }));
        }
        // Nothing reached the fork yet
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_interrupts_retry_wait() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let events = Arc::new(ReplicationEvents::new());
        let mut p = parts(stop_rx, events);
        p.pull = Some(Arc::new(FlakyPull::new(usize::MAX)));
        p.retry = RetryConfig::constant(Duration::from_secs(3600));
        let transport = Arc::new(TransportHandler::new(p));

        let t = Arc::clone(&transport);
        let call = tokio::spawn(async move { t.master_changes_since(None, 10).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
        assert!(matches!(result, Err(ReplicationError::Interrupted)));
    }

    #[tokio::test]
    async fn test_missing_handlers_are_no_ops() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let transport = TransportHandler::new(parts(stop_rx, Arc::new(ReplicationEvents::new())));

        let page = transport
            .master_changes_since(Some(Checkpoint::from(json!(1))), 10)
            .await
            .unwrap();
        assert_eq!(page, DocumentsWithCheckpoint::empty(None));

        let row = WriteToMasterRow {
            assumed_master_state: None,
            new_document_state: DocumentState::new("a", json!({})),
        };
        assert!(transport.master_write(vec![row]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_modifier_applies_to_both_states() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let events = Arc::new(ReplicationEvents::new());
        let mut sent = events.sent.subscribe();
        let push = Arc::new(CannedPush::new(Vec::new()));

        let mut p = parts(stop_rx, Arc::clone(&events));
        p.push = Some(push.clone());
        p.push_modifier = Some(Arc::new(|mut doc: DocumentState| {
            doc.data.insert("pushed".to_string(), json!(true));
            doc
        }));
        let transport = TransportHandler::new(p);

        let row = WriteToMasterRow {
            assumed_master_state: Some(DocumentState::new("a", json!({"v": 1}))),
            new_document_state: DocumentState::new("a", json!({"v": 2})),
        };
        transport.master_write(vec![row]).await.unwrap();

        let received = push.received.lock().unwrap().clone();
        let pushed = &received[0][0];
        assert_eq!(pushed.new_document_state.get("pushed"), Some(&json!(true)));
        assert_eq!(
            pushed.assumed_master_state.as_ref().and_then(|s| s.get("pushed")),
            Some(&json!(true))
        );
        assert_eq!(sent.recv().await.unwrap().get("v"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_conflict_for_unknown_id_is_retried() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let events = Arc::new(ReplicationEvents::new());
        let mut errors = events.error.subscribe();
        let push = Arc::new(CannedPush::new(vec![
            vec![DocumentState::new("stranger", json!({}))],
            vec![DocumentState::new("a", json!({"v": 9}))],
        ]));

        let mut p = parts(stop_rx, Arc::clone(&events));
        p.push = Some(push.clone());
        let transport = TransportHandler::new(p);

        let row = WriteToMasterRow {
            assumed_master_state: None,
            new_document_state: DocumentState::new("a", json!({"v": 1})),
        };
        let conflicts = transport.master_write(vec![row]).await.unwrap();
        assert_eq!(conflicts, vec![DocumentState::new("a", json!({"v": 9}))]);
        assert_eq!(push.received.lock().unwrap().len(), 2);

        let event = errors.recv().await.unwrap();
        assert_eq!(event.direction, Direction::Up);
        assert!(matches!(*event.error, ReplicationError::MalformedPushResult(_)));
    }

    #[tokio::test]
    async fn test_injected_items_reach_the_stream() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let events = Arc::new(ReplicationEvents::new());
        let mut p = parts(stop_rx, events);
        p.pull = Some(Arc::new(FlakyPull::new(0)));
        p.pull_modifier = Some(Arc::new(|mut doc: DocumentState| {
            doc.data.insert("pulled".to_string(), json!(true));
            doc
        }));
        let transport = TransportHandler::new(p);
        let mut stream = transport.master_change_stream();

        transport.emit(PullStreamItem::Resync);
        transport.emit(PullStreamItem::Batch(DocumentsWithCheckpoint {
            documents: vec![DocumentState::new("x", json!({}))],
            checkpoint: None,
        }));

        assert_eq!(stream.next().await, Some(PullStreamItem::Resync));
        match stream.next().await {
            Some(PullStreamItem::Batch(batch)) => {
                assert_eq!(batch.documents[0].get("pulled"), Some(&json!(true)));
            }
            other => panic!("unexpected stream item: {:?}", other),
        }
    }
}
