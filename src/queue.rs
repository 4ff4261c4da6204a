// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-worker FIFO queue.
//!
//! Jobs are futures executed one at a time, in submission order, by a
//! worker task that is spawned on first use. Callers fire and forget with
//! [`SerialQueue::push`].
//!
//! ```text
//! push(a) ─┐
//! push(b) ─┼─► mpsc ─► worker: a.await; b.await; c.await
//! push(c) ─┘
//! ```
//!
//! The number of queued-or-running jobs is published on a watch channel so
//! [`SerialQueue::idle`] can wait for the queue to drain.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Ordered single-worker job queue.
pub struct SerialQueue {
    name: String,
    /// `None` before first use and after close
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    closed: std::sync::atomic::AtomicBool,
    pending: watch::Sender<usize>,
}

impl SerialQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            name: name.into(),
            sender: Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
            pending,
        }
    }

    /// Enqueue a job without waiting for it. Returns `false` if the queue is closed.
    pub fn push<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut guard) = self.sender.lock() else {
            return false;
        };
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return false;
        }
        let sender = guard.get_or_insert_with(|| self.spawn_worker());
        self.pending.send_modify(|n| *n += 1);
        if sender.send(Box::pin(job)).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return false;
        }
        true
    }

    /// Wait until every job submitted so far has finished.
    pub async fn idle(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Queued plus running jobs.
    pub fn len(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting jobs. Already queued jobs still run.
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    fn spawn_worker(&self) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = self.pending.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            debug!(queue = %name, "Queue worker started");
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    warn!(queue = %name, "Queued job panicked");
                }
                pending.send_modify(|n| *n = n.saturating_sub(1));
            }
            debug!(queue = %name, "Queue worker stopped");
        });

        tx
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.name)
            .field("pending", &self.len())
            .finish()
    }
}
