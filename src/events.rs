// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Completable event channels.
//!
//! Every public event category of a replication is one of these. They all
//! complete together when the replication is canceled, after which every
//! receiver (including ones created later) sees a closed channel.
//!
//! - [`EventChannel`]: fan-out of discrete events (`received`, `sent`, `error`, ...)
//! - [`StateChannel`]: latest-value state (`active`, `canceled`, first sync flags)

use std::sync::Mutex;
use tokio::sync::{broadcast, watch};

/// Buffered events per subscriber before it starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast channel that can be completed.
#[derive(Debug)]
pub struct EventChannel<T> {
    sender: Mutex<Option<broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Publish `value`. Returns the number of receivers that got it.
    pub fn emit(&self, value: T) -> usize {
        match self.sender.lock() {
            Ok(guard) => guard.as_ref().and_then(|s| s.send(value).ok()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Receive events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                return sender.subscribe();
            }
        }
        // Completed: hand out a receiver whose sender is already gone
        let (_, receiver) = broadcast::channel(1);
        receiver
    }

    /// Close the channel. Receivers drain what is buffered and then see `Closed`.
    pub fn complete(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sender.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

impl<T: Clone + Send + 'static> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Watch channel that can be completed and keeps its last value.
#[derive(Debug)]
pub struct StateChannel<T> {
    sender: Mutex<Option<watch::Sender<T>>>,
    last: Mutex<T>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> StateChannel<T> {
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(initial.clone());
        Self {
            sender: Mutex::new(Some(sender)),
            last: Mutex::new(initial),
        }
    }

    /// Set the value. Watchers are only woken if it changed.
    pub fn set(&self, value: T) {
        if let Ok(mut last) = self.last.lock() {
            *last = value.clone();
        }
        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                sender.send_if_modified(|current| {
                    if *current == value {
                        false
                    } else {
                        *current = value;
                        true
                    }
                });
            }
        }
    }

    pub fn get(&self) -> T {
        match self.last.lock() {
            Ok(last) => last.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Watch the value. After completion the receiver holds the final value and is closed.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                return sender.subscribe();
            }
        }
        let (_, receiver) = watch::channel(self.get());
        receiver
    }

    pub fn complete(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sender.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}
