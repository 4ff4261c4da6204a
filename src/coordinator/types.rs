// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication lifecycle and public events.
//!
//! # State Transitions
//!
//! ```text
//!              start()                 pause()
//! Created ─────────────────→ Running ──────────→ Paused
//!    │                        │   ↑                 │
//!    │                        │   └─────────────────┘
//!    │                        │      start() (RESYNC)
//!    │ cancel()               │ cancel() / one-shot pass done
//!    ↓                        ↓
//! Canceled ←──────────────────┘
//!    │
//!    │ remove()
//!    ↓
//! Removed
//! ```
//!
//! - **Created**: built, nothing running. `start()` launches the protocol.
//! - **Running**: both engines are live.
//! - **Paused**: engines drop new work; in-flight calls finish.
//! - **Canceled**: terminal. Engines stopped, meta instance closed, events completed.
//! - **Removed**: canceled and the meta instance's data deleted.

use crate::conflict::ResolvedConflict;
use crate::document::DocumentState;
use crate::events::{EventChannel, StateChannel};
use crate::protocol::ReplicationErrorEvent;

/// State of a replication.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    /// Built but not started.
    Created,

    /// Replicating.
    Running,

    /// Paused by the caller. `start()` resumes.
    Paused,

    /// Canceled. Cannot be restarted.
    Canceled,

    /// Canceled and its meta data deleted.
    Removed,
}

impl ReplicationStatus {
    /// Canceled or removed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicationStatus::Canceled | ReplicationStatus::Removed)
    }
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationStatus::Created => write!(f, "Created"),
            ReplicationStatus::Running => write!(f, "Running"),
            ReplicationStatus::Paused => write!(f, "Paused"),
            ReplicationStatus::Canceled => write!(f, "Canceled"),
            ReplicationStatus::Removed => write!(f, "Removed"),
        }
    }
}

/// Public event channels of a replication.
///
/// All of them complete together when the replication is canceled.
#[derive(Debug)]
pub struct ReplicationEvents {
    /// Every document pulled from master (after the pull modifier).
    pub received: EventChannel<DocumentState>,
    /// Every document state pushed to master (after the push modifier).
    pub sent: EventChannel<DocumentState>,
    /// Handler failures and failed cycles, tagged with their direction.
    pub error: EventChannel<ReplicationErrorEvent>,
    pub resolved_conflicts: EventChannel<ResolvedConflict>,
    /// True while either direction is working or waiting to retry.
    pub active: StateChannel<bool>,
    pub canceled: StateChannel<bool>,
}

impl ReplicationEvents {
    pub fn new() -> Self {
        Self {
            received: EventChannel::new(),
            sent: EventChannel::new(),
            error: EventChannel::new(),
            resolved_conflicts: EventChannel::new(),
            active: StateChannel::new(false),
            canceled: StateChannel::new(false),
        }
    }

    pub(crate) fn complete(&self) {
        self.active.set(false);
        self.received.complete();
        self.sent.complete();
        self.error.complete();
        self.resolved_conflicts.complete();
        self.active.complete();
        self.canceled.complete();
    }
}

impl Default for ReplicationEvents {
    fn default() -> Self {
        Self::new()
    }
}
