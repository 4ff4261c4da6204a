//! # Document Replication
//!
//! Fork/master replication for document stores.
//!
//! ## Architecture
//!
//! A local storage instance (the *fork*) is kept in sync with a remote
//! *master* reached through user-supplied pull/push handlers. Progress and
//! the last known master state of every document live in a separate *meta*
//! instance, so a restarted replication resumes where it stopped:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            ReplicationState                               │
//! │                                                                           │
//! │  ┌──────────────┐   masterChangesSince    ┌──────────────┐                │
//! │  │ PullHandler  │────────────────────────►│  downstream  │──► fork        │
//! │  │ (transport)  │   master change stream  └──────────────┘      │         │
//! │  └──────────────┘                                               │ changes │
//! │  ┌──────────────┐   masterWrite           ┌──────────────┐      │         │
//! │  │ PushHandler  │◄────────────────────────│   upstream   │◄─────┘         │
//! │  │ (transport)  │   conflicts ──► ConflictHandler ──► fork                │
//! │  └──────────────┘                         └──────────────┘                │
//! │                                                  │                        │
//! │                                                  ▼                        │
//! │                          meta: checkpoints + assumed master states        │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_replication::{replicate, ReplicationConfig, ReplicationOptions, StorageReplicationHandler};
//! use doc_replication::conflict::DefaultConflictHandler;
//! use doc_replication::storage::MemoryStorage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let remote = Arc::new(StorageReplicationHandler::new(
//!         Arc::new(MemoryStorage::new("master")),
//!         Arc::new(DefaultConflictHandler),
//!     ));
//!     let options = ReplicationOptions::new(
//!         ReplicationConfig::new("users"),
//!         Arc::new(MemoryStorage::new("fork")),
//!         Arc::new(MemoryStorage::new("meta")),
//!     )
//!     .with_pull(remote.clone())
//!     .with_push(remote);
//!
//!     let replication = replicate(options).expect("Invalid options");
//!     replication.await_initial_replication().await.expect("Canceled");
//!
//!     // Runs until canceled
//!     replication.cancel().await.expect("Failed to close meta instance");
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod events;
pub mod handler;
pub mod meta;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod resilience;
pub mod revision;
pub mod storage;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, Direction};
pub use config::{PullConfig, PushConfig, ReplicationConfig};
pub use conflict::{ConflictHandler, ConflictInput, ConflictOutput, DefaultConflictHandler, ResolvedConflict};
pub use coordinator::{replicate, ReplicationEvents, ReplicationOptions, ReplicationRegistry, ReplicationState, ReplicationStatus};
pub use document::{DocumentState, StoredDocument};
pub use error::{ReplicationError, Result};
pub use handler::{
    DocumentModifier, DocumentsWithCheckpoint, HandlerError, PullHandler, PullStreamItem, PushHandler,
    ReplicationHandler, StorageReplicationHandler, WriteToMasterRow,
};
pub use protocol::{replicate_storage_instance, ProtocolInput, ProtocolState, ReplicationErrorEvent};
pub use revision::Revision;
pub use storage::{MemoryStorage, SqliteStorage, StorageError, StorageInstance};
