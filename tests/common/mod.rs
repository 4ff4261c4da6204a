//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Mock master transport recording pulls and pushes
//! - Fork/meta/master storage setup
//! - Document helpers and polling assertions

pub mod mock_master;

pub use mock_master::*;

use doc_replication::storage::{BulkWriteRow, MemoryStorage, StorageInstance};
use doc_replication::{DocumentState, ReplicationConfig, ReplicationOptions, StoredDocument};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Fork, meta and master instances of one replication.
pub struct TestNodes {
    pub fork: Arc<MemoryStorage>,
    pub meta: Arc<MemoryStorage>,
    pub master: Arc<MemoryStorage>,
}

impl TestNodes {
    pub fn new() -> Self {
        Self {
            fork: Arc::new(MemoryStorage::new("fork")),
            meta: Arc::new(MemoryStorage::new("meta")),
            master: Arc::new(MemoryStorage::new("master")),
        }
    }

    /// A mock transport over this master.
    pub fn mock(&self) -> Arc<MockMaster> {
        Arc::new(MockMaster::new(self.master.clone()))
    }

    /// Options with the mock as both pull and push handler.
    pub fn options(&self, config: ReplicationConfig, mock: &Arc<MockMaster>) -> ReplicationOptions {
        ReplicationOptions::new(config, self.fork.clone(), self.meta.clone())
            .with_pull(mock.clone())
            .with_push(mock.clone())
    }
}

/// Fast retries, manual start.
pub fn test_config(identifier: &str) -> ReplicationConfig {
    ReplicationConfig {
        auto_start: false,
        ..ReplicationConfig::for_testing(identifier)
    }
}

/// Write `data` as the next revision of `id`.
pub async fn put(storage: &MemoryStorage, id: &str, data: Value) -> StoredDocument {
    let current = get(storage, id).await;
    let document = StoredDocument::write(&DocumentState::new(id, data), current.as_ref().map(|c| &c.rev));
    write(storage, current, document).await
}

/// Write a tombstone as the next revision of `id`.
pub async fn delete(storage: &MemoryStorage, id: &str) -> StoredDocument {
    let current = get(storage, id).await;
    let document = StoredDocument::write(&DocumentState::tombstone(id), current.as_ref().map(|c| &c.rev));
    write(storage, current, document).await
}

async fn write(storage: &MemoryStorage, previous: Option<StoredDocument>, document: StoredDocument) -> StoredDocument {
    let response = storage
        .bulk_write(vec![BulkWriteRow { previous, document }], "test")
        .await
        .expect("bulk write failed");
    assert!(response.error.is_empty(), "write conflict: {:?}", response.error);
    response.success.into_iter().next().expect("no written document")
}

/// Current state of `id`, tombstones included.
pub async fn get(storage: &MemoryStorage, id: &str) -> Option<StoredDocument> {
    storage
        .find_documents_by_id(&[id.to_string()], true)
        .await
        .expect("lookup failed")
        .remove(id)
}

/// Poll `check` until it holds, panicking after three seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
