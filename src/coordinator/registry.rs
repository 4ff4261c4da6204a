// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replications of one collection, torn down together.

use super::ReplicationState;
use crate::error::{ReplicationError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Every replication owned by one collection.
///
/// The owner calls [`cancel_all`](Self::cancel_all) when the collection
/// closes.
#[derive(Default)]
pub struct ReplicationRegistry {
    /// Keyed by replication identifier
    replications: DashMap<String, Arc<ReplicationState>>,
}

impl ReplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `replication` under its identifier.
    ///
    /// A canceled replication with the same identifier is replaced; a live
    /// one is a configuration error.
    pub fn register(&self, replication: Arc<ReplicationState>) -> Result<()> {
        let identifier = replication.identifier().to_string();
        match self.replications.entry(identifier) {
            Entry::Occupied(existing) if !existing.get().status().is_terminal() => Err(ReplicationError::Config(
                format!("replication {} is already registered", existing.key()),
            )),
            Entry::Occupied(mut existing) => {
                existing.insert(replication);
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(replication);
                Ok(())
            }
        }
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<ReplicationState>> {
        self.replications.get(identifier).map(|r| r.value().clone())
    }

    pub fn unregister(&self, identifier: &str) -> Option<Arc<ReplicationState>> {
        self.replications.remove(identifier).map(|(_, r)| r)
    }

    /// Registered identifiers, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.replications.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.replications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replications.is_empty()
    }

    /// Cancel and forget every replication.
    ///
    /// All of them are canceled even if one fails; the first error is returned.
    pub async fn cancel_all(&self) -> Result<()> {
        // Collect first so no shard lock is held across an await
        let identifiers: Vec<String> = self.replications.iter().map(|r| r.key().clone()).collect();
        let replications: Vec<Arc<ReplicationState>> = identifiers
            .iter()
            .filter_map(|id| self.unregister(id))
            .collect();
        if !replications.is_empty() {
            info!(count = replications.len(), "Canceling all replications");
        }

        let mut first_error = None;
        for replication in replications {
            if let Err(e) = replication.cancel().await {
                warn!(identifier = %replication.identifier(), error = %e, "Cancel failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::conflict::DefaultConflictHandler;
    use crate::coordinator::{ReplicationOptions, ReplicationStatus};
    use crate::handler::StorageReplicationHandler;
    use crate::storage::MemoryStorage;

    fn replication(identifier: &str) -> Arc<ReplicationState> {
        let master = Arc::new(MemoryStorage::new("master"));
        let remote = Arc::new(StorageReplicationHandler::new(master, Arc::new(DefaultConflictHandler)));
        let config = ReplicationConfig {
            auto_start: false,
            ..ReplicationConfig::for_testing(identifier)
        };
        let options = ReplicationOptions::new(
            config,
            Arc::new(MemoryStorage::new("fork")),
            Arc::new(MemoryStorage::new("meta")),
        )
        .with_pull(remote);
        ReplicationState::new(options).unwrap()
    }

    #[tokio::test]
    async fn test_register_rejects_live_duplicate() {
        let registry = ReplicationRegistry::new();
        registry.register(replication("users")).unwrap();
        assert!(matches!(
            registry.register(replication("users")),
            Err(ReplicationError::Config(_))
        ));

        // A canceled one can be replaced
        registry.get("users").unwrap().cancel().await.unwrap();
        registry.register(replication("users")).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_identifiers_sorted_and_unregister() {
        let registry = ReplicationRegistry::new();
        registry.register(replication("b")).unwrap();
        registry.register(replication("a")).unwrap();
        assert_eq!(registry.identifiers(), vec!["a".to_string(), "b".to_string()]);

        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert!(registry.get("a").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let registry = ReplicationRegistry::new();
        let running = replication("running");
        running.start().await.unwrap();
        let created = replication("created");
        registry.register(Arc::clone(&running)).unwrap();
        registry.register(Arc::clone(&created)).unwrap();

        registry.cancel_all().await.unwrap();
        assert!(registry.is_empty());
        assert_eq!(running.status(), ReplicationStatus::Canceled);
        assert_eq!(created.status(), ReplicationStatus::Canceled);
    }
}
