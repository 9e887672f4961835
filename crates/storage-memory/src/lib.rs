//! In-memory log storage implementation
//!
//! Used as the default backend for file-typed streams when no durable backend
//! is configured, and in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use proven_storage::{LogStorage, LogStorageWithDelete, StorageNamespace, StorageResult};
use tokio::sync::RwLock;
use tracing::debug;

type Logs = HashMap<StorageNamespace, BTreeMap<u64, Bytes>>;

/// In-memory log storage using a `BTreeMap` per namespace for ordering
#[derive(Clone, Default)]
pub struct MemoryStorage {
    logs: Arc<RwLock<Logs>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of namespaces currently holding at least one entry
    pub async fn namespace_count(&self) -> usize {
        self.logs
            .read()
            .await
            .values()
            .filter(|log| !log.is_empty())
            .count()
    }
}

#[async_trait]
impl LogStorage for MemoryStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut logs = self.logs.write().await;
        let log = logs.entry(namespace.clone()).or_default();
        log.extend(entries);

        Ok(())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        let logs = self.logs.read().await;
        let bounds = logs.get(namespace).and_then(|log| {
            let first = log.keys().next()?;
            let last = log.keys().next_back()?;
            Some((*first, *last))
        });

        Ok(bounds)
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let mut logs = self.logs.write().await;

        if let Some(log) = logs.get_mut(namespace) {
            *log = match index.checked_add(1) {
                Some(keep_from) => log.split_off(&keep_from),
                None => BTreeMap::new(),
            };
        }

        Ok(())
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        if start >= end {
            return Ok(Vec::new());
        }

        let logs = self.logs.read().await;
        let entries = logs
            .get(namespace)
            .map(|log| {
                log.range(start..end)
                    .map(|(&index, data)| (index, data.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(entries)
    }

    async fn remove_namespace(&self, namespace: &StorageNamespace) -> StorageResult<()> {
        if let Some(log) = self.logs.write().await.remove(namespace) {
            debug!("Removed namespace {} with {} entries", namespace, log.len());
        }

        Ok(())
    }
}

#[async_trait]
impl LogStorageWithDelete for MemoryStorage {
    async fn delete_entry(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<bool> {
        let mut logs = self.logs.write().await;

        Ok(logs
            .get_mut(namespace)
            .is_some_and(|log| log.remove(&index).is_some()))
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("logs", &"<locked>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<(u64, Bytes)> {
        range
            .map(|i| (i, Bytes::from(format!("data {i}"))))
            .collect()
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        storage
            .append(&namespace, vec![(1, Bytes::from("test data 1"))])
            .await
            .unwrap();

        let result = storage.read_range(&namespace, 1, 2).await.unwrap();
        assert_eq!(result, vec![(1, Bytes::from("test data 1"))]);
        assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((1, 1)));
    }

    #[tokio::test]
    async fn test_read_missing_namespace() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("missing");

        assert!(storage.read_range(&namespace, 1, 10).await.unwrap().is_empty());
        assert_eq!(storage.bounds(&namespace).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compact() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");
        storage.append(&namespace, entries(1..=5)).await.unwrap();

        storage.compact_before(&namespace, 3).await.unwrap();

        let range = storage.read_range(&namespace, 1, 6).await.unwrap();
        let indices: Vec<u64> = range.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![4, 5]);
        assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((4, 5)));
    }

    #[tokio::test]
    async fn test_delete_entry_leaves_gap() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");
        storage.append(&namespace, entries(1..=3)).await.unwrap();

        assert!(storage.delete_entry(&namespace, 2).await.unwrap());
        assert!(!storage.delete_entry(&namespace, 2).await.unwrap());

        let range = storage.read_range(&namespace, 1, 4).await.unwrap();
        let indices: Vec<u64> = range.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((1, 3)));
    }

    #[tokio::test]
    async fn test_remove_namespace() {
        let storage = MemoryStorage::new();
        let first = StorageNamespace::new("first");
        let second = StorageNamespace::new("second");
        storage.append(&first, entries(1..=2)).await.unwrap();
        storage.append(&second, entries(1..=2)).await.unwrap();
        assert_eq!(storage.namespace_count().await, 2);

        storage.remove_namespace(&first).await.unwrap();

        assert_eq!(storage.namespace_count().await, 1);
        assert_eq!(storage.bounds(&first).await.unwrap(), None);
        assert_eq!(storage.bounds(&second).await.unwrap(), Some((1, 2)));
    }
}
