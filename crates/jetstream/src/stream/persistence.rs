//! Write-through persistence for file-backed streams

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use proven_storage::{LogStorage, LogStorageWithDelete, StorageError, StorageNamespace};
use tracing::debug;

use crate::codec::{deserialize_entry, serialize_entry};
use crate::error::JetStreamResult;
use crate::message::StoredMessage;
use crate::stream::store::MessageStore;

/// Log index holding the highest assigned sequence; messages start at 1.
const WATERMARK_INDEX: u64 = 0;

/// Persistence backend for a single stream
#[derive(Clone)]
pub(crate) enum StreamPersistence {
    /// Memory storage; the message index is the only copy
    Ephemeral,
    /// Entries mirrored into a log storage namespace keyed by sequence
    Persistent {
        storage: Arc<dyn LogStorageWithDelete>,
        namespace: StorageNamespace,
    },
}

/// Messages and watermark read back from a backend
pub(crate) struct Recovered {
    pub messages: Vec<StoredMessage>,
    pub watermark: u64,
}

impl StreamPersistence {
    pub(crate) fn persistent(storage: Arc<dyn LogStorageWithDelete>, stream: &str) -> Self {
        Self::Persistent {
            storage,
            namespace: StorageNamespace::new(format!("stream_{stream}")),
        }
    }

    /// Read every persisted message of the stream
    pub(crate) async fn recover(&self) -> JetStreamResult<Recovered> {
        let Self::Persistent { storage, namespace } = self else {
            return Ok(Recovered {
                messages: Vec::new(),
                watermark: 0,
            });
        };

        let mut watermark = 0;
        if let Some((_, data)) = storage
            .read_range(namespace, WATERMARK_INDEX, WATERMARK_INDEX + 1)
            .await?
            .into_iter()
            .next()
        {
            let bytes: [u8; 8] = data.as_ref().try_into().map_err(|_| {
                StorageError::InvalidValue(format!("watermark of {} bytes", data.len()))
            })?;
            watermark = u64::from_be_bytes(bytes);
        }

        let mut messages = Vec::new();
        if let Some((first, last)) = storage.bounds(namespace).await? {
            let start = first.max(WATERMARK_INDEX + 1);
            for (_, data) in storage.read_range(namespace, start, last.saturating_add(1)).await? {
                messages.push(deserialize_entry(&data)?);
            }
        }

        debug!(
            "Recovered {} messages from {} (watermark {})",
            messages.len(),
            namespace,
            watermark
        );
        Ok(Recovered {
            messages,
            watermark,
        })
    }

    pub(crate) async fn append(&self, message: &StoredMessage) -> JetStreamResult<()> {
        if let Self::Persistent { storage, namespace } = self {
            let entry = serialize_entry(message)?;
            storage
                .append(namespace, vec![(message.sequence, entry)])
                .await?;
        }
        Ok(())
    }

    /// Mirror removals already applied to `store`
    ///
    /// Removals below the store's first sequence compact the log front in one
    /// call; the rest are deleted one by one. The watermark is rewritten
    /// whenever compaction dropped it or the newest message went, so recovery
    /// never hands out a sequence again.
    pub(crate) async fn remove(
        &self,
        sequences: &[u64],
        store: &MessageStore,
    ) -> JetStreamResult<()> {
        let Self::Persistent { storage, namespace } = self else {
            return Ok(());
        };
        if sequences.is_empty() {
            return Ok(());
        }

        let first_sequence = store.first_seq();
        let last_sequence = store.last_seq();
        let compacted = sequences.iter().any(|sequence| *sequence < first_sequence);
        if compacted {
            storage.compact_before(namespace, first_sequence - 1).await?;
        }
        if compacted || sequences.contains(&last_sequence) {
            let watermark = Bytes::copy_from_slice(&last_sequence.to_be_bytes());
            storage
                .append(namespace, vec![(WATERMARK_INDEX, watermark)])
                .await?;
        }
        for sequence in sequences.iter().filter(|s| **s >= first_sequence) {
            storage.delete_entry(namespace, *sequence).await?;
        }
        debug!(
            "Removed {} messages from {} (compacted below {})",
            sequences.len(),
            namespace,
            if compacted { first_sequence } else { 0 }
        );
        Ok(())
    }

    /// Drop everything the stream persisted
    pub(crate) async fn destroy(&self) -> JetStreamResult<()> {
        if let Self::Persistent { storage, namespace } = self {
            storage.remove_namespace(namespace).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for StreamPersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ephemeral => f.write_str("Ephemeral"),
            Self::Persistent { namespace, .. } => f
                .debug_struct("Persistent")
                .field("namespace", namespace)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use proven_storage_memory::MemoryStorage;

    fn message(sequence: u64) -> StoredMessage {
        StoredMessage {
            sequence,
            subject: "orders.new".to_string(),
            payload: Bytes::from(format!("order {sequence}")),
            headers: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    async fn persisted(persistence: &StreamPersistence, count: u64) -> MessageStore {
        let mut store = MessageStore::new();
        for sequence in 1..=count {
            persistence.append(&message(sequence)).await.unwrap();
            store.commit(message(sequence));
        }
        store
    }

    fn remove_from(store: &mut MessageStore, sequences: &[u64]) {
        for sequence in sequences {
            store.remove(*sequence).unwrap();
        }
    }

    #[tokio::test]
    async fn test_recover_after_removals() {
        let persistence = StreamPersistence::persistent(Arc::new(MemoryStorage::new()), "ORDERS");
        let mut store = persisted(&persistence, 3).await;

        remove_from(&mut store, &[1, 3]);
        persistence.remove(&[1, 3], &store).await.unwrap();

        let recovered = persistence.recover().await.unwrap();
        let sequences: Vec<u64> = recovered.messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![2]);
        assert_eq!(recovered.watermark, 3);
    }

    #[tokio::test]
    async fn test_front_removals_compact_the_log() {
        let storage = Arc::new(MemoryStorage::new());
        let persistence = StreamPersistence::persistent(storage.clone(), "ORDERS");
        let mut store = persisted(&persistence, 5).await;
        let namespace = StorageNamespace::new("stream_ORDERS");

        remove_from(&mut store, &[1, 2, 4]);
        persistence.remove(&[1, 2, 4], &store).await.unwrap();

        let indices: Vec<u64> = storage
            .read_range(&namespace, 0, u64::MAX)
            .await
            .unwrap()
            .into_iter()
            .map(|(index, _)| index)
            .collect();
        assert_eq!(indices, vec![WATERMARK_INDEX, 3, 5]);

        remove_from(&mut store, &[3, 5]);
        persistence.remove(&[3, 5], &store).await.unwrap();

        assert_eq!(
            storage.bounds(&namespace).await.unwrap(),
            Some((WATERMARK_INDEX, WATERMARK_INDEX))
        );
        let recovered = persistence.recover().await.unwrap();
        assert!(recovered.messages.is_empty());
        assert_eq!(recovered.watermark, 5);
    }

    #[tokio::test]
    async fn test_ephemeral_is_noop() {
        let persistence = StreamPersistence::Ephemeral;
        persistence.append(&message(1)).await.unwrap();

        let recovered = persistence.recover().await.unwrap();
        assert!(recovered.messages.is_empty());
        assert_eq!(recovered.watermark, 0);
    }

    #[tokio::test]
    async fn test_destroy_clears_namespace() {
        let storage = Arc::new(MemoryStorage::new());
        let persistence = StreamPersistence::persistent(storage.clone(), "ORDERS");
        persistence.append(&message(1)).await.unwrap();
        assert_eq!(storage.namespace_count().await, 1);

        persistence.destroy().await.unwrap();
        assert_eq!(storage.namespace_count().await, 0);
    }
}
