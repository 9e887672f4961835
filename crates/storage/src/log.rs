//! Log storage abstraction
//!
//! Entries are opaque `Bytes` addressed by a `u64` index inside a namespace.
//! Indices are sparse: deleting from the middle of a log is allowed through
//! [`LogStorageWithDelete`], and readers must not assume contiguous ranges.
//!
//! The traits are object safe so an engine can hold an
//! `Arc<dyn LogStorageWithDelete>` without threading a backend type parameter
//! through every handle.

use std::fmt::{Debug, Display};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Storage backend error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Invalid namespace name
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    /// Stored value could not be interpreted
    #[error("Invalid value format: {0}")]
    InvalidValue(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Namespace not found
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),
}

/// A namespace for organizing log entries
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageNamespace(String);

impl StorageNamespace {
    /// Create a new storage namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the namespace as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StorageNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Indexed log storage
#[async_trait]
pub trait LogStorage: Debug + Send + Sync + 'static {
    /// Atomically append entries (one or more)
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()>;

    /// Get the current bounds of the log (first_index, last_index)
    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>>;

    /// Remove all entries up to and including the given index
    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()>;

    /// Read a range of entries [start, end)
    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>>;

    /// Drop every entry in the namespace along with the namespace itself
    async fn remove_namespace(&self, namespace: &StorageNamespace) -> StorageResult<()>;
}

/// Log storage that supports deletion of individual entries
///
/// Kept apart from [`LogStorage`] so append-only logs can refuse it.
#[async_trait]
pub trait LogStorageWithDelete: LogStorage {
    /// Delete the entry at the given index
    ///
    /// Returns true if the entry existed and was deleted.
    async fn delete_entry(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<bool>;
}

#[async_trait]
impl<T: LogStorage + ?Sized> LogStorage for Arc<T> {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        (**self).append(namespace, entries).await
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        (**self).bounds(namespace).await
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        (**self).compact_before(namespace, index).await
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        (**self).read_range(namespace, start, end).await
    }

    async fn remove_namespace(&self, namespace: &StorageNamespace) -> StorageResult<()> {
        (**self).remove_namespace(namespace).await
    }
}

#[async_trait]
impl<T: LogStorageWithDelete + ?Sized> LogStorageWithDelete for Arc<T> {
    async fn delete_entry(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<bool> {
        (**self).delete_entry(namespace, index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_display() {
        let namespace = StorageNamespace::new("stream_orders");
        assert_eq!(namespace.as_str(), "stream_orders");
        assert_eq!(namespace.to_string(), "stream_orders");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(err.to_string().starts_with("IO error"));
    }
}
