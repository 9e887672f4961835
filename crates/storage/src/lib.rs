//! Log storage traits for stream persistence
//!
//! Backends store indexed byte sequences grouped into namespaces. The stream
//! engine uses one namespace per file-backed stream and keys entries by stream
//! sequence number, so backends never need to understand message framing.

pub mod log;

pub use log::{LogStorage, LogStorageWithDelete, StorageError, StorageNamespace, StorageResult};
