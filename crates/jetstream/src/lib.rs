//! In-process durable stream engine
//!
//! This crate provides subject-addressed message streams where:
//! - Publishes are routed to the one stream whose subjects match
//! - Retention is chosen per stream (limits, interest or work queue)
//! - Pull consumers track delivery and acknowledgement per stream
//! - Key-value and object store buckets are views over ordinary streams

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::result_large_err)]

/// Binary format of persisted messages
pub mod codec;

/// Engine configuration
pub mod config;

/// Pull consumers
pub mod consumer;

/// Stream registry and routing
pub mod engine;

/// Error types
pub mod error;

/// Key-value buckets
pub mod kv;

/// Published and stored messages
pub mod message;

/// Object store buckets
pub mod object_store;

/// Streams
pub mod stream;

/// Subject validation and matching
pub mod subject;

/// Watch feeds
pub mod watch;

pub use config::EngineConfig;
pub use consumer::config::{
    AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, SequenceInfo,
};
pub use consumer::message::{AckKind, DeliveryInfo, JetStreamMessage};
pub use consumer::push::PushSubscription;
pub use consumer::{Consumer, FetchRequest};
pub use engine::Engine;
pub use error::{Error, ErrorCategory, ErrorKind, JetStreamResult};
pub use kv::{Entry, KeyValue, KeyValueConfig, KeyValueStatus, Operation};
pub use message::{Message, StoredMessage};
pub use object_store::{ObjectInfo, ObjectMeta, ObjectStore, ObjectStoreConfig, ObjectStoreStatus};
pub use stream::Stream;
pub use stream::config::{
    DiscardPolicy, PublishAck, PublishOptions, PurgeRequest, RetentionPolicy, StorageType,
    StreamConfig, StreamInfo, StreamState,
};
pub use subject::{Subject, SubjectError, SubjectPattern};
pub use watch::{MessageFeed, WatchStart};
