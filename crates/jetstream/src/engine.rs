//! The engine: stream registry, subject routing and background maintenance

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use proven_storage::LogStorageWithDelete;
use proven_storage_memory::MemoryStorage;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::consumer::Consumer;
use crate::consumer::push::PushSubscription;
use crate::consumer::config::ConsumerConfig;
use crate::error::{Error, ErrorKind, JetStreamResult};
use crate::jetstream_error;
use crate::kv::{KeyValue, KeyValueConfig};
use crate::message::Message;
use crate::object_store::{ObjectStore, ObjectStoreConfig};
use crate::stream::Stream;
use crate::stream::config::{PublishAck, PublishOptions, StorageType, StreamConfig, StreamInfo};
use crate::stream::persistence::StreamPersistence;
use crate::subject::{
    pattern_is_subset, patterns_overlap, subject_matches_pattern, validate_subject,
    validate_subject_pattern,
};

/// Shortest period of the maintenance sweep
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

struct EngineInner {
    config: Arc<EngineConfig>,
    storage: Arc<dyn LogStorageWithDelete>,
    streams: DashMap<String, Stream>,
    /// Serializes stream creation, update and deletion
    admin_lock: AsyncMutex<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

/// In-process stream engine
///
/// Cheap to clone; every clone shares the same streams.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("streams", &self.inner.streams.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine whose file-backed streams live in memory
    pub fn new(config: EngineConfig) -> Self {
        Self::with_storage(config, Arc::new(MemoryStorage::new()))
    }

    /// Engine persisting file-backed streams into `storage`
    pub fn with_storage(config: EngineConfig, storage: Arc<dyn LogStorageWithDelete>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                storage,
                streams: DashMap::new(),
                admin_lock: AsyncMutex::new(()),
                sweeper: Mutex::new(None),
                cancellation_token: CancellationToken::new(),
            }),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start the background sweep; calling it again has no effect
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let engine = Arc::downgrade(&self.inner);
        let token = self.inner.cancellation_token.clone();
        let period = self.inner.config.sweep_interval.max(MIN_SWEEP_INTERVAL);

        info!("Starting engine maintenance every {:?}", period);
        *sweeper = Some(tokio::spawn(run_sweeper(engine, token, period)));
    }

    /// Stop the background sweep
    pub async fn shutdown(&self) {
        self.inner.cancellation_token.cancel();
        let handle = self.inner.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Engine stopped");
    }

    /// Create a stream; an identical existing stream is returned as is
    pub async fn create_stream(&self, config: StreamConfig) -> JetStreamResult<Stream> {
        config.validate()?;
        let _admin = self.inner.admin_lock.lock().await;
        self.create_stream_locked(config).await
    }

    /// Update an existing stream's limits and subjects
    pub async fn update_stream(&self, config: StreamConfig) -> JetStreamResult<Stream> {
        config.validate()?;
        let _admin = self.inner.admin_lock.lock().await;
        self.update_stream_locked(config).await
    }

    /// Create a stream or update it when it exists
    pub async fn create_or_update_stream(&self, config: StreamConfig) -> JetStreamResult<Stream> {
        config.validate()?;
        let _admin = self.inner.admin_lock.lock().await;
        if self.inner.streams.contains_key(&config.name) {
            self.update_stream_locked(config).await
        } else {
            self.create_stream_locked(config).await
        }
    }

    async fn create_stream_locked(&self, config: StreamConfig) -> JetStreamResult<Stream> {
        let existing = self
            .inner
            .streams
            .get(&config.name)
            .map(|entry| entry.value().clone());
        if let Some(existing) = existing {
            if existing.config() == config {
                return Ok(existing);
            }
            return Err(jetstream_error!(
                ErrorKind::StreamNameInUse,
                "stream '{}' already exists with a different configuration",
                config.name
            ));
        }

        self.check_subject_overlap(&config)?;

        let persistence = match config.storage {
            StorageType::File => {
                StreamPersistence::persistent(Arc::clone(&self.inner.storage), &config.name)
            }
            StorageType::Memory => StreamPersistence::Ephemeral,
        };

        let name = config.name.clone();
        let subjects = config.bound_subjects();
        let stream = Stream::open(config, Arc::clone(&self.inner.config), persistence).await?;
        self.inner.streams.insert(name.clone(), stream.clone());

        info!("Created stream {} on subjects {:?}", name, subjects);
        Ok(stream)
    }

    async fn update_stream_locked(&self, config: StreamConfig) -> JetStreamResult<Stream> {
        let stream = self.stream(&config.name)?;
        let current = stream.config();

        if current.storage != config.storage {
            return Err(Error::invalid_config(format!(
                "storage of stream '{}' cannot be changed",
                config.name
            )));
        }
        if current.retention != config.retention {
            return Err(Error::invalid_config(format!(
                "retention of stream '{}' cannot be changed",
                config.name
            )));
        }

        self.check_subject_overlap(&config)?;
        stream.update_config(config).await?;

        info!("Updated stream {}", stream.name());
        Ok(stream)
    }

    fn check_subject_overlap(&self, config: &StreamConfig) -> JetStreamResult<()> {
        let subjects = config.bound_subjects();
        for entry in &self.inner.streams {
            if entry.key() == &config.name {
                continue;
            }
            for other in entry.value().config().bound_subjects() {
                if let Some(subject) = subjects
                    .iter()
                    .find(|subject| patterns_overlap(subject, &other))
                {
                    return Err(jetstream_error!(
                        ErrorKind::SubjectsOverlap,
                        "subject '{subject}' overlaps '{other}' of stream '{}'",
                        entry.key()
                    ));
                }
            }
        }
        Ok(())
    }

    /// Delete a stream with its consumers and persisted messages
    pub async fn delete_stream(&self, name: &str) -> JetStreamResult<()> {
        let _admin = self.inner.admin_lock.lock().await;
        let Some((_, stream)) = self.inner.streams.remove(name) else {
            return Err(Error::stream_not_found(name));
        };

        stream.destroy().await?;

        info!("Deleted stream {}", name);
        Ok(())
    }

    /// Look up a stream by name
    pub fn stream(&self, name: &str) -> JetStreamResult<Stream> {
        self.inner
            .streams
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::stream_not_found(name))
    }

    /// Information about a stream, with per-subject counts when `subjects_filter` is set
    pub async fn stream_info(
        &self,
        name: &str,
        subjects_filter: Option<&str>,
    ) -> JetStreamResult<StreamInfo> {
        let stream = self.stream(name)?;
        match subjects_filter {
            Some(filter) => stream.info_with_subjects(filter).await,
            None => stream.info().await,
        }
    }

    /// Names of all streams, sorted
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .streams
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Information about every stream, sorted by name
    pub async fn streams(&self) -> JetStreamResult<Vec<StreamInfo>> {
        let mut streams: Vec<Stream> = self
            .inner
            .streams
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        streams.sort_by(|a, b| a.name().cmp(b.name()));

        let mut infos = Vec::with_capacity(streams.len());
        for stream in streams {
            infos.push(stream.info().await?);
        }
        Ok(infos)
    }

    /// Create a consumer on a stream
    pub async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> JetStreamResult<Consumer> {
        self.stream(stream)?.create_consumer(config).await
    }

    /// Create or update a consumer on a stream
    pub async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> JetStreamResult<Consumer> {
        self.stream(stream)?.create_or_update_consumer(config).await
    }

    /// Look up a consumer
    pub fn consumer(&self, stream: &str, name: &str) -> JetStreamResult<Consumer> {
        self.stream(stream)?.consumer(name)
    }

    /// Delete a consumer
    pub async fn delete_consumer(&self, stream: &str, name: &str) -> JetStreamResult<()> {
        self.stream(stream)?.delete_consumer(name).await
    }

    /// Push subscription on a new ephemeral consumer filtered to `filter`
    ///
    /// The stream is the one whose subjects contain the filter.
    pub async fn subscribe(&self, filter: &str) -> JetStreamResult<PushSubscription> {
        validate_subject_pattern(filter)?;
        let stream = self
            .inner
            .streams
            .iter()
            .find(|entry| {
                entry
                    .value()
                    .config()
                    .bound_subjects()
                    .iter()
                    .any(|subject| pattern_is_subset(filter, subject))
            })
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                jetstream_error!(ErrorKind::StreamNotFound, "no stream holds '{filter}'")
            })?;

        let consumer = stream
            .create_consumer(ConsumerConfig::ephemeral().with_filter(filter))
            .await?;
        consumer.subscribe()
    }

    /// The stream whose subjects bind `subject`
    ///
    /// This is the single place deciding that a publish has no interest.
    pub fn route(&self, subject: &str) -> JetStreamResult<Stream> {
        validate_subject(subject)?;
        self.inner
            .streams
            .iter()
            .find(|entry| {
                entry
                    .value()
                    .config()
                    .bound_subjects()
                    .iter()
                    .any(|pattern| subject_matches_pattern(subject, pattern))
            })
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                jetstream_error!(ErrorKind::NoInterest, "no stream bound to subject '{subject}'")
            })
    }

    /// Publish a payload
    pub async fn publish(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> JetStreamResult<PublishAck> {
        self.publish_message(Message::new(subject, payload), PublishOptions::default())
            .await
    }

    /// Publish a message with headers and expectations
    pub async fn publish_message(
        &self,
        message: Message,
        options: PublishOptions,
    ) -> JetStreamResult<PublishAck> {
        let stream = self.route(&message.subject)?;
        stream.store_message(message, &options).await
    }

    /// Create a key-value bucket
    pub async fn create_key_value(&self, config: KeyValueConfig) -> JetStreamResult<KeyValue> {
        let stream = self.create_stream(config.stream_config()?).await?;
        Ok(KeyValue::new(self.clone(), config.bucket, stream))
    }

    /// Open an existing key-value bucket
    pub fn key_value(&self, bucket: &str) -> JetStreamResult<KeyValue> {
        let stream = self
            .stream(&KeyValueConfig::stream_name(bucket))
            .map_err(|_| bucket_not_found(bucket))?;
        Ok(KeyValue::new(self.clone(), bucket.to_string(), stream))
    }

    /// Delete a key-value bucket and all its entries
    pub async fn delete_key_value(&self, bucket: &str) -> JetStreamResult<()> {
        self.delete_stream(&KeyValueConfig::stream_name(bucket))
            .await
            .map_err(|e| if e.is_not_found() { bucket_not_found(bucket) } else { e })
    }

    /// Create an object store bucket
    pub async fn create_object_store(
        &self,
        config: ObjectStoreConfig,
    ) -> JetStreamResult<ObjectStore> {
        let stream = self.create_stream(config.stream_config()?).await?;
        Ok(ObjectStore::new(self.clone(), config.bucket, stream))
    }

    /// Open an existing object store bucket
    pub fn object_store(&self, bucket: &str) -> JetStreamResult<ObjectStore> {
        let stream = self
            .stream(&ObjectStoreConfig::stream_name(bucket))
            .map_err(|_| bucket_not_found(bucket))?;
        Ok(ObjectStore::new(self.clone(), bucket.to_string(), stream))
    }

    /// Delete an object store bucket and all its objects
    pub async fn delete_object_store(&self, bucket: &str) -> JetStreamResult<()> {
        self.delete_stream(&ObjectStoreConfig::stream_name(bucket))
            .await
            .map_err(|e| if e.is_not_found() { bucket_not_found(bucket) } else { e })
    }
}

fn bucket_not_found(bucket: &str) -> Error {
    jetstream_error!(ErrorKind::BucketNotFound, "bucket '{bucket}' not found")
}

async fn run_sweeper(engine: Weak<EngineInner>, token: CancellationToken, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                let streams: Vec<Stream> = inner
                    .streams
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                drop(inner);

                for stream in streams {
                    stream.sweep().await;
                }
            }
            () = token.cancelled() => {
                debug!("Maintenance sweep cancelled");
                break;
            }
        }
    }
}
