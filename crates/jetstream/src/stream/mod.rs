//! Streams: ordered message logs with retention and consumers
//!
//! Every stream owns one [`MessageStore`] behind a tokio `RwLock`. Appends,
//! removals, deliveries and acknowledgements take the write lock; reads take
//! the read lock. Consumer state is only locked while the store lock is
//! held, never the other way round.

pub mod config;
pub(crate) mod persistence;
pub(crate) mod retention;
pub(crate) mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, SubsecRound, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::consumer::config::{AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy};
use crate::consumer::message::AckKind;
use crate::consumer::state::ConsumerState;
use crate::consumer::{Consumer, ConsumerInner};
use crate::error::{Error, ErrorKind, JetStreamResult};
use crate::jetstream_error;
use crate::message::{Message, StoredMessage};
use crate::subject::{
    pattern_is_subset, patterns_overlap, subject_matches_pattern, validate_subject,
    validate_subject_pattern,
};
use crate::watch::{MessageFeed, WatchStart};

use self::config::{
    PublishAck, PublishOptions, PurgeRequest, RetentionPolicy, StreamConfig, StreamInfo,
};
use self::persistence::StreamPersistence;
use self::store::MessageStore;

/// Acknowledgement queued to a stream's ack processor
pub(crate) struct AckRequest {
    consumer: Arc<ConsumerInner>,
    sequence: u64,
    kind: AckKind,
    confirm: Option<oneshot::Sender<JetStreamResult<()>>>,
}

#[derive(Debug)]
pub(crate) struct StreamInner {
    pub(crate) name: String,
    pub(crate) config: parking_lot::RwLock<StreamConfig>,
    pub(crate) created: DateTime<Utc>,
    pub(crate) engine_config: Arc<EngineConfig>,
    pub(crate) store: RwLock<MessageStore>,
    pub(crate) persistence: StreamPersistence,
    pub(crate) consumers: DashMap<String, Arc<ConsumerInner>>,
    events: broadcast::Sender<StoredMessage>,
    ack_tx: mpsc::UnboundedSender<AckRequest>,
    deleted: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertMode {
    Create,
    Update,
    CreateOrUpdate,
}

/// Handle to a stream
#[derive(Debug, Clone)]
pub struct Stream {
    pub(crate) inner: Arc<StreamInner>,
}

impl std::fmt::Debug for AckRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckRequest")
            .field("consumer", &self.consumer.name)
            .field("sequence", &self.sequence)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// Open a stream, recovering persisted messages
    pub(crate) async fn open(
        config: StreamConfig,
        engine_config: Arc<EngineConfig>,
        persistence: StreamPersistence,
    ) -> JetStreamResult<Self> {
        let recovered = persistence.recover().await?;
        let mut store = MessageStore::restore(recovered.messages, recovered.watermark);

        let mut removed = retention::expire(&mut store, &config, Utc::now());
        removed.extend(retention::enforce_limits(&mut store, &config, None));
        if config.retention == RetentionPolicy::Interest {
            removed.extend(retention::release_unclaimed(&mut store, |_, _| false));
        }
        persistence.remove(&removed, &store).await?;

        if store.len() > 0 {
            info!(
                "Recovered stream {} with {} messages (sequences {}..={})",
                config.name,
                store.len(),
                store.first_seq(),
                store.last_seq()
            );
        }

        let (events, _) = broadcast::channel(engine_config.watch_buffer.max(1));
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(StreamInner {
            name: config.name.clone(),
            config: parking_lot::RwLock::new(config),
            created: Utc::now(),
            engine_config,
            store: RwLock::new(store),
            persistence,
            consumers: DashMap::new(),
            events,
            ack_tx,
            deleted: AtomicBool::new(false),
        });

        tokio::spawn(run_ack_processor(Arc::downgrade(&inner), ack_rx));

        Ok(Self { inner })
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current configuration
    pub fn config(&self) -> StreamConfig {
        self.inner.config.read().clone()
    }

    fn ensure_live(&self) -> JetStreamResult<()> {
        if self.inner.deleted.load(Ordering::Acquire) {
            return Err(Error::stream_not_found(&self.inner.name));
        }
        Ok(())
    }

    /// Store a message routed to this stream
    pub(crate) async fn store_message(
        &self,
        message: Message,
        options: &PublishOptions,
    ) -> JetStreamResult<PublishAck> {
        self.ensure_live()?;
        if let Some(expected) = &options.expected_stream {
            if expected != &self.inner.name {
                return Err(jetstream_error!(
                    ErrorKind::StreamMismatch,
                    "expected stream '{expected}', message routed to '{}'",
                    self.inner.name
                ));
            }
        }

        let config = self.config();
        let max_payload = self.inner.engine_config.max_payload;
        let now = Utc::now().trunc_subsecs(6);

        let mut store = self.inner.store.write().await;
        self.ensure_live()?;
        let expired = retention::expire(&mut store, &config, now);
        self.persist_removals(&store, &expired).await;

        let stored = store.prepare(&config, message, options, max_payload, now)?;
        let sequence = stored.sequence;
        self.inner.persistence.append(&stored).await?;
        store.commit(stored.clone());

        let mut removed =
            retention::enforce_limits(&mut store, &config, Some(stored.subject.as_str()));
        if config.retention == RetentionPolicy::Interest {
            removed.extend(self.release_locked(&mut store, &[sequence]));
        }
        self.persist_removals(&store, &removed).await;

        debug!(
            "Stored message {} on {} in stream {}",
            sequence, stored.subject, self.inner.name
        );
        if store.get(sequence).is_some() {
            // No receivers is not an error
            let _ = self.inner.events.send(stored);
        }
        drop(store);

        self.notify_consumers();
        Ok(PublishAck {
            stream: self.inner.name.clone(),
            sequence,
        })
    }

    /// Stream information without per-subject counts
    pub async fn info(&self) -> JetStreamResult<StreamInfo> {
        self.build_info(None).await
    }

    /// Stream information with message counts of subjects matching `filter`
    pub async fn info_with_subjects(&self, filter: &str) -> JetStreamResult<StreamInfo> {
        validate_subject_pattern(filter)?;
        self.build_info(Some(filter)).await
    }

    async fn build_info(&self, filter: Option<&str>) -> JetStreamResult<StreamInfo> {
        self.ensure_live()?;
        self.evict_expired().await;

        let store = self.inner.store.read().await;
        let mut state = store.state(filter);
        state.consumer_count = self.inner.consumers.len();

        Ok(StreamInfo {
            config: self.config(),
            created: self.inner.created,
            state,
        })
    }

    /// Get a stored message by sequence
    pub async fn get_message(&self, sequence: u64) -> JetStreamResult<StoredMessage> {
        self.ensure_live()?;
        self.evict_expired().await;

        let store = self.inner.store.read().await;
        store
            .get(sequence)
            .cloned()
            .ok_or_else(|| Error::message_not_found(sequence))
    }

    /// Get the newest stored message of a subject
    pub async fn get_last_message_for_subject(
        &self,
        subject: &str,
    ) -> JetStreamResult<StoredMessage> {
        self.ensure_live()?;
        validate_subject(subject)?;
        self.evict_expired().await;

        let store = self.inner.store.read().await;
        store.last_for_subject(subject).cloned().ok_or_else(|| {
            jetstream_error!(
                ErrorKind::MessageNotFound,
                "no message for subject '{subject}' in stream '{}'",
                self.inner.name
            )
        })
    }

    /// Every stored message whose subject matches `filter`, oldest first
    pub async fn messages_matching(&self, filter: &str) -> JetStreamResult<Vec<StoredMessage>> {
        self.ensure_live()?;
        validate_subject_pattern(filter)?;
        self.evict_expired().await;

        let store = self.inner.store.read().await;
        Ok(store
            .range_from(0)
            .filter(|message| subject_matches_pattern(&message.subject, filter))
            .cloned()
            .collect())
    }

    /// The newest message of every subject matching `filter`
    pub async fn last_messages_per_subject(
        &self,
        filter: &str,
    ) -> JetStreamResult<Vec<StoredMessage>> {
        self.ensure_live()?;
        validate_subject_pattern(filter)?;
        self.evict_expired().await;

        let store = self.inner.store.read().await;
        Ok(store
            .last_per_subject(filter)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Remove a single message
    pub async fn delete_message(&self, sequence: u64) -> JetStreamResult<()> {
        self.ensure_live()?;

        let mut store = self.inner.store.write().await;
        self.ensure_live()?;
        if store.remove(sequence).is_none() {
            return Err(Error::message_not_found(sequence));
        }
        self.inner
            .persistence
            .remove(&[sequence], &store)
            .await?;

        debug!("Deleted message {} from stream {}", sequence, self.inner.name);
        Ok(())
    }

    /// Remove the messages selected by `request`, returning how many went
    pub async fn purge(&self, request: PurgeRequest) -> JetStreamResult<u64> {
        self.ensure_live()?;
        if let Some(filter) = &request.filter {
            validate_subject_pattern(filter)?;
        }

        let mut store = self.inner.store.write().await;
        self.ensure_live()?;
        let purged = store.purge(&request)?;
        self.inner
            .persistence
            .remove(&purged, &store)
            .await?;
        drop(store);

        info!("Purged {} messages from stream {}", purged.len(), self.inner.name);
        self.notify_consumers();
        Ok(purged.len() as u64)
    }

    /// Follow messages matching `filter`
    pub async fn watch(&self, filter: &str, start: WatchStart) -> JetStreamResult<MessageFeed> {
        self.ensure_live()?;
        validate_subject_pattern(filter)?;
        self.evict_expired().await;

        let (snapshot, mut receiver, high) = {
            let store = self.inner.store.read().await;
            let receiver = self.inner.events.subscribe();
            let snapshot: Vec<StoredMessage> = match start {
                WatchStart::New => Vec::new(),
                WatchStart::LastPerSubject => store
                    .last_per_subject(filter)
                    .into_iter()
                    .cloned()
                    .collect(),
                WatchStart::All => store
                    .range_from(0)
                    .filter(|message| subject_matches_pattern(&message.subject, filter))
                    .cloned()
                    .collect(),
            };
            (snapshot, receiver, store.last_seq())
        };

        let filter = filter.to_string();
        let stream_name = self.inner.name.clone();
        Ok(Box::pin(async_stream::stream! {
            for message in snapshot {
                yield message;
            }
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if message.sequence > high
                            && subject_matches_pattern(&message.subject, &filter)
                        {
                            yield message;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Watcher on stream {} lagged, skipped {} messages", stream_name, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Create a consumer; an identical existing consumer is returned as is
    pub async fn create_consumer(&self, config: ConsumerConfig) -> JetStreamResult<Consumer> {
        self.upsert_consumer(config, UpsertMode::Create).await
    }

    /// Update an existing consumer
    pub async fn update_consumer(&self, config: ConsumerConfig) -> JetStreamResult<Consumer> {
        self.upsert_consumer(config, UpsertMode::Update).await
    }

    /// Create a consumer or update it when it exists
    pub async fn create_or_update_consumer(
        &self,
        config: ConsumerConfig,
    ) -> JetStreamResult<Consumer> {
        self.upsert_consumer(config, UpsertMode::CreateOrUpdate)
            .await
    }

    async fn upsert_consumer(
        &self,
        config: ConsumerConfig,
        mode: UpsertMode,
    ) -> JetStreamResult<Consumer> {
        self.ensure_live()?;
        config.validate()?;

        let stream_config = self.config();
        if let Some(filter) = &config.filter_subject {
            let bound = stream_config
                .bound_subjects()
                .iter()
                .any(|subject| pattern_is_subset(filter, subject));
            if !bound {
                return Err(jetstream_error!(
                    ErrorKind::InvalidFilter,
                    "filter '{filter}' is not a subset of the subjects of stream '{}'",
                    self.inner.name
                ));
            }
        }

        let work_queue = stream_config.retention == RetentionPolicy::WorkQueue;
        if work_queue {
            if config.ack_policy == AckPolicy::None {
                return Err(Error::invalid_config(
                    "work queue consumers must acknowledge messages",
                ));
            }
            if config.deliver_policy != DeliverPolicy::All {
                return Err(Error::invalid_config(
                    "work queue consumers must deliver all messages",
                ));
            }
        }

        let name = config
            .explicit_name()
            .map_or_else(|| Uuid::new_v4().simple().to_string(), str::to_string);
        let mut config = config;
        config.name = Some(name.clone());

        let mut store = self.inner.store.write().await;
        self.ensure_live()?;
        let existing = self
            .inner
            .consumers
            .get(&name)
            .map(|entry| Arc::clone(entry.value()));

        let Some(existing) = existing else {
            if mode == UpsertMode::Update {
                return Err(Error::consumer_not_found(&name));
            }

            let resolved = config.with_defaults(&self.inner.engine_config);
            if work_queue {
                self.check_work_queue_overlap(&name, resolved.filter_subject.as_deref())?;
            }

            let durable = resolved.is_durable();
            let state = ConsumerState::new(resolved, &store, Instant::now());
            let consumer = Arc::new(ConsumerInner::new(
                name.clone(),
                self.inner.name.clone(),
                state,
            ));
            self.inner.consumers.insert(name.clone(), Arc::clone(&consumer));

            info!(
                "Created {} consumer {} on stream {}",
                if durable { "durable" } else { "ephemeral" },
                name,
                self.inner.name
            );
            return Ok(Consumer {
                inner: consumer,
                stream: self.clone(),
            });
        };

        let current = existing.state.lock().config().clone();
        if config.max_waiting.is_none() {
            config.max_waiting = current.max_waiting;
        }
        let resolved = config.with_defaults(&self.inner.engine_config);

        if resolved == current {
            return Ok(Consumer {
                inner: existing,
                stream: self.clone(),
            });
        }
        if mode == UpsertMode::Create {
            return Err(jetstream_error!(
                ErrorKind::ConsumerNameInUse,
                "consumer '{name}' already exists with a different configuration"
            ));
        }

        if resolved.max_waiting != current.max_waiting {
            return Err(jetstream_error!(
                ErrorKind::MaxWaitingImmutable,
                "max waiting of consumer '{name}' cannot be changed"
            ));
        }
        if resolved.ack_policy != current.ack_policy
            || resolved.deliver_policy != current.deliver_policy
            || resolved.durable_name != current.durable_name
        {
            return Err(jetstream_error!(
                ErrorKind::ConsumerUpdate,
                "ack policy, deliver policy and durability of consumer '{name}' cannot be changed"
            ));
        }
        if work_queue {
            self.check_work_queue_overlap(&name, resolved.filter_subject.as_deref())?;
        }

        existing.state.lock().set_config(resolved);
        if stream_config.retention == RetentionPolicy::Interest {
            let removed =
                retention::release_unclaimed(&mut store, |sequence, subject| {
                    self.is_needed(sequence, subject)
                });
            self.persist_removals(&store, &removed).await;
        }
        drop(store);

        existing.notify.notify_waiters();
        info!("Updated consumer {} on stream {}", name, self.inner.name);
        Ok(Consumer {
            inner: existing,
            stream: self.clone(),
        })
    }

    fn check_work_queue_overlap(&self, name: &str, filter: Option<&str>) -> JetStreamResult<()> {
        let filter = filter.unwrap_or(">");
        for entry in &self.inner.consumers {
            if entry.key() == name {
                continue;
            }
            let other = entry.value().state.lock().config().filter_subject.clone();
            let other = other.as_deref().unwrap_or(">");
            if patterns_overlap(filter, other) {
                return Err(jetstream_error!(
                    ErrorKind::OverlappingConsumer,
                    "filter '{filter}' overlaps consumer '{}' ('{other}') on work queue stream '{}'",
                    entry.key(),
                    self.inner.name
                ));
            }
        }
        Ok(())
    }

    /// Look up a consumer by name
    pub fn consumer(&self, name: &str) -> JetStreamResult<Consumer> {
        self.ensure_live()?;
        self.inner
            .consumers
            .get(name)
            .map(|entry| Consumer {
                inner: Arc::clone(entry.value()),
                stream: self.clone(),
            })
            .ok_or_else(|| Error::consumer_not_found(name))
    }

    /// Delete a consumer, releasing messages only it still needed
    pub async fn delete_consumer(&self, name: &str) -> JetStreamResult<()> {
        self.ensure_live()?;

        let mut store = self.inner.store.write().await;
        self.ensure_live()?;
        let Some((_, consumer)) = self.inner.consumers.remove(name) else {
            return Err(Error::consumer_not_found(name));
        };
        consumer.mark_deleted();

        let policy = self.inner.config.read().retention;
        if policy == RetentionPolicy::Interest {
            let removed = retention::release_unclaimed(&mut store, |sequence, subject| {
                self.is_needed(sequence, subject)
            });
            self.persist_removals(&store, &removed).await;
        }

        info!("Deleted consumer {} from stream {}", name, self.inner.name);
        Ok(())
    }

    /// Names of all consumers, sorted
    pub fn consumer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .consumers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Information about every consumer, sorted by name
    pub async fn consumers(&self) -> JetStreamResult<Vec<ConsumerInfo>> {
        self.ensure_live()?;

        let store = self.inner.store.read().await;
        let mut infos: Vec<ConsumerInfo> = self
            .inner
            .consumers
            .iter()
            .map(|entry| entry.value().info(&store))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    pub(crate) async fn submit_ack(
        &self,
        consumer: &Arc<ConsumerInner>,
        sequence: u64,
        kind: AckKind,
    ) -> JetStreamResult<()> {
        let (confirm, confirmation) = if kind == AckKind::AckAndConfirm {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.inner
            .ack_tx
            .send(AckRequest {
                consumer: Arc::clone(consumer),
                sequence,
                kind,
                confirm,
            })
            .map_err(|_| {
                Error::internal(format!(
                    "ack processor of stream '{}' stopped",
                    self.inner.name
                ))
            })?;

        match confirmation {
            Some(confirmation) => confirmation.await?,
            None => Ok(()),
        }
    }

    async fn process_ack(
        &self,
        consumer: &ConsumerInner,
        sequence: u64,
        kind: AckKind,
    ) -> JetStreamResult<()> {
        let mut store = self.inner.store.write().await;
        self.ensure_live()?;
        if consumer.is_deleted() {
            return Err(Error::consumer_not_found(&consumer.name));
        }

        let settled = consumer
            .state
            .lock()
            .apply_ack(sequence, kind, Instant::now());
        let removed = self.release_locked(&mut store, &settled);
        self.persist_removals(&store, &removed).await;
        drop(store);

        debug!(
            "Applied {:?} for {} on consumer {} (settled {}, removed {})",
            kind,
            sequence,
            consumer.name,
            settled.len(),
            removed.len()
        );
        consumer.notify.notify_waiters();
        Ok(())
    }

    /// Whether any consumer still has to deliver or see an ack for a message
    fn is_needed(&self, sequence: u64, subject: &str) -> bool {
        self.inner
            .consumers
            .iter()
            .any(|entry| entry.value().state.lock().needs_ack(sequence, subject))
    }

    /// Apply retention to sequences whose delivery obligations were settled
    pub(crate) fn release_locked(&self, store: &mut MessageStore, candidates: &[u64]) -> Vec<u64> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let policy = self.inner.config.read().retention;
        retention::release(store, policy, candidates, |sequence, subject| {
            self.is_needed(sequence, subject)
        })
    }

    pub(crate) fn expire_locked(&self, store: &mut MessageStore) -> Vec<u64> {
        let config = self.inner.config.read();
        retention::expire(store, &config, Utc::now())
    }

    /// Drop messages past the max age, when the stream has one
    pub(crate) async fn evict_expired(&self) {
        let has_max_age = self.inner.config.read().max_age.is_some();
        if !has_max_age {
            return;
        }
        let mut store = self.inner.store.write().await;
        if self.ensure_live().is_err() {
            return;
        }
        let removed = self.expire_locked(&mut store);
        self.persist_removals(&store, &removed).await;
    }

    /// Mirror removals into the persistence backend
    ///
    /// The index already dropped the messages, so a failure only leaves
    /// stale entries behind that the next recovery prunes again.
    pub(crate) async fn persist_removals(&self, store: &MessageStore, removed: &[u64]) {
        if removed.is_empty() {
            return;
        }
        if let Err(e) = self
            .inner
            .persistence
            .remove(removed, store)
            .await
        {
            warn!(
                "Failed to remove {} messages of stream {} from storage: {}",
                removed.len(),
                self.inner.name,
                e
            );
        }
    }

    fn notify_consumers(&self) {
        for entry in &self.inner.consumers {
            entry.value().notify.notify_waiters();
        }
    }

    /// Replace the configuration and prune to the new limits
    pub(crate) async fn update_config(&self, config: StreamConfig) -> JetStreamResult<()> {
        let mut store = self.inner.store.write().await;
        self.ensure_live()?;
        let mut removed = retention::expire(&mut store, &config, Utc::now());
        removed.extend(retention::enforce_limits(&mut store, &config, None));
        *self.inner.config.write() = config;
        self.persist_removals(&store, &removed).await;
        drop(store);

        if !removed.is_empty() {
            info!(
                "Pruned {} messages from stream {} after update",
                removed.len(),
                self.inner.name
            );
        }
        self.notify_consumers();
        Ok(())
    }

    /// Flag the stream and its consumers as gone and drop persisted messages
    ///
    /// Runs under the store write lock, so every mutation queued behind it
    /// observes the flag and fails with `StreamNotFound`.
    pub(crate) async fn destroy(&self) -> JetStreamResult<()> {
        let mut store = self.inner.store.write().await;
        self.inner.deleted.store(true, Ordering::Release);
        for entry in &self.inner.consumers {
            entry.value().mark_deleted();
        }
        self.inner.consumers.clear();
        *store = MessageStore::new();
        self.inner.persistence.destroy().await
    }

    /// Periodic maintenance: age eviction and inactive consumer removal
    pub(crate) async fn sweep(&self) {
        if self.inner.deleted.load(Ordering::Acquire) {
            return;
        }
        self.evict_expired().await;

        let now = Instant::now();
        let inactive: Vec<String> = self
            .inner
            .consumers
            .iter()
            .filter(|entry| {
                let consumer = entry.value();
                !consumer.is_bound() && consumer.state.lock().is_inactive(now)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for name in inactive {
            warn!(
                "Removing inactive consumer {} from stream {}",
                name, self.inner.name
            );
            if let Err(e) = self.delete_consumer(&name).await {
                debug!("Inactive consumer {} already gone: {}", name, e);
            }
        }
    }
}

async fn run_ack_processor(
    stream: Weak<StreamInner>,
    mut requests: mpsc::UnboundedReceiver<AckRequest>,
) {
    while let Some(request) = requests.recv().await {
        let Some(inner) = stream.upgrade() else {
            break;
        };
        let stream = Stream { inner };
        let result = stream
            .process_ack(&request.consumer, request.sequence, request.kind)
            .await;

        match request.confirm {
            Some(confirm) => {
                let _ = confirm.send(result);
            }
            None => {
                if let Err(e) = result {
                    debug!("Dropped ack for {}: {}", request.sequence, e);
                }
            }
        }
    }
}
