//! Pull consumers
//!
//! A consumer is a cursor over one stream. Pull requests wait on the
//! consumer's [`Notify`] until a message becomes deliverable, a redelivery
//! deadline passes, or the request expires. Acknowledgements are queued to
//! the owning stream, which applies them together with retention.

pub mod config;
pub mod message;
pub mod push;
pub(crate) mod state;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream as FuturesStream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, ErrorKind, JetStreamResult};
use crate::jetstream_error;
use crate::stream::Stream;
use crate::stream::store::MessageStore;

use self::config::{ConsumerConfig, ConsumerInfo};
use self::message::{AckKind, DeliveryInfo, JetStreamMessage};
use self::state::{ConsumerState, Delivery};

/// Shared state of a consumer, owned by its stream
#[derive(Debug)]
pub(crate) struct ConsumerInner {
    pub(crate) name: String,
    pub(crate) stream_name: String,
    pub(crate) created: DateTime<Utc>,
    pub(crate) state: Mutex<ConsumerState>,
    pub(crate) notify: Notify,
    pub(crate) deleted: AtomicBool,
    pub(crate) bound: AtomicBool,
}

impl ConsumerInner {
    pub(crate) fn new(
        name: String,
        stream_name: String,
        state: ConsumerState,
    ) -> Self {
        Self {
            name,
            stream_name,
            created: Utc::now(),
            state: Mutex::new(state),
            notify: Notify::new(),
            deleted: AtomicBool::new(false),
            bound: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Flag the consumer as gone and wake its pull requests
    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    /// Claim the single push binding of the consumer
    pub(crate) fn try_bind(&self) -> bool {
        self.bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the push binding; inactivity counts from now
    pub(crate) fn unbind(&self) {
        self.state.lock().touch(Instant::now());
        self.bound.store(false, Ordering::Release);
    }

    pub(crate) fn info(&self, store: &MessageStore) -> ConsumerInfo {
        let state = self.state.lock();
        ConsumerInfo {
            stream_name: self.stream_name.clone(),
            name: self.name.clone(),
            config: state.config().clone(),
            created: self.created,
            delivered: state.delivered(),
            ack_floor: state.ack_floor(),
            num_ack_pending: state.num_ack_pending(),
            num_redelivered: state.num_redelivered(),
            num_waiting: state.num_waiting(),
            num_pending: state.num_pending(store),
            push_bound: self.is_bound(),
        }
    }
}

/// A pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// Maximum number of messages to return
    pub batch: usize,
    /// Maximum total size of the returned messages
    pub max_bytes: Option<usize>,
    /// How long to wait for messages; the engine default when unset
    pub expires: Option<Duration>,
    /// Return immediately, even with nothing to deliver
    pub no_wait: bool,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self::new(1)
    }
}

impl FetchRequest {
    /// Request up to `batch` messages
    pub fn new(batch: usize) -> Self {
        Self {
            batch,
            max_bytes: None,
            expires: None,
            no_wait: false,
        }
    }

    /// Limit the total size of the batch
    #[must_use]
    pub fn max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Set how long the request waits
    #[must_use]
    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Do not wait for messages
    #[must_use]
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    fn validate(&self, config: &ConsumerConfig) -> JetStreamResult<()> {
        if self.batch == 0 {
            return Err(Error::invalid_config("batch must be positive"));
        }
        if let Some(max) = config.max_batch {
            if self.batch > max {
                return Err(jetstream_error!(
                    ErrorKind::ExceededMaxBatch,
                    "batch {} exceeds max batch {max}",
                    self.batch
                ));
            }
        }
        if let (Some(max), Some(requested)) = (config.max_bytes, self.max_bytes) {
            if requested > max {
                return Err(jetstream_error!(
                    ErrorKind::ExceededMaxRequestMaxBytes,
                    "max bytes {requested} exceeds consumer limit {max}"
                ));
            }
        }
        if !self.no_wait {
            if let (Some(max), Some(requested)) = (config.max_expires, self.expires) {
                if requested > max {
                    return Err(jetstream_error!(
                        ErrorKind::ExceededMaxRequestExpires,
                        "expires {requested:?} exceeds consumer limit {max:?}"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Holds a waiting-pull slot for the lifetime of a fetch
struct WaitingGuard<'a> {
    consumer: &'a ConsumerInner,
}

impl<'a> WaitingGuard<'a> {
    fn acquire(consumer: &'a ConsumerInner) -> JetStreamResult<Self> {
        if !consumer.state.lock().try_add_waiting(Instant::now()) {
            return Err(jetstream_error!(
                ErrorKind::ExceededMaxWaiting,
                "consumer '{}' has reached max waiting",
                consumer.name
            ));
        }
        Ok(Self { consumer })
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.consumer.state.lock().remove_waiting(Instant::now());
    }
}

/// Handle to a pull consumer
#[derive(Debug, Clone)]
pub struct Consumer {
    pub(crate) inner: Arc<ConsumerInner>,
    pub(crate) stream: Stream,
}

impl Consumer {
    /// Consumer name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Name of the stream the consumer reads
    pub fn stream_name(&self) -> &str {
        &self.inner.stream_name
    }

    /// Current configuration
    pub fn config(&self) -> ConsumerConfig {
        self.inner.state.lock().config().clone()
    }

    /// Pull a batch of messages
    ///
    /// Waits until at least one message is deliverable or the request
    /// expires; an expired request returns whatever was collected, possibly
    /// nothing.
    pub async fn fetch(&self, request: FetchRequest) -> JetStreamResult<Vec<JetStreamMessage>> {
        let config = self.config();
        request.validate(&config)?;

        let _waiting = WaitingGuard::acquire(&self.inner)?;

        let default_expires = self.stream.inner.engine_config.default_fetch_expires;
        let expires = request.expires.unwrap_or_else(|| {
            config
                .max_expires
                .map_or(default_expires, |max| max.min(default_expires))
        });
        let deadline = state::deadline_after(Instant::now(), expires);

        loop {
            if self.inner.is_deleted() {
                return Err(Error::consumer_not_found(&self.inner.name));
            }

            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (messages, next_deadline) = self.collect(&request).await?;
            if !messages.is_empty() || request.no_wait || Instant::now() >= deadline {
                return Ok(messages);
            }

            let wake = next_deadline.map_or(deadline, |redeliver| redeliver.min(deadline));
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Pull whatever is deliverable right now
    pub async fn fetch_no_wait(&self, batch: usize) -> JetStreamResult<Vec<JetStreamMessage>> {
        self.fetch(FetchRequest::new(batch).no_wait()).await
    }

    /// Pull a single message, waiting up to the default expiry
    pub async fn next(&self) -> JetStreamResult<Option<JetStreamMessage>> {
        Ok(self.fetch(FetchRequest::new(1)).await?.into_iter().next())
    }

    /// Endless iterator over the consumer, one pull at a time
    ///
    /// Ends after yielding the first error, e.g. once the consumer is deleted.
    pub fn messages(
        &self,
    ) -> Pin<Box<dyn FuturesStream<Item = JetStreamResult<JetStreamMessage>> + Send>> {
        let consumer = self.clone();
        Box::pin(async_stream::stream! {
            loop {
                match consumer.fetch(FetchRequest::new(1)).await {
                    Ok(batch) => {
                        for message in batch {
                            yield Ok(message);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }

    /// Acknowledge a stream sequence delivered by this consumer
    pub async fn ack(&self, sequence: u64, kind: AckKind) -> JetStreamResult<()> {
        if self.inner.is_deleted() {
            return Err(Error::consumer_not_found(&self.inner.name));
        }
        self.stream.submit_ack(&self.inner, sequence, kind).await
    }

    /// Consumer information
    pub async fn info(&self) -> JetStreamResult<ConsumerInfo> {
        if self.inner.is_deleted() {
            return Err(Error::consumer_not_found(&self.inner.name));
        }
        let store = self.stream.inner.store.read().await;
        Ok(self.inner.info(&store))
    }

    async fn collect(
        &self,
        request: &FetchRequest,
    ) -> JetStreamResult<(Vec<JetStreamMessage>, Option<Instant>)> {
        let mut store = self.stream.inner.store.write().await;
        let mut removed = self.stream.expire_locked(&mut store);

        let (collected, pending, next_deadline) = {
            let mut state = self.inner.state.lock();
            let collected = state.collect(&store, request.batch, request.max_bytes, Instant::now());
            (collected, state.num_pending(&store), state.next_deadline())
        };

        removed.extend(self.stream.release_locked(&mut store, &collected.settled));
        self.stream.persist_removals(&store, &removed).await;
        drop(store);

        if collected.deliveries.is_empty() {
            if let Some(size) = collected.oversized {
                return Err(jetstream_error!(
                    ErrorKind::MessageSizeExceedsMaxBytes,
                    "next message of {size} bytes exceeds request max bytes"
                ));
            }
        }

        if !collected.deliveries.is_empty() {
            debug!(
                "Consumer {} on {} delivering {} messages",
                self.inner.name,
                self.inner.stream_name,
                collected.deliveries.len()
            );
        }

        let messages = collected
            .deliveries
            .into_iter()
            .map(|delivery| self.to_message(delivery, pending))
            .collect();
        Ok((messages, next_deadline))
    }

    fn to_message(&self, delivery: Delivery, pending: u64) -> JetStreamMessage {
        let Delivery {
            message,
            consumer_sequence,
            deliveries,
        } = delivery;
        JetStreamMessage {
            subject: message.subject,
            payload: message.payload,
            headers: message.headers,
            info: DeliveryInfo {
                stream: self.inner.stream_name.clone(),
                consumer: self.inner.name.clone(),
                stream_sequence: message.sequence,
                consumer_sequence,
                delivered: deliveries,
                pending,
                timestamp: message.timestamp,
            },
            consumer: self.clone(),
        }
    }
}
