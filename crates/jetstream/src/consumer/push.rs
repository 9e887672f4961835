//! Push delivery
//!
//! A push subscription binds to a consumer while a background task pulls on
//! its behalf and queues the messages for the subscriber. A consumer has at
//! most one bound subscription, and a bound consumer is never reaped for
//! inactivity. Flow control is the consumer's own: with `max_ack_pending`
//! reached the task stops pulling until messages are acknowledged.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream as FuturesStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, ErrorKind, JetStreamResult};
use crate::jetstream_error;

use super::message::JetStreamMessage;
use super::{Consumer, FetchRequest};

/// Largest batch the delivery task pulls at once
const PUSH_BATCH: usize = 256;

#[derive(Debug, Default)]
struct Queued {
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl Queued {
    fn add(&self, message: &JetStreamMessage) {
        self.messages.fetch_add(1, Ordering::AcqRel);
        self.bytes
            .fetch_add(message.payload.len() as u64, Ordering::AcqRel);
    }

    fn take(&self, message: &JetStreamMessage) {
        self.messages.fetch_sub(1, Ordering::AcqRel);
        self.bytes
            .fetch_sub(message.payload.len() as u64, Ordering::AcqRel);
    }
}

/// Messages pushed by a consumer
///
/// Dropping the subscription unbinds it; an ephemeral consumer left unbound
/// is reaped once its inactivity threshold passes.
#[derive(Debug)]
pub struct PushSubscription {
    consumer: Consumer,
    receiver: mpsc::Receiver<JetStreamMessage>,
    queued: Arc<Queued>,
    cancellation_token: CancellationToken,
}

impl Consumer {
    /// Bind a push subscription to this consumer
    pub fn subscribe(&self) -> JetStreamResult<PushSubscription> {
        if self.inner.is_deleted() {
            return Err(Error::consumer_not_found(&self.inner.name));
        }
        if !self.inner.try_bind() {
            return Err(jetstream_error!(
                ErrorKind::ConsumerAlreadyBound,
                "consumer '{}' already has a push subscription",
                self.inner.name
            ));
        }

        let batch = self
            .config()
            .max_batch
            .map_or(PUSH_BATCH, |max| max.min(PUSH_BATCH));
        let (sender, receiver) = mpsc::channel(batch);
        let queued = Arc::new(Queued::default());
        let cancellation_token = CancellationToken::new();

        tokio::spawn(run_delivery(
            self.clone(),
            batch,
            sender,
            Arc::clone(&queued),
            cancellation_token.clone(),
        ));

        debug!(
            "Bound push subscription to consumer {} on {}",
            self.inner.name, self.inner.stream_name
        );
        Ok(PushSubscription {
            consumer: self.clone(),
            receiver,
            queued,
            cancellation_token,
        })
    }
}

impl PushSubscription {
    /// Consumer the subscription is bound to
    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Wait for the next pushed message
    ///
    /// Returns `None` once delivery stopped, e.g. after the consumer was
    /// deleted.
    pub async fn next(&mut self) -> Option<JetStreamMessage> {
        let message = self.receiver.recv().await?;
        self.queued.take(&message);
        Some(message)
    }

    /// Wait up to `timeout` for the next pushed message
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<JetStreamMessage> {
        tokio::time::timeout(timeout, self.next())
            .await
            .ok()
            .flatten()
    }

    /// Messages and payload bytes delivered but not yet taken
    pub fn pending(&self) -> (u64, u64) {
        (
            self.queued.messages.load(Ordering::Acquire),
            self.queued.bytes.load(Ordering::Acquire),
        )
    }

    /// Stop delivery, deleting the consumer when it is ephemeral
    pub async fn unsubscribe(self) -> JetStreamResult<()> {
        self.cancellation_token.cancel();
        if self.consumer.config().is_durable() {
            return Ok(());
        }
        self.consumer
            .stream
            .delete_consumer(self.consumer.name())
            .await
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
        self.consumer.inner.unbind();
    }
}

impl FuturesStream for PushSubscription {
    type Item = JetStreamMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                this.queued.take(&message);
                Poll::Ready(Some(message))
            }
            other => other,
        }
    }
}

async fn run_delivery(
    consumer: Consumer,
    batch: usize,
    sender: mpsc::Sender<JetStreamMessage>,
    queued: Arc<Queued>,
    cancellation_token: CancellationToken,
) {
    loop {
        let fetched = tokio::select! {
            () = cancellation_token.cancelled() => return,
            fetched = consumer.fetch(FetchRequest::new(batch)) => fetched,
        };
        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) => {
                debug!("Push delivery for consumer {} stopped: {}", consumer.name(), e);
                return;
            }
        };

        for message in messages {
            queued.add(&message);
            tokio::select! {
                () = cancellation_token.cancelled() => return,
                sent = sender.send(message) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::EngineConfig;
    use crate::consumer::config::ConsumerConfig;
    use crate::engine::Engine;
    use crate::stream::config::StreamConfig;

    async fn setup() -> (Engine, Consumer) {
        let engine = Engine::new(EngineConfig::default());
        let stream = engine
            .create_stream(StreamConfig::new("EVENTS").with_subjects(["events.>"]))
            .await
            .unwrap();
        let consumer = stream
            .create_consumer(ConsumerConfig::durable("handler"))
            .await
            .unwrap();
        (engine, consumer)
    }

    #[tokio::test]
    async fn test_single_binding_per_consumer() {
        let (_engine, consumer) = setup().await;

        let subscription = consumer.subscribe().unwrap();
        assert!(consumer.info().await.unwrap().push_bound);
        let err = consumer.subscribe().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsumerAlreadyBound);

        drop(subscription);
        assert!(!consumer.info().await.unwrap().push_bound);
        assert!(consumer.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_pending_tracks_queued_messages() {
        let (engine, consumer) = setup().await;
        let mut subscription = consumer.subscribe().unwrap();

        engine.publish("events.1", "abc").await.unwrap();
        engine.publish("events.2", "de").await.unwrap();

        let first = subscription
            .next_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(first.subject, "events.1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(subscription.pending(), (1, 2));
    }
}
