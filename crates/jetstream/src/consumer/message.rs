//! Messages handed out by pull consumers and their acknowledgements

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::consumer::Consumer;
use crate::error::JetStreamResult;

/// Acknowledgement of a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processing finished
    Ack,
    /// Processing finished; the caller waits until the stream applied it
    AckAndConfirm,
    /// Processing failed; redeliver after the optional delay
    Nak(Option<Duration>),
    /// Still working; restart the ack wait
    InProgress,
    /// Never redeliver
    Terminate,
}

/// Delivery metadata of a consumed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Stream the message was read from
    pub stream: String,
    /// Consumer that delivered it
    pub consumer: String,
    /// Stream sequence
    pub stream_sequence: u64,
    /// Consumer sequence, stable across redeliveries
    pub consumer_sequence: u64,
    /// Number of times the message was delivered, including this one
    pub delivered: u64,
    /// Matching messages still waiting to be delivered
    pub pending: u64,
    /// Time the stream stored the message
    pub timestamp: DateTime<Utc>,
}

/// A message delivered by a pull consumer
#[derive(Debug, Clone)]
pub struct JetStreamMessage {
    /// Subject the message was published on
    pub subject: String,
    /// Message payload
    pub payload: Bytes,
    /// Message headers
    pub headers: Vec<(String, String)>,
    /// Delivery metadata
    pub info: DeliveryInfo,
    pub(crate) consumer: Consumer,
}

impl JetStreamMessage {
    /// Get a header value by key
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Acknowledge without waiting for the stream
    pub async fn ack(&self) -> JetStreamResult<()> {
        self.ack_with(AckKind::Ack).await
    }

    /// Acknowledge and wait until the stream confirmed it
    pub async fn double_ack(&self) -> JetStreamResult<()> {
        self.ack_with(AckKind::AckAndConfirm).await
    }

    /// Ask for immediate redelivery
    pub async fn nak(&self) -> JetStreamResult<()> {
        self.ack_with(AckKind::Nak(None)).await
    }

    /// Ask for redelivery after a delay
    pub async fn nak_with_delay(&self, delay: Duration) -> JetStreamResult<()> {
        self.ack_with(AckKind::Nak(Some(delay))).await
    }

    /// Extend the ack wait
    pub async fn in_progress(&self) -> JetStreamResult<()> {
        self.ack_with(AckKind::InProgress).await
    }

    /// Stop redelivering this message
    pub async fn term(&self) -> JetStreamResult<()> {
        self.ack_with(AckKind::Terminate).await
    }

    /// Send any acknowledgement kind
    pub async fn ack_with(&self, kind: AckKind) -> JetStreamResult<()> {
        self.consumer.ack(self.info.stream_sequence, kind).await
    }
}
