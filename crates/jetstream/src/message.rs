//! Message types for publishing and storage

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed per-message overhead counted against byte limits
pub const MESSAGE_OVERHEAD: u64 = 16;

/// A message on its way into a stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Subject the message is published on
    pub subject: String,
    /// Message payload
    pub payload: Bytes,
    /// Message headers as ordered key-value pairs
    pub headers: Vec<(String, String)>,
}

impl Message {
    /// Create a new message with just a payload
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    /// Add a header to the message
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Get a header value by key
    pub fn get_header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }
}

/// A message as held by a stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    /// Stream sequence
    pub sequence: u64,
    /// Subject the message was published on
    pub subject: String,
    /// Message payload
    pub payload: Bytes,
    /// Message headers as ordered key-value pairs
    pub headers: Vec<(String, String)>,
    /// Time the stream accepted the message
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    /// Get a header value by key
    pub fn get_header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }

    /// Size counted against stream byte limits and fetch max bytes
    pub fn size(&self) -> u64 {
        message_size(&self.subject, &self.headers, &self.payload)
    }
}

pub(crate) fn message_size(subject: &str, headers: &[(String, String)], payload: &[u8]) -> u64 {
    let header_bytes: usize = headers.iter().map(|(k, v)| k.len() + v.len()).sum();
    (subject.len() + header_bytes + payload.len()) as u64 + MESSAGE_OVERHEAD
}

fn find_header<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .rev()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Well-known header names
pub mod headers {
    /// Operation marker written by the key-value view
    pub const KV_OPERATION: &str = "KV-Operation";
    /// `KV-Operation` value of a delete tombstone
    pub const KV_OPERATION_DEL: &str = "DEL";
    /// `KV-Operation` value of a purge marker
    pub const KV_OPERATION_PURGE: &str = "PURGE";
    /// Content type of the payload
    pub const CONTENT_TYPE: &str = "Content-Type";
}
