//! Key-value buckets layered on streams
//!
//! A bucket `b` is the stream `KV_b` bound to `$KV.b.>`. Every key is a
//! subject below that prefix and every write is a message, so the revision of
//! an entry is its stream sequence. Deletes and purges are marker messages
//! carrying a `KV-Operation` header.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream as FuturesStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::{Error, ErrorKind, JetStreamResult};
use crate::jetstream_error;
use crate::message::{Message, StoredMessage, headers};
use crate::stream::Stream;
use crate::stream::config::{
    DiscardPolicy, PublishOptions, PurgeRequest, StorageType, StreamConfig,
};
use crate::watch::WatchStart;

/// Largest history a bucket may keep per key
pub const MAX_HISTORY: u64 = 64;

/// Key-value bucket configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueConfig {
    /// Bucket name
    pub bucket: String,
    /// Free-form description
    pub description: Option<String>,
    /// Revisions kept per key
    pub history: u64,
    /// Age after which entries expire
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// Maximum total size of the bucket
    pub max_bytes: Option<u64>,
    /// Largest value accepted
    pub max_value_size: Option<u64>,
    /// Storage of the backing stream
    pub storage: StorageType,
}

impl Default for KeyValueConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            description: None,
            history: 1,
            max_age: None,
            max_bytes: None,
            max_value_size: None,
            storage: StorageType::File,
        }
    }
}

impl KeyValueConfig {
    /// Bucket with default settings
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Set the revisions kept per key
    #[must_use]
    pub fn with_history(mut self, history: u64) -> Self {
        self.history = history;
        self
    }

    /// Name of the stream backing `bucket`
    pub fn stream_name(bucket: &str) -> String {
        format!("KV_{bucket}")
    }

    pub(crate) fn stream_config(&self) -> JetStreamResult<StreamConfig> {
        validate_bucket(&self.bucket)?;
        if self.history == 0 || self.history > MAX_HISTORY {
            return Err(Error::invalid_config(format!(
                "history must be between 1 and {MAX_HISTORY}"
            )));
        }

        Ok(StreamConfig {
            name: Self::stream_name(&self.bucket),
            description: self.description.clone(),
            subjects: vec![format!("$KV.{}.>", self.bucket)],
            storage: self.storage,
            discard: DiscardPolicy::New,
            max_age: self.max_age,
            max_bytes: self.max_bytes,
            max_message_size: self.max_value_size,
            max_messages_per_subject: Some(self.history),
            ..StreamConfig::default()
        })
    }
}

/// Kind of change an entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// A value was written
    Put,
    /// The key was deleted
    Delete,
    /// The key was purged with its history
    Purge,
}

/// One revision of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Bucket name
    pub bucket: String,
    /// Key
    pub key: String,
    /// Value, empty for delete and purge markers
    pub value: Bytes,
    /// Stream sequence of this revision
    pub revision: u64,
    /// Time the revision was written
    pub created: DateTime<Utc>,
    /// Kind of change
    pub operation: Operation,
}

/// Bucket status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueStatus {
    /// Bucket name
    pub bucket: String,
    /// Stored revisions, markers included
    pub values: u64,
    /// Revisions kept per key
    pub history: u64,
    /// Entry expiry
    pub max_age: Option<Duration>,
    /// Size of the backing stream
    pub bytes: u64,
}

/// Handle to a key-value bucket
#[derive(Debug, Clone)]
pub struct KeyValue {
    engine: Engine,
    bucket: String,
    prefix: String,
    stream: Stream,
}

impl KeyValue {
    pub(crate) fn new(engine: Engine, bucket: String, stream: Stream) -> Self {
        Self {
            engine,
            prefix: format!("$KV.{bucket}."),
            bucket,
            stream,
        }
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn subject(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Write a value, returning its revision
    pub async fn put(&self, key: &str, value: impl Into<Bytes>) -> JetStreamResult<u64> {
        validate_key(key)?;
        self.write(Message::new(self.subject(key), value), PublishOptions::default())
            .await
    }

    /// Write a value only if the key has no live value
    pub async fn create(&self, key: &str, value: impl Into<Bytes>) -> JetStreamResult<u64> {
        validate_key(key)?;
        let value = value.into();

        let options = PublishOptions {
            expected_last_subject_sequence: Some(0),
            ..PublishOptions::default()
        };
        match self
            .write(Message::new(self.subject(key), value.clone()), options)
            .await
        {
            Err(e) if e.kind() == ErrorKind::WrongLastSequence => {
                match self.entry(key).await? {
                    Some(entry) if entry.operation != Operation::Put => {
                        self.update(key, value, entry.revision).await
                    }
                    _ => Err(jetstream_error!(
                        ErrorKind::WrongLastSequence,
                        "key '{key}' already exists in bucket '{}'",
                        self.bucket
                    )),
                }
            }
            result => result,
        }
    }

    /// Write a value only if the key is still at `revision`
    pub async fn update(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        revision: u64,
    ) -> JetStreamResult<u64> {
        validate_key(key)?;
        let options = PublishOptions {
            expected_last_subject_sequence: Some(revision),
            ..PublishOptions::default()
        };
        self.write(Message::new(self.subject(key), value), options)
            .await
    }

    async fn write(&self, message: Message, mut options: PublishOptions) -> JetStreamResult<u64> {
        options.expected_stream = Some(self.stream.name().to_string());
        Ok(self.engine.publish_message(message, options).await?.sequence)
    }

    /// Current value of a key; `None` when missing or deleted
    pub async fn get(&self, key: &str) -> JetStreamResult<Option<Bytes>> {
        Ok(self
            .entry(key)
            .await?
            .filter(|entry| entry.operation == Operation::Put)
            .map(|entry| entry.value))
    }

    /// Latest revision of a key, delete and purge markers included
    pub async fn entry(&self, key: &str) -> JetStreamResult<Option<Entry>> {
        validate_key(key)?;
        match self
            .stream
            .get_last_message_for_subject(&self.subject(key))
            .await
        {
            Ok(message) => Ok(self.to_entry(message)),
            Err(e) if e.kind() == ErrorKind::MessageNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a key, keeping its history
    pub async fn delete(&self, key: &str) -> JetStreamResult<u64> {
        validate_key(key)?;
        let marker = Message::new(self.subject(key), Bytes::new())
            .with_header(headers::KV_OPERATION, headers::KV_OPERATION_DEL);
        self.write(marker, PublishOptions::default()).await
    }

    /// Delete a key and drop every older revision
    pub async fn purge(&self, key: &str) -> JetStreamResult<u64> {
        validate_key(key)?;
        let subject = self.subject(key);
        let marker = Message::new(subject.clone(), Bytes::new())
            .with_header(headers::KV_OPERATION, headers::KV_OPERATION_PURGE);
        let revision = self.write(marker, PublishOptions::default()).await?;

        self.stream
            .purge(PurgeRequest::filtered(subject).keep(1))
            .await?;
        Ok(revision)
    }

    /// Keys with a live value, sorted
    pub async fn keys(&self) -> JetStreamResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .stream
            .last_messages_per_subject(&format!("{}>", self.prefix))
            .await?
            .into_iter()
            .filter_map(|message| self.to_entry(message))
            .filter(|entry| entry.operation == Operation::Put)
            .map(|entry| entry.key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Every stored revision of a key, oldest first
    pub async fn history(&self, key: &str) -> JetStreamResult<Vec<Entry>> {
        validate_key(key)?;
        let entries: Vec<Entry> = self
            .stream
            .messages_matching(&self.subject(key))
            .await?
            .into_iter()
            .filter_map(|message| self.to_entry(message))
            .collect();
        if entries.is_empty() {
            return Err(jetstream_error!(
                ErrorKind::KeyNotFound,
                "key '{key}' not found in bucket '{}'",
                self.bucket
            ));
        }
        Ok(entries)
    }

    /// Follow keys matching `pattern`, starting with their latest revisions
    pub async fn watch(
        &self,
        pattern: &str,
    ) -> JetStreamResult<Pin<Box<dyn FuturesStream<Item = Entry> + Send>>> {
        validate_key_pattern(pattern)?;
        let feed = self
            .stream
            .watch(&self.subject(pattern), WatchStart::LastPerSubject)
            .await?;

        let bucket = self.clone();
        Ok(Box::pin(
            feed.filter_map(move |message| std::future::ready(bucket.to_entry(message))),
        ))
    }

    /// Follow every key of the bucket
    pub async fn watch_all(&self) -> JetStreamResult<Pin<Box<dyn FuturesStream<Item = Entry> + Send>>> {
        self.watch(">").await
    }

    /// Bucket status
    pub async fn status(&self) -> JetStreamResult<KeyValueStatus> {
        let info = self.stream.info().await?;
        Ok(KeyValueStatus {
            bucket: self.bucket.clone(),
            values: info.state.messages,
            history: info.config.max_messages_per_subject.unwrap_or(1),
            max_age: info.config.max_age,
            bytes: info.state.bytes,
        })
    }

    fn to_entry(&self, message: StoredMessage) -> Option<Entry> {
        let key = message.subject.strip_prefix(&self.prefix)?.to_string();
        let operation = match message.get_header(headers::KV_OPERATION) {
            Some(headers::KV_OPERATION_DEL) => Operation::Delete,
            Some(headers::KV_OPERATION_PURGE) => Operation::Purge,
            _ => Operation::Put,
        };
        Some(Entry {
            bucket: self.bucket.clone(),
            key,
            value: message.payload,
            revision: message.sequence,
            created: message.timestamp,
            operation,
        })
    }
}

/// Bucket names use letters, digits, `_` and `-`
pub(crate) fn validate_bucket(bucket: &str) -> JetStreamResult<()> {
    if bucket.is_empty()
        || !bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::invalid_config(format!(
            "invalid bucket name '{bucket}'"
        )));
    }
    Ok(())
}

fn validate_key(key: &str) -> JetStreamResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && !key.ends_with('.')
        && !key.contains("..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | '=' | '.'));
    if !valid {
        return Err(jetstream_error!(
            ErrorKind::InvalidSubject,
            "invalid key '{key}'"
        ));
    }
    Ok(())
}

fn validate_key_pattern(pattern: &str) -> JetStreamResult<()> {
    let valid = !pattern.is_empty()
        && pattern.split('.').all(|token| {
            token == "*"
                || token == ">"
                || (!token.is_empty()
                    && token.chars().all(|c| {
                        c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | '=')
                    }))
        });
    if !valid {
        return Err(jetstream_error!(
            ErrorKind::InvalidSubject,
            "invalid key pattern '{pattern}'"
        ));
    }
    Ok(())
}
