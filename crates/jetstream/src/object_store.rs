//! Object stores layered on streams
//!
//! A bucket `b` is the stream `OBJ_b`. Object data is split into chunks
//! published on `$O.b.C.<nuid>`; the object's metadata is a JSON document on
//! `$O.b.M.<encoded name>` whose latest message describes the current
//! version of the object.

use std::pin::Pin;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream as FuturesStream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{ErrorKind, JetStreamResult};
use crate::jetstream_error;
use crate::kv::validate_bucket;
use crate::message::{Message, StoredMessage, headers};
use crate::stream::Stream;
use crate::stream::config::{
    DiscardPolicy, PublishOptions, PurgeRequest, StorageType, StreamConfig,
};
use crate::watch::WatchStart;

const DIGEST_PREFIX: &str = "SHA-256=";

/// Object store bucket configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Bucket name
    pub bucket: String,
    /// Free-form description
    pub description: Option<String>,
    /// Age after which objects expire
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// Maximum total size of the bucket
    pub max_bytes: Option<u64>,
    /// Storage of the backing stream
    pub storage: StorageType,
}

impl ObjectStoreConfig {
    /// Bucket with default settings
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Name of the stream backing `bucket`
    pub fn stream_name(bucket: &str) -> String {
        format!("OBJ_{bucket}")
    }

    pub(crate) fn stream_config(&self) -> JetStreamResult<StreamConfig> {
        validate_bucket(&self.bucket)?;
        Ok(StreamConfig {
            name: Self::stream_name(&self.bucket),
            description: self.description.clone(),
            subjects: vec![
                format!("$O.{}.C.>", self.bucket),
                format!("$O.{}.M.>", self.bucket),
            ],
            storage: self.storage,
            discard: DiscardPolicy::New,
            max_age: self.max_age,
            max_bytes: self.max_bytes,
            ..StreamConfig::default()
        })
    }
}

/// User-controlled object metadata
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
}

impl ObjectMeta {
    /// Metadata with a name only
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl From<&str> for ObjectMeta {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Stored description of an object version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Bucket name
    pub bucket: String,
    /// Unique id of this version's chunks
    pub nuid: String,
    /// Object size in bytes
    pub size: u64,
    /// Number of chunks
    pub chunks: u64,
    /// Time of the last change
    pub modified: DateTime<Utc>,
    /// `SHA-256=` followed by the URL-safe base64 digest of the data
    pub digest: String,
    /// Whether the object was deleted
    #[serde(default)]
    pub deleted: bool,
}

impl ObjectInfo {
    /// Metadata part of the info
    pub fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

/// Bucket status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreStatus {
    /// Bucket name
    pub bucket: String,
    /// Free-form description
    pub description: Option<String>,
    /// Bytes held by the backing stream
    pub size: u64,
    /// Storage of the backing stream
    pub storage: StorageType,
}

/// Handle to an object store bucket
#[derive(Debug, Clone)]
pub struct ObjectStore {
    engine: Engine,
    bucket: String,
    stream: Stream,
}

impl ObjectStore {
    pub(crate) fn new(engine: Engine, bucket: String, stream: Stream) -> Self {
        Self {
            engine,
            bucket,
            stream,
        }
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn chunk_subject(&self, nuid: &str) -> String {
        format!("$O.{}.C.{nuid}", self.bucket)
    }

    fn meta_subject(&self, name: &str) -> String {
        format!("$O.{}.M.{}", self.bucket, URL_SAFE.encode(name))
    }

    /// Store an object from memory
    pub async fn put(
        &self,
        meta: impl Into<ObjectMeta>,
        data: impl Into<Bytes>,
    ) -> JetStreamResult<ObjectInfo> {
        let data = data.into();
        let mut reader: &[u8] = &data;
        self.put_reader(meta, &mut reader).await
    }

    /// Store an object read to the end from `reader`
    ///
    /// Replaces any previous version; its chunks are purged once the new
    /// metadata is stored.
    pub async fn put_reader<R>(
        &self,
        meta: impl Into<ObjectMeta>,
        reader: &mut R,
    ) -> JetStreamResult<ObjectInfo>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let meta = meta.into();
        validate_object_name(&meta.name)?;
        let previous = self.stored_info(&meta.name).await?;

        let nuid = Uuid::new_v4().simple().to_string();
        let chunk_subject = self.chunk_subject(&nuid);
        let chunk_size = self.engine.config().effective_chunk_size();

        let written = self.write_chunks(reader, &chunk_subject, chunk_size).await;
        let (size, chunks, digest) = match written {
            Ok(written) => written,
            Err(e) => {
                self.purge_subject(&chunk_subject).await;
                return Err(e);
            }
        };

        let info = ObjectInfo {
            name: meta.name,
            description: meta.description,
            bucket: self.bucket.clone(),
            nuid,
            size,
            chunks,
            modified: Utc::now(),
            digest,
            deleted: false,
        };
        if let Err(e) = self.publish_meta(&info).await {
            self.purge_subject(&chunk_subject).await;
            return Err(e);
        }

        if let Some(previous) = previous {
            self.purge_subject(&self.chunk_subject(&previous.nuid)).await;
        }
        self.stream
            .purge(PurgeRequest::filtered(self.meta_subject(&info.name)).keep(1))
            .await?;

        debug!(
            "Stored object {} in bucket {} ({} bytes in {} chunks)",
            info.name, self.bucket, info.size, info.chunks
        );
        Ok(info)
    }

    async fn write_chunks<R>(
        &self,
        reader: &mut R,
        subject: &str,
        chunk_size: usize,
    ) -> JetStreamResult<(u64, u64, String)>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; chunk_size];
        let mut size = 0u64;
        let mut chunks = 0u64;

        loop {
            let filled = read_chunk(reader, &mut buffer).await?;
            if filled == 0 {
                break;
            }

            let chunk = Bytes::copy_from_slice(&buffer[..filled]);
            hasher.update(&chunk);
            self.publish(Message::new(subject, chunk)).await?;
            size += filled as u64;
            chunks += 1;

            if filled < chunk_size {
                break;
            }
        }

        Ok((size, chunks, encode_digest(hasher)))
    }

    /// Read an object, verifying its size and digest
    pub async fn get(&self, name: &str) -> JetStreamResult<Bytes> {
        let info = self.info(name).await?;
        let chunks = self
            .stream
            .messages_matching(&self.chunk_subject(&info.nuid))
            .await?;

        let mut hasher = Sha256::new();
        let mut data = BytesMut::with_capacity(usize::try_from(info.size).unwrap_or(0));
        for chunk in &chunks {
            hasher.update(&chunk.payload);
            data.extend_from_slice(&chunk.payload);
        }

        let digest = encode_digest(hasher);
        let complete = chunks.len() as u64 == info.chunks && data.len() as u64 == info.size;
        if !complete || digest != info.digest {
            return Err(jetstream_error!(
                ErrorKind::DigestMismatch,
                "object '{name}' read {} bytes in {} chunks with digest {digest}, expected {} bytes in {} chunks with digest {}",
                data.len(),
                chunks.len(),
                info.size,
                info.chunks,
                info.digest
            ));
        }

        Ok(data.freeze())
    }

    /// Current info of a live object
    pub async fn info(&self, name: &str) -> JetStreamResult<ObjectInfo> {
        match self.stored_info(name).await? {
            Some(info) if !info.deleted => Ok(info),
            _ => Err(jetstream_error!(
                ErrorKind::ObjectNotFound,
                "object '{name}' not found in bucket '{}'",
                self.bucket
            )),
        }
    }

    /// Latest stored info, deleted objects included
    async fn stored_info(&self, name: &str) -> JetStreamResult<Option<ObjectInfo>> {
        validate_object_name(name)?;
        match self
            .stream
            .get_last_message_for_subject(&self.meta_subject(name))
            .await
        {
            Ok(message) => Ok(Some(serde_json::from_slice(&message.payload)?)),
            Err(e) if e.kind() == ErrorKind::MessageNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Change the name or description of an object
    pub async fn update_meta(&self, name: &str, meta: ObjectMeta) -> JetStreamResult<ObjectInfo> {
        validate_object_name(&meta.name)?;
        let mut info = self.info(name).await?;

        let renamed = meta.name != name;
        if renamed {
            if let Some(existing) = self.stored_info(&meta.name).await? {
                if !existing.deleted {
                    return Err(jetstream_error!(
                        ErrorKind::ObjectExists,
                        "object '{}' already exists in bucket '{}'",
                        meta.name,
                        self.bucket
                    ));
                }
            }
        }

        info.name = meta.name;
        info.description = meta.description;
        info.modified = Utc::now();
        self.publish_meta(&info).await?;

        let old_meta = PurgeRequest::filtered(self.meta_subject(name));
        self.stream
            .purge(if renamed { old_meta } else { old_meta.keep(1) })
            .await?;
        Ok(info)
    }

    /// Delete an object, purging its data
    pub async fn delete(&self, name: &str) -> JetStreamResult<()> {
        let mut info = self.info(name).await?;
        let chunk_subject = self.chunk_subject(&info.nuid);

        info.deleted = true;
        info.size = 0;
        info.chunks = 0;
        info.digest = String::new();
        info.modified = Utc::now();
        self.publish_meta(&info).await?;

        self.stream
            .purge(PurgeRequest::filtered(self.meta_subject(name)).keep(1))
            .await?;
        self.stream
            .purge(PurgeRequest::filtered(chunk_subject))
            .await?;

        debug!("Deleted object {} from bucket {}", name, self.bucket);
        Ok(())
    }

    /// Live objects, sorted by name
    pub async fn list(&self) -> JetStreamResult<Vec<ObjectInfo>> {
        let mut objects: Vec<ObjectInfo> = self
            .stream
            .last_messages_per_subject(&format!("$O.{}.M.>", self.bucket))
            .await?
            .iter()
            .filter_map(parse_info)
            .filter(|info| !info.deleted)
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    /// Follow changes made after the watch started, deletions included
    pub async fn watch(
        &self,
    ) -> JetStreamResult<Pin<Box<dyn FuturesStream<Item = ObjectInfo> + Send>>> {
        self.watch_from(WatchStart::New).await
    }

    /// Follow changes, starting with the current info of every object
    pub async fn watch_with_history(
        &self,
    ) -> JetStreamResult<Pin<Box<dyn FuturesStream<Item = ObjectInfo> + Send>>> {
        self.watch_from(WatchStart::LastPerSubject).await
    }

    async fn watch_from(
        &self,
        start: WatchStart,
    ) -> JetStreamResult<Pin<Box<dyn FuturesStream<Item = ObjectInfo> + Send>>> {
        let feed = self
            .stream
            .watch(&format!("$O.{}.M.>", self.bucket), start)
            .await?;
        Ok(Box::pin(feed.filter_map(|message| {
            std::future::ready(parse_info(&message))
        })))
    }

    /// Bucket status
    pub async fn status(&self) -> JetStreamResult<ObjectStoreStatus> {
        let info = self.stream.info().await?;
        Ok(ObjectStoreStatus {
            bucket: self.bucket.clone(),
            description: info.config.description,
            size: info.state.bytes,
            storage: info.config.storage,
        })
    }

    async fn publish_meta(&self, info: &ObjectInfo) -> JetStreamResult<()> {
        let message = Message::new(self.meta_subject(&info.name), serde_json::to_vec(info)?)
            .with_header(headers::CONTENT_TYPE, "application/json");
        self.publish(message).await
    }

    async fn publish(&self, message: Message) -> JetStreamResult<()> {
        let options = PublishOptions {
            expected_stream: Some(self.stream.name().to_string()),
            ..PublishOptions::default()
        };
        self.engine.publish_message(message, options).await?;
        Ok(())
    }

    async fn purge_subject(&self, subject: &str) {
        if let Err(e) = self.stream.purge(PurgeRequest::filtered(subject)).await {
            warn!("Failed to purge {} in bucket {}: {}", subject, self.bucket, e);
        }
    }
}

fn validate_object_name(name: &str) -> JetStreamResult<()> {
    if name.is_empty() {
        return Err(jetstream_error!(
            ErrorKind::InvalidConfig,
            "object name cannot be empty"
        ));
    }
    Ok(())
}

fn parse_info(message: &StoredMessage) -> Option<ObjectInfo> {
    match serde_json::from_slice(&message.payload) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("Skipping unreadable object info at {}: {}", message.sequence, e);
            None
        }
    }
}

fn encode_digest(hasher: Sha256) -> String {
    format!("{DIGEST_PREFIX}{}", URL_SAFE.encode(hasher.finalize()))
}

/// Fill `buffer` from `reader`, returning fewer bytes only at end of input
async fn read_chunk<R>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
