//! Error types for the stream engine

use std::fmt;

use proven_storage::StorageError;
use thiserror::Error;

use crate::codec::FormatError;
use crate::subject::SubjectError;

/// Result type for stream engine operations
pub type JetStreamResult<T> = Result<T, Error>;

/// Main error type for the stream engine
#[derive(Debug, Error)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Create error wrapping a source error
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            context: ErrorContext::Chain {
                message: message.into(),
                source: Box::new(source),
            },
        }
    }

    /// Get error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get error context
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Create a stream not found error
    pub fn stream_not_found(stream: impl fmt::Display) -> Self {
        Self::with_context(ErrorKind::StreamNotFound, format!("stream '{stream}'"))
    }

    /// Create a consumer not found error
    pub fn consumer_not_found(consumer: impl fmt::Display) -> Self {
        Self::with_context(ErrorKind::ConsumerNotFound, format!("consumer '{consumer}'"))
    }

    /// Create a message not found error
    pub fn message_not_found(sequence: u64) -> Self {
        Self::with_context(ErrorKind::MessageNotFound, format!("sequence {sequence}"))
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidConfig, msg)
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Internal, msg)
    }

    /// Check if the error belongs to the not-found category
    pub fn is_not_found(&self) -> bool {
        self.kind.category() == ErrorCategory::NotFound
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
        }
    }
}

/// Broad grouping of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The addressed resource does not exist
    NotFound,
    /// The request conflicts with existing state or is invalid
    Conflict,
    /// A configured or request limit was exceeded
    LimitExceeded,
    /// Nothing is bound to the published subject
    NoInterest,
    /// The persistence backend failed
    Storage,
    /// Unexpected internal failure
    Internal,
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Stream does not exist
    StreamNotFound,
    /// Consumer does not exist
    ConsumerNotFound,
    /// Message was never stored or has been removed
    MessageNotFound,
    /// Key-value bucket does not exist
    BucketNotFound,
    /// Key has no live value
    KeyNotFound,
    /// Object does not exist or was deleted
    ObjectNotFound,

    /// A stream with that name exists with a different configuration
    StreamNameInUse,
    /// A consumer with that name exists with a different configuration
    ConsumerNameInUse,
    /// Stream subjects overlap with another stream
    SubjectsOverlap,
    /// Work-queue consumer filters overlap
    OverlappingConsumer,
    /// Consumer already has a push subscription bound
    ConsumerAlreadyBound,
    /// Attempt to change a consumer's max waiting setting
    MaxWaitingImmutable,
    /// Attempt to change an immutable consumer setting
    ConsumerUpdate,
    /// Consumer filter is not part of the stream's subjects
    InvalidFilter,
    /// Optimistic concurrency check on publish failed
    WrongLastSequence,
    /// Publish expected a different stream than the one bound to the subject
    StreamMismatch,
    /// Invalid stream, consumer, bucket or request configuration
    InvalidConfig,
    /// Invalid subject or key
    InvalidSubject,
    /// Published subject is not bound by the target stream
    SubjectNotBound,
    /// Object data does not match its recorded digest
    DigestMismatch,
    /// An object with that name already exists
    ObjectExists,

    /// Fetch batch above the consumer's max batch
    ExceededMaxBatch,
    /// Too many pull requests already waiting
    ExceededMaxWaiting,
    /// Fetch expiry above the consumer's max expires
    ExceededMaxRequestExpires,
    /// Fetch max bytes above the consumer's max bytes
    ExceededMaxRequestMaxBytes,
    /// A single message is larger than the fetch max bytes
    MessageSizeExceedsMaxBytes,
    /// Stream is full and discards new messages
    MaximumMessagesExceeded,
    /// Stream is full by bytes and discards new messages
    MaximumBytesExceeded,
    /// Message larger than the stream or engine allows
    MessageTooLarge,

    /// No stream is bound to the published subject
    NoInterest,

    /// Storage backend failure
    Storage,
    /// Internal error
    Internal,
}

impl ErrorKind {
    /// Category of this kind
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::StreamNotFound
            | Self::ConsumerNotFound
            | Self::MessageNotFound
            | Self::BucketNotFound
            | Self::KeyNotFound
            | Self::ObjectNotFound => ErrorCategory::NotFound,
            Self::StreamNameInUse
            | Self::ConsumerNameInUse
            | Self::SubjectsOverlap
            | Self::OverlappingConsumer
            | Self::ConsumerAlreadyBound
            | Self::MaxWaitingImmutable
            | Self::ConsumerUpdate
            | Self::InvalidFilter
            | Self::WrongLastSequence
            | Self::StreamMismatch
            | Self::InvalidConfig
            | Self::InvalidSubject
            | Self::SubjectNotBound
            | Self::DigestMismatch
            | Self::ObjectExists => ErrorCategory::Conflict,
            Self::ExceededMaxBatch
            | Self::ExceededMaxWaiting
            | Self::ExceededMaxRequestExpires
            | Self::ExceededMaxRequestMaxBytes
            | Self::MessageSizeExceedsMaxBytes
            | Self::MaximumMessagesExceeded
            | Self::MaximumBytesExceeded
            | Self::MessageTooLarge => ErrorCategory::LimitExceeded,
            Self::NoInterest => ErrorCategory::NoInterest,
            Self::Storage => ErrorCategory::Storage,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Status code in the style of the pub/sub API
    pub fn status_code(self) -> u16 {
        match self.category() {
            ErrorCategory::NotFound => 404,
            ErrorCategory::Conflict | ErrorCategory::LimitExceeded => 409,
            ErrorCategory::NoInterest => 503,
            ErrorCategory::Storage | ErrorCategory::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::StreamNotFound => "Stream not found",
            Self::ConsumerNotFound => "Consumer not found",
            Self::MessageNotFound => "Message not found",
            Self::BucketNotFound => "Bucket not found",
            Self::KeyNotFound => "Key not found",
            Self::ObjectNotFound => "Object not found",
            Self::StreamNameInUse => "Stream name already in use with a different configuration",
            Self::ConsumerNameInUse => {
                "Consumer name already in use with a different configuration"
            }
            Self::SubjectsOverlap => "Subjects overlap with an existing stream",
            Self::OverlappingConsumer => "Filtered consumer not unique on workqueue stream",
            Self::ConsumerAlreadyBound => "Consumer is already bound to a subscription",
            Self::MaxWaitingImmutable => "Consumer max waiting can not be updated",
            Self::ConsumerUpdate => "Consumer setting can not be updated",
            Self::InvalidFilter => "Consumer filter subject is not a valid subset of the stream",
            Self::WrongLastSequence => "Wrong last sequence",
            Self::StreamMismatch => "Expected stream does not match",
            Self::InvalidConfig => "Invalid configuration",
            Self::InvalidSubject => "Invalid subject",
            Self::SubjectNotBound => "Subject does not match stream",
            Self::DigestMismatch => "Object digest mismatch",
            Self::ObjectExists => "Object already exists",
            Self::ExceededMaxBatch => "Exceeded MaxRequestBatch",
            Self::ExceededMaxWaiting => "Exceeded MaxWaiting",
            Self::ExceededMaxRequestExpires => "Exceeded MaxRequestExpires",
            Self::ExceededMaxRequestMaxBytes => "Exceeded MaxRequestMaxBytes",
            Self::MessageSizeExceedsMaxBytes => "Message size exceeds MaxBytes",
            Self::MaximumMessagesExceeded => "Maximum messages exceeded",
            Self::MaximumBytesExceeded => "Maximum bytes exceeded",
            Self::MessageTooLarge => "Message size exceeds maximum allowed",
            Self::NoInterest => "No stream bound to subject",
            Self::Storage => "Storage error",
            Self::Internal => "Internal error",
        };
        f.write_str(text)
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Self::with_source(ErrorKind::Storage, "Storage backend error", err)
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Self {
        Self::with_source(ErrorKind::Storage, "Stored entry format error", err)
    }
}

impl From<SubjectError> for Error {
    fn from(err: SubjectError) -> Self {
        Self::with_source(ErrorKind::InvalidSubject, "Subject validation failed", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(ErrorKind::Internal, "Serialization error", err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::with_source(ErrorKind::Internal, "Ack processor dropped request", err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::with_source(ErrorKind::Storage, "I/O error", err)
    }
}

/// Helper macro for creating errors with formatted context
#[macro_export]
macro_rules! jetstream_error {
    ($kind:expr, $($arg:tt)*) => {
        $crate::Error::with_context($kind, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_and_status_codes() {
        assert_eq!(ErrorKind::StreamNotFound.status_code(), 404);
        assert_eq!(ErrorKind::OverlappingConsumer.status_code(), 409);
        assert_eq!(ErrorKind::ExceededMaxWaiting.status_code(), 409);
        assert_eq!(ErrorKind::NoInterest.status_code(), 503);
        assert_eq!(ErrorKind::Storage.status_code(), 500);
        assert_eq!(
            ErrorKind::MaximumBytesExceeded.category(),
            ErrorCategory::LimitExceeded
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::stream_not_found("ORDERS");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Stream not found: stream 'ORDERS'");

        let err = jetstream_error!(ErrorKind::ExceededMaxBatch, "batch {} above {}", 10, 2);
        assert_eq!(err.kind(), ErrorKind::ExceededMaxBatch);
        assert_eq!(err.to_string(), "Exceeded MaxRequestBatch: batch 10 above 2");
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: Error = StorageError::Backend("disk full".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("disk full"));
    }
}
