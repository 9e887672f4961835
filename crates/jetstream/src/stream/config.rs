//! Stream configuration and state models

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, JetStreamResult};
use crate::subject::{patterns_overlap, validate_subject_pattern};

/// Where a stream keeps its messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Written through to the engine's log storage backend
    #[default]
    File,
    /// Held in memory only
    Memory,
}

/// When stored messages become eligible for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Kept until a stream limit removes them
    #[default]
    Limits,
    /// Kept while some consumer still has to acknowledge them
    Interest,
    /// Removed once the single interested consumer acknowledges them
    WorkQueue,
}

/// What happens when a stream limit is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Remove the oldest messages
    #[default]
    Old,
    /// Reject the new message
    New,
}

/// Stream configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Unique stream name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Subject patterns bound to the stream; the name is used when empty
    pub subjects: Vec<String>,
    /// Retention policy, fixed at creation
    pub retention: RetentionPolicy,
    /// Storage type, fixed at creation
    pub storage: StorageType,
    /// Discard policy once a limit is reached
    pub discard: DiscardPolicy,
    /// Maximum number of messages
    pub max_messages: Option<u64>,
    /// Maximum total size of messages
    pub max_bytes: Option<u64>,
    /// Maximum age of a message
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// Maximum number of messages kept per subject
    pub max_messages_per_subject: Option<u64>,
    /// Largest single message accepted
    pub max_message_size: Option<u64>,
}

impl StreamConfig {
    /// Create a configuration with the given name and defaults otherwise
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the subjects bound to the stream
    #[must_use]
    pub fn with_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    /// Set the retention policy
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Set the storage type
    #[must_use]
    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    /// Set the discard policy
    #[must_use]
    pub fn with_discard(mut self, discard: DiscardPolicy) -> Self {
        self.discard = discard;
        self
    }

    /// Limit the number of messages
    #[must_use]
    pub fn with_max_messages(mut self, max_messages: u64) -> Self {
        self.max_messages = Some(max_messages);
        self
    }

    /// Limit the total size of messages
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Limit the age of messages
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Limit the number of messages per subject
    #[must_use]
    pub fn with_max_messages_per_subject(mut self, max: u64) -> Self {
        self.max_messages_per_subject = Some(max);
        self
    }

    /// Subjects the stream binds, falling back to its name
    pub fn bound_subjects(&self) -> Vec<String> {
        if self.subjects.is_empty() {
            vec![self.name.clone()]
        } else {
            self.subjects.clone()
        }
    }

    /// Validate names, subjects and limits
    pub fn validate(&self) -> JetStreamResult<()> {
        validate_stream_name(&self.name)?;

        let subjects = self.bound_subjects();
        for subject in &subjects {
            validate_subject_pattern(subject)?;
        }
        for (i, a) in subjects.iter().enumerate() {
            for b in &subjects[i + 1..] {
                if patterns_overlap(a, b) {
                    return Err(Error::invalid_config(format!(
                        "stream subjects '{a}' and '{b}' overlap"
                    )));
                }
            }
        }

        let limits = [
            ("max_messages", self.max_messages),
            ("max_bytes", self.max_bytes),
            ("max_messages_per_subject", self.max_messages_per_subject),
            ("max_message_size", self.max_message_size),
        ];
        for (field, value) in limits {
            if value == Some(0) {
                return Err(Error::invalid_config(format!("{field} must be positive")));
            }
        }
        if self.max_age == Some(Duration::ZERO) {
            return Err(Error::invalid_config("max_age must be positive"));
        }

        Ok(())
    }
}

/// Validate a stream or consumer name
pub(crate) fn validate_stream_name(name: &str) -> JetStreamResult<()> {
    if name.is_empty() {
        return Err(Error::invalid_config("name cannot be empty"));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '.' | '*' | '>' | '/' | '\\'))
    {
        return Err(Error::invalid_config(format!(
            "name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Stream information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Current configuration
    pub config: StreamConfig,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Current state
    pub state: StreamState,
}

/// Counters describing the stored messages of a stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamState {
    /// Number of stored messages
    pub messages: u64,
    /// Total size of stored messages
    pub bytes: u64,
    /// Lowest stored sequence, or `last_sequence + 1` when empty
    pub first_sequence: u64,
    /// Timestamp of the first stored message
    pub first_timestamp: Option<DateTime<Utc>>,
    /// Highest sequence ever assigned
    pub last_sequence: u64,
    /// Timestamp of the last assigned message
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Number of distinct subjects stored
    pub num_subjects: u64,
    /// Number of removed sequences between first and last
    pub num_deleted: u64,
    /// Number of consumers
    pub consumer_count: usize,
    /// Per-subject message counts, present only when requested with a filter
    pub subjects: Option<BTreeMap<String, u64>>,
}

/// Purge request for a stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeRequest {
    /// Only purge messages whose subject matches this pattern
    pub filter: Option<String>,
    /// Keep this many of the newest matching messages
    pub keep: Option<u64>,
    /// Purge matching messages below this sequence
    pub sequence: Option<u64>,
}

impl PurgeRequest {
    /// Purge everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Purge only messages matching the filter
    pub fn filtered(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Self::default()
        }
    }

    /// Keep the newest `keep` matching messages
    #[must_use]
    pub fn keep(mut self, keep: u64) -> Self {
        self.keep = Some(keep);
        self
    }

    /// Purge matching messages below `sequence`
    #[must_use]
    pub fn up_to(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Expectations checked atomically with a publish
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Stream that must receive the message
    pub expected_stream: Option<String>,
    /// Required last sequence of the stream
    pub expected_last_sequence: Option<u64>,
    /// Required last sequence of the subject, 0 for none
    pub expected_last_subject_sequence: Option<u64>,
}

/// Acknowledgement of a stored publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    /// Stream that stored the message
    pub stream: String,
    /// Assigned stream sequence
    pub sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_subjects_default_to_name() {
        let config = StreamConfig::new("ORDERS");
        assert_eq!(config.bound_subjects(), vec!["ORDERS".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        assert!(StreamConfig::new("").validate().is_err());
        assert!(StreamConfig::new("a.b").validate().is_err());
        assert!(
            StreamConfig::new("EVENTS")
                .with_subjects(["events.>", "events.us.*"])
                .validate()
                .is_err()
        );
        assert!(
            StreamConfig::new("EVENTS")
                .with_subjects(["events..x"])
                .validate()
                .is_err()
        );
        assert!(
            StreamConfig::new("EVENTS")
                .with_max_messages(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r"
name: EVENTS
subjects: ['events.>']
retention: work_queue
storage: memory
max_age: 1h
max_bytes: 300
";
        let config: StreamConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.retention, RetentionPolicy::WorkQueue);
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(config.max_bytes, Some(300));
        assert_eq!(config.discard, DiscardPolicy::Old);
    }
}
