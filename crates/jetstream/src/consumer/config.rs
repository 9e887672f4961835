//! Consumer configuration and info models

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, JetStreamResult};
use crate::jetstream_error;
use crate::stream::config::validate_stream_name;
use crate::subject::validate_subject_pattern;

/// How a consumer's deliveries must be acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Deliveries count as acknowledged immediately
    None,
    /// Acknowledging a sequence acknowledges every pending sequence below it
    All,
    /// Every delivery is acknowledged on its own
    #[default]
    Explicit,
}

/// Where a new consumer starts in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the first stored message
    #[default]
    All,
    /// From the last stored message matching the filter
    Last,
    /// Only messages stored after creation
    New,
    /// From the given stream sequence
    ByStartSequence {
        /// First sequence to deliver
        start_sequence: u64,
    },
    /// The last message of every matching subject, then new messages
    LastPerSubject,
}

/// Consumer configuration
///
/// Unset flow-control fields are filled from [`EngineConfig`] at creation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Name of a durable consumer
    pub durable_name: Option<String>,
    /// Name of an ephemeral consumer; generated when both names are unset
    pub name: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Only deliver messages whose subject matches this pattern
    pub filter_subject: Option<String>,
    /// Start position
    pub deliver_policy: DeliverPolicy,
    /// Acknowledgement policy
    pub ack_policy: AckPolicy,
    /// Time before an unacknowledged delivery is redelivered
    #[serde(with = "humantime_serde")]
    pub ack_wait: Option<Duration>,
    /// Maximum number of deliveries of one message
    pub max_deliver: Option<u64>,
    /// Maximum number of outstanding unacknowledged deliveries
    pub max_ack_pending: Option<u64>,
    /// Maximum number of concurrently waiting pull requests
    pub max_waiting: Option<usize>,
    /// Largest batch a pull request may ask for
    pub max_batch: Option<usize>,
    /// Largest max bytes a pull request may ask for
    pub max_bytes: Option<usize>,
    /// Longest expiry a pull request may ask for
    #[serde(with = "humantime_serde")]
    pub max_expires: Option<Duration>,
    /// Inactivity after which the consumer is removed
    #[serde(with = "humantime_serde")]
    pub inactive_threshold: Option<Duration>,
}

impl ConsumerConfig {
    /// Durable consumer with the given name
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Ephemeral consumer with a generated name
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// Set the filter subject
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_subject = Some(filter.into());
        self
    }

    /// Set the ack policy
    #[must_use]
    pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    /// Set the deliver policy
    #[must_use]
    pub fn with_deliver_policy(mut self, deliver_policy: DeliverPolicy) -> Self {
        self.deliver_policy = deliver_policy;
        self
    }

    /// Set the ack wait
    #[must_use]
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = Some(ack_wait);
        self
    }

    /// Whether the consumer is durable
    pub fn is_durable(&self) -> bool {
        self.durable_name.is_some()
    }

    /// Explicit consumer name, if any
    pub fn explicit_name(&self) -> Option<&str> {
        self.durable_name.as_deref().or(self.name.as_deref())
    }

    pub(crate) fn validate(&self) -> JetStreamResult<()> {
        if let (Some(durable), Some(name)) = (&self.durable_name, &self.name) {
            if durable != name {
                return Err(Error::invalid_config(format!(
                    "durable name '{durable}' and name '{name}' differ"
                )));
            }
        }
        if let Some(name) = self.explicit_name() {
            validate_stream_name(name)?;
        }
        if let Some(filter) = &self.filter_subject {
            validate_subject_pattern(filter).map_err(|e| {
                jetstream_error!(ErrorKind::InvalidFilter, "filter '{filter}': {e}")
            })?;
        }

        let limits = [
            ("max_deliver", self.max_deliver),
            ("max_ack_pending", self.max_ack_pending),
            ("max_waiting", self.max_waiting.map(|v| v as u64)),
            ("max_batch", self.max_batch.map(|v| v as u64)),
            ("max_bytes", self.max_bytes.map(|v| v as u64)),
        ];
        for (field, value) in limits {
            if value == Some(0) {
                return Err(Error::invalid_config(format!("{field} must be positive")));
            }
        }
        for (field, value) in [
            ("ack_wait", self.ack_wait),
            ("max_expires", self.max_expires),
            ("inactive_threshold", self.inactive_threshold),
        ] {
            if value == Some(Duration::ZERO) {
                return Err(Error::invalid_config(format!("{field} must be positive")));
            }
        }

        Ok(())
    }

    /// Fill unset flow-control settings from the engine defaults
    pub(crate) fn with_defaults(mut self, defaults: &EngineConfig) -> Self {
        if self.durable_name.is_some() && self.name.is_none() {
            self.name.clone_from(&self.durable_name);
        }
        self.ack_wait.get_or_insert(defaults.default_ack_wait);
        self.max_ack_pending
            .get_or_insert(defaults.default_max_ack_pending);
        self.max_waiting.get_or_insert(defaults.default_max_waiting);
        if !self.is_durable() {
            self.inactive_threshold
                .get_or_insert(defaults.default_inactive_threshold);
        }
        self
    }

    pub(crate) fn ack_wait_or_default(&self) -> Duration {
        self.ack_wait.unwrap_or(Duration::from_secs(30))
    }
}

/// A pair of consumer and stream sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SequenceInfo {
    /// Consumer sequence
    pub consumer_sequence: u64,
    /// Stream sequence
    pub stream_sequence: u64,
}

/// Consumer information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Stream the consumer reads from
    pub stream_name: String,
    /// Consumer name
    pub name: String,
    /// Resolved configuration
    pub config: ConsumerConfig,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Last delivered sequences
    pub delivered: SequenceInfo,
    /// Sequences at or below which everything is acknowledged
    pub ack_floor: SequenceInfo,
    /// Deliveries awaiting acknowledgement
    pub num_ack_pending: u64,
    /// Messages delivered more than once
    pub num_redelivered: u64,
    /// Pull requests currently waiting
    pub num_waiting: usize,
    /// Matching messages not yet delivered
    pub num_pending: u64,
    /// Whether a push subscription is bound
    #[serde(default)]
    pub push_bound: bool,
}
