//! Engine-wide configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by every stream and consumer of an engine.
///
/// Consumer settings left unset in a [`ConsumerConfig`](crate::ConsumerConfig)
/// are filled from the `default_*` values when the consumer is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval of the background maintenance sweep (age eviction, redelivery
    /// wakeups, ephemeral consumer reaping)
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Ack wait applied when a consumer does not set one
    #[serde(with = "humantime_serde")]
    pub default_ack_wait: Duration,

    /// Max ack pending applied when a consumer does not set one
    pub default_max_ack_pending: u64,

    /// Max waiting pulls applied when a consumer does not set one
    pub default_max_waiting: usize,

    /// Inactivity threshold after which ephemeral consumers are removed
    #[serde(with = "humantime_serde")]
    pub default_inactive_threshold: Duration,

    /// Expiry of a fetch request that does not carry its own
    #[serde(with = "humantime_serde")]
    pub default_fetch_expires: Duration,

    /// Buffered events per stream watch feed before slow watchers lag
    pub watch_buffer: usize,

    /// Largest payload accepted by publish
    pub max_payload: usize,

    /// Chunk size used by object stores, never above `max_payload`
    pub object_chunk_size: usize,
}

impl EngineConfig {
    /// Object store chunk size clamped to the payload limit
    pub fn effective_chunk_size(&self) -> usize {
        self.object_chunk_size.clamp(1, self.max_payload.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            default_ack_wait: Duration::from_secs(30),
            default_max_ack_pending: 1000,
            default_max_waiting: 512,
            default_inactive_threshold: Duration::from_secs(5),
            default_fetch_expires: Duration::from_secs(5),
            watch_buffer: 1024,
            max_payload: 1024 * 1024,
            object_chunk_size: 128 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"default_ack_wait": "2s", "watch_buffer": 16}"#).unwrap();

        assert_eq!(config.default_ack_wait, Duration::from_secs(2));
        assert_eq!(config.watch_buffer, 16);
        assert_eq!(config.default_max_waiting, 512);
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_chunk_size_clamped_to_payload() {
        let config = EngineConfig {
            max_payload: 1000,
            object_chunk_size: 4096,
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_chunk_size(), 1000);
        assert_eq!(EngineConfig::default().effective_chunk_size(), 128 * 1024);
    }
}
