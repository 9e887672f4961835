//! Shared helpers for jetstream integration tests

#![allow(dead_code)]

use std::time::Duration;

use proven_jetstream::{Engine, EngineConfig, JetStreamMessage, Stream, StreamConfig};

/// Initialize tracing once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("proven_jetstream=debug")
        .with_test_writer()
        .try_init();
}

/// Engine on in-memory storage with default settings
pub fn test_engine() -> Engine {
    init_tracing();
    Engine::new(EngineConfig::default())
}

/// Create a stream, failing the test on error
pub async fn create_stream(engine: &Engine, config: StreamConfig) -> Stream {
    engine
        .create_stream(config)
        .await
        .expect("Failed to create stream")
}

/// Publish `count` empty messages on `subject`
pub async fn publish_n(engine: &Engine, subject: &str, count: usize) {
    for _ in 0..count {
        engine
            .publish(subject.to_string(), Vec::new())
            .await
            .expect("Failed to publish");
    }
}

/// Ack every message and wait until the stream applied it
pub async fn double_ack_all(messages: &[JetStreamMessage]) {
    for message in messages {
        message.double_ack().await.expect("Failed to ack");
    }
}

/// Short expiry for fetches that are expected to come back empty
pub const SHORT_EXPIRES: Duration = Duration::from_millis(50);
