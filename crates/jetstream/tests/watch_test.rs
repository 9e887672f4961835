//! Watch feeds: replay, follow and slow watchers

mod common;

use common::{create_stream, init_tracing, publish_n, test_engine};
use futures::StreamExt;
use proven_jetstream::{Engine, EngineConfig, StreamConfig, WatchStart};

#[tokio::test]
async fn test_slow_watcher_skips_without_blocking_publishers() {
    init_tracing();
    let engine = Engine::new(EngineConfig {
        watch_buffer: 4,
        ..EngineConfig::default()
    });
    let stream = create_stream(
        &engine,
        StreamConfig::new("TELEMETRY").with_subjects(["telemetry.>"]),
    )
    .await;

    let mut feed = stream
        .watch("telemetry.>", WatchStart::New)
        .await
        .expect("Failed to watch");

    publish_n(&engine, "telemetry.cpu", 20).await;
    assert_eq!(stream.info().await.unwrap().state.messages, 20);

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(feed.next().await.expect("feed ended").sequence);
    }
    assert_eq!(received, vec![17, 18, 19, 20]);

    engine.publish("telemetry.mem", "").await.unwrap();
    assert_eq!(feed.next().await.expect("feed ended").sequence, 21);
}

#[tokio::test]
async fn test_watch_all_replays_history_before_following() {
    let engine = test_engine();
    let stream = create_stream(
        &engine,
        StreamConfig::new("TELEMETRY").with_subjects(["telemetry.>"]),
    )
    .await;
    publish_n(&engine, "telemetry.cpu", 2).await;
    publish_n(&engine, "telemetry.mem", 1).await;

    let mut feed = stream
        .watch("telemetry.cpu", WatchStart::All)
        .await
        .expect("Failed to watch");
    engine.publish("telemetry.cpu", "").await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(feed.next().await.expect("feed ended").sequence);
    }
    assert_eq!(received, vec![1, 2, 4]);
}
