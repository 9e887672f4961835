//! Push subscriptions bound to consumers

mod common;

use std::time::Duration;

use common::{create_stream, init_tracing, test_engine};
use futures::StreamExt;
use proven_jetstream::{
    ConsumerConfig, Engine, EngineConfig, ErrorKind, PushSubscription, StreamConfig,
};

const RECEIVE: Duration = Duration::from_secs(2);

async fn events_engine() -> Engine {
    let engine = test_engine();
    create_stream(
        &engine,
        StreamConfig::new("EVENTS").with_subjects(["events.>"]),
    )
    .await;
    for (subject, payload) in [
        ("events.1", "changed"),
        ("events.2", "fixed"),
        ("events.3", "updated"),
    ] {
        engine.publish(subject, payload).await.unwrap();
    }
    engine
}

/// Give the delivery task time to fill the subscription queue
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn receive(subscription: &mut PushSubscription) -> String {
    let message = subscription
        .next_timeout(RECEIVE)
        .await
        .expect("Failed to receive pushed message");
    message.double_ack().await.expect("Failed to ack");
    message.subject
}

#[tokio::test]
async fn test_push_consumer_walkthrough() {
    let engine = events_engine().await;
    let stream = engine.stream("EVENTS").unwrap();

    let mut subscription = engine
        .subscribe("events.>")
        .await
        .expect("Failed to subscribe");
    let ephemeral = stream.consumer_names();
    assert_eq!(ephemeral.len(), 1);
    assert!(!subscription.consumer().config().is_durable());

    settle().await;
    assert_eq!(subscription.pending(), (3, 19));

    engine.publish("events.4", "handled").await.unwrap();
    engine.publish("events.5", "received").await.unwrap();
    engine.publish("events.6", "clicked").await.unwrap();
    settle().await;
    assert_eq!(subscription.pending(), (6, 41));

    assert_eq!(receive(&mut subscription).await, "events.1");
    assert_eq!(receive(&mut subscription).await, "events.2");
    assert_eq!(subscription.pending().0, 4);

    subscription.unsubscribe().await.unwrap();
    assert!(stream.consumer_names().is_empty());

    let handler = stream
        .create_consumer(
            ConsumerConfig::durable("event-handler").with_ack_wait(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    let mut subscription = handler.subscribe().unwrap();
    settle().await;
    assert_eq!(subscription.pending().0, 6);
    assert_eq!(receive(&mut subscription).await, "events.1");

    let err = handler.subscribe().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsumerAlreadyBound);

    subscription.unsubscribe().await.unwrap();
    assert_eq!(stream.consumer_names(), vec!["event-handler".to_string()]);

    // Messages queued for the old subscription come back after the ack wait
    let mut rebound = handler.subscribe().expect("Failed to rebind durable");
    assert_eq!(receive(&mut rebound).await, "events.2");
}

#[tokio::test]
async fn test_unacked_push_messages_are_redelivered() {
    let engine = events_engine().await;
    let handler = engine
        .create_or_update_consumer(
            "EVENTS",
            ConsumerConfig::durable("event-handler-2")
                .with_filter("events.1")
                .with_ack_wait(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    let mut subscription = handler.subscribe().unwrap();
    let first = subscription.next_timeout(RECEIVE).await.unwrap();
    assert_eq!(first.info.delivered, 1);

    let again = subscription.next_timeout(RECEIVE).await.unwrap();
    assert_eq!(again.info.stream_sequence, 1);
    assert_eq!(again.info.delivered, 2);
    again.double_ack().await.unwrap();

    assert!(
        subscription
            .next_timeout(Duration::from_millis(400))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn test_max_ack_pending_throttles_push_delivery() {
    let engine = events_engine().await;
    let handler = engine
        .create_or_update_consumer(
            "EVENTS",
            ConsumerConfig {
                max_ack_pending: Some(1),
                ..ConsumerConfig::durable("throttled")
            },
        )
        .await
        .unwrap();

    let mut subscription = handler.subscribe().unwrap();
    settle().await;
    assert_eq!(subscription.pending().0, 1);

    let mut subjects = Vec::new();
    for _ in 0..3 {
        subjects.push(receive(&mut subscription).await);
    }
    assert_eq!(subjects, vec!["events.1", "events.2", "events.3"]);
}

#[tokio::test]
async fn test_subscription_ends_when_consumer_deleted() {
    let engine = events_engine().await;
    let stream = engine.stream("EVENTS").unwrap();
    let handler = stream
        .create_consumer(ConsumerConfig::durable("handler").with_filter("events.9"))
        .await
        .unwrap();

    let mut subscription = handler.subscribe().unwrap();
    settle().await;
    stream.delete_consumer("handler").await.unwrap();

    let next = tokio::time::timeout(RECEIVE, subscription.next())
        .await
        .expect("subscription did not end");
    assert!(next.is_none());
}

#[tokio::test]
async fn test_subscribe_needs_a_stream_holding_the_filter() {
    let engine = events_engine().await;

    let err = engine.subscribe("orders.>").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamNotFound);

    let err = engine.subscribe("events.>.bad").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSubject);
}

#[tokio::test(start_paused = true)]
async fn test_unbound_ephemeral_consumer_is_reaped() {
    init_tracing();
    let engine = Engine::new(EngineConfig {
        sweep_interval: Duration::from_millis(100),
        ..EngineConfig::default()
    });
    let stream = create_stream(
        &engine,
        StreamConfig::new("EVENTS").with_subjects(["events.>"]),
    )
    .await;
    engine.start();

    let consumer = stream
        .create_consumer(ConsumerConfig {
            inactive_threshold: Some(Duration::from_secs(1)),
            ..ConsumerConfig::ephemeral()
        })
        .await
        .unwrap();
    let mut subscription = consumer.subscribe().unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(stream.consumer_names().len(), 1, "bound consumers stay");

    engine.publish("events.1", "ping").await.unwrap();
    let message = subscription.next().await.unwrap();
    message.double_ack().await.unwrap();
    drop(subscription);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(stream.consumer_names().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_subscription_is_a_stream() {
    let engine = events_engine().await;
    let handler = engine
        .create_or_update_consumer("EVENTS", ConsumerConfig::durable("reader"))
        .await
        .unwrap();

    let subscription = handler.subscribe().unwrap();
    let messages: Vec<_> = subscription.take(3).collect().await;
    let subjects: Vec<&str> = messages.iter().map(|m| m.subject.as_str()).collect();
    assert_eq!(subjects, vec!["events.1", "events.2", "events.3"]);
}
