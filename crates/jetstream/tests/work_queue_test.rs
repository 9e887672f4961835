//! Work-queue retention: each message is handed to exactly one consumer

mod common;

use common::{create_stream, double_ack_all, publish_n, test_engine};
use proven_jetstream::{
    AckPolicy, ConsumerConfig, DeliverPolicy, Engine, ErrorKind, FetchRequest, RetentionPolicy,
    Stream, StreamConfig,
};

async fn work_queue(engine: &Engine) -> Stream {
    create_stream(
        engine,
        StreamConfig::new("EVENTS")
            .with_subjects(["events.>"])
            .with_retention(RetentionPolicy::WorkQueue),
    )
    .await
}

fn named(name: &str) -> ConsumerConfig {
    ConsumerConfig {
        name: Some(name.to_string()),
        ..ConsumerConfig::default()
    }
}

#[tokio::test]
async fn test_work_queue_walkthrough() {
    let engine = test_engine();
    let stream = work_queue(&engine).await;

    engine.publish("events.us.page_loaded", "").await.unwrap();
    engine.publish("events.eu.mouse_clicked", "").await.unwrap();
    engine.publish("events.us.input_focused", "").await.unwrap();

    let state = stream.info().await.unwrap().state;
    assert_eq!(state.messages, 3);
    assert_eq!(state.first_sequence, 1);

    let processor = stream
        .create_or_update_consumer(named("processor-1"))
        .await
        .expect("Failed to create consumer");
    let messages = processor.fetch(FetchRequest::new(3)).await.unwrap();
    assert_eq!(messages.len(), 3);
    double_ack_all(&messages).await;

    let state = stream.info().await.unwrap().state;
    assert_eq!(state.messages, 0);
    assert_eq!(state.first_sequence, 4);
    assert_eq!(state.consumer_count, 1);

    // Two unfiltered consumers would both claim every subject
    let err = stream
        .create_or_update_consumer(named("processor-2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverlappingConsumer);

    stream.delete_consumer("processor-1").await.unwrap();
    stream
        .create_or_update_consumer(named("processor-2"))
        .await
        .expect("consumer should be accepted once the first one is gone");
    stream.delete_consumer("processor-2").await.unwrap();

    // Disjoint filters can coexist
    let us = stream
        .create_or_update_consumer(named("processor-us").with_filter("events.us.>"))
        .await
        .unwrap();
    let eu = stream
        .create_or_update_consumer(named("processor-eu").with_filter("events.eu.>"))
        .await
        .unwrap();

    engine.publish("events.eu.mouse_clicked", "").await.unwrap();
    engine.publish("events.us.page_loaded", "").await.unwrap();
    engine.publish("events.us.input_focused", "").await.unwrap();
    engine.publish("events.eu.page_loaded", "").await.unwrap();

    let us_messages = us.fetch(FetchRequest::new(2)).await.unwrap();
    let us_subjects: Vec<&str> = us_messages.iter().map(|m| m.subject.as_str()).collect();
    assert_eq!(
        us_subjects,
        vec!["events.us.page_loaded", "events.us.input_focused"]
    );

    let eu_messages = eu.fetch(FetchRequest::new(2)).await.unwrap();
    let eu_subjects: Vec<&str> = eu_messages.iter().map(|m| m.subject.as_str()).collect();
    assert_eq!(
        eu_subjects,
        vec!["events.eu.mouse_clicked", "events.eu.page_loaded"]
    );

    double_ack_all(&us_messages).await;
    assert_eq!(stream.info().await.unwrap().state.messages, 2);
    double_ack_all(&eu_messages).await;
    assert_eq!(stream.info().await.unwrap().state.messages, 0);
}

#[tokio::test]
async fn test_overlapping_filters_are_rejected() {
    let engine = test_engine();
    let stream = work_queue(&engine).await;

    stream
        .create_consumer(ConsumerConfig::durable("orders").with_filter("events.orders.*"))
        .await
        .unwrap();

    let err = stream
        .create_consumer(ConsumerConfig::durable("everything").with_filter("events.>"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverlappingConsumer);

    let err = stream
        .create_consumer(ConsumerConfig::durable("created").with_filter("events.*.created"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverlappingConsumer);

    stream
        .create_consumer(ConsumerConfig::durable("users").with_filter("events.users.>"))
        .await
        .expect("disjoint filter");
}

#[tokio::test]
async fn test_work_queue_consumer_requirements() {
    let engine = test_engine();
    let stream = work_queue(&engine).await;

    let err = stream
        .create_consumer(ConsumerConfig::durable("fire").with_ack_policy(AckPolicy::None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    let err = stream
        .create_consumer(ConsumerConfig::durable("late").with_deliver_policy(DeliverPolicy::New))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

#[tokio::test]
async fn test_unacked_work_stays_queued() {
    let engine = test_engine();
    let stream = work_queue(&engine).await;
    publish_n(&engine, "events.jobs", 3).await;

    let worker = stream
        .create_consumer(ConsumerConfig::durable("worker"))
        .await
        .unwrap();
    let jobs = worker.fetch(FetchRequest::new(3)).await.unwrap();

    jobs[1].double_ack().await.unwrap();
    let state = stream.info().await.unwrap().state;
    assert_eq!(state.messages, 2);
    assert_eq!(state.num_deleted, 1);

    // A terminated job is settled and leaves the queue as well
    jobs[0].term().await.unwrap();
    jobs[2].double_ack().await.unwrap();
    let state = stream.info().await.unwrap().state;
    assert_eq!(state.messages, 0);
    assert_eq!(state.first_sequence, 4);
}
