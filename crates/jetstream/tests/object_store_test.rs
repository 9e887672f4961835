//! Object store buckets

mod common;

use std::io::Cursor;
use std::time::Duration;

use common::test_engine;
use futures::StreamExt;
use proven_jetstream::{
    Engine, EngineConfig, ErrorKind, ObjectMeta, ObjectStoreConfig, StorageType,
};

const DATA_SIZE: usize = 2_000_000;

#[tokio::test]
async fn test_object_store_walkthrough() {
    let engine = test_engine();
    let chunk_size = engine.config().effective_chunk_size();

    let err = engine.object_store("configs").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BucketNotFound);
    let store = engine
        .create_object_store(ObjectStoreConfig::new("configs"))
        .await
        .expect("Failed to create object store");

    let status = store.status().await.unwrap();
    assert_eq!(status.bucket, "configs");
    assert_eq!(status.size, 0);
    assert_eq!(status.storage, StorageType::File);

    let data = vec![0u8; DATA_SIZE];

    let info = store.put("a", data.clone()).await.unwrap();
    assert_eq!(info.name, "a");
    assert_eq!(info.size, DATA_SIZE as u64);
    assert_eq!(info.chunks, DATA_SIZE.div_ceil(chunk_size) as u64);
    assert!(info.digest.starts_with("SHA-256="));

    let info = store
        .put(
            ObjectMeta::new("b").with_description("large data"),
            data.clone(),
        )
        .await
        .unwrap();
    assert_eq!(info.description.as_deref(), Some("large data"));

    let mut meta = info.meta();
    meta.description = Some("still large data".to_string());
    store.update_meta("b", meta).await.unwrap();
    assert_eq!(
        store.info("b").await.unwrap().description.as_deref(),
        Some("still large data")
    );

    let entries = store.list().await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);

    let read = store.get("b").await.unwrap();
    assert_eq!(read.len(), DATA_SIZE);
    assert!(status_size(&engine).await > 2 * DATA_SIZE as u64);

    let mut watch = store.watch().await.unwrap();
    store.delete("a").await.unwrap();
    let change = tokio::time::timeout(Duration::from_secs(1), watch.next())
        .await
        .expect("watch should report the deletion")
        .unwrap();
    assert_eq!(change.name, "a");
    assert!(change.deleted);

    let err = store.get("a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectNotFound);

    let mut buffered = Cursor::new(read.to_vec());
    let info = store
        .put_reader(
            ObjectMeta::new("c").with_description("set with a buffer"),
            &mut buffered,
        )
        .await
        .unwrap();
    assert_eq!(info.size, DATA_SIZE as u64);

    let change = watch.next().await.unwrap();
    assert_eq!(change.name, "c");
    assert!(!change.deleted);

    let read = store.get("c").await.unwrap();
    let chunks: Vec<usize> = read.chunks(chunk_size).map(<[u8]>::len).collect();
    assert_eq!(chunks.iter().sum::<usize>(), DATA_SIZE);
    assert!(chunks[..chunks.len() - 1].iter().all(|len| *len == chunk_size));

    engine.delete_object_store("configs").await.unwrap();
    let err = engine.object_store("configs").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BucketNotFound);
}

async fn status_size(engine: &Engine) -> u64 {
    engine
        .object_store("configs")
        .unwrap()
        .status()
        .await
        .unwrap()
        .size
}

#[tokio::test]
async fn test_replacing_an_object_drops_old_chunks() {
    let engine = Engine::new(EngineConfig {
        object_chunk_size: 1024,
        ..EngineConfig::default()
    });
    let store = engine
        .create_object_store(ObjectStoreConfig::new("docs"))
        .await
        .unwrap();

    let first = store.put("readme", vec![1u8; 5000]).await.unwrap();
    assert_eq!(first.chunks, 5);
    let before = store.status().await.unwrap().size;

    let second = store.put("readme", vec![2u8; 100]).await.unwrap();
    assert_eq!(second.chunks, 1);
    assert_ne!(first.nuid, second.nuid);
    assert_ne!(first.digest, second.digest);

    assert!(store.status().await.unwrap().size < before);
    assert_eq!(store.get("readme").await.unwrap().as_ref(), &[2u8; 100][..]);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_object() {
    let engine = test_engine();
    let store = engine
        .create_object_store(ObjectStoreConfig::new("empty"))
        .await
        .unwrap();

    let info = store.put("nothing", Vec::new()).await.unwrap();
    assert_eq!(info.size, 0);
    assert_eq!(info.chunks, 0);
    assert_eq!(
        info.digest,
        "SHA-256=47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU="
    );
    assert!(store.get("nothing").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rename_and_conflicts() {
    let engine = test_engine();
    let store = engine
        .create_object_store(ObjectStoreConfig::new("files"))
        .await
        .unwrap();

    store.put("draft.txt", "hello").await.unwrap();
    store.put("final.txt", "world").await.unwrap();

    let err = store
        .update_meta("draft.txt", ObjectMeta::new("final.txt"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectExists);

    store
        .update_meta("draft.txt", ObjectMeta::new("published.txt"))
        .await
        .unwrap();
    assert_eq!(store.get("published.txt").await.unwrap().as_ref(), b"hello");
    let err = store.info("draft.txt").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectNotFound);

    let names: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(names, vec!["final.txt", "published.txt"]);

    let err = store.delete("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
}

#[tokio::test]
async fn test_watch_with_history_starts_with_current_objects() {
    let engine = test_engine();
    let store = engine
        .create_object_store(ObjectStoreConfig::new("assets"))
        .await
        .unwrap();

    store.put("logo.png", vec![9u8; 10]).await.unwrap();
    store.put("style.css", "body {}").await.unwrap();
    store.delete("logo.png").await.unwrap();

    let mut watch = store.watch_with_history().await.unwrap();
    let first = watch.next().await.unwrap();
    let second = watch.next().await.unwrap();
    assert_eq!((first.name.as_str(), first.deleted), ("style.css", false));
    assert_eq!((second.name.as_str(), second.deleted), ("logo.png", true));
}
