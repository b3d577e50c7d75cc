//! Coordination store semantics: revisions, create-if-absent, prefix
//! watches (snapshot and resumed), and lease-bound liveness keys.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use gantry::store::{CoordStore, EventKind, MemStore};

#[tokio::test]
async fn put_get_delete_round_trip() {
    let store = MemStore::new();

    let rev1 = store.put("a/1", b"one".to_vec(), None).await.unwrap();
    let rev2 = store.put("a/2", b"two".to_vec(), None).await.unwrap();
    assert!(rev2 > rev1, "revisions are monotonic");

    assert_eq!(store.get("a/1").await.unwrap(), Some(b"one".to_vec()));
    assert_eq!(store.get("missing").await.unwrap(), None);

    assert!(store.delete("a/1").await.unwrap());
    assert!(!store.delete("a/1").await.unwrap());
    assert_eq!(store.get("a/1").await.unwrap(), None);
}

#[tokio::test]
async fn create_is_atomic_if_absent() {
    let store = MemStore::new();

    assert!(store.create("k", b"first".to_vec(), None).await.unwrap());
    assert!(!store.create("k", b"second".to_vec(), None).await.unwrap());
    // The losing create leaves the value untouched.
    assert_eq!(store.get("k").await.unwrap(), Some(b"first".to_vec()));

    store.delete("k").await.unwrap();
    assert!(store.create("k", b"third".to_vec(), None).await.unwrap());
}

#[tokio::test]
async fn get_prefix_scopes_to_prefix() {
    let store = MemStore::new();
    store.put("jobs/1", b"a".to_vec(), None).await.unwrap();
    store.put("jobs/2", b"b".to_vec(), None).await.unwrap();
    store.put("workers/1", b"c".to_vec(), None).await.unwrap();

    let (kvs, revision) = store.get_prefix("jobs/").await.unwrap();
    assert_eq!(kvs.len(), 2);
    assert!(kvs.iter().all(|(k, _)| k.starts_with("jobs/")));
    assert!(revision >= 2);
}

#[tokio::test]
async fn watch_replays_snapshot_then_follows() {
    let store = MemStore::new();
    store.put("w/1", b"before".to_vec(), None).await.unwrap();

    let mut stream = store.watch("w/", 0).await.unwrap();

    // Snapshot put for the pre-existing key.
    let first = stream.next().await.unwrap();
    assert_eq!(first.key, "w/1");
    assert_eq!(first.kind, EventKind::Put);
    assert_eq!(first.value, b"before".to_vec());

    // Live events follow, per-key in order.
    store.put("w/1", b"after".to_vec(), None).await.unwrap();
    store.delete("w/1").await.unwrap();

    let second = stream.next().await.unwrap();
    assert_eq!(second.kind, EventKind::Put);
    assert_eq!(second.value, b"after".to_vec());
    let third = stream.next().await.unwrap();
    assert_eq!(third.kind, EventKind::Delete);
    assert!(third.revision > second.revision);
}

#[tokio::test]
async fn watch_ignores_other_prefixes() {
    let store = MemStore::new();
    let mut stream = store.watch("jobs/", 0).await.unwrap();

    store.put("workers/9", b"x".to_vec(), None).await.unwrap();
    store.put("jobs/1", b"y".to_vec(), None).await.unwrap();

    let event = stream.next().await.unwrap();
    assert_eq!(event.key, "jobs/1");
}

#[tokio::test]
async fn watch_resumes_from_revision() {
    let store = MemStore::new();
    let rev = store.put("r/1", b"one".to_vec(), None).await.unwrap();
    store.put("r/2", b"two".to_vec(), None).await.unwrap();

    // Resume past the first write: only the second is replayed.
    let mut stream = store.watch("r/", rev + 1).await.unwrap();
    let event = stream.next().await.unwrap();
    assert_eq!(event.key, "r/2");
}

#[tokio::test]
async fn lease_expiry_removes_attached_keys() {
    let store = Arc::new(MemStore::new());
    let lease = store.lease(Duration::from_millis(100)).await.unwrap();
    store
        .put("workers/w1", b"reg".to_vec(), Some(lease))
        .await
        .unwrap();

    let mut stream = store.watch("workers/", 0).await.unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.kind, EventKind::Put);

    // No keep-alive: the key disappears with the lease.
    let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("lease never expired")
        .unwrap();
    assert_eq!(second.kind, EventKind::Delete);
    assert_eq!(second.key, "workers/w1");
    assert_eq!(store.get("workers/w1").await.unwrap(), None);
}

#[tokio::test]
async fn keep_alive_extends_a_lease() {
    let store = Arc::new(MemStore::new());
    let lease = store.lease(Duration::from_millis(150)).await.unwrap();
    store
        .put("workers/w1", b"reg".to_vec(), Some(lease))
        .await
        .unwrap();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(80)).await;
        store.keep_alive(lease).await.unwrap();
    }
    // Well past the original TTL, the key survives.
    assert!(store.get("workers/w1").await.unwrap().is_some());

    // Stop refreshing and it goes away.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.get("workers/w1").await.unwrap(), None);
    assert!(store.keep_alive(lease).await.is_err());
}

#[tokio::test]
async fn deleting_a_key_detaches_it_from_its_lease() {
    let store = Arc::new(MemStore::new());
    let lease = store.lease(Duration::from_millis(100)).await.unwrap();
    store
        .put("ephemeral/1", b"v".to_vec(), Some(lease))
        .await
        .unwrap();
    store.delete("ephemeral/1").await.unwrap();
    store
        .put("ephemeral/1", b"fresh".to_vec(), None)
        .await
        .unwrap();

    // Lease expiry must not take the re-created, unleased key with it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        store.get("ephemeral/1").await.unwrap(),
        Some(b"fresh".to_vec())
    );
}
