//! Scheduler tests: assignment policy, capacity accounting, dispatch
//! conflicts, cancellation and requeue after worker loss.


use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gantry::db::{JobStatus, MemDb};
use gantry::store::keys::{self, JobDescriptor, StatusUpdate};
use gantry::store::{CoordStore, MemStore};
use test_harness::{
    assert_eventually, claim_dispatch, pending_descriptor, seed_job, spawn_scheduler, FakeSlot,
};

#[tokio::test]
async fn submit_writes_dispatch_key_with_worker_hint() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    let worker = FakeSlot::new("w1", 2);
    handle.add_worker(worker.clone()).unwrap();

    let job = seed_job(&db).await;
    handle.submit(job.id).unwrap();

    let store_probe = store.clone();
    let job_id = job.id;
    assert_eventually(
        || async { pending_descriptor(store_probe.as_ref(), job_id).await.is_some() },
        Duration::from_secs(2),
        "dispatch key never appeared",
    )
    .await;

    let descriptor = pending_descriptor(store.as_ref(), job.id).await.unwrap();
    assert_eq!(descriptor.id, job.id);
    assert_eq!(descriptor.build_id, job.build_id);
    assert_eq!(descriptor.image, job.image);
    assert_eq!(descriptor.commands, job.commands);
    assert_eq!(descriptor.worker_id, "w1");
    assert_eq!(worker.running(), 1);
    assert!(handle.healthy());

    cancel.cancel();
}

#[tokio::test]
async fn refuses_to_assign_without_capacity() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    // A saturated worker is not a candidate.
    let worker = FakeSlot::with_running("w1", 1, 1);
    handle.add_worker(worker).unwrap();

    let job = seed_job(&db).await;
    handle.submit(job.id).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pending_descriptor(store.as_ref(), job.id).await.is_none());

    cancel.cancel();
}

#[tokio::test]
async fn saturated_worker_gets_next_job_after_completion() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    let worker = FakeSlot::new("w1", 1);
    handle.add_worker(worker.clone()).unwrap();

    let first = seed_job(&db).await;
    let second = seed_job(&db).await;
    handle.submit(first.id).unwrap();
    handle.submit(second.id).unwrap();

    let store_probe = store.clone();
    let first_id = first.id;
    assert_eventually(
        || async { pending_descriptor(store_probe.as_ref(), first_id).await.is_some() },
        Duration::from_secs(2),
        "first job never dispatched",
    )
    .await;
    assert!(pending_descriptor(store.as_ref(), second.id).await.is_none());

    // Worker claims and finishes the first job.
    claim_dispatch(store.as_ref(), first.id).await.unwrap();
    handle.status_changed(first.id, JobStatus::Passing).unwrap();

    let store_probe = store.clone();
    let second_id = second.id;
    assert_eventually(
        || async { pending_descriptor(store_probe.as_ref(), second_id).await.is_some() },
        Duration::from_secs(2),
        "second job not dispatched after capacity freed",
    )
    .await;
    assert_eq!(worker.running(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn least_loaded_selection_with_fifo_tie_break() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    // W1 has 3 free slots, W2 has 2.
    let w1 = FakeSlot::with_running("w1", 4, 1);
    let w2 = FakeSlot::new("w2", 2);
    handle.add_worker(w1.clone()).unwrap();
    handle.add_worker(w2.clone()).unwrap();

    let first = seed_job(&db).await;
    handle.submit(first.id).unwrap();

    let store_probe = store.clone();
    let first_id = first.id;
    assert_eventually(
        || async { pending_descriptor(store_probe.as_ref(), first_id).await.is_some() },
        Duration::from_secs(2),
        "first job never dispatched",
    )
    .await;
    let descriptor = pending_descriptor(store.as_ref(), first.id).await.unwrap();
    assert_eq!(descriptor.worker_id, "w1", "largest free capacity wins");

    // Now both have 2 free slots; the tie goes to the worker assigned
    // least recently.
    let second = seed_job(&db).await;
    handle.submit(second.id).unwrap();

    let store_probe = store.clone();
    let second_id = second.id;
    assert_eventually(
        || async { pending_descriptor(store_probe.as_ref(), second_id).await.is_some() },
        Duration::from_secs(2),
        "second job never dispatched",
    )
    .await;
    let descriptor = pending_descriptor(store.as_ref(), second.id).await.unwrap();
    assert_eq!(descriptor.worker_id, "w2", "tie breaks to least recently assigned");

    cancel.cancel();
}

#[tokio::test]
async fn preexisting_dispatch_key_is_adopted_not_duplicated() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    let worker = FakeSlot::new("w1", 2);
    handle.add_worker(worker.clone()).unwrap();

    let job = seed_job(&db).await;
    let existing = JobDescriptor {
        id: job.id,
        build_id: job.build_id,
        image: job.image.clone(),
        commands: job.commands.clone(),
        env: Vec::new(),
        worker_id: "other-scheduler".to_string(),
    };
    store
        .put(
            &keys::pending_key(job.id),
            serde_json::to_vec(&existing).unwrap(),
            None,
        )
        .await
        .unwrap();

    handle.submit(job.id).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The key is untouched and no capacity was reserved here.
    let descriptor = pending_descriptor(store.as_ref(), job.id).await.unwrap();
    assert_eq!(descriptor.worker_id, "other-scheduler");
    assert_eq!(worker.running(), 0);

    // The adopted dispatch still completes normally.
    claim_dispatch(store.as_ref(), job.id).await.unwrap();
    handle.status_changed(job.id, JobStatus::Passing).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(worker.running(), 0);

    cancel.cancel();
}

#[tokio::test]
async fn cancel_of_queued_job_reports_stopped() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    // No workers: the job stays queued.
    let job = seed_job(&db).await;
    handle.submit(job.id).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel(job.id).unwrap();

    let store_probe = store.clone();
    let job_id = job.id;
    assert_eventually(
        || async {
            match store_probe.get(&keys::status_key(job_id)).await.unwrap() {
                Some(bytes) => {
                    let update: StatusUpdate = serde_json::from_slice(&bytes).unwrap();
                    update.state == JobStatus::Stopped
                }
                None => false,
            }
        },
        Duration::from_secs(2),
        "cancelled job never reported stopped",
    )
    .await;

    // A worker arriving later must not receive the cancelled job.
    let worker = FakeSlot::new("w1", 1);
    handle.add_worker(worker).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pending_descriptor(store.as_ref(), job.id).await.is_none());

    cancel.cancel();
}

#[tokio::test]
async fn cancel_of_dispatched_job_writes_stop_marker() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    let worker = FakeSlot::new("w1", 1);
    handle.add_worker(worker).unwrap();

    let job = seed_job(&db).await;
    handle.submit(job.id).unwrap();

    let store_probe = store.clone();
    let job_id = job.id;
    assert_eventually(
        || async { pending_descriptor(store_probe.as_ref(), job_id).await.is_some() },
        Duration::from_secs(2),
        "job never dispatched",
    )
    .await;

    handle.cancel(job.id).unwrap();

    let store_probe = store.clone();
    assert_eventually(
        || async {
            store_probe
                .get(&keys::stop_key(job_id))
                .await
                .unwrap()
                .is_some()
        },
        Duration::from_secs(2),
        "stop marker never written",
    )
    .await;

    cancel.cancel();
}

#[tokio::test]
async fn cancel_of_unknown_job_is_a_noop() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    let unknown = Uuid::new_v4();
    handle.cancel(unknown).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(store.get(&keys::status_key(unknown)).await.unwrap().is_none());
    assert!(store.get(&keys::stop_key(unknown)).await.unwrap().is_none());

    cancel.cancel();
}

#[tokio::test]
async fn worker_loss_requeues_and_redispatches() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    let w1 = FakeSlot::new("w1", 1);
    handle.add_worker(w1.clone()).unwrap();

    let job = seed_job(&db).await;
    handle.submit(job.id).unwrap();

    let store_probe = store.clone();
    let job_id = job.id;
    assert_eventually(
        || async { pending_descriptor(store_probe.as_ref(), job_id).await.is_some() },
        Duration::from_secs(2),
        "job never dispatched",
    )
    .await;

    // Worker claims the key and starts running, then disappears.
    claim_dispatch(store.as_ref(), job.id).await.unwrap();
    handle.status_changed(job.id, JobStatus::Running).unwrap();
    handle.remove_worker("w1").unwrap();

    // The requeue is visible through the store.
    let store_probe = store.clone();
    assert_eventually(
        || async {
            match store_probe.get(&keys::status_key(job_id)).await.unwrap() {
                Some(bytes) => {
                    let update: StatusUpdate = serde_json::from_slice(&bytes).unwrap();
                    update.state == JobStatus::Queued
                }
                None => false,
            }
        },
        Duration::from_secs(2),
        "lost job never requeued",
    )
    .await;

    // A fresh worker picks it up.
    let w2 = FakeSlot::new("w2", 1);
    handle.add_worker(w2).unwrap();

    let store_probe = store.clone();
    assert_eventually(
        || async {
            pending_descriptor(store_probe.as_ref(), job_id)
                .await
                .is_some_and(|d| d.worker_id == "w2")
        },
        Duration::from_secs(2),
        "job not redispatched to the new worker",
    )
    .await;

    cancel.cancel();
}

#[tokio::test]
async fn duplicate_submits_dispatch_once() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    let worker = FakeSlot::new("w1", 4);
    handle.add_worker(worker.clone()).unwrap();

    let job = seed_job(&db).await;
    handle.submit(job.id).unwrap();
    handle.submit(job.id).unwrap();
    handle.submit(job.id).unwrap();

    let store_probe = store.clone();
    let job_id = job.id;
    assert_eventually(
        || async { pending_descriptor(store_probe.as_ref(), job_id).await.is_some() },
        Duration::from_secs(2),
        "job never dispatched",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(worker.running(), 1, "duplicate submits must not reserve twice");

    cancel.cancel();
}

#[tokio::test]
async fn capacity_returns_to_zero_after_completion() {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(store.clone(), db.clone(), &cancel);

    let worker = FakeSlot::new("w1", 2);
    handle.add_worker(worker.clone()).unwrap();

    let job = seed_job(&db).await;
    handle.submit(job.id).unwrap();

    let store_probe = store.clone();
    let job_id = job.id;
    assert_eventually(
        || async { pending_descriptor(store_probe.as_ref(), job_id).await.is_some() },
        Duration::from_secs(2),
        "job never dispatched",
    )
    .await;

    claim_dispatch(store.as_ref(), job.id).await.unwrap();
    handle.status_changed(job.id, JobStatus::Running).unwrap();
    handle.status_changed(job.id, JobStatus::Passing).unwrap();

    let worker_probe = worker.clone();
    assert_eventually(
        || async { worker_probe.running() == 0 },
        Duration::from_secs(2),
        "capacity never released",
    )
    .await;

    cancel.cancel();
}
