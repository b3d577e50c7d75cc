//! End-to-end dispatch scenarios: trigger through the orchestrator,
//! assignment through the scheduler, worker progress through the
//! coordination store, and build state back out of the status watch.


use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gantry::db::{BuildStatus, BuildStore, JobStatus, JobStore, MemDb};
use gantry::events::EventBus;
use gantry::scheduler::SchedulerHandle;
use gantry::scm::FixedScm;
use gantry::server::run_status_watch;
use gantry::store::{CoordStore, MemStore};
use test_harness::{
    assert_eventually, claim_dispatch, pending_descriptor, report_status, running_update,
    seed_repo, spawn_scheduler, terminal_update, FakeSlot, make_orchestrator,
};

struct Pipeline {
    store: Arc<MemStore>,
    db: Arc<MemDb>,
    scm: Arc<FixedScm>,
    scheduler: SchedulerHandle,
    orchestrator: Arc<gantry::orchestrator::Orchestrator>,
    cancel: CancellationToken,
}

/// Wire a full control plane over an in-process store, minus the gRPC
/// registry (workers are plain capacity slots).
async fn pipeline() -> Pipeline {
    let store = Arc::new(MemStore::new());
    let db = Arc::new(MemDb::new());
    let scm = Arc::new(FixedScm::new());
    let events = EventBus::new(16);
    let cancel = CancellationToken::new();
    let scheduler = spawn_scheduler(store.clone(), db.clone(), &cancel);
    let orchestrator = make_orchestrator(db.clone(), scm.clone(), scheduler.clone(), events);

    let watch_store: Arc<dyn CoordStore> = store.clone();
    tokio::spawn(run_status_watch(
        watch_store,
        orchestrator.clone(),
        scheduler.clone(),
        cancel.clone(),
    ));

    Pipeline {
        store,
        db,
        scm,
        scheduler,
        orchestrator,
        cancel,
    }
}

const ONE_JOB: &str = "image: alpine:3\ncommands: [\"make\"]\n";

async fn build_status(db: &MemDb, build_id: Uuid) -> BuildStatus {
    BuildStore::find(db, build_id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn single_job_on_single_worker_runs_to_passing() {
    let p = pipeline().await;
    let worker = FakeSlot::new("w1", 2);
    p.scheduler.add_worker(worker.clone()).unwrap();

    let repo = seed_repo(&p.db, &p.scm, "1111aaa", ONE_JOB).await;
    let build_id = p.orchestrator.trigger(repo.id, Uuid::new_v4()).await.unwrap();
    let job = p.db.list_for_build(build_id).await.unwrap().remove(0);

    // Dispatch intent appears in the store.
    let store = p.store.clone();
    let job_id = job.id;
    assert_eventually(
        || async { pending_descriptor(store.as_ref(), job_id).await.is_some() },
        Duration::from_secs(2),
        "dispatch key never appeared",
    )
    .await;

    // The worker claims it and reports progress.
    claim_dispatch(p.store.as_ref(), job.id).await.unwrap();
    report_status(p.store.as_ref(), job.id, running_update()).await;

    let db = p.db.clone();
    assert_eventually(
        || async { build_status(&db, build_id).await == BuildStatus::Running },
        Duration::from_secs(2),
        "build never started running",
    )
    .await;

    report_status(p.store.as_ref(), job.id, terminal_update(JobStatus::Passing)).await;

    let db = p.db.clone();
    assert_eventually(
        || async { build_status(&db, build_id).await == BuildStatus::Passing },
        Duration::from_secs(2),
        "build never passed",
    )
    .await;

    // Capacity is fully released.
    let worker_probe = worker.clone();
    assert_eventually(
        || async { worker_probe.running() == 0 },
        Duration::from_secs(2),
        "worker capacity not released",
    )
    .await;

    p.cancel.cancel();
}

#[tokio::test]
async fn saturation_holds_second_job_until_first_completes() {
    let p = pipeline().await;
    let worker = FakeSlot::new("w1", 1);
    p.scheduler.add_worker(worker.clone()).unwrap();

    let config = r#"
image: alpine:3
commands: ["make"]
matrix:
  - SUITE: a
  - SUITE: b
"#;
    let repo = seed_repo(&p.db, &p.scm, "2222bbb", config).await;
    let build_id = p.orchestrator.trigger(repo.id, Uuid::new_v4()).await.unwrap();
    let jobs = p.db.list_for_build(build_id).await.unwrap();
    let (first, second) = (jobs[0].clone(), jobs[1].clone());

    let store = p.store.clone();
    let first_id = first.id;
    assert_eventually(
        || async { pending_descriptor(store.as_ref(), first_id).await.is_some() },
        Duration::from_secs(2),
        "first job never dispatched",
    )
    .await;
    assert!(
        pending_descriptor(p.store.as_ref(), second.id).await.is_none(),
        "second job must wait for capacity"
    );

    claim_dispatch(p.store.as_ref(), first.id).await.unwrap();
    report_status(p.store.as_ref(), first.id, running_update()).await;
    report_status(p.store.as_ref(), first.id, terminal_update(JobStatus::Passing)).await;

    // Completion frees the slot and the second job follows promptly.
    let store = p.store.clone();
    let second_id = second.id;
    assert_eventually(
        || async { pending_descriptor(store.as_ref(), second_id).await.is_some() },
        Duration::from_secs(1),
        "second job not dispatched after completion",
    )
    .await;

    p.cancel.cancel();
}

#[tokio::test]
async fn worker_death_mid_job_redispatches_to_replacement() {
    let p = pipeline().await;
    let w1 = FakeSlot::new("w1", 1);
    p.scheduler.add_worker(w1.clone()).unwrap();

    let repo = seed_repo(&p.db, &p.scm, "3333ccc", ONE_JOB).await;
    let build_id = p.orchestrator.trigger(repo.id, Uuid::new_v4()).await.unwrap();
    let job = p.db.list_for_build(build_id).await.unwrap().remove(0);

    let store = p.store.clone();
    let job_id = job.id;
    assert_eventually(
        || async { pending_descriptor(store.as_ref(), job_id).await.is_some() },
        Duration::from_secs(2),
        "job never dispatched",
    )
    .await;

    claim_dispatch(p.store.as_ref(), job.id).await.unwrap();
    report_status(p.store.as_ref(), job.id, running_update()).await;

    let db = p.db.clone();
    assert_eventually(
        || async { build_status(&db, build_id).await == BuildStatus::Running },
        Duration::from_secs(2),
        "build never started running",
    )
    .await;

    // The worker vanishes mid-job.
    p.scheduler.remove_worker("w1").unwrap();

    // Its job is rolled back to queued in the relational store.
    let db = p.db.clone();
    assert_eventually(
        || async {
            gantry::db::JobStore::find(db.as_ref(), job_id)
                .await
                .unwrap()
                .unwrap()
                .status
                == JobStatus::Queued
        },
        Duration::from_secs(2),
        "job row never reset to queued",
    )
    .await;

    // A replacement worker receives the same job.
    let w2 = FakeSlot::new("w2", 1);
    p.scheduler.add_worker(w2).unwrap();

    let store = p.store.clone();
    assert_eventually(
        || async {
            pending_descriptor(store.as_ref(), job_id)
                .await
                .is_some_and(|d| d.worker_id == "w2")
        },
        Duration::from_secs(2),
        "job not redispatched to replacement",
    )
    .await;

    // The replacement runs it to completion.
    claim_dispatch(p.store.as_ref(), job.id).await.unwrap();
    report_status(p.store.as_ref(), job.id, running_update()).await;
    report_status(p.store.as_ref(), job.id, terminal_update(JobStatus::Passing)).await;

    let db = p.db.clone();
    assert_eventually(
        || async { build_status(&db, build_id).await == BuildStatus::Passing },
        Duration::from_secs(2),
        "build never passed after redispatch",
    )
    .await;

    p.cancel.cancel();
}

#[tokio::test]
async fn cancelled_queued_job_ends_stopped_and_fails_the_build() {
    let p = pipeline().await;
    // No workers: the job stays queued until cancelled.
    let repo = seed_repo(&p.db, &p.scm, "4444ddd", ONE_JOB).await;
    let build_id = p.orchestrator.trigger(repo.id, Uuid::new_v4()).await.unwrap();
    let job = p.db.list_for_build(build_id).await.unwrap().remove(0);

    p.scheduler.cancel(job.id).unwrap();

    let db = p.db.clone();
    let job_id = job.id;
    assert_eventually(
        || async {
            gantry::db::JobStore::find(db.as_ref(), job_id)
                .await
                .unwrap()
                .unwrap()
                .status
                == JobStatus::Stopped
        },
        Duration::from_secs(2),
        "cancelled job never marked stopped",
    )
    .await;

    let db = p.db.clone();
    assert_eventually(
        || async { build_status(&db, build_id).await == BuildStatus::Failing },
        Duration::from_secs(2),
        "stopped job should fail the build",
    )
    .await;

    p.cancel.cancel();
}
