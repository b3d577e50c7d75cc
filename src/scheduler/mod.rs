//! Job scheduler.
//!
//! A single assignment task owns the pending queue and the candidate
//! worker set. Every mutation arrives as a [`SchedulerMessage`], so the
//! assignment step itself is single-threaded by construction: capacity
//! is read, reserved and released without any cross-task locking.
//!
//! Dispatch intent is written to the coordination store under
//! `pending/<job_id>`; the designated worker claims the key by deleting
//! it. The store, not the scheduler, is the source of truth for
//! in-flight dispatches, which is what lets assignments survive a
//! scheduler restart.

pub mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{JobStatus, JobStore};
use crate::error::{GantryError, Result};
use crate::store::keys::{self, JobDescriptor, StatusUpdate};
use crate::store::CoordStore;

pub use queue::{PendingJob, PendingQueue};

const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Narrow capability the scheduler needs from a registered worker:
/// identity plus capacity accounting. The registry's worker entries
/// implement this; the scheduler never sees the rest of the registry.
pub trait WorkerSlot: Send + Sync {
    fn id(&self) -> &str;

    /// Free slots right now (`max - running`).
    fn capacity(&self) -> u32;

    /// Reserve one slot ahead of a dispatch write.
    fn reserve(&self);

    /// Give one slot back (dispatch rolled back or job finished).
    fn release(&self);
}

pub enum SchedulerMessage {
    Submit { job_id: Uuid },
    Cancel { job_id: Uuid },
    NotifyCapacity { worker_id: String },
    AddWorker { slot: Arc<dyn WorkerSlot> },
    RemoveWorker { worker_id: String },
    StatusChanged { job_id: Uuid, state: JobStatus },
}

/// Cheap cloneable handle used by every other component to talk to the
/// assignment task.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMessage>,
    degraded: Arc<AtomicBool>,
}

impl SchedulerHandle {
    /// Enqueue a job for dispatch. Returns immediately; fails fast when
    /// the scheduler is degraded by a permanent store failure.
    pub fn submit(&self, job_id: Uuid) -> Result<()> {
        if self.degraded.load(Ordering::Relaxed) {
            return Err(GantryError::StorePermanent(
                "scheduler degraded, rejecting submissions".to_string(),
            ));
        }
        self.send(SchedulerMessage::Submit { job_id })
    }

    pub fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.send(SchedulerMessage::Cancel { job_id })
    }

    pub fn notify_capacity(&self, worker_id: &str) -> Result<()> {
        self.send(SchedulerMessage::NotifyCapacity {
            worker_id: worker_id.to_string(),
        })
    }

    pub fn add_worker(&self, slot: Arc<dyn WorkerSlot>) -> Result<()> {
        self.send(SchedulerMessage::AddWorker { slot })
    }

    pub fn remove_worker(&self, worker_id: &str) -> Result<()> {
        self.send(SchedulerMessage::RemoveWorker {
            worker_id: worker_id.to_string(),
        })
    }

    pub fn status_changed(&self, job_id: Uuid, state: JobStatus) -> Result<()> {
        self.send(SchedulerMessage::StatusChanged { job_id, state })
    }

    pub fn healthy(&self) -> bool {
        !self.degraded.load(Ordering::Relaxed)
    }

    fn send(&self, msg: SchedulerMessage) -> Result<()> {
        self.tx
            .try_send(msg)
            .map_err(|e| GantryError::SchedulerUnavailable(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssignState {
    /// Dispatch key written, worker has not reported yet.
    Dispatched,
    Running,
}

struct Assignment {
    worker_id: String,
    /// Whether this scheduler holds a capacity reservation for the
    /// assignment. Adopted dispatches (pre-existing keys) do not.
    reserved: bool,
    state: AssignState,
}

struct Candidate {
    slot: Arc<dyn WorkerSlot>,
    /// Assignment sequence number for least-recently-assigned
    /// tie-breaking; initialized from the join sequence.
    last_assigned: u64,
}

pub struct Scheduler {
    store: Arc<dyn CoordStore>,
    jobs: Arc<dyn JobStore>,
    queue: PendingQueue,
    candidates: Vec<Candidate>,
    assigned: HashMap<Uuid, Assignment>,
    assign_seq: u64,
    retry_at: Option<Instant>,
    dispatch_retry: Duration,
    degraded: Arc<AtomicBool>,
    cancel_token: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CoordStore>,
        jobs: Arc<dyn JobStore>,
        dispatch_retry: Duration,
        cancel_token: CancellationToken,
    ) -> (Self, SchedulerHandle, mpsc::Receiver<SchedulerMessage>) {
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let degraded = Arc::new(AtomicBool::new(false));
        let scheduler = Self {
            store,
            jobs,
            queue: PendingQueue::new(),
            candidates: Vec::new(),
            assigned: HashMap::new(),
            assign_seq: 0,
            retry_at: None,
            dispatch_retry,
            degraded: degraded.clone(),
            cancel_token,
        };
        let handle = SchedulerHandle { tx, degraded };
        (scheduler, handle, rx)
    }

    /// Run the assignment loop until shutdown or until every handle is
    /// dropped. No error escapes this loop: any unexpected failure is
    /// treated as a requeue.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SchedulerMessage>) {
        tracing::info!("scheduler started");
        let cancel_token = self.cancel_token.clone();
        loop {
            // A far-future deadline keeps the select arm disabled
            // without an Option dance inside the macro.
            let retry_at = self
                .retry_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    self.drain().await;
                    return;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => {
                        self.drain().await;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(retry_at), if self.retry_at.is_some() => {
                    self.retry_at = None;
                }
            }

            self.assign_ready().await;
        }
    }

    async fn handle(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Submit { job_id } => {
                if self.assigned.contains_key(&job_id) {
                    tracing::debug!(job_id = %job_id, "already dispatched, ignoring submit");
                    return;
                }
                if self.queue.push_back(PendingJob::new(job_id)) {
                    tracing::debug!(job_id = %job_id, queued = self.queue.len(), "job enqueued");
                }
            }
            SchedulerMessage::Cancel { job_id } => self.cancel(job_id).await,
            SchedulerMessage::NotifyCapacity { worker_id } => {
                tracing::trace!(worker_id = %worker_id, "capacity signal");
            }
            SchedulerMessage::AddWorker { slot } => {
                if self.candidates.iter().any(|c| c.slot.id() == slot.id()) {
                    tracing::debug!(worker_id = slot.id(), "worker already a candidate");
                    return;
                }
                self.assign_seq += 1;
                tracing::info!(worker_id = slot.id(), capacity = slot.capacity(), "worker added");
                self.candidates.push(Candidate {
                    slot,
                    last_assigned: self.assign_seq,
                });
            }
            SchedulerMessage::RemoveWorker { worker_id } => {
                self.candidates.retain(|c| c.slot.id() != worker_id);
                self.requeue_for_worker(&worker_id).await;
            }
            SchedulerMessage::StatusChanged { job_id, state } => {
                self.apply_status(job_id, state).await;
            }
        }
    }

    /// Queued: drop from the queue and report the job stopped through
    /// the store. Dispatched: write a stop marker for the worker.
    /// Unknown: no-op.
    async fn cancel(&mut self, job_id: Uuid) {
        if self.queue.remove(job_id).is_some() {
            let update = StatusUpdate {
                ended_at: Some(Utc::now()),
                ..StatusUpdate::state_only(JobStatus::Stopped)
            };
            match serde_json::to_vec(&update) {
                Ok(bytes) => {
                    if let Err(e) = self.store.put(&keys::status_key(job_id), bytes, None).await {
                        tracing::warn!(job_id = %job_id, error = %e, "failed to record stop");
                    }
                }
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "stop encode failed"),
            }
            tracing::info!(job_id = %job_id, "queued job cancelled");
        } else if self.assigned.contains_key(&job_id) {
            if let Err(e) = self
                .store
                .put(&keys::stop_key(job_id), b"stop".to_vec(), None)
                .await
            {
                tracing::warn!(job_id = %job_id, error = %e, "failed to write stop marker");
            } else {
                tracing::info!(job_id = %job_id, "stop marker written");
            }
        }
    }

    /// Re-enqueue every non-terminal job assigned to a lost worker,
    /// exactly once per disconnect. The unclaimed dispatch key (if any)
    /// is deleted and the job's state is written back as queued so the
    /// persisted row follows.
    async fn requeue_for_worker(&mut self, worker_id: &str) {
        let orphans: Vec<Uuid> = self
            .assigned
            .iter()
            .filter(|(_, a)| a.worker_id == worker_id)
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in orphans {
            let Some(assignment) = self.assigned.remove(&job_id) else {
                continue;
            };
            if let Err(e) = self.store.delete(&keys::pending_key(job_id)).await {
                tracing::warn!(job_id = %job_id, error = %e, "stale dispatch delete failed");
            }
            let update = StatusUpdate::state_only(JobStatus::Queued);
            match serde_json::to_vec(&update) {
                Ok(bytes) => {
                    if let Err(e) = self.store.put(&keys::status_key(job_id), bytes, None).await {
                        tracing::warn!(job_id = %job_id, error = %e, "requeue status write failed");
                    }
                }
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "requeue encode failed"),
            }
            self.queue.push_front(PendingJob::new(job_id));
            tracing::info!(
                job_id = %job_id,
                worker_id,
                state = ?assignment.state,
                "job requeued after worker loss"
            );
        }
    }

    async fn apply_status(&mut self, job_id: Uuid, state: JobStatus) {
        match state {
            JobStatus::Queued => {
                // Echo of our own requeue write.
            }
            JobStatus::Running => {
                if let Some(assignment) = self.assigned.get_mut(&job_id) {
                    assignment.state = AssignState::Running;
                }
            }
            _ => {
                if let Some(assignment) = self.assigned.remove(&job_id) {
                    if assignment.reserved {
                        if let Some(candidate) = self
                            .candidates
                            .iter()
                            .find(|c| c.slot.id() == assignment.worker_id)
                        {
                            candidate.slot.release();
                        }
                    }
                    tracing::info!(job_id = %job_id, status = %state, "job finished");
                } else {
                    // Terminal report for a job we still hold queued
                    // (e.g. a cancel raced the dispatch); drop it.
                    self.queue.remove(job_id);
                }
                // Done keys are pruned so the status prefix stays small.
                let _ = self.store.delete(&keys::status_key(job_id)).await;
                let _ = self.store.delete(&keys::stop_key(job_id)).await;
            }
        }
    }

    /// Assign while the queue is non-empty, some worker has capacity,
    /// and no dispatch backoff is pending.
    async fn assign_ready(&mut self) {
        if self.degraded.load(Ordering::Relaxed) || self.retry_at.is_some() {
            return;
        }
        while !self.queue.is_empty() {
            let Some(idx) = self.pick_worker() else { break };
            let Some(pending) = self.queue.pop_front() else { break };
            if !self.dispatch(pending, idx).await {
                break;
            }
        }
    }

    /// Least-loaded selection: largest absolute remaining capacity,
    /// ties broken by least recently assigned.
    fn pick_worker(&self) -> Option<usize> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.slot.capacity() > 0)
            .max_by_key(|(_, c)| (c.slot.capacity(), std::cmp::Reverse(c.last_assigned)))
            .map(|(idx, _)| idx)
    }

    /// Returns `false` when assignment should pause (store trouble).
    async fn dispatch(&mut self, pending: PendingJob, idx: usize) -> bool {
        let job_id = pending.job_id;

        let job = match self.jobs.find(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "job row missing, dropping");
                return true;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "job lookup failed");
                self.queue.push_front(pending);
                self.retry_at = Some(Instant::now() + self.dispatch_retry);
                return false;
            }
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "job already terminal");
            return true;
        }

        let slot = self.candidates[idx].slot.clone();
        slot.reserve();

        let descriptor = JobDescriptor {
            id: job.id,
            build_id: job.build_id,
            image: job.image,
            commands: job.commands,
            env: job.env,
            worker_id: slot.id().to_string(),
        };
        let bytes = match serde_json::to_vec(&descriptor) {
            Ok(bytes) => bytes,
            Err(e) => {
                slot.release();
                tracing::error!(job_id = %job_id, error = %e, "descriptor encode failed");
                return true;
            }
        };

        match self.store.create(&keys::pending_key(job_id), bytes, None).await {
            Ok(true) => {
                self.assign_seq += 1;
                self.candidates[idx].last_assigned = self.assign_seq;
                self.assigned.insert(
                    job_id,
                    Assignment {
                        worker_id: slot.id().to_string(),
                        reserved: true,
                        state: AssignState::Dispatched,
                    },
                );
                tracing::info!(job_id = %job_id, worker_id = slot.id(), "job dispatched");
                true
            }
            Ok(false) => {
                // A dispatch for this job already exists; adopt it
                // rather than double-submitting.
                slot.release();
                let worker_hint = match self.store.get(&keys::pending_key(job_id)).await {
                    Ok(Some(bytes)) => serde_json::from_slice::<JobDescriptor>(&bytes)
                        .map(|d| d.worker_id)
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                tracing::warn!(
                    error = %GantryError::DispatchConflict(job_id),
                    worker_hint = %worker_hint,
                    "adopting existing dispatch"
                );
                self.assigned.insert(
                    job_id,
                    Assignment {
                        worker_id: worker_hint,
                        reserved: false,
                        state: AssignState::Dispatched,
                    },
                );
                true
            }
            Err(e) if e.is_transient() => {
                slot.release();
                self.queue.push_front(pending);
                self.retry_at = Some(Instant::now() + self.dispatch_retry);
                tracing::warn!(job_id = %job_id, error = %e, "dispatch write failed, backing off");
                false
            }
            Err(e) => {
                slot.release();
                self.queue.push_front(pending);
                self.degraded.store(true, Ordering::Relaxed);
                tracing::error!(error = %e, "permanent store failure, scheduler degraded");
                false
            }
        }
    }

    /// Shutdown drain: pending jobs keep their queued state in the
    /// store so a successor scheduler picks them up.
    async fn drain(&mut self) {
        let pending: Vec<Uuid> = self.queue.iter().map(|p| p.job_id).collect();
        for job_id in &pending {
            let update = StatusUpdate::state_only(JobStatus::Queued);
            if let Ok(bytes) = serde_json::to_vec(&update) {
                let _ = self.store.put(&keys::status_key(*job_id), bytes, None).await;
            }
        }
        tracing::info!(
            pending = pending.len(),
            in_flight = self.assigned.len(),
            "scheduler drained"
        );
    }
}
