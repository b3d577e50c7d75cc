use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A job waiting for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub job_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingJob {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// FIFO queue of pending jobs. Requeued jobs go back to the head so a
/// worker loss does not push its jobs behind newer submissions.
#[derive(Debug, Default)]
pub struct PendingQueue {
    jobs: VecDeque<PendingJob>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the tail. Returns `false` if the job is already queued.
    pub fn push_back(&mut self, job: PendingJob) -> bool {
        if self.contains(job.job_id) {
            return false;
        }
        self.jobs.push_back(job);
        true
    }

    /// Enqueue at the head (requeue path).
    pub fn push_front(&mut self, job: PendingJob) -> bool {
        if self.contains(job.job_id) {
            return false;
        }
        self.jobs.push_front(job);
        true
    }

    pub fn pop_front(&mut self) -> Option<PendingJob> {
        self.jobs.pop_front()
    }

    pub fn remove(&mut self, job_id: Uuid) -> Option<PendingJob> {
        let idx = self.jobs.iter().position(|j| j.job_id == job_id)?;
        self.jobs.remove(idx)
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.jobs.iter().any(|j| j.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingJob> {
        self.jobs.iter()
    }
}
