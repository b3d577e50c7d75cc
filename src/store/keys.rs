//! Key schema and wire payloads shared with workers.
//!
//! The store is the only channel between the scheduler and the worker
//! fleet: dispatch intent lives under `pending/`, worker-reported
//! progress under `status/`, cancellation markers under `stop/`, and
//! liveness registrations under `workers/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::JobStatus;

pub const PENDING_PREFIX: &str = "pending/";
pub const STATUS_PREFIX: &str = "status/";
pub const STOP_PREFIX: &str = "stop/";
pub const WORKERS_PREFIX: &str = "workers/";

pub fn pending_key(job_id: Uuid) -> String {
    format!("{}{}", PENDING_PREFIX, job_id)
}

pub fn status_key(job_id: Uuid) -> String {
    format!("{}{}", STATUS_PREFIX, job_id)
}

pub fn stop_key(job_id: Uuid) -> String {
    format!("{}{}", STOP_PREFIX, job_id)
}

pub fn worker_key(worker_id: &str) -> String {
    format!("{}{}", WORKERS_PREFIX, worker_id)
}

/// Extract the job id from a `pending/`, `status/` or `stop/` key.
pub fn job_id_from_key(prefix: &str, key: &str) -> Option<Uuid> {
    key.strip_prefix(prefix).and_then(|s| Uuid::parse_str(s).ok())
}

/// Extract the worker id from a `workers/` key.
pub fn worker_id_from_key(key: &str) -> Option<String> {
    key.strip_prefix(WORKERS_PREFIX)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Dispatch intent written by the scheduler under `pending/<job_id>`.
///
/// `worker_id` is a placement hint: the designated worker claims the
/// key by deleting it, but any worker may claim if the hint is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: Uuid,
    pub build_id: Uuid,
    pub image: String,
    pub commands: Vec<String>,
    pub env: Vec<String>,
    pub worker_id: String,
}

/// Progress record written under `status/<job_id>`, by workers for
/// lifecycle transitions and by the scheduler for requeues and stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub state: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_chunk: Option<String>,
}

impl StatusUpdate {
    pub fn state_only(state: JobStatus) -> Self {
        Self {
            state,
            started_at: None,
            ended_at: None,
            exit_code: None,
            log_chunk: None,
        }
    }
}

/// Liveness registration written by a worker under `workers/<id>`,
/// attached to its lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub addr: String,
    pub max_concurrency: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_descriptor_round_trips() {
        let descriptor = JobDescriptor {
            id: Uuid::new_v4(),
            build_id: Uuid::new_v4(),
            image: "rust:1.79".to_string(),
            commands: vec!["cargo build".to_string(), "cargo test".to_string()],
            env: vec!["CI=true".to_string()],
            worker_id: "worker-1".to_string(),
        };

        let bytes = serde_json::to_vec(&descriptor).unwrap();
        let decoded: JobDescriptor = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn key_parsing() {
        let job_id = Uuid::new_v4();
        assert_eq!(
            job_id_from_key(PENDING_PREFIX, &pending_key(job_id)),
            Some(job_id)
        );
        assert_eq!(job_id_from_key(STATUS_PREFIX, "status/not-a-uuid"), None);
        assert_eq!(
            worker_id_from_key(&worker_key("worker-9")),
            Some("worker-9".to_string())
        );
        assert_eq!(worker_id_from_key("workers/"), None);
    }
}
