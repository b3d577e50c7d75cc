use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Passing,
    Failing,
    Errored,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Queued => write!(f, "queued"),
            BuildStatus::Running => write!(f, "running"),
            BuildStatus::Passing => write!(f, "passing"),
            BuildStatus::Failing => write!(f, "failing"),
            BuildStatus::Errored => write!(f, "errored"),
        }
    }
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Passing | BuildStatus::Failing | BuildStatus::Errored
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Passing,
    Failing,
    Errored,
    Stopped,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Passing => write!(f, "passing"),
            JobStatus::Failing => write!(f, "failing"),
            JobStatus::Errored => write!(f, "errored"),
            JobStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Passing | JobStatus::Failing | JobStatus::Errored | JobStatus::Stopped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub repo_id: Uuid,
    pub user_id: Uuid,
    pub commit_ref: String,
    pub status: BuildStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Build {
    pub fn new(repo_id: Uuid, user_id: Uuid, commit_ref: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo_id,
            user_id,
            commit_ref,
            status: BuildStatus::Queued,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub build_id: Uuid,
    pub image: String,
    pub commands: Vec<String>,
    pub env: Vec<String>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub log: String,
}

impl Job {
    pub fn new(build_id: Uuid, image: String, commands: Vec<String>, env: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            image,
            commands,
            env,
            status: JobStatus::Queued,
            started_at: None,
            ended_at: None,
            log: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: Uuid,
    pub name: String,
    pub clone_url: String,
    pub default_branch: String,
}

/// Derive a build's status from the statuses of its jobs.
///
/// Pure and idempotent: any queued or running job keeps the build
/// running; otherwise failures dominate errors, and a stopped job
/// counts as a failure.
pub fn derive_build_status(jobs: &[JobStatus]) -> BuildStatus {
    if jobs
        .iter()
        .any(|s| matches!(s, JobStatus::Queued | JobStatus::Running))
    {
        return BuildStatus::Running;
    }
    if jobs.iter().all(|s| *s == JobStatus::Passing) {
        return BuildStatus::Passing;
    }
    let any_failing = jobs
        .iter()
        .any(|s| matches!(s, JobStatus::Failing | JobStatus::Stopped));
    if jobs.iter().any(|s| *s == JobStatus::Errored) && !any_failing {
        return BuildStatus::Errored;
    }
    BuildStatus::Failing
}
