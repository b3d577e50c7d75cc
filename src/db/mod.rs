//! Persisted-state contract.
//!
//! Builds, jobs and repositories live in a relational store owned by
//! the outer layers. The core only depends on these capability traits:
//! single-row updates under a primary key plus simple range queries.
//! [`memory::MemDb`] is the reference implementation used by tests and
//! standalone deployments.

pub mod memory;
mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

pub use memory::MemDb;
pub use models::{derive_build_status, Build, BuildStatus, Job, JobStatus, Repo};

#[async_trait]
pub trait BuildStore: Send + Sync + 'static {
    async fn create(&self, build: &Build) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<Build>>;

    async fn update_status(
        &self,
        id: Uuid,
        status: BuildStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Most recent builds first.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Build>>;

    async fn list_for_repo(&self, repo_id: Uuid, limit: usize, offset: usize)
        -> Result<Vec<Build>>;

    async fn list_for_user(&self, user_id: Uuid, limit: usize, offset: usize)
        -> Result<Vec<Build>>;
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn create(&self, job: &Job) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<Job>>;

    /// Single-row replacement under the primary key.
    async fn update(&self, job: &Job) -> Result<()>;

    async fn list_for_build(&self, build_id: Uuid) -> Result<Vec<Job>>;

    /// Jobs still waiting for dispatch, oldest first. Used to repopulate
    /// the scheduler queue after a restart.
    async fn list_queued(&self) -> Result<Vec<Job>>;
}

#[async_trait]
pub trait RepoStore: Send + Sync + 'static {
    async fn create(&self, repo: &Repo) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<Repo>>;
}
