//! In-memory reference implementation of the persistence contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{Build, BuildStatus, BuildStore, Job, JobStatus, JobStore, Repo, RepoStore};
use crate::error::{GantryError, Result};

#[derive(Default)]
pub struct MemDb {
    builds: RwLock<HashMap<Uuid, Build>>,
    // Jobs keep an insertion sequence so range queries preserve
    // submission order.
    jobs: RwLock<HashMap<Uuid, (u64, Job)>>,
    repos: RwLock<HashMap<Uuid, Repo>>,
    job_seq: AtomicU64,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(mut items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    if offset >= items.len() {
        return Vec::new();
    }
    items.drain(..offset);
    items.truncate(limit);
    items
}

#[async_trait]
impl BuildStore for MemDb {
    async fn create(&self, build: &Build) -> Result<()> {
        self.builds.write().await.insert(build.id, build.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Build>> {
        Ok(self.builds.read().await.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: BuildStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut builds = self.builds.write().await;
        let build = builds.get_mut(&id).ok_or(GantryError::BuildNotFound(id))?;
        build.status = status;
        if started_at.is_some() {
            build.started_at = started_at;
        }
        if ended_at.is_some() {
            build.ended_at = ended_at;
        }
        Ok(())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Build>> {
        let mut builds: Vec<Build> = self.builds.read().await.values().cloned().collect();
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(builds, limit, offset))
    }

    async fn list_for_repo(
        &self,
        repo_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .builds
            .read()
            .await
            .values()
            .filter(|b| b.repo_id == repo_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(builds, limit, offset))
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .builds
            .read()
            .await
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(builds, limit, offset))
    }
}

#[async_trait]
impl JobStore for MemDb {
    async fn create(&self, job: &Job) -> Result<()> {
        let seq = self.job_seq.fetch_add(1, Ordering::Relaxed);
        self.jobs.write().await.insert(job.id, (seq, job.clone()));
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).map(|(_, job)| job.clone()))
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(&job.id)
            .ok_or(GantryError::JobNotFound(job.id))?;
        entry.1 = job.clone();
        Ok(())
    }

    async fn list_for_build(&self, build_id: Uuid) -> Result<Vec<Job>> {
        let mut jobs: Vec<(u64, Job)> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|(_, job)| job.build_id == build_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        Ok(jobs.into_iter().map(|(_, job)| job).collect())
    }

    async fn list_queued(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<(u64, Job)> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|(_, job)| job.status == JobStatus::Queued)
            .cloned()
            .collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        Ok(jobs.into_iter().map(|(_, job)| job).collect())
    }
}

#[async_trait]
impl RepoStore for MemDb {
    async fn create(&self, repo: &Repo) -> Result<()> {
        self.repos.write().await.insert(repo.id, repo.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Repo>> {
        Ok(self.repos.read().await.get(&id).cloned())
    }
}
