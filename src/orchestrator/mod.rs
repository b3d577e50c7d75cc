//! Build orchestrator.
//!
//! Expands a repository trigger into a build with one job per matrix
//! combination, persists both, and feeds the jobs to the scheduler.
//! Worker-reported lifecycle transitions come back through
//! [`on_job_status`](Orchestrator::on_job_status), which updates the
//! job row, recomputes the parent build and broadcasts both.

pub mod config;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::db::{
    derive_build_status, Build, BuildStatus, BuildStore, Job, JobStatus, JobStore, RepoStore,
};
use crate::error::{GantryError, Result};
use crate::events::{build_topic, job_topic, EventBus};
use crate::scheduler::SchedulerHandle;
use crate::scm::Scm;

pub use config::{parse_build_definition, BuildDefinition};

pub struct Orchestrator {
    builds: Arc<dyn BuildStore>,
    jobs: Arc<dyn JobStore>,
    repos: Arc<dyn RepoStore>,
    scm: Arc<dyn Scm>,
    scheduler: SchedulerHandle,
    events: EventBus,
    debounce_window: Duration,
    /// `(repo, commit) -> (build, triggered_at)` for trigger coalescing.
    recent: Mutex<HashMap<(Uuid, String), (Uuid, Instant)>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        builds: Arc<dyn BuildStore>,
        jobs: Arc<dyn JobStore>,
        repos: Arc<dyn RepoStore>,
        scm: Arc<dyn Scm>,
        scheduler: SchedulerHandle,
        events: EventBus,
        debounce_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            builds,
            jobs,
            repos,
            scm,
            scheduler,
            events,
            debounce_window,
            recent: Mutex::new(HashMap::new()),
        })
    }

    /// Create a build for the repository's head commit and submit its
    /// jobs. Repeated triggers for the same `(repo, commit)` inside the
    /// debounce window return the existing build id.
    pub async fn trigger(&self, repo_id: Uuid, user_id: Uuid) -> Result<Uuid> {
        let repo = self
            .repos
            .find(repo_id)
            .await?
            .ok_or(GantryError::RepoNotFound(repo_id))?;
        let commit = self.scm.head_commit(&repo).await?;

        {
            let mut recent = self.recent.lock().await;
            let window = self.debounce_window;
            recent.retain(|_, (_, at)| at.elapsed() < window);
            if let Some((build_id, _)) = recent.get(&(repo_id, commit.clone())) {
                tracing::debug!(
                    repo_id = %repo_id,
                    commit = %commit,
                    build_id = %build_id,
                    "trigger debounced"
                );
                return Ok(*build_id);
            }
        }

        let definition = match self
            .scm
            .build_config(&repo, &commit)
            .await
            .and_then(|raw| parse_build_definition(&raw))
        {
            Ok(definition) => definition,
            Err(e @ GantryError::BuildConfig(_)) => {
                // The trigger is recorded even when it cannot
                // materialize jobs, so the failure is visible.
                let mut build = Build::new(repo_id, user_id, commit);
                build.status = BuildStatus::Errored;
                build.ended_at = Some(Utc::now());
                self.builds.create(&build).await?;
                self.broadcast_build(&build);
                tracing::warn!(build_id = %build.id, error = %e, "build errored at trigger");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let build = Build::new(repo_id, user_id, commit.clone());
        self.builds.create(&build).await?;

        let mut jobs = Vec::new();
        for env in definition.expand() {
            let job = Job::new(
                build.id,
                definition.image.clone(),
                definition.commands.clone(),
                env,
            );
            self.jobs.create(&job).await?;
            jobs.push(job);
        }

        self.recent
            .lock()
            .await
            .insert((repo_id, commit), (build.id, Instant::now()));
        self.broadcast_build(&build);
        tracing::info!(
            build_id = %build.id,
            repo_id = %repo_id,
            jobs = jobs.len(),
            "build triggered"
        );

        for job in &jobs {
            if let Err(e) = self.scheduler.submit(job.id) {
                self.builds
                    .update_status(build.id, BuildStatus::Errored, None, Some(Utc::now()))
                    .await?;
                if let Ok(Some(build)) = self.builds.find(build.id).await {
                    self.broadcast_build(&build);
                }
                return Err(e);
            }
        }

        Ok(build.id)
    }

    /// Apply a worker-reported transition to the job row and recompute
    /// the parent build. Safe to replay: terminal rows ignore late or
    /// duplicate reports.
    pub async fn on_job_status(
        &self,
        job_id: Uuid,
        state: JobStatus,
        started_at: Option<chrono::DateTime<Utc>>,
        ended_at: Option<chrono::DateTime<Utc>>,
        log_chunk: Option<String>,
    ) -> Result<()> {
        let Some(mut job) = self.jobs.find(job_id).await? else {
            tracing::debug!(job_id = %job_id, "status report for unknown job");
            return Ok(());
        };

        if job.status.is_terminal() {
            if state != job.status {
                tracing::debug!(
                    job_id = %job_id,
                    current = %job.status,
                    reported = %state,
                    "ignoring late status report"
                );
            }
            return Ok(());
        }

        job.status = state;
        match state {
            JobStatus::Queued => {
                // Requeued after a worker loss; the job will start over.
                job.started_at = None;
                job.ended_at = None;
            }
            JobStatus::Running => {
                job.started_at = started_at.or(job.started_at).or_else(|| Some(Utc::now()));
            }
            _ => {
                if let Some(ts) = started_at {
                    job.started_at = Some(ts);
                }
                job.ended_at = ended_at.or_else(|| Some(Utc::now()));
            }
        }
        if let Some(chunk) = log_chunk {
            job.log.push_str(&chunk);
        }
        self.jobs.update(&job).await?;

        self.events.broadcast(
            &job_topic(job.id),
            json!({
                "id": job.id,
                "build_id": job.build_id,
                "status": job.status,
                "started_at": job.started_at,
                "ended_at": job.ended_at,
            }),
        );

        self.recompute_build(job.build_id).await
    }

    /// Re-derive a build's status from its jobs. Pure derivation, so
    /// recomputation is idempotent; terminal builds never change again.
    async fn recompute_build(&self, build_id: Uuid) -> Result<()> {
        let Some(build) = self.builds.find(build_id).await? else {
            return Ok(());
        };
        if build.status.is_terminal() {
            return Ok(());
        }

        let jobs = self.jobs.list_for_build(build_id).await?;
        let statuses: Vec<JobStatus> = jobs.iter().map(|j| j.status).collect();
        let derived = derive_build_status(&statuses);

        let started_at = match (build.started_at, derived) {
            (None, BuildStatus::Running) => Some(Utc::now()),
            _ => None,
        };
        let ended_at = if derived.is_terminal() && build.ended_at.is_none() {
            Some(Utc::now())
        } else {
            None
        };

        if build.status != derived || started_at.is_some() || ended_at.is_some() {
            self.builds
                .update_status(build_id, derived, started_at, ended_at)
                .await?;
            if let Some(updated) = self.builds.find(build_id).await? {
                self.broadcast_build(&updated);
            }
            tracing::info!(build_id = %build_id, status = %derived, "build status updated");
        }
        Ok(())
    }

    fn broadcast_build(&self, build: &Build) {
        self.events.broadcast(
            &build_topic(build.id),
            json!({
                "id": build.id,
                "repo_id": build.repo_id,
                "user_id": build.user_id,
                "commit_ref": build.commit_ref,
                "status": build.status,
                "started_at": build.started_at,
                "ended_at": build.ended_at,
            }),
        );
    }
}
