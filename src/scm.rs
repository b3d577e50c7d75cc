//! Source-control-manager capability consumed by the build orchestrator.
//!
//! Real provider clients (GitHub, GitLab, Gitea) live outside the core;
//! the orchestrator only needs the head commit of a repository and the
//! raw build configuration at that commit.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::Repo;
use crate::error::{GantryError, Result};

#[async_trait]
pub trait Scm: Send + Sync + 'static {
    /// Resolve the head commit of the repository's default branch.
    async fn head_commit(&self, repo: &Repo) -> Result<String>;

    /// Fetch the raw build configuration at a commit.
    async fn build_config(&self, repo: &Repo, commit: &str) -> Result<String>;
}

/// Canned SCM with per-repository fixtures. Used by the test suite and
/// by standalone deployments seeded from the command line.
#[derive(Default)]
pub struct FixedScm {
    entries: Mutex<HashMap<Uuid, (String, String)>>,
}

impl FixedScm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `(commit, config)` for a repository.
    pub fn insert(&self, repo_id: Uuid, commit: &str, config: &str) {
        self.entries
            .lock()
            .expect("scm mutex poisoned")
            .insert(repo_id, (commit.to_string(), config.to_string()));
    }
}

#[async_trait]
impl Scm for FixedScm {
    async fn head_commit(&self, repo: &Repo) -> Result<String> {
        self.entries
            .lock()
            .expect("scm mutex poisoned")
            .get(&repo.id)
            .map(|(commit, _)| commit.clone())
            .ok_or_else(|| {
                GantryError::BuildConfig(format!("no commit known for repository {}", repo.name))
            })
    }

    async fn build_config(&self, repo: &Repo, _commit: &str) -> Result<String> {
        self.entries
            .lock()
            .expect("scm mutex poisoned")
            .get(&repo.id)
            .map(|(_, config)| config.clone())
            .ok_or_else(|| {
                GantryError::BuildConfig(format!(
                    "no build configuration for repository {}",
                    repo.name
                ))
            })
    }
}
