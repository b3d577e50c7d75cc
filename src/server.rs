//! Composition root.
//!
//! Every component receives its collaborators through its constructor;
//! nothing holds a pointer back to its parent. The server owns the
//! spawned tasks: the scheduler loop, the worker-registration watch and
//! the job-status watch, all tied to one cancellation token.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::GantryConfig;
use crate::db::{BuildStore, JobStore, RepoStore};
use crate::error::{GantryError, Result};
use crate::events::EventBus;
use crate::orchestrator::Orchestrator;
use crate::registry::WorkerRegistry;
use crate::scheduler::{Scheduler, SchedulerHandle, SchedulerMessage};
use crate::scm::Scm;
use crate::store::keys::{self, StatusUpdate};
use crate::store::{CoordStore, EventKind};
use crate::tls::TlsIdentity;

pub struct Server {
    store: Arc<dyn CoordStore>,
    jobs: Arc<dyn JobStore>,
    events: EventBus,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<WorkerRegistry>,
    scheduler: Scheduler,
    scheduler_rx: mpsc::Receiver<SchedulerMessage>,
    scheduler_handle: SchedulerHandle,
    cancel_token: CancellationToken,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GantryConfig,
        store: Arc<dyn CoordStore>,
        builds: Arc<dyn BuildStore>,
        jobs: Arc<dyn JobStore>,
        repos: Arc<dyn RepoStore>,
        scm: Arc<dyn Scm>,
        tls: Option<TlsIdentity>,
        cancel_token: CancellationToken,
    ) -> Self {
        let events = EventBus::new(config.subscriber_queue);
        let (scheduler, scheduler_handle, scheduler_rx) = Scheduler::new(
            store.clone(),
            jobs.clone(),
            config.dispatch_retry(),
            cancel_token.clone(),
        );
        let registry = WorkerRegistry::new(
            &config,
            tls,
            scheduler_handle.clone(),
            events.clone(),
            cancel_token.clone(),
        );
        let orchestrator = Orchestrator::new(
            builds,
            jobs.clone(),
            repos,
            scm,
            scheduler_handle.clone(),
            events.clone(),
            config.debounce_window(),
        );

        Self {
            store,
            jobs,
            events,
            orchestrator,
            registry,
            scheduler,
            scheduler_rx,
            scheduler_handle,
            cancel_token,
        }
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    pub fn scheduler_handle(&self) -> SchedulerHandle {
        self.scheduler_handle.clone()
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.registry.clone()
    }

    /// Start every subsystem and block until shutdown.
    pub async fn run(self) -> Result<()> {
        // Jobs left queued by a previous run go straight back into the
        // scheduler; dispatches already in the store are adopted on
        // conflict.
        let queued = self.jobs.list_queued().await?;
        if !queued.is_empty() {
            tracing::info!(jobs = queued.len(), "resubmitting queued jobs");
            for job in queued {
                let _ = self.scheduler_handle.submit(job.id);
            }
        }

        let scheduler = self.scheduler;
        let scheduler_rx = self.scheduler_rx;
        tokio::spawn(async move {
            scheduler.run(scheduler_rx).await;
        });

        let registry = self.registry.clone();
        let registry_store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.run(registry_store).await {
                tracing::error!(error = %e, "worker registration watch failed");
            }
        });

        let orchestrator = self.orchestrator.clone();
        let scheduler_handle = self.scheduler_handle.clone();
        let status_store = self.store.clone();
        let status_cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            if let Err(e) =
                run_status_watch(status_store, orchestrator, scheduler_handle, status_cancel).await
            {
                tracing::error!(error = %e, "job status watch failed");
            }
        });

        self.cancel_token.cancelled().await;
        tracing::info!("server shut down");
        Ok(())
    }
}

/// Follow `status/` and fan each worker-reported transition out to the
/// orchestrator (persistence, build recomputation, broadcast) and the
/// scheduler (capacity bookkeeping).
pub async fn run_status_watch(
    store: Arc<dyn CoordStore>,
    orchestrator: Arc<Orchestrator>,
    scheduler: SchedulerHandle,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut stream = store.watch(keys::STATUS_PREFIX, 0).await?;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            event = stream.next() => {
                let Some(event) = event else {
                    return Err(GantryError::TransientTransport(
                        "job status watch ended".to_string(),
                    ));
                };
                if event.kind != EventKind::Put {
                    // Deletes are terminal-state pruning.
                    continue;
                }
                let Some(job_id) = keys::job_id_from_key(keys::STATUS_PREFIX, &event.key) else {
                    continue;
                };
                let update: StatusUpdate = match serde_json::from_slice(&event.value) {
                    Ok(update) => update,
                    Err(e) => {
                        tracing::warn!(key = %event.key, error = %e, "unparseable status record");
                        continue;
                    }
                };
                if let Err(e) = orchestrator
                    .on_job_status(
                        job_id,
                        update.state,
                        update.started_at,
                        update.ended_at,
                        update.log_chunk.clone(),
                    )
                    .await
                {
                    tracing::warn!(job_id = %job_id, error = %e, "status application failed");
                }
                let _ = scheduler.status_changed(job_id, update.state);
            }
        }
    }
}
