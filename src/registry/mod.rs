//! Worker registry.
//!
//! Workers announce themselves by writing `workers/<id>` into the
//! coordination store under a liveness lease. The registry watches that
//! prefix: a put dials the worker over mutually-authenticated gRPC,
//! runs the host-info handshake under a deadline, and starts the
//! telemetry loop; a delete (lease expiry or deregistration) tears the
//! worker down and hands its in-flight jobs back to the scheduler.
//!
//! There is no session resumption. Any telemetry stream error is
//! terminal for the worker; it reconnects from scratch by re-writing
//! its registration key.

pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::GantryConfig;
use crate::error::{GantryError, Result};
use crate::events::{EventBus, WORKERS_ADD_TOPIC, WORKERS_DELETE_TOPIC, WORKERS_USAGE_TOPIC};
use crate::proto::worker_api_client::WorkerApiClient;
use crate::scheduler::SchedulerHandle;
use crate::store::keys::{self, WorkerRegistration};
use crate::store::{CoordStore, EventKind, WatchEvent};
use crate::tls::TlsIdentity;

pub use worker::{HostInfo, UsageSample, Worker};

struct WorkerEntry {
    worker: Arc<Worker>,
    telemetry: JoinHandle<()>,
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerEntry>>,
    scheduler: SchedulerHandle,
    events: EventBus,
    tls: Option<TlsIdentity>,
    allow_insecure: bool,
    host_info_timeout: Duration,
    usage_retention: usize,
    cancel_token: CancellationToken,
}

impl WorkerRegistry {
    pub fn new(
        config: &GantryConfig,
        tls: Option<TlsIdentity>,
        scheduler: SchedulerHandle,
        events: EventBus,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: RwLock::new(HashMap::new()),
            scheduler,
            events,
            tls,
            allow_insecure: config.tls.allow_insecure,
            host_info_timeout: config.host_info_timeout(),
            usage_retention: config.usage_retention,
            cancel_token,
        })
    }

    /// Follow the `workers/` prefix until shutdown.
    pub async fn run(self: Arc<Self>, store: Arc<dyn CoordStore>) -> Result<()> {
        let mut stream = store.watch(keys::WORKERS_PREFIX, 0).await?;
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => return Ok(()),
                event = stream.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        return Err(GantryError::TransientTransport(
                            "worker registration watch ended".to_string(),
                        ));
                    }
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: WatchEvent) {
        let Some(worker_id) = keys::worker_id_from_key(&event.key) else {
            return;
        };
        match event.kind {
            EventKind::Put => {
                let registration: WorkerRegistration = match serde_json::from_slice(&event.value) {
                    Ok(registration) => registration,
                    Err(e) => {
                        tracing::warn!(
                            worker_id = %worker_id,
                            error = %e,
                            "unparseable worker registration"
                        );
                        return;
                    }
                };
                if self.workers.read().await.contains_key(&worker_id) {
                    tracing::debug!(worker_id = %worker_id, "worker already connected");
                    return;
                }
                let registry = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = registry.connect(worker_id.clone(), registration).await {
                        tracing::warn!(worker_id = %worker_id, error = %e, "worker rejected");
                    }
                });
            }
            EventKind::Delete => self.disconnect(&worker_id).await,
        }
    }

    /// Dial a worker, run the host-info handshake and start telemetry.
    ///
    /// The handshake must complete within `host_info_timeout`; a
    /// timeout, transport failure or protocol violation rejects the
    /// worker without touching any scheduling state.
    pub async fn connect(
        self: &Arc<Self>,
        worker_id: String,
        registration: WorkerRegistration,
    ) -> Result<()> {
        let channel = self.dial(&registration.addr).await?;
        let mut client = WorkerApiClient::new(channel);

        let reply = tokio::time::timeout(self.host_info_timeout, client.host_info(()))
            .await
            .map_err(|_| {
                GantryError::WorkerProtocol(format!(
                    "host info timed out for {}",
                    registration.addr
                ))
            })??;
        let host = HostInfo::try_from(reply.into_inner())?;

        let worker = Arc::new(Worker::new(
            worker_id.clone(),
            registration.addr.clone(),
            host,
            self.usage_retention,
        ));

        // The telemetry loop must not start (and in particular must not
        // tear the worker down) before the worker is fully announced.
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        {
            let mut workers = self.workers.write().await;
            if workers.contains_key(&worker_id) {
                return Ok(());
            }
            let registry = self.clone();
            let telemetry_worker = worker.clone();
            let telemetry = tokio::spawn(async move {
                if ready_rx.await.is_err() {
                    return;
                }
                registry.telemetry_loop(telemetry_worker, client).await;
            });
            workers.insert(
                worker_id.clone(),
                WorkerEntry {
                    worker: worker.clone(),
                    telemetry,
                },
            );
        }

        tracing::info!(
            worker_id = %worker_id,
            addr = %registration.addr,
            max = worker.max(),
            "worker connected"
        );
        self.events.broadcast(
            WORKERS_ADD_TOPIC,
            json!({
                "id": worker.id(),
                "addr": worker.addr(),
                "host": worker.host(),
                "usage": worker.usage_snapshot(),
            }),
        );
        let _ = self.scheduler.add_worker(worker.clone());
        let _ = self.scheduler.notify_capacity(&worker_id);
        let _ = ready_tx.send(());
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<Channel> {
        let (scheme, tls) = match &self.tls {
            Some(identity) => ("https", Some(identity.client_tls_config())),
            None if self.allow_insecure => ("http", None),
            None => {
                return Err(GantryError::WorkerProtocol(
                    "TLS is required for worker connections".to_string(),
                ));
            }
        };
        let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, addr))
            .map_err(|e| GantryError::WorkerProtocol(e.to_string()))?
            .connect_timeout(self.host_info_timeout);
        if let Some(tls) = tls {
            endpoint = endpoint.tls_config(tls)?;
        }
        Ok(endpoint.connect().await?)
    }

    /// Long-lived usage consumption. Any error is terminal for the
    /// worker: the connection is closed and the worker removed.
    async fn telemetry_loop(self: Arc<Self>, worker: Arc<Worker>, client: WorkerApiClient<Channel>) {
        match self.consume_usage(&worker, client).await {
            Ok(()) => {
                tracing::info!(worker_id = worker.id(), "telemetry stream closed");
            }
            Err(e) => {
                tracing::warn!(worker_id = worker.id(), error = %e, "telemetry stream failed");
            }
        }
        if !self.cancel_token.is_cancelled() {
            self.disconnect(worker.id()).await;
        }
    }

    async fn consume_usage(
        &self,
        worker: &Worker,
        mut client: WorkerApiClient<Channel>,
    ) -> Result<()> {
        let mut stream = client.usage_stats(()).await?.into_inner();
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => return Ok(()),
                message = stream.message() => {
                    let Some(reply) = message? else {
                        return Err(GantryError::TransientTransport(
                            "usage stream closed by worker".to_string(),
                        ));
                    };
                    if !reply.cpu.is_finite()
                        || !reply.mem.is_finite()
                        || reply.cpu < 0.0
                        || reply.mem < 0.0
                    {
                        return Err(GantryError::WorkerProtocol(format!(
                            "malformed usage sample cpu={} mem={}",
                            reply.cpu, reply.mem
                        )));
                    }
                    let timestamp = proto_timestamp(reply.timestamp);
                    // Snapshot inside the lock, broadcast outside it.
                    let sample = worker.push_usage(reply.cpu, reply.mem, timestamp);
                    self.events.broadcast(
                        WORKERS_USAGE_TOPIC,
                        json!({
                            "id": worker.id(),
                            "addr": worker.addr(),
                            "cpu": sample.cpu,
                            "mem": sample.mem,
                            "jobs_max": sample.jobs_max,
                            "jobs_running": sample.jobs_running,
                            "timestamp": sample.timestamp,
                        }),
                    );
                }
            }
        }
    }

    /// Remove a worker. Its in-flight jobs go back to the scheduler as
    /// requeues via `RemoveWorker`.
    pub async fn disconnect(&self, worker_id: &str) {
        let entry = self.workers.write().await.remove(worker_id);
        let Some(entry) = entry else {
            return;
        };
        // No-op when the telemetry task is the caller and already
        // exiting; nothing below awaits.
        entry.telemetry.abort();
        self.events.broadcast(
            WORKERS_DELETE_TOPIC,
            json!({
                "id": worker_id,
                "addr": entry.worker.addr(),
            }),
        );
        let _ = self.scheduler.remove_worker(worker_id);
        tracing::info!(worker_id = %worker_id, "worker removed");
    }

    /// Free capacity of a worker, `max - running`.
    pub async fn capacity(&self, worker_id: &str) -> Result<u32> {
        let workers = self.workers.read().await;
        let entry = workers
            .get(worker_id)
            .ok_or_else(|| GantryError::WorkerNotFound(worker_id.to_string()))?;
        Ok(entry.worker.max().saturating_sub(entry.worker.running()))
    }

    /// Atomically adjust a worker's running counter.
    pub async fn set_running(&self, worker_id: &str, delta: i32) -> Result<u32> {
        let workers = self.workers.read().await;
        let entry = workers
            .get(worker_id)
            .ok_or_else(|| GantryError::WorkerNotFound(worker_id.to_string()))?;
        Ok(entry.worker.adjust_running(delta))
    }

    pub async fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers
            .read()
            .await
            .values()
            .map(|entry| entry.worker.clone())
            .collect()
    }
}

fn proto_timestamp(timestamp: Option<prost_types::Timestamp>) -> DateTime<Utc> {
    timestamp
        .and_then(|ts| Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32).single())
        .unwrap_or_else(Utc::now)
}
