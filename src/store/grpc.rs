//! gRPC client for a remote coordination store.
//!
//! One-shot calls go straight through the shared channel. Watches are
//! wrapped in a reconnect loop: on disconnect the client backs off with
//! full jitter, re-reads the prefix to close the event gap (synthesizing
//! puts for changed keys and deletes for vanished ones), and resumes
//! from the latest observed revision.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Status};

use crate::error::{GantryError, Result};
use crate::proto::coordination_client::CoordinationClient;
use crate::proto::{
    CreateRequest, DeleteRequest, EventKind as ProtoEventKind, LeaseGrantRequest,
    LeaseKeepAliveRequest, PutRequest, RangeRequest, WatchRequest,
};
use crate::store::{Backoff, CoordStore, EventKind, LeaseId, WatchEvent, WatchStream};

const WATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct GrpcStore {
    client: CoordinationClient<Channel>,
}

impl GrpcStore {
    /// Connect to the store at `addr` (host:port).
    pub async fn connect(addr: &str, tls: Option<ClientTlsConfig>) -> Result<Self> {
        let scheme = if tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, addr))
            .map_err(|e| GantryError::StorePermanent(e.to_string()))?;
        if let Some(tls) = tls {
            endpoint = endpoint.tls_config(tls)?;
        }
        let channel = endpoint.connect().await?;
        Ok(Self {
            client: CoordinationClient::new(channel),
        })
    }
}

/// Map a gRPC status onto the store error taxonomy: connection-shaped
/// failures are retriable, everything else is permanent.
fn classify(status: Status) -> GantryError {
    match status.code() {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::Cancelled
        | Code::Aborted
        | Code::ResourceExhausted => GantryError::TransientTransport(status.to_string()),
        _ => GantryError::StorePermanent(status.to_string()),
    }
}

#[async_trait::async_trait]
impl CoordStore for GrpcStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        let mut client = self.client.clone();
        let reply = client
            .put(PutRequest {
                key: key.to_string(),
                value,
                lease_id: lease.unwrap_or(0),
            })
            .await
            .map_err(classify)?;
        Ok(reply.into_inner().revision)
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<bool> {
        let mut client = self.client.clone();
        let reply = client
            .create(CreateRequest {
                key: key.to_string(),
                value,
                lease_id: lease.unwrap_or(0),
            })
            .await
            .map_err(classify)?;
        Ok(reply.into_inner().created)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let reply = client
            .range(RangeRequest {
                prefix: key.to_string(),
            })
            .await
            .map_err(classify)?;
        Ok(reply
            .into_inner()
            .kvs
            .into_iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<(String, Vec<u8>)>, i64)> {
        let mut client = self.client.clone();
        let reply = client
            .range(RangeRequest {
                prefix: prefix.to_string(),
            })
            .await
            .map_err(classify)?
            .into_inner();
        let kvs = reply.kvs.into_iter().map(|kv| (kv.key, kv.value)).collect();
        Ok((kvs, reply.revision))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let reply = client
            .delete(DeleteRequest {
                key: key.to_string(),
            })
            .await
            .map_err(classify)?;
        Ok(reply.into_inner().deleted)
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> Result<WatchStream> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            watch_loop(client, prefix, from_revision, tx).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn lease(&self, ttl: std::time::Duration) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let reply = client
            .lease_grant(LeaseGrantRequest {
                ttl_seconds: ttl.as_secs() as i64,
            })
            .await
            .map_err(classify)?;
        Ok(reply.into_inner().lease_id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .lease_keep_alive(LeaseKeepAliveRequest { lease_id: lease })
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Drive a prefix watch until the receiver goes away.
///
/// `from_revision == 0` means "snapshot first": the current prefix
/// contents are replayed as put events before live events flow, so the
/// consumer needs no separate range read. After any disconnect the
/// prefix is re-read and diffed against the last known key set to close
/// the gap.
async fn watch_loop(
    mut client: CoordinationClient<Channel>,
    prefix: String,
    from_revision: i64,
    tx: mpsc::Sender<WatchEvent>,
) {
    let mut backoff = Backoff::for_watch();
    let mut next_revision = from_revision;
    // Last known key -> value under the prefix, maintained from events
    // and snapshots. Resync diffs against it to recover dropped events.
    let mut known: HashMap<String, Vec<u8>> = HashMap::new();
    let mut need_snapshot = from_revision == 0;

    loop {
        if need_snapshot {
            match client
                .range(RangeRequest {
                    prefix: prefix.clone(),
                })
                .await
            {
                Ok(reply) => {
                    let reply = reply.into_inner();
                    let current: HashMap<String, Vec<u8>> = reply
                        .kvs
                        .into_iter()
                        .map(|kv| (kv.key, kv.value))
                        .collect();

                    for key in known.keys() {
                        if !current.contains_key(key) {
                            let event = WatchEvent {
                                key: key.clone(),
                                value: Vec::new(),
                                kind: EventKind::Delete,
                                revision: reply.revision,
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    for (key, value) in &current {
                        if known.get(key) != Some(value) {
                            let event = WatchEvent {
                                key: key.clone(),
                                value: value.clone(),
                                kind: EventKind::Put,
                                revision: reply.revision,
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    known = current;
                    next_revision = reply.revision + 1;
                    need_snapshot = false;
                    backoff.reset();
                }
                Err(status) => {
                    tracing::warn!(prefix = %prefix, error = %status, "prefix resync failed");
                    tokio::time::sleep(backoff.next()).await;
                    continue;
                }
            }
        }

        let mut stream = match client
            .watch(WatchRequest {
                prefix: prefix.clone(),
                from_revision: next_revision,
            })
            .await
        {
            Ok(reply) => reply.into_inner(),
            Err(status) => {
                tracing::warn!(prefix = %prefix, error = %status, "watch open failed");
                need_snapshot = true;
                tokio::time::sleep(backoff.next()).await;
                continue;
            }
        };

        loop {
            match stream.message().await {
                Ok(Some(reply)) => {
                    backoff.reset();
                    for event in reply.events {
                        next_revision = next_revision.max(event.revision + 1);
                        let kind = match event.kind() {
                            ProtoEventKind::Put => EventKind::Put,
                            ProtoEventKind::Delete => EventKind::Delete,
                        };
                        match kind {
                            EventKind::Put => {
                                known.insert(event.key.clone(), event.value.clone());
                            }
                            EventKind::Delete => {
                                known.remove(&event.key);
                            }
                        }
                        let event = WatchEvent {
                            key: event.key,
                            value: event.value,
                            kind,
                            revision: event.revision,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    tracing::warn!(prefix = %prefix, error = %status, "watch stream dropped");
                    break;
                }
            }
        }

        need_snapshot = true;
        tokio::time::sleep(backoff.next()).await;
    }
}
