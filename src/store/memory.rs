//! In-process coordination store.
//!
//! Implements the full [`CoordStore`] contract: monotonic revisions,
//! prefix watches with per-key ordering, and expiring leases. Backs
//! standalone deployments and the test suite. A bounded event history
//! lets watchers start from a recent revision without a gap between a
//! range read and the watch registration.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{GantryError, Result};
use crate::store::{CoordStore, EventKind, LeaseId, WatchEvent, WatchStream};

const HISTORY_BOUND: usize = 1024;

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

struct Lease {
    keys: HashSet<String>,
    deadline: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct Inner {
    kv: BTreeMap<String, Entry>,
    revision: i64,
    watchers: Vec<Watcher>,
    history: VecDeque<WatchEvent>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

impl Inner {
    fn emit(&mut self, event: WatchEvent) {
        self.history.push_back(event.clone());
        while self.history.len() > HISTORY_BOUND {
            self.history.pop_front();
        }
        self.watchers
            .retain(|w| !event.key.starts_with(&w.prefix) || w.tx.send(event.clone()).is_ok());
    }

    fn detach_lease(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(id) = lease {
            if let Some(lease) = self.leases.get_mut(&id) {
                lease.keys.remove(key);
            }
        }
    }

    fn write(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> i64 {
        self.revision += 1;
        let revision = self.revision;
        if let Some(old) = self
            .kv
            .insert(key.to_string(), Entry { value: value.clone(), lease })
        {
            if old.lease != lease {
                self.detach_lease(key, old.lease);
            }
        }
        if let Some(id) = lease {
            if let Some(lease) = self.leases.get_mut(&id) {
                lease.keys.insert(key.to_string());
            }
        }
        self.emit(WatchEvent {
            key: key.to_string(),
            value,
            kind: EventKind::Put,
            revision,
        });
        revision
    }

    fn remove(&mut self, key: &str) -> Option<i64> {
        let entry = self.kv.remove(key)?;
        self.detach_lease(key, entry.lease);
        self.revision += 1;
        let revision = self.revision;
        self.emit(WatchEvent {
            key: key.to_string(),
            value: Vec::new(),
            kind: EventKind::Delete,
            revision,
        });
        Some(revision)
    }
}

#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire_lease(inner: &Arc<Mutex<Inner>>, id: LeaseId) -> Option<Instant> {
        let mut guard = inner.lock().expect("store mutex poisoned");
        let lease = guard.leases.get(&id)?;
        let deadline = lease.deadline;
        if Instant::now() < deadline {
            // Kept alive since we went to sleep.
            return Some(deadline);
        }
        let keys: Vec<String> = guard
            .leases
            .remove(&id)
            .map(|l| l.keys.into_iter().collect())
            .unwrap_or_default();
        for key in keys {
            guard.remove(&key);
        }
        tracing::debug!(lease_id = id, "lease expired");
        None
    }
}

#[async_trait]
impl CoordStore for MemStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.write(key, value, lease))
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.write(key, value, lease);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.kv.get(key).map(|e| e.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<(String, Vec<u8>)>, i64)> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let kvs = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        Ok((kvs, inner.revision))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.remove(key).is_some())
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            if from_revision == 0 {
                // Snapshot-then-follow: replay current contents as puts.
                let revision = inner.revision;
                for (key, entry) in inner
                    .kv
                    .range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                {
                    let _ = tx.send(WatchEvent {
                        key: key.clone(),
                        value: entry.value.clone(),
                        kind: EventKind::Put,
                        revision,
                    });
                }
            } else {
                for event in &inner.history {
                    if event.revision >= from_revision && event.key.starts_with(prefix) {
                        let _ = tx.send(event.clone());
                    }
                }
            }
            // Dead watchers are dropped on the first failed send.
            inner.watchers.push(Watcher {
                prefix: prefix.to_string(),
                tx,
            });
        }
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn lease(&self, ttl: Duration) -> Result<LeaseId> {
        let id = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            inner.next_lease += 1;
            let id = inner.next_lease;
            inner.leases.insert(
                id,
                Lease {
                    keys: HashSet::new(),
                    deadline: Instant::now() + ttl,
                    ttl,
                },
            );
            id
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut deadline = Instant::now() + ttl;
            loop {
                tokio::time::sleep_until(deadline).await;
                match MemStore::expire_lease(&inner, id) {
                    Some(next) => deadline = next,
                    None => break,
                }
            }
        });

        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or_else(|| GantryError::StorePermanent(format!("lease {} not found", lease)))?;
        entry.deadline = Instant::now() + entry.ttl;
        Ok(())
    }
}
