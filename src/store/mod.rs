//! Coordination store client.
//!
//! Job dispatch and worker liveness both go through a replicated
//! key/value service with prefix watches and leases. The control plane
//! only ever talks to it through the [`CoordStore`] trait; the gRPC
//! client ([`grpc::GrpcStore`]) is used against a remote store, while
//! [`memory::MemStore`] backs standalone deployments and the test
//! suite.

pub mod grpc;
pub mod keys;
pub mod memory;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use rand::Rng;

use crate::error::Result;

pub use memory::MemStore;

/// Identifier of a liveness lease. Keys attached to a lease disappear
/// when the lease expires.
pub type LeaseId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub value: Vec<u8>,
    pub kind: EventKind,
    pub revision: i64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    /// Write a key, optionally attached to a lease. Returns the store
    /// revision of the write.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64>;

    /// Atomic create-if-absent. Returns `false` (and leaves the store
    /// untouched) when the key already exists.
    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read every key under a prefix together with the revision of the
    /// read, usable as a watch start point.
    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<(String, Vec<u8>)>, i64)>;

    /// Returns `true` when the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Watch a prefix. `from_revision == 0` means snapshot-then-follow:
    /// the current prefix contents are replayed as put events before
    /// live events flow. A positive revision resumes from that point.
    /// Events for a single key arrive in the order they were applied.
    /// Implementations are responsible for surviving transport drops;
    /// the returned stream only ends when the consumer goes away.
    async fn watch(&self, prefix: &str, from_revision: i64) -> Result<WatchStream>;

    async fn lease(&self, ttl: Duration) -> Result<LeaseId>;

    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;
}

/// Full-jitter exponential backoff.
///
/// Each step draws uniformly from `[0, min(cap, base * 2^attempt))` so
/// that reconnecting clients do not stampede the store.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Backoff for watch reconnects: 250ms initial, 10s cap.
    pub fn for_watch() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(10))
    }

    pub fn next(&mut self) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let micros = ceiling.as_micros().max(1) as u64;
        Duration::from_micros(rand::thread_rng().gen_range(0..micros))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
