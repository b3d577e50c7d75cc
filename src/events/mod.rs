//! Broadcast of worker and job state changes to observers.
//!
//! Best-effort fan-out: each subscriber owns a bounded queue and a
//! subscriber that cannot keep up is disconnected. No durability, no
//! replay. Payloads are JSON objects with snake_case keys.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const WORKERS_ADD_TOPIC: &str = "/subs/workers_add";
pub const WORKERS_DELETE_TOPIC: &str = "/subs/workers_delete";
pub const WORKERS_USAGE_TOPIC: &str = "/subs/workers_usage";

pub fn job_topic(job_id: Uuid) -> String {
    format!("/subs/jobs/{}", job_id)
}

pub fn build_topic(build_id: Uuid) -> String {
    format!("/subs/builds/{}", build_id)
}

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

struct Subscriber {
    id: u64,
    prefix: String,
    tx: mpsc::Sender<Event>,
}

/// A subscriber's end of the bus. Dropping it disconnects.
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    queue_size: usize,
    next_id: Arc<Mutex<u64>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE)
    }
}

impl EventBus {
    pub fn new(queue_size: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            queue_size: queue_size.max(1),
            next_id: Arc::new(Mutex::new(0)),
        }
    }

    /// Subscribe to every topic starting with `prefix`.
    pub fn subscribe(&self, prefix: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let id = {
            let mut next = self.next_id.lock().expect("event bus mutex poisoned");
            *next += 1;
            *next
        };
        self.subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .push(Subscriber {
                id,
                prefix: prefix.to_string(),
                tx,
            });
        Subscription { rx }
    }

    /// Fan an event out to matching subscribers. Never blocks: a full
    /// or closed subscriber queue drops the subscriber.
    pub fn broadcast(&self, topic: &str, payload: Value) {
        let targets: Vec<(u64, mpsc::Sender<Event>)> = {
            let subscribers = self.subscribers.lock().expect("event bus mutex poisoned");
            subscribers
                .iter()
                .filter(|s| topic.starts_with(&s.prefix))
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let event = Event {
            topic: topic.to_string(),
            payload,
        };
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, topic, "subscriber overflowed, dropping");
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .lock()
                .expect("event bus mutex poisoned")
                .retain(|s| !dead.contains(&s.id));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .len()
    }
}
