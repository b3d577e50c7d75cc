use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::GantryError;
use crate::proto::HostInfoReply;
use crate::scheduler::WorkerSlot;

/// Host descriptor reported by a worker during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub id: String,
    pub addr: String,
    pub hostname: String,
    pub uptime: u64,
    pub boot_time: u64,
    pub procs: u64,
    pub os: String,
    pub platform: String,
    pub platform_family: String,
    pub platform_version: String,
    pub kernel_version: String,
    pub kernel_arch: String,
    pub virtualization_system: String,
    pub virtualization_role: String,
    pub max_concurrency: u32,
}

impl TryFrom<HostInfoReply> for HostInfo {
    type Error = GantryError;

    fn try_from(reply: HostInfoReply) -> Result<Self, Self::Error> {
        if reply.id.is_empty() {
            return Err(GantryError::WorkerProtocol(
                "host info carries an empty worker id".to_string(),
            ));
        }
        if reply.max_concurrency == 0 {
            return Err(GantryError::WorkerProtocol(format!(
                "worker {} reports zero max concurrency",
                reply.id
            )));
        }
        Ok(Self {
            id: reply.id,
            addr: reply.addr,
            hostname: reply.hostname,
            uptime: reply.uptime,
            boot_time: reply.boot_time,
            procs: reply.procs,
            os: reply.os,
            platform: reply.platform,
            platform_family: reply.platform_family,
            platform_version: reply.platform_version,
            kernel_version: reply.kernel_version,
            kernel_arch: reply.kernel_arch,
            virtualization_system: reply.virtualization_system,
            virtualization_role: reply.virtualization_role,
            max_concurrency: reply.max_concurrency,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSample {
    pub cpu: f64,
    pub mem: f64,
    pub jobs_max: u32,
    pub jobs_running: u32,
    pub timestamp: DateTime<Utc>,
}

struct Telemetry {
    running: u32,
    usage: VecDeque<UsageSample>,
}

/// A connected worker. The running counter and the usage ring share a
/// mutex held only across O(1) memory operations; broadcasts happen
/// after the lock is released.
pub struct Worker {
    id: String,
    addr: String,
    host: HostInfo,
    max: u32,
    retention: usize,
    telemetry: Mutex<Telemetry>,
}

impl Worker {
    pub fn new(id: String, addr: String, host: HostInfo, retention: usize) -> Self {
        let max = host.max_concurrency;
        Self {
            id,
            addr,
            host,
            max,
            retention: retention.max(1),
            telemetry: Mutex::new(Telemetry {
                running: 0,
                usage: VecDeque::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn running(&self) -> u32 {
        self.telemetry.lock().expect("worker mutex poisoned").running
    }

    /// Adjust the running counter. `0 <= running <= max` must hold
    /// afterwards; a violation is an internal accounting bug, logged as
    /// a correctness alarm and clamped.
    pub fn adjust_running(&self, delta: i32) -> u32 {
        let mut telemetry = self.telemetry.lock().expect("worker mutex poisoned");
        let next = telemetry.running as i64 + delta as i64;
        let clamped = next.clamp(0, self.max as i64) as u32;
        if next != clamped as i64 {
            let alarm = GantryError::CapacityInvariant {
                worker_id: self.id.clone(),
                running: next,
                max: self.max as i64,
            };
            tracing::error!(error = %alarm, "capacity accounting bug, clamping");
        }
        telemetry.running = clamped;
        clamped
    }

    /// Append a usage sample to the ring, dropping the oldest past the
    /// retention bound. Returns the sample for broadcasting outside the
    /// lock.
    pub fn push_usage(&self, cpu: f64, mem: f64, timestamp: DateTime<Utc>) -> UsageSample {
        let mut telemetry = self.telemetry.lock().expect("worker mutex poisoned");
        let sample = UsageSample {
            cpu,
            mem,
            jobs_max: self.max,
            jobs_running: telemetry.running,
            timestamp,
        };
        telemetry.usage.push_back(sample.clone());
        while telemetry.usage.len() > self.retention {
            telemetry.usage.pop_front();
        }
        sample
    }

    pub fn usage_snapshot(&self) -> Vec<UsageSample> {
        self.telemetry
            .lock()
            .expect("worker mutex poisoned")
            .usage
            .iter()
            .cloned()
            .collect()
    }
}

impl WorkerSlot for Worker {
    fn id(&self) -> &str {
        &self.id
    }

    fn capacity(&self) -> u32 {
        self.max.saturating_sub(self.running())
    }

    fn reserve(&self) {
        self.adjust_running(1);
    }

    fn release(&self) {
        self.adjust_running(-1);
    }
}
