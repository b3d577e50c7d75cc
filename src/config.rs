use std::path::PathBuf;
use std::time::Duration;

/// Server-wide configuration.
#[derive(Debug, Clone)]
pub struct GantryConfig {
    /// Coordination store endpoint, e.g. "127.0.0.1:2379". Ignored when
    /// `standalone` is set.
    pub store_addr: String,
    /// Run with an in-process coordination store instead of a remote one.
    pub standalone: bool,
    /// Deadline for one-shot worker RPCs (host info handshake).
    pub host_info_timeout_ms: u64,
    /// How many usage samples to retain per worker.
    pub usage_retention: usize,
    /// Delay before retrying a failed dispatch write.
    pub dispatch_retry_ms: u64,
    /// Window in which repeated triggers for the same commit coalesce.
    pub debounce_window_ms: u64,
    /// Outbound queue bound per event-bus subscriber.
    pub subscriber_queue: usize,
    pub tls: TlsConfig,
}

impl Default for GantryConfig {
    fn default() -> Self {
        Self {
            store_addr: "127.0.0.1:2379".to_string(),
            standalone: false,
            host_info_timeout_ms: 5_000,
            usage_retention: 120,
            dispatch_retry_ms: 500,
            debounce_window_ms: 5_000,
            subscriber_queue: 64,
            tls: TlsConfig::default(),
        }
    }
}

impl GantryConfig {
    pub fn host_info_timeout(&self) -> Duration {
        Duration::from_millis(self.host_info_timeout_ms)
    }

    pub fn dispatch_retry(&self) -> Duration {
        Duration::from_millis(self.dispatch_retry_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }
}

/// Mutual TLS settings for worker connections.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Permit plaintext worker connections. Intended for local clusters
    /// and the test suite only.
    pub allow_insecure: bool,
}

impl TlsConfig {
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}
