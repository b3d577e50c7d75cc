use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GantryError {
    #[error("transient transport failure: {0}")]
    TransientTransport(String),

    #[error("worker protocol violation: {0}")]
    WorkerProtocol(String),

    #[error("capacity invariant violated on worker {worker_id}: running={running} max={max}")]
    CapacityInvariant {
        worker_id: String,
        running: i64,
        max: i64,
    },

    #[error("job {0} already has a pending dispatch")]
    DispatchConflict(Uuid),

    #[error("coordination store unavailable: {0}")]
    StorePermanent(String),

    #[error("build configuration error: {0}")]
    BuildConfig(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("build not found: {0}")]
    BuildNotFound(Uuid),

    #[error("repository not found: {0}")]
    RepoNotFound(Uuid),

    #[error("scheduler is not accepting submissions: {0}")]
    SchedulerUnavailable(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GantryError {
    /// Transient errors are retried with backoff; everything else is
    /// surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GantryError::TransientTransport(_) | GantryError::Grpc(_) | GantryError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GantryError>;
