/// error types shared by the service, lifecycle, cache and write-behind layers
///
use thiserror::Error;

use crate::lifecycle::Status;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("duplicate service registration for {service}, conflicting capabilities: {conflicts:?}")]
    DuplicateService {
        service: String,
        conflicts: Vec<String>,
    },

    #[error("no factories exist for {0}")]
    NoFactory(String),

    #[error("multiple factories exist for {service}: {candidates:?}")]
    AmbiguousFactory {
        service: String,
        candidates: Vec<String>,
    },

    #[error("failed to resolve dependency {service}: {reason}")]
    Dependency { service: String, reason: String },

    #[error("cyclic dependency in service set: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("services already started")]
    AlreadyStarted,

    #[error("services already stopped")]
    AlreadyStopped,

    #[error("{action} not supported from {state}")]
    IllegalTransition { action: &'static str, state: Status },

    #[error("transition from {from} to {to} has already been resolved")]
    TransitionResolved { from: Status, to: Status },

    #[error("state is {0}, not AVAILABLE")]
    NotAvailable(Status),

    #[error("state is {0}, maintenance is not held by this thread")]
    NotInMaintenance(Status),

    #[error("state transition failed: {0}")]
    StateTransition(#[source] anyhow::Error),

    #[error("unknown thread pool alias: {0}")]
    UnknownPool(String),

    #[error("no thread pool alias specified and no default pool configured")]
    NoDefaultPool,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("queue closed: {0}")]
    QueueClosed(String),

    #[error("cache already exists: {0}")]
    CacheExists(String),

    #[error("cache {0} was created with different key/value types")]
    CacheTypeMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl CacheError {
    /// true for errors that indicate a misconfigured service set or cache; these are never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CacheError::DuplicateService { .. }
                | CacheError::NoFactory(_)
                | CacheError::AmbiguousFactory { .. }
                | CacheError::Dependency { .. }
                | CacheError::CyclicDependency(_)
                | CacheError::UnknownPool(_)
                | CacheError::NoDefaultPool
                | CacheError::InvalidConfig(_)
                | CacheError::Config(_)
        )
    }
}
