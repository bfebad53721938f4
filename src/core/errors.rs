use thiserror::Error;

use crate::models::models::{CatchId, UserId};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid location: longitude {longitude}, latitude {latitude}")]
    InvalidLocation { longitude: f64, latitude: f64 },

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Unknown catch: {0}")]
    UnknownCatch(CatchId),

    #[error("Conflict on {entity}: expected version {expected}, found {found}")]
    Conflict {
        entity: String,
        expected: u64,
        found: u64,
    },

    #[error("Timeout: {operation} exceeded {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid cursor")]
    InvalidCursor,

    #[error("Forbidden: user {actor} does not own catch {catch}")]
    Forbidden { actor: UserId, catch: CatchId },

    #[error("Visibility of catch {0} can no longer be widened")]
    VisibilityLocked(CatchId),

    #[error("Username exists: {0}")]
    DuplicateUsername(String),

    #[error("Email already registered: {0}")]
    DuplicateEmail(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Store handle is shut down")]
    ShutDown,
}

impl CoreError {
    /// `Conflict` and `Timeout` may succeed when retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Conflict { .. } | CoreError::Timeout { .. })
    }
}

// Backend failures surface as storage errors
impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
