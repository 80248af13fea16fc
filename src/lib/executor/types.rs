use thiserror::Error;

use crate::lib::tasks::types::RegistryError;

/// Errors reported synchronously to the submitter, before any worker runs.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The target container already has an operation in flight. The caller
    /// retries later; the request is never queued.
    #[error("an operation is already in flight for container {0}")]
    Conflict(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Terminal outcome of a tracked operation, as seen by a caller that
/// waited for it inline.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(String),
    Error(String),
}
