use thiserror::Error;

use crate::domain::LeaseId;

/// Errors raised synchronously by management and store operations.
///
/// Task failures and timeouts never surface here: they are recorded as
/// [`RunOutcome`](crate::domain::RunOutcome)s in the run history.
#[derive(Debug, Error)]
pub enum BobbinError {
    #[error("job `{0}` already exists")]
    DuplicateName(String),

    #[error("job `{0}` not found")]
    NotFound(String),

    #[error("invalid job name: {0}")]
    InvalidName(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// The claim was reaped or released while the caller still believed it held it.
    #[error("lease {lease} on job `{name}` is no longer held")]
    LeaseLost { name: String, lease: LeaseId },

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BobbinError {
    /// True for the "job does not exist" case, which callers often treat as benign.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BobbinError::NotFound(_))
    }
}
