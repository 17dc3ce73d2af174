//! Outcome of a single attempt.

use serde::{Deserialize, Serialize};

/// Classification of an attempt result, kept on the job as `last_outcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
    Timeout,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Failure => "failure",
            OutcomeKind::Timeout => "timeout",
        }
    }
}

/// What one attempt produced.
///
/// `Failure` covers both an error returned by the task body and a panic inside
/// it; `Timeout` means the body was still running when its budget ran out.
/// Failure and timeout count the same for retry accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Success { result: serde_json::Value },
    Failure { error: String },
    Timeout { after_secs: u64 },
}

impl RunOutcome {
    pub fn success(result: serde_json::Value) -> Self {
        RunOutcome::Success { result }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        RunOutcome::Failure {
            error: error.into(),
        }
    }

    pub fn timeout(after_secs: u64) -> Self {
        RunOutcome::Timeout { after_secs }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            RunOutcome::Success { .. } => OutcomeKind::Success,
            RunOutcome::Failure { .. } => OutcomeKind::Failure,
            RunOutcome::Timeout { .. } => OutcomeKind::Timeout,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }

    /// Human-readable error for failed attempts.
    pub fn error(&self) -> Option<String> {
        match self {
            RunOutcome::Success { .. } => None,
            RunOutcome::Failure { error } => Some(error.clone()),
            RunOutcome::Timeout { after_secs } => Some(format!("timed out after {after_secs}s")),
        }
    }
}
