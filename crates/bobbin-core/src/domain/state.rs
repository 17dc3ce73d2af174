//! Job lifecycle states.

use serde::{Deserialize, Serialize};

/// Whether a job is still scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Inactive,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Inactive => "inactive",
        }
    }
}

/// Execution phase of one job.
///
/// Transitions:
/// - Idle -> Claimed (dispatcher wins the claim)
/// - Claimed -> Running (executor starts an attempt)
/// - Running -> Idle (settled: rescheduled, retry scheduled, or inactive)
/// - Claimed/Running -> Idle (lease expired and reaped)
///
/// A job is "in flight" in every phase except `Idle`; at most one attempt can
/// be in flight per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Idle,
    Claimed,
    Running,
}

impl JobPhase {
    pub fn is_in_flight(self) -> bool {
        !matches!(self, JobPhase::Idle)
    }
}

/// A terminal request latched while an attempt is in flight.
///
/// Applied after the attempt's own outcome, so it always wins over a
/// computed next due time. `Delete` is stronger than `Deactivate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    Deactivate,
    Delete,
}

impl ControlRequest {
    /// Combines two latched requests; the stronger one survives.
    pub fn merge(current: Option<Self>, incoming: Option<Self>) -> Option<Self> {
        match (current, incoming) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}
