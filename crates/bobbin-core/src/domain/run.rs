//! Run history: one append-only record per execution attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, RunId};
use super::outcome::RunOutcome;

/// A single execution attempt of a job.
///
/// Records are written once when the attempt settles and never mutated.
/// For one job name they are ordered by attempt and by real time, since at
/// most one attempt is ever in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunRecord {
    pub run_id: RunId,
    pub job_id: JobId,
    pub job_name: String,

    /// The due instant this attempt belongs to.
    pub due_at: DateTime<Utc>,

    /// 1-based within the due instant.
    pub attempt: u32,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,

    /// True when another attempt for the same due instant was scheduled.
    pub retry_scheduled: bool,
}

impl JobRunRecord {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
