//! Decision model: what happens to a job after an attempt.
//!
//! The decider is pure: given the job record (attempt counter, retry policy,
//! schedule), the attempt outcome and the current time, it returns the next
//! step. Applying the step, and letting a latched deactivate/delete override
//! it, is the job store's job.

use chrono::{DateTime, Utc};

use super::job::JobRecord;
use super::outcome::RunOutcome;
use crate::schedule::Trigger;

/// The next action for a job whose attempt just finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run the same due instant again at `at`.
    Retry { at: DateTime<Utc>, reason: String },

    /// The due instant is resolved. `None` means the schedule is exhausted
    /// and the job goes inactive.
    Advance {
        next_due_at: Option<DateTime<Utc>>,
        reason: String,
    },
}

impl Decision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Decision::Retry { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Decision::Retry { reason, .. } | Decision::Advance { reason, .. } => reason,
        }
    }
}

/// Decides the next action for a job based on its record and latest outcome.
pub trait Decider: Send + Sync {
    fn decide(&self, job: &JobRecord, outcome: &RunOutcome, now: DateTime<Utc>) -> Decision;
}

/// Fixed-backoff retry, then the schedule's own next due time.
///
/// - failure/timeout with attempts left: retry at `now + backoff`
/// - otherwise: advance from the due instant's first fire time
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn decide(&self, job: &JobRecord, outcome: &RunOutcome, now: DateTime<Utc>) -> Decision {
        let policy = job.spec.retry_policy();

        if !outcome.is_success() && job.attempt < policy.max_attempts {
            let at = now
                .checked_add_signed(policy.backoff())
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            return Decision::Retry {
                at,
                reason: format!(
                    "attempt {}/{} failed, retrying after {}s",
                    job.attempt, policy.max_attempts, policy.backoff_secs
                ),
            };
        }

        let reason = if outcome.is_success() {
            "succeeded".to_string()
        } else {
            format!("retries exhausted after {} attempt(s)", job.attempt)
        };

        let next_due_at = match Trigger::compile(&job.spec.schedule) {
            Ok(trigger) => trigger.next_due(now, Some(job.fired_at.unwrap_or(now))),
            Err(err) => {
                tracing::warn!(job = %job.spec.name, error = %err, "schedule no longer compiles");
                None
            }
        };

        Decision::Advance {
            next_due_at,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, JobSpec, RetryPolicy, ScheduleSpec};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
    }

    fn record(spec: JobSpec, attempt: u32) -> JobRecord {
        let mut job = JobRecord::new(JobId::from_ulid(Ulid::new()), spec, Some(t0()), t0());
        job.attempt = attempt;
        job.fired_at = Some(t0());
        job
    }

    #[test]
    fn failure_with_budget_left_retries_after_backoff() {
        let spec = JobSpec::new("j", ScheduleSpec::interval(900), 10)
            .with_retry(RetryPolicy::new(3, 60));
        let now = t0() + Duration::seconds(5);

        let decision = DefaultDecider.decide(&record(spec, 1), &RunOutcome::failure("boom"), now);
        assert_eq!(
            decision,
            Decision::Retry {
                at: now + Duration::seconds(60),
                reason: "attempt 1/3 failed, retrying after 60s".to_string(),
            }
        );
    }

    #[test]
    fn timeout_counts_like_failure() {
        let spec = JobSpec::new("j", ScheduleSpec::interval(900), 10)
            .with_retry(RetryPolicy::new(2, 30));
        let decision = DefaultDecider.decide(&record(spec, 1), &RunOutcome::timeout(10), t0());
        assert!(decision.is_retry());
    }

    #[test]
    fn exhausted_interval_advances_from_first_fire() {
        let spec = JobSpec::new("j", ScheduleSpec::interval(900), 10)
            .with_retry(RetryPolicy::new(3, 60));
        let now = t0() + Duration::seconds(200);

        let decision = DefaultDecider.decide(&record(spec, 3), &RunOutcome::failure("boom"), now);
        match decision {
            Decision::Advance { next_due_at, reason } => {
                assert_eq!(next_due_at, Some(t0() + Duration::seconds(900)));
                assert!(reason.contains("exhausted"));
            }
            other => panic!("expected advance, got {other:?}"),
        }
    }

    #[test]
    fn once_success_has_no_next_due() {
        let spec = JobSpec::new("j", ScheduleSpec::once(t0()), 10);
        let decision = DefaultDecider.decide(&record(spec, 1), &RunOutcome::success(json!({})), t0());
        assert_eq!(
            decision,
            Decision::Advance {
                next_due_at: None,
                reason: "succeeded".to_string()
            }
        );
    }
}
