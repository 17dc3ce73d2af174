//! Job record: definition + scheduling state.
//!
//! This is the single source of truth for one job. Both store implementations
//! keep `JobRecord`s and mutate them only through the transition methods
//! below, so the state machine is the same whether jobs live in memory or in
//! SQLite.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::Decision;
use super::ids::{JobId, LeaseId, RunId};
use super::outcome::{OutcomeKind, RunOutcome};
use super::run::JobRunRecord;
use super::spec::{JobSpec, Metadata};
use super::state::{ControlRequest, JobPhase, JobStatus};
use crate::error::BobbinError;
use crate::schedule::Trigger;

/// A claim on one due instant, held by the dispatcher that won it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub lease_id: LeaseId,
    pub due_at: DateTime<Utc>,
    pub claimed_at: DateTime<Utc>,
    /// After this instant the claim is considered abandoned and may be reaped.
    pub expires_at: DateTime<Utc>,
    /// Set once the attempt body has been started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// How an attempt (or a reaped claim) left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Settlement {
    /// Due instant resolved, next one computed from the schedule.
    Rescheduled { next_due_at: DateTime<Utc> },
    /// Same due instant will run again.
    RetryScheduled { at: DateTime<Utc> },
    /// Schedule exhausted (a resolved `once` job).
    Completed,
    /// A latched or external deactivation took effect.
    Deactivated,
    /// A latched deletion took effect; the store drops the record.
    Deleted,
}

impl Settlement {
    pub fn retry_scheduled(&self) -> bool {
        matches!(self, Settlement::RetryScheduled { .. })
    }

    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Settlement::Rescheduled { next_due_at } => Some(*next_due_at),
            Settlement::RetryScheduled { at } => Some(*at),
            _ => None,
        }
    }
}

/// Definition plus scheduling state for one job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub spec: JobSpec,

    pub status: JobStatus,
    pub phase: JobPhase,

    /// When the job is next eligible to run (a retry time while retrying).
    pub next_due_at: Option<DateTime<Utc>>,

    /// Attempts made for the current due instant; 0 when none is pending.
    pub attempt: u32,

    /// Start of the first attempt of the current due instant.
    pub fired_at: Option<DateTime<Utc>>,

    /// `fired_at` of the most recently resolved due instant.
    pub last_fired_at: Option<DateTime<Utc>>,

    pub last_outcome: Option<OutcomeKind>,

    pub claim: Option<Claim>,

    /// Deactivate/delete requested while an attempt was in flight.
    pub pending_control: Option<ControlRequest>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A job with no first due instant starts out inactive.
    pub fn new(
        job_id: JobId,
        spec: JobSpec,
        next_due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            spec,
            status: if next_due_at.is_some() {
                JobStatus::Active
            } else {
                JobStatus::Inactive
            },
            phase: JobPhase::Idle,
            next_due_at,
            attempt: 0,
            fired_at: None,
            last_fired_at: None,
            last_outcome: None,
            claim: None,
            pending_control: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }

    pub fn is_in_flight(&self) -> bool {
        self.phase.is_in_flight()
    }

    /// Active, idle and past its due time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active()
            && !self.is_in_flight()
            && self.next_due_at.is_some_and(|due| due <= now)
    }

    /// Ordering used by `list_active`: next due ascending, ties by name.
    pub fn due_order(a: &JobRecord, b: &JobRecord) -> Ordering {
        match (a.next_due_at, b.next_due_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.spec.name.cmp(&b.spec.name))
    }

    /// Idle -> Claimed. Returns false (and changes nothing) if the job is not due.
    pub fn claim(&mut self, lease_id: LeaseId, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> bool {
        if !self.is_due(now) {
            return false;
        }
        let due_at = self.next_due_at.unwrap_or(now);
        self.phase = JobPhase::Claimed;
        self.claim = Some(Claim {
            lease_id,
            due_at,
            claimed_at: now,
            expires_at,
            started_at: None,
        });
        self.updated_at = now;
        true
    }

    fn held_claim(&self, lease_id: LeaseId) -> Result<Claim, BobbinError> {
        match self.claim {
            Some(claim) if claim.lease_id == lease_id => Ok(claim),
            _ => Err(BobbinError::LeaseLost {
                name: self.spec.name.clone(),
                lease: lease_id,
            }),
        }
    }

    /// Claimed -> Running. Increments the attempt counter and returns it.
    pub fn start_attempt(
        &mut self,
        lease_id: LeaseId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u32, BobbinError> {
        let mut claim = self.held_claim(lease_id)?;
        if self.phase != JobPhase::Claimed {
            return Err(BobbinError::LeaseLost {
                name: self.spec.name.clone(),
                lease: lease_id,
            });
        }
        claim.expires_at = expires_at;
        claim.started_at = Some(now);
        self.claim = Some(claim);
        self.phase = JobPhase::Running;
        self.attempt += 1;
        if self.fired_at.is_none() {
            self.fired_at = Some(now);
        }
        self.updated_at = now;
        Ok(self.attempt)
    }

    /// Running -> Idle, applying the decider's step and then any latched
    /// control request, which always wins.
    pub fn settle(
        &mut self,
        lease_id: LeaseId,
        decision: &Decision,
        control: Option<ControlRequest>,
        outcome: OutcomeKind,
        now: DateTime<Utc>,
    ) -> Result<Settlement, BobbinError> {
        self.held_claim(lease_id)?;

        self.last_outcome = Some(outcome);
        self.phase = JobPhase::Idle;
        self.claim = None;
        self.updated_at = now;

        let control = ControlRequest::merge(self.pending_control.take(), control);
        let settlement = match (control, decision) {
            (Some(ControlRequest::Delete), _) => {
                self.go_inactive();
                Settlement::Deleted
            }
            (Some(ControlRequest::Deactivate), _) => {
                self.go_inactive();
                Settlement::Deactivated
            }
            (None, Decision::Retry { at, .. }) => {
                self.next_due_at = Some(*at);
                return Ok(Settlement::RetryScheduled { at: *at });
            }
            (None, Decision::Advance { next_due_at, .. }) => match next_due_at {
                Some(next) => {
                    self.next_due_at = Some(*next);
                    Settlement::Rescheduled { next_due_at: *next }
                }
                None => {
                    self.go_inactive();
                    Settlement::Completed
                }
            },
        };
        self.resolve_due_instant();
        Ok(settlement)
    }

    /// Releases a claim whose lease expired (the process holding it is gone).
    ///
    /// An attempt that had started counts as timed out: it uses up one
    /// attempt, retries after the policy's backoff while the budget lasts and
    /// is returned as a run record for the history. A claim that never
    /// started is simply due again.
    pub fn release_expired(
        &mut self,
        now: DateTime<Utc>,
        run_id: impl FnOnce() -> RunId,
    ) -> Option<ReleasedClaim> {
        let claim = self.claim?;
        if claim.expires_at > now {
            return None;
        }
        let abandoned = self.phase == JobPhase::Running;
        self.phase = JobPhase::Idle;
        self.claim = None;
        self.updated_at = now;
        if abandoned {
            self.last_outcome = Some(OutcomeKind::Timeout);
        }

        let policy = self.spec.retry_policy();
        let settlement = match self.pending_control.take() {
            Some(ControlRequest::Delete) => {
                self.go_inactive();
                Settlement::Deleted
            }
            Some(ControlRequest::Deactivate) => {
                self.go_inactive();
                Settlement::Deactivated
            }
            None if !abandoned => {
                self.next_due_at = Some(claim.due_at);
                Settlement::RetryScheduled { at: claim.due_at }
            }
            None if self.attempt < policy.max_attempts => {
                let at = now
                    .checked_add_signed(policy.backoff())
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.next_due_at = Some(at);
                Settlement::RetryScheduled { at }
            }
            None => {
                let next = Trigger::compile(&self.spec.schedule)
                    .ok()
                    .and_then(|t| t.next_due(now, Some(self.fired_at.unwrap_or(now))));
                match next {
                    Some(next_due_at) => {
                        self.next_due_at = Some(next_due_at);
                        Settlement::Rescheduled { next_due_at }
                    }
                    None => {
                        self.go_inactive();
                        Settlement::Completed
                    }
                }
            }
        };

        let abandoned_run = abandoned.then(|| JobRunRecord {
            run_id: run_id(),
            job_id: self.job_id,
            job_name: self.spec.name.clone(),
            due_at: claim.due_at,
            attempt: self.attempt,
            started_at: claim.started_at.unwrap_or(claim.claimed_at),
            finished_at: now,
            outcome: RunOutcome::timeout(self.spec.timeout_secs),
            retry_scheduled: settlement.retry_scheduled(),
        });
        if !settlement.retry_scheduled() {
            self.resolve_due_instant();
        }
        Some(ReleasedClaim {
            settlement,
            abandoned_run,
        })
    }

    /// External deactivation. Idempotent; latched if an attempt is in flight.
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        if self.is_in_flight() {
            self.pending_control =
                ControlRequest::merge(self.pending_control, Some(ControlRequest::Deactivate));
        } else {
            self.resolve_due_instant();
        }
        self.go_inactive();
        self.updated_at = now;
    }

    /// External deletion. Returns true when the record can be dropped right
    /// away, false when the deletion was latched behind an in-flight attempt.
    pub fn request_delete(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_in_flight() {
            return true;
        }
        self.pending_control = Some(ControlRequest::Delete);
        self.go_inactive();
        self.updated_at = now;
        false
    }

    /// Puts the job back on its schedule. A latched deletion cannot be undone.
    pub fn activate(
        &mut self,
        next_due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), BobbinError> {
        if self.pending_control == Some(ControlRequest::Delete) {
            return Err(BobbinError::NotFound(self.spec.name.clone()));
        }
        if self.is_in_flight() {
            self.pending_control = None;
        } else {
            self.resolve_due_instant();
        }
        self.next_due_at = next_due_at;
        self.status = if next_due_at.is_some() {
            JobStatus::Active
        } else {
            JobStatus::Inactive
        };
        self.updated_at = now;
        Ok(())
    }

    /// Shallow merge: keys in `patch` overwrite, other keys are kept.
    pub fn merge_metadata(&mut self, patch: Metadata, now: DateTime<Utc>) -> &Metadata {
        self.spec.metadata.extend(patch);
        self.updated_at = now;
        &self.spec.metadata
    }

    /// Swaps in a new definition for the same name, keeping the metadata the
    /// job accumulated at runtime on top of the declared metadata.
    pub fn replace_spec(
        &mut self,
        spec: JobSpec,
        next_due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let runtime_metadata = std::mem::take(&mut self.spec.metadata);
        self.spec = spec;
        self.spec.metadata.extend(runtime_metadata);
        if self.is_active() && !self.is_in_flight() && self.next_due_at != next_due_at {
            self.resolve_due_instant();
            self.next_due_at = next_due_at;
            if next_due_at.is_none() {
                self.status = JobStatus::Inactive;
            }
        }
        self.updated_at = now;
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id,
            name: self.spec.name.clone(),
            schedule: self.spec.schedule.kind(),
            status: self.status,
            next_due_at: self.next_due_at,
            last_outcome: self.last_outcome,
            attempt: self.attempt,
            in_flight: self.is_in_flight(),
        }
    }

    fn go_inactive(&mut self) {
        self.status = JobStatus::Inactive;
        self.next_due_at = None;
    }

    fn resolve_due_instant(&mut self) {
        if self.fired_at.is_some() {
            self.last_fired_at = self.fired_at;
        }
        self.fired_at = None;
        self.attempt = 0;
    }
}

/// Result of [`JobRecord::release_expired`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasedClaim {
    pub settlement: Settlement,
    /// Timeout record for an attempt that was running when its lease expired.
    pub abandoned_run: Option<JobRunRecord>,
}

/// Listing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub name: String,
    pub schedule: &'static str,
    pub status: JobStatus,
    pub next_due_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<OutcomeKind>,
    pub attempt: u32,
    pub in_flight: bool,
}

/// Optional filter for `list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub name_prefix: Option<String>,
}

impl JobFilter {
    pub fn active() -> Self {
        Self {
            status: Some(JobStatus::Active),
            name_prefix: None,
        }
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        self.status.is_none_or(|status| job.status == status)
            && self
                .name_prefix
                .as_deref()
                .is_none_or(|prefix| job.spec.name.starts_with(prefix))
    }
}
