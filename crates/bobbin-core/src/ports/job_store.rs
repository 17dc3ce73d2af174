//! JobStore port - ジョブの正本（source of truth）
//!
//! The store owns job definitions, scheduling state and run history. Every
//! state change goes through one of these operations, and each operation is
//! atomic per job name: two dispatchers racing on `claim` for the same due
//! instant see exactly one winner, and a `finish` for a lease that has been
//! reaped is rejected with `LeaseLost`.
//!
//! # 実装
//! - [`MemoryJobStore`](crate::store::MemoryJobStore): DashMap, single process
//! - [`SqliteJobStore`](crate::store::SqliteJobStore): survives restarts, can be
//!   shared by several engine processes on one host

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ControlRequest, Decision, JobFilter, JobId, JobRecord, JobRunRecord, JobSpec, LeaseId,
    Metadata, Settlement,
};
use crate::error::BobbinError;
use crate::ports::IdGenerator;

/// Proof that the holder won the claim on one due instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub job_id: JobId,
    pub name: String,
    pub due_at: DateTime<Utc>,
    /// Per-attempt timeout of the job at claim time.
    pub timeout_secs: u64,
}

/// A job whose expired claim was released by [`JobStore::reap_expired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedJob {
    pub name: String,
    pub job_id: JobId,
    pub settlement: Settlement,
    /// The claimed attempt had started and was recorded as timed out.
    pub abandoned_attempt: Option<u32>,
}

/// Result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record of this job is gone.
    Removed(JobId),
    /// An attempt is in flight; the record goes away when it settles.
    Latched,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job. Fails with `DuplicateName` if the name is taken.
    async fn create(&self, job: JobRecord) -> Result<(), BobbinError>;

    async fn get(&self, name: &str) -> Result<Option<JobRecord>, BobbinError>;

    async fn get_by_id(&self, job_id: JobId) -> Result<Option<JobRecord>, BobbinError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, BobbinError>;

    /// Active jobs ordered by next due time, ties by name.
    async fn list_active(&self) -> Result<Vec<JobRecord>, BobbinError>;

    /// Shallow-merges `patch` into the job's metadata and returns the result.
    async fn update_metadata(
        &self,
        name: &str,
        patch: Metadata,
        now: DateTime<Utc>,
    ) -> Result<Metadata, BobbinError>;

    async fn deactivate(&self, name: &str, now: DateTime<Utc>) -> Result<(), BobbinError>;

    /// Puts an inactive job back on its schedule, due next from `now`.
    async fn activate(&self, name: &str, now: DateTime<Utc>) -> Result<JobRecord, BobbinError>;

    async fn delete(&self, name: &str, now: DateTime<Utc>) -> Result<DeleteOutcome, BobbinError>;

    /// Swaps the definition of an existing job (same name), keeping runtime
    /// metadata. Active idle jobs get `next_due_at`.
    async fn replace_spec(
        &self,
        spec: JobSpec,
        next_due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), BobbinError>;

    /// Claims the job's current due instant. `None` if it is not due, already
    /// claimed, inactive, or gone.
    async fn claim(
        &self,
        name: &str,
        lease_id: LeaseId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Lease>, BobbinError>;

    /// Marks the attempt as running and returns the record as of its start
    /// (with the incremented attempt counter).
    async fn start_attempt(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<JobRecord, BobbinError>;

    /// Applies the decision (and any latched control request), appends the run
    /// record and releases the lease, all in one step.
    async fn finish(
        &self,
        lease: &Lease,
        run: JobRunRecord,
        decision: &Decision,
        control: Option<ControlRequest>,
        now: DateTime<Utc>,
    ) -> Result<Settlement, BobbinError>;

    /// Run history of the job holding `name`, oldest first. Once the name is
    /// free again it is the history of the last job that held it; a job
    /// created later under the same name starts with an empty history.
    async fn runs(&self, name: &str) -> Result<Vec<JobRunRecord>, BobbinError>;

    /// Releases claims whose lease expired and returns what happened to each
    /// job. An attempt that was running gets a `timeout` run record, with its
    /// id taken from `ids`.
    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        ids: &dyn IdGenerator,
    ) -> Result<Vec<ReapedJob>, BobbinError>;
}
