//! In-memory job store.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::{
    ControlRequest, Decision, JobFilter, JobId, JobRecord, JobRunRecord, JobSpec, LeaseId,
    Metadata, Settlement,
};
use crate::error::BobbinError;
use crate::ports::{DeleteOutcome, IdGenerator, JobStore, Lease, ReapedJob};
use crate::schedule::Trigger;

/// DashMap-backed store.
///
/// Each operation runs under the shard lock of a single name, which is what
/// makes `claim` a compare-and-set. Nothing here awaits while holding a
/// guard.
pub struct MemoryJobStore {
    /// name -> record (single source of truth)
    jobs: DashMap<String, JobRecord>,

    /// name -> run history, oldest first (may still hold runs of a deleted
    /// job that had the same name)
    runs: DashMap<String, VecDeque<JobRunRecord>>,

    /// Runs kept per name; 0 keeps everything.
    history_limit: usize,
}

impl MemoryJobStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            runs: DashMap::new(),
            history_limit,
        }
    }

    fn append_run(&self, run: JobRunRecord) {
        let mut history = self.runs.entry(run.job_name.clone()).or_default();
        history.push_back(run);
        if self.history_limit > 0 {
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }
    }

    fn with_job<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut JobRecord) -> Result<T, BobbinError>,
    ) -> Result<T, BobbinError> {
        let mut job = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| BobbinError::NotFound(name.to_string()))?;
        f(&mut job)
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: JobRecord) -> Result<(), BobbinError> {
        match self.jobs.entry(job.spec.name.clone()) {
            Entry::Occupied(_) => Err(BobbinError::DuplicateName(job.spec.name)),
            Entry::Vacant(slot) => {
                slot.insert(job);
                Ok(())
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Option<JobRecord>, BobbinError> {
        Ok(self.jobs.get(name).map(|job| job.clone()))
    }

    async fn get_by_id(&self, job_id: JobId) -> Result<Option<JobRecord>, BobbinError> {
        Ok(self
            .jobs
            .iter()
            .find(|job| job.job_id == job_id)
            .map(|job| job.clone()))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, BobbinError> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|job| filter.matches(job))
            .map(|job| job.clone())
            .collect();
        jobs.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        Ok(jobs)
    }

    async fn list_active(&self) -> Result<Vec<JobRecord>, BobbinError> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|job| job.is_active())
            .map(|job| job.clone())
            .collect();
        jobs.sort_by(JobRecord::due_order);
        Ok(jobs)
    }

    async fn update_metadata(
        &self,
        name: &str,
        patch: Metadata,
        now: DateTime<Utc>,
    ) -> Result<Metadata, BobbinError> {
        self.with_job(name, |job| Ok(job.merge_metadata(patch, now).clone()))
    }

    async fn deactivate(&self, name: &str, now: DateTime<Utc>) -> Result<(), BobbinError> {
        self.with_job(name, |job| {
            job.deactivate(now);
            Ok(())
        })
    }

    async fn activate(&self, name: &str, now: DateTime<Utc>) -> Result<JobRecord, BobbinError> {
        self.with_job(name, |job| {
            let next_due_at = Trigger::compile(&job.spec.schedule)?.next_due(now, None);
            job.activate(next_due_at, now)?;
            Ok(job.clone())
        })
    }

    async fn delete(&self, name: &str, now: DateTime<Utc>) -> Result<DeleteOutcome, BobbinError> {
        match self.jobs.entry(name.to_string()) {
            Entry::Vacant(_) => Err(BobbinError::NotFound(name.to_string())),
            Entry::Occupied(mut slot) => {
                if slot.get_mut().request_delete(now) {
                    let job = slot.remove();
                    Ok(DeleteOutcome::Removed(job.job_id))
                } else {
                    Ok(DeleteOutcome::Latched)
                }
            }
        }
    }

    async fn replace_spec(
        &self,
        spec: JobSpec,
        next_due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), BobbinError> {
        let name = spec.name.clone();
        self.with_job(&name, |job| {
            job.replace_spec(spec, next_due_at, now);
            Ok(())
        })
    }

    async fn claim(
        &self,
        name: &str,
        lease_id: LeaseId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Lease>, BobbinError> {
        let Some(mut job) = self.jobs.get_mut(name) else {
            return Ok(None);
        };
        if !job.claim(lease_id, now, expires_at) {
            return Ok(None);
        }
        Ok(job.claim.map(|claim| Lease {
            lease_id,
            job_id: job.job_id,
            name: name.to_string(),
            due_at: claim.due_at,
            timeout_secs: job.spec.timeout_secs,
        }))
    }

    async fn start_attempt(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<JobRecord, BobbinError> {
        let mut job = self.jobs.get_mut(&lease.name).ok_or_else(|| BobbinError::LeaseLost {
            name: lease.name.clone(),
            lease: lease.lease_id,
        })?;
        job.start_attempt(lease.lease_id, now, expires_at)?;
        Ok(job.clone())
    }

    async fn finish(
        &self,
        lease: &Lease,
        mut run: JobRunRecord,
        decision: &Decision,
        control: Option<ControlRequest>,
        now: DateTime<Utc>,
    ) -> Result<Settlement, BobbinError> {
        let settlement = match self.jobs.entry(lease.name.clone()) {
            Entry::Vacant(_) => {
                return Err(BobbinError::LeaseLost {
                    name: lease.name.clone(),
                    lease: lease.lease_id,
                });
            }
            Entry::Occupied(mut slot) => {
                let settlement =
                    slot.get_mut()
                        .settle(lease.lease_id, decision, control, run.outcome.kind(), now)?;
                if settlement == Settlement::Deleted {
                    slot.remove();
                }
                settlement
            }
        };
        run.retry_scheduled = settlement.retry_scheduled();
        self.append_run(run);
        Ok(settlement)
    }

    async fn runs(&self, name: &str) -> Result<Vec<JobRunRecord>, BobbinError> {
        let live = self.jobs.get(name).map(|job| job.job_id);
        let Some(history) = self.runs.get(name) else {
            return Ok(Vec::new());
        };
        let Some(owner) = live.or_else(|| history.back().map(|run| run.job_id)) else {
            return Ok(Vec::new());
        };
        Ok(history
            .iter()
            .filter(|run| run.job_id == owner)
            .cloned()
            .collect())
    }

    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        ids: &dyn IdGenerator,
    ) -> Result<Vec<ReapedJob>, BobbinError> {
        let mut reaped = Vec::new();
        let mut abandoned_runs = Vec::new();
        for mut job in self.jobs.iter_mut() {
            let Some(released) = job.release_expired(now, || ids.run_id()) else {
                continue;
            };
            reaped.push(ReapedJob {
                name: job.spec.name.clone(),
                job_id: job.job_id,
                settlement: released.settlement,
                abandoned_attempt: released.abandoned_run.as_ref().map(|run| run.attempt),
            });
            abandoned_runs.extend(released.abandoned_run);
        }
        for reaped_job in &reaped {
            if reaped_job.settlement == Settlement::Deleted {
                self.jobs.remove_if(&reaped_job.name, |_, job| {
                    job.job_id == reaped_job.job_id && !job.is_in_flight()
                });
            }
        }
        for run in abandoned_runs {
            self.append_run(run);
        }
        Ok(reaped)
    }
}
