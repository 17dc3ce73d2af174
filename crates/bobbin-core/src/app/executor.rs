//! Executor - 1 attempt の実行
//!
//! start_attempt -> run body (timeout / panic isolation) -> decide -> finish
//!
//! The body runs in its own tokio task, so a panic surfaces as a `JoinError`
//! instead of unwinding through the dispatcher. On timeout the task is
//! aborted; a body that never reaches an await point cannot be stopped, but
//! its result is ignored and the attempt is recorded as timed out.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinError;

use crate::domain::{Decider, JobRunRecord, OutcomeKind, RunOutcome, Settlement};
use crate::error::BobbinError;
use crate::ports::{Clock, IdGenerator, JobStore, Lease};
use crate::task::{BodyRegistry, JobHandle};

/// What happened to one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub name: String,
    pub attempt: u32,
    pub outcome: OutcomeKind,
    /// `None` when the lease was lost before the attempt could settle.
    pub settlement: Option<Settlement>,
}

pub struct Executor {
    store: Arc<dyn JobStore>,
    bodies: Arc<BodyRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    lease_grace: chrono::Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        bodies: Arc<BodyRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        decider: Arc<dyn Decider>,
        lease_grace: chrono::Duration,
    ) -> Self {
        Self {
            store,
            bodies,
            clock,
            ids,
            decider,
            lease_grace,
        }
    }

    /// When a claim taken at `now` for a job with `timeout_secs` expires.
    pub fn lease_expiry(&self, now: DateTime<Utc>, timeout_secs: u64) -> DateTime<Utc> {
        now.checked_add_signed(crate::domain::spec::seconds(timeout_secs))
            .and_then(|t| t.checked_add_signed(self.lease_grace))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Runs one attempt for a won claim and settles it.
    pub async fn execute(&self, lease: Lease) -> Result<AttemptReport, BobbinError> {
        let started_at = self.clock.now();
        let expires_at = self.lease_expiry(started_at, lease.timeout_secs);
        let job = self.store.start_attempt(&lease, started_at, expires_at).await?;
        let attempt = job.attempt;
        tracing::info!(job = %lease.name, attempt, due_at = %lease.due_at, "attempt started");

        let handle = JobHandle::new(
            lease.name.clone(),
            lease.job_id,
            attempt,
            lease.due_at,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        );
        let outcome = self.run_body(&lease, handle.clone(), job.spec.timeout()).await;

        let finished_at = self.clock.now();
        let decision = self.decider.decide(&job, &outcome, finished_at);
        let control = handle.requested_control();

        match &outcome {
            RunOutcome::Success { .. } => {}
            RunOutcome::Failure { error } => {
                tracing::warn!(job = %lease.name, attempt, error = %error, "attempt failed");
            }
            RunOutcome::Timeout { after_secs } => {
                tracing::warn!(job = %lease.name, attempt, after_secs, "attempt timed out");
            }
        }

        let run = JobRunRecord {
            run_id: self.ids.run_id(),
            job_id: lease.job_id,
            job_name: lease.name.clone(),
            due_at: lease.due_at,
            attempt,
            started_at,
            finished_at,
            outcome: outcome.clone(),
            retry_scheduled: false,
        };

        let settlement = match self
            .store
            .finish(&lease, run, &decision, control, finished_at)
            .await
        {
            Ok(settlement) => Some(settlement),
            Err(err @ BobbinError::LeaseLost { .. }) => {
                // reaper が timeout として記録・再スケジュール済み
                tracing::warn!(
                    job = %lease.name,
                    attempt,
                    outcome = outcome.kind().as_str(),
                    error = %err,
                    "lease lost before settling, result discarded"
                );
                None
            }
            Err(err) => return Err(err),
        };

        if let Some(settlement) = &settlement {
            if *settlement == Settlement::Deleted {
                self.bodies.remove(&lease.name, lease.job_id);
            }
            tracing::info!(
                job = %lease.name,
                attempt,
                outcome = outcome.kind().as_str(),
                settlement = ?settlement,
                next_due_at = ?settlement.next_due_at(),
                reason = decision.reason(),
                "attempt settled"
            );
        }

        Ok(AttemptReport {
            name: lease.name,
            attempt,
            outcome: outcome.kind(),
            settlement,
        })
    }

    async fn run_body(&self, lease: &Lease, handle: JobHandle, timeout: Duration) -> RunOutcome {
        let Some(body) = self.bodies.get(&lease.name) else {
            return RunOutcome::failure(format!("no task body registered for `{}`", lease.name));
        };

        let task = tokio::spawn(async move { body.run(handle).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(result))) => RunOutcome::success(result),
            Ok(Ok(Err(err))) => RunOutcome::failure(format!("{err:#}")),
            Ok(Err(join_err)) => RunOutcome::failure(describe_join_error(join_err)),
            Err(_elapsed) => {
                abort.abort();
                RunOutcome::timeout(lease.timeout_secs)
            }
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "task was cancelled".to_string();
    }
    let payload = err.into_panic();
    format!("task panicked: {}", panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}
