//! Engine - 管理 API のファサード
//!
//! Create / inspect / deactivate / delete jobs, and start the dispatcher loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

use super::dispatcher::{Dispatcher, Tick};
use crate::config::EngineConfig;
use crate::domain::{
    JobFilter, JobId, JobRecord, JobRunRecord, JobSpec, JobSummary, Metadata,
};
use crate::error::BobbinError;
use crate::ports::{Clock, DeleteOutcome, IdGenerator, JobStore};
use crate::schedule;
use crate::task::{BodyRegistry, TaskBody};

/// A job addressed by name or by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRef {
    Name(String),
    Id(JobId),
}

impl From<&str> for JobRef {
    fn from(name: &str) -> Self {
        JobRef::Name(name.to_string())
    }
}

impl From<String> for JobRef {
    fn from(name: String) -> Self {
        JobRef::Name(name)
    }
}

impl From<JobId> for JobRef {
    fn from(id: JobId) -> Self {
        JobRef::Id(id)
    }
}

/// Returned by [`Engine::create_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedJob {
    pub job_id: JobId,
    pub name: String,
}

pub struct Engine {
    store: Arc<dyn JobStore>,
    bodies: Arc<BodyRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
}

impl Engine {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        bodies: Arc<BodyRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        dispatcher: Arc<Dispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            bodies,
            clock,
            ids,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validates and stores a new job, registers its body and wakes the
    /// dispatcher.
    pub async fn create_job(
        &self,
        spec: JobSpec,
        body: impl TaskBody,
    ) -> Result<CreatedJob, BobbinError> {
        self.create_job_arc(spec, Arc::new(body)).await
    }

    pub(crate) async fn create_job_arc(
        &self,
        spec: JobSpec,
        body: Arc<dyn TaskBody>,
    ) -> Result<CreatedJob, BobbinError> {
        let now = self.clock.now();
        let trigger = spec.validate(now, self.config.once_grace())?;
        let next_due_at = trigger.next_due(now, None);

        let job_id = self.ids.job_id();
        let name = spec.name.clone();
        let schedule = spec.schedule.kind();
        self.store
            .create(JobRecord::new(job_id, spec, next_due_at, now))
            .await?;
        self.bodies.insert(name.clone(), job_id, body);
        self.dispatcher.wake();

        info!(job = %name, %job_id, schedule, next_due_at = ?next_due_at, "job created");
        Ok(CreatedJob { job_id, name })
    }

    pub async fn get_job(&self, name: &str) -> Result<JobRecord, BobbinError> {
        self.store
            .get(name)
            .await?
            .ok_or_else(|| BobbinError::NotFound(name.to_string()))
    }

    /// Marks the job inactive. Idempotent; if an attempt is in flight it
    /// finishes, but the job does not come back on schedule.
    pub async fn deactivate_job(&self, job: impl Into<JobRef>) -> Result<(), BobbinError> {
        let name = self.resolve(job.into()).await?;
        self.store.deactivate(&name, self.clock.now()).await?;
        info!(job = %name, "job deactivated");
        Ok(())
    }

    /// Removes the job. If an attempt is in flight the removal happens when it
    /// settles and any pending retry is dropped.
    pub async fn delete_job(&self, job: impl Into<JobRef>) -> Result<(), BobbinError> {
        let name = self.resolve(job.into()).await?;
        match self.store.delete(&name, self.clock.now()).await? {
            DeleteOutcome::Removed(job_id) => {
                self.bodies.remove(&name, job_id);
                info!(job = %name, %job_id, "job deleted");
            }
            DeleteOutcome::Latched => {
                info!(job = %name, "job deletion latched until the running attempt settles");
            }
        }
        Ok(())
    }

    /// Puts an inactive job back on its schedule, due next from now.
    pub async fn activate_job(&self, job: impl Into<JobRef>) -> Result<(), BobbinError> {
        let name = self.resolve(job.into()).await?;
        let record = self.store.activate(&name, self.clock.now()).await?;
        if !self.bodies.contains(&name) {
            warn!(job = %name, "activated job has no task body registered");
        }
        self.dispatcher.wake();
        info!(job = %name, next_due_at = ?record.next_due_at, "job activated");
        Ok(())
    }

    pub async fn update_metadata(
        &self,
        name: &str,
        patch: Metadata,
    ) -> Result<Metadata, BobbinError> {
        self.store
            .update_metadata(name, patch, self.clock.now())
            .await
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobSummary>, BobbinError> {
        let jobs = self.store.list(&filter).await?;
        Ok(jobs.iter().map(JobRecord::summary).collect())
    }

    /// Run history for `name`, oldest first. Kept after the job is deleted,
    /// until a new job is created under the same name.
    pub async fn runs(&self, name: &str) -> Result<Vec<JobRunRecord>, BobbinError> {
        self.store.runs(name).await
    }

    /// Registers a body for a job that already exists in the store (a dynamic
    /// job after a restart, typically).
    pub async fn attach_body(&self, name: &str, body: impl TaskBody) -> Result<(), BobbinError> {
        let job = self.get_job(name).await?;
        self.bodies.insert(name, job.job_id, Arc::new(body));
        self.dispatcher.wake();
        Ok(())
    }

    pub fn has_body(&self, name: &str) -> bool {
        self.bodies.contains(name)
    }

    /// When `name` is next due, computed from its schedule as if it were
    /// created now. Does not touch the store.
    pub async fn preview_next_due(
        &self,
        name: &str,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, BobbinError> {
        let job = self.get_job(name).await?;
        schedule::next_due(&job.spec.schedule, self.clock.now(), None)
    }

    /// One scheduling pass, outside the run loop.
    pub async fn tick(&self) -> Result<Tick, BobbinError> {
        self.dispatcher.tick().await
    }

    /// Starts the dispatcher loop in the background.
    pub fn start(&self) -> EngineRunner {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::clone(&self.dispatcher);
        let join = tokio::spawn(dispatcher.run(shutdown_rx).instrument(info_span!("dispatcher")));
        EngineRunner { shutdown_tx, join }
    }

    async fn resolve(&self, job: JobRef) -> Result<String, BobbinError> {
        match job {
            JobRef::Name(name) => Ok(name),
            JobRef::Id(id) => self
                .store
                .get_by_id(id)
                .await?
                .map(|job| job.spec.name)
                .ok_or_else(|| BobbinError::NotFound(id.to_string())),
        }
    }
}

/// Handle to a running dispatcher loop.
///
/// - `request_shutdown` で停止要求
/// - `shutdown_and_join` で実行中の attempt を待ってから戻る
pub struct EngineRunner {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl EngineRunner {
    pub fn request_shutdown(&self) {
        // 受信側がもういなくても問題ない
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            warn!(error = %err, "dispatcher task panicked");
        }
    }
}
