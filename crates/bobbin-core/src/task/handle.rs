use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::domain::{ControlRequest, JobId, Metadata};
use crate::error::BobbinError;
use crate::ports::{Clock, JobStore};

/// What a running task body sees of its own job.
///
/// Metadata reads and writes go straight to the store, so a write is visible
/// to the next read (in this attempt and in later ones). `deactivate` and
/// `delete` only latch a request; the executor applies it when the attempt
/// settles, after the outcome, so it always wins over the computed next due
/// time.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    job_id: JobId,
    attempt: u32,
    due_at: DateTime<Utc>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    control: Mutex<Option<ControlRequest>>,
}

impl JobHandle {
    pub(crate) fn new(
        name: String,
        job_id: JobId,
        attempt: u32,
        due_at: DateTime<Utc>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                job_id,
                attempt,
                due_at,
                store,
                clock,
                control: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    /// 1-based attempt number within the current due instant.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    /// The due instant this attempt belongs to.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.inner.due_at
    }

    /// Current metadata, as stored.
    pub async fn metadata(&self) -> Result<Metadata, BobbinError> {
        let job = self
            .inner
            .store
            .get(&self.inner.name)
            .await?
            .ok_or_else(|| BobbinError::NotFound(self.inner.name.clone()))?;
        Ok(job.spec.metadata)
    }

    /// Shallow-merges `patch` into the stored metadata and returns the result.
    pub async fn update_metadata(&self, patch: Metadata) -> Result<Metadata, BobbinError> {
        self.inner
            .store
            .update_metadata(&self.inner.name, patch, self.inner.clock.now())
            .await
    }

    /// Convenience for a single-key update.
    pub async fn set_metadata(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Metadata, BobbinError> {
        let mut patch = Metadata::new();
        patch.insert(key.into(), value);
        self.update_metadata(patch).await
    }

    /// Stop scheduling this job once the current attempt settles.
    pub fn deactivate(&self) {
        self.latch(ControlRequest::Deactivate);
    }

    /// Remove this job once the current attempt settles.
    pub fn delete(&self) {
        self.latch(ControlRequest::Delete);
    }

    pub fn requested_control(&self) -> Option<ControlRequest> {
        *self
            .inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn latch(&self, request: ControlRequest) {
        let mut control = self
            .inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *control = ControlRequest::merge(*control, Some(request));
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("name", &self.inner.name)
            .field("job_id", &self.inner.job_id)
            .field("attempt", &self.inner.attempt)
            .field("due_at", &self.inner.due_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobRecord, JobSpec, ScheduleSpec};
    use crate::ports::FixedClock;
    use crate::store::MemoryJobStore;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    async fn handle() -> JobHandle {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let store = Arc::new(MemoryJobStore::default());
        let mut spec = JobSpec::new("inline", ScheduleSpec::once(t0), 30);
        spec.metadata.insert("test".into(), json!("test"));
        let job_id = JobId::from_ulid(Ulid::new());
        store
            .create(JobRecord::new(job_id, spec, Some(t0), t0))
            .await
            .unwrap();
        JobHandle::new("inline".into(), job_id, 1, t0, store, Arc::new(FixedClock::new(t0)))
    }

    #[tokio::test]
    async fn metadata_writes_are_visible_to_reads() {
        let job = handle().await;
        assert_eq!(job.metadata().await.unwrap()["test"], "test");

        job.set_metadata("test", json!("test2")).await.unwrap();
        let metadata = job.metadata().await.unwrap();
        assert_eq!(metadata["test"], "test2");
        assert_eq!(metadata.len(), 1);
    }

    #[tokio::test]
    async fn control_requests_latch_and_delete_wins() {
        let job = handle().await;
        assert_eq!(job.requested_control(), None);

        job.deactivate();
        job.clone().delete();
        job.deactivate();
        assert_eq!(job.requested_control(), Some(ControlRequest::Delete));
    }
}
