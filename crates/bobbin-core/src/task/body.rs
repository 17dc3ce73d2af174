use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use super::JobHandle;

/// The work a job performs on each attempt.
///
/// Returning `Err` (or panicking) marks the attempt as failed; the error's
/// display form, including its context chain, becomes the run's error text.
/// The `Ok` value is stored as the run's result.
///
/// Async closures taking a [`JobHandle`] implement this directly:
///
/// ```ignore
/// engine.create_job(spec, |job: JobHandle| async move {
///     job.update_metadata(patch).await?;
///     Ok(serde_json::json!({ "ok": true }))
/// }).await?;
/// ```
#[async_trait]
pub trait TaskBody: Send + Sync + 'static {
    async fn run(&self, job: JobHandle) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> TaskBody for F
where
    F: Fn(JobHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, job: JobHandle) -> anyhow::Result<Value> {
        (self)(job).await
    }
}
