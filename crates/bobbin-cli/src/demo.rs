//! Built-in demo jobs.
//!
//! The bodies stand in for the host's real jobs: they log, touch their own
//! metadata and return a small JSON result.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bobbin_core::{
    BobbinError, Engine, EngineBuilder, JobHandle, JobSpec, Metadata, RetryPolicy, ScheduleSpec,
    TaskBody,
};
use serde::Deserialize;
use serde_json::{Value, json};

/// 定期ヘルスチェック（5 分ごと）
struct HealthCheck {
    checks: AtomicU64,
}

#[async_trait]
impl TaskBody for HealthCheck {
    async fn run(&self, job: JobHandle) -> anyhow::Result<Value> {
        let n = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        let checked_at = chrono::Utc::now().to_rfc3339();
        job.set_metadata("last_checked_at", json!(checked_at)).await?;
        tracing::info!(job = job.name(), checks = n, "health check ok");
        Ok(json!({ "status": "healthy", "checks": n }))
    }
}

#[derive(Debug, Deserialize)]
struct CleanupSettings {
    #[serde(default = "default_retention_days")]
    retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

async fn daily_cleanup(job: JobHandle) -> anyhow::Result<Value> {
    let settings: CleanupSettings = serde_json::from_value(Value::Object(job.metadata().await?))?;
    tracing::info!(
        job = job.name(),
        attempt = job.attempt(),
        retention_days = settings.retention_days,
        "running daily cleanup"
    );
    Ok(json!({ "retention_days": settings.retention_days, "removed": 0 }))
}

async fn process_basket_reminders(job: JobHandle) -> anyhow::Result<Value> {
    tracing::info!(job = job.name(), due_at = %job.due_at(), "checking abandoned baskets");
    Ok(json!({ "reminders_sent": 0 }))
}

/// Declares the static jobs on `builder`.
pub fn register(builder: EngineBuilder) -> EngineBuilder {
    let mut cleanup = Metadata::new();
    cleanup.insert("retention_days".into(), json!(30));

    builder
        .job(
            JobSpec::new("health-check", ScheduleSpec::interval(300), 30)
                .with_description("Periodic health check"),
            HealthCheck {
                checks: AtomicU64::new(0),
            },
        )
        .job(
            JobSpec::new(
                "daily-cleanup",
                ScheduleSpec::cron("0 2 * * *", "America/New_York"),
                600,
            )
            .with_description("Daily cleanup at 2 AM")
            .with_retry(RetryPolicy::new(3, 60))
            .with_metadata(cleanup),
            daily_cleanup,
        )
        .job(
            JobSpec::new("process-basket-reminders", ScheduleSpec::interval(900), 120)
                .with_description("Remind users about abandoned baskets"),
            process_basket_reminders,
        )
}

async fn inline_test(job: JobHandle) -> anyhow::Result<Value> {
    let updated = job.set_metadata("test", json!("test2")).await?;
    tracing::info!(job = job.name(), metadata = ?updated, "inline job ran");
    job.delete();
    Ok(json!({ "deleted": true }))
}

/// A job added at runtime: fires once, rewrites its metadata and removes
/// itself. With a durable store it may still be pending from an earlier run,
/// in which case only its body is attached.
pub async fn add_inline_job(engine: &Engine) -> anyhow::Result<()> {
    let mut metadata = Metadata::new();
    metadata.insert("test".into(), json!("test"));
    let execute_at = chrono::Utc::now() + chrono::Duration::seconds(5);
    let spec = JobSpec::new("inline-test", ScheduleSpec::once(execute_at), 30)
        .with_description("Runs once, then deletes itself")
        .with_metadata(metadata);

    match engine.create_job(spec, inline_test).await {
        Ok(created) => {
            tracing::info!(
                job = %created.name,
                job_id = %created.job_id,
                %execute_at,
                "inline job scheduled"
            );
        }
        Err(BobbinError::DuplicateName(name)) => {
            engine.attach_body(&name, inline_test).await?;
            tracing::info!(job = %name, "inline job still pending, body re-attached");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}
