//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - 起動時検証（Fail-fast 設計）: 静的ジョブの定義ミスは build() で返す
//! - 静的ジョブの再アタッチ: durable store に既に存在するジョブは状態を保ったまま body だけ戻す

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use super::dispatcher::Dispatcher;
use super::engine::Engine;
use super::executor::Executor;
use crate::config::{ConfigError, EngineConfig, StoreConfig};
use crate::domain::{Decider, DefaultDecider, JobSpec};
use crate::error::BobbinError;
use crate::ports::{Clock, IdGenerator, JobStore, SystemClock, UlidGenerator};
use crate::store::{MemoryJobStore, SqliteJobStore};
use crate::task::{BodyRegistry, TaskBody};

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("static job `{name}`: {source}")]
    StaticJob {
        name: String,
        #[source]
        source: BobbinError,
    },

    #[error("static job `{0}` is declared more than once")]
    DuplicateStaticJob(String),

    #[error(transparent)]
    Store(#[from] BobbinError),
}

/// Wires a store, clock and decider into an [`Engine`] and registers the
/// host's static jobs.
///
/// ```ignore
/// let engine = EngineBuilder::new()
///     .config(EngineConfig::load(path)?)
///     .job(JobSpec::new("health-check", ScheduleSpec::interval(300), 30), health_check)
///     .build()
///     .await?;
/// let runner = engine.start();
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn JobStore>>,
    clock: Option<Arc<dyn Clock>>,
    decider: Option<Arc<dyn Decider>>,
    jobs: Vec<(JobSpec, Arc<dyn TaskBody>)>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            clock: None,
            decider: None,
            jobs: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the store chosen by `config.store`.
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Declares a static job.
    ///
    /// On build it is created if the store does not know it yet; otherwise
    /// the stored job keeps its state and metadata and gets `body` attached.
    pub fn job(mut self, spec: JobSpec, body: impl TaskBody) -> Self {
        self.jobs.push((spec, Arc::new(body)));
        self
    }

    pub async fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        for (spec, _) in &self.jobs {
            if !seen.insert(spec.name.as_str()) {
                return Err(BuildError::DuplicateStaticJob(spec.name.clone()));
            }
        }

        let store = match self.store {
            Some(store) => store,
            None => open_store(&self.config)?,
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider) as Arc<dyn Decider>);
        let bodies = Arc::new(BodyRegistry::new());

        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&bodies),
            Arc::clone(&clock),
            Arc::clone(&ids),
            decider,
            self.config.lease_grace(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&bodies),
            Arc::clone(&clock),
            Arc::clone(&ids),
            executor,
            self.config.max_concurrent_runs,
            self.config.tick_interval(),
        ));
        let engine = Engine::new(
            Arc::clone(&store),
            Arc::clone(&bodies),
            Arc::clone(&clock),
            ids,
            dispatcher,
            self.config,
        );

        for (spec, body) in self.jobs {
            let name = spec.name.clone();
            register_static(&engine, store.as_ref(), clock.as_ref(), &bodies, spec, body)
                .await
                .map_err(|source| BuildError::StaticJob { name, source })?;
        }

        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn open_store(config: &EngineConfig) -> Result<Arc<dyn JobStore>, BobbinError> {
    Ok(match &config.store {
        StoreConfig::Memory => Arc::new(MemoryJobStore::new(config.run_history_limit)),
        StoreConfig::Sqlite { path } => {
            Arc::new(SqliteJobStore::open(path, config.run_history_limit)?)
        }
    })
}

async fn register_static(
    engine: &Engine,
    store: &dyn JobStore,
    clock: &dyn Clock,
    bodies: &BodyRegistry,
    spec: JobSpec,
    body: Arc<dyn TaskBody>,
) -> Result<(), BobbinError> {
    let Some(existing) = store.get(&spec.name).await? else {
        engine.create_job_arc(spec, body).await?;
        return Ok(());
    };

    let name = spec.name.clone();
    let now = clock.now();
    if existing.spec.same_definition(&spec) {
        info!(job = %name, status = existing.status.as_str(), "static job re-attached");
    } else if existing.spec.schedule != spec.schedule {
        // スケジュールが変わったら next_due_at を今から計算し直す
        let next_due_at = spec.validate(now, engine.config().once_grace())?.next_due(now, None);
        store.replace_spec(spec, next_due_at, now).await?;
        info!(job = %name, next_due_at = ?next_due_at, "static job schedule changed");
    } else {
        spec.validate_fields()?;
        store.replace_spec(spec, existing.next_due_at, now).await?;
        info!(job = %name, "static job definition updated");
    }
    bodies.insert(name, existing.job_id, body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatus, RetryPolicy, ScheduleSpec};
    use crate::ports::FixedClock;
    use crate::task::JobHandle;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{Value, json};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn noop() -> impl TaskBody {
        |_job: JobHandle| async move { Ok::<Value, anyhow::Error>(json!(null)) }
    }

    #[tokio::test]
    async fn test_build_registers_static_jobs() {
        let engine = EngineBuilder::new()
            .clock(Arc::new(FixedClock::new(t0())))
            .job(JobSpec::new("health-check", ScheduleSpec::interval(300), 30), noop())
            .build()
            .await
            .unwrap();

        let job = engine.get_job("health-check").await.unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.next_due_at, Some(t0()));
        assert!(engine.has_body("health-check"));
    }

    #[tokio::test]
    async fn test_build_duplicate_static_job() {
        let result = EngineBuilder::new()
            .job(JobSpec::new("a", ScheduleSpec::interval(60), 10), noop())
            .job(JobSpec::new("a", ScheduleSpec::interval(120), 10), noop())
            .build()
            .await;
        assert!(matches!(result, Err(BuildError::DuplicateStaticJob(name)) if name == "a"));
    }

    #[tokio::test]
    async fn test_build_invalid_static_job() {
        let result = EngineBuilder::new()
            .job(JobSpec::new("a", ScheduleSpec::cron("61 * * * *", "UTC"), 10), noop())
            .build()
            .await;
        assert!(matches!(
            result,
            Err(BuildError::StaticJob { name, source: BobbinError::InvalidSchedule(_) }) if name == "a"
        ));
    }

    #[tokio::test]
    async fn test_build_invalid_config() {
        let config = EngineConfig {
            max_concurrent_runs: 0,
            ..EngineConfig::default()
        };
        let result = EngineBuilder::new().config(config).build().await;
        assert!(matches!(result, Err(BuildError::Config(ConfigError::Invalid(_)))));
    }

    #[tokio::test]
    async fn test_rebuild_keeps_state_and_applies_changes() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::default());
        let clock = FixedClock::new(t0());
        let first = EngineBuilder::new()
            .store(Arc::clone(&store))
            .clock(Arc::new(clock.clone()))
            .job(JobSpec::new("a", ScheduleSpec::interval(60), 10), noop())
            .job(JobSpec::new("b", ScheduleSpec::interval(60), 10), noop())
            .build()
            .await
            .unwrap();
        first.deactivate_job("a").await.unwrap();
        drop(first);

        clock.advance(chrono::Duration::minutes(5));
        let second = EngineBuilder::new()
            .store(Arc::clone(&store))
            .clock(Arc::new(clock.clone()))
            // unchanged: keeps its deactivated state
            .job(JobSpec::new("a", ScheduleSpec::interval(60), 10), noop())
            // retry added, same schedule: due time kept
            .job(
                JobSpec::new("b", ScheduleSpec::interval(60), 10)
                    .with_retry(RetryPolicy::new(3, 5)),
                noop(),
            )
            .build()
            .await
            .unwrap();

        let a = second.get_job("a").await.unwrap();
        assert_eq!(a.status, JobStatus::Inactive);
        assert!(second.has_body("a"));

        let b = second.get_job("b").await.unwrap();
        assert_eq!(b.spec.max_attempts(), 3);
        assert_eq!(b.next_due_at, Some(t0()));
        drop(second);

        let third = EngineBuilder::new()
            .store(Arc::clone(&store))
            .clock(Arc::new(clock.clone()))
            .job(JobSpec::new("b", ScheduleSpec::interval(600), 10), noop())
            .build()
            .await
            .unwrap();
        let b = third.get_job("b").await.unwrap();
        assert_eq!(b.next_due_at, Some(t0() + chrono::Duration::minutes(5)));
    }
}
