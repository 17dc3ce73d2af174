//! Dispatcher - スケジューリングループ
//!
//! Each tick:
//! 1. reap claims whose lease expired
//! 2. walk active jobs in due order
//! 3. claim every due, idle job that has a task body, while run slots last
//! 4. spawn one attempt per won claim
//!
//! Several dispatchers (in one process or several, over a shared store) may
//! tick concurrently; the store's claim compare-and-set guarantees a due
//! instant runs once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, warn};

use super::executor::{AttemptReport, Executor};
use crate::domain::Settlement;
use crate::error::BobbinError;
use crate::ports::{Clock, IdGenerator, JobStore};
use crate::task::BodyRegistry;

/// Result of one scheduling pass.
///
/// Dropping a `Tick` does not cancel its attempts; they keep running in the
/// background. `join` waits for them.
#[derive(Debug, Default)]
pub struct Tick {
    /// Jobs whose claim this tick won.
    pub claimed: Vec<String>,
    /// Due jobs skipped because no task body is registered.
    pub skipped: Vec<String>,
    /// Claims released because their lease expired.
    pub reaped: usize,
    /// True if the pass stopped early because every run slot was busy.
    pub saturated: bool,
    attempts: Vec<JoinHandle<Result<AttemptReport, BobbinError>>>,
}

impl Tick {
    /// Waits for every attempt spawned by this tick.
    ///
    /// Store errors and panics inside the executor are logged and left out of
    /// the returned reports.
    pub async fn join(self) -> Vec<AttemptReport> {
        let mut reports = Vec::with_capacity(self.attempts.len());
        for handle in self.attempts {
            match handle.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(err)) => warn!(error = %err, "attempt could not be settled"),
                Err(err) => warn!(error = %err, "attempt task failed"),
            }
        }
        reports
    }
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    bodies: Arc<BodyRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    executor: Arc<Executor>,
    permits: Arc<Semaphore>,
    slots: u32,
    wake: Notify,
    tick_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        bodies: Arc<BodyRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        executor: Arc<Executor>,
        max_concurrent_runs: usize,
        tick_interval: Duration,
    ) -> Self {
        let slots = u32::try_from(max_concurrent_runs).unwrap_or(u32::MAX);
        Self {
            store,
            bodies,
            clock,
            ids,
            executor,
            permits: Arc::new(Semaphore::new(slots as usize)),
            slots,
            wake: Notify::new(),
            tick_interval,
        }
    }

    /// Asks the run loop for an extra pass now instead of at the next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Attempts currently holding a run slot.
    pub fn in_flight(&self) -> usize {
        (self.slots as usize).saturating_sub(self.permits.available_permits())
    }

    /// One scheduling pass.
    pub async fn tick(&self) -> Result<Tick, BobbinError> {
        let now = self.clock.now();
        let mut tick = Tick::default();

        for reaped in self.store.reap_expired(now, self.ids.as_ref()).await? {
            warn!(
                job = %reaped.name,
                abandoned_attempt = ?reaped.abandoned_attempt,
                settlement = ?reaped.settlement,
                next_due_at = ?reaped.settlement.next_due_at(),
                "expired lease reaped"
            );
            if reaped.settlement == Settlement::Deleted {
                self.bodies.remove(&reaped.name, reaped.job_id);
            }
            tick.reaped += 1;
        }

        for job in self.store.list_active().await? {
            // list_active is sorted by due time
            match job.next_due_at {
                Some(due) if due <= now => {}
                _ => break,
            }
            if job.is_in_flight() {
                continue;
            }

            let name = job.spec.name.clone();
            if !self.bodies.contains(&name) {
                warn!(job = %name, "due job has no task body registered, skipping");
                tick.skipped.push(name);
                continue;
            }

            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                debug!("all run slots busy");
                tick.saturated = true;
                break;
            };

            let expires_at = self.executor.lease_expiry(now, job.spec.timeout_secs);
            let Some(lease) = self
                .store
                .claim(&name, self.ids.lease_id(), now, expires_at)
                .await?
            else {
                debug!(job = %name, "claim lost to another dispatcher");
                continue;
            };

            let executor = Arc::clone(&self.executor);
            let span = info_span!("attempt", job = %name, due_at = %lease.due_at);
            tick.attempts.push(tokio::spawn(
                async move {
                    let _permit = permit;
                    executor.execute(lease).await
                }
                .instrument(span),
            ));
            tick.claimed.push(name);
        }

        debug!(
            claimed = tick.claimed.len(),
            skipped = tick.skipped.len(),
            reaped = tick.reaped,
            "tick"
        );
        Ok(tick)
    }

    /// Ticks until `shutdown_rx` flips to true (or its sender is dropped),
    /// then waits for in-flight attempts.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick_interval.as_millis() as u64, "dispatcher started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // 次のループで判定
                    continue;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(err) = self.tick().await {
                warn!(error = %err, "dispatcher tick failed");
            }
        }

        info!(in_flight = self.in_flight(), "dispatcher stopping, waiting for attempts");
        self.drain().await;
        info!("dispatcher stopped");
    }

    /// Resolves once no attempt holds a run slot.
    pub async fn drain(&self) {
        if let Ok(all) = self.permits.acquire_many(self.slots).await {
            drop(all);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultDecider, JobId, JobRecord, JobSpec, ScheduleSpec};
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::store::MemoryJobStore;
    use crate::task::JobHandle;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{Value, json};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn dispatcher(
        store: Arc<MemoryJobStore>,
        bodies: Arc<BodyRegistry>,
        clock: FixedClock,
        slots: usize,
    ) -> Dispatcher {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let executor = Arc::new(Executor::new(
            store.clone(),
            bodies.clone(),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::new(DefaultDecider),
            chrono::Duration::seconds(30),
        ));
        Dispatcher::new(store, bodies, clock, ids, executor, slots, Duration::from_millis(10))
    }

    async fn add(store: &MemoryJobStore, bodies: &BodyRegistry, name: &str, with_body: bool) {
        let spec = JobSpec::new(name, ScheduleSpec::interval(60), 10);
        let job_id = JobId::from_ulid(Ulid::new());
        store
            .create(JobRecord::new(job_id, spec, Some(t0()), t0()))
            .await
            .unwrap();
        if with_body {
            bodies.insert(
                name,
                job_id,
                Arc::new(|_job: JobHandle| async move { Ok::<Value, anyhow::Error>(json!(null)) }),
            );
        }
    }

    #[tokio::test]
    async fn tick_runs_due_jobs_and_skips_bodyless_ones() {
        let store = Arc::new(MemoryJobStore::default());
        let bodies = Arc::new(BodyRegistry::new());
        add(&store, &bodies, "a", true).await;
        add(&store, &bodies, "orphan", false).await;
        let d = dispatcher(store.clone(), bodies, FixedClock::new(t0()), 4);

        let tick = d.tick().await.unwrap();
        assert_eq!(tick.claimed, vec!["a".to_string()]);
        assert_eq!(tick.skipped, vec!["orphan".to_string()]);
        let reports = tick.join().await;
        assert_eq!(reports.len(), 1);

        let job = store.get("a").await.unwrap().unwrap();
        assert_eq!(job.next_due_at, Some(t0() + chrono::Duration::seconds(60)));

        // nothing due until the clock moves
        let tick = d.tick().await.unwrap();
        assert!(tick.claimed.is_empty());
    }

    #[tokio::test]
    async fn run_slots_bound_concurrency() {
        let store = Arc::new(MemoryJobStore::default());
        let bodies = Arc::new(BodyRegistry::new());
        for name in ["a", "b", "c"] {
            add(&store, &bodies, name, true).await;
        }
        let d = dispatcher(store.clone(), bodies, FixedClock::new(t0()), 2);

        let tick = d.tick().await.unwrap();
        assert_eq!(tick.claimed.len(), 2);
        assert!(tick.saturated);
        tick.join().await;

        let tick = d.tick().await.unwrap();
        assert_eq!(tick.claimed, vec!["c".to_string()]);
        tick.join().await;
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let store = Arc::new(MemoryJobStore::default());
        let bodies = Arc::new(BodyRegistry::new());
        add(&store, &bodies, "a", true).await;
        let d = Arc::new(dispatcher(store.clone(), bodies, FixedClock::new(t0()), 4));

        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(Arc::clone(&d).run(rx));
        d.wake();

        // wait until the first attempt has settled
        for _ in 0..200 {
            if !store.runs("a").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        join.await.unwrap();

        assert_eq!(store.runs("a").await.unwrap().len(), 1);
        assert_eq!(d.in_flight(), 0);
    }
}
