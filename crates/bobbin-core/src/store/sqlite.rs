//! SQLite-backed job store.
//!
//! Jobs are stored as one JSON document per name, with the columns the engine
//! filters on (`status`, `next_due_at`) pulled out next to it. Every mutation
//! runs in a `BEGIN IMMEDIATE` transaction: load, apply the `JobRecord`
//! transition, write back. Several processes opening the same file therefore
//! serialize on SQLite's write lock, and only one of them can win a claim.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::domain::{
    ControlRequest, Decision, JobFilter, JobId, JobRecord, JobRunRecord, JobSpec, LeaseId,
    Metadata, Settlement,
};
use crate::error::BobbinError;
use crate::ports::{DeleteOutcome, IdGenerator, JobStore, Lease, ReapedJob};
use crate::schedule::Trigger;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;

    CREATE TABLE IF NOT EXISTS jobs (
        name        TEXT PRIMARY KEY,
        job_id      TEXT NOT NULL UNIQUE,
        status      TEXT NOT NULL,
        next_due_at TEXT,
        record      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, next_due_at);

    CREATE TABLE IF NOT EXISTS job_runs (
        seq     INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id  TEXT NOT NULL,
        name    TEXT NOT NULL,
        job_id  TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        record  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_job_runs_name ON job_runs(name, seq);
";

/// Persistent store for jobs and run history.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    history_limit: usize,
}

impl SqliteJobStore {
    /// Open or create a store at `path`.
    pub fn open(path: &Path, history_limit: usize) -> Result<Self, BobbinError> {
        let conn = Connection::open(path)?;
        Self::init(conn, history_limit)
    }

    /// Private in-memory database (not shareable across processes).
    pub fn open_in_memory(history_limit: usize) -> Result<Self, BobbinError> {
        Self::init(Connection::open_in_memory()?, history_limit)
    }

    fn init(conn: Connection, history_limit: usize) -> Result<Self, BobbinError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            history_limit,
        })
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, BobbinError>,
    ) -> Result<T, BobbinError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, BobbinError>,
    ) -> Result<T, BobbinError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Load-modify-store on one job inside a write transaction.
    fn update<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut JobRecord) -> Result<T, BobbinError>,
    ) -> Result<T, BobbinError> {
        self.write(|tx| {
            let mut job = load(tx, name)?.ok_or_else(|| BobbinError::NotFound(name.to_string()))?;
            let out = f(&mut job)?;
            save(tx, &job)?;
            Ok(out)
        })
    }

    fn append_run(&self, tx: &Connection, run: &JobRunRecord) -> Result<(), BobbinError> {
        tx.execute(
            "INSERT INTO job_runs (run_id, name, job_id, attempt, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.run_id.to_string(),
                run.job_name,
                run.job_id.to_string(),
                run.attempt,
                serde_json::to_string(run)?,
            ],
        )?;
        if self.history_limit > 0 {
            tx.execute(
                "DELETE FROM job_runs
                 WHERE name = ?1
                   AND seq NOT IN (
                       SELECT seq FROM job_runs WHERE name = ?1 ORDER BY seq DESC LIMIT ?2
                   )",
                params![run.job_name, i64::try_from(self.history_limit).unwrap_or(i64::MAX)],
            )?;
        }
        Ok(())
    }
}

fn decode(raw: &str) -> Result<JobRecord, BobbinError> {
    Ok(serde_json::from_str(raw)?)
}

fn load(conn: &Connection, name: &str) -> Result<Option<JobRecord>, BobbinError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT record FROM jobs WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(decode).transpose()
}

fn load_where(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<JobRecord>, BobbinError> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(args, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    raws.iter().map(|raw| decode(raw)).collect()
}

fn save(conn: &Connection, job: &JobRecord) -> Result<(), BobbinError> {
    conn.execute(
        "INSERT INTO jobs (name, job_id, status, next_due_at, record)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(name) DO UPDATE SET
             job_id = excluded.job_id,
             status = excluded.status,
             next_due_at = excluded.next_due_at,
             record = excluded.record",
        params![
            job.spec.name,
            job.job_id.to_string(),
            job.status.as_str(),
            job.next_due_at.map(|t| t.to_rfc3339()),
            serde_json::to_string(job)?,
        ],
    )?;
    Ok(())
}

fn remove(conn: &Connection, name: &str) -> Result<(), BobbinError> {
    conn.execute("DELETE FROM jobs WHERE name = ?1", params![name])?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: JobRecord) -> Result<(), BobbinError> {
        self.write(|tx| {
            if load(tx, &job.spec.name)?.is_some() {
                return Err(BobbinError::DuplicateName(job.spec.name.clone()));
            }
            save(tx, &job)
        })
    }

    async fn get(&self, name: &str) -> Result<Option<JobRecord>, BobbinError> {
        self.read(|conn| load(conn, name))
    }

    async fn get_by_id(&self, job_id: JobId) -> Result<Option<JobRecord>, BobbinError> {
        self.read(|conn| {
            let mut jobs = load_where(
                conn,
                "SELECT record FROM jobs WHERE job_id = ?1",
                &[&job_id.to_string()],
            )?;
            Ok(jobs.pop())
        })
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, BobbinError> {
        self.read(|conn| {
            let jobs = load_where(conn, "SELECT record FROM jobs ORDER BY name", &[])?;
            Ok(jobs.into_iter().filter(|job| filter.matches(job)).collect())
        })
    }

    async fn list_active(&self) -> Result<Vec<JobRecord>, BobbinError> {
        self.read(|conn| {
            let mut jobs = load_where(
                conn,
                "SELECT record FROM jobs WHERE status = 'active'",
                &[],
            )?;
            jobs.sort_by(JobRecord::due_order);
            Ok(jobs)
        })
    }

    async fn update_metadata(
        &self,
        name: &str,
        patch: Metadata,
        now: DateTime<Utc>,
    ) -> Result<Metadata, BobbinError> {
        self.update(name, |job| Ok(job.merge_metadata(patch, now).clone()))
    }

    async fn deactivate(&self, name: &str, now: DateTime<Utc>) -> Result<(), BobbinError> {
        self.update(name, |job| {
            job.deactivate(now);
            Ok(())
        })
    }

    async fn activate(&self, name: &str, now: DateTime<Utc>) -> Result<JobRecord, BobbinError> {
        self.update(name, |job| {
            let next_due_at = Trigger::compile(&job.spec.schedule)?.next_due(now, None);
            job.activate(next_due_at, now)?;
            Ok(job.clone())
        })
    }

    async fn delete(&self, name: &str, now: DateTime<Utc>) -> Result<DeleteOutcome, BobbinError> {
        self.write(|tx| {
            let mut job = load(tx, name)?.ok_or_else(|| BobbinError::NotFound(name.to_string()))?;
            if job.request_delete(now) {
                remove(tx, name)?;
                Ok(DeleteOutcome::Removed(job.job_id))
            } else {
                save(tx, &job)?;
                Ok(DeleteOutcome::Latched)
            }
        })
    }

    async fn replace_spec(
        &self,
        spec: JobSpec,
        next_due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), BobbinError> {
        let name = spec.name.clone();
        self.update(&name, |job| {
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
        self.write(|tx| {
            let Some(mut job) = load(tx, name)? else {
                return Ok(None);
            };
            if !job.claim(lease_id, now, expires_at) {
                return Ok(None);
            }
            save(tx, &job)?;
            Ok(job.claim.map(|claim| Lease {
                lease_id,
                job_id: job.job_id,
                name: name.to_string(),
                due_at: claim.due_at,
                timeout_secs: job.spec.timeout_secs,
            }))
        })
    }

    async fn start_attempt(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<JobRecord, BobbinError> {
        self.write(|tx| {
            let mut job = load(tx, &lease.name)?.ok_or_else(|| BobbinError::LeaseLost {
                name: lease.name.clone(),
                lease: lease.lease_id,
            })?;
            job.start_attempt(lease.lease_id, now, expires_at)?;
            save(tx, &job)?;
            Ok(job)
        })
    }

    async fn finish(
        &self,
        lease: &Lease,
        mut run: JobRunRecord,
        decision: &Decision,
        control: Option<ControlRequest>,
        now: DateTime<Utc>,
    ) -> Result<Settlement, BobbinError> {
        self.write(|tx| {
            let mut job = load(tx, &lease.name)?.ok_or_else(|| BobbinError::LeaseLost {
                name: lease.name.clone(),
                lease: lease.lease_id,
            })?;
            let settlement =
                job.settle(lease.lease_id, decision, control, run.outcome.kind(), now)?;
            if settlement == Settlement::Deleted {
                remove(tx, &lease.name)?;
            } else {
                save(tx, &job)?;
            }
            run.retry_scheduled = settlement.retry_scheduled();
            self.append_run(tx, &run)?;
            Ok(settlement)
        })
    }

    async fn runs(&self, name: &str) -> Result<Vec<JobRunRecord>, BobbinError> {
        self.read(|conn| {
            // 現在の持ち主（削除済みなら最後の持ち主）の履歴だけ返す
            let mut stmt = conn.prepare(
                "SELECT record FROM job_runs
                 WHERE name = ?1
                   AND job_id = COALESCE(
                       (SELECT job_id FROM jobs WHERE name = ?1),
                       (SELECT job_id FROM job_runs WHERE name = ?1 ORDER BY seq DESC LIMIT 1)
                   )
                 ORDER BY seq",
            )?;
            let raws = stmt
                .query_map(params![name], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            raws.iter()
                .map(|raw| serde_json::from_str(raw).map_err(BobbinError::from))
                .collect()
        })
    }

    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        ids: &dyn IdGenerator,
    ) -> Result<Vec<ReapedJob>, BobbinError> {
        self.write(|tx| {
            let mut reaped = Vec::new();
            for mut job in load_where(tx, "SELECT record FROM jobs", &[])? {
                let Some(released) = job.release_expired(now, || ids.run_id()) else {
                    continue;
                };
                if released.settlement == Settlement::Deleted {
                    remove(tx, job.name())?;
                } else {
                    save(tx, &job)?;
                }
                if let Some(run) = &released.abandoned_run {
                    self.append_run(tx, run)?;
                }
                reaped.push(ReapedJob {
                    name: job.spec.name,
                    job_id: job.job_id,
                    settlement: released.settlement,
                    abandoned_attempt: released.abandoned_run.map(|run| run.attempt),
                });
            }
            Ok(reaped)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatus, OutcomeKind, RetryPolicy, RunId, RunOutcome, ScheduleSpec};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn job(name: &str) -> JobRecord {
        let spec = JobSpec::new(name, ScheduleSpec::interval(60), 10);
        JobRecord::new(JobId::from_ulid(Ulid::new()), spec, Some(t0()), t0())
    }

    fn lease_id() -> LeaseId {
        LeaseId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        {
            let store = SqliteJobStore::open(&path, 10).unwrap();
            store.create(job("health-check")).await.unwrap();
            let mut patch = Metadata::new();
            patch.insert("lastRun".into(), json!("ok"));
            store.update_metadata("health-check", patch, t0()).await.unwrap();
        }

        let store = SqliteJobStore::open(&path, 10).unwrap();
        let job = store.get("health-check").await.unwrap().unwrap();
        assert_eq!(job.spec.metadata["lastRun"], "ok");
        assert_eq!(job.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn two_connections_cannot_both_claim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let a = SqliteJobStore::open(&path, 10).unwrap();
        let b = SqliteJobStore::open(&path, 10).unwrap();
        a.create(job("j")).await.unwrap();

        let first = a.claim("j", lease_id(), t0(), t0() + Duration::minutes(1)).await.unwrap();
        let second = b.claim("j", lease_id(), t0(), t0() + Duration::minutes(1)).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn finish_writes_history_and_deletes_latched_jobs() {
        let store = SqliteJobStore::open_in_memory(10).unwrap();
        store.create(job("inline")).await.unwrap();
        let lease = store
            .claim("inline", lease_id(), t0(), t0() + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        store.start_attempt(&lease, t0(), t0() + Duration::minutes(1)).await.unwrap();

        let run = JobRunRecord {
            run_id: RunId::from_ulid(Ulid::new()),
            job_id: lease.job_id,
            job_name: lease.name.clone(),
            due_at: lease.due_at,
            attempt: 1,
            started_at: t0(),
            finished_at: t0() + Duration::seconds(1),
            outcome: RunOutcome::success(json!({"ok": true})),
            retry_scheduled: false,
        };
        let settlement = store
            .finish(
                &lease,
                run,
                &Decision::Advance {
                    next_due_at: Some(t0() + Duration::seconds(60)),
                    reason: "succeeded".into(),
                },
                Some(ControlRequest::Delete),
                t0(),
            )
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Deleted);
        assert!(store.get("inline").await.unwrap().is_none());
        let runs = store.runs("inline").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::success(json!({"ok": true})));
    }

    #[tokio::test]
    async fn duplicate_and_missing_names() {
        let store = SqliteJobStore::open_in_memory(10).unwrap();
        store.create(job("a")).await.unwrap();
        assert!(matches!(
            store.create(job("a")).await,
            Err(BobbinError::DuplicateName(_))
        ));
        assert!(store.deactivate("missing", t0()).await.unwrap_err().is_not_found());
        assert!(matches!(store.delete("a", t0()).await.unwrap(), DeleteOutcome::Removed(_)));
        assert!(store.get("a").await.unwrap().is_none());
    }

    fn ids() -> UlidGenerator<FixedClock> {
        UlidGenerator::new(FixedClock::new(t0()))
    }

    #[tokio::test]
    async fn reap_releases_expired_claims() {
        let store = SqliteJobStore::open_in_memory(10).unwrap();
        store.create(job("a")).await.unwrap();
        store
            .claim("a", lease_id(), t0(), t0() + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        let later = t0() + Duration::minutes(1);
        let reaped = store.reap_expired(later, &ids()).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].abandoned_attempt, None);
        assert!(store.get("a").await.unwrap().unwrap().is_due(later));
        assert!(store.runs("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reaped_running_attempt_is_recorded_and_backs_off() {
        let store = SqliteJobStore::open_in_memory(10).unwrap();
        let spec = JobSpec::new("a", ScheduleSpec::interval(60), 10)
            .with_retry(RetryPolicy::new(3, 300));
        store
            .create(JobRecord::new(JobId::from_ulid(Ulid::new()), spec, Some(t0()), t0()))
            .await
            .unwrap();
        let expires = t0() + Duration::seconds(40);
        let lease = store.claim("a", lease_id(), t0(), expires).await.unwrap().unwrap();
        store.start_attempt(&lease, t0(), expires).await.unwrap();

        let reaped_at = t0() + Duration::seconds(41);
        let reaped = store.reap_expired(reaped_at, &ids()).await.unwrap();
        let retry_at = t0() + Duration::seconds(341);
        assert_eq!(reaped[0].settlement, Settlement::RetryScheduled { at: retry_at });

        let job = store.get("a").await.unwrap().unwrap();
        assert_eq!(job.next_due_at, Some(retry_at));
        assert_eq!(job.last_outcome, Some(OutcomeKind::Timeout));

        let runs = store.runs("a").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].attempt, 1);
        assert_eq!(runs[0].outcome, RunOutcome::timeout(10));
        assert!(runs[0].retry_scheduled);
    }

    #[tokio::test]
    async fn recreated_name_starts_with_empty_history() {
        let store = SqliteJobStore::open_in_memory(10).unwrap();
        store.create(job("inline")).await.unwrap();
        let lease = store
            .claim("inline", lease_id(), t0(), t0() + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        store.start_attempt(&lease, t0(), t0() + Duration::minutes(1)).await.unwrap();
        store
            .reap_expired(t0() + Duration::minutes(2), &ids())
            .await
            .unwrap();
        store.delete("inline", t0()).await.unwrap();
        assert_eq!(store.runs("inline").await.unwrap().len(), 1);

        let replacement = job("inline");
        let replacement_id = replacement.job_id;
        store.create(replacement).await.unwrap();
        assert!(store.runs("inline").await.unwrap().is_empty());

        let lease = store
            .claim("inline", lease_id(), t0(), t0() + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        store.start_attempt(&lease, t0(), t0() + Duration::minutes(1)).await.unwrap();
        store
            .reap_expired(t0() + Duration::minutes(2), &ids())
            .await
            .unwrap();
        let runs = store.runs("inline").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, replacement_id);
    }
}
