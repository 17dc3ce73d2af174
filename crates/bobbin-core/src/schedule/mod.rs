//! Schedule evaluation.
//!
//! A [`ScheduleSpec`] is plain data; [`Trigger`] is its compiled form (parsed
//! cron expression, resolved time zone) and answers one question: given the
//! previous fire time, when is the job next due?
//!
//! None of the three kinds catches up on missed instants. After an outage the
//! job is due once (immediately), and the following instant is computed from
//! that actual fire time.
//!
//! Cron fields match the wall clock of the job's time zone. A wall time that
//! does not exist (skipped by a spring-forward transition) fires at the first
//! valid instant after the gap; a wall time that occurs twice (fall-back)
//! fires once, at its earlier occurrence.

mod cron;

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::domain::ScheduleSpec;
use crate::domain::spec::seconds;
use crate::error::BobbinError;

pub use self::cron::to_cron_crate_syntax;

/// Compiled schedule.
#[derive(Debug, Clone)]
pub enum Trigger {
    Once {
        at: DateTime<Utc>,
    },
    Interval {
        period: Duration,
    },
    Cron {
        schedule: Box<::cron::Schedule>,
        timezone: Tz,
    },
}

impl Trigger {
    /// Parses and validates a schedule. Every `InvalidSchedule` a job can hit
    /// is raised here, at create time.
    pub fn compile(spec: &ScheduleSpec) -> Result<Self, BobbinError> {
        match spec {
            ScheduleSpec::Once { execute_at } => Ok(Trigger::Once { at: *execute_at }),
            ScheduleSpec::Interval { period_secs } => {
                if *period_secs == 0 {
                    return Err(BobbinError::InvalidSchedule(
                        "interval must be at least one second".to_string(),
                    ));
                }
                Ok(Trigger::Interval {
                    period: seconds(*period_secs),
                })
            }
            ScheduleSpec::Cron {
                expression,
                timezone,
            } => {
                let timezone = Tz::from_str(timezone).map_err(|_| {
                    BobbinError::InvalidSchedule(format!("unknown time zone `{timezone}`"))
                })?;
                let translated = to_cron_crate_syntax(expression)?;
                let schedule = ::cron::Schedule::from_str(&translated).map_err(|e| {
                    BobbinError::InvalidSchedule(format!("bad cron expression `{expression}`: {e}"))
                })?;
                Ok(Trigger::Cron {
                    schedule: Box::new(schedule),
                    timezone,
                })
            }
        }
    }

    /// Next due instant.
    ///
    /// - `reference`: "now" for a job that has never fired
    /// - `last_fired`: first-attempt start of the last resolved due instant
    ///
    /// Returns `None` when the schedule is exhausted (a `once` job that fired).
    pub fn next_due(
        &self,
        reference: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once { at } => last_fired.is_none().then_some(*at),
            Trigger::Interval { period } => match last_fired {
                Some(last) => Some(last.checked_add_signed(*period).unwrap_or(DateTime::<Utc>::MAX_UTC)),
                // 作成直後に一度実行する
                None => Some(reference),
            },
            Trigger::Cron { schedule, timezone } => {
                let anchor = last_fired.unwrap_or(reference);
                let native = schedule
                    .after(&anchor.with_timezone(timezone))
                    .next()
                    .map(|local| local.with_timezone(&Utc));
                native
                    .into_iter()
                    .chain(next_wall_clock_fire(schedule, *timezone, anchor))
                    .min()
            }
        }
    }
}

// 1 時間の重複（fall-back）を毎分スケジュールで跨いでも足りる数
const WALL_CLOCK_SCAN_LIMIT: usize = 256;
// 最長のギャップは日付変更線の移動による丸 1 日
const GAP_SCAN_LIMIT_MINUTES: i64 = 25 * 60;

/// Matches the cron fields against naive wall-clock times and maps each hit
/// back to an instant strictly after `anchor`.
fn next_wall_clock_fire(
    schedule: &::cron::Schedule,
    timezone: Tz,
    anchor: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // wall time carried in a UTC value so the cron iterator applies no offset
    let wall_anchor = anchor.with_timezone(&timezone).naive_local().and_utc();
    schedule
        .after(&wall_anchor)
        .take(WALL_CLOCK_SCAN_LIMIT)
        .filter_map(|wall| resolve_wall_time(timezone, wall.naive_utc()))
        .find(|instant| *instant > anchor)
}

fn resolve_wall_time(timezone: Tz, wall: NaiveDateTime) -> Option<DateTime<Utc>> {
    if let Some(local) = timezone.from_local_datetime(&wall).earliest() {
        return Some(local.with_timezone(&Utc));
    }
    // gap: first wall minute that exists again
    (1..=GAP_SCAN_LIMIT_MINUTES).find_map(|minutes| {
        let shifted = wall.checked_add_signed(Duration::minutes(minutes))?;
        timezone
            .from_local_datetime(&shifted)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    })
}

/// Convenience wrapper around [`Trigger::compile`] + [`Trigger::next_due`].
pub fn next_due(
    spec: &ScheduleSpec,
    reference: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>, BobbinError> {
    Ok(Trigger::compile(spec)?.next_due(reference, last_fired))
}
