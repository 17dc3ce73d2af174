//! Job definitions as submitted by callers (tools, webhook handlers, other jobs).
//!
//! The serde shape accepts both snake_case and the camelCase spelling used by
//! host-side job declarations (`executeAt`, `maxAttempts`, `backoffSeconds`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BobbinError;
use crate::schedule::Trigger;

/// Open, task-mutable metadata attached to a job.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Fires exactly once at or after `execute_at`.
    Once {
        #[serde(alias = "executeAt")]
        execute_at: DateTime<Utc>,
    },

    /// Fires every `period_secs`, measured from the previous actual fire.
    Interval {
        #[serde(alias = "seconds", alias = "periodSeconds")]
        period_secs: u64,
    },

    /// Fires at each match of a 5-field cron expression in `timezone`.
    Cron {
        expression: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Saturating conversion for user-supplied second counts.
pub(crate) fn seconds(secs: u64) -> Duration {
    Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}

impl ScheduleSpec {
    pub fn once(execute_at: DateTime<Utc>) -> Self {
        ScheduleSpec::Once { execute_at }
    }

    pub fn interval(period_secs: u64) -> Self {
        ScheduleSpec::Interval { period_secs }
    }

    pub fn cron(expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        ScheduleSpec::Cron {
            expression: expression.into(),
            timezone: timezone.into(),
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, ScheduleSpec::Once { .. })
    }

    /// Short label for logs and listings.
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleSpec::Once { .. } => "once",
            ScheduleSpec::Interval { .. } => "interval",
            ScheduleSpec::Cron { .. } => "cron",
        }
    }
}

/// Fixed-backoff retry policy for failed or timed-out attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per due instant, including the first one.
    #[serde(alias = "maxAttempts")]
    pub max_attempts: u32,

    /// Delay between a failed attempt finishing and the retry becoming due.
    #[serde(default, alias = "backoffSeconds")]
    pub backoff_secs: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_secs: u64) -> Self {
        Self {
            max_attempts,
            backoff_secs,
        }
    }

    pub fn backoff(&self) -> Duration {
        seconds(self.backoff_secs)
    }
}

/// Behaviour when no retry policy is given: a single attempt.
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_secs: 0,
        }
    }
}

/// A job definition minus its task body.
///
/// The body is an opaque callable and lives in the
/// [`BodyRegistry`](crate::task::BodyRegistry); everything here is serializable
/// and is what the job store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique among live jobs, immutable once created.
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub schedule: ScheduleSpec,

    /// Upper bound on a single attempt.
    #[serde(alias = "timeout")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub metadata: Metadata,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, schedule: ScheduleSpec, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schedule,
            timeout_secs,
            retry: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_default()
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_policy().max_attempts
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    /// Checks everything `create` must reject up front.
    ///
    /// `once_grace` is how far in the past a `once` instant may lie and still be
    /// accepted (it then fires immediately).
    pub fn validate(&self, now: DateTime<Utc>, once_grace: Duration) -> Result<Trigger, BobbinError> {
        self.validate_fields()?;
        if let ScheduleSpec::Once { execute_at } = &self.schedule
            && execute_at
                .checked_add_signed(once_grace)
                .is_some_and(|deadline| deadline < now)
        {
            return Err(BobbinError::InvalidSchedule(format!(
                "execute_at {execute_at} is in the past"
            )));
        }
        Trigger::compile(&self.schedule)
    }

    /// Name, timeout and retry checks (everything but the schedule).
    pub fn validate_fields(&self) -> Result<(), BobbinError> {
        if self.name.trim().is_empty() {
            return Err(BobbinError::InvalidName("name must not be empty".to_string()));
        }
        if self.name.trim() != self.name {
            return Err(BobbinError::InvalidName(format!(
                "`{}` has leading or trailing whitespace",
                self.name
            )));
        }
        if self.timeout_secs == 0 {
            return Err(BobbinError::InvalidTimeout(
                "timeout must be at least one second".to_string(),
            ));
        }
        if let Some(retry) = &self.retry
            && retry.max_attempts == 0
        {
            return Err(BobbinError::InvalidRetryPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// True when `other` differs only in metadata.
    pub fn same_definition(&self, other: &JobSpec) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.schedule == other.schedule
            && self.timeout_secs == other.timeout_secs
            && self.retry == other.retry
    }
}
