//! Domain identifiers (strongly-typed IDs).
//!
//! All ids are ULIDs wrapped in a phantom-typed `Id<T>`, so a `JobId` can never
//! be passed where a `RunId` is expected. ULIDs sort by creation time, which
//! keeps run records naturally ordered when listed by id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each id kind.
///
/// Provides the prefix used by `Display` ("job-", "run-", "lease-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// `T` is only a compile-time marker (PhantomData), it costs no memory.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Parses the `Display` form (`job-01H...`); the bare ULID is accepted as well.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

// ========================================
// マーカー型
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

/// Identifier of a job definition (stable for the lifetime of the definition).
pub type JobId = Id<Job>;

/// Identifier of one execution attempt (one `JobRunRecord`).
pub type RunId = Id<Run>;

/// Identifier of a claim held by a dispatcher on one due instant.
pub type LeaseId = Id<Lease>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_with_prefixes() {
        let job = JobId::from_ulid(Ulid::new());
        let run = RunId::from_ulid(Ulid::new());
        let lease = LeaseId::from_ulid(Ulid::new());

        assert!(job.to_string().starts_with("job-"));
        assert!(run.to_string().starts_with("run-"));
        assert!(lease.to_string().starts_with("lease-"));
        // let _: JobId = run; // <- does not compile
    }

    #[test]
    fn display_form_parses_back() {
        let job = JobId::from_ulid(Ulid::new());
        let parsed: JobId = job.to_string().parse().unwrap();
        assert_eq!(parsed, job);

        let bare: JobId = job.as_ulid().to_string().parse().unwrap();
        assert_eq!(bare, job);

        assert!("job-not-a-ulid".parse::<JobId>().is_err());
    }

    #[test]
    fn serializes_as_plain_ulid_string() {
        let ulid = Ulid::new();
        let job = JobId::from_ulid(ulid);
        let json = serde_json::to_string(&job).unwrap();
        assert_eq!(json, format!("\"{ulid}\""));
        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<JobId>(), std::mem::size_of::<Ulid>());
        assert_eq!(std::mem::size_of::<LeaseId>(), 16);
    }
}
