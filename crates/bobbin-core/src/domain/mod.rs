//! Domain model (ids, job specs, records, outcomes, decisions).
//!
//! ここにはストアや実行時に依存しない純粋な型だけを置く。

pub mod decision;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod run;
pub mod spec;
pub mod state;

pub use decision::{Decider, Decision, DefaultDecider};
pub use ids::{JobId, LeaseId, RunId};
pub use job::{Claim, JobFilter, JobRecord, JobSummary, ReleasedClaim, Settlement};
pub use outcome::{OutcomeKind, RunOutcome};
pub use run::JobRunRecord;
pub use spec::{JobSpec, Metadata, RetryPolicy, ScheduleSpec};
pub use state::{ControlRequest, JobPhase, JobStatus};
