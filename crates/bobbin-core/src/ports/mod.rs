//! Ports: the seams between the engine and the outside world.
//!
//! - `Clock`: 現在時刻（テストでは FixedClock）
//! - `IdGenerator`: ULID ベースの ID 生成
//! - `JobStore`: ジョブ定義・スケジュール状態・実行履歴の正本

pub mod clock;
pub mod id_generator;
pub mod job_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::{DeleteOutcome, JobStore, Lease, ReapedJob};
