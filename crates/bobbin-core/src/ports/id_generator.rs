//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use ulid::Ulid;

use crate::domain::ids::{JobId, LeaseId, RunId};
use crate::ports::Clock;

/// IdGenerator は分散環境で使える ID を生成
///
/// ULID は時刻でソート可能なので、run 履歴を ID 順に並べると実行順になる。
pub trait IdGenerator: Send + Sync {
    fn job_id(&self) -> JobId;

    fn run_id(&self) -> RunId;

    fn lease_id(&self) -> LeaseId;
}

/// Clock の時刻 + 乱数部で ULID を作る。
///
/// FixedClock を渡すと timestamp 部分が決定的になる。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn run_id(&self) -> RunId {
        RunId::from(self.next())
    }

    fn lease_id(&self) -> LeaseId {
        LeaseId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_ids() {
        let ids = UlidGenerator::new(SystemClock);
        assert_ne!(ids.run_id(), ids.run_id());
        assert_ne!(ids.lease_id(), ids.lease_id());
    }

    #[test]
    fn timestamp_part_follows_the_clock() {
        let fixed = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ids = UlidGenerator::new(FixedClock::new(fixed));

        let a = ids.job_id();
        let b = ids.job_id();
        // 乱数部があるので ID 自体は異なる
        assert_ne!(a, b);
        assert_eq!(a.as_ulid().timestamp_ms(), fixed.timestamp_millis() as u64);
        assert_eq!(b.as_ulid().timestamp_ms(), fixed.timestamp_millis() as u64);
    }

    #[test]
    fn prefixes_differ_by_kind() {
        let ids = UlidGenerator::new(SystemClock);
        assert!(ids.job_id().to_string().starts_with("job-"));
        assert!(ids.run_id().to_string().starts_with("run-"));
        assert!(ids.lease_id().to_string().starts_with("lease-"));
    }
}
