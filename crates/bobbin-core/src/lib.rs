//! bobbin-core
//!
//! Job scheduling and execution engine: jobs with `once`, `interval` or `cron`
//! schedules run under a timeout with bounded retries, and a running job can
//! edit its own metadata or deactivate / delete itself.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, spec, job record, outcome, decision, state）
//! - **schedule**: 次回実行時刻の計算（純粋関数）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, JobStore）
//! - **store**: JobStore 実装（in-memory / SQLite）
//! - **task**: TaskBody と実行中ジョブに渡す JobHandle
//! - **app**: Engine, Dispatcher, Executor, EngineBuilder
//! - **config**: TOML 設定
//! - **error**: エラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod schedule;
pub mod store;
pub mod task;

pub use crate::app::{BuildError, CreatedJob, Engine, EngineBuilder, EngineRunner, JobRef};
pub use crate::config::EngineConfig;
pub use crate::domain::{JobFilter, JobSpec, Metadata, RetryPolicy, ScheduleSpec};
pub use crate::error::BobbinError;
pub use crate::task::{JobHandle, TaskBody};
