//! App - アプリケーション層
//!
//! ports と domain を組み合わせてエンジンを動かす。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: ワイヤリングと静的ジョブの登録
//! - **Engine**: 管理 API（create / deactivate / delete / list）
//! - **Dispatcher**: tick ごとに due なジョブを claim して実行に回す
//! - **Executor**: 1 attempt を timeout 付きで実行し、結果を store に確定する

pub mod builder;
pub mod dispatcher;
pub mod engine;
pub mod executor;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::dispatcher::{Dispatcher, Tick};
pub use self::engine::{CreatedJob, Engine, EngineRunner, JobRef};
pub use self::executor::{AttemptReport, Executor};
