//! Task bodies and the handle they receive.
//!
//! A body is the executable part of a job. It is not serializable, so it
//! lives in the in-process [`BodyRegistry`] keyed by job name, while the rest
//! of the job lives in the store.

mod body;
mod handle;
mod registry;

pub use self::body::TaskBody;
pub use self::handle::JobHandle;
pub use self::registry::BodyRegistry;
