//! Job store implementations.

mod memory;
mod sqlite;

pub use self::memory::MemoryJobStore;
pub use self::sqlite::SqliteJobStore;
