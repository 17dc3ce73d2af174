use std::sync::Arc;

use dashmap::DashMap;

use super::TaskBody;
use crate::domain::JobId;

struct Registered {
    job_id: JobId,
    body: Arc<dyn TaskBody>,
}

/// Registry of task bodies (job name -> body of the job holding that name).
///
/// Unlike job records this is never persisted: after a restart, bodies come
/// back only for jobs that are re-declared or re-attached. A job whose body is
/// missing stays in the store but is skipped by the dispatcher.
///
/// Each body remembers the [`JobId`] it was registered for, so dropping the
/// body of a deleted job never takes out the body of a newer job that reused
/// the name in the meantime.
#[derive(Default)]
pub struct BodyRegistry {
    bodies: DashMap<String, Registered>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the body for `name`.
    pub fn insert(&self, name: impl Into<String>, job_id: JobId, body: Arc<dyn TaskBody>) {
        self.bodies.insert(name.into(), Registered { job_id, body });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskBody>> {
        self.bodies.get(name).map(|entry| Arc::clone(&entry.body))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bodies.contains_key(name)
    }

    /// Drops the body of `name` if it still belongs to `job_id`.
    pub fn remove(&self, name: &str, job_id: JobId) -> Option<Arc<dyn TaskBody>> {
        self.bodies
            .remove_if(name, |_, entry| entry.job_id == job_id)
            .map(|(_, entry)| entry.body)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}
