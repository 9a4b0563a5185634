use std::collections::BTreeMap;
use std::sync::Arc;

use crate::job::{Job, JobBehavior};

/// Job types known to a process, keyed by queue name.
///
/// Built once at startup and handed to the executor and to the cleanup sweep.
#[derive(Clone, Default)]
pub struct JobRegistry {
    behaviors: BTreeMap<&'static str, Arc<dyn JobBehavior>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type. A second registration for the same queue replaces the first.
    pub fn register<J: Job>(mut self, job: J) -> Self {
        self.behaviors.insert(J::QUEUE_NAME, Arc::new(job));
        self
    }

    pub fn get(&self, queue_name: &str) -> Option<&Arc<dyn JobBehavior>> {
        self.behaviors.get(queue_name)
    }

    pub fn contains(&self, queue_name: &str) -> bool {
        self.behaviors.contains_key(queue_name)
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.behaviors.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("queues", &self.behaviors.keys().collect::<Vec<_>>())
            .finish()
    }
}
