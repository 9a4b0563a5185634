use std::sync::Arc;

use tracing::info;

use crate::collaborators::{RemoteApi, RepositoryDirectory, Throttled, TokenDirectory};
use crate::coordination::{cancel_queued, ensure_enqueued, note_rate_limit};
use crate::job::{Job, JobError, NextRun};
use crate::kinds::FetchRepositoryEvents;
use crate::policy::hook_check_delay;
use crate::queue::JobQueue;
use crate::record::{JobRecord, NewJob};

/// Checks whether a repository's webhook is registered.
///
/// With a hook, queued event pollers for the repository are canceled; without
/// one, exactly one poller is kept queued. The check itself repeats forever;
/// a rate-limited check changes nothing and waits at least for the reset.
pub struct CheckRepositoryHook {
    api: Arc<dyn RemoteApi>,
    repositories: Arc<dyn RepositoryDirectory>,
    tokens: Arc<dyn TokenDirectory>,
    poller_priority: i16,
}

impl CheckRepositoryHook {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        repositories: Arc<dyn RepositoryDirectory>,
        tokens: Arc<dyn TokenDirectory>,
    ) -> Self {
        Self {
            api,
            repositories,
            tokens,
            poller_priority: 0,
        }
    }

    /// Priority of the pollers this job enqueues.
    pub fn with_poller_priority(mut self, priority: i16) -> Self {
        self.poller_priority = priority;
        self
    }
}

impl Job for CheckRepositoryHook {
    const QUEUE_NAME: &'static str = "check-repository-hook";

    /// Whether the hook is set.
    type Output = Throttled<bool>;

    fn run(&self, _queue: &dyn JobQueue, record: &JobRecord) -> Result<Self::Output, JobError> {
        Ok(Throttled::from_result(self.api.hook_is_set(&record.identifier))?)
    }

    fn on_success(
        &self,
        queue: &dyn JobQueue,
        record: &mut JobRecord,
        output: &Self::Output,
    ) -> Result<NextRun, JobError> {
        let next_check = hook_check_delay(&mut rand::thread_rng());
        let hook_set = match output {
            Throttled::Ready(hook_set) => hook_set,
            Throttled::RateLimited { reset_in } => {
                record.set_field("rate_limited", true);
                let token = self.api.token();
                let delay = note_rate_limit(queue, self.tokens.as_ref(), token.as_ref(), *reset_in)?;
                return Ok(NextRun::After(next_check.max(delay)));
            }
        };
        let repository = record.identifier.clone();
        self.repositories.set_hook(&repository, *hook_set)?;
        record.set_field("hook_set", *hook_set);

        if *hook_set {
            let canceled = cancel_queued(queue, FetchRepositoryEvents::QUEUE_NAME, &repository)?;
            if canceled > 0 {
                info!(identifier = %repository, canceled, "hook set, event polling stopped");
            }
        } else {
            let poller = NewJob::new(FetchRepositoryEvents::QUEUE_NAME, repository.clone())
                .priority(self.poller_priority);
            if let Some(poller) = ensure_enqueued(queue, poller)? {
                info!(identifier = %repository, job_id = %poller.id, "no hook, event polling started");
            }
        }

        Ok(NextRun::After(next_check))
    }

    fn success_message_addon(&self, _record: &JobRecord, output: &Self::Output) -> String {
        match output {
            Throttled::Ready(true) => "[hook set]".to_string(),
            Throttled::Ready(false) => "[no hook]".to_string(),
            Throttled::RateLimited { .. } => "[rate limited]".to_string(),
        }
    }
}
