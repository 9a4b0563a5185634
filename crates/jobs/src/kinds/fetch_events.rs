use std::sync::Arc;

use tracing::debug;

use crate::collaborators::{EventsPage, RemoteApi, RepositoryDirectory, Throttled, TokenDirectory};
use crate::coordination::note_rate_limit;
use crate::job::{Job, JobError, NextRun};
use crate::policy::events_poll_delay;
use crate::queue::JobQueue;
use crate::record::JobRecord;

/// Polls the events of a repository that has no webhook.
///
/// Runs only while the repository has subscribers and no hook; otherwise the
/// record is canceled and the polling chain stops until
/// [`CheckRepositoryHook`](super::CheckRepositoryHook) restarts it. A rate
/// limited poll keeps the chain alive and retries once the limit resets.
pub struct FetchRepositoryEvents {
    api: Arc<dyn RemoteApi>,
    repositories: Arc<dyn RepositoryDirectory>,
    tokens: Arc<dyn TokenDirectory>,
}

impl FetchRepositoryEvents {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        repositories: Arc<dyn RepositoryDirectory>,
        tokens: Arc<dyn TokenDirectory>,
    ) -> Self {
        Self {
            api,
            repositories,
            tokens,
        }
    }
}

impl Job for FetchRepositoryEvents {
    const QUEUE_NAME: &'static str = "fetch-repository-events";

    /// `None` when the job should not have run.
    type Output = Option<Throttled<EventsPage>>;

    fn run(&self, _queue: &dyn JobQueue, record: &JobRecord) -> Result<Self::Output, JobError> {
        let repository = &record.identifier;
        if self.repositories.hook_set(repository)? {
            debug!(identifier = %repository, "hook set, polling no longer needed");
            return Ok(None);
        }
        if !self.repositories.has_subscriptions(repository)? {
            debug!(identifier = %repository, "no subscriptions left");
            return Ok(None);
        }
        Ok(Some(Throttled::from_result(self.api.fetch_events(repository))?))
    }

    fn on_success(
        &self,
        queue: &dyn JobQueue,
        record: &mut JobRecord,
        output: &Self::Output,
    ) -> Result<NextRun, JobError> {
        match output {
            None => Ok(NextRun::Cancel),
            Some(Throttled::Ready(page)) => {
                record.set_field("updated_count", page.updated_count);
                Ok(NextRun::After(events_poll_delay(
                    page.suggested_delay,
                    &mut rand::thread_rng(),
                )))
            }
            Some(Throttled::RateLimited { reset_in }) => {
                record.set_field("rate_limited", true);
                let token = self.api.token();
                let delay = note_rate_limit(queue, self.tokens.as_ref(), token.as_ref(), *reset_in)?;
                Ok(NextRun::After(delay))
            }
        }
    }

    fn success_message_addon(&self, _record: &JobRecord, output: &Self::Output) -> String {
        match output {
            Some(Throttled::Ready(page)) => format!("[updated={}]", page.updated_count),
            Some(Throttled::RateLimited { .. }) => "[rate limited]".to_string(),
            None => "[not needed]".to_string(),
        }
    }
}
