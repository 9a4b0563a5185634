//! Integration tests for the recurring job protocol.
//!
//! Tests: Registry → Executor → Job behavior → Queue / Error log → Cleanup
//!
//! Verifies:
//! - Each job type reschedules itself with its own delay rule
//! - The hook checker switches repositories between polling and webhook
//! - Canceled records never run, and running ones are never canceled
//! - Rate limits reschedule instead of failing, and hand the token to a reset job
//! - The cleanup sweep never deletes planned work

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use proptest::prelude::*;

    use hubjobs_core::{Identifier, JobId, Username};
    use hubjobs_jobs::coordination::cancel_queued;
    use hubjobs_jobs::kinds::{CheckRepositoryHook, FetchRepositoryEvents, ResetTokenFlags};
    use hubjobs_jobs::{
        ApiError, EventsPage, Job, JobQueue, JobRecord, JobRegistry, JobStatus, NewJob, QueueError,
        QueueIndex, QueueKey, RemoteApi, RepositoryDirectory, TokenDirectory,
    };

    use crate::cleanup::{CleanupOptions, clean_all, clean_error_log, clean_queue};
    use crate::directory::{InMemoryRepositoryDirectory, InMemoryTokenDirectory};
    use crate::jobs::{
        ErrorEntry, ErrorLogStore, InMemoryErrorLog, InMemoryJobQueue, JobExecutor, Outcome,
    };

    const POLLER: &str = FetchRepositoryEvents::QUEUE_NAME;
    const CHECKER: &str = CheckRepositoryHook::QUEUE_NAME;
    const TOKENS: &str = ResetTokenFlags::QUEUE_NAME;
    const TOKEN: &str = "bot";

    /// Scripted GitHub: per-repository hook flag, a fixed events page and call counters.
    #[derive(Default)]
    struct FakeGithub {
        hooks: Mutex<HashMap<Identifier, bool>>,
        page: Mutex<Option<EventsPage>>,
        failing: Mutex<bool>,
        /// `Some(reset_in)` while the token is out of quota.
        limited: Mutex<Option<Option<u64>>>,
        fetches: AtomicUsize,
        hook_checks: AtomicUsize,
    }

    impl FakeGithub {
        fn set_hook(&self, repository: &str, set: bool) {
            self.hooks
                .lock()
                .unwrap()
                .insert(Identifier::from(repository), set);
        }

        fn suggest(&self, updated_count: u64, suggested_delay: Option<u64>) {
            *self.page.lock().unwrap() = Some(EventsPage {
                updated_count,
                suggested_delay,
            });
        }

        fn fail(&self) {
            *self.failing.lock().unwrap() = true;
        }

        fn exhaust_quota(&self, reset_in: Option<u64>) {
            *self.limited.lock().unwrap() = Some(reset_in);
        }

        fn check(&self) -> Result<(), ApiError> {
            if let Some(reset_in) = *self.limited.lock().unwrap() {
                return Err(ApiError::RateLimited { reset_in });
            }
            if *self.failing.lock().unwrap() {
                return Err(ApiError::Unavailable("github is down".to_string()));
            }
            Ok(())
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl RemoteApi for FakeGithub {
        fn fetch_events(&self, _repository: &Identifier) -> Result<EventsPage, ApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            Ok(self.page.lock().unwrap().unwrap_or(EventsPage {
                updated_count: 0,
                suggested_delay: None,
            }))
        }

        fn hook_is_set(&self, repository: &Identifier) -> Result<bool, ApiError> {
            self.hook_checks.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            Ok(self
                .hooks
                .lock()
                .unwrap()
                .get(repository)
                .copied()
                .unwrap_or(false))
        }

        fn token(&self) -> Option<Identifier> {
            Some(Identifier::from(TOKEN))
        }
    }

    /// A queue where another worker claims the next record right after every lookup.
    struct ClaimAfterFind(Arc<InMemoryJobQueue>);

    impl JobQueue for ClaimAfterFind {
        fn enqueue(&self, job: NewJob) -> Result<JobRecord, QueueError> {
            self.0.enqueue(job)
        }

        fn enqueue_unique(&self, job: NewJob) -> Result<Option<JobRecord>, QueueError> {
            self.0.enqueue_unique(job)
        }

        fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
            self.0.get(id)
        }

        fn update(&self, record: &JobRecord) -> Result<(), QueueError> {
            self.0.update(record)
        }

        fn cancel_if_queued(&self, id: JobId) -> Result<bool, QueueError> {
            self.0.cancel_if_queued(id)
        }

        fn find(
            &self,
            queue_name: &str,
            identifier: &Identifier,
            statuses: &[JobStatus],
        ) -> Result<Vec<JobRecord>, QueueError> {
            let found = self.0.find(queue_name, identifier, statuses)?;
            self.0.claim_next(&[queue_name.to_string()], Utc::now())?;
            Ok(found)
        }

        fn members(&self, key: &QueueKey, index: QueueIndex) -> Result<Vec<JobId>, QueueError> {
            self.0.members(key, index)
        }

        fn claim_next(
            &self,
            queue_names: &[String],
            now: DateTime<Utc>,
        ) -> Result<Option<JobRecord>, QueueError> {
            self.0.claim_next(queue_names, now)
        }

        fn queue_keys(&self, queue_name: &str) -> Result<Vec<QueueKey>, QueueError> {
            self.0.queue_keys(queue_name)
        }

        fn queue_names(&self) -> Result<Vec<String>, QueueError> {
            self.0.queue_names()
        }

        fn records_page(
            &self,
            queue_name: &str,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<JobRecord>, QueueError> {
            self.0.records_page(queue_name, offset, limit)
        }

        fn delete(&self, id: JobId) -> Result<(), QueueError> {
            self.0.delete(id)
        }

        fn reset_logs(&self, key: &QueueKey) -> Result<(), QueueError> {
            self.0.reset_logs(key)
        }
    }

    struct Harness {
        queue: Arc<InMemoryJobQueue>,
        errors: Arc<InMemoryErrorLog>,
        github: Arc<FakeGithub>,
        repositories: Arc<InMemoryRepositoryDirectory>,
        tokens: Arc<InMemoryTokenDirectory>,
        executor: JobExecutor<Arc<InMemoryJobQueue>, Arc<InMemoryErrorLog>>,
    }

    fn registry(
        github: &Arc<FakeGithub>,
        repositories: &Arc<InMemoryRepositoryDirectory>,
        tokens: &Arc<InMemoryTokenDirectory>,
    ) -> JobRegistry {
        JobRegistry::new()
            .register(FetchRepositoryEvents::new(
                github.clone(),
                repositories.clone(),
                tokens.clone(),
            ))
            .register(CheckRepositoryHook::new(
                github.clone(),
                repositories.clone(),
                tokens.clone(),
            ))
            .register(ResetTokenFlags::new(tokens.clone()))
    }

    fn setup() -> Harness {
        let queue = InMemoryJobQueue::arc();
        let errors = Arc::new(InMemoryErrorLog::new());
        let github = Arc::new(FakeGithub::default());
        let repositories = Arc::new(InMemoryRepositoryDirectory::new());
        let tokens = Arc::new(InMemoryTokenDirectory::new());
        let executor = JobExecutor::new(
            queue.clone(),
            errors.clone(),
            registry(&github, &repositories, &tokens),
        );
        Harness {
            queue,
            errors,
            github,
            repositories,
            tokens,
            executor,
        }
    }

    impl Harness {
        /// A repository with one subscriber.
        fn watched_repository(&self, id: &str) -> Identifier {
            let repository = Identifier::from(id);
            self.repositories.add_repository(repository.clone());
            let subscribers: BTreeSet<Username> = [Username::parse("octocat").unwrap()].into();
            self.repositories
                .replace_subscribers(&repository, &subscribers)
                .unwrap();
            repository
        }

        fn run(&self, queue_name: &str) -> (JobRecord, Outcome) {
            self.executor
                .run_next(&[queue_name.to_string()], Utc::now())
                .unwrap()
                .expect("a job to run")
        }

        fn queued(&self, queue_name: &str, identifier: &Identifier) -> Vec<JobRecord> {
            self.queue
                .find(queue_name, identifier, &JobStatus::QUEUED)
                .unwrap()
        }
    }

    fn delay_secs(next: &JobRecord) -> i64 {
        next.scheduled_delay().expect("a delayed clone").num_seconds()
    }

    fn rescheduled(outcome: Outcome) -> JobRecord {
        match outcome {
            Outcome::Succeeded {
                rescheduled: Some(next),
            } => next,
            other => panic!("expected a rescheduled job, got {other:?}"),
        }
    }

    #[test]
    fn poller_follows_suggested_delay_with_minimum() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.github.suggest(3, Some(30));
        h.queue.enqueue(NewJob::new(POLLER, repo.clone())).unwrap();

        let (done, outcome) = h.run(POLLER);
        let next = rescheduled(outcome);

        assert!((60..70).contains(&delay_secs(&next)));
        assert_eq!(next.identifier, repo);
        assert_eq!(done.field("updated_count"), Some(&serde_json::json!(3)));
        assert_eq!(done.message.as_deref(), Some("done [updated=3]"));
        assert_eq!(h.github.fetches(), 1);
    }

    #[test]
    fn poller_uses_longer_suggested_delay() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.github.suggest(0, Some(300));
        h.queue.enqueue(NewJob::new(POLLER, repo)).unwrap();

        let next = rescheduled(h.run(POLLER).1);
        assert!((300..310).contains(&delay_secs(&next)));
    }

    #[test]
    fn poller_without_subscribers_is_canceled_and_not_cloned() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.repositories
            .replace_subscribers(&repo, &BTreeSet::new())
            .unwrap();
        let job = h.queue.enqueue(NewJob::new(POLLER, repo.clone())).unwrap();

        let (_, outcome) = h.run(POLLER);

        assert_eq!(outcome, Outcome::Canceled);
        assert_eq!(h.queue.get(job.id).unwrap().unwrap().status, JobStatus::Canceled);
        assert!(h.queued(POLLER, &repo).is_empty());
        assert_eq!(h.github.fetches(), 0);
    }

    #[test]
    fn poller_of_hooked_repository_stops() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.repositories.set_hook(&repo, true).unwrap();
        h.queue.enqueue(NewJob::new(POLLER, repo.clone())).unwrap();

        assert_eq!(h.run(POLLER).1, Outcome::Canceled);
        assert!(h.queued(POLLER, &repo).is_empty());
    }

    #[test]
    fn hook_checker_delay_is_in_range_whatever_the_outcome() {
        for hook_set in [false, true] {
            let h = setup();
            let repo = h.watched_repository("1");
            h.github.set_hook("1", hook_set);
            h.queue.enqueue(NewJob::new(CHECKER, repo.clone())).unwrap();

            let next = rescheduled(h.run(CHECKER).1);
            assert!((780..1020).contains(&delay_secs(&next)));
            assert_eq!(h.repositories.hook_set(&repo).unwrap(), hook_set);
        }
    }

    #[test]
    fn missing_hook_starts_exactly_one_poller() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.queue.enqueue(NewJob::new(CHECKER, repo.clone())).unwrap();
        h.queue
            .enqueue(NewJob::new(CHECKER, repo.clone()).priority(1))
            .unwrap();

        // Two checker runs for the same repository.
        h.run(CHECKER);
        h.run(CHECKER);

        let pollers = h.queued(POLLER, &repo);
        assert_eq!(pollers.len(), 1);
        assert_eq!(pollers[0].status, JobStatus::Waiting);
    }

    #[test]
    fn hook_set_cancels_queued_pollers_of_that_repository_only() {
        let h = setup();
        let x = h.watched_repository("x");
        let y = h.watched_repository("y");
        h.github.set_hook("x", true);

        let waiting = h.queue.enqueue(NewJob::new(POLLER, x.clone())).unwrap();
        let delayed = h
            .queue
            .enqueue(NewJob::new(POLLER, x.clone()).delayed(Duration::from_secs(600)))
            .unwrap();
        let other = h.queue.enqueue(NewJob::new(POLLER, y.clone())).unwrap();
        // A poller of x already running keeps running.
        let running = h
            .queue
            .claim_next(&[POLLER.to_string()], Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(running.id, waiting.id);

        h.queue.enqueue(NewJob::new(CHECKER, x.clone())).unwrap();
        h.run(CHECKER);

        assert_eq!(h.queue.get(delayed.id).unwrap().unwrap().status, JobStatus::Canceled);
        assert_eq!(h.queue.get(running.id).unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(h.queue.get(other.id).unwrap().unwrap().status, JobStatus::Waiting);
        assert!(h.queued(POLLER, &x).is_empty());
    }

    #[test]
    fn poller_claimed_during_cancel_keeps_running() {
        let h = setup();
        let x = h.watched_repository("x");
        let job = h.queue.enqueue(NewJob::new(POLLER, x.clone())).unwrap();

        let racing = ClaimAfterFind(h.queue.clone());
        let canceled = cancel_queued(&racing, POLLER, &x).unwrap();

        assert_eq!(canceled, 0);
        assert_eq!(h.queue.get(job.id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn canceled_poller_never_runs() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.github.set_hook("1", true);
        h.queue.enqueue(NewJob::new(POLLER, repo.clone())).unwrap();
        h.queue.enqueue(NewJob::new(CHECKER, repo)).unwrap();

        h.run(CHECKER);

        assert!(
            h.executor
                .run_next(&[POLLER.to_string()], Utc::now())
                .unwrap()
                .is_none()
        );
        assert_eq!(h.github.fetches(), 0);
    }

    #[test]
    fn polling_chain_switches_to_webhook() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.github.suggest(1, None);
        h.queue.enqueue(NewJob::new(CHECKER, repo.clone())).unwrap();

        // No hook yet: the checker starts polling, the poller reschedules itself.
        h.run(CHECKER);
        let next_poll = rescheduled(h.run(POLLER).1);
        assert_eq!(h.queued(POLLER, &repo), vec![next_poll.clone()]);

        // The hook gets installed; the next check stops the chain.
        h.github.set_hook("1", true);
        let check = h.queued(CHECKER, &repo).remove(0);
        h.queue.set_status(check.id, JobStatus::Canceled).unwrap();
        h.queue.enqueue(NewJob::new(CHECKER, repo.clone())).unwrap();
        h.run(CHECKER);

        assert_eq!(
            h.queue.get(next_poll.id).unwrap().unwrap().status,
            JobStatus::Canceled
        );
        assert!(h.queued(POLLER, &repo).is_empty());
        assert_eq!(h.queued(CHECKER, &repo).len(), 1);
    }

    #[test]
    fn rate_limited_token_is_retried_after_ttl() {
        let h = setup();
        let token = Identifier::from("tok");
        h.tokens.rate_limit(token.clone(), 5);
        h.queue.enqueue(NewJob::new(TOKENS, token.clone())).unwrap();

        let next = rescheduled(h.run(TOKENS).1);
        assert_eq!(next.scheduled_delay(), Some(chrono::Duration::seconds(7)));
        assert!(!h.tokens.is_available(&token));
    }

    #[test]
    fn rate_limited_poll_reschedules_and_resets_the_token() {
        let h = setup();
        let repo = h.watched_repository("1");
        let token = Identifier::from(TOKEN);
        h.github.exhaust_quota(Some(30));
        h.queue.enqueue(NewJob::new(POLLER, repo.clone())).unwrap();

        let (done, outcome) = h.run(POLLER);
        let next = rescheduled(outcome);

        assert_eq!(delay_secs(&next), 32);
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.message.as_deref(), Some("done [rate limited]"));
        assert_eq!(done.field("rate_limited"), Some(&serde_json::json!(true)));
        assert!(h.errors.is_empty().unwrap());

        assert!(!h.tokens.is_available(&token));
        assert_eq!(h.tokens.rate_limit_ttl(&token).unwrap(), Some(30));
        let resets = h.queued(TOKENS, &token);
        assert_eq!(resets.len(), 1);
        assert_eq!(delay_secs(&resets[0]), 32);

        // Still limited on the retry: one reset job, not two.
        h.executor
            .run_next(&[POLLER.to_string()], Utc::now() + chrono::Duration::seconds(40))
            .unwrap()
            .expect("the retried poll");
        assert_eq!(h.queued(TOKENS, &token).len(), 1);
        assert_eq!(h.queued(POLLER, &repo).len(), 1);

        // The limit window ends and the reset job restores the token.
        h.tokens.expire(&token);
        let (_, outcome) = h
            .executor
            .run_next(&[TOKENS.to_string()], Utc::now() + chrono::Duration::seconds(40))
            .unwrap()
            .expect("the token reset");
        assert_eq!(outcome, Outcome::Succeeded { rescheduled: None });
        assert!(h.tokens.is_available(&token));
    }

    #[test]
    fn rate_limited_hook_check_changes_nothing() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.github.set_hook("1", true);
        h.github.exhaust_quota(None);
        let poller = h.queue.enqueue(NewJob::new(POLLER, repo.clone())).unwrap();
        h.queue.enqueue(NewJob::new(CHECKER, repo.clone())).unwrap();

        let next = rescheduled(h.run(CHECKER).1);

        assert!((780..1020).contains(&delay_secs(&next)));
        assert!(!h.repositories.hook_set(&repo).unwrap());
        assert_eq!(h.queue.get(poller.id).unwrap().unwrap().status, JobStatus::Waiting);
        assert_eq!(h.queued(TOKENS, &Identifier::from(TOKEN)).len(), 1);
        assert!(h.errors.is_empty().unwrap());
    }

    #[test]
    fn reset_token_terminates() {
        let h = setup();
        let token = Identifier::from("tok");
        h.tokens.rate_limit(token.clone(), 5);
        h.tokens.expire(&token);
        h.queue.enqueue(NewJob::new(TOKENS, token.clone())).unwrap();

        let (record, outcome) = h.run(TOKENS);
        assert_eq!(outcome, Outcome::Succeeded { rescheduled: None });
        assert_eq!(record.status, JobStatus::Success);
        assert!(h.tokens.is_available(&token));
        assert!(h.queued(TOKENS, &token).is_empty());
    }

    #[test]
    fn remote_failure_is_logged_and_not_rescheduled() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.github.fail();
        let job = h.queue.enqueue(NewJob::new(CHECKER, repo.clone())).unwrap();

        let (_, outcome) = h.run(CHECKER);

        assert!(matches!(outcome, Outcome::Failed { .. }));
        assert_eq!(h.queue.get(job.id).unwrap().unwrap().status, JobStatus::Error);
        let entry = h.errors.get(&job.id.to_string()).unwrap();
        assert_eq!(entry.queue_name, CHECKER);
        assert_eq!(entry.identifier, repo);
        assert!(entry.message.contains("github is down"));
        assert!(h.queued(CHECKER, &repo).is_empty());
        assert!(h.queued(POLLER, &repo).is_empty());
    }

    #[test]
    fn error_log_cleanup_stops_at_cutoff_and_is_idempotent() {
        let log = InMemoryErrorLog::new();
        for day in 1..=10 {
            log.append(ErrorEntry::new(
                format!("job-{day}"),
                CHECKER,
                "1",
                format!("2020-01-{day:02}T09:30:00Z"),
                "boom",
            ))
            .unwrap();
        }
        // keep_days = 7 from 2020-01-12 puts the cutoff at 2020-01-05.
        let today = NaiveDate::from_ymd_opt(2020, 1, 12).unwrap();
        let options = CleanupOptions::default();

        let first = clean_error_log(&log, &options, today).unwrap();
        let second = clean_error_log(&log, &options, today).unwrap();

        assert_eq!(first.deleted, 5);
        assert_eq!(second.deleted, 0);
        assert_eq!(log.len().unwrap(), 5);
        assert_eq!(log.page_by_date(0, 1).unwrap()[0].key, "job-6");
    }

    #[test]
    fn full_sweep_keeps_planned_work_and_skips_unregistered_queues() {
        let h = setup();
        let repo = h.watched_repository("1");
        h.github.suggest(1, None);
        h.queue.enqueue(NewJob::new(POLLER, repo.clone())).unwrap();
        h.run(POLLER);

        let long_ago = Utc::now() - chrono::Duration::days(30);
        let stale = h.queue.enqueue_at(NewJob::new(POLLER, "2"), long_ago);
        h.queue.set_status(stale.id, JobStatus::Success).unwrap();
        let legacy = h.queue.enqueue_at(NewJob::new("legacy-sync", "1"), long_ago);
        h.queue.set_status(legacy.id, JobStatus::Success).unwrap();

        let registry = registry(&h.github, &h.repositories, &h.tokens);
        let summary = clean_all(&h.queue, &h.errors, &registry, &CleanupOptions::default()).unwrap();

        assert_eq!(summary.jobs.deleted, 1);
        assert!(h.queue.get(stale.id).unwrap().is_none());
        assert_eq!(h.queued(POLLER, &repo).len(), 1);
        assert!(h.queue.get(legacy.id).unwrap().is_some());
    }

    proptest! {
        #[test]
        fn cleanup_never_deletes_planned_identifiers(
            finished in proptest::collection::vec((0u8..6, 0i64..20), 0..40),
            planned in proptest::collection::hash_set(0u8..6, 0..4),
            keep_days in 0u32..15,
        ) {
            let queue = InMemoryJobQueue::new();
            let start = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
            for (identifier, age) in &finished {
                let record = queue.enqueue_at(
                    NewJob::new(POLLER, identifier.to_string()),
                    start + chrono::Duration::days(*age),
                );
                queue.set_status(record.id, JobStatus::Success).unwrap();
            }
            for identifier in &planned {
                queue.enqueue_at(
                    NewJob::new(POLLER, identifier.to_string()).delayed(Duration::from_secs(60)),
                    start,
                );
            }

            let today = NaiveDate::from_ymd_opt(2020, 1, 21).unwrap();
            let options = CleanupOptions { keep_days, batch_size: 7, ..CleanupOptions::default() };
            clean_queue(&queue, POLLER, &options, today).unwrap();

            let remaining: HashSet<Identifier> = queue
                .records_page(POLLER, 0, usize::MAX)
                .unwrap()
                .into_iter()
                .map(|r| r.identifier)
                .collect();
            for identifier in &planned {
                prop_assert!(remaining.contains(&Identifier::from(identifier.to_string())));
            }
            prop_assert_eq!(queue.planned_identifiers(POLLER).unwrap().len(), planned.len());
        }
    }
}
