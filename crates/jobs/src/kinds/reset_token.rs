use std::sync::Arc;

use crate::collaborators::TokenDirectory;
use crate::job::{Job, JobError, NextRun};
use crate::policy::token_reset_delay;
use crate::queue::JobQueue;
use crate::record::JobRecord;

/// Makes a rate-limited API token usable again once its limit window is over.
pub struct ResetTokenFlags {
    tokens: Arc<dyn TokenDirectory>,
}

impl ResetTokenFlags {
    pub fn new(tokens: Arc<dyn TokenDirectory>) -> Self {
        Self { tokens }
    }
}

impl Job for ResetTokenFlags {
    const QUEUE_NAME: &'static str = "reset-token-flags";

    /// `false` while the token is still rate limited.
    type Output = bool;

    fn run(&self, _queue: &dyn JobQueue, record: &JobRecord) -> Result<bool, JobError> {
        Ok(self.tokens.reset_flags(&record.identifier)?)
    }

    fn on_success(
        &self,
        _queue: &dyn JobQueue,
        record: &mut JobRecord,
        reset: &bool,
    ) -> Result<NextRun, JobError> {
        if *reset {
            return Ok(NextRun::Done);
        }
        let ttl = self.tokens.rate_limit_ttl(&record.identifier)?;
        Ok(NextRun::After(token_reset_delay(ttl)))
    }

    fn success_message_addon(&self, _record: &JobRecord, reset: &bool) -> String {
        if *reset {
            "[reset]".to_string()
        } else {
            "[still rate limited]".to_string()
        }
    }
}
