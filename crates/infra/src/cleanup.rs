//! Batch cleanup sweep for expired job records and error-log entries.
//!
//! Dates are compared on their day (`YYYY-MM-DD`), so a record is expired
//! when its day is on or before `today - keep_days`.

use std::ops::AddAssign;

use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use hubjobs_jobs::{JobQueue, JobRegistry, JobStatus, QueueError};

use crate::jobs::error_log::{ErrorLogError, ErrorLogStore, day_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Log progress every `print_step` deletions; 0 disables progress lines.
    pub print_step: usize,
    pub keep_days: u32,
    pub batch_size: usize,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            print_step: 1000,
            keep_days: 7,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted: usize,
    pub kept: usize,
    /// Failed deletions.
    pub errors: usize,
}

impl AddAssign for CleanupReport {
    fn add_assign(&mut self, other: Self) {
        self.deleted += other.deleted;
        self.kept += other.kept;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub error_log: CleanupReport,
    pub jobs: CleanupReport,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    ErrorLog(#[from] ErrorLogError),

    #[error("batch size must be positive")]
    EmptyBatch,
}

/// `today - keep_days`, formatted `YYYY-MM-DD`.
pub fn cutoff_day(today: NaiveDate, keep_days: u32) -> String {
    today
        .checked_sub_days(Days::new(u64::from(keep_days)))
        .unwrap_or(NaiveDate::MIN)
        .format("%Y-%m-%d")
        .to_string()
}

fn progress(step: usize, deleted: usize, what: &str) {
    if step > 0 && deleted % step == 0 {
        info!(deleted, "{what} cleanup in progress");
    }
}

/// Delete error-log entries whose day is on or before the cutoff.
///
/// Pages by ascending date and stops at the first later entry. Failed
/// deletions are skipped by advancing the page offset.
pub fn clean_error_log(
    log: &dyn ErrorLogStore,
    options: &CleanupOptions,
    today: NaiveDate,
) -> Result<CleanupReport, CleanupError> {
    if options.batch_size == 0 {
        return Err(CleanupError::EmptyBatch);
    }
    let cutoff = cutoff_day(today, options.keep_days);
    let mut report = CleanupReport::default();

    'pages: loop {
        let page = log.page_by_date(report.errors, options.batch_size)?;
        if page.is_empty() {
            break;
        }
        for entry in page {
            if entry.day() > cutoff.as_str() {
                break 'pages;
            }
            match log.delete(&entry.key) {
                Ok(()) => {
                    report.deleted += 1;
                    progress(options.print_step, report.deleted, "error log");
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(key = %entry.key, message = %entry.message, error = %e, "could not delete error entry");
                }
            }
        }
    }

    info!(
        cutoff = %cutoff,
        deleted = report.deleted,
        errors = report.errors,
        "error log cleaned"
    );
    Ok(report)
}

/// Delete expired records of one queue name and reset its success/error logs.
///
/// Records whose identifier is still planned (waiting or delayed in any
/// priority queue of the name), running records and records added after the
/// cutoff day are kept.
pub fn clean_queue(
    queue: &dyn JobQueue,
    queue_name: &str,
    options: &CleanupOptions,
    today: NaiveDate,
) -> Result<CleanupReport, CleanupError> {
    if options.batch_size == 0 {
        return Err(CleanupError::EmptyBatch);
    }
    let cutoff = cutoff_day(today, options.keep_days);
    let planned = queue.planned_identifiers(queue_name)?;
    let mut report = CleanupReport::default();

    loop {
        let page = queue.records_page(queue_name, report.kept + report.errors, options.batch_size)?;
        if page.is_empty() {
            break;
        }
        for record in page {
            let added = record.added_at.to_rfc3339();
            if planned.contains(&record.identifier)
                || record.status == JobStatus::Running
                || day_of(&added) > cutoff.as_str()
            {
                report.kept += 1;
                continue;
            }
            match queue.delete(record.id) {
                Ok(()) => {
                    report.deleted += 1;
                    progress(options.print_step, report.deleted, queue_name);
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %record.id, queue = queue_name, error = %e, "could not delete job record");
                }
            }
        }
    }

    for key in queue.queue_keys(queue_name)? {
        queue.reset_logs(&key)?;
    }

    info!(
        queue = queue_name,
        cutoff = %cutoff,
        deleted = report.deleted,
        kept = report.kept,
        errors = report.errors,
        "job records cleaned"
    );
    Ok(report)
}

/// Clean every registered queue name.
///
/// Names found in the store without a registration are reported and left alone.
pub fn clean_job_records(
    queue: &dyn JobQueue,
    registry: &JobRegistry,
    options: &CleanupOptions,
    today: NaiveDate,
) -> Result<CleanupReport, CleanupError> {
    let mut report = CleanupReport::default();
    for name in registry.queue_names() {
        report += clean_queue(queue, name, options, today)?;
    }
    for name in queue.queue_names()? {
        if !registry.contains(&name) {
            warn!(queue = %name, "no job type registered for queue, skipped");
        }
    }
    Ok(report)
}

/// Error log first, then job records.
pub fn clean_all(
    queue: &dyn JobQueue,
    log: &dyn ErrorLogStore,
    registry: &JobRegistry,
    options: &CleanupOptions,
) -> Result<CleanupSummary, CleanupError> {
    let today = Utc::now().date_naive();
    Ok(CleanupSummary {
        error_log: clean_error_log(log, options, today)?,
        jobs: clean_job_records(queue, registry, options, today)?,
    })
}
