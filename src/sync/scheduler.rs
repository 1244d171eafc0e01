//! Re-runs syncs that left libraries behind: first a `Retry` of just those
//! libraries, then `Full` syncs, until they go through or the retry budget
//! runs out.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{BResult, BError, ErrorClass};
use crate::models::library::LibrarySyncType;
use crate::sync::{SyncOutcome, SyncReport, SyncType};
use crate::sync::controller::SyncController;
use crate::sync::retry::{self, RetryDecision};

pub struct SyncScheduler {
    controller: Arc<SyncController>,
}

impl SyncScheduler {
    pub fn new(controller: Arc<SyncController>) -> SyncScheduler {
        SyncScheduler { controller }
    }

    /// Sync, then keep retrying failed libraries per the retry policy.
    /// Returns the report of every run, in order. If some other sync is
    /// running when a retry comes due, that one gets to finish the job and
    /// the reports so far come back.
    pub fn run(&self, sync_type: SyncType, libraries: LibrarySyncType) -> BResult<Vec<SyncReport>> {
        let policy = self.controller.policy().clone();
        let mut reports = Vec::new();
        let mut report = self.controller.sync(sync_type, libraries)?;
        let mut attempt = 0;
        loop {
            let failed = report.retry_libraries();
            let again = report.outcome == SyncOutcome::PartialFailure && failed.len() > 0;
            reports.push(report);
            if !again { break; }
            let delay = match retry::decide(attempt, ErrorClass::Library, &policy) {
                RetryDecision::RetryAfter(x) => x,
                _ => {
                    warn!("SyncScheduler.run() -- giving up on {:?} after {} retries", failed, attempt);
                    break;
                }
            };
            info!("SyncScheduler.run() -- retrying {:?} in {:?}", failed, delay);
            if !self.controller.wait(delay) {
                info!("SyncScheduler.run() -- cancelled");
                break;
            }
            let next_type = if attempt == 0 { SyncType::Retry } else { SyncType::Full };
            report = match self.controller.sync(next_type, LibrarySyncType::Specific(failed)) {
                Ok(x) => x,
                Err(BError::TryAgain) => {
                    warn!("SyncScheduler.run() -- another sync is running, stopping retries");
                    break;
                }
                Err(e) => return Err(e),
            };
            attempt += 1;
        }
        Ok(reports)
    }

    /// Run in the background
    pub fn spawn(self, sync_type: SyncType, libraries: LibrarySyncType) -> BResult<JoinHandle<BResult<Vec<SyncReport>>>> {
        let handle = thread::Builder::new()
            .name(String::from("sync:scheduler"))
            .spawn(move || self.run(sync_type, libraries))?;
        Ok(handle)
    }
}
