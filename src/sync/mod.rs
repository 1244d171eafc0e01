//! The sync system. A `SyncController` runs one sync at a time: it loads
//! permissions, brings the group list up to date, then downloads and uploads
//! each library in turn, handing conflicts to the conflict engine and
//! failures to the retry policy. Attachment files move separately, through
//! the downloader/uploader in `files`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::BError;
use crate::models::library::LibraryId;
use crate::models::object::ObjectType;

pub mod action;
pub mod conflict;
pub mod controller;
pub mod files;
pub mod planner;
pub mod retry;
pub mod scheduler;

/// How thorough a sync is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    Normal,
    /// a user-requested sync: objects waiting for a re-fetch go now, backoff
    /// or not
    IgnoreIndividualDelays,
    /// compare everything with the remote, not just what changed since our
    /// versions
    Full,
    /// a re-run of the libraries that failed last time
    Retry,
}

impl SyncType {
    pub fn ignores_delays(&self) -> bool {
        match self {
            SyncType::IgnoreIndividualDelays | SyncType::Full => true,
            _ => false,
        }
    }

    pub fn is_full(&self) -> bool {
        *self == SyncType::Full
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// synced, but some objects were skipped and will be tried again
    SyncedWithDeferrals,
    /// at least one library didn't finish
    PartialFailure,
    Aborted,
}

/// A library-scoped error that didn't stop the run
#[derive(Debug, Clone)]
pub struct NonFatalError {
    pub library: LibraryId,
    pub error: Arc<BError>,
    /// the library got another go within the run and finished
    pub recovered: bool,
}

/// An object left out of this run
#[derive(Debug, Clone)]
pub struct DeferredObject {
    pub library: LibraryId,
    pub object: ObjectType,
    pub key: String,
    pub error: Arc<BError>,
}

/// What happened during a sync run
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    /// every action processed, in order
    pub actions: Vec<action::Action>,
    pub errors: Vec<NonFatalError>,
    pub deferred: Vec<DeferredObject>,
    /// the error that ended the run early, if any
    pub fatal: Option<Arc<BError>>,
    /// every delay waited out between retries
    pub delays: Vec<Duration>,
    /// nothing we tried to push made it to the remote
    pub push_failed: bool,
}

impl SyncReport {
    /// Libraries that ended the run with an unresolved error
    pub fn failed_libraries(&self) -> Vec<LibraryId> {
        let mut libs = self.errors.iter()
            .filter(|x| !x.recovered)
            .map(|x| x.library)
            .collect::<Vec<_>>();
        libs.sort();
        libs.dedup();
        libs
    }

    /// Failed libraries that another run might fix. A removed group or a
    /// group we can't write to waits for a user instead.
    pub fn retry_libraries(&self) -> Vec<LibraryId> {
        let waiting = self.errors.iter()
            .filter(|x| {
                match *x.error {
                    BError::GroupRemoved(..) | BError::GroupWriteDenied(..) => true,
                    _ => false,
                }
            })
            .map(|x| x.library)
            .collect::<Vec<_>>();
        self.failed_libraries()
            .into_iter()
            .filter(|x| !waiting.contains(x))
            .collect()
    }
}
