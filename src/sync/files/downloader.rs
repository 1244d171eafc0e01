//! Runs attachment downloads on a small worker pool. One transfer per
//! (key, library) is ever live: asking again while it runs just attaches
//! another observer to it. All bookkeeping sits behind one mutex that is
//! never held while a transfer does I/O. Readers go through a snapshot that
//! gets republished whenever a download starts or ends, so asking for
//! progress never waits on that mutex.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crossbeam::channel::{self, Receiver, Sender};

use crate::api::FileBackends;
use crate::config;
use crate::error::{BResult, BError};
use crate::models::file_sync::{Download, Update, UpdateKind};
use crate::models::library::LibraryId;
use crate::storage::Storage;
use crate::storage::requests::MarkFileAsDownloaded;
use crate::sync::files::download::DownloadOperation;
use crate::sync::files::progress::Progress;
use crate::util::thredder::Thredder;

/// Everything needed to start one download
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub key: String,
    pub parent_key: Option<String>,
    pub library: LibraryId,
    pub file: PathBuf,
}

impl DownloadRequest {
    pub fn new(key: &str, parent_key: Option<&str>, library: LibraryId, file: PathBuf) -> DownloadRequest {
        DownloadRequest {
            key: String::from(key),
            parent_key: parent_key.map(String::from),
            library,
            file,
        }
    }
}

struct Entry {
    op: Arc<DownloadOperation>,
    observers: Vec<Sender<Update>>,
    last_progress: f64,
    /// a worker picked it up
    started: bool,
}

struct State {
    active: HashMap<Download, Entry>,
    errors: HashMap<Download, Arc<BError>>,
    /// 100 units per download in the current batch
    batch: Progress,
    batch_total: usize,
    batch_done: usize,
    subscribers: Vec<Sender<Update>>,
}

impl State {
    fn new() -> State {
        State {
            active: HashMap::new(),
            errors: HashMap::new(),
            batch: Progress::new(0),
            batch_total: 0,
            batch_done: 0,
            subscribers: Vec::new(),
        }
    }

    /// Send an update to every subscriber plus a set of observers, dropping
    /// the ones that hung up. Subscribers always hear first.
    fn broadcast(subscribers: &mut Vec<Sender<Update>>, observers: &mut Vec<Sender<Update>>, update: &Update) {
        subscribers.retain(|x| x.send(update.clone()).is_ok());
        observers.retain(|x| x.send(update.clone()).is_ok());
    }

    fn close_batch_if_done(&mut self) {
        if self.batch_done >= self.batch_total {
            self.batch = Progress::new(0);
            self.batch_total = 0;
            self.batch_done = 0;
        }
    }
}

/// What `data()` and `batch_data()` read. Progress handles are shared with
/// the live operations, so fractions stay current between republishes.
#[derive(Default)]
struct Snapshot {
    progress: HashMap<Download, Progress>,
    errors: HashMap<Download, Arc<BError>>,
    /// (batch progress, remaining, total)
    batch: Option<(Progress, usize, usize)>,
}

struct Inner {
    backends: FileBackends,
    storage: Option<Arc<Storage>>,
    state: Mutex<State>,
    snapshot: RwLock<Snapshot>,
}

impl Inner {
    /// Copy the reader-facing parts of the state. Called with the state
    /// lock held, so snapshots go out in order.
    fn publish(&self, state: &State) {
        let mut snapshot = lockw!(self.snapshot);
        snapshot.progress = state.active.iter()
            .map(|(id, entry)| (id.clone(), entry.op.progress.clone()))
            .collect();
        snapshot.errors = state.errors.clone();
        snapshot.batch = if state.batch_total == 0 {
            None
        } else {
            Some((state.batch.clone(), state.batch_total - state.batch_done, state.batch_total))
        };
    }

    fn update(op: &DownloadOperation, kind: UpdateKind) -> Update {
        Update {
            key: op.download.key.clone(),
            parent_key: op.parent_key.clone(),
            library: op.download.library,
            kind,
        }
    }

    /// Publish progress for a running download, only ever moving forward
    fn progress(&self, op: &Arc<DownloadOperation>, fraction: f64) {
        let mut guard = lock!(self.state);
        let state = &mut *guard;
        let entry = match state.active.get_mut(&op.download) {
            Some(x) if Arc::ptr_eq(&x.op, op) => x,
            _ => return,
        };
        if fraction <= entry.last_progress { return; }
        entry.last_progress = fraction;
        let update = Inner::update(op, UpdateKind::Progress(fraction));
        State::broadcast(&mut state.subscribers, &mut entry.observers, &update);
    }

    /// Take a download out of the live set and send its terminal event.
    /// Returns false if someone else already did.
    fn finish(&self, op: &Arc<DownloadOperation>, kind: UpdateKind) -> bool {
        let mut state = lock!(self.state);
        self.finish_locked(&mut state, op, kind)
    }

    fn finish_locked(&self, state: &mut State, op: &Arc<DownloadOperation>, kind: UpdateKind) -> bool {
        let mut entry = match state.active.remove(&op.download) {
            Some(x) => {
                if Arc::ptr_eq(&x.op, op) {
                    x
                } else {
                    // a newer transfer for the same identity, leave it be
                    state.active.insert(op.download.clone(), x);
                    return false;
                }
            }
            None => return false,
        };
        if let UpdateKind::Failed(ref err) = kind {
            state.errors.insert(op.download.clone(), err.clone());
        }
        op.progress.finish();
        state.batch_done += 1;
        state.close_batch_if_done();
        self.publish(state);
        let update = Inner::update(op, kind);
        State::broadcast(&mut state.subscribers, &mut entry.observers, &update);
        true
    }

    /// Claim a queued download for a worker. False means it was cancelled
    /// (and reported) while it sat in the queue.
    fn start(&self, op: &Arc<DownloadOperation>) -> bool {
        let mut state = lock!(self.state);
        match state.active.get_mut(&op.download) {
            Some(entry) if Arc::ptr_eq(&entry.op, op) => {
                entry.started = true;
                true
            }
            _ => false,
        }
    }

    fn run(&self, op: Arc<DownloadOperation>) {
        if !self.start(&op) { return; }
        debug!("AttachmentDownloader -- starting {} ({})", op.download.key, op.download.library);
        let res = {
            let progress_op = op.clone();
            let mut on_progress = |fraction: f64| self.progress(&progress_op, fraction);
            op.run(&mut on_progress)
        };
        let kind = match res {
            Ok(_) => UpdateKind::Ready,
            Err(BError::Cancelled) => UpdateKind::Cancelled,
            Err(e) => {
                warn!("AttachmentDownloader -- download of {} failed: {}", op.download.key, e);
                UpdateKind::Failed(Arc::new(e))
            }
        };
        if let UpdateKind::Ready = kind {
            // record it before anyone hears it's ready
            if let Some(ref storage) = self.storage {
                let req = MarkFileAsDownloaded {
                    library: op.download.library,
                    key: op.download.key.clone(),
                    downloaded: true,
                };
                if let Err(e) = storage.perform(&req) {
                    warn!("AttachmentDownloader -- couldn't mark {} downloaded: {}", op.download.key, e);
                }
            }
            info!("AttachmentDownloader -- downloaded {} ({})", op.download.key, op.download.library);
        }
        self.finish(&op, kind);
    }
}

pub struct AttachmentDownloader {
    inner: Arc<Inner>,
    pool: Thredder,
}

impl AttachmentDownloader {
    /// Create a downloader running at most `workers` transfers at once. With
    /// a storage, finished downloads get recorded on their attachment.
    pub fn new(backends: FileBackends, storage: Option<Arc<Storage>>, workers: u32) -> BResult<AttachmentDownloader> {
        Ok(AttachmentDownloader {
            inner: Arc::new(Inner {
                backends,
                storage,
                state: Mutex::new(State::new()),
                snapshot: RwLock::new(Snapshot::default()),
            }),
            pool: Thredder::new("downloads", workers)?,
        })
    }

    pub fn from_config(backends: FileBackends, storage: Option<Arc<Storage>>) -> BResult<AttachmentDownloader> {
        let workers: u32 = config::get_opt(&["files", "max_concurrent_downloads"]).unwrap_or(4);
        AttachmentDownloader::new(backends, storage, workers)
    }

    /// Download an attachment's file. The returned channel sees progress and
    /// then exactly one of Ready/Failed/Cancelled.
    pub fn download(&self, request: DownloadRequest) -> BResult<Receiver<Update>> {
        let (tx, rx) = channel::unbounded();
        let id = Download::new(&request.key, request.library);
        let op = {
            let mut state = lock!(self.inner.state);
            if let Some(entry) = state.active.get_mut(&id) {
                debug!("AttachmentDownloader.download() -- {} already in flight", request.key);
                entry.observers.push(tx);
                return Ok(rx);
            }
            state.errors.remove(&id);
            let backend = self.inner.backends.for_library(request.library);
            let op = Arc::new(DownloadOperation::new(id.clone(), request.parent_key, request.file, backend));
            state.batch_total += 1;
            let total = (state.batch_total as u64) * 100;
            state.batch.set_total(total);
            state.batch.add_child(&op.progress, 100);
            state.active.insert(id, Entry { op: op.clone(), observers: vec![tx], last_progress: 0.0, started: false });
            self.inner.publish(&state);
            op
        };
        info!("AttachmentDownloader.download() -- queueing {} ({})", op.download.key, op.download.library);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let job_op = op.clone();
        let queued = self.pool.run(move || {
            match weak.upgrade() {
                Some(inner) => inner.run(job_op),
                None => {}
            }
        });
        if let Err(e) = queued {
            self.inner.finish(&op, UpdateKind::Failed(Arc::new(e)));
        }
        Ok(rx)
    }

    /// Queue a bunch of downloads. Ones already in flight are left alone.
    pub fn batch_download(&self, requests: Vec<DownloadRequest>) -> BResult<()> {
        info!("AttachmentDownloader.batch_download() -- {} requests", requests.len());
        for request in requests {
            self.download(request)?;
        }
        Ok(())
    }

    /// Cancel a download. Queued ones end right away; running ones stop at
    /// their next chunk and report through their own observers.
    ///
    /// Returns false when nothing was in flight for this attachment. There
    /// are no observers to tell in that case, so only global subscribers get
    /// a Cancelled update (a UI may still be showing an old transfer).
    pub fn cancel(&self, key: &str, library: LibraryId) -> bool {
        let id = Download::new(key, library);
        let mut guard = lock!(self.inner.state);
        let state = &mut *guard;
        let (op, started) = match state.active.get(&id) {
            Some(entry) => (Some(entry.op.clone()), entry.started),
            None => (None, false),
        };
        match op {
            Some(op) => {
                info!("AttachmentDownloader.cancel() -- cancelling {} ({})", key, library);
                op.cancel();
                // no worker has it yet, so nobody else will report it
                if !started {
                    self.inner.finish_locked(state, &op, UpdateKind::Cancelled);
                }
                true
            }
            None => {
                let update = Update {
                    key: String::from(key),
                    parent_key: None,
                    library,
                    kind: UpdateKind::Cancelled,
                };
                state.subscribers.retain(|x| x.send(update.clone()).is_ok());
                false
            }
        }
    }

    /// Cancel everything in flight
    pub fn cancel_all(&self) {
        let ids = {
            let state = lock!(self.inner.state);
            state.active.keys().cloned().collect::<Vec<_>>()
        };
        for id in ids {
            self.cancel(&id.key, id.library);
        }
    }

    /// Progress and last error for one attachment
    pub fn data(&self, key: &str, library: LibraryId) -> (Option<f64>, Option<Arc<BError>>) {
        let id = Download::new(key, library);
        let snapshot = lockr!(self.inner.snapshot);
        let progress = snapshot.progress.get(&id).map(|x| x.fraction());
        (progress, snapshot.errors.get(&id).cloned())
    }

    /// Progress of the current batch, plus how many downloads are left out
    /// of how many
    pub fn batch_data(&self) -> (Option<f64>, usize, usize) {
        let snapshot = lockr!(self.inner.snapshot);
        match snapshot.batch {
            Some((ref progress, remaining, total)) => (Some(progress.fraction()), remaining, total),
            None => (None, 0, 0),
        }
    }

    /// Every update for every download, for binding a UI
    pub fn subscribe(&self) -> Receiver<Update> {
        let (tx, rx) = channel::unbounded();
        lock!(self.inner.state).subscribers.push(tx);
        rx
    }
}

impl Drop for AttachmentDownloader {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
