//! Pushes attachment files up. Same ground rules as the downloader: one live
//! upload per identity, updates over channels, one mutex for bookkeeping.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use crossbeam::channel::{self, Receiver, Sender};

use crate::api::{FileBackend, FileBackends, TransferSink};
use crate::config;
use crate::error::{BResult, BError};
use crate::models::file_sync::{AttachmentUpload, Update, UpdateKind};
use crate::models::library::LibraryId;
use crate::models::response::AuthorizeUploadResponse;
use crate::storage::Storage;
use crate::storage::requests::{CheckItemIsChanged, MarkAttachmentUploaded, ReadAttachmentUploads};
use crate::sync::files::progress::Progress;
use crate::util::thredder::Thredder;

struct Entry {
    progress: Progress,
    observers: Vec<Sender<Update>>,
    last_progress: f64,
    /// a worker picked it up
    started: bool,
}

struct State {
    active: HashMap<AttachmentUpload, Entry>,
    errors: HashMap<AttachmentUpload, Arc<BError>>,
    subscribers: Vec<Sender<Update>>,
}

struct Inner {
    backends: FileBackends,
    storage: Arc<Storage>,
    state: Mutex<State>,
}

struct Sink<'a> {
    inner: &'a Inner,
    upload: &'a AttachmentUpload,
    progress: Progress,
}

impl<'a> TransferSink for Sink<'a> {
    fn set_compressed(&mut self, _compressed: bool) {}

    fn progress(&mut self, completed: u64, total: Option<u64>) {
        if let Some(total) = total {
            if total > 0 {
                self.progress.set_completed(completed.saturating_mul(100) / total);
            }
        }
        self.inner.progress(self.upload, self.progress.fraction());
    }

    fn is_cancelled(&self) -> bool {
        self.progress.is_cancelled()
    }
}

fn update(upload: &AttachmentUpload, kind: UpdateKind) -> Update {
    Update {
        key: upload.key.clone(),
        parent_key: upload.parent_key.clone(),
        library: upload.library,
        kind,
    }
}

impl Inner {
    fn progress(&self, upload: &AttachmentUpload, fraction: f64) {
        let mut guard = lock!(self.state);
        let state = &mut *guard;
        let entry = match state.active.get_mut(upload) {
            Some(x) => x,
            None => return,
        };
        if fraction <= entry.last_progress { return; }
        entry.last_progress = fraction;
        let update = update(upload, UpdateKind::Progress(fraction));
        state.subscribers.retain(|x| x.send(update.clone()).is_ok());
        entry.observers.retain(|x| x.send(update.clone()).is_ok());
    }

    fn finish(&self, upload: &AttachmentUpload, progress: &Progress, kind: UpdateKind) {
        let mut state = lock!(self.state);
        Inner::finish_locked(&mut state, upload, progress, kind);
    }

    /// Take an upload out of the live set and send its terminal event, unless
    /// a newer upload of the same file took its place
    fn finish_locked(state: &mut State, upload: &AttachmentUpload, progress: &Progress, kind: UpdateKind) {
        let mut entry = match state.active.remove(upload) {
            Some(x) => {
                if x.progress.same_as(progress) {
                    x
                } else {
                    state.active.insert(upload.clone(), x);
                    return;
                }
            }
            None => return,
        };
        if let UpdateKind::Failed(ref err) = kind {
            state.errors.insert(upload.clone(), err.clone());
        }
        let update = update(upload, kind);
        state.subscribers.retain(|x| x.send(update.clone()).is_ok());
        entry.observers.retain(|x| x.send(update.clone()).is_ok());
    }

    /// Make sure the file is there and the remote knows about its item
    fn check(&self, upload: &AttachmentUpload) -> BResult<()> {
        let changed = self.storage.perform(&CheckItemIsChanged {
            library: upload.library,
            key: upload.key.clone(),
        })?;
        if changed {
            return Err(BError::AttachmentNotSubmitted(upload.key.clone()));
        }
        match fs::metadata(&upload.file) {
            Ok(ref meta) if meta.is_file() && meta.len() > 0 => Ok(()),
            _ => Err(BError::AttachmentMissing(upload.key.clone())),
        }
    }

    fn mark_uploaded(&self, upload: &AttachmentUpload) -> BResult<()> {
        self.storage.perform(&MarkAttachmentUploaded {
            library: upload.library,
            key: upload.key.clone(),
            md5: upload.md5.clone(),
        })?;
        Ok(())
    }

    fn upload(&self, backend: &dyn FileBackend, upload: &AttachmentUpload, progress: Progress) -> BResult<()> {
        if progress.is_cancelled() {
            return Err(BError::Cancelled);
        }
        if upload.remote_md5.as_ref() == Some(&upload.md5) {
            debug!("AttachmentUploader -- {} already matches the remote", upload.key);
            return self.mark_uploaded(upload);
        }
        self.check(upload)?;
        let auth = match backend.authorize_upload(upload)? {
            AuthorizeUploadResponse::Exists => {
                debug!("AttachmentUploader -- remote already has {}", upload.key);
                return self.mark_uploaded(upload);
            }
            AuthorizeUploadResponse::New(x) => x,
        };
        {
            let mut sink = Sink { inner: self, upload, progress: progress.clone() };
            backend.upload(upload, &auth, &mut sink)?;
        }
        if progress.is_cancelled() {
            return Err(BError::Cancelled);
        }
        backend.register_upload(upload, &auth)?;
        self.mark_uploaded(upload)
    }

    /// Claim a queued upload for a worker. False means it got cancelled (and
    /// reported) while it waited.
    fn start(&self, upload: &AttachmentUpload, progress: &Progress) -> bool {
        let mut state = lock!(self.state);
        match state.active.get_mut(upload) {
            Some(entry) if entry.progress.same_as(progress) => {
                entry.started = true;
                true
            }
            _ => false,
        }
    }

    fn run(&self, upload: AttachmentUpload, progress: Progress) {
        if !self.start(&upload, &progress) { return; }
        let backend = self.backends.for_library(upload.library);
        let kind = match self.upload(&*backend, &upload, progress.clone()) {
            Ok(_) => {
                info!("AttachmentUploader -- uploaded {} ({})", upload.key, upload.library);
                UpdateKind::Ready
            }
            Err(BError::Cancelled) => UpdateKind::Cancelled,
            Err(e) => {
                warn!("AttachmentUploader -- upload of {} failed: {}", upload.key, e);
                UpdateKind::Failed(Arc::new(e))
            }
        };
        self.finish(&upload, &progress, kind);
    }
}

pub struct AttachmentUploader {
    inner: Arc<Inner>,
    pool: Thredder,
}

impl AttachmentUploader {
    pub fn new(backends: FileBackends, storage: Arc<Storage>, workers: u32) -> BResult<AttachmentUploader> {
        Ok(AttachmentUploader {
            inner: Arc::new(Inner {
                backends,
                storage,
                state: Mutex::new(State {
                    active: HashMap::new(),
                    errors: HashMap::new(),
                    subscribers: Vec::new(),
                }),
            }),
            pool: Thredder::new("uploads", workers)?,
        })
    }

    pub fn from_config(backends: FileBackends, storage: Arc<Storage>) -> BResult<AttachmentUploader> {
        let workers: u32 = config::get_opt(&["files", "max_concurrent_uploads"]).unwrap_or(2);
        AttachmentUploader::new(backends, storage, workers)
    }

    /// Upload one attachment. The channel sees progress, then exactly one
    /// terminal update.
    pub fn upload(&self, upload: AttachmentUpload) -> BResult<Receiver<Update>> {
        let (tx, rx) = channel::unbounded();
        let progress = {
            let mut state = lock!(self.inner.state);
            if let Some(entry) = state.active.get_mut(&upload) {
                entry.observers.push(tx);
                return Ok(rx);
            }
            state.errors.remove(&upload);
            let progress = Progress::new(100);
            state.active.insert(upload.clone(), Entry {
                progress: progress.clone(),
                observers: vec![tx],
                last_progress: 0.0,
                started: false,
            });
            progress
        };
        info!("AttachmentUploader.upload() -- queueing {} ({})", upload.key, upload.library);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let job_upload = upload.clone();
        let job_progress = progress.clone();
        let queued = self.pool.run(move || {
            if let Some(inner) = weak.upgrade() {
                inner.run(job_upload, job_progress);
            }
        });
        if let Err(e) = queued {
            self.inner.finish(&upload, &progress, UpdateKind::Failed(Arc::new(e)));
        }
        Ok(rx)
    }

    /// Upload every attachment in a library that needs it, and wait for
    /// them all. One failing never stops the others.
    pub fn sync_library(&self, library: LibraryId, folder: &Path) -> BResult<Vec<(String, Result<(), Arc<BError>>)>> {
        let uploads = self.inner.storage.perform(&ReadAttachmentUploads {
            library,
            folder: folder.to_path_buf(),
        })?;
        if uploads.len() == 0 {
            return Ok(Vec::new());
        }
        info!("AttachmentUploader.sync_library() -- {} uploads for {}", uploads.len(), library);
        let mut pending = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let rx = self.upload(upload.clone())?;
            pending.push((upload, rx));
        }
        let mut results = Vec::with_capacity(pending.len());
        for (upload, rx) in pending {
            let mut result = Err(Arc::new(BError::Cancelled));
            for update in rx.iter() {
                match update.kind {
                    UpdateKind::Progress(_) => continue,
                    UpdateKind::Ready => result = Ok(()),
                    UpdateKind::Cancelled => {}
                    UpdateKind::Failed(err) => result = Err(err),
                }
                break;
            }
            results.push((upload.key, result));
        }
        Ok(results)
    }

    /// Stop an upload. A queued one ends right away; a running one stops
    /// before its next step and reports through its own observers.
    ///
    /// Returns false when nothing was in flight for this upload. Only global
    /// subscribers hear about it then.
    pub fn cancel(&self, upload: &AttachmentUpload) -> bool {
        let mut guard = lock!(self.inner.state);
        let state = &mut *guard;
        let (progress, started) = match state.active.get(upload) {
            Some(entry) => (entry.progress.clone(), entry.started),
            None => {
                let update = update(upload, UpdateKind::Cancelled);
                state.subscribers.retain(|x| x.send(update.clone()).is_ok());
                return false;
            }
        };
        info!("AttachmentUploader.cancel() -- cancelling {} ({})", upload.key, upload.library);
        progress.cancel();
        // no worker has it yet, so nobody else will report it
        if !started {
            Inner::finish_locked(state, upload, &progress, UpdateKind::Cancelled);
        }
        true
    }

    /// Progress and last error for one upload
    pub fn data(&self, upload: &AttachmentUpload) -> (Option<f64>, Option<Arc<BError>>) {
        let state = lock!(self.inner.state);
        let progress = state.active.get(upload).map(|x| x.progress.fraction());
        (progress, state.errors.get(upload).cloned())
    }

    pub fn subscribe(&self) -> Receiver<Update> {
        let (tx, rx) = channel::unbounded();
        lock!(self.inner.state).subscribers.push(tx);
        rx
    }
}
