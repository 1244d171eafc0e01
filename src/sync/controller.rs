//! The sync controller. One run works through a queue of `Action`s: load
//! permissions, bring the group list up to date, then for each library pull
//! everything down (planner, batches, settings, deletions) and push local
//! changes up. Failures are scoped by `BError::class()`: a fatal error ends
//! the run, a library error ends that library, a bad object just gets
//! skipped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::api::{FileBackends, RemoteApi};
use crate::config;
use crate::error::{BResult, BError, ErrorClass};
use crate::models::batch::DeleteBatch;
use crate::models::file_sync;
use crate::models::library::{AccessLevel, Library, LibraryId, LibrarySyncType, VersionField};
use crate::models::object::ObjectType;
use crate::models::response::{KeyPermissions, ObjectResponse};
use crate::schema::{PermissiveSchema, SchemaValidator};
use crate::storage::Storage;
use crate::storage::requests::{
    ApplyResolutions, ClearFileDeletions, DeleteLibrary, DeleteObjects,
    MarkChangesAsResolved, MarkForResync, MarkLibraryLocalOnly,
    MarkObjectsAsSynced, MarkUploadFailed, PurgeUnsyncedDeletions,
    QueueFileDeletions, ReadAttachmentUploads, ReadDeletions, ReadFileDeletions,
    ReadLibraries, ReadLibrary, ReadUpdates, RevertAttachmentFiles,
    RevertLibraryUpdates, StoreLibrary, StoreObjects, StoreResult,
    SyncGroupVersions, UpdateVersion,
};
use crate::sync::{DeferredObject, NonFatalError, SyncOutcome, SyncReport, SyncType};
use crate::sync::action::{Action, CreateLibraryActionsOptions};
use crate::sync::conflict::{self, ConflictResolver, DefaultResolver, RemovedGroupChoice, WriteDeniedChoice};
use crate::sync::files::downloader::{AttachmentDownloader, DownloadRequest};
use crate::sync::files::uploader::AttachmentUploader;
use crate::sync::planner::{self, Planner};
use crate::sync::retry::{self, RetryDecision, RetryPolicy};
use crate::util;
use crate::util::stopper::Stopper;

/// Object types whose local deletions get pushed, in order
const DELETE_ORDER: [ObjectType; 3] = [ObjectType::Collection, ObjectType::Search, ObjectType::Item];

type FinishHandler = Box<dyn Fn(&SyncReport) + Send + Sync>;

pub struct SyncController {
    storage: Arc<Storage>,
    api: Arc<dyn RemoteApi>,
    schema: Arc<dyn SchemaValidator>,
    resolver: Arc<dyn ConflictResolver>,
    uploader: Option<Arc<AttachmentUploader>>,
    downloader: Option<Arc<AttachmentDownloader>>,
    /// where stored files of deleted attachments get removed from
    files: Option<FileBackends>,
    policy: RetryPolicy,
    files_folder: PathBuf,
    download_automatically: bool,
    syncing: AtomicBool,
    stopper: Stopper,
    finish_handler: Mutex<Option<FinishHandler>>,
}

impl SyncController {
    /// Create a controller with the default schema/resolver and settings from
    /// the config.
    pub fn new(storage: Arc<Storage>, api: Arc<dyn RemoteApi>) -> SyncController {
        let folder: String = config::get_opt(&["files", "folder"]).unwrap_or_else(|| String::from("files"));
        SyncController {
            storage,
            api,
            schema: Arc::new(PermissiveSchema),
            resolver: Arc::new(DefaultResolver),
            uploader: None,
            downloader: None,
            files: None,
            policy: RetryPolicy::from_config(),
            files_folder: PathBuf::from(folder),
            download_automatically: config::get_opt(&["files", "download_automatically"]).unwrap_or(false),
            syncing: AtomicBool::new(false),
            stopper: Stopper::new(),
            finish_handler: Mutex::new(None),
        }
    }

    pub fn with_schema(mut self, schema: Arc<dyn SchemaValidator>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<AttachmentUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<AttachmentDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_file_backends(mut self, backends: FileBackends) -> Self {
        self.files = Some(backends);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_files_folder(mut self, folder: PathBuf) -> Self {
        self.files_folder = folder;
        self
    }

    pub fn with_automatic_downloads(mut self, enabled: bool) -> Self {
        self.download_automatically = enabled;
        self
    }

    /// Called with the report at the end of every run
    pub fn on_finish<F>(self, handler: F) -> Self
        where F: Fn(&SyncReport) + Send + Sync + 'static
    {
        *lock!(self.finish_handler) = Some(Box::new(handler));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Run one sync. Only one runs at a time: a second caller gets
    /// `TryAgain`. The report comes back even when the run was aborted.
    pub fn sync(&self, sync_type: SyncType, libraries: LibrarySyncType) -> BResult<SyncReport> {
        if self.syncing.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            info!("SyncController.sync() -- already syncing");
            return Err(BError::TryAgain);
        }
        self.stopper.reset();
        info!("SyncController.sync() -- starting {:?} sync of {:?}", sync_type, libraries);
        let report = Run::new(self, sync_type, libraries).execute();
        self.syncing.store(false, Ordering::SeqCst);
        info!("SyncController.sync() -- finished: {:?} ({} actions, {} errors, {} deferred)", report.outcome, report.actions.len(), report.errors.len(), report.deferred.len());
        if let Some(ref handler) = *lock!(self.finish_handler) {
            handler(&report);
        }
        Ok(report)
    }

    /// Stop the current run (and any wait between retries) as soon as
    /// possible.
    pub fn cancel(&self) {
        info!("SyncController.cancel() -- stopping");
        self.stopper.stop();
    }

    /// Wait out a retry delay. Returns false if cancelled first.
    pub fn wait(&self, delay: Duration) -> bool {
        self.stopper.wait(delay)
    }
}

/// Per-library bookkeeping for the current pass
#[derive(Default)]
struct LibraryPass {
    /// the library version the remote reported during this pass
    known_version: Option<i64>,
    /// version to send with the next write
    write_version: Option<i64>,
    stored: HashSet<(ObjectType, String)>,
    restored: HashSet<(ObjectType, String)>,
    retries: u32,
    conflicts: u32,
}

struct Run<'a> {
    ctl: &'a SyncController,
    sync_type: SyncType,
    libraries: LibrarySyncType,
    queue: VecDeque<Action>,
    actions: Vec<Action>,
    errors: Vec<NonFatalError>,
    deferred: Vec<DeferredObject>,
    delays: Vec<Duration>,
    fatal: Option<Arc<BError>>,
    permissions: Option<KeyPermissions>,
    passes: HashMap<LibraryId, LibraryPass>,
    /// libraries done for this run
    aborted: HashSet<LibraryId>,
    /// global actions get retried too
    global_retries: u32,
    writes_attempted: bool,
    writes_reached: bool,
    push_failed_libraries: Vec<LibraryId>,
    compensated: bool,
}

impl<'a> Run<'a> {
    fn new(ctl: &'a SyncController, sync_type: SyncType, libraries: LibrarySyncType) -> Run<'a> {
        let mut queue = VecDeque::new();
        queue.push_back(Action::LoadKeyPermissions);
        queue.push_back(Action::SyncGroupVersions);
        let opts = if sync_type.is_full() {
            CreateLibraryActionsOptions::ForceDownloads
        } else {
            CreateLibraryActionsOptions::Automatic
        };
        queue.push_back(Action::CreateLibraryActions(libraries.clone(), opts));
        Run {
            ctl,
            sync_type,
            libraries,
            queue,
            actions: Vec::new(),
            errors: Vec::new(),
            deferred: Vec::new(),
            delays: Vec::new(),
            fatal: None,
            permissions: None,
            passes: HashMap::new(),
            aborted: HashSet::new(),
            global_retries: 0,
            writes_attempted: false,
            writes_reached: false,
            push_failed_libraries: Vec::new(),
            compensated: false,
        }
    }

    fn pass(&mut self, library: LibraryId) -> &mut LibraryPass {
        self.passes.entry(library).or_insert_with(Default::default)
    }

    fn execute(mut self) -> SyncReport {
        loop {
            let action = match self.queue.pop_front() {
                Some(x) => x,
                None => {
                    if self.queue_compensating_pass() { continue; }
                    break;
                }
            };
            if self.ctl.stopper.stopped() {
                self.fatal = Some(Arc::new(BError::Cancelled));
                break;
            }
            if let Some(lib) = action.library() {
                if self.aborted.contains(&lib) { continue; }
            }
            debug!("SyncController -- {}", action);
            self.actions.push(action.clone());
            let res = self.process(&action);
            match res {
                Ok(_) | Err(BError::NotModified) => {}
                Err(e) => {
                    if !self.handle_error(&action, e) { break; }
                }
            }
        }
        self.report()
    }

    /// If nothing we tried to push got through, look at the remote anyway so
    /// we know whether we're behind.
    fn queue_compensating_pass(&mut self) -> bool {
        if self.compensated || !self.writes_attempted || self.writes_reached || self.push_failed_libraries.len() == 0 {
            return false;
        }
        self.compensated = true;
        let libs = self.push_failed_libraries.clone();
        warn!("SyncController -- no writes reached the remote, downloading {:?} anyway", libs);
        for lib in libs {
            self.aborted.remove(&lib);
            let pass = self.pass(lib);
            pass.retries = 0;
            pass.known_version = None;
            self.queue.push_back(Action::CreateLibraryActions(LibrarySyncType::Specific(vec![lib]), CreateLibraryActionsOptions::OnlyDownloads));
        }
        true
    }

    fn report(self) -> SyncReport {
        let aborted = self.aborted;
        let errors = self.errors.into_iter()
            .map(|mut err| {
                if err.error.class() == ErrorClass::Precondition && !aborted.contains(&err.library) {
                    err.recovered = true;
                }
                err
            })
            .collect::<Vec<_>>();
        let outcome = if self.fatal.is_some() {
            SyncOutcome::Aborted
        } else if errors.iter().any(|x| !x.recovered) {
            SyncOutcome::PartialFailure
        } else if self.deferred.len() > 0 {
            SyncOutcome::SyncedWithDeferrals
        } else {
            SyncOutcome::Synced
        };
        SyncReport {
            outcome,
            actions: self.actions,
            errors,
            deferred: self.deferred,
            fatal: self.fatal,
            delays: self.delays,
            push_failed: self.compensated,
        }
    }

    // -------------------------------------------------------------------------
    // failures
    // -------------------------------------------------------------------------

    /// Sort out a failed action. Returns false if the run is over.
    fn handle_error(&mut self, action: &Action, err: BError) -> bool {
        let library = action.library();
        let class = match err.class() {
            // an object error that escaped to the action level takes out the
            // library, not the run
            ErrorClass::Object => ErrorClass::Library,
            x => x,
        };
        if class == ErrorClass::Transport && action.is_write() {
            if let Some(lib) = library {
                if !self.push_failed_libraries.contains(&lib) {
                    self.push_failed_libraries.push(lib);
                }
            }
        }
        let lib = match library {
            Some(x) => x,
            None => return self.handle_global_error(action, err, class),
        };
        let attempt = match class {
            ErrorClass::Precondition => self.pass(lib).conflicts,
            _ => self.pass(lib).retries,
        };
        let decision = match class {
            // version mismatches and friends don't get better by waiting
            ErrorClass::Library => RetryDecision::AbortLibrary,
            _ => retry::decide(attempt, class, &self.ctl.policy),
        };
        match decision {
            RetryDecision::AbortSync => {
                error!("SyncController -- {} failed, aborting sync: {}", action, err);
                self.fatal = Some(Arc::new(err));
                false
            }
            RetryDecision::AbortLibrary => {
                self.abort_library(lib, err);
                true
            }
            RetryDecision::RetryAfter(delay) => {
                if class == ErrorClass::Precondition {
                    warn!("SyncController -- {} changed remotely, re-running it after {:?}", lib, delay);
                    self.errors.push(NonFatalError { library: lib, error: Arc::new(err), recovered: false });
                    self.drop_library_actions(lib);
                    if !self.wait(delay) { return false; }
                    let pass = self.pass(lib);
                    pass.conflicts += 1;
                    pass.known_version = None;
                    pass.write_version = None;
                    self.queue.push_front(Action::CreateLibraryActions(LibrarySyncType::Specific(vec![lib]), CreateLibraryActionsOptions::OnlyWrites));
                    self.queue.push_front(Action::CreateLibraryActions(LibrarySyncType::Specific(vec![lib]), CreateLibraryActionsOptions::OnlyDownloads));
                } else {
                    warn!("SyncController -- {} failed, retrying after {:?}: {}", action, delay, err);
                    if !self.wait(delay) { return false; }
                    self.pass(lib).retries += 1;
                    self.queue.push_front(action.clone());
                }
                true
            }
        }
    }

    fn handle_global_error(&mut self, action: &Action, err: BError, class: ErrorClass) -> bool {
        if class == ErrorClass::Transport {
            if let RetryDecision::RetryAfter(delay) = retry::decide(self.global_retries, class, &self.ctl.policy) {
                warn!("SyncController -- {} failed, retrying after {:?}: {}", action, delay, err);
                if !self.wait(delay) { return false; }
                self.global_retries += 1;
                self.queue.push_front(action.clone());
                return true;
            }
        }
        error!("SyncController -- {} failed, aborting sync: {}", action, err);
        self.fatal = Some(Arc::new(err));
        false
    }

    fn wait(&mut self, delay: Duration) -> bool {
        self.delays.push(delay);
        if !self.ctl.wait(delay) {
            self.fatal = Some(Arc::new(BError::Cancelled));
            return false;
        }
        true
    }

    fn drop_library_actions(&mut self, lib: LibraryId) {
        self.queue.retain(|x| x.library() != Some(lib));
    }

    fn abort_library(&mut self, lib: LibraryId, err: BError) {
        error!("SyncController -- giving up on {} for this run: {}", lib, err);
        self.aborted.insert(lib);
        self.errors.push(NonFatalError { library: lib, error: Arc::new(err), recovered: false });
        self.drop_library_actions(lib);
    }

    fn defer(&mut self, library: LibraryId, object: ObjectType, key: String, error: BError) {
        debug!("SyncController -- deferring {} {} {}: {}", library, object, key, error);
        self.deferred.push(DeferredObject { library, object, key, error: Arc::new(error) });
    }

    /// Queue actions right after the current one, keeping their order
    fn push_next(&mut self, actions: Vec<Action>) {
        for action in actions.into_iter().rev() {
            self.queue.push_front(action);
        }
    }

    // -------------------------------------------------------------------------
    // actions
    // -------------------------------------------------------------------------

    fn process(&mut self, action: &Action) -> BResult<()> {
        match action {
            Action::LoadKeyPermissions => self.load_permissions(),
            Action::SyncGroupVersions => self.sync_group_versions(),
            Action::SyncGroupToDb(id) => self.sync_group(*id),
            Action::CreateLibraryActions(libs, opts) => self.create_library_actions(libs, *opts),
            Action::SyncVersions { library, object, force } => self.sync_versions(*library, *object, *force),
            Action::SyncBatchToDb(batch) => self.sync_batch(batch.library, batch.object, &batch.keys),
            Action::StoreVersion { library, field, version } => {
                self.ctl.storage.perform(&UpdateVersion { library: *library, field: *field, version: *version })?;
                Ok(())
            }
            Action::SyncSettings(library) => self.sync_settings(*library),
            Action::SyncDeletions(library) => self.sync_deletions(*library),
            Action::SubmitDeleteBatch(batch) => self.submit_deletions(batch),
            Action::SubmitWriteBatch(batch) => self.submit_writes(batch.library, batch.object, batch.version, &batch.keys, &batch.parameters),
            Action::SubmitFileDeletions(library) => self.submit_file_deletions(*library),
            Action::UploadAttachments(library) => self.upload_attachments(*library),
            Action::RevertLibraryFiles(library) => self.revert_library_files(*library),
            Action::ResolveDeletedGroup(id, name) => self.resolve_deleted_group(*id, name),
            Action::ResolveGroupMetadataWritePermission(id, name) => self.resolve_write_permission(*id, name),
            Action::RevertLibraryToOriginal(library) => {
                let reverted = self.ctl.storage.perform(&RevertLibraryUpdates { library: *library })?;
                info!("SyncController -- reverted {} objects in {}", reverted, library);
                self.push_next(vec![Action::CreateLibraryActions(LibrarySyncType::Specific(vec![*library]), CreateLibraryActionsOptions::OnlyDownloads)]);
                Ok(())
            }
            Action::MarkChangesAsResolved(library) => {
                self.ctl.storage.perform(&MarkChangesAsResolved { library: *library })?;
                Ok(())
            }
            Action::DeleteGroup(id) => {
                self.ctl.storage.perform(&DeleteLibrary(LibraryId::Group(*id)))?;
                Ok(())
            }
            Action::MarkGroupAsLocalOnly(id) => {
                self.ctl.storage.perform(&MarkLibraryLocalOnly(LibraryId::Group(*id)))?;
                Ok(())
            }
        }
    }

    fn load_permissions(&mut self) -> BResult<()> {
        let permissions = self.ctl.api.load_permissions()?;
        let access = AccessLevel::from_permissions(permissions.user.write, permissions.user.files);
        let library = match self.ctl.storage.perform(&ReadLibrary(LibraryId::Personal))? {
            Some(mut lib) => {
                lib.access = access;
                lib
            }
            None => Library::new(LibraryId::Personal, "My Library", access),
        };
        self.ctl.storage.perform(&StoreLibrary(library))?;
        self.permissions = Some(permissions);
        Ok(())
    }

    fn sync_group_versions(&mut self) -> BResult<()> {
        let versions = self.ctl.api.group_versions()?;
        let res = self.ctl.storage.perform(&SyncGroupVersions { versions })?;
        let mut next = Vec::new();
        for (id, name) in res.removed {
            next.push(Action::ResolveDeletedGroup(id, name));
        }
        for id in res.to_update {
            next.push(Action::SyncGroupToDb(id));
        }
        self.push_next(next);
        Ok(())
    }

    fn sync_group(&mut self, id: i64) -> BResult<()> {
        let group = self.ctl.api.group(id)?;
        let permissions = self.permissions.clone().unwrap_or_default();
        let (meta, files) = group.access(permissions.user_id, &permissions.group(id));
        let access = AccessLevel::from_permissions(meta, files);
        let library = match self.ctl.storage.perform(&ReadLibrary(LibraryId::Group(id)))? {
            Some(mut lib) => {
                lib.name = group.name.clone();
                lib.access = access;
                lib.meta_version = group.version;
                lib
            }
            None => {
                let mut lib = Library::new(LibraryId::Group(id), &group.name, access);
                lib.meta_version = group.version;
                lib
            }
        };
        info!("SyncController -- group {} ({}) is {}", group.name, id, access.as_str());
        self.ctl.storage.perform(&StoreLibrary(library))?;
        Ok(())
    }

    fn create_library_actions(&mut self, libs: &LibrarySyncType, opts: CreateLibraryActionsOptions) -> BResult<()> {
        let libraries = self.ctl.storage.perform(&ReadLibraries { ids: None })?;
        let mut next = Vec::new();
        for lib in libraries {
            if !libs.includes(&lib.id) || !self.libraries.includes(&lib.id) { continue; }
            if lib.local_only || self.aborted.contains(&lib.id) { continue; }
            let single = LibrarySyncType::Specific(vec![lib.id]);
            if opts.downloads() {
                let force = opts == CreateLibraryActionsOptions::ForceDownloads || self.sync_type.is_full();
                for object in ObjectType::DOWNLOAD_ORDER.iter() {
                    next.push(Action::SyncVersions { library: lib.id, object: *object, force });
                }
                next.push(Action::SyncSettings(lib.id));
                next.push(Action::SyncDeletions(lib.id));
                if opts.writes() {
                    // writes get planned once the downloads are in
                    next.push(Action::CreateLibraryActions(single, CreateLibraryActionsOptions::OnlyWrites));
                }
            } else if opts.writes() {
                next.extend(self.write_actions(&lib)?);
            }
        }
        self.push_next(next);
        Ok(())
    }

    /// Plan the write pass of a library: deletions, then changed objects,
    /// then attachment files.
    fn write_actions(&mut self, lib: &Library) -> BResult<Vec<Action>> {
        let storage = &self.ctl.storage;
        let max_attempts = self.ctl.policy.max_object_retries;
        let version = lib.versions.max();
        storage.perform(&PurgeUnsyncedDeletions { library: lib.id })?;
        let mut deletes = Vec::new();
        for object in DELETE_ORDER.iter() {
            let keys = storage.perform(&ReadDeletions { library: lib.id, object: *object })?;
            deletes.extend(DeleteBatch::chunk(lib.id, *object, version, &keys).into_iter().map(Action::SubmitDeleteBatch));
        }
        let mut writes = Vec::new();
        for object in ObjectType::WRITE_ORDER.iter() {
            let updates = storage.perform(&ReadUpdates { library: lib.id, object: *object, max_attempts })?;
            writes.extend(planner::plan_writes(lib.id, *object, version, updates).into_iter().map(Action::SubmitWriteBatch));
        }
        let file_actions = self.file_actions(lib, &deletes)?;

        let mut actions = Vec::new();
        if deletes.len() + writes.len() > 0 {
            if !lib.access.can_edit_metadata() {
                match lib.id {
                    LibraryId::Group(id) => actions.push(Action::ResolveGroupMetadataWritePermission(id, lib.name.clone())),
                    LibraryId::Personal => warn!("SyncController -- personal library is read-only, not pushing {} batches", deletes.len() + writes.len()),
                }
                actions.extend(file_actions.into_iter().filter(|x| !x.is_write()));
                return Ok(actions);
            }
            info!("SyncController -- {}: {} delete batches, {} write batches", lib.id, deletes.len(), writes.len());
            actions.extend(deletes);
            actions.extend(writes);
        }
        actions.extend(file_actions);
        Ok(actions)
    }

    /// The attachment file half of a write pass. Files go after metadata, so
    /// these always come last.
    fn file_actions(&self, lib: &Library, deletes: &[Action]) -> BResult<Vec<Action>> {
        let storage = &self.ctl.storage;
        let mut actions = Vec::new();
        let webdav = self.ctl.files.as_ref().and_then(|x| x.webdav_for(lib.id));
        if webdav.is_some() {
            let deletes_items = deletes.iter().any(|x| match x {
                Action::SubmitDeleteBatch(batch) => batch.object == ObjectType::Item,
                _ => false,
            });
            if deletes_items || storage.perform(&ReadFileDeletions(lib.id))?.len() > 0 {
                actions.push(Action::SubmitFileDeletions(lib.id));
            }
        }
        if lib.access.can_edit_files() {
            if self.ctl.uploader.is_some() {
                actions.push(Action::UploadAttachments(lib.id));
            }
        } else {
            let pending = storage.perform(&ReadAttachmentUploads { library: lib.id, folder: self.ctl.files_folder.clone() })?;
            if pending.len() > 0 {
                actions.push(Action::RevertLibraryFiles(lib.id));
            }
        }
        Ok(actions)
    }

    fn library(&self, id: LibraryId) -> BResult<Library> {
        match self.ctl.storage.perform(&ReadLibrary(id))? {
            Some(x) => Ok(x),
            None => Err(BError::NotFound(format!("SyncController -- library {}", id))),
        }
    }

    /// Make sure a version the remote sent matches what it said earlier in
    /// this pass, and remember it if it's the first.
    fn check_version(&mut self, library: LibraryId, version: i64) -> BResult<()> {
        let pass = self.pass(library);
        match pass.known_version {
            Some(known) if known != version => {
                warn!("SyncController -- {} moved from {} to {} mid-sync", library, known, version);
                Err(BError::VersionMismatch(library))
            }
            Some(_) => Ok(()),
            None => {
                pass.known_version = Some(version);
                Ok(())
            }
        }
    }

    fn sync_versions(&mut self, library: LibraryId, object: ObjectType, force: bool) -> BResult<()> {
        let lib = self.library(library)?;
        let since = if self.sync_type.is_full() {
            None
        } else {
            Some(lib.versions.get(VersionField::Object(object)))
        };
        let known = self.pass(library).known_version;
        let plan = {
            let planner = Planner::new(&self.ctl.storage, &*self.ctl.api, &self.ctl.policy, self.sync_type);
            planner.plan(library, object, since, force, known)?
        };
        if plan.checked_remote && known.is_none() {
            self.pass(library).known_version = Some(plan.library_version);
        }
        if plan.dirty.len() > 0 {
            debug!("SyncController -- {} {}: {} local changes waiting for the write pass", library, object, plan.dirty.len());
        }
        let mut next = plan.batches.into_iter()
            .map(Action::SyncBatchToDb)
            .collect::<Vec<_>>();
        next.push(Action::StoreVersion {
            library,
            field: VersionField::Object(object),
            version: plan.library_version,
        });
        self.push_next(next);
        Ok(())
    }

    /// Write what came down into the store, remembering what we stored for
    /// the deletion pass.
    fn store(&mut self, library: LibraryId, responses: Vec<ObjectResponse>) -> BResult<StoreResult> {
        let result = self.ctl.storage.perform(&StoreObjects { library, responses })?;
        Ok(result)
    }

    fn note_stored(&mut self, library: LibraryId, object: ObjectType, result: &StoreResult) {
        let storage_type = object.storage_type();
        let pass = self.pass(library);
        for key in &result.stored {
            pass.stored.insert((storage_type, key.clone()));
        }
        for key in &result.restored {
            pass.restored.insert((storage_type, key.clone()));
        }
    }

    fn sync_batch(&mut self, library: LibraryId, object: ObjectType, keys: &[String]) -> BResult<()> {
        let res = self.ctl.api.objects(library, object, keys)?;
        self.check_version(library, res.version)?;
        let (good, bad) = conflict::check_objects(&*self.ctl.schema, object, &res.data);
        let mut rejected = Vec::new();
        for reject in bad {
            let key = reject.key.unwrap_or_else(String::new);
            if key.len() > 0 {
                rejected.push(key.clone());
            }
            self.defer(library, object, key, reject.error);
        }
        if rejected.len() > 0 {
            self.ctl.storage.perform(&MarkForResync { library, object, keys: rejected, now: util::now() })?;
        }
        let result = self.store(library, good)?;
        debug!("SyncController -- {} {}: stored {}, restored {}, merged {}", library, object, result.stored.len(), result.restored.len(), result.merged.len());
        self.note_stored(library, object, &result);
        self.queue_downloads(library, &result.changed_files);
        Ok(())
    }

    /// Fetch (key, parent, filename) attachment files, if downloads happen
    /// on their own
    fn queue_downloads(&self, library: LibraryId, files: &[(String, Option<String>, String)]) {
        if !self.ctl.download_automatically || files.len() == 0 { return; }
        let downloader = match self.ctl.downloader {
            Some(ref x) => x,
            None => return,
        };
        let requests = files.iter()
            .map(|(key, parent, filename)| {
                let file = file_sync::attachment_path(&self.ctl.files_folder, library, key, filename);
                DownloadRequest::new(key, parent.as_ref().map(|x| x.as_str()), library, file)
            })
            .collect::<Vec<_>>();
        info!("SyncController -- queueing {} attachment downloads for {}", requests.len(), library);
        if let Err(e) = downloader.batch_download(requests) {
            warn!("SyncController -- couldn't queue downloads: {}", e);
        }
    }

    fn sync_settings(&mut self, library: LibraryId) -> BResult<()> {
        let lib = self.library(library)?;
        let since = if self.sync_type.is_full() { None } else { Some(lib.versions.settings) };
        let res = self.ctl.api.settings(library, since)?;
        self.check_version(library, res.version)?;
        let mut keys = res.data.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        let mut good = Vec::with_capacity(keys.len());
        for key in keys {
            match res.data.get(&key).map(|x| ObjectResponse::parse_setting(&key, x)) {
                Some(Ok(x)) => good.push(x),
                Some(Err(e)) => self.defer(library, ObjectType::Setting, key, e),
                None => {}
            }
        }
        let result = self.store(library, good)?;
        self.note_stored(library, ObjectType::Setting, &result);
        self.ctl.storage.perform(&UpdateVersion {
            library,
            field: VersionField::Object(ObjectType::Setting),
            version: res.version,
        })?;
        Ok(())
    }

    fn sync_deletions(&mut self, library: LibraryId) -> BResult<()> {
        let lib = self.library(library)?;
        let res = self.ctl.api.deletions(library, lib.versions.deletions)?;
        self.check_version(library, res.version)?;
        if !res.data.is_empty() {
            let (stored, restored) = {
                let pass = self.pass(library);
                (pass.stored.clone(), pass.restored.clone())
            };
            let mut resolutions = Vec::new();
            for object in [ObjectType::Collection, ObjectType::Search, ObjectType::Item, ObjectType::Setting].iter() {
                resolutions.extend(conflict::plan_deletions(
                    &self.ctl.storage,
                    &*self.ctl.resolver,
                    library,
                    *object,
                    res.data.keys(*object),
                    &stored,
                    &restored,
                )?);
            }
            if resolutions.len() > 0 {
                let applied = self.ctl.storage.perform(&ApplyResolutions { library, resolutions, now: util::now() })?;
                info!("SyncController -- {}: applied {} remote deletions", library, applied);
            }
        }
        self.ctl.storage.perform(&UpdateVersion { library, field: VersionField::Deletions, version: res.version })?;
        Ok(())
    }

    fn submit_deletions(&mut self, batch: &DeleteBatch) -> BResult<()> {
        let library = batch.library;
        let version = self.pass(library).write_version.unwrap_or(batch.version);
        self.writes_attempted = true;
        let new_version = self.ctl.api.submit_deletions(library, batch.object, version, &batch.keys)?;
        self.writes_reached = true;
        let webdav = self.ctl.files.as_ref().and_then(|x| x.webdav_for(library));
        if batch.object == ObjectType::Item && webdav.is_some() {
            // the items are about to go, and with them what they knew about files
            let queued = self.ctl.storage.perform(&QueueFileDeletions { library, keys: batch.keys.clone() })?;
            debug!("SyncController -- {}: {} stored files to remove", library, queued);
        }
        self.ctl.storage.perform(&DeleteObjects { library, object: batch.object, keys: batch.keys.clone() })?;
        self.ctl.storage.perform(&UpdateVersion { library, field: VersionField::Object(batch.object), version: new_version })?;
        let pass = self.pass(library);
        pass.write_version = Some(new_version);
        pass.known_version = Some(new_version);
        info!("SyncController -- {}: deleted {} {} remotely (now at {})", library, batch.keys.len(), batch.object, new_version);
        Ok(())
    }

    fn submit_writes(&mut self, library: LibraryId, object: ObjectType, batch_version: i64, keys: &[String], parameters: &[serde_json::Value]) -> BResult<()> {
        let version = self.pass(library).write_version.unwrap_or(batch_version);
        self.writes_attempted = true;
        let res = self.ctl.api.submit_updates(library, object, version, keys, parameters)?;
        self.writes_reached = true;
        let storage = &self.ctl.storage;
        if res.data.successful.len() > 0 {
            storage.perform(&MarkObjectsAsSynced { library, object, keys: res.data.successful.clone(), version: Some(res.version) })?;
        }
        if res.data.unchanged.len() > 0 {
            storage.perform(&MarkObjectsAsSynced { library, object, keys: res.data.unchanged.clone(), version: None })?;
        }
        {
            let pass = self.pass(library);
            pass.write_version = Some(res.version);
            pass.known_version = Some(res.version);
        }
        if res.data.successful.len() > 0 {
            self.ctl.storage.perform(&UpdateVersion { library, field: VersionField::Object(object), version: res.version })?;
        }
        info!("SyncController -- {}: pushed {} {} ({} unchanged, {} failed), now at {}", library, res.data.successful.len(), object, res.data.unchanged.len(), res.data.failed.len(), res.version);

        let mut precondition = false;
        let mut failed_keys = Vec::new();
        for failed in res.data.failed {
            if failed.code == 412 {
                precondition = true;
                continue;
            }
            failed_keys.push(failed.key.clone());
            self.defer(library, object, failed.key.clone(), BError::ObjectRejected(failed.key, failed.code, failed.message));
        }
        if failed_keys.len() > 0 {
            self.ctl.storage.perform(&MarkUploadFailed { library, object, keys: failed_keys })?;
        }
        if precondition {
            return Err(BError::PreconditionFailed(library));
        }
        Ok(())
    }

    /// Remove stored files whose items are gone. Whatever doesn't go stays
    /// queued for the next run.
    fn submit_file_deletions(&mut self, library: LibraryId) -> BResult<()> {
        let backend = match self.ctl.files.as_ref().and_then(|x| x.webdav_for(library)) {
            Some(x) => x,
            None => return Ok(()),
        };
        let keys = self.ctl.storage.perform(&ReadFileDeletions(library))?;
        if keys.len() == 0 { return Ok(()); }
        match backend.delete(library, &keys) {
            Ok(deleted) => {
                if deleted.len() < keys.len() {
                    warn!("SyncController -- {}: {} stored files didn't delete, trying next sync", library, keys.len() - deleted.len());
                }
                info!("SyncController -- {}: removed {} stored files", library, deleted.len());
                self.ctl.storage.perform(&ClearFileDeletions { library, keys: deleted })?;
            }
            Err(e) => warn!("SyncController -- {}: couldn't remove {} stored files, trying next sync: {}", library, keys.len(), e),
        }
        Ok(())
    }

    /// Local file changes in a library we can't upload to get thrown out,
    /// and the remote's copy comes back down.
    fn revert_library_files(&mut self, library: LibraryId) -> BResult<()> {
        let uploads = self.ctl.storage.perform(&ReadAttachmentUploads { library, folder: self.ctl.files_folder.clone() })?;
        if uploads.len() == 0 { return Ok(()); }
        let keys = uploads.iter().map(|x| x.key.clone()).collect::<Vec<_>>();
        let reverted = self.ctl.storage.perform(&RevertAttachmentFiles { library, keys })?;
        for upload in &uploads {
            if !reverted.iter().any(|(key, _, _)| key == &upload.key) { continue; }
            match fs::remove_file(&upload.file) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("SyncController -- couldn't remove {:?}: {}", upload.file, e),
            }
        }
        info!("SyncController -- {}: reverted {} attachment files, {} to fetch again", library, uploads.len(), reverted.len());
        self.queue_downloads(library, &reverted);
        Ok(())
    }

    fn upload_attachments(&mut self, library: LibraryId) -> BResult<()> {
        let uploader = match self.ctl.uploader {
            Some(ref x) => x.clone(),
            None => return Ok(()),
        };
        let results = uploader.sync_library(library, &self.ctl.files_folder)?;
        for (key, result) in results {
            self.writes_attempted = true;
            match result {
                Ok(_) => self.writes_reached = true,
                Err(err) => {
                    if err.is_cancelled() { continue; }
                    if err.class() == ErrorClass::Transport {
                        if !self.push_failed_libraries.contains(&library) {
                            self.push_failed_libraries.push(library);
                        }
                    }
                    warn!("SyncController -- attachment {} in {} didn't upload: {}", key, library, err);
                    self.deferred.push(DeferredObject { library, object: ObjectType::Item, key, error: err });
                }
            }
        }
        Ok(())
    }

    fn resolve_deleted_group(&mut self, id: i64, name: &str) -> BResult<()> {
        let choice = self.ctl.resolver.resolve_removed_group(id, name);
        info!("SyncController -- group {} ({}) was removed remotely: {:?}", name, id, choice);
        match choice {
            RemovedGroupChoice::Delete => self.push_next(vec![Action::DeleteGroup(id)]),
            RemovedGroupChoice::KeepLocalOnly => self.push_next(vec![Action::MarkGroupAsLocalOnly(id)]),
            RemovedGroupChoice::Skip => {
                let lib = LibraryId::Group(id);
                self.aborted.insert(lib);
                self.errors.push(NonFatalError {
                    library: lib,
                    error: Arc::new(BError::GroupRemoved(id, String::from(name))),
                    recovered: false,
                });
            }
        }
        Ok(())
    }

    fn resolve_write_permission(&mut self, id: i64, name: &str) -> BResult<()> {
        let lib = LibraryId::Group(id);
        let choice = self.ctl.resolver.resolve_write_denied(id, name);
        info!("SyncController -- no write access to group {} ({}): {:?}", name, id, choice);
        match choice {
            WriteDeniedChoice::RevertToOriginal => self.push_next(vec![Action::RevertLibraryToOriginal(lib)]),
            WriteDeniedChoice::MarkAsResolved => self.push_next(vec![Action::MarkChangesAsResolved(lib)]),
            WriteDeniedChoice::Skip => {
                self.errors.push(NonFatalError {
                    library: lib,
                    error: Arc::new(BError::GroupWriteDenied(id, String::from(name))),
                    recovered: false,
                });
            }
        }
        Ok(())
    }
}
