extern crate bibsync_core;
extern crate crossbeam;
#[macro_use]
extern crate serde_json;
extern crate tempfile;
extern crate zip;

use ::std::collections::{HashMap, HashSet};
use ::std::fs::File;
use ::std::io::Write;
use ::std::path::Path;
use ::std::sync::{Arc, Mutex};
use ::std::thread;
use ::std::time::Duration;

use bibsync_core::BError;
use crossbeam::channel::Receiver;
use bibsync_core::api::{FileBackend, RemoteApi, TransferSink, Versioned};
use bibsync_core::error::BResult;
use bibsync_core::models::file_sync::{AttachmentUpload, Update, UpdateKind};
use bibsync_core::models::library::{AccessLevel, Library, LibraryId, VersionField};
use bibsync_core::models::object::{ObjectType, SyncObject};
use bibsync_core::models::response::{
    AuthorizeUploadResponse, DeletionsResponse, FailedUpdate, GroupResponse,
    KeyPermissions, UpdatesResponse, UploadAuthorization,
};
use bibsync_core::storage::Storage;
use bibsync_core::storage::requests::{SaveObject, StoreLibrary, UpdateVersion};
use bibsync_core::sync::retry::RetryPolicy;
use serde_json::Value;

pub fn sleep(millis: u64) {
    thread::sleep(Duration::from_millis(millis));
}

/// One write the remote saw, accepted or not
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub library: LibraryId,
    pub object: ObjectType,
    pub version: i64,
    pub keys: Vec<String>,
    pub deletion: bool,
}

#[derive(Default)]
pub struct RemoteLibrary {
    pub version: i64,
    /// (storage type, key) -> (version, full data)
    pub objects: HashMap<(ObjectType, String), (i64, Value)>,
    pub deleted: Vec<(ObjectType, String, i64)>,
}

pub struct FakeState {
    pub libraries: HashMap<LibraryId, RemoteLibrary>,
    pub groups: HashMap<i64, Value>,
    pub permissions: Value,
    pub submissions: Vec<Submission>,
    /// objects that come back without their data
    pub broken: HashSet<String>,
    /// keys the remote refuses to write: key -> (code, message)
    pub rejected: HashMap<String, (u16, String)>,
    /// the next n writes fail at the transport level
    pub write_failures: u32,
    /// runs once, right before the next write is looked at
    pub before_write: Option<Box<dyn FnOnce(&mut FakeState) + Send>>,
    /// permission loading hangs while set
    pub stalled: bool,
}

/// An in-memory remote that keeps versions the way the real one does
pub struct FakeRemote {
    pub state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> FakeRemote {
        let mut libraries = HashMap::new();
        libraries.insert(LibraryId::Personal, RemoteLibrary::default());
        FakeRemote {
            state: Mutex::new(FakeState {
                libraries,
                groups: HashMap::new(),
                permissions: json!({
                    "userID": 1,
                    "access": {
                        "user": {"library": true, "write": true, "files": true},
                        "groups": {"all": {"library": true, "write": true}},
                    },
                }),
                submissions: Vec::new(),
                broken: HashSet::new(),
                rejected: HashMap::new(),
                write_failures: 0,
                before_write: None,
                stalled: false,
            }),
        }
    }

    /// Put an object on the remote at `version`, moving the library along
    pub fn put(&self, library: LibraryId, object: ObjectType, key: &str, version: i64, data: Value) {
        let mut state = self.state.lock().unwrap();
        put_object(&mut state, library, object, key, version, data);
    }

    pub fn add_group(&self, id: i64, version: i64, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.groups.insert(id, json!({"id": id, "version": version, "data": {"name": name, "owner": 99}}));
        state.libraries.entry(LibraryId::Group(id)).or_insert_with(RemoteLibrary::default);
    }

    /// Only admins may edit files in this group, and we aren't one
    pub fn restrict_files(&self, id: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(group) = state.groups.get_mut(&id) {
            group["data"]["fileEditing"] = json!("admins");
        }
    }

    pub fn version(&self, library: LibraryId) -> i64 {
        let state = self.state.lock().unwrap();
        state.libraries.get(&library).map(|x| x.version).unwrap_or(0)
    }

    pub fn data(&self, library: LibraryId, object: ObjectType, key: &str) -> Option<(i64, Value)> {
        let state = self.state.lock().unwrap();
        state.libraries.get(&library)
            .and_then(|x| x.objects.get(&(object, String::from(key))))
            .cloned()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn fail_writes(&self, times: u32) {
        self.state.lock().unwrap().write_failures = times;
    }

    pub fn break_object(&self, key: &str) {
        self.state.lock().unwrap().broken.insert(String::from(key));
    }

    pub fn stall(&self, stalled: bool) {
        self.state.lock().unwrap().stalled = stalled;
    }

    pub fn before_write<F>(&self, hook: F)
        where F: FnOnce(&mut FakeState) + Send + 'static
    {
        self.state.lock().unwrap().before_write = Some(Box::new(hook));
    }
}

pub fn put_object(state: &mut FakeState, library: LibraryId, object: ObjectType, key: &str, version: i64, mut data: Value) {
    if let Some(obj) = data.as_object_mut() {
        obj.insert(String::from("key"), json!(key));
        obj.insert(String::from("version"), json!(version));
    }
    let lib = state.libraries.entry(library).or_insert_with(RemoteLibrary::default);
    lib.objects.insert((object.storage_type(), String::from(key)), (version, data));
    if version > lib.version {
        lib.version = version;
    }
}

fn library<'a>(state: &'a mut FakeState, library: LibraryId) -> BResult<&'a mut RemoteLibrary> {
    match state.libraries.get_mut(&library) {
        Some(x) => Ok(x),
        None => Err(BError::Api(404, format!("no library {}", library))),
    }
}

/// Run the write hooks and injected failures, then check the version
fn precheck_write(state: &mut FakeState, lib: LibraryId, version: i64) -> BResult<()> {
    if let Some(hook) = state.before_write.take() {
        hook(&mut *state);
    }
    if state.write_failures > 0 {
        state.write_failures -= 1;
        return Err(BError::Transport(String::from("connection reset")));
    }
    let current = library(state, lib)?.version;
    if version != current {
        return Err(BError::PreconditionFailed(lib));
    }
    Ok(())
}

impl RemoteApi for FakeRemote {
    fn load_permissions(&self) -> BResult<KeyPermissions> {
        while self.state.lock().unwrap().stalled {
            sleep(5);
        }
        let state = self.state.lock().unwrap();
        KeyPermissions::parse(&state.permissions)
    }

    fn group_versions(&self) -> BResult<HashMap<i64, i64>> {
        let state = self.state.lock().unwrap();
        Ok(state.groups.iter()
            .map(|(id, group)| (*id, group["version"].as_i64().unwrap_or(0)))
            .collect())
    }

    fn group(&self, group_id: i64) -> BResult<GroupResponse> {
        let state = self.state.lock().unwrap();
        match state.groups.get(&group_id) {
            Some(x) => GroupResponse::parse(x),
            None => Err(BError::Api(404, format!("no group {}", group_id))),
        }
    }

    fn versions(&self, lib: LibraryId, object: ObjectType, since: Option<i64>) -> BResult<Versioned<HashMap<String, i64>>> {
        let mut state = self.state.lock().unwrap();
        let remote = library(&mut state, lib)?;
        if let Some(since) = since {
            if remote.version <= since {
                return Err(BError::NotModified);
            }
        }
        let floor = since.unwrap_or(-1);
        let versions = remote.objects.iter()
            .filter(|((ty, _), _)| *ty == object.storage_type())
            .filter(|(_, (_, data))| object != ObjectType::Trash || data["deleted"] == json!(true))
            .filter(|(_, (version, _))| *version > floor)
            .map(|((_, key), (version, _))| (key.clone(), *version))
            .collect();
        Ok(Versioned::new(remote.version, versions))
    }

    fn objects(&self, lib: LibraryId, object: ObjectType, keys: &[String]) -> BResult<Versioned<Vec<Value>>> {
        let mut state = self.state.lock().unwrap();
        let broken = state.broken.clone();
        let remote = library(&mut state, lib)?;
        let mut entries = Vec::new();
        for key in keys {
            if let Some((version, data)) = remote.objects.get(&(object.storage_type(), key.clone())) {
                if broken.contains(key) {
                    entries.push(json!({"key": key, "version": version}));
                } else {
                    entries.push(json!({"key": key, "version": version, "data": data}));
                }
            }
        }
        Ok(Versioned::new(remote.version, entries))
    }

    fn deletions(&self, lib: LibraryId, since: i64) -> BResult<Versioned<DeletionsResponse>> {
        let mut state = self.state.lock().unwrap();
        let remote = library(&mut state, lib)?;
        if remote.version <= since {
            return Err(BError::NotModified);
        }
        let mut res = DeletionsResponse::default();
        for (ty, key, version) in &remote.deleted {
            if *version <= since { continue; }
            match ty {
                ObjectType::Collection => res.collections.push(key.clone()),
                ObjectType::Search => res.searches.push(key.clone()),
                ObjectType::Setting => res.settings.push(key.clone()),
                _ => res.items.push(key.clone()),
            }
        }
        Ok(Versioned::new(remote.version, res))
    }

    fn settings(&self, lib: LibraryId, since: Option<i64>) -> BResult<Versioned<HashMap<String, Value>>> {
        let mut state = self.state.lock().unwrap();
        let remote = library(&mut state, lib)?;
        if let Some(since) = since {
            if remote.version <= since {
                return Err(BError::NotModified);
            }
        }
        let floor = since.unwrap_or(-1);
        let settings = remote.objects.iter()
            .filter(|((ty, _), (version, _))| *ty == ObjectType::Setting && *version > floor)
            .map(|((_, key), (version, data))| (key.clone(), json!({"value": data["value"], "version": version})))
            .collect();
        Ok(Versioned::new(remote.version, settings))
    }

    fn submit_updates(&self, lib: LibraryId, object: ObjectType, version: i64, keys: &[String], parameters: &[Value]) -> BResult<Versioned<UpdatesResponse>> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(Submission { library: lib, object, version, keys: keys.to_vec(), deletion: false });
        precheck_write(&mut state, lib, version)?;
        let rejected = state.rejected.clone();
        let remote = library(&mut state, lib)?;
        let new_version = remote.version + 1;
        let mut res = UpdatesResponse::default();
        for params in parameters {
            let key = params["key"].as_str().unwrap_or("").to_string();
            if let Some((code, message)) = rejected.get(&key) {
                res.failed.push(FailedUpdate { key, code: *code, message: message.clone() });
                continue;
            }
            let id = (object.storage_type(), key.clone());
            let mut data = remote.objects.get(&id).map(|x| x.1.clone()).unwrap_or_else(|| json!({}));
            let mut changed = !remote.objects.contains_key(&id);
            for (field, val) in params.as_object().unwrap() {
                if field == "key" || field == "version" { continue; }
                if data.get(field) != Some(val) {
                    changed = true;
                    data[field.as_str()] = val.clone();
                }
            }
            if changed {
                data["key"] = json!(key);
                data["version"] = json!(new_version);
                remote.objects.insert(id, (new_version, data));
                res.successful.push(key);
            } else {
                res.unchanged.push(key);
            }
        }
        if res.successful.len() > 0 {
            remote.version = new_version;
        }
        Ok(Versioned::new(remote.version, res))
    }

    fn submit_deletions(&self, lib: LibraryId, object: ObjectType, version: i64, keys: &[String]) -> BResult<i64> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(Submission { library: lib, object, version, keys: keys.to_vec(), deletion: true });
        precheck_write(&mut state, lib, version)?;
        let remote = library(&mut state, lib)?;
        remote.version += 1;
        let new_version = remote.version;
        for key in keys {
            remote.objects.remove(&(object.storage_type(), key.clone()));
            remote.deleted.push((object.storage_type(), key.clone(), new_version));
        }
        Ok(new_version)
    }
}

/// A file remote serving canned bodies, with a gate to hold transfers open
pub struct FakeFiles {
    /// key -> (body, compressed)
    pub files: Mutex<HashMap<String, (Vec<u8>, bool)>>,
    /// md5s the remote already has
    pub existing: Mutex<HashSet<String>>,
    pub transfers: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<String>>,
    pub registered: Mutex<Vec<String>>,
    /// uploads that got as far as the transfer
    pub upload_attempts: Mutex<Vec<String>>,
    /// keys whose stored files were deleted
    pub deleted: Mutex<Vec<String>>,
    /// while set, deletions fail at the transport level
    pub fail_deletes: Mutex<bool>,
    /// while set, downloads wait between chunks
    pub held: Mutex<bool>,
    /// while set, uploads wait before sending anything
    pub uploads_held: Mutex<bool>,
}

impl FakeFiles {
    pub fn new() -> FakeFiles {
        FakeFiles {
            files: Mutex::new(HashMap::new()),
            existing: Mutex::new(HashSet::new()),
            transfers: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            upload_attempts: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_deletes: Mutex::new(false),
            held: Mutex::new(false),
            uploads_held: Mutex::new(false),
        }
    }

    pub fn serve(&self, key: &str, body: Vec<u8>, compressed: bool) {
        self.files.lock().unwrap().insert(String::from(key), (body, compressed));
    }

    pub fn hold(&self, held: bool) {
        *self.held.lock().unwrap() = held;
    }

    pub fn hold_uploads(&self, held: bool) {
        *self.uploads_held.lock().unwrap() = held;
    }

    pub fn transfers(&self) -> Vec<String> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

impl FileBackend for FakeFiles {
    fn download(&self, _library: LibraryId, key: &str, file: &Path, sink: &mut dyn TransferSink) -> BResult<()> {
        self.transfers.lock().unwrap().push(String::from(key));
        let (body, compressed) = match self.files.lock().unwrap().get(key) {
            Some(x) => x.clone(),
            None => return Err(BError::Api(404, format!("no file for {}", key))),
        };
        sink.set_compressed(compressed);
        let total = body.len() as u64;
        let mut out = File::create(file)?;
        let mut done = 0;
        for chunk in body.chunks(8) {
            while *self.held.lock().unwrap() {
                if sink.is_cancelled() { return Err(BError::Cancelled); }
                sleep(5);
            }
            if sink.is_cancelled() { return Err(BError::Cancelled); }
            out.write_all(chunk)?;
            done += chunk.len() as u64;
            sink.progress(done, Some(total));
        }
        Ok(())
    }

    fn authorize_upload(&self, upload: &AttachmentUpload) -> BResult<AuthorizeUploadResponse> {
        if self.existing.lock().unwrap().contains(&upload.md5) {
            return Ok(AuthorizeUploadResponse::Exists);
        }
        Ok(AuthorizeUploadResponse::New(UploadAuthorization {
            url: String::from("https://uploads.example.org/"),
            upload_key: format!("upload-{}", upload.key),
            ..Default::default()
        }))
    }

    fn upload(&self, upload: &AttachmentUpload, _auth: &UploadAuthorization, sink: &mut dyn TransferSink) -> BResult<()> {
        self.upload_attempts.lock().unwrap().push(upload.key.clone());
        while *self.uploads_held.lock().unwrap() {
            if sink.is_cancelled() { return Err(BError::Cancelled); }
            sleep(5);
        }
        let size = ::std::fs::metadata(&upload.file)?.len();
        sink.progress(size / 2, Some(size));
        sink.progress(size, Some(size));
        self.uploads.lock().unwrap().push(upload.key.clone());
        Ok(())
    }

    fn register_upload(&self, upload: &AttachmentUpload, auth: &UploadAuthorization) -> BResult<()> {
        assert_eq!(auth.upload_key, format!("upload-{}", upload.key));
        self.registered.lock().unwrap().push(upload.key.clone());
        self.existing.lock().unwrap().insert(upload.md5.clone());
        Ok(())
    }

    fn delete(&self, _library: LibraryId, keys: &[String]) -> BResult<Vec<String>> {
        if *self.fail_deletes.lock().unwrap() {
            return Err(BError::Transport(String::from("connection reset")));
        }
        self.deleted.lock().unwrap().extend(keys.iter().cloned());
        Ok(keys.to_vec())
    }
}

pub fn storage() -> Arc<Storage> {
    Arc::new(Storage::new(":memory:").unwrap())
}

/// A personal library that already synced up to `version`
pub fn personal_library(storage: &Storage, version: i64) {
    let lib = Library::new(LibraryId::Personal, "My Library", AccessLevel::from_permissions(true, true));
    storage.perform(&StoreLibrary(lib)).unwrap();
    if version == 0 { return; }
    let fields = vec![
        VersionField::Object(ObjectType::Collection),
        VersionField::Object(ObjectType::Search),
        VersionField::Object(ObjectType::Item),
        VersionField::Object(ObjectType::Trash),
        VersionField::Object(ObjectType::Setting),
        VersionField::Deletions,
    ];
    for field in fields {
        storage.perform(&UpdateVersion { library: LibraryId::Personal, field, version }).unwrap();
    }
}

/// An object as it would look right after a sync at `version`
pub fn synced(object: ObjectType, key: &str, version: i64, data: Value) -> SyncObject {
    let mut obj = SyncObject::new(LibraryId::Personal, object, key);
    let (parent, collections, trash, rest) = SyncObject::split_data(object.storage_type(), &data);
    obj.version = version;
    obj.parent = parent;
    obj.collections = collections;
    obj.trash = trash;
    obj.data = rest;
    obj.changes = Default::default();
    obj
}

pub fn save(storage: &Storage, obj: SyncObject) {
    storage.perform(&SaveObject(obj)).unwrap();
}

/// Wait for a transfer's terminal event
pub fn terminal(rx: &Receiver<Update>) -> UpdateKind {
    loop {
        let update = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        if update.kind.is_terminal() {
            return update.kind;
        }
    }
}

/// Retries that don't make the tests wait
pub fn quick_policy() -> RetryPolicy {
    let mut policy = RetryPolicy::default();
    policy.max_retry_count = 1;
    policy.delay_intervals = vec![0];
    policy.conflict_delays = vec![0];
    policy.object_retry_delays = vec![0];
    policy
}
