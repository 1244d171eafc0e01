//! The remote side of sync. The engine only ever talks to these traits, so the
//! transport (and a fake one in tests) can be swapped out freely.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::error::BResult;
use crate::models::file_sync::AttachmentUpload;
use crate::models::library::LibraryId;
use crate::models::object::ObjectType;
use crate::models::response::{
    AuthorizeUploadResponse, DeletionsResponse, GroupResponse, KeyPermissions,
    UpdatesResponse, UploadAuthorization,
};

pub mod http;
pub mod webdav;

/// A response along with the library version the remote reported for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: i64,
    pub data: T,
}

impl<T> Versioned<T> {
    pub fn new(version: i64, data: T) -> Versioned<T> {
        Versioned { version, data }
    }
}

/// The versioned object store. Calls that take a `since` return
/// `BError::NotModified` when nothing changed; writes that carry a stale
/// `version` return `BError::PreconditionFailed`.
pub trait RemoteApi: Send + Sync {
    /// What the current credentials may access
    fn load_permissions(&self) -> BResult<KeyPermissions>;

    /// Metadata versions of every group we can see
    fn group_versions(&self) -> BResult<HashMap<i64, i64>>;

    fn group(&self, group_id: i64) -> BResult<GroupResponse>;

    /// `{key: version}` of objects changed since `since` (all of them for None)
    fn versions(&self, library: LibraryId, object: ObjectType, since: Option<i64>) -> BResult<Versioned<HashMap<String, i64>>>;

    /// Full objects for the given keys
    fn objects(&self, library: LibraryId, object: ObjectType, keys: &[String]) -> BResult<Versioned<Vec<Value>>>;

    fn deletions(&self, library: LibraryId, since: i64) -> BResult<Versioned<DeletionsResponse>>;

    /// `{setting: {"value": ..., "version": ...}}` changed since `since`
    fn settings(&self, library: LibraryId, since: Option<i64>) -> BResult<Versioned<HashMap<String, Value>>>;

    /// Push a batch of created/changed objects, conditional on `version`
    fn submit_updates(&self, library: LibraryId, object: ObjectType, version: i64, keys: &[String], parameters: &[Value]) -> BResult<Versioned<UpdatesResponse>>;

    /// Push a batch of deletions, conditional on `version`. Returns the new
    /// library version.
    fn submit_deletions(&self, library: LibraryId, object: ObjectType, version: i64, keys: &[String]) -> BResult<i64>;
}

/// Where a file backend reports transfer progress, and where it learns about
/// cancellation.
pub trait TransferSink {
    /// Called once the backend knows whether the payload is an archive
    fn set_compressed(&mut self, compressed: bool);

    /// Bytes done so far, out of `total` if known
    fn progress(&mut self, completed: u64, total: Option<u64>);

    /// Backends check this between chunks and stop early when set
    fn is_cancelled(&self) -> bool;
}

/// A store of attachment files.
pub trait FileBackend: Send + Sync {
    /// Download an attachment's file (or archive of it) to `file`
    fn download(&self, library: LibraryId, key: &str, file: &Path, sink: &mut dyn TransferSink) -> BResult<()>;

    /// Ask whether the remote needs this file, and where to put it if so
    fn authorize_upload(&self, upload: &AttachmentUpload) -> BResult<AuthorizeUploadResponse>;

    fn upload(&self, upload: &AttachmentUpload, auth: &UploadAuthorization, sink: &mut dyn TransferSink) -> BResult<()>;

    /// Tell the remote the upload finished
    fn register_upload(&self, upload: &AttachmentUpload, auth: &UploadAuthorization) -> BResult<()>;

    /// Remove the stored files of attachments whose items were deleted.
    /// Returns the keys that are gone now; the rest should be tried again.
    fn delete(&self, library: LibraryId, keys: &[String]) -> BResult<Vec<String>>;
}

/// The file backends available, and which one serves which library.
#[derive(Clone)]
pub struct FileBackends {
    pub api: Arc<dyn FileBackend>,
    /// Used for the personal library when present
    pub webdav: Option<Arc<dyn FileBackend>>,
}

impl FileBackends {
    pub fn new(api: Arc<dyn FileBackend>) -> FileBackends {
        FileBackends { api, webdav: None }
    }

    pub fn with_webdav(mut self, webdav: Arc<dyn FileBackend>) -> FileBackends {
        self.webdav = Some(webdav);
        self
    }

    pub fn for_library(&self, library: LibraryId) -> Arc<dyn FileBackend> {
        self.webdav_for(library).unwrap_or_else(|| self.api.clone())
    }

    /// The WebDAV backend, if it's the one serving `library`. The API drops
    /// stored files along with their items; WebDAV needs telling.
    pub fn webdav_for(&self, library: LibraryId) -> Option<Arc<dyn FileBackend>> {
        match (library, &self.webdav) {
            (LibraryId::Personal, Some(webdav)) => Some(webdav.clone()),
            _ => None,
        }
    }
}
