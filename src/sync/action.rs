//! The steps of a sync run. The controller keeps a queue of these and works
//! through it front to back; some actions expand into more actions.

use std::fmt;

use crate::models::batch::{DeleteBatch, DownloadBatch, WriteBatch};
use crate::models::library::{LibraryId, LibrarySyncType, VersionField};
use crate::models::object::ObjectType;

/// Which halves of a library sync to queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateLibraryActionsOptions {
    /// downloads, then writes
    Automatic,
    OnlyDownloads,
    OnlyWrites,
    /// like Automatic, but never trust cached versions
    ForceDownloads,
}

impl CreateLibraryActionsOptions {
    pub fn downloads(&self) -> bool {
        *self != CreateLibraryActionsOptions::OnlyWrites
    }

    pub fn writes(&self) -> bool {
        *self != CreateLibraryActionsOptions::OnlyDownloads
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    LoadKeyPermissions,
    SyncGroupVersions,
    SyncGroupToDb(i64),
    CreateLibraryActions(LibrarySyncType, CreateLibraryActionsOptions),
    SyncVersions { library: LibraryId, object: ObjectType, force: bool },
    SyncBatchToDb(DownloadBatch),
    StoreVersion { library: LibraryId, field: VersionField, version: i64 },
    SyncSettings(LibraryId),
    SyncDeletions(LibraryId),
    SubmitDeleteBatch(DeleteBatch),
    SubmitWriteBatch(WriteBatch),
    /// remove stored files of deleted attachments from a WebDAV store
    SubmitFileDeletions(LibraryId),
    UploadAttachments(LibraryId),
    /// drop local attachment changes nobody is allowed to upload
    RevertLibraryFiles(LibraryId),
    ResolveDeletedGroup(i64, String),
    ResolveGroupMetadataWritePermission(i64, String),
    RevertLibraryToOriginal(LibraryId),
    MarkChangesAsResolved(LibraryId),
    DeleteGroup(i64),
    MarkGroupAsLocalOnly(i64),
}

impl Action {
    /// The library this action works on, if it's about one
    pub fn library(&self) -> Option<LibraryId> {
        match self {
            Action::CreateLibraryActions(LibrarySyncType::Specific(ids), _) if ids.len() == 1 => Some(ids[0]),
            Action::LoadKeyPermissions |
                Action::SyncGroupVersions |
                Action::CreateLibraryActions(..) => None,
            Action::SyncGroupToDb(id) |
                Action::ResolveDeletedGroup(id, _) |
                Action::ResolveGroupMetadataWritePermission(id, _) |
                Action::DeleteGroup(id) |
                Action::MarkGroupAsLocalOnly(id) => Some(LibraryId::Group(*id)),
            Action::SyncVersions { library, .. } |
                Action::StoreVersion { library, .. } => Some(*library),
            Action::SyncBatchToDb(batch) => Some(batch.library),
            Action::SubmitDeleteBatch(batch) => Some(batch.library),
            Action::SubmitWriteBatch(batch) => Some(batch.library),
            Action::SyncSettings(library) |
                Action::SyncDeletions(library) |
                Action::SubmitFileDeletions(library) |
                Action::UploadAttachments(library) |
                Action::RevertLibraryFiles(library) |
                Action::RevertLibraryToOriginal(library) |
                Action::MarkChangesAsResolved(library) => Some(*library),
        }
    }

    /// Whether this action pushes local state up
    pub fn is_write(&self) -> bool {
        match self {
            Action::SubmitDeleteBatch(..) |
                Action::SubmitWriteBatch(..) |
                Action::SubmitFileDeletions(..) |
                Action::UploadAttachments(..) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::LoadKeyPermissions => write!(f, "LoadKeyPermissions"),
            Action::SyncGroupVersions => write!(f, "SyncGroupVersions"),
            Action::SyncGroupToDb(id) => write!(f, "SyncGroupToDb({})", id),
            Action::CreateLibraryActions(libs, opts) => write!(f, "CreateLibraryActions({:?}, {:?})", libs, opts),
            Action::SyncVersions { library, object, .. } => write!(f, "SyncVersions({}, {})", library, object),
            Action::SyncBatchToDb(batch) => write!(f, "SyncBatchToDb({}, {}, {} keys)", batch.library, batch.object, batch.keys.len()),
            Action::StoreVersion { library, field, version } => write!(f, "StoreVersion({}, {:?}, {})", library, field, version),
            Action::SyncSettings(library) => write!(f, "SyncSettings({})", library),
            Action::SyncDeletions(library) => write!(f, "SyncDeletions({})", library),
            Action::SubmitDeleteBatch(batch) => write!(f, "SubmitDeleteBatch({}, {}, {} keys)", batch.library, batch.object, batch.keys.len()),
            Action::SubmitWriteBatch(batch) => write!(f, "SubmitWriteBatch({}, {}, {} keys)", batch.library, batch.object, batch.keys.len()),
            Action::SubmitFileDeletions(library) => write!(f, "SubmitFileDeletions({})", library),
            Action::UploadAttachments(library) => write!(f, "UploadAttachments({})", library),
            Action::RevertLibraryFiles(library) => write!(f, "RevertLibraryFiles({})", library),
            Action::ResolveDeletedGroup(id, _) => write!(f, "ResolveDeletedGroup({})", id),
            Action::ResolveGroupMetadataWritePermission(id, _) => write!(f, "ResolveGroupMetadataWritePermission({})", id),
            Action::RevertLibraryToOriginal(library) => write!(f, "RevertLibraryToOriginal({})", library),
            Action::MarkChangesAsResolved(library) => write!(f, "MarkChangesAsResolved({})", library),
            Action::DeleteGroup(id) => write!(f, "DeleteGroup({})", id),
            Action::MarkGroupAsLocalOnly(id) => write!(f, "MarkGroupAsLocalOnly({})", id),
        }
    }
}
