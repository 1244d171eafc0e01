//! Identities and events for attachment transfers.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::BError;
use crate::models::library::LibraryId;

/// Identifies one attachment download. Only one transfer per identity is ever
/// in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Download {
    pub key: String,
    pub library: LibraryId,
}

impl Download {
    pub fn new(key: &str, library: LibraryId) -> Download {
        Download { key: String::from(key), library }
    }
}

/// One attachment upload. Identity is (key, library, filename, md5, mtime):
/// the same file changing on disk is a different upload.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub key: String,
    pub library: LibraryId,
    pub filename: String,
    pub content_type: String,
    pub md5: String,
    pub mtime: i64,
    /// where the file lives locally
    pub file: PathBuf,
    /// the hash the remote has on record, if any
    pub remote_md5: Option<String>,
    /// the item this attachment hangs off, passed along on updates
    pub parent_key: Option<String>,
}

impl PartialEq for AttachmentUpload {
    fn eq(&self, other: &AttachmentUpload) -> bool {
        self.key == other.key &&
            self.library == other.library &&
            self.filename == other.filename &&
            self.md5 == other.md5 &&
            self.mtime == other.mtime
    }
}
impl Eq for AttachmentUpload {}

impl Hash for AttachmentUpload {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.library.hash(state);
        self.filename.hash(state);
        self.md5.hash(state);
        self.mtime.hash(state);
    }
}

/// Where an attachment's file lives: one directory per attachment, so
/// extracting an archive never touches anything else.
pub fn attachment_path(folder: &Path, library: LibraryId, key: &str, filename: &str) -> PathBuf {
    folder.join(library.db_key().replace(':', "_")).join(key).join(filename)
}

#[derive(Debug, Clone)]
pub enum UpdateKind {
    /// fraction done, 0.0 to 1.0
    Progress(f64),
    Ready,
    Failed(Arc<BError>),
    Cancelled,
}

impl UpdateKind {
    pub fn is_terminal(&self) -> bool {
        match self {
            UpdateKind::Progress(_) => false,
            _ => true,
        }
    }
}

/// A transfer event, as sent to observers and subscribers.
#[derive(Debug, Clone)]
pub struct Update {
    pub key: String,
    pub parent_key: Option<String>,
    pub library: LibraryId,
    pub kind: UpdateKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn upload_identity_ignores_paths() {
        let upload = AttachmentUpload {
            key: String::from("ATT00001"),
            library: LibraryId::Personal,
            filename: String::from("paper.pdf"),
            content_type: String::from("application/pdf"),
            md5: String::from("abc"),
            mtime: 100,
            file: PathBuf::from("/tmp/a/paper.pdf"),
            remote_md5: None,
            parent_key: None,
        };
        let mut moved = upload.clone();
        moved.file = PathBuf::from("/tmp/b/paper.pdf");
        let mut edited = upload.clone();
        edited.md5 = String::from("def");
        let mut set = HashSet::new();
        set.insert(upload);
        assert!(set.contains(&moved));
        assert!(!set.contains(&edited));
    }
}
