use std::fmt;

use crate::error::{BResult, BError};
use crate::models::object::ObjectType;

/// Which library an object lives in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LibraryId {
    #[serde(rename = "personal")]
    Personal,
    #[serde(rename = "group")]
    Group(i64),
}

impl LibraryId {
    pub fn is_group(&self) -> bool {
        match self {
            LibraryId::Group(_) => true,
            LibraryId::Personal => false,
        }
    }

    pub fn group_id(&self) -> Option<i64> {
        match self {
            LibraryId::Group(id) => Some(*id),
            LibraryId::Personal => None,
        }
    }

    /// The string we store this id under locally
    pub fn db_key(&self) -> String {
        match self {
            LibraryId::Personal => String::from("personal"),
            LibraryId::Group(id) => format!("group:{}", id),
        }
    }

    pub fn from_db_key(key: &str) -> BResult<LibraryId> {
        if key == "personal" {
            return Ok(LibraryId::Personal);
        }
        if key.starts_with("group:") {
            let id = key["group:".len()..].parse::<i64>()?;
            return Ok(LibraryId::Group(id));
        }
        Err(BError::BadValue(format!("LibraryId::from_db_key() -- bad library key {}", key)))
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LibraryId::Personal => write!(f, "personal"),
            LibraryId::Group(id) => write!(f, "group {}", id),
        }
    }
}

/// Which of a library's version counters to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionField {
    Object(ObjectType),
    Deletions,
}

/// The per-type version vector of a library. Each counter only moves forward,
/// and only after the exchange that produced it has been committed locally.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Versions {
    pub collections: i64,
    pub items: i64,
    pub trash: i64,
    pub searches: i64,
    pub settings: i64,
    pub deletions: i64,
}

impl Versions {
    pub fn get(&self, field: VersionField) -> i64 {
        match field {
            VersionField::Object(ObjectType::Collection) => self.collections,
            VersionField::Object(ObjectType::Item) => self.items,
            VersionField::Object(ObjectType::Trash) => self.trash,
            VersionField::Object(ObjectType::Search) => self.searches,
            VersionField::Object(ObjectType::Setting) => self.settings,
            VersionField::Deletions => self.deletions,
        }
    }

    /// Set a counter, ignoring attempts to move it backwards. Returns whether
    /// anything changed.
    pub fn advance(&mut self, field: VersionField, version: i64) -> bool {
        let slot = match field {
            VersionField::Object(ObjectType::Collection) => &mut self.collections,
            VersionField::Object(ObjectType::Item) => &mut self.items,
            VersionField::Object(ObjectType::Trash) => &mut self.trash,
            VersionField::Object(ObjectType::Search) => &mut self.searches,
            VersionField::Object(ObjectType::Setting) => &mut self.settings,
            VersionField::Deletions => &mut self.deletions,
        };
        if version > *slot {
            *slot = version;
            true
        } else {
            false
        }
    }

    /// The newest version across all counters. Writes are submitted against
    /// this.
    pub fn max(&self) -> i64 {
        *[self.collections, self.items, self.trash, self.searches, self.settings, self.deletions]
            .iter()
            .max()
            .unwrap_or(&0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Editable,
    ReadOnly,
    FilesReadOnly,
}

impl AccessLevel {
    pub fn from_permissions(write: bool, files: bool) -> AccessLevel {
        if !write {
            AccessLevel::ReadOnly
        } else if !files {
            AccessLevel::FilesReadOnly
        } else {
            AccessLevel::Editable
        }
    }

    pub fn can_edit_metadata(&self) -> bool {
        *self != AccessLevel::ReadOnly
    }

    pub fn can_edit_files(&self) -> bool {
        *self == AccessLevel::Editable
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Editable => "editable",
            AccessLevel::ReadOnly => "read_only",
            AccessLevel::FilesReadOnly => "files_read_only",
        }
    }

    pub fn from_str(val: &str) -> BResult<AccessLevel> {
        match val {
            "editable" => Ok(AccessLevel::Editable),
            "read_only" => Ok(AccessLevel::ReadOnly),
            "files_read_only" => Ok(AccessLevel::FilesReadOnly),
            _ => Err(BError::BadValue(format!("AccessLevel::from_str() -- bad access level {}", val))),
        }
    }
}

/// A library as we know it locally.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Library {
    pub id: LibraryId,
    pub name: String,
    pub versions: Versions,
    pub access: AccessLevel,
    /// Metadata version of a group (name, permissions), separate from content
    pub meta_version: i64,
    /// A group removed remotely that the user chose to keep around
    pub local_only: bool,
}

impl Library {
    pub fn new(id: LibraryId, name: &str, access: AccessLevel) -> Library {
        Library {
            id,
            name: String::from(name),
            versions: Default::default(),
            access,
            meta_version: 0,
            local_only: false,
        }
    }
}

/// Which libraries a sync run covers.
#[derive(Debug, Clone, PartialEq)]
pub enum LibrarySyncType {
    All,
    Specific(Vec<LibraryId>),
}

impl LibrarySyncType {
    pub fn includes(&self, id: &LibraryId) -> bool {
        match self {
            LibrarySyncType::All => true,
            LibrarySyncType::Specific(ids) => ids.contains(id),
        }
    }
}
