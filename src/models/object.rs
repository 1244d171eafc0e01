use std::fmt;
use std::ops::BitOr;

use serde_json::{Map, Value};

use crate::error::{BResult, BError};
use crate::models::library::LibraryId;
use crate::util;

/// The kinds of syncable objects. Trash is its own kind on the wire (it has
/// its own version counter) but is stored as items with the trash flag set.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Collection,
    Search,
    Item,
    Trash,
    Setting,
}

impl ObjectType {
    /// The order in which a library's objects are pulled down. Parents
    /// (collections) land before the things that reference them.
    pub const DOWNLOAD_ORDER: [ObjectType; 4] = [ObjectType::Collection, ObjectType::Search, ObjectType::Item, ObjectType::Trash];

    /// The order in which local changes are pushed up.
    pub const WRITE_ORDER: [ObjectType; 4] = [ObjectType::Collection, ObjectType::Search, ObjectType::Item, ObjectType::Setting];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Collection => "collection",
            ObjectType::Search => "search",
            ObjectType::Item => "item",
            ObjectType::Trash => "trash",
            ObjectType::Setting => "setting",
        }
    }

    pub fn from_str(val: &str) -> BResult<ObjectType> {
        match val {
            "collection" => Ok(ObjectType::Collection),
            "search" => Ok(ObjectType::Search),
            "item" => Ok(ObjectType::Item),
            "trash" => Ok(ObjectType::Trash),
            "setting" => Ok(ObjectType::Setting),
            _ => Err(BError::BadValue(format!("ObjectType::from_str() -- bad object type {}", val))),
        }
    }

    /// What this type is stored as locally
    pub fn storage_type(&self) -> ObjectType {
        match self {
            ObjectType::Trash => ObjectType::Item,
            x => *x,
        }
    }

    /// The name of the field pointing at a parent of the same type, if any
    pub fn parent_field(&self) -> Option<&'static str> {
        match self {
            ObjectType::Collection => Some("parentCollection"),
            ObjectType::Item | ObjectType::Trash => Some("parentItem"),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The set of locally changed fields of an object. Every local mutation
/// updates it; a successful upload clears it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Changes(u32);

impl Changes {
    pub const NONE: Changes = Changes(0);
    pub const NAME: Changes = Changes(1 << 0);
    pub const PARENT: Changes = Changes(1 << 1);
    pub const COLLECTIONS: Changes = Changes(1 << 2);
    pub const FIELDS: Changes = Changes(1 << 3);
    pub const TAGS: Changes = Changes(1 << 4);
    pub const TRASH: Changes = Changes(1 << 5);
    pub const RELATIONS: Changes = Changes(1 << 6);
    pub const CONDITIONS: Changes = Changes(1 << 7);
    pub const VALUE: Changes = Changes(1 << 8);
    pub const ALL: Changes = Changes((1 << 9) - 1);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Changes {
        Changes(bits & Changes::ALL.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Changes) -> bool {
        (self.0 & other.0) == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Changes) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Changes) {
        self.0 &= !other.0;
    }

    /// Which change bit a data field falls under
    pub fn for_field(field: &str) -> Changes {
        match field {
            "name" => Changes::NAME,
            "parentCollection" | "parentItem" => Changes::PARENT,
            "collections" => Changes::COLLECTIONS,
            "tags" => Changes::TAGS,
            "deleted" => Changes::TRASH,
            "relations" => Changes::RELATIONS,
            "conditions" => Changes::CONDITIONS,
            "value" => Changes::VALUE,
            _ => Changes::FIELDS,
        }
    }
}

impl BitOr for Changes {
    type Output = Changes;
    fn bitor(self, rhs: Changes) -> Changes {
        Changes(self.0 | rhs.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synced,
    /// stored, but something it references hasn't arrived yet
    Dirty,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Dirty => "dirty",
        }
    }

    pub fn from_str(val: &str) -> SyncState {
        match val {
            "dirty" => SyncState::Dirty,
            _ => SyncState::Synced,
        }
    }
}

/// File info for items that carry a stored file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AttachmentInfo {
    pub filename: String,
    pub content_type: Option<String>,
    /// hash of the local copy, when known
    pub md5: Option<String>,
    pub mtime: Option<i64>,
    /// the last hash the remote confirmed having
    pub remote_md5: Option<String>,
    pub needs_upload: bool,
    pub downloaded: bool,
}

impl AttachmentInfo {
    /// Pull file info out of an item's data. Only imported files/urls have
    /// something to transfer.
    pub fn from_data(data: &Value) -> Option<AttachmentInfo> {
        let link_mode = data.get("linkMode").and_then(|x| x.as_str())?;
        if link_mode != "imported_file" && link_mode != "imported_url" {
            return None;
        }
        let filename = data.get("filename").and_then(|x| x.as_str()).unwrap_or("");
        let md5 = data.get("md5").and_then(|x| x.as_str()).map(String::from);
        Some(AttachmentInfo {
            filename: String::from(filename),
            content_type: data.get("contentType").and_then(|x| x.as_str()).map(String::from),
            md5: md5.clone(),
            mtime: data.get("mtime").and_then(|x| x.as_i64()),
            remote_md5: md5,
            needs_upload: false,
            downloaded: false,
        })
    }
}

/// Fields that live in their own columns rather than in `data`
const STRUCTURAL_FIELDS: &'static [&'static str] = &[
    "key", "version", "parentCollection", "parentItem", "collections", "deleted",
];

/// A locally stored collection/search/item/setting.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncObject {
    pub library: LibraryId,
    /// storage type, never `Trash`
    pub ty: ObjectType,
    pub key: String,
    pub version: i64,
    pub parent: Option<String>,
    pub collections: Vec<String>,
    pub trash: bool,
    /// local soft-delete, waiting to be pushed
    pub deleted: bool,
    pub data: Value,
    pub changes: Changes,
    pub sync_state: SyncState,
    pub date_modified: i64,
    pub attachment: Option<AttachmentInfo>,
}

impl SyncObject {
    /// Create a brand new, never-synced local object
    pub fn new(library: LibraryId, ty: ObjectType, key: &str) -> SyncObject {
        SyncObject {
            library,
            ty: ty.storage_type(),
            key: String::from(key),
            version: 0,
            parent: None,
            collections: Vec::new(),
            trash: ty == ObjectType::Trash,
            deleted: false,
            data: json!({}),
            changes: Changes::ALL,
            sync_state: SyncState::Synced,
            date_modified: util::now(),
            attachment: None,
        }
    }

    pub fn is_changed(&self) -> bool {
        !self.changes.is_empty()
    }

    /// The type this object syncs as
    pub fn sync_type(&self) -> ObjectType {
        if self.ty == ObjectType::Item && self.trash {
            ObjectType::Trash
        } else {
            self.ty
        }
    }

    fn touch(&mut self, changes: Changes) {
        self.changes.insert(changes);
        self.date_modified = util::now();
    }

    pub fn set_name(&mut self, name: &str) {
        self.set_field("name", json!(name));
    }

    /// Set a data field, marking it changed
    pub fn set_field(&mut self, field: &str, value: Value) {
        if !self.data.is_object() {
            self.data = json!({});
        }
        if let Some(obj) = self.data.as_object_mut() {
            obj.insert(String::from(field), value);
        }
        self.touch(Changes::for_field(field));
    }

    pub fn set_parent(&mut self, parent: Option<&str>) {
        self.parent = parent.map(String::from);
        self.touch(Changes::PARENT);
    }

    pub fn set_collections(&mut self, collections: Vec<String>) {
        self.collections = collections;
        self.touch(Changes::COLLECTIONS);
    }

    pub fn set_trash(&mut self, trash: bool) {
        self.trash = trash;
        self.touch(Changes::TRASH);
    }

    /// Soft-delete. The deletion goes out on the next write pass.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.date_modified = util::now();
    }

    /// Split a remote `data` object into our columns. Returns (parent,
    /// collections, trash, data-without-structural-fields).
    pub fn split_data(ty: ObjectType, data: &Value) -> (Option<String>, Vec<String>, bool, Value) {
        let parent = ty.parent_field()
            .and_then(|field| data.get(field))
            .and_then(|x| x.as_str())
            .map(String::from);
        let collections = data.get("collections")
            .and_then(|x| x.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_str()).map(String::from).collect::<Vec<_>>())
            .unwrap_or_else(Vec::new);
        let trash = match data.get("deleted") {
            Some(Value::Bool(x)) => *x,
            Some(Value::Number(x)) => x.as_i64().unwrap_or(0) != 0,
            _ => false,
        };
        let mut rest = Map::new();
        if let Some(obj) = data.as_object() {
            for (k, v) in obj {
                if STRUCTURAL_FIELDS.contains(&k.as_str()) { continue; }
                rest.insert(k.clone(), v.clone());
            }
        }
        (parent, collections, trash, Value::Object(rest))
    }

    /// Build the JSON we submit for this object. New objects send everything,
    /// existing ones only what changed.
    pub fn update_parameters(&self) -> Value {
        let mut params = Map::new();
        params.insert(String::from("key"), json!(self.key));
        params.insert(String::from("version"), json!(self.version));
        let all = self.version == 0;
        let has = |c: Changes| all || self.changes.contains(c);

        if has(Changes::PARENT) {
            if let Some(field) = self.ty.parent_field() {
                let val = match self.parent {
                    Some(ref x) => json!(x),
                    None => json!(false),
                };
                if !(all && self.parent.is_none() && self.ty == ObjectType::Item) {
                    params.insert(String::from(field), val);
                }
            }
        }
        if self.ty == ObjectType::Item {
            if has(Changes::COLLECTIONS) {
                params.insert(String::from("collections"), json!(self.collections));
            }
            if has(Changes::TRASH) {
                params.insert(String::from("deleted"), json!(self.trash));
            }
        }
        if let Some(obj) = self.data.as_object() {
            for (k, v) in obj {
                if STRUCTURAL_FIELDS.contains(&k.as_str()) { continue; }
                if has(Changes::for_field(k)) {
                    params.insert(k.clone(), v.clone());
                }
            }
        }
        Value::Object(params)
    }

    /// Every key this object needs to exist locally before it's complete:
    /// (type, key) pairs for its parent and containing collections.
    pub fn references(&self) -> Vec<(ObjectType, String)> {
        let mut refs = Vec::new();
        match self.ty {
            ObjectType::Collection => {
                if let Some(ref parent) = self.parent {
                    refs.push((ObjectType::Collection, parent.clone()));
                }
            }
            ObjectType::Item => {
                if let Some(ref parent) = self.parent {
                    refs.push((ObjectType::Item, parent.clone()));
                }
                for col in &self.collections {
                    refs.push((ObjectType::Collection, col.clone()));
                }
            }
            _ => {}
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_bitset() {
        let mut changes = Changes::NAME | Changes::TAGS;
        assert!(changes.contains(Changes::NAME));
        assert!(!changes.contains(Changes::PARENT));
        changes.remove(Changes::NAME);
        assert_eq!(changes, Changes::TAGS);
        assert!(Changes::ALL.contains(Changes::VALUE));
        assert!(!Changes::NONE.contains(Changes::NONE));
        assert_eq!(Changes::from_bits(Changes::ALL.bits() | (1 << 20)), Changes::ALL);
    }

    #[test]
    fn local_mutations_record_changes() {
        let mut item = SyncObject::new(LibraryId::Personal, ObjectType::Item, "ITEM0001");
        item.version = 4;
        item.changes = Changes::NONE;
        item.set_field("title", json!("Dune"));
        item.set_collections(vec![String::from("COLL0001")]);
        assert!(item.changes.contains(Changes::FIELDS));
        assert!(item.changes.contains(Changes::COLLECTIONS));
        assert!(!item.changes.contains(Changes::TAGS));

        let params = item.update_parameters();
        assert_eq!(params, json!({
            "key": "ITEM0001",
            "version": 4,
            "title": "Dune",
            "collections": ["COLL0001"],
        }));
    }

    #[test]
    fn new_objects_send_everything() {
        let mut col = SyncObject::new(LibraryId::Group(3), ObjectType::Collection, "COLL0002");
        col.set_name("Reading");
        let params = col.update_parameters();
        assert_eq!(params, json!({
            "key": "COLL0002",
            "version": 0,
            "name": "Reading",
            "parentCollection": false,
        }));
    }

    #[test]
    fn splits_remote_data() {
        let data = json!({
            "key": "ITEM0002",
            "version": 9,
            "itemType": "attachment",
            "parentItem": "ITEM0001",
            "collections": ["A", "B"],
            "deleted": 1,
            "linkMode": "imported_file",
            "filename": "paper.pdf",
            "md5": "abc",
            "mtime": 1000,
        });
        let (parent, collections, trash, rest) = SyncObject::split_data(ObjectType::Item, &data);
        assert_eq!(parent, Some(String::from("ITEM0001")));
        assert_eq!(collections, vec!["A", "B"]);
        assert!(trash);
        assert!(rest.get("key").is_none());
        assert_eq!(rest["filename"], json!("paper.pdf"));
        let attachment = AttachmentInfo::from_data(&rest).unwrap();
        assert_eq!(attachment.filename, "paper.pdf");
        assert_eq!(attachment.remote_md5, Some(String::from("abc")));
        assert!(AttachmentInfo::from_data(&json!({"linkMode": "linked_url"})).is_none());
    }
}
