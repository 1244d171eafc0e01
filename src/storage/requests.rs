//! The individual units of work the sync engine runs against the local store.

use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::{OptionalExtension, Transaction};

use crate::error::{BResult, BError};
use crate::models::file_sync::{self, AttachmentUpload};
use crate::models::library::{AccessLevel, Library, LibraryId, VersionField, Versions};
use crate::models::object::{Changes, ObjectType, SyncObject, SyncState};
use crate::models::response::ObjectResponse;
use crate::storage::{self, DbRequest};
use crate::util;

// -----------------------------------------------------------------------------
// libraries
// -----------------------------------------------------------------------------

fn library_from_row(row: &rusqlite::Row) -> rusqlite::Result<(String, String, String, String, i64, bool)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn build_library(raw: (String, String, String, String, i64, bool)) -> BResult<Library> {
    let (id, name, access, versions, meta_version, local_only) = raw;
    Ok(Library {
        id: LibraryId::from_db_key(&id)?,
        name,
        versions: serde_json::from_str(&versions)?,
        access: AccessLevel::from_str(&access)?,
        meta_version,
        local_only,
    })
}

fn load_library(db: &Transaction, id: LibraryId) -> BResult<Option<Library>> {
    let raw = db.query_row(
        "SELECT id, name, access, versions, meta_version, local_only FROM libraries WHERE id = ?1",
        [id.db_key()],
        library_from_row,
    ).optional()?;
    match raw {
        Some(x) => Ok(Some(build_library(x)?)),
        None => Ok(None),
    }
}

/// Create or update a library. Versions of an existing library are kept.
pub struct StoreLibrary(pub Library);

impl DbRequest for StoreLibrary {
    type Response = ();
    fn process(&self, db: &Transaction) -> BResult<()> {
        let lib = &self.0;
        db.execute(
            "INSERT INTO libraries (id, name, access, versions, meta_version, local_only) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                access = excluded.access,
                meta_version = excluded.meta_version,
                local_only = excluded.local_only",
            rusqlite::params![
                lib.id.db_key(),
                lib.name,
                lib.access.as_str(),
                serde_json::to_string(&lib.versions)?,
                lib.meta_version,
                lib.local_only,
            ],
        )?;
        Ok(())
    }
}

/// Load libraries, personal first, then groups by id.
pub struct ReadLibraries {
    pub ids: Option<Vec<LibraryId>>,
}

impl DbRequest for ReadLibraries {
    type Response = Vec<Library>;
    fn process(&self, db: &Transaction) -> BResult<Vec<Library>> {
        let mut stmt = db.prepare("SELECT id, name, access, versions, meta_version, local_only FROM libraries")?;
        let rows = stmt.query_map([], library_from_row)?;
        let mut libraries = Vec::new();
        for row in rows {
            let lib = build_library(row?)?;
            if let Some(ref ids) = self.ids {
                if !ids.contains(&lib.id) { continue; }
            }
            libraries.push(lib);
        }
        libraries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(libraries)
    }
}

pub struct ReadLibrary(pub LibraryId);

impl DbRequest for ReadLibrary {
    type Response = Option<Library>;
    fn process(&self, db: &Transaction) -> BResult<Option<Library>> {
        load_library(db, self.0)
    }
}

/// Remove a library and everything in it
pub struct DeleteLibrary(pub LibraryId);

impl DbRequest for DeleteLibrary {
    type Response = ();
    fn process(&self, db: &Transaction) -> BResult<()> {
        let key = self.0.db_key();
        db.execute("DELETE FROM objects WHERE library_id = ?1", [&key])?;
        db.execute("DELETE FROM resync WHERE library_id = ?1", [&key])?;
        db.execute("DELETE FROM file_deletions WHERE library_id = ?1", [&key])?;
        db.execute("DELETE FROM libraries WHERE id = ?1", [&key])?;
        Ok(())
    }
}

/// Keep a group that's gone remotely as a local-only library
pub struct MarkLibraryLocalOnly(pub LibraryId);

impl DbRequest for MarkLibraryLocalOnly {
    type Response = ();
    fn process(&self, db: &Transaction) -> BResult<()> {
        db.execute("UPDATE libraries SET local_only = 1, access = 'read_only' WHERE id = ?1", [self.0.db_key()])?;
        Ok(())
    }
}

/// Advance one of a library's version counters. Never moves backwards.
pub struct UpdateVersion {
    pub library: LibraryId,
    pub field: VersionField,
    pub version: i64,
}

impl DbRequest for UpdateVersion {
    type Response = Versions;
    fn process(&self, db: &Transaction) -> BResult<Versions> {
        let mut lib = match load_library(db, self.library)? {
            Some(x) => x,
            None => return Err(BError::NotFound(format!("UpdateVersion -- library {}", self.library))),
        };
        if lib.versions.advance(self.field, self.version) {
            db.execute(
                "UPDATE libraries SET versions = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(&lib.versions)?, self.library.db_key()],
            )?;
        }
        Ok(lib.versions)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupVersionsResult {
    /// groups that are new or whose metadata changed
    pub to_update: Vec<i64>,
    /// groups we have locally that the remote no longer lists: (id, name)
    pub removed: Vec<(i64, String)>,
}

/// Compare remote group metadata versions against ours.
pub struct SyncGroupVersions {
    pub versions: HashMap<i64, i64>,
}

impl DbRequest for SyncGroupVersions {
    type Response = GroupVersionsResult;
    fn process(&self, db: &Transaction) -> BResult<GroupVersionsResult> {
        let local = ReadLibraries { ids: None }.process(db)?;
        let mut res = GroupVersionsResult::default();
        let mut local_groups = HashMap::new();
        for lib in local {
            if let Some(id) = lib.id.group_id() {
                if !self.versions.contains_key(&id) && !lib.local_only {
                    res.removed.push((id, lib.name.clone()));
                }
                local_groups.insert(id, lib.meta_version);
            }
        }
        for (id, version) in &self.versions {
            match local_groups.get(id) {
                Some(local_version) if local_version == version => {}
                _ => res.to_update.push(*id),
            }
        }
        res.to_update.sort();
        res.removed.sort();
        Ok(res)
    }
}

// -----------------------------------------------------------------------------
// planning
// -----------------------------------------------------------------------------

/// What the planner needs to know about a local object
#[derive(Debug, Clone, PartialEq)]
pub struct LocalObjectState {
    pub key: String,
    pub version: i64,
    pub parent: Option<String>,
    pub changed: bool,
    pub deleted: bool,
    pub sync_state: SyncState,
}

/// Lightweight listing of a library's objects of one type. Trash lists only
/// trashed items.
pub struct ReadLocalState {
    pub library: LibraryId,
    pub object: ObjectType,
}

impl DbRequest for ReadLocalState {
    type Response = Vec<LocalObjectState>;
    fn process(&self, db: &Transaction) -> BResult<Vec<LocalObjectState>> {
        let mut sql = String::from("SELECT key, version, parent_key, changes, deleted, sync_state FROM objects WHERE library_id = ?1 AND type = ?2");
        if self.object == ObjectType::Trash {
            sql.push_str(" AND trash = 1");
        }
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![self.library.db_key(), self.object.storage_type().as_str()],
            |row| {
                let changes: u32 = row.get(3)?;
                let state: String = row.get(5)?;
                Ok(LocalObjectState {
                    key: row.get(0)?,
                    version: row.get(1)?,
                    parent: row.get(2)?,
                    changed: changes != 0,
                    deleted: row.get(4)?,
                    sync_state: SyncState::from_str(&state),
                })
            },
        )?;
        let mut res = Vec::new();
        for row in rows {
            res.push(row?);
        }
        Ok(res)
    }
}

/// Keys waiting to be re-fetched that are due now. An object's n-th retry
/// waits `delays[min(n, len - 1)]` seconds after its last attempt, and objects
/// at `max_attempts` are skipped for good.
pub struct ReadResyncKeys {
    pub library: LibraryId,
    pub object: ObjectType,
    pub now: i64,
    pub delays: Vec<i64>,
    pub max_attempts: u32,
    pub ignore_delays: bool,
}

impl DbRequest for ReadResyncKeys {
    type Response = Vec<String>;
    fn process(&self, db: &Transaction) -> BResult<Vec<String>> {
        let mut stmt = db.prepare("SELECT key, attempts, last_attempt FROM resync WHERE library_id = ?1 AND type = ?2 ORDER BY key")?;
        let rows = stmt.query_map(
            rusqlite::params![self.library.db_key(), self.object.storage_type().as_str()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, i64>(2)?)),
        )?;
        let mut keys = Vec::new();
        for row in rows {
            let (key, attempts, last_attempt) = row?;
            if attempts >= self.max_attempts { continue; }
            if !self.ignore_delays && self.delays.len() > 0 {
                let idx = std::cmp::min(attempts as usize, self.delays.len() - 1);
                if self.now < last_attempt + self.delays[idx] { continue; }
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

/// Count a failed fetch/store of some objects so they get re-fetched later
pub struct MarkForResync {
    pub library: LibraryId,
    pub object: ObjectType,
    pub keys: Vec<String>,
    pub now: i64,
}

fn mark_for_resync(db: &Transaction, library: LibraryId, object: ObjectType, keys: &[String], now: i64) -> BResult<()> {
    let mut stmt = db.prepare(
        "INSERT INTO resync (library_id, type, key, attempts, last_attempt) VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT (library_id, type, key) DO UPDATE SET attempts = attempts + 1, last_attempt = excluded.last_attempt",
    )?;
    for key in keys {
        stmt.execute(rusqlite::params![library.db_key(), object.storage_type().as_str(), key, now])?;
    }
    Ok(())
}

impl DbRequest for MarkForResync {
    type Response = ();
    fn process(&self, db: &Transaction) -> BResult<()> {
        mark_for_resync(db, self.library, self.object, &self.keys, self.now)
    }
}

// -----------------------------------------------------------------------------
// storing remote objects
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreResult {
    /// every key written
    pub stored: Vec<String>,
    /// local tombstones brought back by a newer remote version
    pub restored: Vec<String>,
    /// objects with local changes that took remote values for the rest
    pub merged: Vec<String>,
    /// referenced objects we don't have, now queued for fetching
    pub missing: Vec<(ObjectType, String)>,
    /// attachments whose remote file differs from ours: (key, parent, filename)
    pub changed_files: Vec<(String, Option<String>, String)>,
}

/// Write a batch of remote objects into the replica.
pub struct StoreObjects {
    pub library: LibraryId,
    pub responses: Vec<ObjectResponse>,
}

impl StoreObjects {
    fn from_remote(library: LibraryId, res: &ObjectResponse) -> SyncObject {
        SyncObject {
            library,
            ty: res.object,
            key: res.key.clone(),
            version: res.version,
            parent: res.parent.clone(),
            collections: res.collections.clone(),
            trash: res.trash,
            deleted: false,
            data: res.data.clone(),
            changes: Changes::NONE,
            sync_state: SyncState::Synced,
            date_modified: if res.date_modified > 0 { res.date_modified } else { util::now() },
            attachment: res.attachment.clone(),
        }
    }

    /// Layer the locally changed fields of `local` over the remote object
    fn merge_local(remote: &mut SyncObject, local: &SyncObject) {
        let changes = local.changes;
        if changes.contains(Changes::PARENT) {
            remote.parent = local.parent.clone();
        }
        if changes.contains(Changes::COLLECTIONS) {
            remote.collections = local.collections.clone();
        }
        if changes.contains(Changes::TRASH) {
            remote.trash = local.trash;
        }
        if let (Some(remote_data), Some(local_data)) = (remote.data.as_object_mut(), local.data.as_object()) {
            for (k, v) in local_data {
                if changes.contains(Changes::for_field(k)) {
                    remote_data.insert(k.clone(), v.clone());
                }
            }
        }
        remote.changes = changes;
        remote.date_modified = local.date_modified;
    }
}

impl DbRequest for StoreObjects {
    type Response = StoreResult;
    fn process(&self, db: &Transaction) -> BResult<StoreResult> {
        let mut result = StoreResult::default();
        let mut written = Vec::with_capacity(self.responses.len());
        for res in &self.responses {
            let existing = storage::get_object(db, self.library, res.object, &res.key)?;
            let mut obj = StoreObjects::from_remote(self.library, res);
            match existing {
                Some(ref local) if local.deleted => {
                    if res.version <= local.version {
                        // our deletion is newer than what they sent
                        continue;
                    }
                    result.restored.push(res.key.clone());
                }
                Some(ref local) if local.is_changed() => {
                    StoreObjects::merge_local(&mut obj, local);
                    result.merged.push(res.key.clone());
                }
                _ => {}
            }
            if let Some(ref mut attachment) = obj.attachment {
                let local_att = existing.as_ref().and_then(|x| x.attachment.as_ref());
                match local_att {
                    Some(local) if local.md5.is_some() && local.md5 == attachment.remote_md5 => {
                        attachment.md5 = local.md5.clone();
                        attachment.downloaded = local.downloaded;
                    }
                    _ => {
                        attachment.downloaded = false;
                        if attachment.remote_md5.is_some() {
                            result.changed_files.push((obj.key.clone(), obj.parent.clone(), attachment.filename.clone()));
                        }
                    }
                }
            }
            storage::save_object(db, &obj)?;
            db.execute(
                "DELETE FROM resync WHERE library_id = ?1 AND type = ?2 AND key = ?3",
                rusqlite::params![self.library.db_key(), obj.ty.as_str(), obj.key],
            )?;
            result.stored.push(obj.key.clone());
            written.push(obj);
        }

        // anything referencing something we don't have gets marked dirty and
        // the missing thing queued for fetching
        for mut obj in written {
            let mut missing_any = false;
            for (ty, key) in obj.references() {
                if storage::object_exists(db, self.library, ty, &key)? { continue; }
                missing_any = true;
                db.execute(
                    "INSERT OR IGNORE INTO resync (library_id, type, key, attempts, last_attempt) VALUES (?1, ?2, ?3, 0, 0)",
                    rusqlite::params![self.library.db_key(), ty.as_str(), key],
                )?;
                if !result.missing.contains(&(ty, key.clone())) {
                    result.missing.push((ty, key));
                }
            }
            if missing_any {
                obj.sync_state = SyncState::Dirty;
                storage::save_object(db, &obj)?;
            }
        }

        // and things that were waiting on what we just stored may be complete
        let dirty = storage::query_objects(
            db,
            "library_id = ?1 AND sync_state = 'dirty'",
            &[&self.library.db_key()],
        )?;
        for mut obj in dirty {
            let mut complete = true;
            for (ty, key) in obj.references() {
                if !storage::object_exists(db, self.library, ty, &key)? {
                    complete = false;
                    break;
                }
            }
            if complete {
                obj.sync_state = SyncState::Synced;
                storage::save_object(db, &obj)?;
            }
        }
        Ok(result)
    }
}

// -----------------------------------------------------------------------------
// local objects
// -----------------------------------------------------------------------------

pub struct ReadObject {
    pub library: LibraryId,
    pub object: ObjectType,
    pub key: String,
}

impl DbRequest for ReadObject {
    type Response = Option<SyncObject>;
    fn process(&self, db: &Transaction) -> BResult<Option<SyncObject>> {
        storage::get_object(db, self.library, self.object, &self.key)
    }
}

/// Load the objects for a set of keys (missing ones are skipped)
pub struct ReadObjects {
    pub library: LibraryId,
    pub object: ObjectType,
    pub keys: Vec<String>,
}

impl DbRequest for ReadObjects {
    type Response = Vec<SyncObject>;
    fn process(&self, db: &Transaction) -> BResult<Vec<SyncObject>> {
        let mut objects = Vec::new();
        for key in &self.keys {
            if let Some(obj) = storage::get_object(db, self.library, self.object, key)? {
                objects.push(obj);
            }
        }
        Ok(objects)
    }
}

/// Save a locally created/edited object
pub struct SaveObject(pub SyncObject);

impl DbRequest for SaveObject {
    type Response = ();
    fn process(&self, db: &Transaction) -> BResult<()> {
        storage::save_object(db, &self.0)
    }
}

/// Objects with local changes waiting to go up, least recently modified first.
/// Objects that failed to upload too many times are left out.
pub struct ReadUpdates {
    pub library: LibraryId,
    pub object: ObjectType,
    pub max_attempts: u32,
}

impl DbRequest for ReadUpdates {
    type Response = Vec<SyncObject>;
    fn process(&self, db: &Transaction) -> BResult<Vec<SyncObject>> {
        storage::query_objects(
            db,
            "library_id = ?1 AND type = ?2 AND changes != 0 AND deleted = 0 AND upload_attempts < ?3 ORDER BY date_modified ASC, key ASC",
            &[&self.library.db_key(), &self.object.storage_type().as_str(), &self.max_attempts],
        )
    }
}

/// Keys of synced objects deleted locally
pub struct ReadDeletions {
    pub library: LibraryId,
    pub object: ObjectType,
}

impl DbRequest for ReadDeletions {
    type Response = Vec<String>;
    fn process(&self, db: &Transaction) -> BResult<Vec<String>> {
        let mut stmt = db.prepare("SELECT key FROM objects WHERE library_id = ?1 AND type = ?2 AND deleted = 1 AND version > 0 ORDER BY key")?;
        let rows = stmt.query_map(
            rusqlite::params![self.library.db_key(), self.object.storage_type().as_str()],
            |row| row.get::<_, String>(0),
        )?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

/// Objects created and deleted locally without ever reaching the remote need
/// no remote deletion. Drop them.
pub struct PurgeUnsyncedDeletions {
    pub library: LibraryId,
}

impl DbRequest for PurgeUnsyncedDeletions {
    type Response = usize;
    fn process(&self, db: &Transaction) -> BResult<usize> {
        Ok(db.execute("DELETE FROM objects WHERE library_id = ?1 AND deleted = 1 AND version = 0", [self.library.db_key()])?)
    }
}

/// Apply the result of an accepted write: new version (if given), change
/// markers cleared.
pub struct MarkObjectsAsSynced {
    pub library: LibraryId,
    pub object: ObjectType,
    pub keys: Vec<String>,
    pub version: Option<i64>,
}

impl DbRequest for MarkObjectsAsSynced {
    type Response = ();
    fn process(&self, db: &Transaction) -> BResult<()> {
        let mut stmt = db.prepare(
            "UPDATE objects SET version = COALESCE(?1, version), changes = 0, upload_attempts = 0 WHERE library_id = ?2 AND type = ?3 AND key = ?4",
        )?;
        for key in &self.keys {
            stmt.execute(rusqlite::params![self.version, self.library.db_key(), self.object.storage_type().as_str(), key])?;
        }
        Ok(())
    }
}

/// Count rejected uploads
pub struct MarkUploadFailed {
    pub library: LibraryId,
    pub object: ObjectType,
    pub keys: Vec<String>,
}

impl DbRequest for MarkUploadFailed {
    type Response = ();
    fn process(&self, db: &Transaction) -> BResult<()> {
        let mut stmt = db.prepare(
            "UPDATE objects SET upload_attempts = upload_attempts + 1 WHERE library_id = ?1 AND type = ?2 AND key = ?3",
        )?;
        for key in &self.keys {
            stmt.execute(rusqlite::params![self.library.db_key(), self.object.storage_type().as_str(), key])?;
        }
        Ok(())
    }
}

/// Remove objects for good (tombstones after a confirmed remote deletion)
pub struct DeleteObjects {
    pub library: LibraryId,
    pub object: ObjectType,
    pub keys: Vec<String>,
}

impl DbRequest for DeleteObjects {
    type Response = ();
    fn process(&self, db: &Transaction) -> BResult<()> {
        let mut stmt = db.prepare("DELETE FROM objects WHERE library_id = ?1 AND type = ?2 AND key = ?3")?;
        for key in &self.keys {
            stmt.execute(rusqlite::params![self.library.db_key(), self.object.storage_type().as_str(), key])?;
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// conflict resolutions
// -----------------------------------------------------------------------------

/// What to do with one local object that conflicts with a remote deletion.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// drop local changes, the deletion wins
    RevertLocal,
    /// keep the local object and push it again as new
    KeepLocalAndRequeue,
    /// delete a collection but move its children to `parent`
    MergeChildrenIntoParent { parent: Option<String> },
    /// the object was restored remotely in the meantime; ignore the deletion
    DiscardDeletion,
    /// leave it alone and look again later
    DeferToRetry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectResolution {
    pub object: ObjectType,
    pub key: String,
    pub resolution: Resolution,
}

/// Apply a set of resolutions in one go. Each one checks current state first,
/// so applying the same set twice changes nothing the second time.
pub struct ApplyResolutions {
    pub library: LibraryId,
    pub resolutions: Vec<ObjectResolution>,
    pub now: i64,
}

impl ApplyResolutions {
    fn delete_object(&self, db: &Transaction, object: ObjectType, key: &str) -> BResult<()> {
        let lib = self.library.db_key();
        let ty = object.storage_type();
        db.execute(
            "DELETE FROM objects WHERE library_id = ?1 AND type = ?2 AND key = ?3",
            rusqlite::params![lib, ty.as_str(), key],
        )?;
        match ty {
            ObjectType::Item => {
                // notes and attachments go with their parent
                db.execute(
                    "DELETE FROM objects WHERE library_id = ?1 AND type = 'item' AND parent_key = ?2",
                    rusqlite::params![lib, key],
                )?;
            }
            ObjectType::Collection => {
                self.replace_membership(db, key, None, false)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Swap collection `key` for `parent` in item memberships
    fn replace_membership(&self, db: &Transaction, key: &str, parent: Option<&str>, mark_changed: bool) -> BResult<()> {
        let pattern = format!("%\"{}\"%", key);
        let items = storage::query_objects(
            db,
            "library_id = ?1 AND type = 'item' AND collections LIKE ?2",
            &[&self.library.db_key(), &pattern],
        )?;
        for mut item in items {
            let mut collections = item.collections.iter()
                .filter(|x| x.as_str() != key)
                .cloned()
                .collect::<Vec<_>>();
            if let Some(parent) = parent {
                if !collections.iter().any(|x| x == parent) {
                    collections.push(String::from(parent));
                }
            }
            item.collections = collections;
            if mark_changed {
                item.changes.insert(Changes::COLLECTIONS);
            }
            storage::save_object(db, &item)?;
        }
        Ok(())
    }

    fn apply(&self, db: &Transaction, res: &ObjectResolution) -> BResult<bool> {
        let existing = storage::get_object(db, self.library, res.object, &res.key)?;
        let mut obj = match existing {
            Some(x) => x,
            None => return Ok(false),
        };
        match res.resolution {
            Resolution::RevertLocal => {
                self.delete_object(db, res.object, &res.key)?;
            }
            Resolution::KeepLocalAndRequeue => {
                if obj.version == 0 && obj.changes == Changes::ALL && !obj.deleted { return Ok(false); }
                obj.version = 0;
                obj.changes = Changes::ALL;
                obj.deleted = false;
                storage::save_object(db, &obj)?;
            }
            Resolution::MergeChildrenIntoParent { ref parent } => {
                let subs = storage::query_objects(
                    db,
                    "library_id = ?1 AND type = 'collection' AND parent_key = ?2",
                    &[&self.library.db_key(), &res.key],
                )?;
                for mut sub in subs {
                    sub.parent = parent.clone();
                    sub.changes.insert(Changes::PARENT);
                    storage::save_object(db, &sub)?;
                }
                self.replace_membership(db, &res.key, parent.as_ref().map(|x| x.as_str()), true)?;
                db.execute(
                    "DELETE FROM objects WHERE library_id = ?1 AND type = ?2 AND key = ?3",
                    rusqlite::params![self.library.db_key(), res.object.storage_type().as_str(), res.key],
                )?;
            }
            Resolution::DiscardDeletion => {
                if !obj.deleted { return Ok(false); }
                obj.deleted = false;
                storage::save_object(db, &obj)?;
            }
            Resolution::DeferToRetry => {
                mark_for_resync(db, self.library, res.object, &[res.key.clone()], self.now)?;
            }
        }
        Ok(true)
    }
}

impl DbRequest for ApplyResolutions {
    type Response = usize;
    fn process(&self, db: &Transaction) -> BResult<usize> {
        let mut applied = 0;
        for res in &self.resolutions {
            if self.apply(db, res)? {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

/// Throw away a library's unsynced local changes and queue the touched objects
/// for re-fetching.
pub struct RevertLibraryUpdates {
    pub library: LibraryId,
}

impl DbRequest for RevertLibraryUpdates {
    type Response = usize;
    fn process(&self, db: &Transaction) -> BResult<usize> {
        let lib = self.library.db_key();
        let mut reverted = db.execute(
            "DELETE FROM objects WHERE library_id = ?1 AND version = 0 AND (changes != 0 OR deleted = 1)",
            [&lib],
        )?;
        let touched = storage::query_objects(db, "library_id = ?1 AND (changes != 0 OR deleted = 1)", &[&lib])?;
        for mut obj in touched {
            db.execute(
                "INSERT OR IGNORE INTO resync (library_id, type, key, attempts, last_attempt) VALUES (?1, ?2, ?3, 0, 0)",
                rusqlite::params![lib, obj.ty.as_str(), obj.key],
            )?;
            obj.changes = Changes::NONE;
            obj.deleted = false;
            storage::save_object(db, &obj)?;
            reverted += 1;
        }
        Ok(reverted)
    }
}

/// Keep a library's local changes locally but stop trying to push them.
pub struct MarkChangesAsResolved {
    pub library: LibraryId,
}

impl DbRequest for MarkChangesAsResolved {
    type Response = usize;
    fn process(&self, db: &Transaction) -> BResult<usize> {
        let lib = self.library.db_key();
        let changed = db.execute("UPDATE objects SET changes = 0 WHERE library_id = ?1 AND changes != 0", [&lib])?;
        let deleted = db.execute("DELETE FROM objects WHERE library_id = ?1 AND deleted = 1", [&lib])?;
        Ok(changed + deleted)
    }
}

// -----------------------------------------------------------------------------
// attachments
// -----------------------------------------------------------------------------

/// Attachments with a local file the remote hasn't seen. Items with unsynced
/// metadata are left out; their metadata has to go up first.
pub struct ReadAttachmentUploads {
    pub library: LibraryId,
    pub folder: PathBuf,
}

impl DbRequest for ReadAttachmentUploads {
    type Response = Vec<AttachmentUpload>;
    fn process(&self, db: &Transaction) -> BResult<Vec<AttachmentUpload>> {
        let items = storage::query_objects(
            db,
            "library_id = ?1 AND type = 'item' AND attachment IS NOT NULL AND changes = 0 AND deleted = 0 AND version > 0 ORDER BY key",
            &[&self.library.db_key()],
        )?;
        let mut uploads = Vec::new();
        for item in items {
            let att = match item.attachment {
                Some(ref x) if x.needs_upload => x,
                _ => continue,
            };
            let md5 = match att.md5 {
                Some(ref x) => x.clone(),
                None => continue,
            };
            uploads.push(AttachmentUpload {
                key: item.key.clone(),
                library: self.library,
                filename: att.filename.clone(),
                content_type: att.content_type.clone().unwrap_or_else(|| String::from("application/octet-stream")),
                md5,
                mtime: att.mtime.unwrap_or(0),
                file: file_sync::attachment_path(&self.folder, self.library, &item.key, &att.filename),
                remote_md5: att.remote_md5.clone(),
                parent_key: item.parent.clone(),
            });
        }
        Ok(uploads)
    }
}

fn update_attachment<F>(db: &Transaction, library: LibraryId, key: &str, update: F) -> BResult<bool>
    where F: FnOnce(&mut crate::models::object::AttachmentInfo)
{
    let mut item = match storage::get_object(db, library, ObjectType::Item, key)? {
        Some(x) => x,
        None => return Ok(false),
    };
    match item.attachment {
        Some(ref mut att) => update(att),
        None => return Ok(false),
    }
    storage::save_object(db, &item)?;
    Ok(true)
}

/// The remote now has the file with this hash
pub struct MarkAttachmentUploaded {
    pub library: LibraryId,
    pub key: String,
    pub md5: String,
}

impl DbRequest for MarkAttachmentUploaded {
    type Response = bool;
    fn process(&self, db: &Transaction) -> BResult<bool> {
        let md5 = self.md5.clone();
        update_attachment(db, self.library, &self.key, move |att| {
            att.needs_upload = false;
            att.md5 = Some(md5.clone());
            att.remote_md5 = Some(md5);
        })
    }
}

pub struct MarkFileAsDownloaded {
    pub library: LibraryId,
    pub key: String,
    pub downloaded: bool,
}

impl DbRequest for MarkFileAsDownloaded {
    type Response = bool;
    fn process(&self, db: &Transaction) -> BResult<bool> {
        let downloaded = self.downloaded;
        update_attachment(db, self.library, &self.key, move |att| {
            att.downloaded = downloaded;
            if downloaded {
                att.md5 = att.remote_md5.clone();
            }
        })
    }
}

/// Put an attachment back the way the remote has it: its local changes are
/// dropped and the file has to come down again. Returns (key, parent,
/// filename) for the ones the remote has a file for.
pub struct RevertAttachmentFiles {
    pub library: LibraryId,
    pub keys: Vec<String>,
}

impl DbRequest for RevertAttachmentFiles {
    type Response = Vec<(String, Option<String>, String)>;
    fn process(&self, db: &Transaction) -> BResult<Vec<(String, Option<String>, String)>> {
        let mut reverted = Vec::new();
        for key in &self.keys {
            let mut item = match storage::get_object(db, self.library, ObjectType::Item, key)? {
                Some(x) => x,
                None => continue,
            };
            let remote = match item.attachment {
                Some(ref mut att) => {
                    att.needs_upload = false;
                    att.md5 = att.remote_md5.clone();
                    att.downloaded = false;
                    att.remote_md5.is_some()
                }
                None => continue,
            };
            storage::save_object(db, &item)?;
            if remote {
                let filename = item.attachment.as_ref().map(|x| x.filename.clone()).unwrap_or_else(String::new);
                reverted.push((item.key.clone(), item.parent.clone(), filename));
            }
        }
        Ok(reverted)
    }
}

/// Remember the stored files of these items need deleting remotely. Keys
/// that aren't attachments are skipped. Must run before the items are gone.
pub struct QueueFileDeletions {
    pub library: LibraryId,
    pub keys: Vec<String>,
}

impl DbRequest for QueueFileDeletions {
    type Response = usize;
    fn process(&self, db: &Transaction) -> BResult<usize> {
        let mut queued = 0;
        for key in &self.keys {
            let has_file = storage::get_object(db, self.library, ObjectType::Item, key)?
                .map(|x| x.attachment.is_some())
                .unwrap_or(false);
            if !has_file { continue; }
            db.execute(
                "INSERT OR IGNORE INTO file_deletions (library_id, key) VALUES (?1, ?2)",
                rusqlite::params![self.library.db_key(), key],
            )?;
            queued += 1;
        }
        Ok(queued)
    }
}

pub struct ReadFileDeletions(pub LibraryId);

impl DbRequest for ReadFileDeletions {
    type Response = Vec<String>;
    fn process(&self, db: &Transaction) -> BResult<Vec<String>> {
        let mut stmt = db.prepare("SELECT key FROM file_deletions WHERE library_id = ?1 ORDER BY key")?;
        let rows = stmt.query_map([&self.0.db_key()], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }
}

/// The remote confirmed these files are gone
pub struct ClearFileDeletions {
    pub library: LibraryId,
    pub keys: Vec<String>,
}

impl DbRequest for ClearFileDeletions {
    type Response = ();
    fn process(&self, db: &Transaction) -> BResult<()> {
        let mut stmt = db.prepare("DELETE FROM file_deletions WHERE library_id = ?1 AND key = ?2")?;
        for key in &self.keys {
            stmt.execute(rusqlite::params![self.library.db_key(), key])?;
        }
        Ok(())
    }
}

/// Whether an item still has unsynced metadata
pub struct CheckItemIsChanged {
    pub library: LibraryId,
    pub key: String,
}

impl DbRequest for CheckItemIsChanged {
    type Response = bool;
    fn process(&self, db: &Transaction) -> BResult<bool> {
        match storage::get_object(db, self.library, ObjectType::Item, &self.key)? {
            Some(item) => Ok(item.is_changed() || item.version == 0),
            None => Err(BError::NotFound(format!("CheckItemIsChanged -- item {}", self.key))),
        }
    }
}

/// Sub-collections of a collection and the items filed in it
pub struct ReadCollectionChildren {
    pub library: LibraryId,
    pub key: String,
}

impl DbRequest for ReadCollectionChildren {
    type Response = Vec<SyncObject>;
    fn process(&self, db: &Transaction) -> BResult<Vec<SyncObject>> {
        let lib = self.library.db_key();
        let mut children = storage::query_objects(
            db,
            "library_id = ?1 AND type = 'collection' AND parent_key = ?2 AND deleted = 0 ORDER BY key",
            &[&lib, &self.key],
        )?;
        let pattern = format!("%\"{}\"%", self.key);
        let items = storage::query_objects(
            db,
            "library_id = ?1 AND type = 'item' AND collections LIKE ?2 AND deleted = 0 ORDER BY key",
            &[&lib, &pattern],
        )?;
        children.extend(items.into_iter().filter(|x| x.collections.contains(&self.key)));
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn remote(object: ObjectType, key: &str, version: i64, data: serde_json::Value) -> ObjectResponse {
        ObjectResponse::parse(object, &json!({"key": key, "version": version, "data": data})).unwrap()
    }

    fn storage() -> Storage {
        let storage = Storage::new(":memory:").unwrap();
        storage.perform(&StoreLibrary(Library::new(LibraryId::Personal, "My Library", AccessLevel::Editable))).unwrap();
        storage
    }

    fn read(storage: &Storage, object: ObjectType, key: &str) -> Option<SyncObject> {
        storage.perform(&ReadObject { library: LibraryId::Personal, object, key: String::from(key) }).unwrap()
    }

    #[test]
    fn versions_only_advance() {
        let storage = storage();
        let field = VersionField::Object(ObjectType::Item);
        let versions = storage.perform(&UpdateVersion { library: LibraryId::Personal, field, version: 10 }).unwrap();
        assert_eq!(versions.items, 10);
        let versions = storage.perform(&UpdateVersion { library: LibraryId::Personal, field, version: 4 }).unwrap();
        assert_eq!(versions.items, 10);
        // storing the library again leaves versions alone
        storage.perform(&StoreLibrary(Library::new(LibraryId::Personal, "Renamed", AccessLevel::Editable))).unwrap();
        let lib = storage.perform(&ReadLibrary(LibraryId::Personal)).unwrap().unwrap();
        assert_eq!(lib.name, "Renamed");
        assert_eq!(lib.versions.items, 10);
    }

    #[test]
    fn group_versions_diff() {
        let storage = storage();
        let mut lab = Library::new(LibraryId::Group(1), "Lab", AccessLevel::Editable);
        lab.meta_version = 3;
        storage.perform(&StoreLibrary(lab)).unwrap();
        storage.perform(&StoreLibrary(Library::new(LibraryId::Group(2), "Old", AccessLevel::Editable))).unwrap();
        let mut versions = HashMap::new();
        versions.insert(1, 3);
        versions.insert(5, 1);
        let res = storage.perform(&SyncGroupVersions { versions }).unwrap();
        assert_eq!(res.to_update, vec![5]);
        assert_eq!(res.removed, vec![(2, String::from("Old"))]);
    }

    #[test]
    fn missing_parents_mark_dirty_until_they_arrive() {
        let storage = storage();
        let child = remote(ObjectType::Collection, "CHILD001", 5, json!({"name": "Child", "parentCollection": "PARENT01"}));
        let res = storage.perform(&StoreObjects { library: LibraryId::Personal, responses: vec![child] }).unwrap();
        assert_eq!(res.missing, vec![(ObjectType::Collection, String::from("PARENT01"))]);
        assert_eq!(read(&storage, ObjectType::Collection, "CHILD001").unwrap().sync_state, SyncState::Dirty);

        let resync = storage.perform(&ReadResyncKeys {
            library: LibraryId::Personal,
            object: ObjectType::Collection,
            now: 100,
            delays: vec![0, 60],
            max_attempts: 3,
            ignore_delays: false,
        }).unwrap();
        assert_eq!(resync, vec!["PARENT01"]);

        let parent = remote(ObjectType::Collection, "PARENT01", 5, json!({"name": "Parent", "parentCollection": false}));
        storage.perform(&StoreObjects { library: LibraryId::Personal, responses: vec![parent] }).unwrap();
        assert_eq!(read(&storage, ObjectType::Collection, "CHILD001").unwrap().sync_state, SyncState::Synced);
        let resync = storage.perform(&ReadResyncKeys {
            library: LibraryId::Personal,
            object: ObjectType::Collection,
            now: 100,
            delays: vec![],
            max_attempts: 3,
            ignore_delays: true,
        }).unwrap();
        assert!(resync.is_empty());
    }

    #[test]
    fn resync_respects_delays_and_caps() {
        let storage = storage();
        let keys = vec![String::from("ITEM0001")];
        storage.perform(&MarkForResync { library: LibraryId::Personal, object: ObjectType::Item, keys: keys.clone(), now: 1000 }).unwrap();
        let read_at = |now: i64, ignore: bool| storage.perform(&ReadResyncKeys {
            library: LibraryId::Personal,
            object: ObjectType::Item,
            now,
            delays: vec![0, 60, 600],
            max_attempts: 2,
            ignore_delays: ignore,
        }).unwrap();
        assert!(read_at(1010, false).is_empty());
        assert_eq!(read_at(1060, false), keys);
        assert_eq!(read_at(1010, true), keys);
        storage.perform(&MarkForResync { library: LibraryId::Personal, object: ObjectType::Item, keys: keys.clone(), now: 2000 }).unwrap();
        assert!(read_at(5000, true).is_empty());
    }

    #[test]
    fn remote_values_merge_under_local_changes() {
        let storage = storage();
        let base = remote(ObjectType::Item, "ITEM0001", 3, json!({"itemType": "book", "title": "Dune", "publisher": "Chilton"}));
        storage.perform(&StoreObjects { library: LibraryId::Personal, responses: vec![base] }).unwrap();
        let mut local = read(&storage, ObjectType::Item, "ITEM0001").unwrap();
        local.set_collections(vec![String::from("COLL0001")]);
        storage.perform(&SaveObject(local)).unwrap();

        let newer = remote(ObjectType::Item, "ITEM0001", 7, json!({"itemType": "book", "title": "Dune Messiah", "publisher": "Putnam"}));
        let res = storage.perform(&StoreObjects { library: LibraryId::Personal, responses: vec![newer] }).unwrap();
        assert_eq!(res.merged, vec!["ITEM0001"]);
        let merged = read(&storage, ObjectType::Item, "ITEM0001").unwrap();
        assert_eq!(merged.version, 7);
        assert_eq!(merged.data["title"], json!("Dune Messiah"));
        assert_eq!(merged.collections, vec!["COLL0001"]);
        assert!(merged.changes.contains(Changes::COLLECTIONS));
    }

    #[test]
    fn newer_remote_version_restores_tombstones() {
        let storage = storage();
        let mut col = SyncObject::new(LibraryId::Personal, ObjectType::Collection, "COLL0001");
        col.set_name("Old");
        col.mark_deleted();
        storage.perform(&SaveObject(col)).unwrap();
        let res = storage.perform(&StoreObjects {
            library: LibraryId::Personal,
            responses: vec![remote(ObjectType::Collection, "COLL0001", 1, json!({"name": "Remote"}))],
        }).unwrap();
        assert_eq!(res.restored, vec!["COLL0001"]);
        let restored = read(&storage, ObjectType::Collection, "COLL0001").unwrap();
        assert!(!restored.deleted);
        assert_eq!(restored.version, 1);
        assert_eq!(restored.data["name"], json!("Remote"));
    }

    #[test]
    fn resolutions_are_idempotent() {
        let storage = storage();
        let responses = vec![
            remote(ObjectType::Collection, "PARENT01", 2, json!({"name": "Parent"})),
            remote(ObjectType::Collection, "DOOMED01", 2, json!({"name": "Doomed", "parentCollection": "PARENT01"})),
            remote(ObjectType::Collection, "SUBCOL01", 2, json!({"name": "Sub", "parentCollection": "DOOMED01"})),
            remote(ObjectType::Item, "ITEM0001", 2, json!({"itemType": "book", "collections": ["DOOMED01"]})),
        ];
        storage.perform(&StoreObjects { library: LibraryId::Personal, responses }).unwrap();
        let apply = ApplyResolutions {
            library: LibraryId::Personal,
            resolutions: vec![ObjectResolution {
                object: ObjectType::Collection,
                key: String::from("DOOMED01"),
                resolution: Resolution::MergeChildrenIntoParent { parent: Some(String::from("PARENT01")) },
            }],
            now: 100,
        };
        assert_eq!(storage.perform(&apply).unwrap(), 1);
        assert_eq!(storage.perform(&apply).unwrap(), 0);
        assert!(read(&storage, ObjectType::Collection, "DOOMED01").is_none());
        let sub = read(&storage, ObjectType::Collection, "SUBCOL01").unwrap();
        assert_eq!(sub.parent, Some(String::from("PARENT01")));
        assert!(sub.changes.contains(Changes::PARENT));
        let item = read(&storage, ObjectType::Item, "ITEM0001").unwrap();
        assert_eq!(item.collections, vec!["PARENT01"]);
    }

    #[test]
    fn reverting_a_library() {
        let storage = storage();
        storage.perform(&StoreObjects {
            library: LibraryId::Personal,
            responses: vec![remote(ObjectType::Item, "ITEM0001", 2, json!({"itemType": "book", "title": "A"}))],
        }).unwrap();
        let mut edited = read(&storage, ObjectType::Item, "ITEM0001").unwrap();
        edited.set_field("title", json!("B"));
        storage.perform(&SaveObject(edited)).unwrap();
        let mut created = SyncObject::new(LibraryId::Personal, ObjectType::Item, "ITEM0002");
        created.set_field("itemType", json!("note"));
        storage.perform(&SaveObject(created)).unwrap();

        assert_eq!(storage.perform(&RevertLibraryUpdates { library: LibraryId::Personal }).unwrap(), 2);
        assert!(read(&storage, ObjectType::Item, "ITEM0002").is_none());
        assert!(!read(&storage, ObjectType::Item, "ITEM0001").unwrap().is_changed());
        let resync = storage.perform(&ReadResyncKeys {
            library: LibraryId::Personal,
            object: ObjectType::Item,
            now: 0,
            delays: vec![],
            max_attempts: 1,
            ignore_delays: true,
        }).unwrap();
        assert_eq!(resync, vec!["ITEM0001"]);
    }

    fn attachment(key: &str, remote_md5: Option<&str>) -> SyncObject {
        let data = json!({"itemType": "attachment", "linkMode": "imported_file", "filename": "paper.pdf", "parentItem": "ITEMPRNT"});
        let mut item = SyncObject::new(LibraryId::Personal, ObjectType::Item, key);
        item.version = 3;
        item.parent = Some(String::from("ITEMPRNT"));
        item.data = data.clone();
        item.changes = Default::default();
        let mut att = crate::models::object::AttachmentInfo::from_data(&data).unwrap();
        att.remote_md5 = remote_md5.map(String::from);
        att.md5 = Some(String::from("localmd5"));
        att.needs_upload = true;
        att.downloaded = true;
        item.attachment = Some(att);
        item
    }

    #[test]
    fn file_deletions_queue_until_cleared() {
        let storage = storage();
        storage.perform(&SaveObject(attachment("ATT00001", Some("remotemd5")))).unwrap();
        let mut note = SyncObject::new(LibraryId::Personal, ObjectType::Item, "NOTE0001");
        note.set_field("itemType", json!("note"));
        storage.perform(&SaveObject(note)).unwrap();

        let keys = vec![String::from("ATT00001"), String::from("NOTE0001"), String::from("GONE0001")];
        assert_eq!(storage.perform(&QueueFileDeletions { library: LibraryId::Personal, keys: keys.clone() }).unwrap(), 1);
        // queueing twice is harmless
        storage.perform(&QueueFileDeletions { library: LibraryId::Personal, keys }).unwrap();
        assert_eq!(storage.perform(&ReadFileDeletions(LibraryId::Personal)).unwrap(), vec!["ATT00001"]);
        assert_eq!(storage.perform(&ReadFileDeletions(LibraryId::Group(3))).unwrap().len(), 0);

        storage.perform(&ClearFileDeletions { library: LibraryId::Personal, keys: vec![String::from("ATT00001")] }).unwrap();
        assert_eq!(storage.perform(&ReadFileDeletions(LibraryId::Personal)).unwrap().len(), 0);
    }

    #[test]
    fn reverting_attachment_files() {
        let storage = storage();
        storage.perform(&SaveObject(attachment("ATT00001", Some("remotemd5")))).unwrap();
        storage.perform(&SaveObject(attachment("ATT00002", None))).unwrap();
        let keys = vec![String::from("ATT00001"), String::from("ATT00002")];
        let reverted = storage.perform(&RevertAttachmentFiles { library: LibraryId::Personal, keys }).unwrap();
        assert_eq!(reverted, vec![(String::from("ATT00001"), Some(String::from("ITEMPRNT")), String::from("paper.pdf"))]);

        let att = read(&storage, ObjectType::Item, "ATT00001").unwrap().attachment.unwrap();
        assert!(!att.needs_upload && !att.downloaded);
        assert_eq!(att.md5, Some(String::from("remotemd5")));
        let att = read(&storage, ObjectType::Item, "ATT00002").unwrap().attachment.unwrap();
        assert!(!att.needs_upload);
        assert_eq!(att.md5, None);
    }
}
