//! The storage module keeps the local replica: libraries and their version
//! vectors, objects with their change markers, and the log of objects waiting
//! to be re-fetched. Everything goes through `Storage::perform()`, which runs
//! one request in one transaction.

use std::sync::Mutex;

use rusqlite::{Connection, Transaction, ToSql, Row};

use crate::error::BResult;
use crate::models::library::LibraryId;
use crate::models::object::{Changes, ObjectType, SyncObject, SyncState};

pub mod requests;

/// A unit of work against the local store. Runs inside a transaction that
/// commits only if `process()` returns Ok.
pub trait DbRequest {
    type Response;
    fn process(&self, db: &Transaction) -> BResult<Self::Response>;
}

const SCHEMA: &'static [&'static str] = &[
    "CREATE TABLE IF NOT EXISTS libraries (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        access TEXT NOT NULL DEFAULT 'editable',
        versions TEXT NOT NULL DEFAULT '{}',
        meta_version INTEGER NOT NULL DEFAULT 0,
        local_only INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS objects (
        library_id TEXT NOT NULL,
        type TEXT NOT NULL,
        key TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        parent_key TEXT,
        collections TEXT NOT NULL DEFAULT '[]',
        trash INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        data TEXT NOT NULL DEFAULT '{}',
        changes INTEGER NOT NULL DEFAULT 0,
        sync_state TEXT NOT NULL DEFAULT 'synced',
        date_modified INTEGER NOT NULL DEFAULT 0,
        attachment TEXT,
        upload_attempts INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (library_id, type, key)
    )",
    "CREATE INDEX IF NOT EXISTS objects_parent ON objects (library_id, type, parent_key)",
    "CREATE TABLE IF NOT EXISTS resync (
        library_id TEXT NOT NULL,
        type TEXT NOT NULL,
        key TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (library_id, type, key)
    )",
    "CREATE TABLE IF NOT EXISTS file_deletions (
        library_id TEXT NOT NULL,
        key TEXT NOT NULL,
        PRIMARY KEY (library_id, key)
    )",
];

/// This structure holds our connection to the local replica.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Make a Storage lol. Pass ":memory:" for a throwaway in-memory db.
    pub fn new(location: &str) -> BResult<Storage> {
        let conn = if location == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(location)?
        };
        for stmt in SCHEMA {
            conn.execute(stmt, [])?;
        }
        Ok(Storage {
            conn: Mutex::new(conn),
        })
    }

    /// Run a request in its own transaction
    pub fn perform<R: DbRequest>(&self, request: &R) -> BResult<R::Response> {
        let mut conn = lock!(self.conn);
        let tx = conn.transaction()?;
        let res = request.process(&tx)?;
        tx.commit()?;
        Ok(res)
    }
}

const OBJECT_COLUMNS: &'static str = "library_id, type, key, version, parent_key, collections, trash, deleted, data, changes, sync_state, date_modified, attachment";

/// Raw column values, before any json gets parsed
struct ObjectRow {
    library: String,
    ty: String,
    key: String,
    version: i64,
    parent: Option<String>,
    collections: String,
    trash: bool,
    deleted: bool,
    data: String,
    changes: u32,
    sync_state: String,
    date_modified: i64,
    attachment: Option<String>,
}

impl ObjectRow {
    fn from_row(row: &Row) -> rusqlite::Result<ObjectRow> {
        Ok(ObjectRow {
            library: row.get(0)?,
            ty: row.get(1)?,
            key: row.get(2)?,
            version: row.get(3)?,
            parent: row.get(4)?,
            collections: row.get(5)?,
            trash: row.get(6)?,
            deleted: row.get(7)?,
            data: row.get(8)?,
            changes: row.get(9)?,
            sync_state: row.get(10)?,
            date_modified: row.get(11)?,
            attachment: row.get(12)?,
        })
    }

    fn into_object(self) -> BResult<SyncObject> {
        let attachment = match self.attachment {
            Some(ref x) => Some(serde_json::from_str(x)?),
            None => None,
        };
        Ok(SyncObject {
            library: LibraryId::from_db_key(&self.library)?,
            ty: ObjectType::from_str(&self.ty)?,
            key: self.key,
            version: self.version,
            parent: self.parent,
            collections: serde_json::from_str(&self.collections)?,
            trash: self.trash,
            deleted: self.deleted,
            data: serde_json::from_str(&self.data)?,
            changes: Changes::from_bits(self.changes),
            sync_state: SyncState::from_str(&self.sync_state),
            date_modified: self.date_modified,
            attachment,
        })
    }
}

/// Load objects matching a where clause
pub(crate) fn query_objects(db: &Connection, where_clause: &str, params: &[&dyn ToSql]) -> BResult<Vec<SyncObject>> {
    let sql = format!("SELECT {} FROM objects WHERE {}", OBJECT_COLUMNS, where_clause);
    let mut stmt = db.prepare(&sql)?;
    let rows = stmt.query_map(params, ObjectRow::from_row)?;
    let mut objects = Vec::new();
    for row in rows {
        objects.push(row?.into_object()?);
    }
    Ok(objects)
}

/// Load one object by its identity
pub(crate) fn get_object(db: &Connection, library: LibraryId, ty: ObjectType, key: &str) -> BResult<Option<SyncObject>> {
    let mut objects = query_objects(
        db,
        "library_id = ?1 AND type = ?2 AND key = ?3",
        &[&library.db_key(), &ty.storage_type().as_str(), &key],
    )?;
    Ok(objects.pop())
}

/// Insert or overwrite an object. The upload failure counter survives.
pub(crate) fn save_object(db: &Connection, obj: &SyncObject) -> BResult<()> {
    let attachment = match obj.attachment {
        Some(ref x) => Some(serde_json::to_string(x)?),
        None => None,
    };
    let sql = format!(
        "INSERT INTO objects ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT (library_id, type, key) DO UPDATE SET
            version = excluded.version,
            parent_key = excluded.parent_key,
            collections = excluded.collections,
            trash = excluded.trash,
            deleted = excluded.deleted,
            data = excluded.data,
            changes = excluded.changes,
            sync_state = excluded.sync_state,
            date_modified = excluded.date_modified,
            attachment = excluded.attachment",
        OBJECT_COLUMNS,
    );
    db.execute(&sql, rusqlite::params![
        obj.library.db_key(),
        obj.ty.storage_type().as_str(),
        obj.key,
        obj.version,
        obj.parent,
        serde_json::to_string(&obj.collections)?,
        obj.trash,
        obj.deleted,
        serde_json::to_string(&obj.data)?,
        obj.changes.bits(),
        obj.sync_state.as_str(),
        obj.date_modified,
        attachment,
    ])?;
    Ok(())
}

/// Whether a row exists for this identity (tombstones count)
pub(crate) fn object_exists(db: &Connection, library: LibraryId, ty: ObjectType, key: &str) -> BResult<bool> {
    let count: i64 = db.query_row(
        "SELECT COUNT(*) FROM objects WHERE library_id = ?1 AND type = ?2 AND key = ?3",
        rusqlite::params![library.db_key(), ty.storage_type().as_str(), key],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
