use serde_json::Value;

use crate::models::library::LibraryId;
use crate::models::object::ObjectType;

/// The most objects we move in one request, either direction.
pub const MAX_BATCH_COUNT: usize = 50;

/// A set of keys to fetch in one request, all expected at `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadBatch {
    pub library: LibraryId,
    pub object: ObjectType,
    pub keys: Vec<String>,
    pub version: i64,
}

/// A set of local changes to push in one request. `version` is the library
/// version we believe the remote is at, sent as the precondition.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    pub library: LibraryId,
    pub object: ObjectType,
    pub version: i64,
    pub keys: Vec<String>,
    pub parameters: Vec<Value>,
}

/// A set of local deletions to push in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteBatch {
    pub library: LibraryId,
    pub object: ObjectType,
    pub version: i64,
    pub keys: Vec<String>,
}

impl DownloadBatch {
    /// Chunk keys into batches, keeping their order
    pub fn chunk(library: LibraryId, object: ObjectType, keys: &[String], version: i64) -> Vec<DownloadBatch> {
        keys.chunks(MAX_BATCH_COUNT)
            .map(|chunk| DownloadBatch {
                library,
                object,
                keys: chunk.to_vec(),
                version,
            })
            .collect()
    }
}

impl WriteBatch {
    /// Chunk (key, parameters) pairs into batches, keeping their order
    pub fn chunk(library: LibraryId, object: ObjectType, version: i64, updates: Vec<(String, Value)>) -> Vec<WriteBatch> {
        let mut batches = Vec::new();
        let mut iter = updates.into_iter().peekable();
        while iter.peek().is_some() {
            let (keys, parameters): (Vec<_>, Vec<_>) = iter.by_ref().take(MAX_BATCH_COUNT).unzip();
            batches.push(WriteBatch { library, object, version, keys, parameters });
        }
        batches
    }
}

impl DeleteBatch {
    pub fn chunk(library: LibraryId, object: ObjectType, version: i64, keys: &[String]) -> Vec<DeleteBatch> {
        keys.chunks(MAX_BATCH_COUNT)
            .map(|chunk| DeleteBatch {
                library,
                object,
                version,
                keys: chunk.to_vec(),
            })
            .collect()
    }
}
