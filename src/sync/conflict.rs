//! Conflict handling: what happens to objects the remote rejected or deleted,
//! and to groups we lost (or can't write to). Anything that needs a human
//! goes through a `ConflictResolver`.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{BResult, BError};
use crate::models::library::LibraryId;
use crate::models::object::{ObjectType, SyncObject};
use crate::models::response::ObjectResponse;
use crate::schema::{SchemaError, SchemaValidator};
use crate::storage::Storage;
use crate::storage::requests::{ObjectResolution, ReadCollectionChildren, ReadObject, Resolution};

/// What to do about a group the remote doesn't list anymore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovedGroupChoice {
    Delete,
    KeepLocalOnly,
    /// leave the library alone (and out of sync) until someone decides
    Skip,
}

/// What to do about local changes in a group we can't write to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDeniedChoice {
    /// throw the changes away and re-fetch the remote copies
    RevertToOriginal,
    /// keep the changes locally, stop trying to push them
    MarkAsResolved,
    Skip,
}

/// Decisions the sync engine can't make on its own. Every method has a
/// default, so implementors only override what they care about.
pub trait ConflictResolver: Send + Sync {
    /// A locally changed object was deleted remotely
    fn resolve_deletion(&self, _library: LibraryId, _local: &SyncObject) -> Resolution {
        Resolution::RevertLocal
    }

    fn resolve_removed_group(&self, _group_id: i64, _name: &str) -> RemovedGroupChoice {
        RemovedGroupChoice::Skip
    }

    fn resolve_write_denied(&self, _group_id: i64, _name: &str) -> WriteDeniedChoice {
        WriteDeniedChoice::Skip
    }
}

/// The deletion wins, removed groups and denied writes wait for a user.
#[derive(Debug, Default, Clone)]
pub struct DefaultResolver;

impl ConflictResolver for DefaultResolver {}

/// How one downloaded object fared
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectOutcome {
    Stored,
    RejectedUnknownField,
    RejectedUnknownType,
    RejectedUnknownCondition,
    RejectedUnknownOperator,
    ParseFailed,
}

impl ObjectOutcome {
    pub fn from_error(err: &BError) -> ObjectOutcome {
        match err {
            BError::Schema(SchemaError::UnknownField(..)) => ObjectOutcome::RejectedUnknownField,
            BError::Schema(SchemaError::UnknownItemType(..)) => ObjectOutcome::RejectedUnknownType,
            BError::Schema(SchemaError::UnknownCondition(..)) => ObjectOutcome::RejectedUnknownCondition,
            BError::Schema(SchemaError::UnknownOperator(..)) => ObjectOutcome::RejectedUnknownOperator,
            _ => ObjectOutcome::ParseFailed,
        }
    }

    pub fn is_stored(&self) -> bool {
        *self == ObjectOutcome::Stored
    }
}

/// How one submitted (or fetched) batch fared
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Success(i64),
    PreconditionFailed,
    NotModified,
    VersionMismatch,
    Failed(Arc<BError>),
}

impl BatchOutcome {
    pub fn from_result(res: BResult<i64>) -> BatchOutcome {
        match res {
            Ok(version) => BatchOutcome::Success(version),
            Err(BError::PreconditionFailed(_)) => BatchOutcome::PreconditionFailed,
            Err(BError::NotModified) => BatchOutcome::NotModified,
            Err(BError::VersionMismatch(_)) => BatchOutcome::VersionMismatch,
            Err(e) => BatchOutcome::Failed(Arc::new(e)),
        }
    }
}

/// A downloaded object we're not storing this time around
#[derive(Debug)]
pub struct Rejected {
    pub key: Option<String>,
    pub outcome: ObjectOutcome,
    pub error: BError,
}

/// Parse and validate a batch of remote objects. Bad ones come back
/// separately and never hold up the rest.
pub fn check_objects(schema: &dyn SchemaValidator, object: ObjectType, entries: &[Value]) -> (Vec<ObjectResponse>, Vec<Rejected>) {
    let mut good = Vec::with_capacity(entries.len());
    let mut bad = Vec::new();
    for entry in entries {
        let parsed = match ObjectResponse::parse(object, entry) {
            Ok(x) => x,
            Err(e) => {
                let key = match e {
                    BError::Parse(ref key, _) => key.clone(),
                    _ => None,
                };
                bad.push(Rejected { key, outcome: ObjectOutcome::from_error(&e), error: e });
                continue;
            }
        };
        if let Err(e) = schema.validate(parsed.object, &parsed.key, &parsed.data) {
            let err = BError::from(e);
            bad.push(Rejected { key: Some(parsed.key.clone()), outcome: ObjectOutcome::from_error(&err), error: err });
            continue;
        }
        good.push(parsed);
    }
    (good, bad)
}

/// Work out what to do with each key the remote says it deleted.
///
/// `stored` holds (type, key) of everything written from the remote earlier
/// in this pass, `restored` the subset that brought back a local tombstone.
pub fn plan_deletions(
    storage: &Storage,
    resolver: &dyn ConflictResolver,
    library: LibraryId,
    object: ObjectType,
    keys: &[String],
    stored: &HashSet<(ObjectType, String)>,
    restored: &HashSet<(ObjectType, String)>,
) -> BResult<Vec<ObjectResolution>> {
    let storage_type = object.storage_type();
    let mut resolutions = Vec::new();
    for key in keys {
        let local = match storage.perform(&ReadObject { library, object: storage_type, key: key.clone() })? {
            Some(x) => x,
            None => continue,
        };
        let restored_container = local.collections.iter()
            .any(|col| restored.contains(&(ObjectType::Collection, col.clone())));
        let resolution = if stored.contains(&(storage_type, key.clone())) || restored_container {
            Resolution::DiscardDeletion
        } else if local.deleted || !local.is_changed() {
            if storage_type == ObjectType::Collection {
                let children = storage.perform(&ReadCollectionChildren { library, key: key.clone() })?;
                if children.iter().any(|x| x.is_changed()) {
                    Resolution::MergeChildrenIntoParent { parent: local.parent.clone() }
                } else {
                    Resolution::RevertLocal
                }
            } else {
                Resolution::RevertLocal
            }
        } else {
            resolver.resolve_deletion(library, &local)
        };
        debug!("conflict::plan_deletions() -- {} {} {}: {:?}", library, storage_type, key, resolution);
        resolutions.push(ObjectResolution {
            object: storage_type,
            key: key.clone(),
            resolution,
        });
    }
    Ok(resolutions)
}
