//! Works out what to fetch and what to push. Downloads come in batches of
//! keys ordered so parents land before their children; uploads are ordered
//! the same way.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::api::RemoteApi;
use crate::error::{BResult, BError};
use crate::models::batch::{DownloadBatch, WriteBatch};
use crate::models::library::LibraryId;
use crate::models::object::{ObjectType, SyncObject, SyncState};
use crate::storage::Storage;
use crate::storage::requests::{ReadLocalState, ReadResyncKeys};
use crate::sync::SyncType;
use crate::sync::retry::RetryPolicy;
use crate::util;

/// The download plan for one object type of one library
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub batches: Vec<DownloadBatch>,
    /// the library version the remote reported (or the one we already had)
    pub library_version: i64,
    /// keys with local changes, which the write pass will pick up
    pub dirty: Vec<String>,
    /// whether the remote was asked at all
    pub checked_remote: bool,
}

/// Split keys into passes: each pass holds keys whose parent is not still
/// waiting in a later pass. Keys in a pass are sorted. A cycle ends up in one
/// final pass.
pub fn parent_first_passes(keys: Vec<String>, parents: &HashMap<String, String>) -> Vec<Vec<String>> {
    let mut remaining: BTreeSet<String> = keys.into_iter().collect();
    let mut passes = Vec::new();
    while remaining.len() > 0 {
        let pass = remaining.iter()
            .filter(|key| {
                match parents.get(*key) {
                    Some(parent) => parent == *key || !remaining.contains(parent),
                    None => true,
                }
            })
            .cloned()
            .collect::<Vec<_>>();
        let pass = if pass.len() == 0 {
            remaining.iter().cloned().collect::<Vec<_>>()
        } else {
            pass
        };
        for key in &pass {
            remaining.remove(key);
        }
        passes.push(pass);
    }
    passes
}

/// Turn passes into download batches. A batch never spans two passes.
pub fn batches_from_passes(library: LibraryId, object: ObjectType, version: i64, passes: Vec<Vec<String>>) -> Vec<DownloadBatch> {
    passes.into_iter()
        .flat_map(|pass| DownloadBatch::chunk(library, object, &pass, version))
        .collect()
}

/// Order local changes for upload: parents strictly before children, and
/// otherwise least recently modified first.
pub fn order_writes(mut objects: Vec<SyncObject>) -> Vec<SyncObject> {
    objects.sort_by(|a, b| (a.date_modified, &a.key).cmp(&(b.date_modified, &b.key)));
    let mut remaining: HashSet<String> = objects.iter().map(|x| x.key.clone()).collect();
    let mut pending = objects;
    let mut ordered = Vec::with_capacity(pending.len());
    while pending.len() > 0 {
        let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|obj| {
            match obj.parent {
                Some(ref parent) => parent == &obj.key || !remaining.contains(parent),
                None => true,
            }
        });
        if ready.len() == 0 {
            // a cycle. push what's left in date order and let the remote sort
            // it out
            ordered.extend(waiting);
            break;
        }
        for obj in &ready {
            remaining.remove(&obj.key);
        }
        ordered.extend(ready);
        pending = waiting;
    }
    ordered
}

/// Build the write batches for one object type
pub fn plan_writes(library: LibraryId, object: ObjectType, version: i64, objects: Vec<SyncObject>) -> Vec<WriteBatch> {
    let updates = order_writes(objects)
        .into_iter()
        .map(|obj| {
            let params = obj.update_parameters();
            (obj.key, params)
        })
        .collect::<Vec<_>>();
    WriteBatch::chunk(library, object, version, updates)
}

pub struct Planner<'a> {
    storage: &'a Storage,
    api: &'a dyn RemoteApi,
    policy: &'a RetryPolicy,
    sync_type: SyncType,
}

impl<'a> Planner<'a> {
    pub fn new(storage: &'a Storage, api: &'a dyn RemoteApi, policy: &'a RetryPolicy, sync_type: SyncType) -> Planner<'a> {
        Planner { storage, api, policy, sync_type }
    }

    fn resync_keys(&self, library: LibraryId, object: ObjectType) -> BResult<Vec<String>> {
        self.storage.perform(&ReadResyncKeys {
            library,
            object,
            now: util::now(),
            delays: self.policy.object_delays(),
            max_attempts: self.policy.max_object_retries,
            ignore_delays: self.sync_type.ignores_delays(),
        })
    }

    /// Plan the download of one object type.
    ///
    /// `since` is our cached version for the type (None to list everything),
    /// `known_version` the library version the remote reported earlier in
    /// this pass, if any. When the two match and `force_remote_check` isn't
    /// set, the remote isn't asked; objects waiting for a re-fetch still get
    /// a batch.
    pub fn plan(&self, library: LibraryId, object: ObjectType, since: Option<i64>, force_remote_check: bool, known_version: Option<i64>) -> BResult<Plan> {
        let local = self.storage.perform(&ReadLocalState { library, object })?;
        let dirty = if object == ObjectType::Trash {
            // trashed items get pushed as items
            Vec::new()
        } else {
            local.iter()
                .filter(|x| x.changed || x.deleted)
                .map(|x| x.key.clone())
                .collect::<Vec<_>>()
        };
        let parents = local.iter()
            .filter_map(|x| x.parent.as_ref().map(|p| (x.key.clone(), p.clone())))
            .collect::<HashMap<_, _>>();
        let resync = self.resync_keys(library, object)?;

        let cached = since.is_some() && since == known_version;
        if !force_remote_check && cached {
            debug!("Planner.plan() -- {} {} is current at {:?}, {} to re-fetch", library, object, since, resync.len());
            let version = known_version.unwrap_or(0);
            let passes = parent_first_passes(resync, &parents);
            return Ok(Plan {
                batches: batches_from_passes(library, object, version, passes),
                library_version: version,
                dirty,
                checked_remote: false,
            });
        }

        let remote = match self.api.versions(library, object, since) {
            Ok(x) => x,
            Err(BError::NotModified) => {
                debug!("Planner.plan() -- {} {} not modified since {:?}", library, object, since);
                let version = since.unwrap_or(0);
                let passes = parent_first_passes(resync, &parents);
                return Ok(Plan {
                    batches: batches_from_passes(library, object, version, passes),
                    library_version: version,
                    dirty,
                    checked_remote: true,
                });
            }
            Err(e) => return Err(e),
        };
        if let Some(known) = known_version {
            if remote.version != known {
                warn!("Planner.plan() -- {} moved from {} to {} mid-sync", library, known, remote.version);
                return Err(BError::VersionMismatch(library));
            }
        }

        let local_versions = local.iter()
            .filter(|x| !x.deleted && x.sync_state == SyncState::Synced)
            .map(|x| (x.key.as_str(), x.version))
            .collect::<HashMap<_, _>>();
        let mut keys = remote.data.iter()
            .filter(|(key, version)| local_versions.get(key.as_str()) != Some(*version))
            .map(|(key, _)| key.clone())
            .collect::<HashSet<_>>();
        keys.extend(resync);
        info!("Planner.plan() -- {} {}: {} of {} remote objects to fetch (version {})", library, object, keys.len(), remote.data.len(), remote.version);

        let passes = parent_first_passes(keys.into_iter().collect(), &parents);
        Ok(Plan {
            batches: batches_from_passes(library, object, remote.version, passes),
            library_version: remote.version,
            dirty,
            checked_remote: true,
        })
    }
}
