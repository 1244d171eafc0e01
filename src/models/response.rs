//! Parsers for what the remote sends back. Everything here is tolerant of
//! missing optional fields and strict about the ones we can't work without.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{BResult, BError};
use crate::models::object::{AttachmentInfo, ObjectType, SyncObject};
use crate::util::{self, json};

/// One remote object, split into the pieces we store.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectResponse {
    pub key: String,
    pub version: i64,
    /// storage type (never Trash)
    pub object: ObjectType,
    pub parent: Option<String>,
    pub collections: Vec<String>,
    pub trash: bool,
    pub data: Value,
    pub date_modified: i64,
    pub attachment: Option<AttachmentInfo>,
}

impl ObjectResponse {
    /// Parse one entry of an objects listing (`{"key", "version", "data"}`).
    pub fn parse(object: ObjectType, entry: &Value) -> BResult<ObjectResponse> {
        let key: Option<String> = json::get_opt(&["key"], entry)
            .or_else(|| json::get_opt(&["data", "key"], entry));
        let key = match key {
            Some(x) => x,
            None => return Err(BError::Parse(None, String::from("object has no key"))),
        };
        let version: i64 = match json::get_opt(&["version"], entry).or_else(|| json::get_opt(&["data", "version"], entry)) {
            Some(x) => x,
            None => return Err(BError::Parse(Some(key), String::from("object has no version"))),
        };
        let data = match entry.get("data") {
            Some(x) if x.is_object() => x,
            _ => return Err(BError::Parse(Some(key), String::from("object has no data"))),
        };
        let storage_type = object.storage_type();
        let (parent, collections, trash, rest) = SyncObject::split_data(storage_type, data);
        let date_modified = json::get_opt::<String>(&["dateModified"], &rest)
            .and_then(|x| util::parse_timestamp(&x))
            .unwrap_or(0);
        let attachment = if storage_type == ObjectType::Item {
            AttachmentInfo::from_data(&rest)
        } else {
            None
        };
        Ok(ObjectResponse {
            key,
            version,
            object: storage_type,
            parent,
            collections,
            trash,
            data: rest,
            date_modified,
            attachment,
        })
    }

    /// Parse one setting (`"tagColors": {"value": ..., "version": 3}`).
    pub fn parse_setting(key: &str, entry: &Value) -> BResult<ObjectResponse> {
        let version: i64 = json::get(&["version"], entry)
            .map_err(|_| BError::Parse(Some(String::from(key)), String::from("setting has no version")))?;
        let value = match entry.get("value") {
            Some(x) => x.clone(),
            None => return Err(BError::Parse(Some(String::from(key)), String::from("setting has no value"))),
        };
        Ok(ObjectResponse {
            key: String::from(key),
            version,
            object: ObjectType::Setting,
            parent: None,
            collections: Vec::new(),
            trash: false,
            data: json!({"value": value}),
            date_modified: 0,
            attachment: None,
        })
    }
}

/// Keys deleted remotely since some version.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DeletionsResponse {
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub settings: Vec<String>,
}

impl DeletionsResponse {
    pub fn keys(&self, object: ObjectType) -> &[String] {
        match object {
            ObjectType::Collection => &self.collections,
            ObjectType::Search => &self.searches,
            ObjectType::Item | ObjectType::Trash => &self.items,
            ObjectType::Setting => &self.settings,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty() && self.searches.is_empty() && self.items.is_empty() && self.settings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedUpdate {
    pub key: String,
    pub code: u16,
    pub message: String,
}

/// The per-object results of a write batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdatesResponse {
    pub successful: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<FailedUpdate>,
}

impl UpdatesResponse {
    /// Parse a write response. Entries are indexed by their position in the
    /// submitted batch, so we need the batch's keys to fill gaps.
    pub fn parse(response: &Value, keys: &[String]) -> BResult<UpdatesResponse> {
        let key_at = |idx: &str| -> Option<String> {
            idx.parse::<usize>().ok().and_then(|i| keys.get(i)).cloned()
        };
        let mut res = UpdatesResponse::default();
        if let Some(success) = response.get("success").and_then(|x| x.as_object()) {
            for (idx, val) in success {
                if let Some(key) = val.as_str().map(String::from).or_else(|| key_at(idx)) {
                    res.successful.push(key);
                }
            }
        } else if let Some(successful) = response.get("successful").and_then(|x| x.as_object()) {
            for (idx, val) in successful {
                let key = json::get_opt::<String>(&["key"], val).or_else(|| key_at(idx));
                if let Some(key) = key {
                    res.successful.push(key);
                }
            }
        }
        if let Some(unchanged) = response.get("unchanged").and_then(|x| x.as_object()) {
            for (idx, val) in unchanged {
                if let Some(key) = val.as_str().map(String::from).or_else(|| key_at(idx)) {
                    res.unchanged.push(key);
                }
            }
        }
        if let Some(failed) = response.get("failed").and_then(|x| x.as_object()) {
            for (idx, val) in failed {
                let key = match json::get_opt::<String>(&["key"], val).or_else(|| key_at(idx)) {
                    Some(x) => x,
                    None => return Err(BError::Parse(None, format!("failed entry {} has no key", idx))),
                };
                res.failed.push(FailedUpdate {
                    key,
                    code: json::get_opt(&["code"], val).unwrap_or(0),
                    message: json::get_opt(&["message"], val).unwrap_or_else(String::new),
                });
            }
        }
        Ok(res)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Permissions {
    pub library: bool,
    pub write: bool,
    pub files: bool,
}

impl Permissions {
    fn parse(val: &Value) -> Permissions {
        Permissions {
            library: json::get_opt(&["library"], val).unwrap_or(false),
            write: json::get_opt(&["write"], val).unwrap_or(false),
            files: json::get_opt(&["files"], val).unwrap_or(true),
        }
    }
}

/// What the current API key may do.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyPermissions {
    pub user_id: i64,
    pub user: Permissions,
    pub groups_default: Option<Permissions>,
    pub groups: HashMap<i64, Permissions>,
}

impl KeyPermissions {
    pub fn parse(response: &Value) -> BResult<KeyPermissions> {
        let user_id: i64 = json::get(&["userID"], response)
            .map_err(|_| BError::PermissionLoadingFailed(String::from("response has no userID")))?;
        let user = response.pointer("/access/user").map(Permissions::parse).unwrap_or_default();
        let mut groups_default = None;
        let mut groups = HashMap::new();
        if let Some(obj) = response.pointer("/access/groups").and_then(|x| x.as_object()) {
            for (id, val) in obj {
                if id == "all" {
                    groups_default = Some(Permissions::parse(val));
                } else if let Ok(id) = id.parse::<i64>() {
                    groups.insert(id, Permissions::parse(val));
                }
            }
        }
        Ok(KeyPermissions { user_id, user, groups_default, groups })
    }

    pub fn group(&self, id: i64) -> Permissions {
        self.groups.get(&id).cloned()
            .or(self.groups_default)
            .unwrap_or_default()
    }
}

/// Group metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupResponse {
    pub id: i64,
    pub version: i64,
    pub name: String,
    pub owner: i64,
    pub admins: Vec<i64>,
    pub library_editing: String,
    pub file_editing: String,
}

impl GroupResponse {
    pub fn parse(response: &Value) -> BResult<GroupResponse> {
        let id: i64 = json::get(&["id"], response)?;
        let version: i64 = json::get(&["version"], response)?;
        let data = response.get("data").cloned().unwrap_or(Value::Null);
        Ok(GroupResponse {
            id,
            version,
            name: json::get_opt(&["name"], &data).unwrap_or_else(|| format!("Group {}", id)),
            owner: json::get_opt(&["owner"], &data).unwrap_or(0),
            admins: json::get_opt(&["admins"], &data).unwrap_or_else(Vec::new),
            library_editing: json::get_opt(&["libraryEditing"], &data).unwrap_or_else(|| String::from("members")),
            file_editing: json::get_opt(&["fileEditing"], &data).unwrap_or_else(|| String::from("members")),
        })
    }

    /// Work out (can edit metadata, can edit files) for the given user.
    pub fn access(&self, user_id: i64, permissions: &Permissions) -> (bool, bool) {
        let is_admin = self.owner == user_id || self.admins.contains(&user_id);
        let meta = permissions.write && (self.library_editing == "members" || is_admin);
        let files = meta && match self.file_editing.as_str() {
            "members" => true,
            "admins" => is_admin,
            _ => false,
        };
        (meta, files)
    }
}

/// Upload slot handed out by the remote
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UploadAuthorization {
    pub url: String,
    pub upload_key: String,
    pub content_type: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizeUploadResponse {
    /// the remote already has this exact file
    Exists,
    New(UploadAuthorization),
}

impl AuthorizeUploadResponse {
    pub fn parse(response: &Value) -> BResult<AuthorizeUploadResponse> {
        let exists = match response.get("exists") {
            Some(Value::Bool(x)) => *x,
            Some(Value::Number(x)) => x.as_i64().unwrap_or(0) != 0,
            _ => false,
        };
        if exists {
            return Ok(AuthorizeUploadResponse::Exists);
        }
        let url: String = json::get(&["url"], response)?;
        let upload_key: String = json::get(&["uploadKey"], response)?;
        Ok(AuthorizeUploadResponse::New(UploadAuthorization {
            url,
            upload_key,
            content_type: json::get_opt(&["contentType"], response),
            prefix: json::get_opt(&["prefix"], response),
            suffix: json::get_opt(&["suffix"], response),
            params: json::get_opt(&["params"], response).unwrap_or_else(HashMap::new),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_objects() {
        let entry = json!({
            "key": "COLL0002",
            "version": 12,
            "data": {"key": "COLL0002", "version": 12, "name": "Sub", "parentCollection": "COLL0001"},
        });
        let res = ObjectResponse::parse(ObjectType::Collection, &entry).unwrap();
        assert_eq!(res.parent, Some(String::from("COLL0001")));
        assert_eq!(res.data, json!({"name": "Sub"}));

        let entry = json!({"key": "ITEM0001", "version": 3, "data": {"itemType": "book", "deleted": true, "dateModified": "2019-06-01T10:00:00Z"}});
        let res = ObjectResponse::parse(ObjectType::Trash, &entry).unwrap();
        assert_eq!(res.object, ObjectType::Item);
        assert!(res.trash);
        assert_eq!(res.date_modified, 1559383200);

        match ObjectResponse::parse(ObjectType::Item, &json!({"key": "NODATA", "version": 1})) {
            Err(BError::Parse(Some(key), _)) => assert_eq!(key, "NODATA"),
            x => panic!("unexpected {:?}", x),
        }
        assert!(ObjectResponse::parse(ObjectType::Item, &json!({"version": 1, "data": {}})).is_err());
    }

    #[test]
    fn parses_write_responses() {
        let keys = vec![String::from("AAAA"), String::from("BBBB"), String::from("CCCC")];
        let response = json!({
            "successful": {"0": {"key": "AAAA", "version": 20}},
            "unchanged": {"1": "BBBB"},
            "failed": {"2": {"key": "CCCC", "code": 409, "message": "Conflict"}},
        });
        let res = UpdatesResponse::parse(&response, &keys).unwrap();
        assert_eq!(res.successful, vec!["AAAA"]);
        assert_eq!(res.unchanged, vec!["BBBB"]);
        assert_eq!(res.failed, vec![FailedUpdate { key: String::from("CCCC"), code: 409, message: String::from("Conflict") }]);
    }

    #[test]
    fn parses_permissions_and_groups() {
        let perms = KeyPermissions::parse(&json!({
            "userID": 5,
            "access": {
                "user": {"library": true, "files": true, "write": true},
                "groups": {"all": {"library": true, "write": false}, "17": {"library": true, "write": true}},
            },
        })).unwrap();
        assert!(perms.user.write);
        assert!(!perms.group(99).write);
        assert!(perms.group(17).write);

        let group = GroupResponse::parse(&json!({
            "id": 17,
            "version": 3,
            "data": {"name": "Lab", "owner": 1, "admins": [2], "libraryEditing": "members", "fileEditing": "admins"},
        })).unwrap();
        assert_eq!(group.access(5, &perms.group(17)), (true, false));
        assert_eq!(group.access(2, &perms.group(17)), (true, true));
        assert_eq!(group.access(2, &perms.group(99)), (false, false));
    }

    #[test]
    fn parses_upload_authorization() {
        assert_eq!(AuthorizeUploadResponse::parse(&json!({"exists": 1})).unwrap(), AuthorizeUploadResponse::Exists);
        match AuthorizeUploadResponse::parse(&json!({"url": "https://up", "uploadKey": "uk", "params": {"a": "b"}})).unwrap() {
            AuthorizeUploadResponse::New(auth) => {
                assert_eq!(auth.upload_key, "uk");
                assert_eq!(auth.params.get("a").map(|x| x.as_str()), Some("b"));
            }
            x => panic!("unexpected {:?}", x),
        }
    }
}
