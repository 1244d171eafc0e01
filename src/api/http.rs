//! The web API client. Talks to the versioned object store over HTTP, and
//! doubles as the default attachment file backend.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, Response, multipart};
use reqwest::{Method, StatusCode, redirect};
use serde_json::Value;

use crate::api::{FileBackend, RemoteApi, TransferSink, Versioned};
use crate::config;
use crate::error::{BResult, BError};
use crate::models::file_sync::AttachmentUpload;
use crate::models::library::LibraryId;
use crate::models::object::ObjectType;
use crate::models::response::{
    AuthorizeUploadResponse, DeletionsResponse, GroupResponse, KeyPermissions,
    UpdatesResponse, UploadAuthorization,
};
use crate::util;

const API_VERSION: &'static str = "3";
const CHUNK_SIZE: usize = 64 * 1024;

/// A struct used for building API requests
pub struct ApiReq {
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    data: Option<Value>,
    form: Option<Vec<(String, String)>>,
    timeout: Option<Duration>,
    library: Option<LibraryId>,
}

impl ApiReq {
    /// Create a new builder
    pub fn new() -> Self {
        ApiReq {
            headers: Vec::new(),
            query: Vec::new(),
            data: None,
            form: None,
            timeout: None,
            library: None,
        }
    }

    /// Set a header
    pub fn header(mut self, name: &str, val: &str) -> Self {
        self.headers.push((String::from(name), String::from(val)));
        self
    }

    /// Add a querystring parameter
    pub fn query(mut self, name: &str, val: &str) -> Self {
        self.query.push((String::from(name), String::from(val)));
        self
    }

    /// Set this request's (json) data
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Send form-encoded data instead of json
    pub fn form(mut self, form: Vec<(String, String)>) -> Self {
        self.form = Some(form);
        self
    }

    /// Set (override) the timeout for this request
    #[allow(dead_code)]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(Duration::new(secs, 0));
        self
    }

    /// Which library a conditional write is about, so a 412 can say so
    pub fn library(mut self, library: LibraryId) -> Self {
        self.library = Some(library);
        self
    }
}

/// What we keep from a response
pub struct ApiResponse {
    pub status: StatusCode,
    pub version: Option<i64>,
    pub body: Value,
}

impl ApiResponse {
    fn version(&self) -> BResult<i64> {
        self.version.ok_or_else(|| BError::MissingField(String::from("Last-Modified-Version header")))
    }
}

/// Our Api object. Responsible for making outbound calls to the remote.
pub struct HttpApi {
    client: Client,
    /// does not follow redirects, so we can read headers off the first hop
    file_client: Client,
    endpoint: String,
    user_id: i64,
    api_key: String,
}

fn path_for(object: ObjectType) -> &'static str {
    match object {
        ObjectType::Collection => "collections",
        ObjectType::Search => "searches",
        ObjectType::Item => "items",
        ObjectType::Trash => "items/trash",
        ObjectType::Setting => "settings",
    }
}

fn key_param(object: ObjectType) -> &'static str {
    match object {
        ObjectType::Collection => "collectionKey",
        ObjectType::Search => "searchKey",
        ObjectType::Item | ObjectType::Trash => "itemKey",
        ObjectType::Setting => "settingKey",
    }
}

fn version_header(res: &Response) -> Option<i64> {
    res.headers()
        .get("Last-Modified-Version")
        .and_then(|x| x.to_str().ok())
        .and_then(|x| x.parse::<i64>().ok())
}

/// Stream a response body into a file, reporting progress and stopping if
/// cancelled.
pub(crate) fn stream_to_file(mut res: Response, file: &Path, sink: &mut dyn TransferSink) -> BResult<()> {
    if let Some(parent) = file.parent() {
        util::create_dir(parent)?;
    }
    let total = res.content_length();
    let mut out = File::create(file)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done: u64 = 0;
    sink.progress(0, total);
    loop {
        if sink.is_cancelled() {
            return Err(BError::Cancelled);
        }
        let read = res.read(&mut buf)?;
        if read == 0 { break; }
        out.write_all(&buf[0..read])?;
        done += read as u64;
        sink.progress(done, total);
    }
    out.flush()?;
    Ok(())
}

impl HttpApi {
    /// Create an Api
    pub fn new(endpoint: &str, user_id: i64, api_key: &str, timeout: u64) -> BResult<HttpApi> {
        let client = Client::builder()
            .timeout(Duration::new(timeout, 0))
            .build()?;
        let file_client = Client::builder()
            .timeout(Duration::new(timeout, 0))
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(HttpApi {
            client,
            file_client,
            endpoint: String::from(endpoint.trim_end_matches('/')),
            user_id,
            api_key: String::from(api_key),
        })
    }

    /// Create an Api from the `api` config section
    pub fn from_config() -> BResult<HttpApi> {
        let endpoint: String = config::get(&["api", "endpoint"])?;
        let user_id: i64 = config::get(&["api", "user_id"])?;
        let api_key: String = config::get(&["api", "api_key"])?;
        let timeout: u64 = config::get_opt(&["api", "timeout"]).unwrap_or(30);
        HttpApi::new(&endpoint, user_id, &api_key, timeout)
    }

    fn library_prefix(&self, library: LibraryId) -> String {
        match library {
            LibraryId::Personal => format!("/users/{}", self.user_id),
            LibraryId::Group(id) => format!("/groups/{}", id),
        }
    }

    fn build_url(&self, resource: &str) -> String {
        let mut url = String::with_capacity(self.endpoint.len() + resource.len());
        url.push_str(&self.endpoint);
        url.push_str(resource);
        url
    }

    fn request(&self, client: &Client, method: Method, resource: &str, builder: ApiReq) -> BResult<Response> {
        let ApiReq { headers, query, data, form, timeout, .. } = builder;
        let url = self.build_url(resource);
        let mut req = client.request(method, &url)
            .header("Zotero-API-Version", API_VERSION)
            .header("Zotero-API-Key", self.api_key.as_str());
        for (name, val) in &headers {
            req = req.header(name.as_str(), val.as_str());
        }
        if query.len() > 0 {
            req = req.query(&query);
        }
        if let Some(data) = data {
            req = req.json(&data);
        } else if let Some(form) = form {
            req = req.form(&form);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        Ok(req.send()?)
    }

    /// Send out an API request
    pub fn call(&self, method: Method, resource: &str, builder: ApiReq) -> BResult<ApiResponse> {
        debug!("api::call() -- req: {} {}", method, resource);
        let library = builder.library;
        let res = self.request(&self.client, method.clone(), resource, builder)?;
        self.call_end(res, library, &method, resource)
    }

    /// Finish an API request: map statuses onto errors and parse the body
    fn call_end(&self, res: Response, library: Option<LibraryId>, method: &Method, resource: &str) -> BResult<ApiResponse> {
        let status = res.status();
        let version = version_header(&res);
        match status {
            StatusCode::NOT_MODIFIED => return Err(BError::NotModified),
            StatusCode::PRECONDITION_FAILED if library.is_some() => {
                return Err(BError::PreconditionFailed(library.unwrap_or(LibraryId::Personal)));
            }
            StatusCode::UNAUTHORIZED => return Err(BError::InvalidCredentials),
            _ => {}
        }
        let out = res.text()?;
        if !status.is_success() {
            return Err(BError::Api(status.as_u16(), out));
        }
        info!("api::call() -- res({}): {} {} {}", out.len(), status.as_u16(), method, resource);
        trace!("  api::call() -- body: {}", out);
        let body = if out.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&out)?
        };
        Ok(ApiResponse { status, version, body })
    }

    /// Convenience function for api.call(GET)
    pub fn get(&self, resource: &str, builder: ApiReq) -> BResult<ApiResponse> {
        self.call(Method::GET, resource, builder)
    }

    /// Convenience function for api.call(POST)
    pub fn post(&self, resource: &str, builder: ApiReq) -> BResult<ApiResponse> {
        self.call(Method::POST, resource, builder)
    }

    /// Convenience function for api.call(DELETE)
    pub fn delete(&self, resource: &str, builder: ApiReq) -> BResult<ApiResponse> {
        self.call(Method::DELETE, resource, builder)
    }

    fn file_resource(&self, library: LibraryId, key: &str) -> String {
        format!("{}/items/{}/file", self.library_prefix(library), key)
    }

    fn file_precondition(upload: &AttachmentUpload, builder: ApiReq) -> ApiReq {
        match upload.remote_md5 {
            Some(ref md5) => builder.header("If-Match", md5),
            None => builder.header("If-None-Match", "*"),
        }
    }
}

impl RemoteApi for HttpApi {
    fn load_permissions(&self) -> BResult<KeyPermissions> {
        let res = match self.get("/keys/current", ApiReq::new()) {
            Ok(x) => x,
            Err(BError::Api(403, _)) => return Err(BError::InvalidCredentials),
            Err(e) => return Err(e),
        };
        KeyPermissions::parse(&res.body)
    }

    fn group_versions(&self) -> BResult<HashMap<i64, i64>> {
        let resource = format!("/users/{}/groups", self.user_id);
        let res = self.get(&resource, ApiReq::new().query("format", "versions"))?;
        let raw: HashMap<String, i64> = serde_json::from_value(res.body)?;
        let mut versions = HashMap::with_capacity(raw.len());
        for (id, version) in raw {
            versions.insert(id.parse::<i64>()?, version);
        }
        Ok(versions)
    }

    fn group(&self, group_id: i64) -> BResult<GroupResponse> {
        let res = self.get(&format!("/groups/{}", group_id), ApiReq::new())?;
        GroupResponse::parse(&res.body)
    }

    fn versions(&self, library: LibraryId, object: ObjectType, since: Option<i64>) -> BResult<Versioned<HashMap<String, i64>>> {
        let resource = format!("{}/{}", self.library_prefix(library), path_for(object));
        let mut req = ApiReq::new().query("format", "versions");
        if object == ObjectType::Item {
            req = req.query("includeTrashed", "1");
        }
        if let Some(since) = since {
            let since = since.to_string();
            req = req.query("since", &since).header("If-Modified-Since-Version", &since);
        }
        let res = self.get(&resource, req)?;
        let version = res.version()?;
        Ok(Versioned::new(version, serde_json::from_value(res.body)?))
    }

    fn objects(&self, library: LibraryId, object: ObjectType, keys: &[String]) -> BResult<Versioned<Vec<Value>>> {
        let object = if object == ObjectType::Trash { ObjectType::Item } else { object };
        let resource = format!("{}/{}", self.library_prefix(library), path_for(object));
        let mut req = ApiReq::new()
            .query("format", "json")
            .query(key_param(object), &keys.join(","));
        if object == ObjectType::Item {
            req = req.query("includeTrashed", "1");
        }
        let res = self.get(&resource, req)?;
        let version = res.version()?;
        let objects = match res.body {
            Value::Array(x) => x,
            _ => return Err(BError::BadValue(String::from("HttpApi::objects() -- expected a list"))),
        };
        Ok(Versioned::new(version, objects))
    }

    fn deletions(&self, library: LibraryId, since: i64) -> BResult<Versioned<DeletionsResponse>> {
        let resource = format!("{}/deleted", self.library_prefix(library));
        let since = since.to_string();
        let res = self.get(&resource, ApiReq::new().query("since", &since).header("If-Modified-Since-Version", &since))?;
        let version = res.version()?;
        Ok(Versioned::new(version, serde_json::from_value(res.body)?))
    }

    fn settings(&self, library: LibraryId, since: Option<i64>) -> BResult<Versioned<HashMap<String, Value>>> {
        let resource = format!("{}/settings", self.library_prefix(library));
        let mut req = ApiReq::new();
        if let Some(since) = since {
            let since = since.to_string();
            req = req.query("since", &since).header("If-Modified-Since-Version", &since);
        }
        let res = self.get(&resource, req)?;
        let version = res.version()?;
        Ok(Versioned::new(version, serde_json::from_value(res.body)?))
    }

    fn submit_updates(&self, library: LibraryId, object: ObjectType, version: i64, keys: &[String], parameters: &[Value]) -> BResult<Versioned<UpdatesResponse>> {
        let resource = format!("{}/{}", self.library_prefix(library), path_for(object.storage_type()));
        let req = ApiReq::new()
            .library(library)
            .header("If-Unmodified-Since-Version", &version.to_string());
        if object == ObjectType::Setting {
            // settings go up as one {key: {value}} object and come back empty
            let mut body = serde_json::Map::new();
            for param in parameters {
                let key = param.get("key").and_then(|x| x.as_str()).unwrap_or("");
                let value = param.get("value").cloned().unwrap_or(Value::Null);
                body.insert(String::from(key), json!({"value": value}));
            }
            let res = self.post(&resource, req.data(Value::Object(body)))?;
            let version = res.version()?;
            let response = UpdatesResponse { successful: keys.to_vec(), ..Default::default() };
            return Ok(Versioned::new(version, response));
        }
        let res = self.post(&resource, req.data(Value::Array(parameters.to_vec())))?;
        let version = res.version()?;
        Ok(Versioned::new(version, UpdatesResponse::parse(&res.body, keys)?))
    }

    fn submit_deletions(&self, library: LibraryId, object: ObjectType, version: i64, keys: &[String]) -> BResult<i64> {
        let object = object.storage_type();
        if object == ObjectType::Setting {
            let mut version = version;
            for key in keys {
                let resource = format!("{}/settings/{}", self.library_prefix(library), key);
                let req = ApiReq::new()
                    .library(library)
                    .header("If-Unmodified-Since-Version", &version.to_string());
                version = self.delete(&resource, req)?.version()?;
            }
            return Ok(version);
        }
        let resource = format!("{}/{}", self.library_prefix(library), path_for(object));
        let req = ApiReq::new()
            .library(library)
            .query(key_param(object), &keys.join(","))
            .header("If-Unmodified-Since-Version", &version.to_string());
        self.delete(&resource, req)?.version()
    }
}

impl FileBackend for HttpApi {
    fn download(&self, library: LibraryId, key: &str, file: &Path, sink: &mut dyn TransferSink) -> BResult<()> {
        let resource = self.file_resource(library, key);
        info!("HttpApi.download() -- {}", resource);
        let res = self.request(&self.file_client, Method::GET, &resource, ApiReq::new())?;
        let compressed = res.headers()
            .get("Zotero-File-Compressed")
            .and_then(|x| x.to_str().ok())
            .map(|x| x.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        sink.set_compressed(compressed);
        let status = res.status();
        let res = if status.is_redirection() {
            let location = res.headers()
                .get("Location")
                .and_then(|x| x.to_str().ok())
                .map(String::from)
                .ok_or_else(|| BError::MissingField(String::from("Location header")))?;
            self.client.get(&location).send()?
        } else {
            res
        };
        match res.status() {
            StatusCode::NOT_FOUND => return Err(BError::NotFound(format!("file for {}", key))),
            s if !s.is_success() => return Err(BError::Api(s.as_u16(), String::from("file download failed"))),
            _ => {}
        }
        stream_to_file(res, file, sink)
    }

    fn authorize_upload(&self, upload: &AttachmentUpload) -> BResult<AuthorizeUploadResponse> {
        let resource = self.file_resource(upload.library, &upload.key);
        let filesize = fs::metadata(&upload.file)?.len();
        let form = vec![
            (String::from("md5"), upload.md5.clone()),
            (String::from("filename"), upload.filename.clone()),
            (String::from("filesize"), filesize.to_string()),
            (String::from("mtime"), upload.mtime.to_string()),
        ];
        let req = HttpApi::file_precondition(upload, ApiReq::new().form(form));
        let res = self.post(&resource, req)?;
        AuthorizeUploadResponse::parse(&res.body)
    }

    fn upload(&self, upload: &AttachmentUpload, auth: &UploadAuthorization, sink: &mut dyn TransferSink) -> BResult<()> {
        if sink.is_cancelled() {
            return Err(BError::Cancelled);
        }
        let filesize = fs::metadata(&upload.file)?.len();
        sink.progress(0, Some(filesize));
        let res = if auth.params.len() > 0 {
            let mut form = multipart::Form::new();
            for (name, val) in &auth.params {
                form = form.text(name.clone(), val.clone());
            }
            form = form.file("file", &upload.file)?;
            self.client.post(&auth.url).multipart(form).send()?
        } else {
            let mut body = Vec::with_capacity(filesize as usize + 1024);
            body.extend_from_slice(auth.prefix.as_ref().map(|x| x.as_bytes()).unwrap_or(b""));
            File::open(&upload.file)?.read_to_end(&mut body)?;
            body.extend_from_slice(auth.suffix.as_ref().map(|x| x.as_bytes()).unwrap_or(b""));
            let content_type = auth.content_type.clone().unwrap_or_else(|| upload.content_type.clone());
            self.client.post(&auth.url)
                .header("Content-Type", content_type)
                .body(body)
                .send()?
        };
        if !res.status().is_success() {
            return Err(BError::Api(res.status().as_u16(), String::from("file upload failed")));
        }
        sink.progress(filesize, Some(filesize));
        Ok(())
    }

    fn register_upload(&self, upload: &AttachmentUpload, auth: &UploadAuthorization) -> BResult<()> {
        let resource = self.file_resource(upload.library, &upload.key);
        let form = vec![(String::from("upload"), auth.upload_key.clone())];
        let req = HttpApi::file_precondition(upload, ApiReq::new().form(form));
        self.post(&resource, req)?;
        Ok(())
    }

    fn delete(&self, _library: LibraryId, keys: &[String]) -> BResult<Vec<String>> {
        // stored files go away with their items
        Ok(keys.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_items_take_their_files_along() {
        let api = HttpApi::new("https://api.example.org/", 12, "key", 5).unwrap();
        let keys = vec![String::from("ATT00001"), String::from("ATT00002")];
        assert_eq!(FileBackend::delete(&api, LibraryId::Personal, &keys).unwrap(), keys);
    }

    #[test]
    fn builds_resources() {
        let api = HttpApi::new("https://api.example.org/", 12, "key", 5).unwrap();
        assert_eq!(api.library_prefix(LibraryId::Personal), "/users/12");
        assert_eq!(api.library_prefix(LibraryId::Group(4)), "/groups/4");
        assert_eq!(api.build_url("/users/12/items"), "https://api.example.org/users/12/items");
        assert_eq!(api.file_resource(LibraryId::Group(4), "ABCD1234"), "/groups/4/items/ABCD1234/file");
        assert_eq!(path_for(ObjectType::Trash), "items/trash");
        assert_eq!(key_param(ObjectType::Trash), "itemKey");
    }
}
