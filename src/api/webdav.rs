//! WebDAV file storage. Each attachment is kept as `<key>.zip`, next to a
//! small `<key>.prop` document holding the file's mtime and hash.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{Method, StatusCode};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::api::{FileBackend, TransferSink};
use crate::api::http::stream_to_file;
use crate::config;
use crate::error::{BResult, BError};
use crate::models::file_sync::AttachmentUpload;
use crate::models::library::LibraryId;
use crate::models::response::{AuthorizeUploadResponse, UploadAuthorization};

lazy_static! {
    static ref PROP_MTIME: Regex = Regex::new(r"<mtime>\s*(\d+)\s*</mtime>").expect("webdav::PROP_MTIME -- bad regex");
    static ref PROP_HASH: Regex = Regex::new(r"<hash>\s*([0-9a-fA-F]+)\s*</hash>").expect("webdav::PROP_HASH -- bad regex");
}

/// What a `.prop` document says about the remote file
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteProp {
    pub mtime: i64,
    pub hash: String,
}

impl RemoteProp {
    pub fn parse(body: &str) -> Option<RemoteProp> {
        let mtime = PROP_MTIME.captures(body)?.get(1)?.as_str().parse::<i64>().ok()?;
        let hash = PROP_HASH.captures(body)?.get(1)?.as_str().to_lowercase();
        Some(RemoteProp { mtime, hash })
    }

    pub fn to_xml(&self) -> String {
        format!("<properties version=\"1\"><mtime>{}</mtime><hash>{}</hash></properties>", self.mtime, self.hash)
    }
}

pub struct WebDavBackend {
    client: Client,
    /// always ends with a slash
    url: String,
    username: String,
    password: String,
}

impl WebDavBackend {
    pub fn new(url: &str, username: &str, password: &str, timeout: u64) -> BResult<WebDavBackend> {
        let client = Client::builder()
            .timeout(Duration::new(timeout, 0))
            .build()?;
        let mut url = String::from(url);
        if !url.ends_with('/') {
            url.push('/');
        }
        Ok(WebDavBackend {
            client,
            url,
            username: String::from(username),
            password: String::from(password),
        })
    }

    /// Build a backend from the `webdav` config section, if it's turned on
    pub fn from_config() -> BResult<Option<WebDavBackend>> {
        let enabled: bool = config::get_opt(&["webdav", "enabled"]).unwrap_or(false);
        if !enabled {
            return Ok(None);
        }
        let url: String = config::get(&["webdav", "url"])?;
        let username: String = config::get(&["webdav", "username"])?;
        let password: String = config::get(&["webdav", "password"])?;
        let timeout: u64 = config::get_opt(&["api", "timeout"]).unwrap_or(30);
        Ok(Some(WebDavBackend::new(&url, &username, &password, timeout)?))
    }

    fn request(&self, method: Method, filename: &str) -> RequestBuilder {
        let url = format!("{}{}", self.url, filename);
        self.client.request(method, &url).basic_auth(&self.username, Some(&self.password))
    }

    /// Read a key's `.prop`, None if there isn't one (or it's garbage)
    pub fn read_prop(&self, key: &str) -> BResult<Option<RemoteProp>> {
        let res = self.request(Method::GET, &format!("{}.prop", key)).send()?;
        match res.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            s if !s.is_success() => return Err(BError::Api(s.as_u16(), String::from("webdav prop read failed"))),
            _ => {}
        }
        let body = res.text()?;
        let prop = RemoteProp::parse(&body);
        if prop.is_none() {
            warn!("WebDavBackend.read_prop() -- unreadable prop for {}", key);
        }
        Ok(prop)
    }
}

/// Zip a single file into memory, the way the remote expects to find it
pub fn zip_file(file: &Path, filename: &str) -> BResult<Vec<u8>> {
    let mut contents = Vec::new();
    File::open(file)?.read_to_end(&mut contents)?;
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(filename, options)?;
    zip.write_all(&contents)?;
    Ok(zip.finish()?.into_inner())
}

/// A missing file is as good as a deleted one
fn deletion_done(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::NOT_FOUND
}

impl WebDavBackend {
    fn delete_file(&self, filename: &str) -> BResult<()> {
        let res = self.request(Method::DELETE, filename).send()?;
        if !deletion_done(res.status()) {
            return Err(BError::Api(res.status().as_u16(), format!("webdav delete of {} failed", filename)));
        }
        Ok(())
    }
}

impl FileBackend for WebDavBackend {
    fn download(&self, _library: LibraryId, key: &str, file: &Path, sink: &mut dyn TransferSink) -> BResult<()> {
        info!("WebDavBackend.download() -- {}.zip", key);
        sink.set_compressed(true);
        let res = self.request(Method::GET, &format!("{}.zip", key)).send()?;
        match res.status() {
            StatusCode::NOT_FOUND => return Err(BError::NotFound(format!("file for {}", key))),
            s if !s.is_success() => return Err(BError::Api(s.as_u16(), String::from("webdav download failed"))),
            _ => {}
        }
        stream_to_file(res, file, sink)
    }

    fn authorize_upload(&self, upload: &AttachmentUpload) -> BResult<AuthorizeUploadResponse> {
        if let Some(prop) = self.read_prop(&upload.key)? {
            if prop.hash == upload.md5.to_lowercase() {
                return Ok(AuthorizeUploadResponse::Exists);
            }
        }
        Ok(AuthorizeUploadResponse::New(UploadAuthorization {
            url: format!("{}{}.zip", self.url, upload.key),
            upload_key: upload.key.clone(),
            content_type: Some(String::from("application/zip")),
            ..Default::default()
        }))
    }

    fn upload(&self, upload: &AttachmentUpload, _auth: &UploadAuthorization, sink: &mut dyn TransferSink) -> BResult<()> {
        if sink.is_cancelled() {
            return Err(BError::Cancelled);
        }
        let body = zip_file(&upload.file, &upload.filename)?;
        let size = body.len() as u64;
        sink.progress(0, Some(size));
        let res = self.request(Method::PUT, &format!("{}.zip", upload.key))
            .header("Content-Type", "application/zip")
            .body(body)
            .send()?;
        if !res.status().is_success() {
            return Err(BError::Api(res.status().as_u16(), String::from("webdav upload failed")));
        }
        sink.progress(size, Some(size));
        Ok(())
    }

    fn register_upload(&self, upload: &AttachmentUpload, _auth: &UploadAuthorization) -> BResult<()> {
        let prop = RemoteProp { mtime: upload.mtime, hash: upload.md5.to_lowercase() };
        let res = self.request(Method::PUT, &format!("{}.prop", upload.key))
            .header("Content-Type", "text/xml")
            .body(prop.to_xml())
            .send()?;
        if !res.status().is_success() {
            return Err(BError::Api(res.status().as_u16(), String::from("webdav prop write failed")));
        }
        Ok(())
    }

    fn delete(&self, _library: LibraryId, keys: &[String]) -> BResult<Vec<String>> {
        let mut deleted = Vec::with_capacity(keys.len());
        for key in keys {
            let res = self.delete_file(&format!("{}.zip", key))
                .and_then(|_| self.delete_file(&format!("{}.prop", key)));
            match res {
                Ok(_) => deleted.push(key.clone()),
                Err(e) => warn!("WebDavBackend.delete() -- couldn't delete files for {}: {}", key, e),
            }
        }
        info!("WebDavBackend.delete() -- deleted {} of {} files", deleted.len(), keys.len());
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::ZipArchive;

    #[test]
    fn reads_and_writes_props() {
        let prop = RemoteProp::parse("<properties version=\"1\">\n  <mtime>1500000000000</mtime>\n  <hash>ABCDEF0123</hash>\n</properties>").unwrap();
        assert_eq!(prop, RemoteProp { mtime: 1500000000000, hash: String::from("abcdef0123") });
        assert_eq!(RemoteProp::parse(&prop.to_xml()), Some(prop));
        assert_eq!(RemoteProp::parse("<properties/>"), None);
    }

    #[test]
    fn zips_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.txt");
        File::create(&path).unwrap().write_all(b"hello there").unwrap();
        let zipped = zip_file(&path, "paper.txt").unwrap();
        let mut archive = ZipArchive::new(Cursor::new(zipped)).unwrap();
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_index(0).unwrap();
        assert_eq!(entry.name(), "paper.txt");
        let mut contents = String::new();
        entry.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello there");
    }

    #[test]
    fn missing_files_count_as_deleted() {
        assert!(deletion_done(StatusCode::NO_CONTENT));
        assert!(deletion_done(StatusCode::OK));
        assert!(deletion_done(StatusCode::NOT_FOUND));
        assert!(!deletion_done(StatusCode::FORBIDDEN));
        assert!(!deletion_done(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn normalizes_url() {
        let backend = WebDavBackend::new("https://dav.example.org/zotero", "me", "pw", 5).unwrap();
        assert_eq!(backend.url, "https://dav.example.org/zotero/");
    }
}
