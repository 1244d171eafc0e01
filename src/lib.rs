#![recursion_limit="128"]

extern crate crossbeam;
extern crate fern;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate quick_error;
extern crate regex;
extern crate reqwest;
extern crate rusqlite;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
extern crate serde_yaml;
extern crate time;
extern crate zip;

#[macro_use]
pub mod error;
#[macro_use]
mod util;
pub mod config;
pub mod api;
pub mod models;
pub mod schema;
pub mod storage;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::api::{FileBackend, FileBackends, RemoteApi};
use crate::api::http::HttpApi;
use crate::api::webdav::WebDavBackend;
use crate::error::BResult;
use crate::storage::Storage;
use crate::sync::controller::SyncController;
use crate::sync::files::downloader::AttachmentDownloader;
use crate::sync::files::uploader::AttachmentUploader;

pub use crate::error::{BError, ErrorClass};
pub use crate::util::stopper::Stopper;
pub use crate::util::thredder::Thredder;

/// Init any state/logging/etc the app needs. `config_str` is a JSON object
/// merged over the config file; an unparseable string is ignored.
pub fn init(config_str: &str) -> BResult<()> {
    let runtime_config: Value = match serde_json::from_str(config_str) {
        Ok(x) => x,
        Err(e) => {
            println!("Problem parsing runtime config: {}", e);
            json!({})
        }
    };
    config::merge(&runtime_config)?;
    match util::logger::setup_logger() {
        Ok(_) => {}
        Err(e) => {
            println!("Problem setting up logging: {}", e);
            return Err(toberr!(e));
        }
    };
    Ok(())
}

/// Wire up a controller from the config: the HTTP API, WebDAV for the
/// personal library when enabled, and both attachment managers.
pub fn create_controller(db_location: &str) -> BResult<Arc<SyncController>> {
    let storage = Arc::new(Storage::new(db_location)?);
    let http = Arc::new(HttpApi::from_config()?);
    let api: Arc<dyn RemoteApi> = http.clone();
    let file_api: Arc<dyn FileBackend> = http;
    let mut backends = FileBackends::new(file_api);
    if let Some(webdav) = WebDavBackend::from_config()? {
        info!("create_controller() -- using WebDAV for the personal library");
        backends = backends.with_webdav(Arc::new(webdav));
    }
    let folder: String = config::get(&["files", "folder"])?;
    util::create_dir(&folder)?;
    let downloader = AttachmentDownloader::from_config(backends.clone(), Some(storage.clone()))?;
    let uploader = AttachmentUploader::from_config(backends.clone(), storage.clone())?;
    let controller = SyncController::new(storage, api)
        .with_files_folder(PathBuf::from(folder))
        .with_file_backends(backends)
        .with_downloader(Arc::new(downloader))
        .with_uploader(Arc::new(uploader));
    Ok(Arc::new(controller))
}
