//! Attachment file transfers.

pub mod download;
pub mod downloader;
pub mod progress;
pub mod uploader;
