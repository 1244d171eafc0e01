//! One attachment download, start to finish: transfer, validation, and
//! unpacking the archive if the remote sent one.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use zip::ZipArchive;

use crate::api::{FileBackend, TransferSink};
use crate::error::{BResult, BError};
use crate::models::file_sync::Download;
use crate::sync::files::progress::Progress;

/// What the remote sends instead of a 404 sometimes
const NOT_FOUND_SENTINEL: &'static [u8] = b"Not found";

/// Units of a download's progress given to the transfer when the payload is
/// an archive. The rest goes to unpacking it.
const COMPRESSED_TRANSFER_UNITS: u64 = 90;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownloadState {
    Queued,
    Downloading,
    Unzipping,
    Done,
    Cancelled,
}

pub struct DownloadOperation {
    pub download: Download,
    pub parent_key: Option<String>,
    pub file: PathBuf,
    backend: Arc<dyn FileBackend>,
    /// 100 units, split between transfer and unzip once we know which
    pub progress: Progress,
    state: std::sync::Mutex<DownloadState>,
}

/// Feeds backend progress into the operation's progress tree
struct Sink<'a> {
    op: &'a DownloadOperation,
    transfer: Progress,
    unzip: Progress,
    compressed: bool,
    setup: bool,
    on_progress: &'a mut dyn FnMut(f64),
}

impl<'a> Sink<'a> {
    fn setup(&mut self) {
        if self.setup { return; }
        self.setup = true;
        if self.compressed {
            self.op.progress.add_child(&self.transfer, COMPRESSED_TRANSFER_UNITS);
            self.op.progress.add_child(&self.unzip, 100 - COMPRESSED_TRANSFER_UNITS);
        } else {
            self.op.progress.add_child(&self.transfer, 100);
        }
    }
}

impl<'a> TransferSink for Sink<'a> {
    fn set_compressed(&mut self, compressed: bool) {
        if self.setup { return; }
        self.compressed = compressed;
        self.setup();
    }

    fn progress(&mut self, completed: u64, total: Option<u64>) {
        self.setup();
        if let Some(total) = total {
            if total > 0 {
                self.transfer.set_completed(completed.saturating_mul(100) / total);
            }
        }
        (self.on_progress)(self.op.progress.fraction());
    }

    fn is_cancelled(&self) -> bool {
        self.op.progress.is_cancelled()
    }
}

fn remove_file_quietly(file: &Path) {
    match fs::remove_file(file) {
        Ok(_) => {}
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("DownloadOperation -- couldn't remove {:?}: {}", file, e),
    }
}

/// Check for the not-found responses that come back looking like files
fn validate(file: &Path) -> BResult<()> {
    let size = fs::metadata(file)?.len();
    let disguised = if size == 0 {
        true
    } else if size == NOT_FOUND_SENTINEL.len() as u64 {
        let mut contents = Vec::with_capacity(NOT_FOUND_SENTINEL.len());
        File::open(file)?.read_to_end(&mut contents)?;
        contents == NOT_FOUND_SENTINEL
    } else {
        false
    };
    if disguised {
        remove_file_quietly(file);
        return Err(BError::NotFound(format!("{:?}", file)));
    }
    Ok(())
}

impl DownloadOperation {
    pub fn new(download: Download, parent_key: Option<String>, file: PathBuf, backend: Arc<dyn FileBackend>) -> DownloadOperation {
        DownloadOperation {
            download,
            parent_key,
            file,
            backend,
            progress: Progress::new(100),
            state: std::sync::Mutex::new(DownloadState::Queued),
        }
    }

    pub fn state(&self) -> DownloadState {
        *lock!(self.state)
    }

    fn set_state(&self, state: DownloadState) {
        let mut guard = lock!(self.state);
        if *guard != DownloadState::Cancelled {
            *guard = state;
        }
    }

    /// Flag this download cancelled. A running transfer or extraction
    /// notices at its next chunk/entry.
    pub fn cancel(&self) {
        self.progress.cancel();
        let mut state = lock!(self.state);
        if *state != DownloadState::Done {
            *state = DownloadState::Cancelled;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.progress.is_cancelled()
    }

    fn dir(&self) -> BResult<PathBuf> {
        self.file.parent()
            .map(|x| x.to_path_buf())
            .ok_or_else(|| BError::BadValue(format!("DownloadOperation -- {:?} has no directory", self.file)))
    }

    /// Run the download. `on_progress` gets the overall fraction every time
    /// it moves.
    pub fn run(&self, on_progress: &mut dyn FnMut(f64)) -> BResult<()> {
        if self.is_cancelled() {
            return Err(BError::Cancelled);
        }
        self.set_state(DownloadState::Downloading);
        let dir = self.dir()?;
        crate::util::create_dir(&dir)?;
        let transfer = Progress::new(100);
        let unzip = Progress::new(100);
        let compressed = {
            let mut sink = Sink {
                op: self,
                transfer: transfer.clone(),
                unzip: unzip.clone(),
                compressed: false,
                setup: false,
                on_progress: &mut *on_progress,
            };
            let res = self.backend.download(self.download.library, &self.download.key, &self.file, &mut sink);
            if let Err(e) = res {
                remove_file_quietly(&self.file);
                return Err(if self.is_cancelled() { BError::Cancelled } else { e });
            }
            if self.is_cancelled() {
                remove_file_quietly(&self.file);
                return Err(BError::Cancelled);
            }
            sink.setup();
            transfer.finish();
            (sink.on_progress)(self.progress.fraction());
            sink.compressed
        };
        validate(&self.file)?;
        if compressed {
            self.set_state(DownloadState::Unzipping);
            if let Err(e) = self.unzip(&dir, &unzip) {
                if e.is_cancelled() {
                    if let Err(e) = fs::remove_dir_all(&dir) {
                        warn!("DownloadOperation.run() -- couldn't clean up {:?}: {}", dir, e);
                    }
                }
                return Err(e);
            }
        }
        self.progress.finish();
        on_progress(self.progress.fraction());
        self.set_state(DownloadState::Done);
        Ok(())
    }

    /// Swap the downloaded archive in for the attachment directory's contents
    fn unzip(&self, dir: &Path, progress: &Progress) -> BResult<()> {
        let archive_path = dir.join(format!("{}.zip", self.download.key));
        fs::rename(&self.file, &archive_path)?;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path == archive_path { continue; }
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }

        let mut extracted = Vec::new();
        {
            let mut archive = ZipArchive::new(File::open(&archive_path)?)?;
            let count = archive.len();
            for i in 0..count {
                if self.is_cancelled() {
                    return Err(BError::Cancelled);
                }
                let mut entry = archive.by_index(i)?;
                let name = match entry.enclosed_name() {
                    Some(x) => x,
                    None => {
                        warn!("DownloadOperation.unzip() -- skipping unsafe entry {}", entry.name());
                        continue;
                    }
                };
                let target = dir.join(name);
                if entry.is_dir() {
                    crate::util::create_dir(&target)?;
                } else {
                    if let Some(parent) = target.parent() {
                        crate::util::create_dir(parent)?;
                    }
                    let mut out = File::create(&target)?;
                    io::copy(&mut entry, &mut out)?;
                    extracted.push(target);
                }
                progress.set_completed(((i + 1) as u64 * 100) / count as u64);
            }
        }

        if let Err(e) = fs::remove_file(&archive_path) {
            warn!("DownloadOperation.unzip() -- couldn't remove archive {:?}: {}", archive_path, e);
        }
        if !self.file.exists() && extracted.len() == 1 {
            debug!("DownloadOperation.unzip() -- renaming {:?} to {:?}", extracted[0], self.file);
            fs::rename(&extracted[0], &self.file)?;
        }
        if !self.file.exists() {
            let filename = self.file.file_name()
                .map(|x| x.to_string_lossy().into_owned())
                .unwrap_or_else(String::new);
            return Err(BError::ZipDidntContainRequestedFile(filename));
        }
        progress.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;
    use crate::models::file_sync::AttachmentUpload;
    use crate::models::library::LibraryId;
    use crate::models::response::{AuthorizeUploadResponse, UploadAuthorization};

    struct StaticBackend {
        body: Vec<u8>,
        compressed: bool,
        /// report progress per chunk
        chatty: bool,
    }

    impl FileBackend for StaticBackend {
        fn download(&self, _library: LibraryId, _key: &str, file: &Path, sink: &mut dyn TransferSink) -> BResult<()> {
            sink.set_compressed(self.compressed);
            let total = self.body.len() as u64;
            let mut out = File::create(file)?;
            for (i, chunk) in self.body.chunks(4).enumerate() {
                if sink.is_cancelled() { return Err(BError::Cancelled); }
                out.write_all(chunk)?;
                if self.chatty {
                    sink.progress(std::cmp::min(((i + 1) * 4) as u64, total), Some(total));
                }
            }
            Ok(())
        }
        fn authorize_upload(&self, _upload: &AttachmentUpload) -> BResult<AuthorizeUploadResponse> {
            Ok(AuthorizeUploadResponse::Exists)
        }
        fn upload(&self, _upload: &AttachmentUpload, _auth: &UploadAuthorization, _sink: &mut dyn TransferSink) -> BResult<()> {
            Ok(())
        }
        fn register_upload(&self, _upload: &AttachmentUpload, _auth: &UploadAuthorization) -> BResult<()> {
            Ok(())
        }
        fn delete(&self, _library: LibraryId, keys: &[String]) -> BResult<Vec<String>> {
            Ok(keys.to_vec())
        }
    }

    fn zipped(files: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn op(dir: &Path, body: Vec<u8>, compressed: bool) -> DownloadOperation {
        op_with(dir, StaticBackend { body, compressed, chatty: true })
    }

    fn op_with(dir: &Path, backend: StaticBackend) -> DownloadOperation {
        let backend = Arc::new(backend);
        DownloadOperation::new(
            Download::new("ATT00001", LibraryId::Personal),
            Some(String::from("ITEM0001")),
            dir.join("ATT00001").join("paper.pdf"),
            backend,
        )
    }

    #[test]
    fn downloads_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        let op = op(dir.path(), b"a pdf, honest".to_vec(), false);
        let mut seen = Vec::new();
        op.run(&mut |x| seen.push(x)).unwrap();
        assert_eq!(fs::read_to_string(&op.file).unwrap(), "a pdf, honest");
        assert_eq!(op.state(), DownloadState::Done);
        assert_eq!(seen.last(), Some(&1.0));
        let mut sorted = seen.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, sorted);
    }

    #[test]
    fn catches_disguised_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let op = op(dir.path(), b"Not found".to_vec(), false);
        match op.run(&mut |_| {}) {
            Err(BError::NotFound(_)) => {}
            x => panic!("expected NotFound, got {:?}", x),
        }
        assert!(!op.file.exists());

        let op2 = op_empty(dir.path());
        match op2.run(&mut |_| {}) {
            Err(BError::NotFound(_)) => {}
            x => panic!("expected NotFound, got {:?}", x),
        }
        assert!(!op2.file.exists());
    }

    fn op_empty(dir: &Path) -> DownloadOperation {
        op(dir, Vec::new(), false)
    }

    #[test]
    fn renames_a_single_extracted_file() {
        let dir = tempfile::tempdir().unwrap();
        let op = op(dir.path(), zipped(&[("Paper (1).pdf", "contents")]), true);
        let stray = dir.path().join("ATT00001").join("old.txt");
        crate::util::create_dir(stray.parent().unwrap()).unwrap();
        fs::write(&stray, "stale").unwrap();
        op.run(&mut |_| {}).unwrap();
        assert_eq!(fs::read_to_string(&op.file).unwrap(), "contents");
        assert!(!stray.exists());
        assert!(!dir.path().join("ATT00001").join("ATT00001.zip").exists());
    }

    #[test]
    fn fails_when_archive_misses_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let op = op(dir.path(), zipped(&[("a.txt", "a"), ("b.txt", "b")]), true);
        match op.run(&mut |_| {}) {
            Err(BError::ZipDidntContainRequestedFile(name)) => assert_eq!(name, "paper.pdf"),
            x => panic!("expected ZipDidntContainRequestedFile, got {:?}", x),
        }
    }

    #[test]
    fn archives_finish_only_after_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let op = op(dir.path(), zipped(&[("Paper (1).pdf", "contents of a longish paper")]), true);
        let mut seen = Vec::new();
        op.run(&mut |x| seen.push(x)).unwrap();
        assert!(seen.len() >= 3);
        assert_eq!(seen.last(), Some(&1.0));
        // the transfer tops out at 0.9, extraction is what gets it to 1.0
        let before_last = seen[seen.len() - 2];
        assert!((before_last - 0.9).abs() < 1e-9);
        assert!(seen[..seen.len() - 1].iter().all(|x| *x <= 0.9 + 1e-9));
    }

    #[test]
    fn cancelled_while_extracting() {
        let dir = tempfile::tempdir().unwrap();
        let body = zipped(&[("a.pdf", "a"), ("b.pdf", "b")]);
        let op = op_with(dir.path(), StaticBackend { body, compressed: true, chatty: false });
        // the only call before extraction is the one after the transfer
        let res = op.run(&mut |x| {
            if x < 1.0 { op.cancel(); }
        });
        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(op.state(), DownloadState::Cancelled);
        assert!(!dir.path().join("ATT00001").exists());
    }

    #[test]
    fn cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let op = op(dir.path(), b"whatever".to_vec(), false);
        op.cancel();
        assert!(op.run(&mut |_| {}).unwrap_err().is_cancelled());
        assert_eq!(op.state(), DownloadState::Cancelled);
        assert!(!op.file.exists());
    }
}
