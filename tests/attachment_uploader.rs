#![allow(dead_code, unused_imports)]

include!("./lib/util.rs");

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::PathBuf;

    use bibsync_core::api::FileBackends;
    use bibsync_core::models::file_sync::attachment_path;
    use bibsync_core::models::object::{AttachmentInfo, SyncObject};
    use bibsync_core::storage::requests::{ReadAttachmentUploads, ReadObject};
    use bibsync_core::sync::files::uploader::AttachmentUploader;

    const FILENAME: &'static str = "paper.pdf";

    /// Store an attachment item whose file the remote hasn't seen, and write
    /// its file unless `contents` is None
    fn add_attachment(storage: &Storage, folder: &Path, key: &str, remote_md5: Option<&str>, contents: Option<&str>) -> SyncObject {
        let data = json!({
            "itemType": "attachment",
            "parentItem": "ITEMPRNT",
            "linkMode": "imported_file",
            "filename": FILENAME,
            "contentType": "application/pdf",
        });
        let mut item = synced(ObjectType::Item, key, 1, data);
        let mut att = AttachmentInfo::from_data(&item.data).unwrap();
        att.md5 = Some(String::from("localmd5"));
        att.remote_md5 = remote_md5.map(String::from);
        att.mtime = Some(1500000000);
        att.needs_upload = true;
        item.attachment = Some(att);
        save(storage, item.clone());
        if let Some(contents) = contents {
            let file = attachment_path(folder, LibraryId::Personal, key, FILENAME);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(&file, contents).unwrap();
        }
        item
    }

    fn uploader(files: &Arc<FakeFiles>, storage: &Arc<Storage>) -> AttachmentUploader {
        AttachmentUploader::new(FileBackends::new(files.clone()), storage.clone(), 2).unwrap()
    }

    fn attachment(storage: &Storage, key: &str) -> AttachmentInfo {
        let item = storage.perform(&ReadObject { library: LibraryId::Personal, object: ObjectType::Item, key: String::from(key) }).unwrap().unwrap();
        item.attachment.unwrap()
    }

    #[test]
    fn uploads_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage();
        let files = Arc::new(FakeFiles::new());
        add_attachment(&storage, dir.path(), "ATT00001", None, Some("%PDF-1.4 and so on"));
        let uploader = uploader(&files, &storage);

        let results = uploader.sync_library(LibraryId::Personal, dir.path()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "ATT00001");
        assert!(results[0].1.is_ok());
        assert_eq!(*files.uploads.lock().unwrap(), vec!["ATT00001"]);
        assert_eq!(*files.registered.lock().unwrap(), vec!["ATT00001"]);
        let att = attachment(&storage, "ATT00001");
        assert!(!att.needs_upload);
        assert_eq!(att.remote_md5, Some(String::from("localmd5")));

        // nothing left to do the second time around
        assert_eq!(uploader.sync_library(LibraryId::Personal, dir.path()).unwrap().len(), 0);
    }

    #[test]
    fn updates_name_the_parent_item() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage();
        let files = Arc::new(FakeFiles::new());
        add_attachment(&storage, dir.path(), "ATT00001", None, Some("%PDF-1.4"));
        let uploader = uploader(&files, &storage);
        let events = uploader.subscribe();

        uploader.sync_library(LibraryId::Personal, dir.path()).unwrap();
        let mut updates = Vec::new();
        loop {
            let update = events.recv_timeout(Duration::from_secs(10)).unwrap();
            let done = update.kind.is_terminal();
            updates.push(update);
            if done { break; }
        }
        assert!(updates.iter().all(|x| x.parent_key == Some(String::from("ITEMPRNT"))));
    }

    #[test]
    fn cancelling_a_queued_upload_ends_it_at_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage();
        let files = Arc::new(FakeFiles::new());
        files.hold_uploads(true);
        add_attachment(&storage, dir.path(), "ATT00001", None, Some("first"));
        add_attachment(&storage, dir.path(), "ATT00002", None, Some("second"));
        let uploader = AttachmentUploader::new(FileBackends::new(files.clone()), storage.clone(), 1).unwrap();
        let uploads = storage.perform(&ReadAttachmentUploads { library: LibraryId::Personal, folder: dir.path().to_path_buf() }).unwrap();
        assert_eq!(uploads.len(), 2);

        let running = uploader.upload(uploads[0].clone()).unwrap();
        for _ in 0..1000 {
            if files.upload_attempts.lock().unwrap().len() > 0 { break; }
            sleep(5);
        }
        let queued = uploader.upload(uploads[1].clone()).unwrap();
        assert!(uploader.cancel(&uploads[1]));
        // the only worker is busy, so this can only come from cancel()
        match queued.recv_timeout(Duration::from_secs(1)).unwrap().kind {
            UpdateKind::Cancelled => {}
            x => panic!("expected Cancelled, got {:?}", x),
        }
        assert!(uploader.data(&uploads[1]).0.is_none());

        files.hold_uploads(false);
        match terminal(&running) {
            UpdateKind::Ready => {}
            x => panic!("expected Ready, got {:?}", x),
        }
        // give the worker time to pick up (and drop) the cancelled job
        sleep(100);
        assert_eq!(*files.upload_attempts.lock().unwrap(), vec!["ATT00001"]);
        assert!(attachment(&storage, "ATT00002").needs_upload);
        assert!(!uploader.cancel(&uploads[1]));
    }

    #[test]
    fn remote_already_has_it() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage();
        let files = Arc::new(FakeFiles::new());
        files.existing.lock().unwrap().insert(String::from("localmd5"));
        add_attachment(&storage, dir.path(), "ATT00001", None, Some("%PDF"));

        let results = uploader(&files, &storage).sync_library(LibraryId::Personal, dir.path()).unwrap();
        assert!(results[0].1.is_ok());
        assert_eq!(files.uploads.lock().unwrap().len(), 0);
        assert!(!attachment(&storage, "ATT00001").needs_upload);
    }

    #[test]
    fn matching_hash_skips_the_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage();
        let files = Arc::new(FakeFiles::new());
        // no file on disk either: a matching hash never looks for it
        add_attachment(&storage, dir.path(), "ATT00001", Some("localmd5"), None);

        let results = uploader(&files, &storage).sync_library(LibraryId::Personal, dir.path()).unwrap();
        assert!(results[0].1.is_ok());
        assert_eq!(files.uploads.lock().unwrap().len(), 0);
        assert!(!attachment(&storage, "ATT00001").needs_upload);
    }

    #[test]
    fn missing_files_fail_alone() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage();
        let files = Arc::new(FakeFiles::new());
        add_attachment(&storage, dir.path(), "ATT00001", None, None);
        add_attachment(&storage, dir.path(), "ATT00002", None, Some("%PDF"));

        let results = uploader(&files, &storage).sync_library(LibraryId::Personal, dir.path()).unwrap();
        assert_eq!(results.len(), 2);
        let err = results[0].1.clone().unwrap_err();
        match *err {
            BError::AttachmentMissing(ref key) => assert_eq!(key, "ATT00001"),
            ref x => panic!("unexpected error {:?}", x),
        }
        assert!(results[1].1.is_ok());
        assert!(attachment(&storage, "ATT00001").needs_upload);
        assert!(!attachment(&storage, "ATT00002").needs_upload);
    }

    #[test]
    fn unsynced_items_hold_their_files_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage();
        let files = Arc::new(FakeFiles::new());
        let mut item = add_attachment(&storage, dir.path(), "ATT00001", None, Some("%PDF"));
        item.set_field("title", json!("renamed locally"));
        save(&storage, item.clone());
        let uploader = uploader(&files, &storage);

        // the library pass leaves it for after the metadata goes up
        assert_eq!(uploader.sync_library(LibraryId::Personal, dir.path()).unwrap().len(), 0);

        let att = item.attachment.clone().unwrap();
        let upload = AttachmentUpload {
            key: item.key.clone(),
            library: LibraryId::Personal,
            filename: att.filename.clone(),
            content_type: String::from("application/pdf"),
            md5: String::from("localmd5"),
            mtime: 1500000000,
            file: attachment_path(dir.path(), LibraryId::Personal, &item.key, FILENAME),
            remote_md5: None,
            parent_key: item.parent.clone(),
        };
        let rx = uploader.upload(upload.clone()).unwrap();
        match terminal(&rx) {
            UpdateKind::Failed(err) => {
                match *err {
                    BError::AttachmentNotSubmitted(ref key) => assert_eq!(key, "ATT00001"),
                    ref x => panic!("unexpected error {:?}", x),
                }
            }
            x => panic!("expected Failed, got {:?}", x),
        }
        assert!(uploader.data(&upload).1.is_some());
        assert_eq!(files.uploads.lock().unwrap().len(), 0);
    }
}
