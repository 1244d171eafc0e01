use std::error::Error;
use std::convert::From;
use std::io;

use crate::models::library::LibraryId;
use crate::schema::SchemaError;

quick_error! {
    #[derive(Debug)]
    /// The sync engine's main error object.
    pub enum BError {
        Boxed(err: Box<dyn Error + Send + Sync>) {
            display("error: {}", err)
        }
        Msg(str: String) {
            display("error: {}", str)
        }
        BadValue(str: String) {
            display("bad value: {}", str)
        }
        MissingField(str: String) {
            display("missing field: {}", str)
        }
        NotFound(str: String) {
            display("not found: {}", str)
        }
        Db(err: rusqlite::Error) {
            source(err)
            display("local store error: {}", err)
        }
        Io(err: io::Error) {
            source(err)
            display("io error: {}", err)
        }
        Json(err: serde_json::Error) {
            source(err)
            display("json error: {}", err)
        }
        Transport(str: String) {
            display("transport error: {}", str)
        }
        Api(status: u16, msg: String) {
            display("api error: {} {}", status, msg)
        }
        InvalidCredentials {
            display("invalid credentials")
        }
        PermissionLoadingFailed(str: String) {
            display("could not load permissions: {}", str)
        }
        NotModified {
            display("not modified")
        }
        PreconditionFailed(library: LibraryId) {
            display("precondition failed: library {} changed remotely", library)
        }
        VersionMismatch(library: LibraryId) {
            display("version mismatch: library {} changed during sync", library)
        }
        GroupRemoved(id: i64, name: String) {
            display("group {} ({}) was removed remotely", name, id)
        }
        GroupWriteDenied(id: i64, name: String) {
            display("no write access to group {} ({})", name, id)
        }
        Schema(err: SchemaError) {
            display("schema error: {}", err)
        }
        Parse(key: Option<String>, str: String) {
            display("parse error ({}): {}", key.as_deref().unwrap_or("unknown key"), str)
        }
        ObjectRejected(key: String, code: u16, msg: String) {
            display("object {} rejected ({}): {}", key, code, msg)
        }
        Cancelled {
            display("cancelled")
        }
        ZipDidntContainRequestedFile(filename: String) {
            display("archive didn't contain {}", filename)
        }
        CantUnzip(str: String) {
            display("can't unzip: {}", str)
        }
        AttachmentMissing(key: String) {
            display("attachment {} is missing or empty", key)
        }
        AttachmentNotSubmitted(key: String) {
            display("attachment {} has unsynced metadata", key)
        }
        TryAgain {
            display("try again")
        }
    }
}

/// How far a failure reaches: what it aborts, and what retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// stop the whole run
    Fatal,
    /// the library changed remotely under a write
    Precondition,
    /// stop the library, keep going with the others
    Library,
    /// skip the object, keep going with its siblings
    Object,
    /// network-level failure, retried with backoff
    Transport,
}

impl BError {
    /// Classify this error into one of the sync failure scopes.
    pub fn class(&self) -> ErrorClass {
        match self {
            BError::InvalidCredentials |
                BError::PermissionLoadingFailed(..) |
                BError::Db(..) |
                BError::Cancelled => ErrorClass::Fatal,
            BError::PreconditionFailed(..) => ErrorClass::Precondition,
            BError::Schema(..) |
                BError::Parse(..) |
                BError::ObjectRejected(..) |
                BError::AttachmentMissing(..) |
                BError::AttachmentNotSubmitted(..) |
                BError::ZipDidntContainRequestedFile(..) |
                BError::CantUnzip(..) => ErrorClass::Object,
            BError::Transport(..) |
                BError::Io(..) => ErrorClass::Transport,
            BError::Api(status, _) => {
                match *status {
                    408 | 429 => ErrorClass::Transport,
                    s if s >= 500 => ErrorClass::Transport,
                    _ => ErrorClass::Library,
                }
            }
            _ => ErrorClass::Library,
        }
    }

    /// Whether this is a cancellation, which is never reported as a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            BError::Cancelled => true,
            _ => false,
        }
    }
}

/// converts non-BError errors to BError, via the From trait.
#[macro_export]
macro_rules! toberr {
    ($e:expr) => (
        {
            let err: $crate::error::BError = From::from($e);
            err
        }
    )
}

/// A macro to make it easy to create From impls for BError
macro_rules! from_err {
    ($t:ty) => (
        impl From<$t> for BError {
            fn from(err: $t) -> BError {
                BError::Boxed(Box::new(err))
            }
        }
    )
}

impl From<io::Error> for BError {
    fn from(err: io::Error) -> BError {
        BError::Io(err)
    }
}
impl From<rusqlite::Error> for BError {
    fn from(err: rusqlite::Error) -> BError {
        BError::Db(err)
    }
}
impl From<serde_json::Error> for BError {
    fn from(err: serde_json::Error) -> BError {
        BError::Json(err)
    }
}
impl From<SchemaError> for BError {
    fn from(err: SchemaError) -> BError {
        BError::Schema(err)
    }
}
impl From<reqwest::Error> for BError {
    fn from(err: reqwest::Error) -> BError {
        match err.status() {
            Some(status) => BError::Api(status.as_u16(), err.to_string()),
            None => BError::Transport(err.to_string()),
        }
    }
}
impl From<zip::result::ZipError> for BError {
    fn from(err: zip::result::ZipError) -> BError {
        BError::CantUnzip(err.to_string())
    }
}
from_err!(serde_yaml::Error);
from_err!(log::SetLoggerError);
from_err!(time::error::Format);
from_err!(std::num::ParseIntError);

pub type BResult<T> = Result<T, BError>;

/// Shorthand for returning a boxed-up error message
#[macro_export]
macro_rules! BErr {
    ($msg:expr) => (Err($crate::error::BError::Msg(format!("{}", $msg))))
}
