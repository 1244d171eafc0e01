use std::fs;
use std::path::Path;

use crate::error::BResult;

macro_rules! do_lock {
    ($lock:expr) => {{
        $lock.expect(concat!("bibsync::util::do_lock!() -- failed to grab lock at ", file!(), "::", line!()))
    }}
}

/// A macro that wraps locking mutexes. Really handy for debugging deadlocks.
macro_rules! lock {
    ($lockable:expr) => { do_lock!($lockable.lock()) }
}

/// A macro that wraps read-locking RwLocks.
macro_rules! lockr {
    ($lockable:expr) => { do_lock!($lockable.read()) }
}

/// A macro that wraps write-locking RwLocks.
macro_rules! lockw {
    ($lockable:expr) => { do_lock!($lockable.write()) }
}

pub mod json;
pub mod logger;
pub mod stopper;
pub mod thredder;

/// Current unix time, in seconds
pub fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Parse an RFC3339 timestamp (as found in `dateModified`) into unix seconds.
pub fn parse_timestamp(ts: &str) -> Option<i64> {
    time::OffsetDateTime::parse(ts, &time::format_description::well_known::Rfc3339)
        .ok()
        .map(|x| x.unix_timestamp())
}

/// Create a directory if it doesn't exist
pub fn create_dir<P: AsRef<Path>>(dir: P) -> BResult<()> {
    let path = dir.as_ref();
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timestamps() {
        assert_eq!(parse_timestamp("2019-06-01T10:00:00Z"), Some(1559383200));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
