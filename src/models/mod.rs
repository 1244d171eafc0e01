//! The data the sync engine moves around: libraries and their version vectors,
//! syncable objects, transfer batches, and parsed remote responses.

pub mod batch;
pub mod file_sync;
pub mod library;
pub mod object;
pub mod response;
