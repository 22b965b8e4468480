//! Purge Executor
//!
//! Deletes the blobs of invalid streams from the object store in bulk
//! batches and feeds confirmed deletions back into the local cache.

pub mod deleter;
pub mod executor;

pub use deleter::{BatchReport, BulkDeleter, ObjectStoreDeleter};
pub use executor::{PurgeExecutor, PurgeFailure, PurgeOutcome};
