use thiserror::Error;

/// Errors that abort a sweep stage.
///
/// Everything here is fatal to the stage that raised it: a partial stream
/// list, classification or inventory must never reach the purge path.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Database query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Claim index returned more than one claim for sd_hash {sd_hash}")]
    DuplicateClaim { sd_hash: String },

    #[error("Stream enumeration stalled: {windows} windows up to id {max_id} returned no streams")]
    EnumerationStalled { windows: usize, max_id: i64 },

    #[error("Refusing to remove metadata of stream {stream_id}: {reason}")]
    UnsafeRemoval { stream_id: i64, reason: String },

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

pub type SweepResult<T> = Result<T, SweepError>;
