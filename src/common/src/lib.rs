pub mod cli;
pub mod config;
pub mod model;
pub mod snapshot;
pub mod storage;

pub use config::Configuration;
pub use model::{BidState, BlobInfo, StreamRecord, StreamStatus};
