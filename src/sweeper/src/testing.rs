//! In-process fakes for every external store of a sweep.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! sweeper = { path = "src/sweeper", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sweeper::testing::{InMemoryClaimIndex, InMemoryStreamSource};
//!
//! let source = InMemoryStreamSource::new();
//! source.add_stream(1, "sd1", &[("blob1", 10)]);
//!
//! let index = InMemoryClaimIndex::new();
//! index.insert("sd1", "Spent", "claim1");
//! ```

use crate::chainquery::{ClaimIndex, ClaimRow};
use crate::error::{SweepError, SweepResult};
use crate::purge::{BatchReport, BulkDeleter};
use crate::reflector::{IdWindow, StreamBlob, StreamSource};
use crate::verifier::{ClaimLookup, VerifyError};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reflector database held in memory.
#[derive(Debug, Default)]
pub struct InMemoryStreamSource {
    streams: Mutex<BTreeMap<i64, String>>,
    blobs: DashMap<i64, Vec<StreamBlob>>,
}

impl InMemoryStreamSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream(&self, stream_id: i64, sd_hash: &str, blobs: &[(&str, i64)]) {
        lock(&self.streams).insert(stream_id, sd_hash.to_string());
        self.blobs.insert(
            stream_id,
            blobs
                .iter()
                .map(|(hash, id)| (hash.to_string(), *id))
                .collect(),
        );
    }
}

#[async_trait]
impl StreamSource for InMemoryStreamSource {
    async fn max_stream_id(&self) -> SweepResult<i64> {
        Ok(lock(&self.streams).keys().next_back().copied().unwrap_or(0))
    }

    async fn streams_in_window(&self, window: IdWindow) -> SweepResult<Vec<(i64, String)>> {
        Ok(lock(&self.streams)
            .range(window.start..=window.end)
            .map(|(id, hash)| (*id, hash.clone()))
            .collect())
    }

    async fn blobs_for_stream(&self, stream_id: i64) -> SweepResult<Vec<StreamBlob>> {
        Ok(self
            .blobs
            .get(&stream_id)
            .map(|blobs| blobs.clone())
            .unwrap_or_default())
    }
}

/// Claim index held in memory, keyed by sd hash.
#[derive(Debug, Default)]
pub struct InMemoryClaimIndex {
    claims: DashMap<String, (String, String)>,
}

impl InMemoryClaimIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sd_hash: &str, bid_state: &str, claim_id: &str) {
        self.claims.insert(
            sd_hash.to_string(),
            (bid_state.to_string(), claim_id.to_string()),
        );
    }
}

#[async_trait]
impl ClaimIndex for InMemoryClaimIndex {
    async fn bid_states(&self, sd_hashes: &[String]) -> SweepResult<Vec<ClaimRow>> {
        Ok(sd_hashes
            .iter()
            .filter_map(|hash| {
                self.claims.get(hash).map(|claim| ClaimRow {
                    sd_hash: hash.clone(),
                    bid_state: claim.0.clone(),
                    claim_id: claim.1.clone(),
                })
            })
            .collect())
    }
}

/// Bulk deleter that records every call and deletes nothing real.
#[derive(Debug, Default)]
pub struct RecordingDeleter {
    calls: Mutex<Vec<Vec<String>>>,
    fail_on_call: Option<usize>,
    counter: AtomicUsize,
}

impl RecordingDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call`-th bulk delete (1-based) as a whole.
    pub fn failing_on_call(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }

    /// Keys of every call, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.calls).clone()
    }

    /// Every key that was reported deleted.
    pub fn deleted_keys(&self) -> Vec<String> {
        let failed = self.fail_on_call.map(|call| call - 1);
        lock(&self.calls)
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != failed)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl BulkDeleter for RecordingDeleter {
    async fn delete_batch(&self, keys: &[String]) -> SweepResult<BatchReport> {
        let call = {
            let mut calls = lock(&self.calls);
            calls.push(keys.to_vec());
            self.counter.fetch_add(1, Ordering::SeqCst) + 1
        };
        if Some(call) == self.fail_on_call {
            return Err(SweepError::Unavailable(format!("bulk delete {call} rejected")));
        }
        Ok(BatchReport {
            deleted: keys.to_vec(),
            rejected: Vec::new(),
        })
    }
}

/// Chain hub answering from a fixed set of live claim ids.
#[derive(Debug, Default)]
pub struct StaticLookup {
    live: DashSet<String>,
    unreachable: bool,
}

impl StaticLookup {
    pub fn new<'a>(live_claims: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            live: live_claims.into_iter().map(str::to_string).collect(),
            unreachable: false,
        }
    }

    /// A hub that fails every lookup.
    pub fn unreachable() -> Self {
        Self {
            live: DashSet::new(),
            unreachable: true,
        }
    }
}

#[async_trait]
impl ClaimLookup for StaticLookup {
    async fn claim_exists(&self, claim_id: &str) -> Result<bool, VerifyError> {
        if self.unreachable {
            return Err(VerifyError::Timeout("connect"));
        }
        Ok(self.live.contains(claim_id))
    }
}
