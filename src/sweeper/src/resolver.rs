//! Claim Resolver
//!
//! Classifies streams by looking up the bid state of their sd hash in the
//! claim index, in batches drained by a worker pool.

use crate::chainquery::ClaimIndex;
use crate::error::{SweepError, SweepResult};
use crate::pool::drain_queue;
use common::model::{BidState, StreamRecord};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::sync::Arc;

/// Which terminal bid states make a stream invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimChecks {
    pub expired: bool,
    pub spent: bool,
}

impl Default for ClaimChecks {
    fn default() -> Self {
        Self {
            expired: true,
            spent: true,
        }
    }
}

type Classification = (BidState, String);

pub struct ClaimResolver {
    index: Arc<dyn ClaimIndex>,
    workers: usize,
    batch_size: usize,
}

impl ClaimResolver {
    pub fn new(index: Arc<dyn ClaimIndex>, workers: usize, batch_size: usize) -> Self {
        Self {
            index,
            workers,
            batch_size: batch_size.max(1),
        }
    }

    /// Classify every record in place.
    ///
    /// Either all records end up resolved or an error is returned and none
    /// are touched.
    pub async fn resolve(&self, records: &mut [StreamRecord], checks: ClaimChecks) -> SweepResult<()> {
        let mut seen = HashSet::with_capacity(records.len());
        let hashes: Vec<String> = records
            .iter()
            .filter(|record| seen.insert(record.sd_hash.as_str()))
            .map(|record| record.sd_hash.clone())
            .collect();
        let batches: Vec<Vec<String>> = hashes
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();

        tracing::info!(
            hashes = hashes.len(),
            batches = batches.len(),
            check_expired = checks.expired,
            check_spent = checks.spent,
            "Resolving claims"
        );

        let accumulator: Arc<DashMap<String, Classification>> = Arc::new(DashMap::new());
        let sink = Arc::clone(&accumulator);
        let index = Arc::clone(&self.index);

        drain_queue(self.workers, batches, move |worker_id, batch| {
            let sink = Arc::clone(&sink);
            let index = Arc::clone(&index);
            async move {
                let rows = index.bid_states(&batch).await?;
                tracing::debug!(
                    worker_id,
                    batch_size = batch.len(),
                    claims = rows.len(),
                    "Resolved claim batch"
                );
                for row in rows {
                    let state =
                        BidState::from_raw(&row.bid_state).filtered(checks.expired, checks.spent);
                    match sink.entry(row.sd_hash) {
                        Entry::Occupied(entry) => {
                            return Err(SweepError::DuplicateClaim {
                                sd_hash: entry.key().clone(),
                            });
                        }
                        Entry::Vacant(entry) => {
                            entry.insert((state, row.claim_id));
                        }
                    }
                }
                Ok(())
            }
        })
        .await?;

        for record in records.iter_mut() {
            match accumulator.get(&record.sd_hash) {
                Some(found) => {
                    let (state, claim_id) = found.value();
                    record.apply_classification(Some(*state), Some(claim_id.clone()));
                }
                None => record.apply_classification(None, None),
            }
        }

        tracing::info!(
            streams = records.len(),
            claims = accumulator.len(),
            "Claim resolution complete"
        );
        Ok(())
    }
}
