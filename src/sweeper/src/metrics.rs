//! Sweep run counters
//!
//! Thread-safe counters shared by every stage, summarized at the end of a run
//! regardless of how the run ended.

use common::model::{StreamRecord, StreamStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe counters for one sweep run
#[derive(Debug, Clone, Default)]
pub struct RunMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    valid: AtomicUsize,
    not_on_chain: AtomicUsize,
    expired: AtomicUsize,
    spent: AtomicUsize,
    false_negatives: AtomicUsize,
    blobs_found: AtomicUsize,
    blobs_deleted: AtomicUsize,
    purge_failures: AtomicUsize,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recount the classification of `records`, replacing earlier counts.
    pub fn record_classification(&self, records: &[StreamRecord]) {
        let (mut valid, mut not_on_chain, mut expired, mut spent) = (0, 0, 0, 0);
        for record in records {
            match record.status() {
                StreamStatus::Valid => valid += 1,
                StreamStatus::NotOnChain => not_on_chain += 1,
                StreamStatus::Expired => expired += 1,
                StreamStatus::Spent => spent += 1,
            }
        }
        self.inner.valid.store(valid, Ordering::Relaxed);
        self.inner.not_on_chain.store(not_on_chain, Ordering::Relaxed);
        self.inner.expired.store(expired, Ordering::Relaxed);
        self.inner.spent.store(spent, Ordering::Relaxed);
    }

    pub fn record_false_negatives(&self, count: usize) {
        self.inner.false_negatives.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_blobs_found(&self, count: usize) {
        self.inner.blobs_found.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_blob_deleted(&self) {
        self.inner.blobs_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_purge_failures(&self, count: usize) {
        self.inner.purge_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn blobs_deleted(&self) -> usize {
        self.inner.blobs_deleted.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            valid: self.inner.valid.load(Ordering::Relaxed),
            not_on_chain: self.inner.not_on_chain.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
            spent: self.inner.spent.load(Ordering::Relaxed),
            false_negatives: self.inner.false_negatives.load(Ordering::Relaxed),
            blobs_found: self.inner.blobs_found.load(Ordering::Relaxed),
            blobs_deleted: self.inner.blobs_deleted.load(Ordering::Relaxed),
            purge_failures: self.inner.purge_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the run counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub valid: usize,
    pub not_on_chain: usize,
    pub expired: usize,
    pub spent: usize,
    pub false_negatives: usize,
    pub blobs_found: usize,
    pub blobs_deleted: usize,
    pub purge_failures: usize,
}

impl RunSummary {
    pub fn total_streams(&self) -> usize {
        self.valid + self.not_on_chain + self.expired + self.spent
    }

    pub fn invalid_streams(&self) -> usize {
        self.not_on_chain + self.expired + self.spent
    }

    /// Share of classified streams that are invalid, in percent.
    pub fn invalid_ratio(&self) -> f64 {
        match self.total_streams() {
            0 => 0.0,
            total => self.invalid_streams() as f64 / total as f64 * 100.0,
        }
    }

    pub fn log(&self) {
        tracing::info!(
            valid = self.valid,
            not_on_chain = self.not_on_chain,
            expired = self.expired,
            spent = self.spent,
            false_negatives = self.false_negatives,
            blobs_found = self.blobs_found,
            blobs_deleted = self.blobs_deleted,
            purge_failures = self.purge_failures,
            "Sweep summary: {} valid, {} invalid ({:.3}% invalid)",
            self.valid,
            self.invalid_streams(),
            self.invalid_ratio()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::BidState;

    fn classified(id: i64, state: Option<BidState>) -> StreamRecord {
        let mut record = StreamRecord::new(id, format!("{id:02x}"));
        record.apply_classification(state, None);
        record
    }

    #[test]
    fn test_classification_counts_sum_to_total() {
        let metrics = RunMetrics::new();
        let records = vec![
            classified(1, Some(BidState::Exists)),
            classified(2, Some(BidState::Expired)),
            classified(3, Some(BidState::Spent)),
            classified(4, None),
            classified(5, None),
        ];

        metrics.record_classification(&records);
        let summary = metrics.summary();

        assert_eq!(summary.valid, 1);
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.spent, 1);
        assert_eq!(summary.not_on_chain, 2);
        assert_eq!(summary.total_streams(), records.len());
        assert!((summary.invalid_ratio() - 80.0).abs() < 0.001);
    }

    #[test]
    fn test_reclassification_replaces_counts() {
        let metrics = RunMetrics::new();
        let mut records = vec![classified(1, Some(BidState::Spent))];
        metrics.record_classification(&records);

        records[0].mark_live();
        metrics.record_classification(&records);

        let summary = metrics.summary();
        assert_eq!(summary.spent, 0);
        assert_eq!(summary.valid, 1);
    }

    #[test]
    fn test_empty_summary() {
        let summary = RunMetrics::new().summary();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(summary.invalid_ratio(), 0.0);
    }

    #[test]
    fn test_metrics_thread_safety() {
        use std::thread;

        let metrics = RunMetrics::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..125 {
                        metrics.record_blob_deleted();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.blobs_deleted(), 1000);
    }
}
