use super::deleter::BulkDeleter;
use crate::error::{SweepError, SweepResult};
use crate::metrics::RunMetrics;
use crate::pool::SharedQueue;
use crate::state::LocalStateStore;
use common::config::PurgeConfig;
use common::model::StreamRecord;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Keys of one failed submission and why they failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeFailure {
    pub keys: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct PurgeOutcome {
    pub confirmed: Vec<String>,
    pub failed: Vec<PurgeFailure>,
}

impl PurgeOutcome {
    pub fn failed_keys(&self) -> usize {
        self.failed.iter().map(|f| f.keys.len()).sum()
    }
}

/// Blobs of one stream still to be deleted.
struct PurgeJob {
    stream_id: i64,
    blobs: Vec<String>,
}

pub struct PurgeExecutor {
    deleter: Arc<dyn BulkDeleter>,
    workers: usize,
    batch_size: usize,
    dry_run: bool,
    metrics: RunMetrics,
}

impl PurgeExecutor {
    pub fn new(
        deleter: Arc<dyn BulkDeleter>,
        workers: usize,
        config: &PurgeConfig,
        metrics: RunMetrics,
    ) -> Self {
        Self {
            deleter,
            workers: workers.max(1),
            batch_size: config.batch_size.clamp(1, common::config::MAX_PURGE_BATCH),
            dry_run: config.dry_run,
            metrics,
        }
    }

    /// Delete the pending blobs of every purge-eligible record.
    ///
    /// Flipping `cancel` to true stops enqueueing further streams; batches
    /// already handed to a worker still complete. Failed batches are
    /// reported in the outcome and do not stop the purge.
    pub async fn purge(
        &self,
        records: &[StreamRecord],
        store: Option<LocalStateStore>,
        cancel: watch::Receiver<bool>,
    ) -> SweepResult<PurgeOutcome> {
        let jobs: Vec<PurgeJob> = records
            .iter()
            .filter(|r| r.is_purge_eligible())
            .map(|r| PurgeJob {
                stream_id: r.stream_id,
                blobs: r.pending_blobs().map(str::to_string).collect(),
            })
            .filter(|job| !job.blobs.is_empty())
            .collect();
        let blobs: usize = jobs.iter().map(|job| job.blobs.len()).sum();

        tracing::info!(
            streams = jobs.len(),
            blobs,
            workers = self.workers,
            batch_size = self.batch_size,
            dry_run = self.dry_run,
            "Starting blob purge"
        );

        let (job_tx, job_rx) = mpsc::channel(self.workers * 2);
        let (success_tx, success_rx) = mpsc::unbounded_channel();
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();

        let enqueuer = tokio::spawn(enqueue(jobs, job_tx, cancel));
        let consumer = tokio::spawn(confirm_deletions(success_rx, store, self.metrics.clone()));

        let queue = SharedQueue::new(job_rx);
        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            let worker = BatchWorker {
                worker_id,
                deleter: Arc::clone(&self.deleter),
                batch_size: self.batch_size,
                dry_run: self.dry_run,
                successes: success_tx.clone(),
                failures: failure_tx.clone(),
            };
            workers.spawn(worker.run(queue.clone()));
        }
        drop(queue);
        drop(success_tx);
        drop(failure_tx);

        let mut worker_error = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Purge worker failed");
                worker_error.get_or_insert(SweepError::from(e));
            }
        }

        let queued = enqueuer.await?;
        let confirmed = consumer.await?;
        let mut failed = Vec::new();
        while let Some(failure) = failure_rx.recv().await {
            failed.push(failure);
        }

        let outcome = PurgeOutcome { confirmed, failed };
        self.metrics.record_purge_failures(outcome.failed_keys());
        tracing::info!(
            queued_streams = queued,
            confirmed = outcome.confirmed.len(),
            failed = outcome.failed_keys(),
            dry_run = self.dry_run,
            "Blob purge complete"
        );

        match worker_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }
}

/// Feed jobs to the workers until done or cancelled. Returns the number of
/// jobs handed over.
async fn enqueue(
    jobs: Vec<PurgeJob>,
    tx: mpsc::Sender<PurgeJob>,
    mut cancel: watch::Receiver<bool>,
) -> usize {
    let total = jobs.len();
    let mut queued = 0;
    for job in jobs {
        if *cancel.borrow() {
            break;
        }
        tokio::select! {
            biased;
            Ok(_) = cancel.wait_for(|cancelled| *cancelled) => break,
            sent = tx.send(job) => {
                if sent.is_err() {
                    break;
                }
                queued += 1;
            }
        }
    }

    if queued < total {
        tracing::warn!(
            queued,
            skipped = total - queued,
            "Purge interrupted, no further streams will be enqueued"
        );
    }
    queued
}

/// Drain confirmed deletions into the cache. Bookkeeping failures are only
/// logged: the blob is already gone.
async fn confirm_deletions(
    mut successes: mpsc::UnboundedReceiver<String>,
    store: Option<LocalStateStore>,
    metrics: RunMetrics,
) -> Vec<String> {
    let mut confirmed = Vec::new();
    while let Some(hash) = successes.recv().await {
        metrics.record_blob_deleted();
        if let Some(store) = &store {
            match store.flag_blob(&hash).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(blob_hash = %hash, "Deleted blob is not cached"),
                Err(e) => {
                    tracing::warn!(blob_hash = %hash, error = %e, "Failed to flag deleted blob")
                }
            }
        }
        confirmed.push(hash);
    }
    confirmed
}

struct BatchWorker {
    worker_id: usize,
    deleter: Arc<dyn BulkDeleter>,
    batch_size: usize,
    dry_run: bool,
    successes: mpsc::UnboundedSender<String>,
    failures: mpsc::UnboundedSender<PurgeFailure>,
}

impl BatchWorker {
    async fn run(self, queue: SharedQueue<PurgeJob>) {
        let mut batch: Vec<String> = Vec::with_capacity(self.batch_size);
        while let Some(job) = queue.next().await {
            tracing::debug!(
                worker_id = self.worker_id,
                stream_id = job.stream_id,
                blobs = job.blobs.len(),
                "Queued stream blobs"
            );
            for blob in job.blobs {
                batch.push(blob);
                if batch.len() == self.batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                    self.submit(full).await;
                }
            }
        }
        if !batch.is_empty() {
            self.submit(batch).await;
        }
    }

    async fn submit(&self, batch: Vec<String>) {
        if self.dry_run {
            tracing::info!(
                worker_id = self.worker_id,
                batch_size = batch.len(),
                first = batch.first().map(String::as_str),
                "[DRY-RUN] Would delete blob batch"
            );
            return;
        }

        match self.deleter.delete_batch(&batch).await {
            Ok(report) => {
                tracing::debug!(
                    worker_id = self.worker_id,
                    deleted = report.deleted.len(),
                    rejected = report.rejected.len(),
                    "Deleted blob batch"
                );
                for hash in report.deleted {
                    let _ = self.successes.send(hash);
                }
                for (key, error) in report.rejected {
                    tracing::warn!(blob_hash = %key, error = %error, "Object store refused blob deletion");
                    let _ = self.failures.send(PurgeFailure {
                        keys: vec![key],
                        error,
                    });
                }
            }
            Err(e) => {
                tracing::error!(
                    worker_id = self.worker_id,
                    batch_size = batch.len(),
                    error = %e,
                    "Bulk delete failed"
                );
                let _ = self.failures.send(PurgeFailure {
                    keys: batch,
                    error: e.to_string(),
                });
            }
        }
    }
}
