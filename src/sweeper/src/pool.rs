//! Bounded worker pools draining a shared job queue.
//!
//! A producer task feeds a bounded channel; workers pull from the same
//! receiver until the producer drops its sender. Queue closure is the only
//! termination signal.

use crate::error::{SweepError, SweepResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

/// Receiving half of a job queue shared by several workers.
pub struct SharedQueue<J> {
    rx: Arc<Mutex<mpsc::Receiver<J>>>,
}

impl<J> Clone for SharedQueue<J> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<J> SharedQueue<J> {
    pub fn new(rx: mpsc::Receiver<J>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next job, or `None` once the sender is gone and the queue is empty.
    pub async fn next(&self) -> Option<J> {
        self.rx.lock().await.recv().await
    }
}

/// Run `handler` over every job with `workers` concurrent workers.
///
/// The first failing job aborts the remaining workers and is returned; jobs
/// already in flight on other workers are cancelled at their next await.
pub async fn drain_queue<J, F, Fut>(workers: usize, jobs: Vec<J>, handler: F) -> SweepResult<()>
where
    J: Send + 'static,
    F: Fn(usize, J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SweepResult<()>> + Send + 'static,
{
    let workers = workers.max(1);
    let (tx, rx) = mpsc::channel(workers);
    let queue = SharedQueue::new(rx);
    let handler = Arc::new(handler);
    let mut tasks: JoinSet<SweepResult<()>> = JoinSet::new();

    tasks.spawn(async move {
        for job in jobs {
            if tx.send(job).await.is_err() {
                // every worker has exited
                break;
            }
        }
        Ok::<(), SweepError>(())
    });

    for worker_id in 0..workers {
        let queue = queue.clone();
        let handler = Arc::clone(&handler);
        tasks.spawn(async move {
            while let Some(job) = queue.next().await {
                handler(worker_id, job).await?;
            }
            Ok::<(), SweepError>(())
        });
    }
    drop(queue);

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(SweepError::from).and_then(|result| result);
        if let Err(e) = outcome {
            tasks.abort_all();
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_every_job_processed_exactly_once() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        drain_queue(4, (0..500).collect(), move |_, job: u32| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(job);
                Ok::<(), SweepError>(())
            }
        })
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 500);
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 500);
    }

    #[tokio::test]
    async fn test_empty_job_list_completes() {
        drain_queue(3, Vec::<u8>::new(), |_, _| async { Ok::<(), SweepError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_error_is_fatal() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);

        let result = drain_queue(2, (0..100).collect(), move |_, job: u32| {
            let counter = Arc::clone(&counter);
            async move {
                if job == 10 {
                    return Err(SweepError::Unavailable("window 10".to_string()));
                }
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(SweepError::Unavailable(_))));
        assert!(processed.load(Ordering::Relaxed) < 100);
    }

    #[tokio::test]
    async fn test_zero_workers_still_runs_one() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);

        drain_queue(0, vec![1, 2, 3], move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok::<(), SweepError>(())
            }
        })
        .await
        .unwrap();

        assert_eq!(processed.load(Ordering::Relaxed), 3);
    }
}
