//! Stream Index Reader
//!
//! Enumerates every stream of the reflector database by splitting the id
//! space into fixed-size windows and fetching them on a worker pool.

use crate::error::{SweepError, SweepResult};
use crate::pool::drain_queue;
use crate::reflector::{IdWindow, StreamSource};
use common::config::ReaderConfig;
use common::model::StreamRecord;
use dashmap::DashMap;
use std::sync::Arc;

/// Split `[0, max]` into contiguous inclusive windows of `size` ids.
///
/// The last window is truncated at `max`. A non-positive `max` yields no
/// windows: stream ids start at 1, so a max id of 0 is the empty table and
/// not the one-id range `[0, 0]`.
pub fn partition_windows(max: i64, size: i64) -> Vec<IdWindow> {
    let size = size.max(1);
    let mut windows = Vec::new();
    if max <= 0 {
        return windows;
    }

    let mut start = 0;
    while start <= max {
        let end = start.saturating_add(size - 1).min(max);
        windows.push(IdWindow { start, end });
        start = end + 1;
    }
    windows
}

/// Runs of consecutive empty windows at least `threshold` long, as
/// (first window index, run length).
pub fn stalled_runs(counts: &[usize], threshold: usize) -> Vec<(usize, usize)> {
    let threshold = threshold.max(1);
    let mut runs = Vec::new();
    let mut run_start = None;

    for (index, count) in counts.iter().enumerate() {
        match (*count == 0, run_start) {
            (true, None) => run_start = Some(index),
            (false, Some(start)) => {
                if index - start >= threshold {
                    runs.push((start, index - start));
                }
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        if counts.len() - start >= threshold {
            runs.push((start, counts.len() - start));
        }
    }
    runs
}

pub struct StreamIndexReader {
    source: Arc<dyn StreamSource>,
    workers: usize,
    config: ReaderConfig,
}

impl StreamIndexReader {
    pub fn new(source: Arc<dyn StreamSource>, workers: usize, config: ReaderConfig) -> Self {
        Self {
            source,
            workers,
            config,
        }
    }

    /// Fetch all streams with an id up to `limit`.
    ///
    /// `limit` bounds the id range, not the number of rows: deleted ids
    /// leave gaps, so fewer streams than `limit` can come back. Any failed
    /// window aborts the whole enumeration.
    pub async fn read_streams(&self, limit: i64) -> SweepResult<Vec<StreamRecord>> {
        let mut max_id = self.source.max_stream_id().await?;
        tracing::info!(max_id, "Most recent stream id");

        if max_id > limit {
            tracing::warn!(
                max_id,
                limit,
                "Most recent stream id is above the limit, clipping the id range to the limit"
            );
            max_id = limit;
        }

        let windows = partition_windows(max_id, self.config.window_size);
        if windows.is_empty() {
            tracing::info!("No streams to enumerate");
            return Ok(Vec::new());
        }

        tracing::info!(
            windows = windows.len(),
            window_size = self.config.window_size,
            workers = self.workers,
            "Enumerating streams"
        );

        let results: Arc<DashMap<usize, Vec<(i64, String)>>> = Arc::new(DashMap::new());
        let sink = Arc::clone(&results);
        let source = Arc::clone(&self.source);
        let jobs: Vec<(usize, IdWindow)> = windows.iter().copied().enumerate().collect();

        drain_queue(self.workers, jobs, move |worker_id, (index, window)| {
            let sink = Arc::clone(&sink);
            let source = Arc::clone(&source);
            async move {
                let streams = source.streams_in_window(window).await?;
                tracing::debug!(
                    worker_id,
                    start = window.start,
                    end = window.end,
                    streams = streams.len(),
                    "Fetched stream window"
                );
                sink.insert(index, streams);
                Ok(())
            }
        })
        .await?;

        let counts: Vec<usize> = (0..windows.len())
            .map(|index| results.get(&index).map_or(0, |rows| rows.len()))
            .collect();

        if counts.iter().all(|count| *count == 0) {
            return Err(SweepError::EnumerationStalled {
                windows: windows.len(),
                max_id,
            });
        }
        for (first, length) in stalled_runs(&counts, self.config.stalled_window_warning) {
            tracing::warn!(
                start = windows[first].start,
                end = windows[first + length - 1].end,
                windows = length,
                "No streams found in a long run of consecutive windows"
            );
        }

        let records: Vec<StreamRecord> = (0..windows.len())
            .filter_map(|index| results.remove(&index))
            .flat_map(|(_, rows)| rows)
            .map(|(stream_id, sd_hash)| StreamRecord::new(stream_id, sd_hash))
            .collect();

        tracing::info!(
            streams = records.len(),
            max_id,
            "Stream enumeration complete"
        );
        Ok(records)
    }
}
