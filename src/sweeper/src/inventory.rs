//! Blob Inventory Fetcher
//!
//! Expands invalid streams into the blobs they reference.

use crate::error::SweepResult;
use crate::pool::drain_queue;
use crate::reflector::{StreamBlob, StreamSource};
use common::model::{BlobInfo, StreamRecord};
use dashmap::DashMap;
use std::sync::Arc;

pub struct InventoryFetcher {
    source: Arc<dyn StreamSource>,
    workers: usize,
}

impl InventoryFetcher {
    pub fn new(source: Arc<dyn StreamSource>, workers: usize) -> Self {
        Self { source, workers }
    }

    /// Populate the inventory of every purge-eligible record that does not
    /// have one yet. Returns the number of blobs found.
    ///
    /// A stream without blobs keeps `inventory = None`. Any failed lookup
    /// aborts the fetch and leaves every record untouched.
    pub async fn fetch(&self, records: &mut [StreamRecord]) -> SweepResult<usize> {
        let stream_ids: Vec<i64> = records
            .iter()
            .filter(|r| r.is_purge_eligible() && r.inventory.is_none())
            .map(|r| r.stream_id)
            .collect();

        tracing::info!(
            streams = stream_ids.len(),
            workers = self.workers,
            "Fetching blob inventories"
        );

        let found: Arc<DashMap<i64, Vec<StreamBlob>>> = Arc::new(DashMap::new());
        let sink = Arc::clone(&found);
        let source = Arc::clone(&self.source);

        drain_queue(self.workers, stream_ids, move |worker_id, stream_id| {
            let sink = Arc::clone(&sink);
            let source = Arc::clone(&source);
            async move {
                let blobs = source.blobs_for_stream(stream_id).await?;
                tracing::debug!(worker_id, stream_id, blobs = blobs.len(), "Fetched stream blobs");
                if !blobs.is_empty() {
                    sink.insert(stream_id, blobs);
                }
                Ok(())
            }
        })
        .await?;

        let mut total = 0;
        for record in records.iter_mut() {
            if let Some((_, blobs)) = found.remove(&record.stream_id) {
                total += blobs.len();
                record.inventory = Some(
                    blobs
                        .into_iter()
                        .map(|(hash, blob_id)| (hash, BlobInfo::new(blob_id)))
                        .collect(),
                );
            }
        }

        tracing::info!(blobs = total, "Blob inventory fetch complete");
        Ok(total)
    }
}
