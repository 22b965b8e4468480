//! Sweep orchestration: enumerate, classify, verify, cache, expand and purge.

use crate::chainquery::ClaimIndex;
use crate::error::{SweepError, SweepResult};
use crate::inventory::InventoryFetcher;
use crate::metrics::RunMetrics;
use crate::purge::{BulkDeleter, PurgeExecutor, PurgeOutcome};
use crate::reader::StreamIndexReader;
use crate::reflector::{ReflectorDb, StreamSource};
use crate::resolver::{ClaimChecks, ClaimResolver};
use crate::state::LocalStateStore;
use crate::verifier::{ChainVerifier, ClaimLookup};
use common::Configuration;
use common::model::StreamRecord;
use std::sync::Arc;
use tokio::sync::watch;

/// External collaborators of a sweep.
pub struct SweepClients {
    pub source: Arc<dyn StreamSource>,
    pub claims: Arc<dyn ClaimIndex>,
    pub lookup: Arc<dyn ClaimLookup>,
    pub deleter: Arc<dyn BulkDeleter>,
    pub store: LocalStateStore,
}

/// Stages to run.
#[derive(Debug, Clone, Default)]
pub struct SweepPlan {
    /// Start from the local cache instead of the reflector and claim index.
    pub load_cache: bool,
    /// Re-check spent claims against the chain hub.
    pub double_check: bool,
    /// Persist classifications and inventories to the local cache.
    pub save: bool,
    /// Expand invalid streams into their blobs.
    pub resolve_blobs: bool,
    /// Delete the blobs of invalid streams.
    pub wipe: bool,
    pub checks: ClaimChecks,
    /// Approximate upper bound on stream ids to enumerate.
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub records: Vec<StreamRecord>,
    pub purge: Option<PurgeOutcome>,
}

pub struct Sweeper {
    reader: StreamIndexReader,
    resolver: ClaimResolver,
    verifier: ChainVerifier,
    inventory: InventoryFetcher,
    purger: PurgeExecutor,
    store: LocalStateStore,
    metrics: RunMetrics,
}

impl Sweeper {
    pub fn new(clients: SweepClients, config: &Configuration) -> Self {
        let workers = config.worker_count();
        let metrics = RunMetrics::new();
        Self {
            reader: StreamIndexReader::new(
                Arc::clone(&clients.source),
                workers,
                config.reader.clone(),
            ),
            resolver: ClaimResolver::new(clients.claims, workers, config.resolver.batch_size),
            verifier: ChainVerifier::new(clients.lookup),
            inventory: InventoryFetcher::new(clients.source, workers),
            purger: PurgeExecutor::new(
                clients.deleter,
                config.purge_worker_count(),
                &config.purge,
                metrics.clone(),
            ),
            store: clients.store,
            metrics,
        }
    }

    /// Counters of this sweep, valid even after `run` failed.
    pub fn metrics(&self) -> RunMetrics {
        self.metrics.clone()
    }

    /// Run the planned stages.
    ///
    /// `imported` replaces enumeration with a previously exported record
    /// set. Records that are not resolved yet are classified before anything
    /// else happens to them.
    pub async fn run(
        &self,
        plan: &SweepPlan,
        imported: Option<Vec<StreamRecord>>,
        cancel: watch::Receiver<bool>,
    ) -> SweepResult<SweepReport> {
        let mut records = match imported {
            Some(records) => records,
            None if plan.load_cache => {
                let mut records = self.store.load_streams().await?;
                self.store.load_blobs(&mut records).await?;
                records
            }
            None => self.reader.read_streams(plan.limit).await?,
        };

        records.sort_by_key(|r| r.resolved);
        let unresolved = records.iter().take_while(|r| !r.resolved).count();
        if unresolved > 0 {
            self.resolver
                .resolve(&mut records[..unresolved], plan.checks)
                .await?;
        }
        self.metrics.record_classification(&records);
        self.metrics.summary().log();

        if plan.double_check {
            let corrected = self
                .verifier
                .double_check(&mut records, Some(&self.store))
                .await?;
            self.metrics.record_false_negatives(corrected);
            self.metrics.record_classification(&records);
        }

        let reconciled = self.reconcile_cache(&records).await?;
        self.metrics.record_false_negatives(reconciled);

        if plan.save {
            self.store.upsert_streams(&records).await?;
        }

        if plan.resolve_blobs {
            self.inventory.fetch(&mut records).await?;
            if plan.save {
                self.store.store_blobs(&records).await?;
            }
        }

        let blobs_found: usize = records
            .iter()
            .filter(|r| r.is_purge_eligible())
            .map(StreamRecord::blob_count)
            .sum();
        self.metrics.record_blobs_found(blobs_found);

        let purge = if plan.wipe {
            if blobs_found == 0 {
                tracing::warn!("No blob inventories available, nothing to purge");
            }
            let outcome = self
                .purger
                .purge(&records, Some(self.store.clone()), cancel)
                .await?;
            Some(outcome)
        } else {
            None
        };

        Ok(SweepReport { records, purge })
    }

    /// Unflag cached streams that this run classified valid. Saving is
    /// first-write-wins, so without this a stale invalid row and its blobs
    /// would stay purgeable from the cache.
    async fn reconcile_cache(&self, records: &[StreamRecord]) -> SweepResult<usize> {
        let cached = self.store.purge_eligible_ids().await?;
        if cached.is_empty() {
            return Ok(0);
        }

        let mut corrected = 0;
        let revived = records
            .iter()
            .filter(|r| r.resolved && r.is_valid() && cached.contains(&r.stream_id));
        for record in revived {
            tracing::warn!(
                stream_id = record.stream_id,
                sd_hash = %record.sd_hash,
                "Cached invalid stream is live again"
            );
            self.store.unflag_stream(record.stream_id).await?;
            corrected += 1;
        }
        Ok(corrected)
    }

    /// Remove the reflector metadata of every cached stream whose blobs are
    /// all confirmed deleted. Returns the number of streams removed.
    pub async fn prune_metadata(&self, reflector: &ReflectorDb) -> SweepResult<usize> {
        let mut records = self.store.load_streams().await?;
        self.store.load_blobs(&mut records).await?;

        let mut removed = 0;
        let purged = records
            .iter()
            .filter(|r| r.inventory.is_some() && r.pending_blobs().next().is_none());
        for record in purged {
            match reflector.delete_stream_metadata(record).await {
                Ok(()) => removed += 1,
                Err(SweepError::UnsafeRemoval { stream_id, reason }) => {
                    tracing::warn!(stream_id, reason = %reason, "Keeping stream metadata");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(removed, "Stream metadata pruning complete");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryClaimIndex, InMemoryStreamSource, RecordingDeleter, StaticLookup};

    fn config() -> Configuration {
        let mut config = Configuration::default();
        config.workers = Some(2);
        config.reader.window_size = 2;
        config.purge.dry_run = false;
        config
    }

    async fn clients(lookup: StaticLookup) -> (SweepClients, Arc<RecordingDeleter>) {
        let source = InMemoryStreamSource::new();
        source.add_stream(1, "sd-live", &[("l1", 10)]);
        source.add_stream(2, "sd-spent", &[("s1", 20), ("s2", 21)]);
        source.add_stream(3, "sd-gone", &[("g1", 30)]);

        let claims = InMemoryClaimIndex::new();
        claims.insert("sd-live", "Controlling", "c-live");
        claims.insert("sd-spent", "Spent", "c-spent");

        let deleter = Arc::new(RecordingDeleter::new());
        let clients = SweepClients {
            source: Arc::new(source),
            claims: Arc::new(claims),
            lookup: Arc::new(lookup),
            deleter: deleter.clone(),
            store: LocalStateStore::in_memory().await.unwrap(),
        };
        (clients, deleter)
    }

    fn full_plan() -> SweepPlan {
        SweepPlan {
            double_check: true,
            save: true,
            resolve_blobs: true,
            wipe: true,
            limit: 1_000,
            ..SweepPlan::default()
        }
    }

    fn sorted(mut keys: Vec<String>) -> Vec<String> {
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_full_sweep_purges_invalid_streams() {
        let (clients, deleter) = clients(StaticLookup::new([])).await;
        let store = clients.store.clone();
        let sweeper = Sweeper::new(clients, &config());

        let report = sweeper
            .run(&full_plan(), None, watch::channel(false).1)
            .await
            .unwrap();

        assert_eq!(report.records.len(), 3);
        assert_eq!(sorted(deleter.deleted_keys()), vec!["g1", "s1", "s2"]);
        assert_eq!(store.count_blobs(true).await.unwrap(), 3);

        let summary = sweeper.metrics().summary();
        assert_eq!(summary.valid, 1);
        assert_eq!(summary.spent, 1);
        assert_eq!(summary.not_on_chain, 1);
        assert_eq!(summary.blobs_found, 3);
        assert_eq!(summary.blobs_deleted, 3);
    }

    #[tokio::test]
    async fn test_false_negative_is_never_purged() {
        let (clients, deleter) = clients(StaticLookup::new(["c-spent"])).await;
        let store = clients.store.clone();
        let sweeper = Sweeper::new(clients, &config());

        sweeper
            .run(&full_plan(), None, watch::channel(false).1)
            .await
            .unwrap();

        assert_eq!(deleter.deleted_keys(), vec!["g1"]);
        let cached = store.load_streams().await.unwrap();
        let corrected = cached.iter().find(|r| r.stream_id == 2).unwrap();
        assert!(corrected.is_valid());
        assert_eq!(sweeper.metrics().summary().false_negatives, 1);
    }

    #[tokio::test]
    async fn test_resume_from_cache_skips_deleted_blobs() {
        let (clients, _) = clients(StaticLookup::new([])).await;
        let store = clients.store.clone();
        let first = Sweeper::new(clients, &config());
        let plan = SweepPlan {
            wipe: false,
            ..full_plan()
        };
        first.run(&plan, None, watch::channel(false).1).await.unwrap();
        store.flag_blob("s1").await.unwrap();

        let (mut clients, deleter) = clients_with_store(store).await;
        clients.source = Arc::new(InMemoryStreamSource::new());
        let resumed = Sweeper::new(clients, &config());
        let plan = SweepPlan {
            load_cache: true,
            wipe: true,
            limit: 1_000,
            ..SweepPlan::default()
        };
        resumed.run(&plan, None, watch::channel(false).1).await.unwrap();

        assert_eq!(sorted(deleter.deleted_keys()), vec!["g1", "s2"]);
    }

    async fn clients_with_store(store: LocalStateStore) -> (SweepClients, Arc<RecordingDeleter>) {
        let (mut clients, deleter) = clients(StaticLookup::new([])).await;
        clients.store = store;
        (clients, deleter)
    }

    #[tokio::test]
    async fn test_live_again_stream_is_unflagged_in_cache() {
        let (clients, _) = clients(StaticLookup::new([])).await;
        let store = clients.store.clone();
        let plan = SweepPlan {
            double_check: false,
            wipe: false,
            ..full_plan()
        };
        Sweeper::new(clients, &config())
            .run(&plan, None, watch::channel(false).1)
            .await
            .unwrap();
        assert!(store.purge_eligible_ids().await.unwrap().contains(&2));

        let (mut clients, _) = clients_with_store(store.clone()).await;
        let claims = InMemoryClaimIndex::new();
        claims.insert("sd-live", "Controlling", "c-live");
        claims.insert("sd-spent", "Controlling", "c-spent");
        clients.claims = Arc::new(claims);
        let second = Sweeper::new(clients, &config());
        second.run(&plan, None, watch::channel(false).1).await.unwrap();

        assert_eq!(second.metrics().summary().false_negatives, 1);
        let cached = store.load_streams().await.unwrap();
        assert!(cached.iter().find(|r| r.stream_id == 2).unwrap().is_valid());

        let (clients, deleter) = clients_with_store(store).await;
        let resumed = SweepPlan {
            load_cache: true,
            wipe: true,
            limit: 1_000,
            ..SweepPlan::default()
        };
        Sweeper::new(clients, &config())
            .run(&resumed, None, watch::channel(false).1)
            .await
            .unwrap();

        assert_eq!(deleter.deleted_keys(), vec!["g1"]);
    }

    #[tokio::test]
    async fn test_unreachable_hub_keeps_spent_streams_purgeable() {
        let (clients, deleter) = clients(StaticLookup::unreachable()).await;
        let sweeper = Sweeper::new(clients, &config());

        sweeper
            .run(&full_plan(), None, watch::channel(false).1)
            .await
            .unwrap();

        assert_eq!(sorted(deleter.deleted_keys()), vec!["g1", "s1", "s2"]);
        assert_eq!(sweeper.metrics().summary().false_negatives, 0);
    }

    #[tokio::test]
    async fn test_dry_run_keeps_every_blob() {
        let (clients, deleter) = clients(StaticLookup::new([])).await;
        let mut config = config();
        config.purge.dry_run = true;
        let sweeper = Sweeper::new(clients, &config);

        let report = sweeper
            .run(&full_plan(), None, watch::channel(false).1)
            .await
            .unwrap();

        assert!(deleter.calls().is_empty());
        assert!(report.purge.unwrap().confirmed.is_empty());
    }
}
