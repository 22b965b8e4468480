//! Local State Store
//!
//! SQLite cache of stream classifications and the blob inventories of
//! invalid streams, so an interrupted sweep can resume without repeating
//! remote lookups.

use crate::error::SweepResult;
use common::model::{BlobInfo, StreamRecord};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, query};
use std::collections::{HashMap, HashSet};

/// Rows written per transaction by the bulk writers.
const WRITE_CHUNK: usize = 5_000;

#[derive(Debug, Clone)]
pub struct LocalStateStore {
    pool: SqlitePool,
}

impl LocalStateStore {
    /// Open (creating if needed) the cache database at `dsn`.
    pub async fn open(dsn: &str) -> SweepResult<Self> {
        tracing::info!(dsn, "Opening local state store");

        let dsn_with_create = if dsn.contains("mode=") {
            dsn.to_string()
        } else if dsn.contains('?') {
            format!("{dsn}&mode=rwc")
        } else {
            format!("{dsn}?mode=rwc")
        };

        let pool = SqlitePool::connect(&dsn_with_create).await.map_err(|e| {
            tracing::error!(dsn = %dsn_with_create, error = %e, "Failed to open local state store");
            e
        })?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Private in-memory store; the single connection keeps the database alive.
    pub async fn in_memory() -> SweepResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init(&self) -> SweepResult<()> {
        query("PRAGMA foreign_keys = ON").execute(&self.pool).await?;

        let create_streams = r#"
        CREATE TABLE IF NOT EXISTS streams (
            stream_id INTEGER PRIMARY KEY,
            sd_hash CHAR(96) NOT NULL UNIQUE,
            exists_in_blockchain BOOLEAN NOT NULL DEFAULT 0,
            expired BOOLEAN NOT NULL DEFAULT 0,
            spent BOOLEAN NOT NULL DEFAULT 0,
            resolved BOOLEAN NOT NULL DEFAULT 0,
            claim_id CHAR(40) NULL
        )"#;
        query(create_streams).execute(&self.pool).await?;

        let create_blobs = r#"
        CREATE TABLE IF NOT EXISTS blobs (
            blob_hash CHAR(96) PRIMARY KEY,
            stream_id INTEGER NOT NULL REFERENCES streams(stream_id),
            blob_id INTEGER NOT NULL,
            deleted BOOLEAN NOT NULL DEFAULT 0
        )"#;
        query(create_blobs).execute(&self.pool).await?;

        query("CREATE INDEX IF NOT EXISTS blobs_stream_id_idx ON blobs (stream_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert streams that are not cached yet. The first write for a stream
    /// id wins, so re-running a sweep never rewrites an earlier
    /// classification. Returns the number of new rows.
    pub async fn upsert_streams(&self, records: &[StreamRecord]) -> SweepResult<u64> {
        let mut inserted = 0;
        for chunk in records.chunks(WRITE_CHUNK) {
            let mut tx = self.pool.begin().await?;
            for record in chunk {
                let claim_id = if record.is_purge_eligible() {
                    record.claim_id.as_deref()
                } else {
                    None
                };
                let result = query(
                    "INSERT OR IGNORE INTO streams \
                     (stream_id, sd_hash, exists_in_blockchain, expired, spent, resolved, claim_id) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(record.stream_id)
                .bind(&record.sd_hash)
                .bind(record.exists)
                .bind(record.expired)
                .bind(record.spent)
                .bind(record.resolved)
                .bind(claim_id)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }
            tx.commit().await?;
        }

        tracing::info!(
            streams = records.len(),
            inserted,
            "Saved stream classifications"
        );
        Ok(inserted)
    }

    pub async fn load_streams(&self) -> SweepResult<Vec<StreamRecord>> {
        let rows = query(
            "SELECT stream_id, sd_hash, exists_in_blockchain, expired, spent, resolved, claim_id \
             FROM streams",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(StreamRecord {
                stream_id: row.try_get("stream_id")?,
                sd_hash: row.try_get("sd_hash")?,
                exists: row.try_get("exists_in_blockchain")?,
                expired: row.try_get("expired")?,
                spent: row.try_get("spent")?,
                resolved: row.try_get("resolved")?,
                claim_id: row.try_get("claim_id")?,
                inventory: None,
            });
        }

        tracing::info!(streams = records.len(), "Loaded cached streams");
        Ok(records)
    }

    /// Ids of cached streams currently classified invalid.
    pub async fn purge_eligible_ids(&self) -> SweepResult<HashSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT stream_id FROM streams WHERE resolved = 1 \
             AND NOT (exists_in_blockchain = 1 AND expired = 0 AND spent = 0)",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Mark a stream live again and drop its cached inventory, atomically.
    pub async fn unflag_stream(&self, stream_id: i64) -> SweepResult<()> {
        let mut tx = self.pool.begin().await?;

        query(
            "UPDATE streams SET exists_in_blockchain = 1, expired = 0, spent = 0, resolved = 1, \
             claim_id = NULL WHERE stream_id = ?",
        )
        .bind(stream_id)
        .execute(&mut *tx)
        .await?;

        let removed = query("DELETE FROM blobs WHERE stream_id = ?")
            .bind(stream_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        tracing::info!(stream_id, removed_blobs = removed, "Unflagged stream");
        Ok(())
    }

    /// Cache the inventories of `records`. Records without an inventory are
    /// skipped and known blobs are left untouched. Returns the number of new rows.
    pub async fn store_blobs(&self, records: &[StreamRecord]) -> SweepResult<u64> {
        let blobs: Vec<(i64, &str, i64)> = records
            .iter()
            .flat_map(|record| {
                record
                    .inventory
                    .iter()
                    .flat_map(|inventory| inventory.iter())
                    .map(move |(hash, info)| (record.stream_id, hash.as_str(), info.blob_id))
            })
            .collect();

        let mut inserted = 0;
        for chunk in blobs.chunks(WRITE_CHUNK) {
            let mut tx = self.pool.begin().await?;
            for (stream_id, blob_hash, blob_id) in chunk {
                let result = query(
                    "INSERT OR IGNORE INTO blobs (blob_hash, stream_id, blob_id, deleted) \
                     VALUES (?, ?, ?, 0)",
                )
                .bind(*blob_hash)
                .bind(*stream_id)
                .bind(*blob_id)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }
            tx.commit().await?;
        }

        tracing::info!(blobs = blobs.len(), inserted, "Saved blob inventories");
        Ok(inserted)
    }

    /// Fill the inventory of every purge-eligible record from the cache,
    /// keeping the deletion flags.
    pub async fn load_blobs(&self, records: &mut [StreamRecord]) -> SweepResult<usize> {
        let rows = query("SELECT stream_id, blob_hash, blob_id, deleted FROM blobs")
            .fetch_all(&self.pool)
            .await?;

        let mut by_stream: HashMap<i64, HashMap<String, BlobInfo>> = HashMap::new();
        for row in rows {
            let stream_id: i64 = row.try_get("stream_id")?;
            let info = BlobInfo {
                blob_id: row.try_get("blob_id")?,
                deleted: row.try_get("deleted")?,
            };
            by_stream
                .entry(stream_id)
                .or_default()
                .insert(row.try_get("blob_hash")?, info);
        }

        let mut loaded = 0;
        for record in records.iter_mut().filter(|r| r.is_purge_eligible()) {
            if let Some(inventory) = by_stream.remove(&record.stream_id) {
                loaded += inventory.len();
                record.inventory = Some(inventory);
            }
        }

        tracing::info!(blobs = loaded, "Loaded cached blob inventories");
        Ok(loaded)
    }

    /// Record a confirmed remote deletion. Returns false for an unknown blob.
    pub async fn flag_blob(&self, blob_hash: &str) -> SweepResult<bool> {
        let result = query("UPDATE blobs SET deleted = 1 WHERE blob_hash = ?")
            .bind(blob_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_blobs(&self, deleted: bool) -> SweepResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blobs WHERE deleted = ?")
            .bind(deleted)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
