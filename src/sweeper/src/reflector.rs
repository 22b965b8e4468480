//! Reflector metadata database access.
//!
//! Read-only enumeration of streams and their blobs, plus the destructive
//! cleanup transaction used once every blob of a stream is gone from the
//! object store.

use crate::error::{SweepError, SweepResult};
use async_trait::async_trait;
use common::model::StreamRecord;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder, Row};

/// Inclusive range of stream ids fetched by one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdWindow {
    pub start: i64,
    pub end: i64,
}

impl IdWindow {
    pub fn contains(&self, id: i64) -> bool {
        self.start <= id && id <= self.end
    }

    pub fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// (blob_hash, blob_id) of one data blob referenced by a stream.
pub type StreamBlob = (String, i64);

/// Source of stream and blob metadata.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Highest assigned stream id, 0 for an empty table.
    async fn max_stream_id(&self) -> SweepResult<i64>;

    /// (stream_id, sd_hash) of every stream whose id falls in `window`.
    async fn streams_in_window(&self, window: IdWindow) -> SweepResult<Vec<(i64, String)>>;

    /// Blobs associated with one stream.
    async fn blobs_for_stream(&self, stream_id: i64) -> SweepResult<Vec<StreamBlob>>;
}

/// MySQL client for the reflector database.
#[derive(Debug, Clone)]
pub struct ReflectorDb {
    pool: MySqlPool,
}

impl ReflectorDb {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Pool that connects on first use, so runs that never query the
    /// reflector do not need it to be reachable.
    pub fn connect_lazy(dsn: &str) -> SweepResult<Self> {
        let pool = MySqlPoolOptions::new().connect_lazy(dsn)?;
        Ok(Self::new(pool))
    }

    /// Remove the metadata of a purged stream: its data blob rows, the stream
    /// row and finally the sd blob row, in one transaction.
    ///
    /// Only streams that are purge-eligible and whose every blob has been
    /// confirmed deleted from the object store are accepted.
    pub async fn delete_stream_metadata(&self, record: &StreamRecord) -> SweepResult<()> {
        let blob_ids = removable_blob_ids(record)?;

        let mut tx = self.pool.begin().await?;

        if !blob_ids.is_empty() {
            let mut delete_blobs: QueryBuilder<MySql> =
                QueryBuilder::new("DELETE FROM blob_ WHERE id IN (");
            let mut separated = delete_blobs.separated(", ");
            for id in &blob_ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            delete_blobs.build().execute(&mut *tx).await?;
        }

        sqlx::query("DELETE FROM stream WHERE id = ?")
            .bind(record.stream_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM blob_ WHERE hash = ?")
            .bind(&record.sd_hash)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            stream_id = record.stream_id,
            sd_hash = %record.sd_hash,
            blobs = blob_ids.len(),
            "Removed stream metadata"
        );
        Ok(())
    }
}

/// Blob row ids to drop with a stream, or why the stream must be kept.
fn removable_blob_ids(record: &StreamRecord) -> SweepResult<Vec<i64>> {
    let refuse = |reason: &str| SweepError::UnsafeRemoval {
        stream_id: record.stream_id,
        reason: reason.to_string(),
    };

    if !record.resolved {
        return Err(refuse("stream was never classified"));
    }
    if record.is_valid() {
        return Err(refuse("stream is still valid"));
    }

    let Some(inventory) = record.inventory.as_ref() else {
        return Ok(Vec::new());
    };
    if let Some((hash, _)) = inventory.iter().find(|(_, info)| !info.deleted) {
        return Err(refuse(&format!("blob {hash} is not deleted yet")));
    }
    Ok(inventory.values().map(|info| info.blob_id).collect())
}

#[async_trait]
impl StreamSource for ReflectorDb {
    async fn max_stream_id(&self) -> SweepResult<i64> {
        let max: i64 = sqlx::query_scalar("SELECT CAST(COALESCE(MAX(id), 0) AS SIGNED) FROM stream")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    async fn streams_in_window(&self, window: IdWindow) -> SweepResult<Vec<(i64, String)>> {
        let rows = sqlx::query(
            "SELECT CAST(s.id AS SIGNED) AS id, b.hash AS hash \
             FROM stream s INNER JOIN blob_ b ON s.sd_blob_id = b.id \
             WHERE s.id BETWEEN ? AND ?",
        )
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> SweepResult<(i64, String)> {
                Ok((row.try_get("id")?, row.try_get("hash")?))
            })
            .collect()
    }

    async fn blobs_for_stream(&self, stream_id: i64) -> SweepResult<Vec<StreamBlob>> {
        let rows = sqlx::query(
            "SELECT b.hash AS hash, CAST(b.id AS SIGNED) AS id \
             FROM blob_ b INNER JOIN stream_blob sb ON b.id = sb.blob_id \
             WHERE sb.stream_id = ?",
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> SweepResult<StreamBlob> {
                Ok((row.try_get("hash")?, row.try_get("id")?))
            })
            .collect()
    }
}
