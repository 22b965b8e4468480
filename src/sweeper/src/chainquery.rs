//! Claim index (chainquery) access.

use crate::error::SweepResult;
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder, Row};

/// One claim row matched by sd hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRow {
    pub sd_hash: String,
    /// Raw bid state, e.g. `Active`, `Controlling`, `Expired`, `Spent`.
    pub bid_state: String,
    pub claim_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClaimIndex: Send + Sync {
    /// Claims whose sd hash is in `sd_hashes`. Hashes without a claim are
    /// simply absent from the result.
    async fn bid_states(&self, sd_hashes: &[String]) -> SweepResult<Vec<ClaimRow>>;
}

#[derive(Debug, Clone)]
pub struct ChainqueryDb {
    pool: MySqlPool,
}

impl ChainqueryDb {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Pool that connects on first use, so runs that never query the
    /// claim index do not need it to be reachable.
    pub fn connect_lazy(dsn: &str) -> SweepResult<Self> {
        let pool = MySqlPoolOptions::new().connect_lazy(dsn)?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl ClaimIndex for ChainqueryDb {
    async fn bid_states(&self, sd_hashes: &[String]) -> SweepResult<Vec<ClaimRow>> {
        if sd_hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<MySql> =
            QueryBuilder::new("SELECT sd_hash, bid_state, claim_id FROM claim WHERE sd_hash IN (");
        let mut separated = query.separated(", ");
        for hash in sd_hashes {
            separated.push_bind(hash.as_str());
        }
        separated.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> SweepResult<ClaimRow> {
                Ok(ClaimRow {
                    sd_hash: row.try_get("sd_hash")?,
                    bid_state: row.try_get("bid_state")?,
                    claim_id: row.try_get("claim_id")?,
                })
            })
            .collect()
    }
}
