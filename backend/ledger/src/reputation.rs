//! Donor reputation bookkeeping.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::Result;
use crate::models::ReputationDelta;

#[async_trait]
pub trait ReputationService: Send + Sync {
    async fn apply(&self, user_id: &str, delta: ReputationDelta) -> Result<()>;
}

/// Upserts into the `user_reputation` table.
pub struct SqliteReputation {
    pool: SqlitePool,
}

impl SqliteReputation {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteReputation { pool }
    }
}

#[async_trait]
impl ReputationService for SqliteReputation {
    async fn apply(&self, user_id: &str, delta: ReputationDelta) -> Result<()> {
        db::increment_reputation(&self.pool, user_id, delta).await
    }
}
