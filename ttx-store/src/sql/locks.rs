//! SQLite token lock store
//!
//! `(tx_id, idx)` is the primary key of the lock table, so the database
//! arbitrates concurrent `lock` calls: exactly one insert wins.

use super::{is_unique_violation, to_micros, Database};
use crate::locks::TokenLockStore;
use crate::metrics::Metrics;
use crate::types::{TokenId, TxStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Lock store over a shared [`Database`]
#[derive(Debug, Clone)]
pub struct SqlTokenLockStore {
    db: Database,
    metrics: Metrics,
}

impl SqlTokenLockStore {
    /// Create a store; the schema must already exist
    pub fn new(db: Database, metrics: Metrics) -> Self {
        Self { db, metrics }
    }
}

#[async_trait]
impl TokenLockStore for SqlTokenLockStore {
    async fn lock(&self, token_id: &TokenId, consumer_tx_id: &str) -> Result<()> {
        let index = i64::try_from(token_id.index)
            .map_err(|_| Error::Other(format!("token index out of range: {}", token_id)))?;
        let result = sqlx::query(&format!(
            "INSERT INTO {} (tx_id, idx, consumer_tx_id, created_at) VALUES (?, ?, ?, ?)",
            self.db.tables().token_locks
        ))
        .bind(&token_id.tx_id)
        .bind(index)
        .bind(consumer_tx_id)
        .bind(to_micros(Utc::now()))
        .execute(self.db.pool())
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(token = %token_id, consumer = %consumer_tx_id, "token locked");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                self.metrics.lock_conflicts_total.inc();
                tracing::debug!(token = %token_id, consumer = %consumer_tx_id, "token already locked");
                Err(Error::LockConflict {
                    token: token_id.to_string(),
                    consumer: consumer_tx_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock_by_tx_id(&self, consumer_tx_id: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE consumer_tx_id = ?",
            self.db.tables().token_locks
        ))
        .bind(consumer_tx_id)
        .execute(self.db.pool())
        .await?;
        tracing::debug!(
            consumer = %consumer_tx_id,
            released = result.rows_affected(),
            "unlocked tokens"
        );
        Ok(())
    }

    async fn cleanup(&self, lease_expiry: Duration) -> Result<u64> {
        let lease = i64::try_from(lease_expiry.as_micros()).unwrap_or(i64::MAX);
        let cutoff = to_micros(Utc::now()).saturating_sub(lease);
        let t = self.db.tables();

        let result = sqlx::query(&format!(
            "DELETE FROM {locks} WHERE created_at < ? \
             OR consumer_tx_id IN (SELECT tx_id FROM {requests} WHERE status = ?)",
            locks = t.token_locks,
            requests = t.requests
        ))
        .bind(cutoff)
        .bind(TxStatus::Deleted.code())
        .execute(self.db.pool())
        .await?;

        let removed = result.rows_affected();
        self.metrics.locks_cleaned_total.inc_by(removed);
        tracing::debug!(removed, lease_secs = lease_expiry.as_secs(), "lock cleanup done");
        Ok(removed)
    }

    async fn close(&self) -> Result<()> {
        self.db.close().await;
        Ok(())
    }
}
