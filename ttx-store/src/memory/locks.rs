//! In-process token lock store

use super::{LockRow, MemoryDatabase};
use crate::locks::TokenLockStore;
use crate::metrics::Metrics;
use crate::types::{TokenId, TxStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::hash_map::Entry;
use std::time::Duration;

/// Lock store sharing tables with a [`MemoryTransactionStore`](super::MemoryTransactionStore)
#[derive(Debug, Clone)]
pub struct MemoryTokenLockStore {
    db: MemoryDatabase,
    metrics: Metrics,
}

impl MemoryTokenLockStore {
    /// Create a store over `db`
    pub fn new(db: MemoryDatabase, metrics: Metrics) -> Self {
        Self { db, metrics }
    }
}

#[async_trait]
impl TokenLockStore for MemoryTokenLockStore {
    async fn lock(&self, token_id: &TokenId, consumer_tx_id: &str) -> Result<()> {
        let mut tables = self.db.tables().write();
        match tables.locks.entry(token_id.clone()) {
            Entry::Occupied(_) => {
                self.metrics.lock_conflicts_total.inc();
                tracing::debug!(token = %token_id, consumer = %consumer_tx_id, "token already locked");
                Err(Error::LockConflict {
                    token: token_id.to_string(),
                    consumer: consumer_tx_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(LockRow {
                    consumer_tx_id: consumer_tx_id.to_string(),
                    created_at: Utc::now(),
                });
                tracing::debug!(token = %token_id, consumer = %consumer_tx_id, "token locked");
                Ok(())
            }
        }
    }

    async fn unlock_by_tx_id(&self, consumer_tx_id: &str) -> Result<()> {
        let mut tables = self.db.tables().write();
        let before = tables.locks.len();
        tables.locks.retain(|_, l| l.consumer_tx_id != consumer_tx_id);
        tracing::debug!(
            consumer = %consumer_tx_id,
            released = before - tables.locks.len(),
            "unlocked tokens"
        );
        Ok(())
    }

    async fn cleanup(&self, lease_expiry: Duration) -> Result<u64> {
        let cutoff = chrono::Duration::from_std(lease_expiry)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut guard = self.db.tables().write();
        let tables = &mut *guard;
        let requests = &tables.requests;
        let before = tables.locks.len();
        tables.locks.retain(|_, l| {
            let expired = l.created_at < cutoff;
            let abandoned = requests
                .get(&l.consumer_tx_id)
                .map_or(false, |r| r.status == TxStatus::Deleted);
            !(expired || abandoned)
        });

        let removed = (before - tables.locks.len()) as u64;
        self.metrics.locks_cleaned_total.inc_by(removed);
        tracing::debug!(removed, lease_secs = lease_expiry.as_secs(), "lock cleanup done");
        Ok(removed)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
