//! Token reservation locks
//!
//! A lock row is the only authority for "this token is being spent". Locks are
//! never overwritten: a second [`TokenLockStore::lock`] on the same token fails
//! with [`Error::LockConflict`](crate::Error::LockConflict) until the holder
//! releases it or the lock is cleaned up.
//!
//! Cleanup removes a lock when either
//! - it is older than the lease, or
//! - the request of the consumer transaction is `Deleted`.

use crate::types::TokenId;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Lock table operations
#[async_trait]
pub trait TokenLockStore: Send + Sync {
    /// Reserve `token_id` for `consumer_tx_id`; fails if anyone holds it already
    async fn lock(&self, token_id: &TokenId, consumer_tx_id: &str) -> Result<()>;

    /// Release every lock held by `consumer_tx_id`
    async fn unlock_by_tx_id(&self, consumer_tx_id: &str) -> Result<()>;

    /// Evict stale locks, returning how many were removed
    ///
    /// The cutoff is taken once, at the start of the call, so locks created
    /// while it runs are never evicted for age.
    async fn cleanup(&self, lease_expiry: Duration) -> Result<u64>;

    /// Release backend resources
    async fn close(&self) -> Result<()>;
}

/// Background task running [`TokenLockStore::cleanup`] on a fixed period
pub struct LockJanitor {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl LockJanitor {
    /// Start the task; the first sweep happens after one full period
    pub fn spawn(locks: Arc<dyn TokenLockStore>, lease_expiry: Duration, every: Duration) -> Self {
        let (shutdown, mut stop) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately once
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        match locks.cleanup(lease_expiry).await {
                            Ok(0) => tracing::debug!("lock cleanup found nothing to evict"),
                            Ok(removed) => tracing::info!(removed, "evicted stale token locks"),
                            Err(e) => tracing::error!("lock cleanup failed: {}", e),
                        }
                    }
                }
            }

            tracing::info!("lock janitor stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::warn!("lock janitor task ended abnormally: {}", e);
        }
    }
}

impl std::fmt::Debug for LockJanitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockJanitor")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
