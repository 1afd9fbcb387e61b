//! Wiring: open a backend from [`Config`] and fan status changes out to listeners

use crate::config::{Config, Driver};
use crate::identity::IdentityStore;
use crate::locks::{LockJanitor, TokenLockStore};
use crate::memory::{MemoryDatabase, MemoryIdentityBackend, MemoryTokenLockStore, MemoryTransactionStore};
use crate::metrics::Metrics;
use crate::sql::{Database, SqlIdentityBackend, SqlTokenLockStore, SqlTransactionStore};
use crate::status::StatusSupport;
use crate::store::TransactionStore;
use crate::types::{StatusEvent, TxStatus};
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transaction store plus status notifications
///
/// Status changes made through [`StoreService::set_status`] wake the listeners
/// registered for that transaction. Writes made directly on the store do not.
#[derive(Clone)]
pub struct StoreService {
    store: Arc<dyn TransactionStore>,
    status: Arc<StatusSupport>,
}

impl StoreService {
    /// Wrap `store` with an empty listener registry
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self {
            store,
            status: Arc::new(StatusSupport::new()),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    /// Listener registry
    pub fn status_support(&self) -> &StatusSupport {
        &self.status
    }

    /// Register `listener` for status events of `tx_id`
    pub fn add_status_listener(&self, tx_id: &str, listener: mpsc::Sender<StatusEvent>) {
        self.status.add_status_listener(tx_id, listener);
    }

    /// Remove a listener registered with [`StoreService::add_status_listener`]
    pub fn delete_status_listener(&self, tx_id: &str, listener: &mpsc::Sender<StatusEvent>) {
        self.status.delete_status_listener(tx_id, listener);
    }

    /// Status and message of `tx_id`
    pub async fn get_status(&self, tx_id: &str) -> Result<(TxStatus, String)> {
        self.store.get_status(tx_id).await
    }

    /// Persist a status change and notify listeners if anything changed
    ///
    /// Re-applying the current status and message notifies nobody, even when
    /// identical calls race each other.
    pub async fn set_status(&self, tx_id: &str, status: TxStatus, message: &str) -> Result<()> {
        if !self.store.set_status(tx_id, status, message).await? {
            tracing::debug!(tx_id = %tx_id, status = %status, "status unchanged, no notification");
            return Ok(());
        }

        // an empty message kept the stored one
        let message = if message.is_empty() {
            self.store.get_status(tx_id).await?.1
        } else {
            message.to_string()
        };
        self.status
            .notify(StatusEvent {
                tx_id: tx_id.to_string(),
                status,
                message,
            })
            .await;
        Ok(())
    }
}

impl std::fmt::Debug for StoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreService")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Every store of one backend, opened together
pub struct Persistence {
    /// Requests, records and endorsement acks
    pub transactions: Arc<dyn TransactionStore>,
    /// Token locks
    pub locks: Arc<dyn TokenLockStore>,
    /// Identities with cached lookups
    pub identities: Arc<IdentityStore>,
    /// Counters of this backend
    pub metrics: Metrics,
    config: Config,
}

impl Persistence {
    /// Open the backend selected by `config.driver`
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let metrics = Metrics::new()?;

        let (transactions, locks, identities): (
            Arc<dyn TransactionStore>,
            Arc<dyn TokenLockStore>,
            IdentityStore,
        ) = match config.driver {
            Driver::Sqlite => {
                let db = Database::connect(&config.sqlite).await?;
                (
                    Arc::new(SqlTransactionStore::new(db.clone(), metrics.clone())),
                    Arc::new(SqlTokenLockStore::new(db.clone(), metrics.clone())),
                    IdentityStore::new(Arc::new(SqlIdentityBackend::new(db)), &config.cache),
                )
            }
            Driver::Memory => {
                let db = MemoryDatabase::new();
                (
                    Arc::new(MemoryTransactionStore::new(db.clone(), metrics.clone())),
                    Arc::new(MemoryTokenLockStore::new(db, metrics.clone())),
                    IdentityStore::new(Arc::new(MemoryIdentityBackend::new()), &config.cache),
                )
            }
        };

        tracing::info!(driver = ?config.driver, "persistence opened");
        Ok(Self {
            transactions,
            locks,
            identities: Arc::new(identities),
            metrics,
            config: config.clone(),
        })
    }

    /// Transaction store with status notifications
    pub fn service(&self) -> StoreService {
        StoreService::new(self.transactions.clone())
    }

    /// Start periodic lock cleanup with the configured lease and period
    pub fn spawn_lock_janitor(&self) -> LockJanitor {
        LockJanitor::spawn(
            self.locks.clone(),
            self.config.locks.lease_expiry(),
            self.config.locks.cleanup_interval(),
        )
    }

    /// Close every store
    pub async fn close(&self) -> Result<()> {
        self.transactions.close().await?;
        self.locks.close().await?;
        self.identities.close().await?;
        tracing::info!("persistence closed");
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("driver", &self.config.driver)
            .finish_non_exhaustive()
    }
}
