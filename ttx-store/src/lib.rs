//! Token Transaction Store
//!
//! Persistence layer for token transactions: requests and their dependent
//! records, token reservation locks, status notifications, cached identity
//! lookups and reconciliation against the ledger.
//!
//! # Architecture
//!
//! - **One status row**: the request row of a `tx_id` owns its status; every
//!   other record reads it through a join
//! - **Atomic writes**: a request and its records become visible together or not at all
//! - **Lock table**: the only authority on whether a token is being spent
//! - **Backends**: SQLite (via sqlx) or in-process memory, chosen by [`Config`]
//!
//! # Invariants
//!
//! - No transaction, movement or validation record without its request
//! - Re-applying a status is a no-op
//! - Locks are never overwritten, only released or cleaned up

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cache;
pub mod checks;
pub mod config;
pub mod error;
pub mod identity;
pub mod locks;
pub mod memory;
pub mod metrics;
pub mod service;
pub mod sql;
pub mod status;
pub mod store;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use locks::{LockJanitor, TokenLockStore};
pub use service::{Persistence, StoreService};
pub use status::StatusSupport;
pub use store::{AtomicWrite, RecordIterator, TransactionStore};
pub use types::{
    ActionType, Identity, LedgerStatus, Metadata, MovementDirection, MovementRecord,
    QueryMovementsParams, QueryTransactionsParams, QueryValidationRecordsParams,
    SearchDirection, StatusEvent, TokenId, TransactionRecord, TxStatus, ValidationRecord,
};
