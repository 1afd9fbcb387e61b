//! In-process backend
//!
//! All tables sit behind one `RwLock`, so every read sees a consistent
//! snapshot and an atomic write applies in a single critical section. There is
//! no database to enforce referential integrity, so the writers check that a
//! referenced request exists themselves.

pub mod identity;
pub mod locks;
pub mod transactions;

pub use identity::MemoryIdentityBackend;
pub use locks::MemoryTokenLockStore;
pub use transactions::MemoryTransactionStore;

use crate::types::{ActionType, Metadata, TokenId, TxStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) struct RequestRow {
    pub seq: u64,
    pub request: Vec<u8>,
    pub status: TxStatus,
    pub status_message: String,
    pub application_metadata: Metadata,
    #[allow(dead_code)]
    pub public_metadata: Metadata,
    #[allow(dead_code)]
    pub pp_hash: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) struct TransactionRow {
    pub seq: u64,
    pub tx_id: String,
    pub action_type: ActionType,
    pub sender_eid: String,
    pub recipient_eid: String,
    pub token_type: String,
    pub amount: i64,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct MovementRow {
    pub seq: u64,
    pub tx_id: String,
    pub enrollment_id: String,
    pub token_type: String,
    pub amount: i64,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct ValidationRow {
    pub seq: u64,
    pub tx_id: String,
    pub metadata: Metadata,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct AckRow {
    pub tx_id: String,
    pub endorser: Vec<u8>,
    pub sigma: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) struct LockRow {
    pub consumer_tx_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    next_seq: u64,
    pub requests: HashMap<String, RequestRow>,
    pub transactions: Vec<TransactionRow>,
    pub movements: Vec<MovementRow>,
    pub validations: Vec<ValidationRow>,
    pub acks: Vec<AckRow>,
    pub locks: HashMap<TokenId, LockRow>,
}

impl Tables {
    /// Next insertion sequence number; breaks timestamp ties
    pub fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn status_of(&self, tx_id: &str) -> Option<TxStatus> {
        self.requests.get(tx_id).map(|r| r.status)
    }
}

/// Shared handle to the in-process tables
///
/// The transaction and lock stores of one backend must share a handle so lock
/// cleanup can see request statuses.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryDatabase {
    /// Empty tables
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tables(&self) -> &RwLock<Tables> {
        &self.tables
    }
}
