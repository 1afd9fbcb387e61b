//! Capability traits implemented by every storage backend
//!
//! A backend provides a [`TransactionStore`] and hands out [`AtomicWrite`]
//! scopes. Status lives in exactly one place, the request row of a `tx_id`;
//! every other record reads it through a join.
//!
//! # Cancellation
//!
//! All operations are futures. Dropping a future (for example through
//! `tokio::time::timeout`) aborts the call. Dropping an [`AtomicWrite`] that was
//! not committed discards everything it wrote.

use crate::types::{
    Identity, Metadata, MovementRecord, QueryMovementsParams, QueryTransactionsParams,
    QueryValidationRecordsParams, TokenRequestRecord, TransactionRecord, TxStatus,
    ValidationRecord,
};
use crate::{Error, Result};
use async_trait::async_trait;
use num_bigint::BigInt;
use std::collections::HashMap;

/// Forward-only, closable cursor
#[async_trait]
pub trait RecordIterator<T>: Send {
    /// Next record, `None` once exhausted or closed
    async fn next(&mut self) -> Result<Option<T>>;

    /// Release the cursor; later calls to `next` return `None`
    fn close(&mut self);
}

/// Cursor over transaction records
pub type TransactionIterator = Box<dyn RecordIterator<TransactionRecord>>;

/// Cursor over validation records
pub type ValidationRecordsIterator = Box<dyn RecordIterator<ValidationRecord>>;

/// Drain a cursor into a vector
pub async fn collect_all<T: Send>(mut it: Box<dyn RecordIterator<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some(record) = it.next().await? {
        out.push(record);
    }
    it.close();
    Ok(out)
}

/// Scoped write: a token request plus its dependent records, applied all or nothing
///
/// Dependent records fail with [`Error::TokenRequestDoesNotExist`] when their
/// `tx_id` has no request, either earlier in this writer or already committed.
#[async_trait]
pub trait AtomicWrite: Send {
    /// Insert the root request row; status starts at `Pending`
    async fn add_token_request(
        &mut self,
        tx_id: &str,
        request: &[u8],
        application_metadata: &Metadata,
        public_metadata: &Metadata,
        pp_hash: &[u8],
    ) -> Result<()>;

    /// Insert a transaction record; its `status` and metadata fields are ignored
    async fn add_transaction(&mut self, record: &TransactionRecord) -> Result<()>;

    /// Insert a movement record; its `status` field is ignored
    async fn add_movement(&mut self, record: &MovementRecord) -> Result<()>;

    /// Insert the validation record of `tx_id`
    async fn add_validation_record(&mut self, tx_id: &str, metadata: &Metadata) -> Result<()>;

    /// Make every write visible; the writer is finalized even if this fails
    async fn commit(&mut self) -> Result<()>;

    /// Discard every write; no-op once finalized
    async fn rollback(&mut self);
}

/// Persistence of requests, transactions, movements, validations and endorsement acks
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Open a new write scope
    async fn begin_atomic_write(&self) -> Result<Box<dyn AtomicWrite>>;

    /// Update status (and message, when non-empty) of `tx_id`
    ///
    /// Returns whether the stored state changed. The comparison and the write
    /// happen in one step, so of several identical concurrent calls at most
    /// one reports `true`. Unknown IDs are a silent no-op returning `false`.
    async fn set_status(&self, tx_id: &str, status: TxStatus, message: &str) -> Result<bool>;

    /// Status and message; never-seen IDs report `Unknown` without error
    async fn get_status(&self, tx_id: &str) -> Result<(TxStatus, String)>;

    /// Serialized token request, if stored
    async fn get_token_request(&self, tx_id: &str) -> Result<Option<Vec<u8>>>;

    /// Transactions matching `params`, oldest first
    async fn query_transactions(
        &self,
        params: QueryTransactionsParams,
    ) -> Result<TransactionIterator>;

    /// Movements matching `params`, capped by `num_records`
    async fn query_movements(&self, params: QueryMovementsParams) -> Result<Vec<MovementRecord>>;

    /// Validation records matching `params`, oldest first
    async fn query_validations(
        &self,
        params: QueryValidationRecordsParams,
    ) -> Result<ValidationRecordsIterator>;

    /// Requests whose status is in `statuses` (all when empty)
    async fn query_token_requests(&self, statuses: &[TxStatus])
        -> Result<Vec<TokenRequestRecord>>;

    /// Record an endorser's signature over `tx_id`
    async fn add_transaction_endorsement_ack(
        &self,
        tx_id: &str,
        endorser: &Identity,
        sigma: &[u8],
    ) -> Result<()>;

    /// Signatures collected for `tx_id`, keyed by endorser unique ID
    async fn get_transaction_endorsement_acks(
        &self,
        tx_id: &str,
    ) -> Result<HashMap<String, Vec<u8>>>;

    /// Release backend resources
    async fn close(&self) -> Result<()>;
}

/// Amount as stored in an `amount BIGINT` column
pub fn storable_amount(tx_id: &str, amount: &BigInt) -> Result<i64> {
    i64::try_from(amount).map_err(|_| Error::AmountOverflow {
        tx_id: tx_id.to_string(),
        amount: amount.to_string(),
    })
}
