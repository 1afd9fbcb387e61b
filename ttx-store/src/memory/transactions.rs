//! In-process transaction store

use super::{AckRow, MemoryDatabase, MovementRow, RequestRow, Tables, TransactionRow, ValidationRow};
use crate::metrics::Metrics;
use crate::store::{
    storable_amount, AtomicWrite, RecordIterator, TransactionIterator, TransactionStore,
    ValidationRecordsIterator,
};
use crate::types::{
    in_time_range, Identity, Metadata, MovementDirection, MovementRecord, QueryMovementsParams,
    QueryTransactionsParams, QueryValidationRecordsParams, SearchDirection, TokenRequestRecord,
    TransactionRecord, TxStatus, ValidationRecord,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use num_bigint::BigInt;
use std::collections::{HashMap, HashSet, VecDeque};

/// Transaction store over a [`MemoryDatabase`]
#[derive(Debug, Clone)]
pub struct MemoryTransactionStore {
    db: MemoryDatabase,
    metrics: Metrics,
}

impl MemoryTransactionStore {
    /// Create a store over `db`
    pub fn new(db: MemoryDatabase, metrics: Metrics) -> Self {
        Self { db, metrics }
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn begin_atomic_write(&self) -> Result<Box<dyn AtomicWrite>> {
        Ok(Box::new(MemoryAtomicWrite {
            db: self.db.clone(),
            metrics: self.metrics.clone(),
            batch: Some(Batch::default()),
        }))
    }

    async fn set_status(&self, tx_id: &str, status: TxStatus, message: &str) -> Result<bool> {
        let mut tables = self.db.tables().write();
        let row = match tables.requests.get_mut(tx_id) {
            Some(row) => row,
            None => {
                tracing::debug!(tx_id = %tx_id, "set_status on unknown transaction ignored");
                return Ok(false);
            }
        };

        let new_message = !message.is_empty() && row.status_message != message;
        if row.status == status && !new_message {
            return Ok(false);
        }
        row.status = status;
        if new_message {
            row.status_message = message.to_string();
        }
        tracing::debug!(tx_id = %tx_id, status = %status, "status updated");
        Ok(true)
    }

    async fn get_status(&self, tx_id: &str) -> Result<(TxStatus, String)> {
        let tables = self.db.tables().read();
        Ok(tables
            .requests
            .get(tx_id)
            .map(|r| (r.status, r.status_message.clone()))
            .unwrap_or((TxStatus::Unknown, String::new())))
    }

    async fn get_token_request(&self, tx_id: &str) -> Result<Option<Vec<u8>>> {
        let tables = self.db.tables().read();
        Ok(tables.requests.get(tx_id).map(|r| r.request.clone()))
    }

    async fn query_transactions(
        &self,
        params: QueryTransactionsParams,
    ) -> Result<TransactionIterator> {
        let tables = self.db.tables().read();
        let ids: HashSet<&str> = params.ids.iter().map(String::as_str).collect();
        let wallets = params.wallet_pair();

        let mut rows: Vec<&TransactionRow> = tables
            .transactions
            .iter()
            .filter(|t| ids.is_empty() || ids.contains(t.tx_id.as_str()))
            .filter(|t| in_time_range(t.stored_at, params.from, params.to))
            .filter(|t| params.action_types.is_empty() || params.action_types.contains(&t.action_type))
            .filter(|t| {
                params.statuses.is_empty()
                    || tables
                        .status_of(&t.tx_id)
                        .map_or(false, |s| params.statuses.contains(&s))
            })
            .filter(|t| {
                wallets.map_or(true, |(sender, recipient)| {
                    t.sender_eid == sender || t.recipient_eid == recipient
                })
            })
            .collect();
        rows.sort_by_key(|t| (t.stored_at, t.seq));

        let records = rows
            .into_iter()
            .filter_map(|t| {
                let request = tables.requests.get(&t.tx_id)?;
                Some(TransactionRecord {
                    tx_id: t.tx_id.clone(),
                    action_type: t.action_type,
                    sender_eid: t.sender_eid.clone(),
                    recipient_eid: t.recipient_eid.clone(),
                    token_type: t.token_type.clone(),
                    amount: BigInt::from(t.amount),
                    timestamp: t.stored_at,
                    status: request.status,
                    application_metadata: request.application_metadata.clone(),
                })
            })
            .collect();
        Ok(Box::new(SnapshotIterator::new(records)))
    }

    async fn query_movements(&self, params: QueryMovementsParams) -> Result<Vec<MovementRecord>> {
        let tables = self.db.tables().read();
        let mut rows: Vec<(&MovementRow, TxStatus)> = tables
            .movements
            .iter()
            .filter_map(|m| tables.status_of(&m.tx_id).map(|s| (m, s)))
            .filter(|(m, _)| {
                params.enrollment_ids.is_empty() || params.enrollment_ids.contains(&m.enrollment_id)
            })
            .filter(|(m, _)| params.token_types.is_empty() || params.token_types.contains(&m.token_type))
            .filter(|(_, s)| params.accepts_status(*s))
            .filter(|(m, _)| match params.movement_direction {
                MovementDirection::Sent => m.amount < 0,
                MovementDirection::Received => m.amount > 0,
                MovementDirection::All => true,
            })
            .collect();

        rows.sort_by_key(|(m, _)| (m.stored_at, m.seq));
        if params.search_direction == SearchDirection::FromLast {
            rows.reverse();
        }
        if params.num_records > 0 {
            rows.truncate(params.num_records);
        }

        Ok(rows
            .into_iter()
            .map(|(m, status)| MovementRecord {
                tx_id: m.tx_id.clone(),
                enrollment_id: m.enrollment_id.clone(),
                token_type: m.token_type.clone(),
                amount: BigInt::from(m.amount),
                status,
            })
            .collect())
    }

    async fn query_validations(
        &self,
        params: QueryValidationRecordsParams,
    ) -> Result<ValidationRecordsIterator> {
        let tables = self.db.tables().read();
        let mut rows: Vec<&ValidationRow> = tables
            .validations
            .iter()
            .filter(|v| in_time_range(v.stored_at, params.from, params.to))
            .collect();
        rows.sort_by_key(|v| (v.stored_at, v.seq));

        let records = rows
            .into_iter()
            .filter_map(|v| {
                let request = tables.requests.get(&v.tx_id)?;
                Some(ValidationRecord {
                    tx_id: v.tx_id.clone(),
                    token_request: request.request.clone(),
                    metadata: v.metadata.clone(),
                    timestamp: v.stored_at,
                    status: request.status,
                })
            })
            .filter(|r| params.statuses.is_empty() || params.statuses.contains(&r.status))
            .filter(|r| params.filter.as_ref().map_or(true, |f| f(r)))
            .collect();
        Ok(Box::new(SnapshotIterator::new(records)))
    }

    async fn query_token_requests(
        &self,
        statuses: &[TxStatus],
    ) -> Result<Vec<TokenRequestRecord>> {
        let tables = self.db.tables().read();
        let mut rows: Vec<(&String, &RequestRow)> = tables
            .requests
            .iter()
            .filter(|(_, r)| statuses.is_empty() || statuses.contains(&r.status))
            .collect();
        rows.sort_by_key(|(_, r)| r.seq);
        Ok(rows
            .into_iter()
            .map(|(tx_id, r)| TokenRequestRecord {
                tx_id: tx_id.clone(),
                request: r.request.clone(),
                status: r.status,
            })
            .collect())
    }

    async fn add_transaction_endorsement_ack(
        &self,
        tx_id: &str,
        endorser: &Identity,
        sigma: &[u8],
    ) -> Result<()> {
        self.db.tables().write().acks.push(AckRow {
            tx_id: tx_id.to_string(),
            endorser: endorser.as_bytes().to_vec(),
            sigma: sigma.to_vec(),
        });
        tracing::debug!(tx_id = %tx_id, endorser = %endorser, "stored endorsement ack");
        Ok(())
    }

    async fn get_transaction_endorsement_acks(
        &self,
        tx_id: &str,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let tables = self.db.tables().read();
        Ok(tables
            .acks
            .iter()
            .filter(|a| a.tx_id == tx_id)
            .map(|a| (Identity::new(a.endorser.clone()).unique_id(), a.sigma.clone()))
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Rows staged by one writer
#[derive(Debug, Default)]
struct Batch {
    requests: Vec<(String, RequestRow)>,
    transactions: Vec<TransactionRow>,
    movements: Vec<MovementRow>,
    validations: Vec<ValidationRow>,
}

impl Batch {
    fn has_request(&self, tx_id: &str) -> bool {
        self.requests.iter().any(|(id, _)| id == tx_id)
    }

    /// Every `tx_id` the dependent rows point at
    fn referenced(&self) -> impl Iterator<Item = &str> {
        self.transactions
            .iter()
            .map(|t| t.tx_id.as_str())
            .chain(self.movements.iter().map(|m| m.tx_id.as_str()))
            .chain(self.validations.iter().map(|v| v.tx_id.as_str()))
    }
}

/// Atomic writer staging rows until commit
pub struct MemoryAtomicWrite {
    db: MemoryDatabase,
    metrics: Metrics,
    batch: Option<Batch>,
}

impl MemoryAtomicWrite {
    /// Staged rows; fails once the writer is finalized
    fn batch(&mut self) -> Result<&mut Batch> {
        self.batch.as_mut().ok_or(Error::NoTransactionInProgress)
    }

    /// Referential check against this writer's requests and committed state
    fn require_request(&mut self, tx_id: &str) -> Result<()> {
        let staged = self.batch()?.has_request(tx_id);
        if staged || self.db.tables().read().requests.contains_key(tx_id) {
            return Ok(());
        }
        tracing::error!(tx_id = %tx_id, "record references a missing token request");
        Err(Error::TokenRequestDoesNotExist(tx_id.to_string()))
    }
}

fn check_commit(tables: &Tables, batch: &Batch) -> Result<()> {
    for (tx_id, _) in &batch.requests {
        if tables.requests.contains_key(tx_id) {
            return Err(Error::Other(format!("token request [{}] already exists", tx_id)));
        }
    }
    for tx_id in batch.referenced() {
        if !batch.has_request(tx_id) && !tables.requests.contains_key(tx_id) {
            return Err(Error::TokenRequestDoesNotExist(tx_id.to_string()));
        }
    }
    for v in &batch.validations {
        if tables.validations.iter().any(|existing| existing.tx_id == v.tx_id) {
            return Err(Error::Other(format!(
                "validation record for [{}] already exists",
                v.tx_id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl AtomicWrite for MemoryAtomicWrite {
    async fn add_token_request(
        &mut self,
        tx_id: &str,
        request: &[u8],
        application_metadata: &Metadata,
        public_metadata: &Metadata,
        pp_hash: &[u8],
    ) -> Result<()> {
        let batch = self.batch()?;
        if batch.has_request(tx_id) {
            return Err(Error::Other(format!("token request [{}] already exists", tx_id)));
        }
        batch.requests.push((
            tx_id.to_string(),
            RequestRow {
                seq: 0,
                request: request.to_vec(),
                status: TxStatus::Pending,
                status_message: String::new(),
                application_metadata: application_metadata.clone(),
                public_metadata: public_metadata.clone(),
                pp_hash: pp_hash.to_vec(),
            },
        ));
        Ok(())
    }

    async fn add_transaction(&mut self, record: &TransactionRecord) -> Result<()> {
        let amount = storable_amount(&record.tx_id, &record.amount)?;
        self.require_request(&record.tx_id)?;
        self.batch()?.transactions.push(TransactionRow {
            seq: 0,
            tx_id: record.tx_id.clone(),
            action_type: record.action_type,
            sender_eid: record.sender_eid.clone(),
            recipient_eid: record.recipient_eid.clone(),
            token_type: record.token_type.clone(),
            amount,
            stored_at: record.timestamp,
        });
        Ok(())
    }

    async fn add_movement(&mut self, record: &MovementRecord) -> Result<()> {
        let amount = storable_amount(&record.tx_id, &record.amount)?;
        self.require_request(&record.tx_id)?;
        self.batch()?.movements.push(MovementRow {
            seq: 0,
            tx_id: record.tx_id.clone(),
            enrollment_id: record.enrollment_id.clone(),
            token_type: record.token_type.clone(),
            amount,
            stored_at: Utc::now(),
        });
        Ok(())
    }

    async fn add_validation_record(&mut self, tx_id: &str, metadata: &Metadata) -> Result<()> {
        self.require_request(tx_id)?;
        let batch = self.batch()?;
        if batch.validations.iter().any(|v| v.tx_id == tx_id) {
            return Err(Error::Other(format!(
                "validation record for [{}] already exists",
                tx_id
            )));
        }
        batch.validations.push(ValidationRow {
            seq: 0,
            tx_id: tx_id.to_string(),
            metadata: metadata.clone(),
            stored_at: Utc::now(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let batch = self.batch.take().ok_or(Error::NoTransactionInProgress)?;
        let mut tables = self.db.tables().write();
        if let Err(e) = check_commit(&tables, &batch) {
            self.metrics.rollbacks_total.inc();
            return Err(e);
        }

        for (tx_id, mut row) in batch.requests {
            row.seq = tables.seq();
            tables.requests.insert(tx_id, row);
        }
        for mut row in batch.transactions {
            row.seq = tables.seq();
            tables.transactions.push(row);
        }
        for mut row in batch.movements {
            row.seq = tables.seq();
            tables.movements.push(row);
        }
        for mut row in batch.validations {
            row.seq = tables.seq();
            tables.validations.push(row);
        }
        self.metrics.commits_total.inc();
        Ok(())
    }

    async fn rollback(&mut self) {
        if self.batch.take().is_some() {
            self.metrics.rollbacks_total.inc();
        } else {
            tracing::debug!("rollback on a finalized writer ignored");
        }
    }
}

impl Drop for MemoryAtomicWrite {
    fn drop(&mut self) {
        if self.batch.is_some() {
            tracing::debug!("atomic write dropped before commit, discarding");
            self.metrics.rollbacks_total.inc();
        }
    }
}

/// Iterator over a result set materialized under the read lock
struct SnapshotIterator<T> {
    records: VecDeque<T>,
}

impl<T> SnapshotIterator<T> {
    fn new(records: Vec<T>) -> Self {
        Self {
            records: records.into(),
        }
    }
}

#[async_trait]
impl<T: Send> RecordIterator<T> for SnapshotIterator<T> {
    async fn next(&mut self) -> Result<Option<T>> {
        Ok(self.records.pop_front())
    }

    fn close(&mut self) {
        self.records.clear();
    }
}
