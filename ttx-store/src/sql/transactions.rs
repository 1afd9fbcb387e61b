//! SQLite transaction store
//!
//! Every dependent table references `requests(tx_id)`, so inserting a record
//! for an unknown transaction fails inside the database and surfaces as
//! [`Error::TokenRequestDoesNotExist`]. Status is only ever read through a
//! join on the request row.

use super::{classify, from_micros, to_micros, Conditions, Database};
use crate::metrics::Metrics;
use crate::store::{
    storable_amount, AtomicWrite, RecordIterator, TransactionIterator, TransactionStore,
    ValidationRecordsIterator,
};
use crate::types::{
    ActionType, Identity, Metadata, MovementDirection, MovementRecord, QueryMovementsParams,
    QueryTransactionsParams, QueryValidationRecordsParams, SearchDirection, TokenRequestRecord,
    TransactionRecord, TxStatus, ValidationRecord,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use num_bigint::BigInt;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Rows fetched per cursor round trip
const PAGE_SIZE: i64 = 256;

/// Transaction store over a shared [`Database`]
#[derive(Debug, Clone)]
pub struct SqlTransactionStore {
    db: Database,
    metrics: Metrics,
}

impl SqlTransactionStore {
    /// Create a store; the schema must already exist
    pub fn new(db: Database, metrics: Metrics) -> Self {
        Self { db, metrics }
    }
}

pub(crate) fn encode_metadata(metadata: &Metadata) -> Result<String> {
    Ok(serde_json::to_string(metadata)?)
}

pub(crate) fn decode_metadata(raw: &[u8]) -> Result<Metadata> {
    if raw.is_empty() {
        return Ok(Metadata::new());
    }
    Ok(serde_json::from_slice(raw)?)
}

#[async_trait]
impl TransactionStore for SqlTransactionStore {
    async fn begin_atomic_write(&self) -> Result<Box<dyn AtomicWrite>> {
        let txn = self.db.pool().begin().await?;
        Ok(Box::new(SqlAtomicWrite {
            txn: Some(txn),
            db: self.db.clone(),
            metrics: self.metrics.clone(),
        }))
    }

    async fn set_status(&self, tx_id: &str, status: TxStatus, message: &str) -> Result<bool> {
        let t = self.db.tables();
        // a single UPDATE holds the write lock for its own WHERE check
        let result = if message.is_empty() {
            sqlx::query(&format!(
                "UPDATE {} SET status = ? WHERE tx_id = ? AND status <> ?",
                t.requests
            ))
            .bind(status.code())
            .bind(tx_id)
            .bind(status.code())
            .execute(self.db.pool())
            .await?
        } else {
            sqlx::query(&format!(
                "UPDATE {} SET status = ?, status_message = ? \
                 WHERE tx_id = ? AND (status <> ? OR status_message <> ?)",
                t.requests
            ))
            .bind(status.code())
            .bind(message)
            .bind(tx_id)
            .bind(status.code())
            .bind(message)
            .execute(self.db.pool())
            .await?
        };

        let changed = result.rows_affected() > 0;
        if changed {
            tracing::debug!(tx_id = %tx_id, status = %status, "status updated");
        } else {
            tracing::debug!(tx_id = %tx_id, "set_status left state unchanged");
        }
        Ok(changed)
    }

    async fn get_status(&self, tx_id: &str) -> Result<(TxStatus, String)> {
        let row = sqlx::query(&format!(
            "SELECT status, status_message FROM {} WHERE tx_id = ?",
            self.db.tables().requests
        ))
        .bind(tx_id)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => {
                let code: i64 = row.try_get(0)?;
                let message: String = row.try_get(1)?;
                Ok((TxStatus::from_code(code), message))
            }
            None => {
                tracing::debug!(tx_id = %tx_id, "no request stored, reporting Unknown");
                Ok((TxStatus::Unknown, String::new()))
            }
        }
    }

    async fn get_token_request(&self, tx_id: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(&format!(
            "SELECT request FROM {} WHERE tx_id = ?",
            self.db.tables().requests
        ))
        .bind(tx_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| r.try_get::<Vec<u8>, _>(0).map_err(Error::from))
            .transpose()
    }

    async fn query_transactions(
        &self,
        params: QueryTransactionsParams,
    ) -> Result<TransactionIterator> {
        Ok(Box::new(SqlTransactionCursor {
            db: self.db.clone(),
            params,
            buffer: VecDeque::new(),
            last: None,
            exhausted: false,
        }))
    }

    async fn query_movements(&self, params: QueryMovementsParams) -> Result<Vec<MovementRecord>> {
        let t = self.db.tables();
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT m.tx_id, m.enrollment_id, m.token_type, m.amount, r.status \
             FROM {} m JOIN {} r ON m.tx_id = r.tx_id",
            t.movements, t.requests
        ));
        let mut w = Conditions::new();
        w.and_in(&mut qb, "m.enrollment_id", params.enrollment_ids.iter().cloned());
        w.and_in(&mut qb, "m.token_type", params.token_types.iter().cloned());
        if params.tx_statuses.is_empty() {
            w.and(&mut qb)
                .push("r.status != ")
                .push_bind(TxStatus::Deleted.code());
        } else {
            w.and_in(&mut qb, "r.status", params.tx_statuses.iter().map(|s| s.code()));
        }
        match params.movement_direction {
            MovementDirection::Sent => {
                w.and(&mut qb).push("m.amount < 0");
            }
            MovementDirection::Received => {
                w.and(&mut qb).push("m.amount > 0");
            }
            MovementDirection::All => {}
        }
        qb.push(match params.search_direction {
            SearchDirection::FromBeginning => " ORDER BY m.stored_at ASC, m.rowid ASC",
            SearchDirection::FromLast => " ORDER BY m.stored_at DESC, m.rowid DESC",
        });
        if params.num_records > 0 {
            qb.push(" LIMIT ").push_bind(params.num_records as i64);
        }

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        rows.iter()
            .map(|row| -> Result<MovementRecord> {
                Ok(MovementRecord {
                    tx_id: row.try_get(0)?,
                    enrollment_id: row.try_get(1)?,
                    token_type: row.try_get(2)?,
                    amount: BigInt::from(row.try_get::<i64, _>(3)?),
                    status: TxStatus::from_code(row.try_get(4)?),
                })
            })
            .collect()
    }

    async fn query_validations(
        &self,
        params: QueryValidationRecordsParams,
    ) -> Result<ValidationRecordsIterator> {
        Ok(Box::new(SqlValidationCursor {
            db: self.db.clone(),
            params,
            buffer: VecDeque::new(),
            last: None,
            exhausted: false,
        }))
    }

    async fn query_token_requests(
        &self,
        statuses: &[TxStatus],
    ) -> Result<Vec<TokenRequestRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT tx_id, request, status FROM {}",
            self.db.tables().requests
        ));
        Conditions::new().and_in(&mut qb, "status", statuses.iter().map(|s| s.code()));
        qb.push(" ORDER BY rowid ASC");

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        rows.iter()
            .map(|row| -> Result<TokenRequestRecord> {
                Ok(TokenRequestRecord {
                    tx_id: row.try_get(0)?,
                    request: row.try_get(1)?,
                    status: TxStatus::from_code(row.try_get(2)?),
                })
            })
            .collect()
    }

    async fn add_transaction_endorsement_ack(
        &self,
        tx_id: &str,
        endorser: &Identity,
        sigma: &[u8],
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, tx_id, endorser, sigma, stored_at) VALUES (?, ?, ?, ?, ?)",
            self.db.tables().endorse_acks
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(tx_id)
        .bind(endorser.as_bytes())
        .bind(sigma)
        .bind(to_micros(Utc::now()))
        .execute(self.db.pool())
        .await?;
        tracing::debug!(tx_id = %tx_id, endorser = %endorser, "stored endorsement ack");
        Ok(())
    }

    async fn get_transaction_endorsement_acks(
        &self,
        tx_id: &str,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let rows = sqlx::query(&format!(
            "SELECT endorser, sigma FROM {} WHERE tx_id = ? ORDER BY stored_at ASC, rowid ASC",
            self.db.tables().endorse_acks
        ))
        .bind(tx_id)
        .fetch_all(self.db.pool())
        .await?;

        let mut acks = HashMap::with_capacity(rows.len());
        for row in rows {
            let endorser: Vec<u8> = row.try_get(0)?;
            let sigma: Vec<u8> = row.try_get(1)?;
            acks.insert(Identity::new(endorser).unique_id(), sigma);
        }
        Ok(acks)
    }

    async fn close(&self) -> Result<()> {
        self.db.close().await;
        Ok(())
    }
}

/// Atomic writer backed by one database transaction
pub struct SqlAtomicWrite {
    txn: Option<Transaction<'static, Sqlite>>,
    db: Database,
    metrics: Metrics,
}

impl SqlAtomicWrite {
    fn txn(&mut self) -> Result<&mut Transaction<'static, Sqlite>> {
        self.txn.as_mut().ok_or(Error::NoTransactionInProgress)
    }
}

#[async_trait]
impl AtomicWrite for SqlAtomicWrite {
    async fn add_token_request(
        &mut self,
        tx_id: &str,
        request: &[u8],
        application_metadata: &Metadata,
        public_metadata: &Metadata,
        pp_hash: &[u8],
    ) -> Result<()> {
        let app = encode_metadata(application_metadata)?;
        let public = encode_metadata(public_metadata)?;
        let sql = format!(
            "INSERT INTO {} (tx_id, request, status, status_message, application_metadata, \
             public_metadata, pp_hash) VALUES (?, ?, ?, '', ?, ?, ?)",
            self.db.tables().requests
        );
        let txn = self.txn()?;
        sqlx::query(&sql)
            .bind(tx_id)
            .bind(request)
            .bind(TxStatus::Pending.code())
            .bind(app)
            .bind(public)
            .bind(pp_hash)
            .execute(&mut **txn)
            .await
            .map_err(|e| classify(e, tx_id))?;
        Ok(())
    }

    async fn add_transaction(&mut self, record: &TransactionRecord) -> Result<()> {
        let amount = storable_amount(&record.tx_id, &record.amount)?;
        let sql = format!(
            "INSERT INTO {} (id, tx_id, action_type, sender_eid, recipient_eid, token_type, \
             amount, stored_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            self.db.tables().transactions
        );
        let txn = self.txn()?;
        sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(&record.tx_id)
            .bind(record.action_type.code())
            .bind(&record.sender_eid)
            .bind(&record.recipient_eid)
            .bind(&record.token_type)
            .bind(amount)
            .bind(to_micros(record.timestamp))
            .execute(&mut **txn)
            .await
            .map_err(|e| classify(e, &record.tx_id))?;
        Ok(())
    }

    async fn add_movement(&mut self, record: &MovementRecord) -> Result<()> {
        let amount = storable_amount(&record.tx_id, &record.amount)?;
        let sql = format!(
            "INSERT INTO {} (id, tx_id, enrollment_id, token_type, amount, stored_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            self.db.tables().movements
        );
        let txn = self.txn()?;
        sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(&record.tx_id)
            .bind(&record.enrollment_id)
            .bind(&record.token_type)
            .bind(amount)
            .bind(to_micros(Utc::now()))
            .execute(&mut **txn)
            .await
            .map_err(|e| classify(e, &record.tx_id))?;
        Ok(())
    }

    async fn add_validation_record(&mut self, tx_id: &str, metadata: &Metadata) -> Result<()> {
        let encoded = serde_json::to_vec(metadata)?;
        let sql = format!(
            "INSERT INTO {} (tx_id, metadata, stored_at) VALUES (?, ?, ?)",
            self.db.tables().validations
        );
        let txn = self.txn()?;
        sqlx::query(&sql)
            .bind(tx_id)
            .bind(encoded)
            .bind(to_micros(Utc::now()))
            .execute(&mut **txn)
            .await
            .map_err(|e| classify(e, tx_id))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or(Error::NoTransactionInProgress)?;
        txn.commit().await?;
        self.metrics.commits_total.inc();
        Ok(())
    }

    async fn rollback(&mut self) {
        match self.txn.take() {
            Some(txn) => {
                if let Err(e) = txn.rollback().await {
                    tracing::warn!("rollback failed: {}", e);
                }
                self.metrics.rollbacks_total.inc();
            }
            None => tracing::debug!("rollback on a finalized writer ignored"),
        }
    }
}

impl Drop for SqlAtomicWrite {
    fn drop(&mut self) {
        // the sqlx transaction rolls itself back when dropped
        if self.txn.is_some() {
            tracing::debug!("atomic write dropped before commit, discarding");
            self.metrics.rollbacks_total.inc();
        }
    }
}

/// Keyset position: `(stored_at, rowid)` of the last row handed out
type Position = (i64, i64);

fn push_after(w: &mut Conditions, qb: &mut QueryBuilder<'_, Sqlite>, alias: &str, last: Position) {
    let (at, rowid) = last;
    w.and(qb)
        .push(format!("({0}.stored_at > ", alias))
        .push_bind(at)
        .push(format!(" OR ({0}.stored_at = ", alias))
        .push_bind(at)
        .push(format!(" AND {0}.rowid > ", alias))
        .push_bind(rowid)
        .push("))");
}

/// Cursor over transactions, fetched page by page in `stored_at` order
struct SqlTransactionCursor {
    db: Database,
    params: QueryTransactionsParams,
    buffer: VecDeque<TransactionRecord>,
    last: Option<Position>,
    exhausted: bool,
}

impl SqlTransactionCursor {
    async fn fetch_page(&mut self) -> Result<()> {
        let t = self.db.tables();
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT t.tx_id, t.action_type, t.sender_eid, t.recipient_eid, t.token_type, \
             t.amount, t.stored_at, r.status, r.application_metadata, t.rowid \
             FROM {} t JOIN {} r ON t.tx_id = r.tx_id",
            t.transactions, t.requests
        ));
        let p = &self.params;
        let mut w = Conditions::new();
        w.and_in(&mut qb, "t.tx_id", p.ids.iter().cloned());
        if let Some(from) = p.from {
            w.and(&mut qb).push("t.stored_at >= ").push_bind(to_micros(from));
        }
        if let Some(to) = p.to {
            w.and(&mut qb).push("t.stored_at < ").push_bind(to_micros(to));
        }
        w.and_in(&mut qb, "t.action_type", p.action_types.iter().map(|a| a.code()));
        w.and_in(&mut qb, "r.status", p.statuses.iter().map(|s| s.code()));
        if let Some((sender, recipient)) = p.wallet_pair() {
            w.and(&mut qb)
                .push("(t.sender_eid = ")
                .push_bind(sender.to_string())
                .push(" OR t.recipient_eid = ")
                .push_bind(recipient.to_string())
                .push(")");
        }
        if let Some(last) = self.last {
            push_after(&mut w, &mut qb, "t", last);
        }
        qb.push(" ORDER BY t.stored_at ASC, t.rowid ASC LIMIT ")
            .push_bind(PAGE_SIZE);

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        self.exhausted = (rows.len() as i64) < PAGE_SIZE;
        for row in &rows {
            let (record, position) = decode_transaction(row)?;
            self.last = Some(position);
            self.buffer.push_back(record);
        }
        Ok(())
    }
}

fn decode_transaction(row: &SqliteRow) -> Result<(TransactionRecord, Position)> {
    let tx_id: String = row.try_get(0)?;
    let action_code: i64 = row.try_get(1)?;
    let action_type = ActionType::from_code(action_code)
        .ok_or_else(|| Error::Other(format!("unknown action type {} for [{}]", action_code, tx_id)))?;
    let stored_at: i64 = row.try_get(6)?;
    let metadata: String = row.try_get(8)?;
    let record = TransactionRecord {
        action_type,
        sender_eid: row.try_get(2)?,
        recipient_eid: row.try_get(3)?,
        token_type: row.try_get(4)?,
        amount: BigInt::from(row.try_get::<i64, _>(5)?),
        timestamp: from_micros(stored_at)?,
        status: TxStatus::from_code(row.try_get(7)?),
        application_metadata: decode_metadata(metadata.as_bytes())?,
        tx_id,
    };
    Ok((record, (stored_at, row.try_get(9)?)))
}

#[async_trait]
impl RecordIterator<TransactionRecord> for SqlTransactionCursor {
    async fn next(&mut self) -> Result<Option<TransactionRecord>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }

    fn close(&mut self) {
        self.buffer.clear();
        self.exhausted = true;
    }
}

/// Cursor over validation records; the caller's filter runs after each fetch
struct SqlValidationCursor {
    db: Database,
    params: QueryValidationRecordsParams,
    buffer: VecDeque<ValidationRecord>,
    last: Option<Position>,
    exhausted: bool,
}

impl SqlValidationCursor {
    async fn fetch_page(&mut self) -> Result<()> {
        let t = self.db.tables();
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT v.tx_id, r.request, v.metadata, v.stored_at, r.status, v.rowid \
             FROM {} v JOIN {} r ON v.tx_id = r.tx_id",
            t.validations, t.requests
        ));
        let p = &self.params;
        let mut w = Conditions::new();
        if let Some(from) = p.from {
            w.and(&mut qb).push("v.stored_at >= ").push_bind(to_micros(from));
        }
        if let Some(to) = p.to {
            w.and(&mut qb).push("v.stored_at < ").push_bind(to_micros(to));
        }
        w.and_in(&mut qb, "r.status", p.statuses.iter().map(|s| s.code()));
        if let Some(last) = self.last {
            push_after(&mut w, &mut qb, "v", last);
        }
        qb.push(" ORDER BY v.stored_at ASC, v.rowid ASC LIMIT ")
            .push_bind(PAGE_SIZE);

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        self.exhausted = (rows.len() as i64) < PAGE_SIZE;
        for row in &rows {
            let stored_at: i64 = row.try_get(3)?;
            let metadata: Vec<u8> = row.try_get(2)?;
            let record = ValidationRecord {
                tx_id: row.try_get(0)?,
                token_request: row.try_get(1)?,
                metadata: decode_metadata(&metadata)?,
                timestamp: from_micros(stored_at)?,
                status: TxStatus::from_code(row.try_get(4)?),
            };
            self.last = Some((stored_at, row.try_get(5)?));
            let keep = self.params.filter.as_ref().map_or(true, |f| f(&record));
            if keep {
                self.buffer.push_back(record);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordIterator<ValidationRecord> for SqlValidationCursor {
    async fn next(&mut self) -> Result<Option<ValidationRecord>> {
        // a whole page can be filtered away, so keep going until data or the end
        while self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }

    fn close(&mut self) {
        self.buffer.clear();
        self.exhausted = true;
    }
}
