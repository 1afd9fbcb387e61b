//! SQLite backend built on sqlx
//!
//! One [`Database`] (pool + table names) is shared by the transaction, lock and
//! identity stores, so lock cleanup can join against the request table.

pub mod identity;
pub mod locks;
pub mod schema;
pub mod transactions;

pub use identity::SqlIdentityBackend;
pub use locks::SqlTokenLockStore;
pub use schema::TableNames;
pub use transactions::SqlTransactionStore;

use crate::config::SqliteConfig;
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Connection pool plus table layout
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    tables: Arc<TableNames>,
}

impl Database {
    /// Open (creating if missing) the database described by `config`
    pub async fn connect(config: &SqliteConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        tracing::info!(
            url = %config.url,
            max_connections = config.max_connections,
            "opened sqlite pool"
        );

        let db = Self::from_pool(pool, &config.table_prefix);
        if config.create_schema {
            db.create_schema().await?;
        }
        Ok(db)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: SqlitePool, table_prefix: &str) -> Self {
        Self {
            pool,
            tables: Arc::new(TableNames::with_prefix(table_prefix)),
        }
    }

    /// Create every table and index that does not exist yet
    pub async fn create_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in schema::statements(&self.tables) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::debug!(requests = %self.tables.requests, "schema ready");
        Ok(())
    }

    /// Underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Table names
    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Close every connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("sqlite pool closed");
    }
}

/// Map a driver error raised while writing a record of `tx_id`
///
/// Foreign-key failures mean the request row is missing.
pub(crate) fn classify(err: sqlx::Error, tx_id: &str) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_foreign_key_violation()
            || db_err
                .message()
                .to_lowercase()
                .contains("foreign key constraint")
        {
            return Error::TokenRequestDoesNotExist(tx_id.to_string());
        }
    }
    tracing::error!(tx_id = %tx_id, "storage error: {}", err);
    Error::Database(err)
}

/// True for primary-key / unique-constraint failures
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| Error::Other(format!("timestamp out of range: {}", micros)))
}

/// Accumulates `WHERE a AND b ...` on a query builder
pub(crate) struct Conditions {
    started: bool,
}

impl Conditions {
    pub(crate) fn new() -> Self {
        Self { started: false }
    }

    /// Start the next conjunct
    pub(crate) fn and<'q, 'args>(
        &mut self,
        qb: &'q mut QueryBuilder<'args, Sqlite>,
    ) -> &'q mut QueryBuilder<'args, Sqlite> {
        qb.push(if self.started { " AND " } else { " WHERE " });
        self.started = true;
        qb
    }

    /// `column IN (v1, v2, ...)`; nothing is pushed for an empty set
    pub(crate) fn and_in<'args, T>(
        &mut self,
        qb: &mut QueryBuilder<'args, Sqlite>,
        column: &str,
        values: impl IntoIterator<Item = T>,
    ) where
        T: 'args + sqlx::Encode<'args, Sqlite> + sqlx::Type<Sqlite> + Send,
    {
        let values: Vec<T> = values.into_iter().collect();
        if values.is_empty() {
            return;
        }
        self.and(qb).push(column).push(" IN (");
        let mut list = qb.separated(", ");
        for v in values {
            list.push_bind(v);
        }
        list.push_unseparated(")");
    }
}
