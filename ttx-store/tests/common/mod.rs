//! Shared fixtures: open each backend and seed records

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use tempfile::TempDir;
use ttx_store::config::{Config, Driver};
use ttx_store::{ActionType, Metadata, Persistence, TransactionRecord, TxStatus};

/// An opened backend; keeps the SQLite directory alive for the test
pub struct Fixture {
    pub persistence: Persistence,
    _dir: Option<TempDir>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn sqlite() -> Fixture {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.driver = Driver::Sqlite;
    config.sqlite.url = format!("sqlite://{}", dir.path().join("ttx.db").display());
    config.sqlite.max_connections = 4;
    config.sqlite.table_prefix = "test".to_string();

    Fixture {
        persistence: Persistence::open(&config).await.unwrap(),
        _dir: Some(dir),
    }
}

pub async fn memory() -> Fixture {
    init_tracing();
    Fixture {
        persistence: Persistence::open(&Config::memory()).await.unwrap(),
        _dir: None,
    }
}

/// Run an async scenario against both backends
macro_rules! on_both_backends {
    ($name:ident) => {
        mod $name {
            #[tokio::test]
            async fn sqlite() {
                super::$name(&crate::common::sqlite().await.persistence).await;
            }

            #[tokio::test]
            async fn memory() {
                super::$name(&crate::common::memory().await.persistence).await;
            }
        }
    };
}

pub fn transfer(tx_id: &str, sender: &str, recipient: &str, amount: i64, at: DateTime<Utc>) -> TransactionRecord {
    TransactionRecord {
        tx_id: tx_id.to_string(),
        action_type: ActionType::Transfer,
        sender_eid: sender.to_string(),
        recipient_eid: recipient.to_string(),
        token_type: "USD".to_string(),
        amount: BigInt::from(amount),
        timestamp: at,
        status: TxStatus::Pending,
        application_metadata: Metadata::new(),
    }
}

/// Commit a request for `tx_id` together with `records`
pub async fn commit_request(p: &Persistence, tx_id: &str, records: &[TransactionRecord]) {
    let mut w = p.transactions.begin_atomic_write().await.unwrap();
    let app = Metadata::from([("app".to_string(), tx_id.as_bytes().to_vec())]);
    w.add_token_request(tx_id, format!("request-{}", tx_id).as_bytes(), &app, &Metadata::new(), b"pp")
        .await
        .unwrap();
    for record in records {
        w.add_transaction(record).await.unwrap();
    }
    w.commit().await.unwrap();
}
