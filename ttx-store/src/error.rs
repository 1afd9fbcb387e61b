//! Error types for the transaction store

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Store errors
#[derive(Error, Debug)]
pub enum Error {
    /// A transaction, movement or validation record referenced a request that was never stored
    #[error("token request does not exist: {0}")]
    TokenRequestDoesNotExist(String),

    /// Amount does not fit the storage column (signed 64-bit)
    #[error("amount {amount} of transaction {tx_id} exceeds the supported int64 range")]
    AmountOverflow {
        /// Transaction the amount belongs to
        tx_id: String,
        /// Offending amount, decimal rendering
        amount: String,
    },

    /// Token is already reserved by another consumer transaction
    #[error("token {token} is already locked (requested by {consumer})")]
    LockConflict {
        /// Token identifier, `tx_id:index`
        token: String,
        /// Consumer that attempted the lock
        consumer: String,
    },

    /// Writer was already committed or rolled back
    #[error("no db transaction in progress")]
    NoTransactionInProgress,

    /// Storage engine error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error (metadata maps)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ledger or token vault collaborator failed
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// A named checker failed hard
    #[error("failed checking with checker [{name}]: {source}")]
    Check {
        /// Checker name
        name: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for referential-integrity failures
    pub fn is_token_request_missing(&self) -> bool {
        matches!(self, Error::TokenRequestDoesNotExist(_))
    }

    /// True when a lock attempt lost against an existing holder
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Error::LockConflict { .. })
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
