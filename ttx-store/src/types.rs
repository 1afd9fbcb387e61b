//! Core types for the transaction store
//!
//! Status and action codes are stored as integers; the numeric values are part
//! of the persisted format and must not be reordered.

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Application or public metadata attached to a request or validation
pub type Metadata = HashMap<String, Vec<u8>>;

/// Status of a token transaction, shared by every record of a `tx_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(i32)]
pub enum TxStatus {
    /// Never seen, or not yet assigned
    #[default]
    Unknown = 0,
    /// Submitted to the ledger, awaiting finality
    Pending = 1,
    /// Committed by the ledger
    Confirmed = 2,
    /// Rejected or abandoned
    Deleted = 3,
}

impl TxStatus {
    /// Stored integer code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a stored code; unrecognised codes read as `Unknown`
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => TxStatus::Pending,
            2 => TxStatus::Confirmed,
            3 => TxStatus::Deleted,
            _ => TxStatus::Unknown,
        }
    }

    /// Human-readable name
    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Unknown => "Unknown",
            TxStatus::Pending => "Pending",
            TxStatus::Confirmed => "Confirmed",
            TxStatus::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of token action a transaction record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ActionType {
    /// Tokens created
    Issue = 0,
    /// Tokens moved between owners
    Transfer = 1,
    /// Tokens destroyed
    Redeem = 2,
}

impl ActionType {
    /// Stored integer code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a stored code
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ActionType::Issue),
            1 => Some(ActionType::Transfer),
            2 => Some(ActionType::Redeem),
            _ => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionType::Issue => "Issue",
            ActionType::Transfer => "Transfer",
            ActionType::Redeem => "Redeem",
        };
        f.write_str(name)
    }
}

/// Validity of a transaction as reported by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerStatus {
    /// Ledger has no record of the transaction
    Unknown,
    /// Committed and valid
    Valid,
    /// Committed and invalid
    Invalid,
    /// Still being processed
    Busy,
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LedgerStatus::Unknown => "Unknown",
            LedgerStatus::Valid => "Valid",
            LedgerStatus::Invalid => "Invalid",
            LedgerStatus::Busy => "Busy",
        };
        f.write_str(name)
    }
}

/// Token identifier: output `index` of transaction `tx_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId {
    /// Transaction that created the token
    pub tx_id: String,
    /// Output index within that transaction
    pub index: u64,
}

impl TokenId {
    /// Create new token ID
    pub fn new(tx_id: impl Into<String>, index: u64) -> Self {
        Self {
            tx_id: tx_id.into(),
            index,
        }
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.index)
    }
}

/// Serialized owner/signer identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(Vec<u8>);

impl Identity {
    /// Wrap raw identity bytes
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self(raw.into())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Stable hash used as cache and table key
    pub fn unique_id(&self) -> String {
        blake3::hash(&self.0).to_hex().to_string()
    }

    /// True when no bytes are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Identity {
    fn from(raw: &[u8]) -> Self {
        Self(raw.to_vec())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_id())
    }
}

/// One action/enrollment pair of a token transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction ID
    pub tx_id: String,
    /// Action kind
    pub action_type: ActionType,
    /// Enrollment ID of the sender (empty for issues)
    pub sender_eid: String,
    /// Enrollment ID of the recipient (empty for redeems)
    pub recipient_eid: String,
    /// Token type
    pub token_type: String,
    /// Quantity moved
    pub amount: BigInt,
    /// When the action happened; persisted as `stored_at`
    pub timestamp: DateTime<Utc>,
    /// Status of the owning request (read only, joined on query)
    pub status: TxStatus,
    /// Application metadata of the owning request (read only, joined on query)
    #[serde(default)]
    pub application_metadata: Metadata,
}

/// Net movement of a token type for one enrollment in a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementRecord {
    /// Transaction ID
    pub tx_id: String,
    /// Enrollment ID whose balance moved
    pub enrollment_id: String,
    /// Token type
    pub token_type: String,
    /// Negative when sent, positive when received
    pub amount: BigInt,
    /// Status of the owning request (read only, joined on query)
    pub status: TxStatus,
}

/// Outcome of validating a token request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    /// Transaction ID
    pub tx_id: String,
    /// Serialized token request that was validated
    pub token_request: Vec<u8>,
    /// Validation metadata
    pub metadata: Metadata,
    /// When the record was stored
    pub timestamp: DateTime<Utc>,
    /// Status of the owning request
    pub status: TxStatus,
}

/// Root fact for a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRequestRecord {
    /// Transaction ID
    pub tx_id: String,
    /// Serialized token request
    pub request: Vec<u8>,
    /// Current status
    pub status: TxStatus,
}

/// Notification published when a transaction's status changes
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    /// Transaction ID
    pub tx_id: String,
    /// New status
    pub status: TxStatus,
    /// Status message, may be empty
    pub message: String,
}

/// Order in which movements are returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SearchDirection {
    /// Oldest first
    #[default]
    FromBeginning,
    /// Newest first
    FromLast,
}

/// Which movement amounts to select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MovementDirection {
    /// Negative amounts only
    Sent,
    /// Positive amounts only
    Received,
    /// Both
    #[default]
    All,
}

/// Filter for transaction queries
///
/// `sender_wallet` and `recipient_wallet` only filter when both are set, in
/// which case a record matches if either side matches. Setting just one of
/// them selects everything.
#[derive(Debug, Clone, Default)]
pub struct QueryTransactionsParams {
    /// Restrict to these transaction IDs
    pub ids: Vec<String>,
    /// Inclusive lower bound on `stored_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `stored_at`
    pub to: Option<DateTime<Utc>>,
    /// Accepted action types; empty means all
    pub action_types: Vec<ActionType>,
    /// Accepted statuses; empty means all
    pub statuses: Vec<TxStatus>,
    /// Sender enrollment ID
    pub sender_wallet: Option<String>,
    /// Recipient enrollment ID
    pub recipient_wallet: Option<String>,
}

impl QueryTransactionsParams {
    /// Wallet pair to match, present only when both sides are set
    pub fn wallet_pair(&self) -> Option<(&str, &str)> {
        match (&self.sender_wallet, &self.recipient_wallet) {
            (Some(s), Some(r)) if !s.is_empty() && !r.is_empty() => Some((s, r)),
            _ => None,
        }
    }
}

/// Filter for movement queries
#[derive(Debug, Clone, Default)]
pub struct QueryMovementsParams {
    /// Accepted enrollment IDs; empty means all
    pub enrollment_ids: Vec<String>,
    /// Accepted token types; empty means all
    pub token_types: Vec<String>,
    /// Accepted statuses; empty means everything except `Deleted`
    pub tx_statuses: Vec<TxStatus>,
    /// Result ordering
    pub search_direction: SearchDirection,
    /// Sign filter on the amount
    pub movement_direction: MovementDirection,
    /// Maximum number of records; 0 means no limit
    pub num_records: usize,
}

impl QueryMovementsParams {
    /// Whether a movement with `status` passes the status filter
    pub fn accepts_status(&self, status: TxStatus) -> bool {
        if self.tx_statuses.is_empty() {
            status != TxStatus::Deleted
        } else {
            self.tx_statuses.contains(&status)
        }
    }
}

/// Caller-supplied predicate over validation records
pub type ValidationFilter = Arc<dyn Fn(&ValidationRecord) -> bool + Send + Sync>;

/// Filter for validation queries
#[derive(Clone, Default)]
pub struct QueryValidationRecordsParams {
    /// Inclusive lower bound on `stored_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `stored_at`
    pub to: Option<DateTime<Utc>>,
    /// Accepted statuses; empty means all
    pub statuses: Vec<TxStatus>,
    /// Applied to every record after the storage-level filter
    pub filter: Option<ValidationFilter>,
}

impl fmt::Debug for QueryValidationRecordsParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryValidationRecordsParams")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("statuses", &self.statuses)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// True when `ts` lies in `[from, to)`
pub(crate) fn in_time_range(
    ts: DateTime<Utc>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> bool {
    from.map_or(true, |from| ts >= from) && to.map_or(true, |to| ts < to)
}
