//! Table names and DDL for the SQLite backend
//!
//! Timestamps are INTEGER microseconds since the Unix epoch so that range
//! filters and ordering compare numerically.

/// Names of every table, derived from a common prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Token requests and the authoritative status
    pub requests: String,
    /// Transaction records
    pub transactions: String,
    /// Movement records
    pub movements: String,
    /// Validation records
    pub validations: String,
    /// Endorsement acknowledgements
    pub endorse_acks: String,
    /// Token locks
    pub token_locks: String,
    /// Identity configurations
    pub identity_configurations: String,
    /// Identity audit data
    pub identity_info: String,
    /// Signer info
    pub signers: String,
}

impl TableNames {
    /// Names with `prefix` prepended; an empty prefix yields the bare names
    pub fn with_prefix(prefix: &str) -> Self {
        let name = |table: &str| {
            if prefix.is_empty() {
                table.to_string()
            } else {
                format!("{}_{}", prefix, table)
            }
        };
        Self {
            requests: name("requests"),
            transactions: name("transactions"),
            movements: name("movements"),
            validations: name("validations"),
            endorse_acks: name("transaction_endorsement_ack"),
            token_locks: name("token_locks"),
            identity_configurations: name("identity_configurations"),
            identity_info: name("identity_information"),
            signers: name("identity_signers"),
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self::with_prefix("")
    }
}

/// `CREATE` statements, one per element
pub fn statements(t: &TableNames) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                tx_id TEXT NOT NULL PRIMARY KEY,
                request BLOB NOT NULL,
                status INTEGER NOT NULL,
                status_message TEXT NOT NULL,
                application_metadata TEXT NOT NULL,
                public_metadata TEXT NOT NULL,
                pp_hash BLOB NOT NULL
            )",
            t.requests
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT NOT NULL PRIMARY KEY,
                tx_id TEXT NOT NULL REFERENCES {}(tx_id),
                action_type INTEGER NOT NULL,
                sender_eid TEXT NOT NULL,
                recipient_eid TEXT NOT NULL,
                token_type TEXT NOT NULL,
                amount INTEGER NOT NULL,
                stored_at INTEGER NOT NULL
            )",
            t.transactions, t.requests
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_tx_id_{0} ON {0} (tx_id)",
            t.transactions
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_stored_at_{0} ON {0} (stored_at)",
            t.transactions
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT NOT NULL PRIMARY KEY,
                tx_id TEXT NOT NULL REFERENCES {}(tx_id),
                enrollment_id TEXT NOT NULL,
                token_type TEXT NOT NULL,
                amount INTEGER NOT NULL,
                stored_at INTEGER NOT NULL
            )",
            t.movements, t.requests
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_tx_id_{0} ON {0} (tx_id)",
            t.movements
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                tx_id TEXT NOT NULL PRIMARY KEY REFERENCES {}(tx_id),
                metadata BLOB NOT NULL,
                stored_at INTEGER NOT NULL
            )",
            t.validations, t.requests
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT NOT NULL PRIMARY KEY,
                tx_id TEXT NOT NULL,
                endorser BLOB NOT NULL,
                sigma BLOB NOT NULL,
                stored_at INTEGER NOT NULL
            )",
            t.endorse_acks
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_tx_id_{0} ON {0} (tx_id)",
            t.endorse_acks
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                tx_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                consumer_tx_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (tx_id, idx)
            )",
            t.token_locks
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_consumer_{0} ON {0} (consumer_tx_id)",
            t.token_locks
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT NOT NULL,
                type TEXT NOT NULL,
                url TEXT NOT NULL,
                conf BLOB,
                raw BLOB,
                PRIMARY KEY (id, type)
            )",
            t.identity_configurations
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                identity_hash TEXT NOT NULL PRIMARY KEY,
                identity BLOB NOT NULL,
                identity_audit_info BLOB NOT NULL,
                token_metadata BLOB,
                token_metadata_audit_info BLOB
            )",
            t.identity_info
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                identity_hash TEXT NOT NULL PRIMARY KEY,
                identity BLOB NOT NULL,
                info BLOB
            )",
            t.signers
        ),
    ]
}
