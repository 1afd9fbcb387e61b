//! Reconciliation between local storage and the ledger
//!
//! Each [`Checker`] returns human-readable discrepancy messages. A hard error
//! is reserved for infrastructure failures and structurally impossible
//! answers; [`ChecksService`] stops at the first one and names the checker.
//!
//! The ledger, the token vaults and the token codec are collaborators owned by
//! the host; they are reached only through the traits below.

use crate::metrics::Metrics;
use crate::store::TransactionStore;
use crate::types::{
    Identity, LedgerStatus, QueryTransactionsParams, TokenId, TransactionRecord, TxStatus,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Name of the transaction status check
pub const TRANSACTION_CHECK: &str = "Transaction Check";
/// Name of the unspent token content check
pub const UNSPENT_TOKENS_CHECK: &str = "Unspent Tokens Check";
/// Name of the token spendability check
pub const TOKEN_SPENDABILITY_CHECK: &str = "Token Spendability Check";

/// Read-only view of the ledger
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Validity of `tx_id` as committed on the ledger
    async fn status(&self, tx_id: &str) -> Result<LedgerStatus>;

    /// Serialized content of `ids`, one entry per id, same order
    async fn query_tokens(&self, ids: &[TokenId]) -> Result<Vec<Vec<u8>>>;
}

/// Locally tracked unspent tokens
#[async_trait]
pub trait LocalTokenVault: Send + Sync {
    /// IDs of every unspent token
    async fn unspent_token_ids(&self) -> Result<Vec<TokenId>>;

    /// Locally stored serialized content of `ids`, same order
    async fn token_outputs(&self, ids: &[TokenId]) -> Result<Vec<(TokenId, Vec<u8>)>>;
}

/// Unspent token in ledger format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerToken {
    /// Token ID
    pub id: TokenId,
    /// Token format identifier
    pub format: String,
    /// Serialized token
    pub token: Vec<u8>,
    /// Serialized token metadata
    pub metadata: Vec<u8>,
}

/// Unspent tokens as held on the ledger side
#[async_trait]
pub trait LedgerTokenVault: Send + Sync {
    /// Every unspent ledger token
    async fn unspent_ledger_tokens(&self) -> Result<Vec<LedgerToken>>;
}

/// Token codec of the current token system
pub trait TokenService: Send + Sync {
    /// Formats this token system can spend
    fn supported_token_formats(&self) -> Vec<String>;

    /// Decode `token` and return its recipients
    fn deobfuscate(&self, token: &[u8], metadata: &[u8]) -> Result<Vec<Identity>>;
}

/// Resolves owner identities to verifiers
pub trait OwnerVerifierProvider: Send + Sync {
    /// Ok when a verifier for `owner` can be obtained
    fn owner_verifier(&self, owner: &Identity) -> Result<()>;
}

/// A single reconciliation pass
#[async_trait]
pub trait Checker: Send + Sync {
    /// Discrepancies found, or a hard error
    async fn check(&self) -> Result<Vec<String>>;
}

/// A checker with the name used in errors and logs
#[derive(Clone)]
pub struct NamedChecker {
    /// Display name
    pub name: String,
    /// The check itself
    pub checker: Arc<dyn Checker>,
}

impl NamedChecker {
    /// Pair `checker` with `name`
    pub fn new(name: impl Into<String>, checker: Arc<dyn Checker>) -> Self {
        Self {
            name: name.into(),
            checker,
        }
    }
}

impl std::fmt::Debug for NamedChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedChecker").field("name", &self.name).finish()
    }
}

/// Runs checkers in order and concatenates their messages
#[derive(Debug)]
pub struct ChecksService {
    checkers: Vec<NamedChecker>,
    metrics: Option<Metrics>,
}

impl ChecksService {
    /// Service over `checkers`
    pub fn new(checkers: Vec<NamedChecker>) -> Self {
        Self {
            checkers,
            metrics: None,
        }
    }

    /// Count reported discrepancies in `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run every checker; a hard error aborts the run
    pub async fn check(&self) -> Result<Vec<String>> {
        let mut messages = Vec::new();
        for named in &self.checkers {
            let found = named.checker.check().await.map_err(|e| Error::Check {
                name: named.name.clone(),
                source: Box::new(e),
            })?;
            for message in &found {
                tracing::warn!(checker = %named.name, "{}", message);
            }
            if let Some(metrics) = &self.metrics {
                metrics.check_discrepancies_total.inc_by(found.len() as u64);
            }
            messages.extend(found);
        }
        tracing::debug!(discrepancies = messages.len(), "checks finished");
        Ok(messages)
    }
}

/// The three standard checks, in their usual order
pub fn default_checkers(
    store: Arc<dyn TransactionStore>,
    ledger: Arc<dyn Ledger>,
    local_vault: Arc<dyn LocalTokenVault>,
    ledger_vault: Arc<dyn LedgerTokenVault>,
    tokens: Arc<dyn TokenService>,
    owners: Arc<dyn OwnerVerifierProvider>,
) -> Vec<NamedChecker> {
    vec![
        NamedChecker::new(
            TRANSACTION_CHECK,
            Arc::new(TransactionStatusCheck::new(store, ledger.clone())),
        ),
        NamedChecker::new(
            UNSPENT_TOKENS_CHECK,
            Arc::new(UnspentTokensCheck::new(local_vault, ledger)),
        ),
        NamedChecker::new(
            TOKEN_SPENDABILITY_CHECK,
            Arc::new(TokenSpendabilityCheck::new(ledger_vault, tokens, owners)),
        ),
    ]
}

/// Local transaction status against ledger validity
pub struct TransactionStatusCheck {
    store: Arc<dyn TransactionStore>,
    ledger: Arc<dyn Ledger>,
}

impl TransactionStatusCheck {
    /// Check `store` against `ledger`
    pub fn new(store: Arc<dyn TransactionStore>, ledger: Arc<dyn Ledger>) -> Self {
        Self { store, ledger }
    }
}

/// Whether `ledger` is an acceptable counterpart of `local`
fn statuses_agree(local: TxStatus, ledger: LedgerStatus) -> bool {
    match local {
        TxStatus::Confirmed => ledger == LedgerStatus::Valid,
        TxStatus::Deleted => matches!(ledger, LedgerStatus::Invalid | LedgerStatus::Unknown),
        TxStatus::Unknown => ledger == LedgerStatus::Unknown,
        TxStatus::Pending => matches!(ledger, LedgerStatus::Busy | LedgerStatus::Unknown),
    }
}

impl TransactionStatusCheck {
    async fn check_record(&self, record: &TransactionRecord) -> Result<Option<String>> {
        if self.store.get_token_request(&record.tx_id).await?.is_none() {
            return Err(Error::Other(format!(
                "token request [{}] is missing",
                record.tx_id
            )));
        }

        // a failed lookup counts as Unknown; the failure is kept for the message
        let (ledger, lookup_error) = match self.ledger.status(&record.tx_id).await {
            Ok(status) => (status, None),
            Err(e) => (LedgerStatus::Unknown, Some(e)),
        };
        if statuses_agree(record.status, ledger) {
            return Ok(None);
        }

        let mut message = format!(
            "transaction record [{}] is {} for vault but {} for the ledger",
            record.tx_id, record.status, ledger
        );
        if let Some(e) = lookup_error {
            message.push_str(&format!(" (failed to get ledger transaction status: {})", e));
        }
        Ok(Some(message))
    }
}

#[async_trait]
impl Checker for TransactionStatusCheck {
    async fn check(&self) -> Result<Vec<String>> {
        let mut messages = Vec::new();
        let mut it = self
            .store
            .query_transactions(QueryTransactionsParams::default())
            .await?;

        // every action row gets its own verdict
        while let Some(record) = it.next().await? {
            match self.check_record(&record).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e) => {
                    it.close();
                    return Err(e);
                }
            }
        }
        it.close();
        Ok(messages)
    }
}

/// Locally stored token content against ledger content
pub struct UnspentTokensCheck {
    local_vault: Arc<dyn LocalTokenVault>,
    ledger: Arc<dyn Ledger>,
}

impl UnspentTokensCheck {
    /// Compare `local_vault` with `ledger`
    pub fn new(local_vault: Arc<dyn LocalTokenVault>, ledger: Arc<dyn Ledger>) -> Self {
        Self { local_vault, ledger }
    }
}

#[async_trait]
impl Checker for UnspentTokensCheck {
    async fn check(&self) -> Result<Vec<String>> {
        let ids = self.local_vault.unspent_token_ids().await?;
        let ledger_content = match self.ledger.query_tokens(&ids).await {
            Ok(content) => content,
            Err(e) => return Ok(vec![format!("failed to query tokens: [{}]", e)]),
        };
        if ledger_content.len() != ids.len() {
            return Err(Error::Ledger(format!(
                "length difference: requested {} tokens, ledger returned {}",
                ids.len(),
                ledger_content.len()
            )));
        }

        let local = self.local_vault.token_outputs(&ids).await?;
        if local.len() != ids.len() {
            return Err(Error::Other(format!(
                "length difference: requested {} tokens, local vault returned {}",
                ids.len(),
                local.len()
            )));
        }
        let mut messages = Vec::new();
        for (index, ((id, raw), on_ledger)) in local.iter().zip(&ledger_content).enumerate() {
            if raw != on_ledger {
                messages.push(format!(
                    "token content does not match at [{}][{}], [{}]",
                    id,
                    index,
                    blake3::hash(raw).to_hex()
                ));
            }
        }
        Ok(messages)
    }
}

/// Whether every unspent ledger token can still be spent
pub struct TokenSpendabilityCheck {
    ledger_vault: Arc<dyn LedgerTokenVault>,
    tokens: Arc<dyn TokenService>,
    owners: Arc<dyn OwnerVerifierProvider>,
}

impl TokenSpendabilityCheck {
    /// Check tokens of `ledger_vault` with the codec and owner resolution given
    pub fn new(
        ledger_vault: Arc<dyn LedgerTokenVault>,
        tokens: Arc<dyn TokenService>,
        owners: Arc<dyn OwnerVerifierProvider>,
    ) -> Self {
        Self {
            ledger_vault,
            tokens,
            owners,
        }
    }
}

#[async_trait]
impl Checker for TokenSpendabilityCheck {
    async fn check(&self) -> Result<Vec<String>> {
        let supported: HashSet<String> =
            self.tokens.supported_token_formats().into_iter().collect();
        let unspent = self.ledger_vault.unspent_ledger_tokens().await?;
        tracing::debug!(tokens = unspent.len(), formats = ?supported, "checking token spendability");

        let mut messages = Vec::new();
        for tok in unspent {
            if !supported.contains(&tok.format) {
                messages.push(format!("token format not supported [{}][{}]", tok.id, tok.format));
                continue;
            }

            let recipients = match self.tokens.deobfuscate(&tok.token, &tok.metadata) {
                Ok(recipients) => recipients,
                Err(e) => {
                    messages.push(format!(
                        "failed to deobfuscate token [{}][{}], [{}]",
                        tok.id, tok.format, e
                    ));
                    continue;
                }
            };
            if recipients.is_empty() {
                messages.push(format!(
                    "token recipient list is empty for [{}][{}]",
                    tok.id, tok.format
                ));
                continue;
            }
            for recipient in &recipients {
                if let Err(e) = self.owners.owner_verifier(recipient) {
                    messages.push(format!(
                        "failed to verify recipient [{}][{}][{}], [{}]",
                        tok.id, recipient, tok.format, e
                    ));
                }
            }
        }
        Ok(messages)
    }
}
