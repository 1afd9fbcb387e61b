//! Reconciliation of a populated store against a scripted ledger

#[macro_use]
mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::{commit_request, transfer};
use std::collections::HashMap;
use std::sync::Arc;
use ttx_store::checks::{
    default_checkers, ChecksService, Ledger, LedgerToken, LedgerTokenVault, LocalTokenVault,
    OwnerVerifierProvider, TokenService, TRANSACTION_CHECK,
};
use ttx_store::{Error, Identity, LedgerStatus, Persistence, Result, TokenId, TxStatus};

struct ScriptedLedger {
    statuses: HashMap<String, LedgerStatus>,
    tokens: HashMap<TokenId, Vec<u8>>,
}

#[async_trait]
impl Ledger for ScriptedLedger {
    async fn status(&self, tx_id: &str) -> Result<LedgerStatus> {
        Ok(self
            .statuses
            .get(tx_id)
            .copied()
            .unwrap_or(LedgerStatus::Unknown))
    }

    async fn query_tokens(&self, ids: &[TokenId]) -> Result<Vec<Vec<u8>>> {
        ids.iter()
            .map(|id| {
                self.tokens
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::Ledger(format!("token [{}] not found", id)))
            })
            .collect()
    }
}

struct Vault(Vec<(TokenId, Vec<u8>)>);

#[async_trait]
impl LocalTokenVault for Vault {
    async fn unspent_token_ids(&self) -> Result<Vec<TokenId>> {
        Ok(self.0.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn token_outputs(&self, ids: &[TokenId]) -> Result<Vec<(TokenId, Vec<u8>)>> {
        Ok(self
            .0
            .iter()
            .filter(|(id, _)| ids.contains(id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LedgerTokenVault for Vault {
    async fn unspent_ledger_tokens(&self) -> Result<Vec<LedgerToken>> {
        Ok(self
            .0
            .iter()
            .map(|(id, token)| LedgerToken {
                id: id.clone(),
                format: "plain".into(),
                token: token.clone(),
                metadata: Vec::new(),
            })
            .collect())
    }
}

struct PlainTokens;

impl TokenService for PlainTokens {
    fn supported_token_formats(&self) -> Vec<String> {
        vec!["plain".into()]
    }

    fn deobfuscate(&self, token: &[u8], _metadata: &[u8]) -> Result<Vec<Identity>> {
        Ok(vec![Identity::new(token.to_vec())])
    }
}

struct AnyOwner;

impl OwnerVerifierProvider for AnyOwner {
    fn owner_verifier(&self, _owner: &Identity) -> Result<()> {
        Ok(())
    }
}

fn service(p: &Persistence, ledger: ScriptedLedger) -> ChecksService {
    let vault = Arc::new(Vault(vec![(TokenId::new("tx1", 0), b"alice".to_vec())]));
    ChecksService::new(default_checkers(
        p.transactions.clone(),
        Arc::new(ledger),
        vault.clone(),
        vault,
        Arc::new(PlainTokens),
        Arc::new(AnyOwner),
    ))
    .with_metrics(p.metrics.clone())
}

async fn consistent_store_reports_nothing(p: &Persistence) {
    commit_request(p, "tx1", &[transfer("tx1", "alice", "bob", 5, Utc::now())]).await;
    p.transactions.set_status("tx1", TxStatus::Confirmed, "").await.unwrap();

    let ledger = ScriptedLedger {
        statuses: HashMap::from([("tx1".to_string(), LedgerStatus::Valid)]),
        tokens: HashMap::from([(TokenId::new("tx1", 0), b"alice".to_vec())]),
    };
    assert!(service(p, ledger).check().await.unwrap().is_empty());
    assert_eq!(p.metrics.check_discrepancies_total.get(), 0);
}
on_both_backends!(consistent_store_reports_nothing);

async fn divergent_store_reports_each_problem(p: &Persistence) {
    // two action rows, a verdict for each
    commit_request(
        p,
        "tx1",
        &[
            transfer("tx1", "alice", "bob", 5, Utc::now()),
            transfer("tx1", "alice", "carol", 1, Utc::now()),
        ],
    )
    .await;
    p.transactions.set_status("tx1", TxStatus::Confirmed, "").await.unwrap();

    let ledger = ScriptedLedger {
        statuses: HashMap::from([("tx1".to_string(), LedgerStatus::Invalid)]),
        tokens: HashMap::from([(TokenId::new("tx1", 0), b"mallory".to_vec())]),
    };
    let messages = service(p, ledger).check().await.unwrap();
    assert_eq!(messages.len(), 3, "{:?}", messages);
    for message in &messages[..2] {
        assert_eq!(
            message,
            "transaction record [tx1] is Confirmed for vault but Invalid for the ledger"
        );
    }
    assert!(messages[2].contains("tx1:0"), "{}", messages[2]);
    assert_eq!(p.metrics.check_discrepancies_total.get(), 3);
}
on_both_backends!(divergent_store_reports_each_problem);

async fn ledger_failures_and_broken_checkers(p: &Persistence) {
    // a pending transaction the ledger never heard of is fine
    commit_request(p, "tx1", &[transfer("tx1", "alice", "bob", 5, Utc::now())]).await;
    let ledger = ScriptedLedger {
        statuses: HashMap::new(),
        tokens: HashMap::from([(TokenId::new("tx1", 0), b"alice".to_vec())]),
    };
    assert!(service(p, ledger).check().await.unwrap().is_empty());

    let failing = ScriptedLedger {
        statuses: HashMap::new(),
        tokens: HashMap::new(),
    };
    let messages = service(p, failing).check().await.unwrap();
    assert_eq!(messages.len(), 1);

    // an error from a checker carries the checker name
    struct Broken;
    #[async_trait]
    impl ttx_store::checks::Checker for Broken {
        async fn check(&self) -> Result<Vec<String>> {
            Err(Error::Other("boom".into()))
        }
    }
    let broken = ChecksService::new(vec![ttx_store::checks::NamedChecker::new(
        TRANSACTION_CHECK,
        Arc::new(Broken),
    )]);
    match broken.check().await.unwrap_err() {
        Error::Check { name, .. } => assert_eq!(name, TRANSACTION_CHECK),
        other => panic!("unexpected error: {}", other),
    }
}
on_both_backends!(ledger_failures_and_broken_checkers);
