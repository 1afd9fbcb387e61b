//! Property-based tests for store invariants
//!
//! - Movements are persisted exactly: no loss, no duplication
//! - The last status written wins, however often it is repeated
//! - A token has at most one lock holder

use num_bigint::BigInt;
use proptest::prelude::*;
use std::collections::HashSet;
use ttx_store::config::Config;
use ttx_store::{
    Metadata, MovementRecord, Persistence, QueryMovementsParams, TokenId, TxStatus,
};

fn status_strategy() -> impl Strategy<Value = TxStatus> {
    prop_oneof![
        Just(TxStatus::Pending),
        Just(TxStatus::Confirmed),
        Just(TxStatus::Deleted),
    ]
}

fn movement_strategy() -> impl Strategy<Value = (String, i64)> {
    ("(alice|bob|carol)", -1_000_000i64..1_000_000i64)
}

async fn open_memory() -> Persistence {
    Persistence::open(&Config::memory()).await.unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every committed movement comes back, with its amount intact
    #[test]
    fn prop_movements_are_conserved(moves in prop::collection::vec(movement_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let p = open_memory().await;
            let mut w = p.transactions.begin_atomic_write().await.unwrap();
            w.add_token_request("tx", b"req", &Metadata::new(), &Metadata::new(), b"")
                .await
                .unwrap();
            for (eid, amount) in &moves {
                w.add_movement(&MovementRecord {
                    tx_id: "tx".into(),
                    enrollment_id: eid.clone(),
                    token_type: "USD".into(),
                    amount: BigInt::from(*amount),
                    status: TxStatus::Pending,
                })
                .await
                .unwrap();
            }
            w.commit().await.unwrap();

            let stored = p
                .transactions
                .query_movements(QueryMovementsParams::default())
                .await
                .unwrap();
            prop_assert_eq!(stored.len(), moves.len());

            let expected: BigInt = moves.iter().map(|(_, a)| BigInt::from(*a)).sum();
            let actual: BigInt = stored.iter().map(|m| m.amount.clone()).sum();
            prop_assert_eq!(actual, expected);
            Ok(())
        })?;
    }

    /// Property: status is whatever was written last
    #[test]
    fn prop_last_status_wins(statuses in prop::collection::vec(status_strategy(), 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let p = open_memory().await;
            let mut w = p.transactions.begin_atomic_write().await.unwrap();
            w.add_token_request("tx", b"req", &Metadata::new(), &Metadata::new(), b"")
                .await
                .unwrap();
            w.commit().await.unwrap();

            for status in &statuses {
                p.transactions.set_status("tx", *status, "").await.unwrap();
                p.transactions.set_status("tx", *status, "").await.unwrap();
            }

            let (status, _) = p.transactions.get_status("tx").await.unwrap();
            prop_assert_eq!(Some(&status), statuses.last());
            Ok(())
        })?;
    }

    /// Property: lock attempts succeed once per distinct token
    #[test]
    fn prop_one_holder_per_token(attempts in prop::collection::vec((0u64..8, 0u8..4), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let p = open_memory().await;
            let mut granted = 0usize;
            for (index, consumer) in &attempts {
                let token = TokenId::new("src", *index);
                if p.locks.lock(&token, &format!("tx{}", consumer)).await.is_ok() {
                    granted += 1;
                }
            }

            let distinct: HashSet<_> = attempts.iter().map(|(index, _)| *index).collect();
            prop_assert_eq!(granted, distinct.len());
            Ok(())
        })?;
    }
}
