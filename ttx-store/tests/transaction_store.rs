//! Behaviour of the transaction store, run against SQLite and memory
//!
//! - Status lives on the request row and shows through every join
//! - Dependent records require their request
//! - Query filters: half-open time range, sender/recipient OR, status sets

#[macro_use]
mod common;

use chrono::{Duration, Utc};
use common::{commit_request, transfer};
use num_bigint::BigInt;
use std::sync::Arc;
use tokio::sync::mpsc;
use ttx_store::store::collect_all;
use ttx_store::types::ValidationFilter;
use ttx_store::{
    Error, Identity, Metadata, MovementDirection, MovementRecord, Persistence,
    QueryMovementsParams, QueryTransactionsParams, QueryValidationRecordsParams, SearchDirection,
    TxStatus,
};

fn movement(tx_id: &str, eid: &str, amount: i64) -> MovementRecord {
    MovementRecord {
        tx_id: tx_id.to_string(),
        enrollment_id: eid.to_string(),
        token_type: "USD".to_string(),
        amount: BigInt::from(amount),
        status: TxStatus::Pending,
    }
}

async fn confirmed_status_is_visible_everywhere(p: &Persistence) {
    commit_request(p, "tx1", &[transfer("tx1", "alice", "bob", 10, Utc::now())]).await;
    assert_eq!(
        p.transactions.get_status("tx1").await.unwrap(),
        (TxStatus::Pending, String::new())
    );

    p.transactions
        .set_status("tx1", TxStatus::Confirmed, "ok")
        .await
        .unwrap();
    // same call again changes nothing
    assert!(!p
        .transactions
        .set_status("tx1", TxStatus::Confirmed, "ok")
        .await
        .unwrap());
    assert_eq!(
        p.transactions.get_status("tx1").await.unwrap(),
        (TxStatus::Confirmed, "ok".to_string())
    );

    let records = collect_all(
        p.transactions
            .query_transactions(QueryTransactionsParams {
                ids: vec!["tx1".into()],
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TxStatus::Confirmed);
    assert_eq!(records[0].amount, BigInt::from(10));
    assert_eq!(records[0].application_metadata["app"], b"tx1".to_vec());

    // an empty message keeps the stored one
    p.transactions
        .set_status("tx1", TxStatus::Deleted, "")
        .await
        .unwrap();
    assert_eq!(
        p.transactions.get_status("tx1").await.unwrap(),
        (TxStatus::Deleted, "ok".to_string())
    );
}
on_both_backends!(confirmed_status_is_visible_everywhere);

async fn racing_identical_status_updates_change_state_once(p: &Persistence) {
    commit_request(p, "tx1", &[]).await;

    let (a, b) = tokio::join!(
        p.transactions.set_status("tx1", TxStatus::Confirmed, "ok"),
        p.transactions.set_status("tx1", TxStatus::Confirmed, "ok"),
    );
    let changed = [a.unwrap(), b.unwrap()];
    assert_eq!(changed.iter().filter(|c| **c).count(), 1, "{:?}", changed);

    // the notifying service sees the same single change
    let service = p.service();
    let (tx, mut rx) = mpsc::channel(4);
    service.add_status_listener("tx1", tx);
    let (a, b) = tokio::join!(
        service.set_status("tx1", TxStatus::Deleted, "gone"),
        service.set_status("tx1", TxStatus::Deleted, "gone"),
    );
    a.unwrap();
    b.unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.status, TxStatus::Deleted);
    assert_eq!(event.message, "gone");
    assert!(rx.try_recv().is_err());

    // only the message differs: still a change
    assert!(p
        .transactions
        .set_status("tx1", TxStatus::Deleted, "purged")
        .await
        .unwrap());
    assert!(!p
        .transactions
        .set_status("tx1", TxStatus::Deleted, "")
        .await
        .unwrap());
}
on_both_backends!(racing_identical_status_updates_change_state_once);

async fn unknown_transactions_report_unknown(p: &Persistence) {
    assert_eq!(
        p.transactions.get_status("never-seen").await.unwrap(),
        (TxStatus::Unknown, String::new())
    );
    // silent no-op
    assert!(!p
        .transactions
        .set_status("never-seen", TxStatus::Confirmed, "x")
        .await
        .unwrap());
    assert_eq!(
        p.transactions.get_status("never-seen").await.unwrap().0,
        TxStatus::Unknown
    );
    assert!(p.transactions.get_token_request("never-seen").await.unwrap().is_none());
}
on_both_backends!(unknown_transactions_report_unknown);

async fn missing_request_fails_and_rollback_leaves_nothing(p: &Persistence) {
    let mut w = p.transactions.begin_atomic_write().await.unwrap();
    w.add_token_request("txA", b"req", &Metadata::new(), &Metadata::new(), b"")
        .await
        .unwrap();
    w.add_movement(&movement("txA", "alice", -5)).await.unwrap();

    let err = w.add_movement(&movement("ghost", "alice", 5)).await.unwrap_err();
    assert!(err.is_token_request_missing(), "unexpected error: {}", err);
    let err = w
        .add_transaction(&transfer("ghost", "alice", "bob", 5, Utc::now()))
        .await
        .unwrap_err();
    assert!(err.is_token_request_missing());
    let err = w.add_validation_record("ghost", &Metadata::new()).await.unwrap_err();
    assert!(err.is_token_request_missing());

    w.rollback().await;
    // idempotent
    w.rollback().await;

    assert_eq!(p.transactions.get_status("txA").await.unwrap().0, TxStatus::Unknown);
    assert!(p.transactions.query_token_requests(&[]).await.unwrap().is_empty());
    assert!(p
        .transactions
        .query_movements(QueryMovementsParams::default())
        .await
        .unwrap()
        .is_empty());
}
on_both_backends!(missing_request_fails_and_rollback_leaves_nothing);

async fn records_may_reference_earlier_commits(p: &Persistence) {
    commit_request(p, "tx1", &[]).await;

    let mut w = p.transactions.begin_atomic_write().await.unwrap();
    w.add_movement(&movement("tx1", "bob", 7)).await.unwrap();
    w.add_validation_record("tx1", &Metadata::from([("k".to_string(), vec![1])]))
        .await
        .unwrap();
    w.commit().await.unwrap();

    // finalized writers refuse further use
    assert!(matches!(w.commit().await, Err(Error::NoTransactionInProgress)));
    assert!(matches!(
        w.add_movement(&movement("tx1", "bob", 1)).await,
        Err(Error::NoTransactionInProgress)
    ));
    w.rollback().await;

    let moves = p
        .transactions
        .query_movements(QueryMovementsParams::default())
        .await
        .unwrap();
    assert_eq!(moves.len(), 1);
}
on_both_backends!(records_may_reference_earlier_commits);

async fn dropped_writer_discards(p: &Persistence) {
    {
        let mut w = p.transactions.begin_atomic_write().await.unwrap();
        w.add_token_request("txD", b"req", &Metadata::new(), &Metadata::new(), b"")
            .await
            .unwrap();
    }
    // give the backend a moment to roll back the abandoned transaction
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(p.transactions.get_token_request("txD").await.unwrap().is_none());
}
on_both_backends!(dropped_writer_discards);

async fn amounts_beyond_i64_are_rejected(p: &Persistence) {
    let mut w = p.transactions.begin_atomic_write().await.unwrap();
    w.add_token_request("big", b"req", &Metadata::new(), &Metadata::new(), b"")
        .await
        .unwrap();
    let mut record = transfer("big", "alice", "bob", 0, Utc::now());
    record.amount = BigInt::from(i64::MAX) + 1;
    let err = w.add_transaction(&record).await.unwrap_err();
    assert!(matches!(err, Error::AmountOverflow { .. }));

    let mut m = movement("big", "alice", 0);
    m.amount = BigInt::from(i64::MIN) - 1;
    assert!(matches!(
        w.add_movement(&m).await,
        Err(Error::AmountOverflow { .. })
    ));

    // the writer stays usable
    record.amount = BigInt::from(i64::MAX);
    w.add_transaction(&record).await.unwrap();
    w.commit().await.unwrap();

    let records = collect_all(
        p.transactions
            .query_transactions(QueryTransactionsParams::default())
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(records[0].amount, BigInt::from(i64::MAX));
}
on_both_backends!(amounts_beyond_i64_are_rejected);

async fn sender_recipient_filter_is_an_or(p: &Persistence) {
    let now = Utc::now();
    commit_request(p, "tx1", &[transfer("tx1", "alice", "bob", 1, now)]).await;
    commit_request(p, "tx2", &[transfer("tx2", "carol", "alice", 2, now)]).await;
    commit_request(p, "tx3", &[transfer("tx3", "bob", "carol", 3, now)]).await;

    let count = |params: QueryTransactionsParams| async move {
        collect_all(p.transactions.query_transactions(params).await.unwrap())
            .await
            .unwrap()
            .len()
    };

    let both = QueryTransactionsParams {
        sender_wallet: Some("alice".into()),
        recipient_wallet: Some("alice".into()),
        ..Default::default()
    };
    let year_ago = QueryTransactionsParams {
        from: Some(now - Duration::days(365)),
        ..both.clone()
    };
    assert_eq!(count(both).await, 2);
    assert_eq!(count(year_ago).await, 2);

    // a single side does not filter at all
    let sender_only = QueryTransactionsParams {
        sender_wallet: Some("alice".into()),
        ..Default::default()
    };
    assert_eq!(count(sender_only).await, 3);
}
on_both_backends!(sender_recipient_filter_is_an_or);

async fn time_range_is_half_open(p: &Persistence) {
    let t0 = Utc::now() - Duration::hours(2);
    let t1 = t0 + Duration::hours(1);
    commit_request(
        p,
        "tx1",
        &[
            transfer("tx1", "alice", "bob", 1, t0),
            transfer("tx1", "alice", "carol", 2, t1),
        ],
    )
    .await;

    let records = collect_all(
        p.transactions
            .query_transactions(QueryTransactionsParams {
                from: Some(t0),
                to: Some(t1),
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].recipient_eid, "bob");

    let pending_only = collect_all(
        p.transactions
            .query_transactions(QueryTransactionsParams {
                statuses: vec![TxStatus::Confirmed],
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert!(pending_only.is_empty());
}
on_both_backends!(time_range_is_half_open);

async fn transactions_come_back_in_time_order_across_pages(p: &Persistence) {
    let start = Utc::now() - Duration::days(1);
    // more rows than one cursor page, inserted newest first
    let records: Vec<_> = (0..300)
        .rev()
        .map(|i| transfer("bulk", "alice", "bob", i, start + Duration::seconds(i)))
        .collect();
    commit_request(p, "bulk", &records).await;

    let mut it = p
        .transactions
        .query_transactions(QueryTransactionsParams::default())
        .await
        .unwrap();
    let mut seen = 0i64;
    while let Some(record) = it.next().await.unwrap() {
        assert_eq!(record.amount, BigInt::from(seen));
        seen += 1;
    }
    it.close();
    assert_eq!(seen, 300);
    assert!(it.next().await.unwrap().is_none());
}
on_both_backends!(transactions_come_back_in_time_order_across_pages);

async fn movement_queries(p: &Persistence) {
    for (tx_id, amount) in [("m1", -10), ("m2", 20), ("m3", -30), ("m4", 40)] {
        let mut w = p.transactions.begin_atomic_write().await.unwrap();
        w.add_token_request(tx_id, b"req", &Metadata::new(), &Metadata::new(), b"")
            .await
            .unwrap();
        w.add_movement(&movement(tx_id, "alice", amount)).await.unwrap();
        w.commit().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    p.transactions.set_status("m4", TxStatus::Deleted, "").await.unwrap();

    let amounts = |moves: Vec<MovementRecord>| -> Vec<i64> {
        moves
            .into_iter()
            .map(|m| i64::try_from(&m.amount).unwrap())
            .collect()
    };

    // Deleted is hidden unless asked for
    let all = p
        .transactions
        .query_movements(QueryMovementsParams::default())
        .await
        .unwrap();
    assert_eq!(amounts(all), vec![-10, 20, -30]);

    let deleted = p
        .transactions
        .query_movements(QueryMovementsParams {
            tx_statuses: vec![TxStatus::Deleted],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(amounts(deleted), vec![40]);

    let latest_sent = p
        .transactions
        .query_movements(QueryMovementsParams {
            enrollment_ids: vec!["alice".into()],
            search_direction: SearchDirection::FromLast,
            movement_direction: MovementDirection::Sent,
            num_records: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(amounts(latest_sent), vec![-30]);

    let received = p
        .transactions
        .query_movements(QueryMovementsParams {
            movement_direction: MovementDirection::Received,
            tx_statuses: vec![TxStatus::Pending, TxStatus::Deleted],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(amounts(received), vec![20, 40]);

    let other_type = p
        .transactions
        .query_movements(QueryMovementsParams {
            token_types: vec!["EUR".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(other_type.is_empty());
}
on_both_backends!(movement_queries);

async fn validation_queries(p: &Persistence) {
    for tx_id in ["v1", "v2", "v3"] {
        let mut w = p.transactions.begin_atomic_write().await.unwrap();
        w.add_token_request(tx_id, tx_id.as_bytes(), &Metadata::new(), &Metadata::new(), b"")
            .await
            .unwrap();
        let meta = Metadata::from([("validator".to_string(), tx_id.as_bytes().to_vec())]);
        w.add_validation_record(tx_id, &meta).await.unwrap();
        w.commit().await.unwrap();
    }
    p.transactions.set_status("v2", TxStatus::Confirmed, "").await.unwrap();

    let all = collect_all(
        p.transactions
            .query_validations(QueryValidationRecordsParams::default())
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].token_request, b"v1".to_vec());
    assert_eq!(all[0].metadata["validator"], b"v1".to_vec());

    let confirmed = collect_all(
        p.transactions
            .query_validations(QueryValidationRecordsParams {
                statuses: vec![TxStatus::Confirmed],
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].tx_id, "v2");

    let not_v1: ValidationFilter = Arc::new(|r| r.tx_id != "v1");
    let filtered = collect_all(
        p.transactions
            .query_validations(QueryValidationRecordsParams {
                filter: Some(not_v1),
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    let ids: Vec<_> = filtered.iter().map(|r| r.tx_id.as_str()).collect();
    assert_eq!(ids, vec!["v2", "v3"]);
}
on_both_backends!(validation_queries);

async fn token_requests_by_status(p: &Persistence) {
    commit_request(p, "r1", &[]).await;
    commit_request(p, "r2", &[]).await;
    p.transactions.set_status("r2", TxStatus::Confirmed, "").await.unwrap();

    assert_eq!(
        p.transactions.get_token_request("r1").await.unwrap(),
        Some(b"request-r1".to_vec())
    );
    let all = p.transactions.query_token_requests(&[]).await.unwrap();
    assert_eq!(all.len(), 2);
    let confirmed = p
        .transactions
        .query_token_requests(&[TxStatus::Confirmed])
        .await
        .unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].tx_id, "r2");
    assert_eq!(confirmed[0].request, b"request-r2".to_vec());
}
on_both_backends!(token_requests_by_status);

async fn endorsement_acks(p: &Persistence) {
    let alice = Identity::new(b"alice".to_vec());
    let bob = Identity::new(b"bob".to_vec());
    p.transactions
        .add_transaction_endorsement_ack("tx1", &alice, b"sig-a")
        .await
        .unwrap();
    p.transactions
        .add_transaction_endorsement_ack("tx1", &bob, b"sig-b")
        .await
        .unwrap();
    p.transactions
        .add_transaction_endorsement_ack("tx2", &bob, b"other")
        .await
        .unwrap();

    let acks = p.transactions.get_transaction_endorsement_acks("tx1").await.unwrap();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[&alice.unique_id()], b"sig-a".to_vec());
    assert_eq!(acks[&bob.unique_id()], b"sig-b".to_vec());
    assert!(p
        .transactions
        .get_transaction_endorsement_acks("tx3")
        .await
        .unwrap()
        .is_empty());
}
on_both_backends!(endorsement_acks);

async fn commits_are_counted(p: &Persistence) {
    commit_request(p, "c1", &[]).await;
    let mut w = p.transactions.begin_atomic_write().await.unwrap();
    w.rollback().await;
    assert_eq!(p.metrics.commits_total.get(), 1);
    assert_eq!(p.metrics.rollbacks_total.get(), 1);
}
on_both_backends!(commits_are_counted);
