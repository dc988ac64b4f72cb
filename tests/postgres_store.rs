//! Postgres `EventStore` tests
//!
//! Run with: DATABASE_URL=postgres://... cargo test --test postgres_store -- --ignored
//!
//! Each test uses unique idempotency keys, so a shared database is fine.

use std::sync::Arc;

use bridge_relayer::db::{
    self, AttemptOutcome, AuditEntry, EventStore, NewBridgeEvent, PgEventStore, Transition,
    UpsertOutcome,
};
use bridge_relayer::types::{Amount, Direction, EventState, IdempotencyKey};
use tokio_test::{assert_err, assert_ok};

async fn store() -> Option<PgEventStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = db::create_pool(&url, 5).await.ok()?;
    db::run_migrations(&pool).await.ok()?;
    Some(PgEventStore::new(pool))
}

fn unique_tx() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("0x{:x}", nanos)
}

fn candidate(tx_hash: &str, amount: Amount) -> NewBridgeEvent {
    NewBridgeEvent {
        idempotency_key: IdempotencyKey::derive("pgtest", tx_hash, 2),
        direction: Direction::SourceToDest,
        source_chain: "pgtest".to_string(),
        source_tx_hash: tx_hash.to_string(),
        log_index: 2,
        source_block_number: 10,
        asset: "ETR".to_string(),
        amount,
        sender: "0x1111111111111111111111111111111111111111".to_string(),
        recipient: "0xDEAD".to_string(),
    }
}

#[tokio::test]
#[ignore]
async fn test_upsert_collapses_and_keeps_numeric_precision() {
    let Some(store) = store().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };
    let amount: Amount = "1606938044258990275541962092341162602522202993782792835301377"
        .parse()
        .unwrap();
    let new = candidate(&unique_tx(), amount);

    assert!(store.upsert_observed(&new).await.unwrap().is_inserted());
    for _ in 0..3 {
        let outcome = store.upsert_observed(&new).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Duplicate(_)));
    }

    let stored = store.get_event(&new.idempotency_key).await.unwrap().unwrap();
    assert_eq!(stored.amount, amount);
    assert_eq!(stored.observation_count, 4);
    assert_eq!(stored.state, EventState::Observed);

    let mut changed = new.clone();
    changed.amount = Amount::from_u128(1);
    let outcome = store.upsert_observed(&changed).await.unwrap();
    assert!(matches!(outcome, UpsertOutcome::Conflict(_)));
    assert_eq!(outcome.event().amount, amount);
}

#[tokio::test]
#[ignore]
async fn test_claim_is_exclusive() {
    let Some(store) = store().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };
    let store = Arc::new(store);
    let new = candidate(&unique_tx(), Amount::from_u128(500));
    let key = new.idempotency_key.clone();
    assert_ok!(store.upsert_observed(&new).await);
    assert_ok!(
        store
            .transition(&key, &Transition::new(EventState::Observed, EventState::Confirmed))
            .await
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store
                .transition(
                    &key,
                    &Transition::new(EventState::Confirmed, EventState::Submitting),
                )
                .await
                .unwrap()
                .is_some()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    // Illegal edges are refused before touching the row
    let _err = assert_err!(
        store
            .transition(&key, &Transition::new(EventState::Submitting, EventState::Observed))
            .await
    );
}

#[tokio::test]
#[ignore]
async fn test_attempt_ledger_and_dead_letter_actions() {
    let Some(store) = store().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };
    let new = candidate(&unique_tx(), Amount::from_u128(7));
    let key = new.idempotency_key.clone();
    store.upsert_observed(&new).await.unwrap();
    for (from, to) in [
        (EventState::Observed, EventState::Confirmed),
        (EventState::Confirmed, EventState::Submitting),
    ] {
        store
            .transition(&key, &Transition::new(from, to))
            .await
            .unwrap()
            .unwrap();
    }

    let ticket = store.begin_attempt(&key).await.unwrap().unwrap();
    assert_eq!(ticket.attempt_no, 1);
    store
        .finish_attempt(&key, ticket.attempt_no, AttemptOutcome::Submitted, Some("0xfeed"), None)
        .await
        .unwrap();
    let prior = store.prior_success(&key).await.unwrap().unwrap();
    assert_eq!(prior.dest_tx_hash.as_deref(), Some("0xfeed"));

    store
        .update_attempt_by_tx(&key, "0xfeed", AttemptOutcome::Reverted)
        .await
        .unwrap();
    assert!(store.prior_success(&key).await.unwrap().is_none());

    for (from, to) in [
        (EventState::Submitting, EventState::Failed),
        (EventState::Failed, EventState::DeadLettered),
    ] {
        store
            .transition(&key, &Transition::new(from, to).with_error("reverted"))
            .await
            .unwrap()
            .unwrap();
    }

    let retry = AuditEntry::now(&key, "operator_retry", "alice", None);
    let requeued = store
        .requeue_dead_letter(&key, &retry)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(requeued.state, EventState::Confirmed);
    assert_eq!(requeued.attempt_count, 0);
    assert!(requeued.last_error.is_none());

    // Not dead-lettered any more: no change and no audit row
    let discard = AuditEntry::now(&key, "operator_discard", "alice", None);
    assert!(store
        .discard_dead_letter(&key, &discard)
        .await
        .unwrap()
        .is_none());

    let actions: Vec<String> = store
        .list_audit(&key)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.action)
        .collect();
    assert_eq!(actions, vec!["operator_retry".to_string()]);
}

#[tokio::test]
#[ignore]
async fn test_block_numbers_beyond_bigint_are_refused() {
    let Some(store) = store().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };
    let chain = format!("pgtest-{}", unique_tx());
    let _err = assert_err!(store.set_cursor(&chain, u64::MAX).await);
    assert_eq!(store.get_cursor(&chain).await.unwrap(), None);

    let mut new = candidate(&unique_tx(), Amount::from_u128(1));
    new.source_block_number = i64::MAX as u64 + 1;
    let _err = assert_err!(store.upsert_observed(&new).await);
    assert!(store
        .get_event(&new.idempotency_key)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore]
async fn test_cursor_round_trip() {
    let Some(store) = store().await else {
        eprintln!("DATABASE_URL not set or unreachable, skipping");
        return;
    };
    let chain = format!("pgtest-{}", unique_tx());
    assert_eq!(store.get_cursor(&chain).await.unwrap(), None);
    store.set_cursor(&chain, 41).await.unwrap();
    store.set_cursor(&chain, 42).await.unwrap();
    assert_eq!(store.get_cursor(&chain).await.unwrap(), Some(42));
}
