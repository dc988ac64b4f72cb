//! Operator actions on dead-lettered events
//!
//! Both actions are audit-logged with the operator's identity and reason.

use eyre::Result;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{AuditEntry, BridgeEvent, EventStore};
use crate::metrics;
use crate::types::{EventState, IdempotencyKey};

/// Why an operator action was refused
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("event {0} not found")]
    NotFound(IdempotencyKey),
    #[error("event {key} is {state}, not an open dead letter")]
    NotDeadLettered { key: IdempotencyKey, state: EventState },
    #[error("actor must not be empty")]
    MissingActor,
    #[error(transparent)]
    Store(#[from] eyre::Report),
}

/// Who asked for an operator action, and why
#[derive(Debug, Clone)]
pub struct OperatorRequest {
    pub actor: String,
    pub reason: Option<String>,
}

impl OperatorRequest {
    pub fn new(actor: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            actor: actor.into(),
            reason,
        }
    }

    fn audit_entry(&self, key: &IdempotencyKey, action: &str) -> AuditEntry {
        AuditEntry::now(key, action, self.actor.as_str(), self.reason.clone())
    }
}

/// Re-queue a dead-lettered event with a fresh retry budget
pub async fn retry_dead_letter(
    store: &dyn EventStore,
    key: &IdempotencyKey,
    request: &OperatorRequest,
) -> Result<BridgeEvent, AdminError> {
    check_actor(request)?;
    let audit = request.audit_entry(key, "operator_retry");
    let Some(updated) = store.requeue_dead_letter(key, &audit).await? else {
        return Err(refusal(store, key).await?);
    };

    metrics::record_transition(EventState::DeadLettered, EventState::Confirmed);
    info!(
        key = %key,
        actor = %request.actor,
        reason = ?request.reason,
        "Operator re-queued dead-lettered event"
    );
    Ok(updated)
}

/// Permanently discard a dead-lettered event. It stays `DeadLettered`.
pub async fn discard_dead_letter(
    store: &dyn EventStore,
    key: &IdempotencyKey,
    request: &OperatorRequest,
) -> Result<BridgeEvent, AdminError> {
    check_actor(request)?;
    let audit = request.audit_entry(key, "operator_discard");
    let Some(updated) = store.discard_dead_letter(key, &audit).await? else {
        return Err(refusal(store, key).await?);
    };

    warn!(
        key = %key,
        actor = %request.actor,
        reason = ?request.reason,
        amount = %updated.amount,
        "Operator discarded dead-lettered event"
    );
    Ok(updated)
}

fn check_actor(request: &OperatorRequest) -> Result<(), AdminError> {
    if request.actor.trim().is_empty() {
        return Err(AdminError::MissingActor);
    }
    Ok(())
}

async fn refusal(store: &dyn EventStore, key: &IdempotencyKey) -> Result<AdminError> {
    Ok(match store.get_event(key).await? {
        None => AdminError::NotFound(key.clone()),
        Some(event) => AdminError::NotDeadLettered {
            key: key.clone(),
            state: event.state,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryEventStore, NewBridgeEvent, Transition};
    use crate::types::{Amount, Direction, FailureClass};

    async fn dead_lettered(store: &MemoryEventStore) -> IdempotencyKey {
        let key = IdempotencyKey::derive("chainA", "0xabc", 2);
        store
            .upsert_observed(&NewBridgeEvent {
                idempotency_key: key.clone(),
                direction: Direction::SourceToDest,
                source_chain: "chainA".to_string(),
                source_tx_hash: "0xabc".to_string(),
                log_index: 2,
                source_block_number: 10,
                asset: "ETR".to_string(),
                amount: Amount::from_u128(5),
                sender: "0x1".to_string(),
                recipient: "0x2".to_string(),
            })
            .await
            .unwrap();
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
        store.begin_attempt(&key).await.unwrap().unwrap();
        for (from, to) in [
            (EventState::Submitting, EventState::Failed),
            (EventState::Failed, EventState::DeadLettered),
        ] {
            store
                .transition(
                    &key,
                    &Transition::new(from, to)
                        .with_error("boom")
                        .with_failure(FailureClass::Permanent),
                )
                .await
                .unwrap()
                .unwrap();
        }
        key
    }

    #[tokio::test]
    async fn test_retry_resets_budget_and_audits() {
        let store = MemoryEventStore::new();
        let key = dead_lettered(&store).await;

        let request = OperatorRequest::new("alice", Some("recipient fixed".to_string()));
        let event = retry_dead_letter(&store, &key, &request).await.unwrap();
        assert_eq!(event.state, EventState::Confirmed);
        assert_eq!(event.attempt_count, 0);
        assert!(event.failure_class.is_none());

        let audit = store.list_audit(&key).await.unwrap();
        let entry = audit.iter().find(|a| a.action == "operator_retry").unwrap();
        assert_eq!(entry.actor, "alice");
        assert_eq!(entry.detail.as_deref(), Some("recipient fixed"));
    }

    #[tokio::test]
    async fn test_discard_keeps_state_and_blocks_retry() {
        let store = MemoryEventStore::new();
        let key = dead_lettered(&store).await;

        let request = OperatorRequest::new("bob", None);
        let event = discard_dead_letter(&store, &key, &request).await.unwrap();
        assert_eq!(event.state, EventState::DeadLettered);
        assert!(event.discarded_at.is_some());

        let err = retry_dead_letter(&store, &key, &request).await.unwrap_err();
        assert!(matches!(err, AdminError::NotDeadLettered { .. }));
    }

    #[tokio::test]
    async fn test_failed_audit_write_leaves_event_untouched() {
        let store = MemoryEventStore::new();
        let key = dead_lettered(&store).await;
        let request = OperatorRequest::new("alice", Some("retry after fix".to_string()));

        store.fail_audit_writes(true);
        let err = retry_dead_letter(&store, &key, &request).await.unwrap_err();
        assert!(matches!(err, AdminError::Store(_)));
        let err = discard_dead_letter(&store, &key, &request).await.unwrap_err();
        assert!(matches!(err, AdminError::Store(_)));

        let event = store.get_event(&key).await.unwrap().unwrap();
        assert_eq!(event.state, EventState::DeadLettered);
        assert!(event.discarded_at.is_none());
        assert_eq!(event.attempt_count, 1);

        // The operator can simply try again once the audit log is back
        store.fail_audit_writes(false);
        let event = retry_dead_letter(&store, &key, &request).await.unwrap();
        assert_eq!(event.state, EventState::Confirmed);
        let audit = store.list_audit(&key).await.unwrap();
        assert_eq!(
            audit.iter().filter(|a| a.action.starts_with("operator_")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_refusals() {
        let store = MemoryEventStore::new();
        let missing = IdempotencyKey::derive("chainA", "0xdef", 0);
        let request = OperatorRequest::new("carol", None);
        assert!(matches!(
            retry_dead_letter(&store, &missing, &request).await,
            Err(AdminError::NotFound(_))
        ));

        let key = dead_lettered(&store).await;
        assert!(matches!(
            discard_dead_letter(&store, &key, &OperatorRequest::new(" ", None)).await,
            Err(AdminError::MissingActor)
        ));
    }
}
