//! In-process `EventStore`
//!
//! Mirrors the Postgres semantics (CAS on state, upsert-on-conflict, attempt
//! ledger) behind a single `RwLock`. Used by the test suite and by embedders
//! that do not need durability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::models::*;
use super::EventStore;
use crate::types::{Direction, EventState, IdempotencyKey};

#[derive(Default)]
struct Inner {
    events: BTreeMap<IdempotencyKey, BridgeEvent>,
    attempts: HashMap<IdempotencyKey, Vec<RelayAttempt>>,
    cursors: HashMap<String, u64>,
    skipped: Vec<SkippedLog>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
    fail_audit: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every audit write fail, as a full or unreachable audit table would
    pub fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    fn check_audit_writable(&self) -> Result<()> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(eyre!("Failed to write audit entry: audit log unavailable"));
        }
        Ok(())
    }

    /// Total number of event rows
    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn sorted_by_updated(mut events: Vec<BridgeEvent>, limit: i64) -> Vec<BridgeEvent> {
    events.sort_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.idempotency_key.cmp(&b.idempotency_key))
    });
    events.truncate(limit.max(0) as usize);
    events
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert_observed(&self, event: &NewBridgeEvent) -> Result<UpsertOutcome> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        if let Some(existing) = inner.events.get_mut(&event.idempotency_key) {
            existing.observation_count += 1;
            existing.last_observed_at = now;
            let stored = existing.clone();
            return Ok(if stored.same_payload(event) {
                UpsertOutcome::Duplicate(stored)
            } else {
                UpsertOutcome::Conflict(stored)
            });
        }

        let stored = BridgeEvent {
            idempotency_key: event.idempotency_key.clone(),
            direction: event.direction,
            source_chain: event.source_chain.clone(),
            source_tx_hash: event.source_tx_hash.clone(),
            log_index: event.log_index,
            source_block_number: event.source_block_number,
            asset: event.asset.clone(),
            amount: event.amount,
            sender: event.sender.clone(),
            recipient: event.recipient.clone(),
            state: EventState::Observed,
            attempt_count: 0,
            last_error: None,
            failure_class: None,
            dest_tx_hash: None,
            retry_after: None,
            observation_count: 1,
            last_observed_at: now,
            discarded_at: None,
            created_at: now,
            updated_at: now,
        };
        inner
            .events
            .insert(stored.idempotency_key.clone(), stored.clone());
        Ok(UpsertOutcome::Inserted(stored))
    }

    async fn get_event(&self, key: &IdempotencyKey) -> Result<Option<BridgeEvent>> {
        Ok(self.inner.read().await.events.get(key).cloned())
    }

    async fn list_by_state(
        &self,
        state: EventState,
        direction: Option<Direction>,
        limit: i64,
    ) -> Result<Vec<BridgeEvent>> {
        let inner = self.inner.read().await;
        let matching = inner
            .events
            .values()
            .filter(|e| e.state == state && direction.map_or(true, |d| e.direction == d))
            .cloned()
            .collect();
        Ok(sorted_by_updated(matching, limit))
    }

    async fn list_claimable(
        &self,
        direction: Direction,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BridgeEvent>> {
        let inner = self.inner.read().await;
        let mut matching: Vec<BridgeEvent> = inner
            .events
            .values()
            .filter(|e| {
                e.state == EventState::Confirmed
                    && e.direction == direction
                    && e.retry_after.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect();
        matching.sort_by_key(|e| (e.source_block_number, e.log_index));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn list_stale(
        &self,
        state: EventState,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BridgeEvent>> {
        let inner = self.inner.read().await;
        let matching = inner
            .events
            .values()
            .filter(|e| e.state == state && e.updated_at <= updated_before)
            .cloned()
            .collect();
        Ok(sorted_by_updated(matching, limit))
    }

    async fn transition(
        &self,
        key: &IdempotencyKey,
        transition: &Transition,
    ) -> Result<Option<BridgeEvent>> {
        if !transition.from.can_transition_to(transition.to) {
            return Err(eyre!(
                "Illegal transition {} -> {} for {}",
                transition.from,
                transition.to,
                key
            ));
        }

        let mut inner = self.inner.write().await;
        let Some(event) = inner.events.get_mut(key) else {
            return Ok(None);
        };
        if event.state != transition.from {
            return Ok(None);
        }

        event.state = transition.to;
        if transition.clear_error {
            event.last_error = None;
        } else if let Some(err) = &transition.last_error {
            event.last_error = Some(err.clone());
        }
        if let Some(tx) = &transition.dest_tx_hash {
            event.dest_tx_hash = Some(tx.clone());
        }
        event.retry_after = transition.retry_after;
        event.failure_class = transition.failure_class;
        event.updated_at = Utc::now();
        Ok(Some(event.clone()))
    }

    async fn begin_attempt(&self, key: &IdempotencyKey) -> Result<Option<AttemptTicket>> {
        let mut inner = self.inner.write().await;
        let attempt_count = match inner.events.get_mut(key) {
            Some(event) if event.state == EventState::Submitting => {
                event.attempt_count += 1;
                event.updated_at = Utc::now();
                event.attempt_count
            }
            _ => return Ok(None),
        };

        let rows = inner.attempts.entry(key.clone()).or_default();
        let attempt_no = rows.iter().map(|a| a.attempt_no).max().unwrap_or(0) + 1;
        rows.push(RelayAttempt {
            idempotency_key: key.clone(),
            attempt_no,
            outcome: AttemptOutcome::InFlight,
            dest_tx_hash: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        });
        Ok(Some(AttemptTicket {
            attempt_no,
            attempt_count,
        }))
    }

    async fn finish_attempt(
        &self,
        key: &IdempotencyKey,
        attempt_no: u32,
        outcome: AttemptOutcome,
        dest_tx_hash: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(attempt) = inner
            .attempts
            .get_mut(key)
            .and_then(|rows| rows.iter_mut().find(|a| a.attempt_no == attempt_no))
        {
            attempt.outcome = outcome;
            if let Some(tx) = dest_tx_hash {
                attempt.dest_tx_hash = Some(tx.to_string());
            }
            attempt.error = error.map(str::to_string);
            attempt.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_attempt_by_tx(
        &self,
        key: &IdempotencyKey,
        dest_tx_hash: &str,
        outcome: AttemptOutcome,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(rows) = inner.attempts.get_mut(key) {
            for attempt in rows
                .iter_mut()
                .filter(|a| a.dest_tx_hash.as_deref() == Some(dest_tx_hash))
            {
                attempt.outcome = outcome;
                attempt.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn list_attempts(&self, key: &IdempotencyKey) -> Result<Vec<RelayAttempt>> {
        Ok(self
            .inner
            .read()
            .await
            .attempts
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn prior_success(&self, key: &IdempotencyKey) -> Result<Option<RelayAttempt>> {
        let inner = self.inner.read().await;
        Ok(inner.attempts.get(key).and_then(|rows| {
            rows.iter()
                .filter(|a| a.outcome.reached_destination())
                .max_by_key(|a| a.attempt_no)
                .cloned()
        }))
    }

    async fn requeue_dead_letter(
        &self,
        key: &IdempotencyKey,
        audit: &AuditEntry,
    ) -> Result<Option<BridgeEvent>> {
        let mut inner = self.inner.write().await;
        let updated = match inner.events.get_mut(key) {
            Some(event)
                if event.state == EventState::DeadLettered && event.discarded_at.is_none() =>
            {
                self.check_audit_writable()?;
                event.state = EventState::Confirmed;
                event.attempt_count = 0;
                event.last_error = None;
                event.failure_class = None;
                event.retry_after = None;
                event.updated_at = Utc::now();
                event.clone()
            }
            _ => return Ok(None),
        };
        inner.audit.push(audit.clone());
        Ok(Some(updated))
    }

    async fn discard_dead_letter(
        &self,
        key: &IdempotencyKey,
        audit: &AuditEntry,
    ) -> Result<Option<BridgeEvent>> {
        let mut inner = self.inner.write().await;
        let updated = match inner.events.get_mut(key) {
            Some(event)
                if event.state == EventState::DeadLettered && event.discarded_at.is_none() =>
            {
                self.check_audit_writable()?;
                let now = Utc::now();
                event.discarded_at = Some(now);
                event.updated_at = now;
                event.clone()
            }
            _ => return Ok(None),
        };
        inner.audit.push(audit.clone());
        Ok(Some(updated))
    }

    async fn get_cursor(&self, chain: &str) -> Result<Option<u64>> {
        Ok(self.inner.read().await.cursors.get(chain).copied())
    }

    async fn set_cursor(&self, chain: &str, block: u64) -> Result<()> {
        self.inner
            .write()
            .await
            .cursors
            .insert(chain.to_string(), block);
        Ok(())
    }

    async fn record_skipped_log(&self, skipped: &SkippedLog) -> Result<()> {
        self.inner.write().await.skipped.push(skipped.clone());
        Ok(())
    }

    async fn list_skipped_logs(&self, chain: &str, limit: i64) -> Result<Vec<SkippedLog>> {
        Ok(self
            .inner
            .read()
            .await
            .skipped
            .iter()
            .filter(|s| s.chain == chain)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.check_audit_writable()?;
        self.inner.write().await.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, key: &IdempotencyKey) -> Result<Vec<AuditEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .audit
            .iter()
            .filter(|a| &a.idempotency_key == key)
            .cloned()
            .collect())
    }

    async fn count_by_state(&self) -> Result<StateCounts> {
        let inner = self.inner.read().await;
        let mut counts = StateCounts::default();
        for event in inner.events.values() {
            *counts
                .by_state
                .entry(event.state.as_str().to_string())
                .or_insert(0) += 1;
            if event.discarded_at.is_some() {
                counts.discarded += 1;
            }
        }
        Ok(counts.zero_filled())
    }
}
