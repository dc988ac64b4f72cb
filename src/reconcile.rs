//! Reconciliation Sweep
//!
//! Recovers events stuck in `Submitting`, e.g. after a crash between the
//! executor returning and its outcome being persisted. The destination
//! chain is the source of truth: an event is only finalized on on-chain
//! evidence, and only re-queued when the chain shows nothing.

use chrono::Utc;
use eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::chain::ChainSet;
use crate::db::{AuditEntry, BridgeEvent, EventStore, Transition};
use crate::metrics;
use crate::relay::observe_finalized;
use crate::retry::{run_periodic, CircuitBreakerConfig, RetryPolicy, SYSTEM_ACTOR};
use crate::types::EventState;

/// Decision taken for one stale event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepDecision {
    /// The destination already executed the action
    Finalized { dest_tx_hash: Option<String> },
    /// No completion yet, but the ledger knows a broadcast tx to follow
    Submitted { dest_tx_hash: String },
    /// No trace on the destination; safe to claim again
    Requeued,
    /// Destination lookup failed; left for the next sweep
    Deferred,
    /// Someone else moved the event first
    Skipped,
}

impl SweepDecision {
    fn label(&self) -> &'static str {
        match self {
            SweepDecision::Finalized { .. } => "finalized",
            SweepDecision::Submitted { .. } => "submitted",
            SweepDecision::Requeued => "requeued",
            SweepDecision::Deferred => "deferred",
            SweepDecision::Skipped => "skipped",
        }
    }
}

pub struct ReconciliationSweep {
    store: Arc<dyn EventStore>,
    chains: ChainSet,
    /// Must exceed the executor timeout so live workers are never raced
    submitting_timeout: Duration,
    batch_size: i64,
}

impl ReconciliationSweep {
    pub fn new(
        store: Arc<dyn EventStore>,
        chains: ChainSet,
        submitting_timeout: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            chains,
            submitting_timeout,
            batch_size,
        }
    }

    /// Reconcile every `Submitting` event older than the timeout
    pub async fn sweep(&self) -> Result<Vec<(BridgeEvent, SweepDecision)>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.submitting_timeout)
                .unwrap_or(chrono::Duration::zero());
        let stale = self
            .store
            .list_stale(EventState::Submitting, cutoff, self.batch_size)
            .await?;

        let mut decisions = Vec::with_capacity(stale.len());
        for event in stale {
            let decision = self.reconcile(&event).await?;
            metrics::record_reconciliation(decision.label());
            decisions.push((event, decision));
        }
        Ok(decisions)
    }

    async fn reconcile(&self, event: &BridgeEvent) -> Result<SweepDecision> {
        let key = &event.idempotency_key;
        let target = self.chains.target(event.direction);

        let completion = match target.reader.find_completion(key).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(
                    key = %key,
                    chain = %target.key,
                    error = %e,
                    "Reconciliation lookup failed; leaving event in submitting"
                );
                return Ok(SweepDecision::Deferred);
            }
        };

        // Latest broadcast tx that has not been seen to revert or drop
        let ledger_tx = self
            .store
            .prior_success(key)
            .await?
            .and_then(|a| a.dest_tx_hash);

        let (transition, decision) = match completion {
            Some(found) => {
                let dest_tx_hash = found.dest_tx_hash.or_else(|| ledger_tx.clone());
                (
                    Transition::new(EventState::Submitting, EventState::Finalized)
                        .clearing_error()
                        .with_dest_tx(dest_tx_hash.clone()),
                    SweepDecision::Finalized { dest_tx_hash },
                )
            }
            None => match ledger_tx {
                Some(dest_tx_hash) => (
                    Transition::new(EventState::Submitting, EventState::Submitted)
                        .with_dest_tx(Some(dest_tx_hash.clone())),
                    SweepDecision::Submitted { dest_tx_hash },
                ),
                None => (
                    Transition::new(EventState::Submitting, EventState::Confirmed)
                        .with_error("reclaimed by reconciliation sweep"),
                    SweepDecision::Requeued,
                ),
            },
        };

        let Some(updated) = self.store.transition(key, &transition).await? else {
            return Ok(SweepDecision::Skipped);
        };
        metrics::record_transition(transition.from, transition.to);
        if updated.state == EventState::Finalized {
            observe_finalized(&updated);
        }

        info!(
            key = %key,
            chain = %target.key,
            decision = decision.label(),
            dest_tx_hash = ?updated.dest_tx_hash,
            "Reconciled stale submitting event"
        );
        self.store
            .record_audit(&AuditEntry::now(
                key,
                format!("reconcile_{}", decision.label()),
                SYSTEM_ACTOR,
                updated.dest_tx_hash.clone(),
            ))
            .await?;

        Ok(decision)
    }

    pub async fn run(
        self,
        interval: Duration,
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let breaker = CircuitBreakerConfig::default();
        let this = &self;
        run_periodic("reconcile", interval, &policy, &breaker, shutdown, || async move {
            this.sweep().await.map(|_| ())
        })
        .await
    }
}
