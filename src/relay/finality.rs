//! Destination finality tracking for `Submitted` events

use chrono::{DateTime, Utc};
use eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::observe_finalized;
use crate::chain::{ChainHandle, ChainSet, TxStatus};
use crate::db::{AttemptOutcome, BridgeEvent, EventStore, Transition};
use crate::metrics;
use crate::retry::{run_periodic, CircuitBreakerConfig, RetryPolicy};
use crate::types::{EventState, FailureClass};

/// Counts from one finality pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FinalitySummary {
    pub finalized: usize,
    pub reverted: usize,
    pub dropped: usize,
    pub waiting: usize,
}

/// Follows destination transactions until they are deep enough to finalize
pub struct FinalityTracker {
    store: Arc<dyn EventStore>,
    chains: ChainSet,
    policy: RetryPolicy,
    /// How long a tx may stay unknown to the node before it counts as dropped
    drop_timeout: Duration,
    batch_size: i64,
}

impl FinalityTracker {
    pub fn new(
        store: Arc<dyn EventStore>,
        chains: ChainSet,
        policy: RetryPolicy,
        drop_timeout: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            chains,
            policy,
            drop_timeout,
            batch_size,
        }
    }

    pub async fn tick(&self) -> Result<FinalitySummary> {
        let submitted = self
            .store
            .list_by_state(EventState::Submitted, None, self.batch_size)
            .await?;
        let mut summary = FinalitySummary::default();
        let mut heads: HashMap<String, u64> = HashMap::new();
        let drop_cutoff = Utc::now()
            - chrono::Duration::from_std(self.drop_timeout).unwrap_or(chrono::Duration::zero());

        for event in submitted {
            let target = self.chains.target(event.direction).clone();
            if let Err(e) = self
                .check_event(&event, &target, &mut heads, drop_cutoff, &mut summary)
                .await
            {
                // Chain trouble on one event must not stall the others
                warn!(
                    key = %event.idempotency_key,
                    chain = %target.key,
                    error = %e,
                    "Finality check failed"
                );
                metrics::record_error("finality", "chain");
            }
        }

        if summary != FinalitySummary::default() {
            debug!(?summary, "Finality pass");
        }
        Ok(summary)
    }

    async fn check_event(
        &self,
        event: &BridgeEvent,
        target: &ChainHandle,
        heads: &mut HashMap<String, u64>,
        drop_cutoff: DateTime<Utc>,
        summary: &mut FinalitySummary,
    ) -> Result<()> {
        let key = &event.idempotency_key;
        let Some(tx_hash) = event.dest_tx_hash.as_deref() else {
            self.mark_failed(event, "submitted without a destination tx hash").await?;
            summary.dropped += 1;
            return Ok(());
        };

        match target.reader.transaction_status(tx_hash).await? {
            TxStatus::Included {
                block_number,
                success: true,
            } => {
                let head = match heads.get(&target.key) {
                    Some(head) => *head,
                    None => {
                        let head = target.reader.head_block().await?;
                        heads.insert(target.key.clone(), head);
                        head
                    }
                };
                if head < block_number.saturating_add(target.confirmation_depth) {
                    summary.waiting += 1;
                    return Ok(());
                }

                self.store
                    .update_attempt_by_tx(key, tx_hash, AttemptOutcome::Finalized)
                    .await?;
                let finalize = Transition::new(EventState::Submitted, EventState::Finalized);
                if let Some(done) = self.store.transition(key, &finalize).await? {
                    metrics::record_transition(EventState::Submitted, EventState::Finalized);
                    observe_finalized(&done);
                    info!(
                        key = %key,
                        tx_hash = %tx_hash,
                        block = block_number,
                        head,
                        "Bridge action finalized"
                    );
                    summary.finalized += 1;
                }
            }
            TxStatus::Included { success: false, .. } => {
                self.store
                    .update_attempt_by_tx(key, tx_hash, AttemptOutcome::Reverted)
                    .await?;
                error!(key = %key, tx_hash = %tx_hash, "Destination transaction reverted");
                self.mark_failed(event, &format!("destination tx {} reverted", tx_hash))
                    .await?;
                summary.reverted += 1;
            }
            TxStatus::Pending => summary.waiting += 1,
            TxStatus::NotFound if event.updated_at > drop_cutoff => summary.waiting += 1,
            TxStatus::NotFound => {
                // Unknown to the node for too long; trust only on-chain evidence
                if let Some(completion) = target.reader.find_completion(key).await? {
                    // Executed, possibly by a different tx than the one we broadcast
                    let outcome = match completion.dest_tx_hash.as_deref() {
                        Some(done) if done.eq_ignore_ascii_case(tx_hash) => {
                            AttemptOutcome::Finalized
                        }
                        _ => AttemptOutcome::AlreadyProcessed,
                    };
                    self.store.update_attempt_by_tx(key, tx_hash, outcome).await?;
                    let finalize = Transition::new(EventState::Submitted, EventState::Finalized)
                        .with_dest_tx(completion.dest_tx_hash.clone());
                    if let Some(done) = self.store.transition(key, &finalize).await? {
                        metrics::record_transition(EventState::Submitted, EventState::Finalized);
                        observe_finalized(&done);
                        summary.finalized += 1;
                    }
                    return Ok(());
                }

                self.store
                    .update_attempt_by_tx(key, tx_hash, AttemptOutcome::Failed)
                    .await?;
                warn!(key = %key, tx_hash = %tx_hash, "Destination transaction dropped");
                self.mark_failed(event, &format!("destination tx {} dropped", tx_hash))
                    .await?;
                summary.dropped += 1;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, event: &BridgeEvent, reason: &str) -> Result<()> {
        let failed = Transition::new(EventState::Submitted, EventState::Failed)
            .with_error(reason)
            .with_failure(FailureClass::Transient)
            .retry_after(self.policy.next_retry_after(event.attempt_count, Utc::now()));
        if self
            .store
            .transition(&event.idempotency_key, &failed)
            .await?
            .is_some()
        {
            metrics::record_transition(EventState::Submitted, EventState::Failed);
        }
        Ok(())
    }

    pub async fn run(
        self,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let breaker = CircuitBreakerConfig::default();
        let policy = self.policy.clone();
        let this = &self;
        run_periodic("finality", interval, &policy, &breaker, shutdown, || async move {
            this.tick().await.map(|_| ())
        })
        .await
    }
}
