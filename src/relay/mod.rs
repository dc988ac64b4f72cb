//! Relay State Machine
//!
//! Advances events from `Observed` through `Finalized`:
//!
//! ```text
//! Observed -> Confirmed -> Submitting -> Submitted -> Finalized
//!                 ^            |    \________________/^
//!                 |            v
//!                 +-------- Failed -> DeadLettered
//! ```
//!
//! Every step is a compare-and-swap on the stored state, so any number of
//! engine instances may share one Event Store. The `Confirmed -> Submitting`
//! claim decides which worker invokes the Action Executor.

use chrono::Utc;
use eyre::Result;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{ActionError, ChainSet};
use crate::db::{AttemptOutcome, BridgeEvent, EventStore, Transition};
use crate::executor::ActionExecutor;
use crate::metrics;
use crate::retry::{run_periodic, CircuitBreakerConfig, RetryPolicy};
use crate::types::{Amount, Direction, EventState, FailureClass, IdempotencyKey};

pub mod finality;

pub use finality::FinalityTracker;

/// Pre-execution checks that fail an event permanently
#[derive(Debug, Clone, Default)]
pub struct RelayGuard {
    /// Empty means every asset is accepted
    pub supported_assets: HashSet<String>,
    pub max_amount: Option<Amount>,
}

impl RelayGuard {
    pub fn new(supported_assets: impl IntoIterator<Item = String>, max_amount: Option<Amount>) -> Self {
        Self {
            supported_assets: supported_assets.into_iter().collect(),
            max_amount,
        }
    }

    /// Why `event` must not be relayed, if anything
    pub fn reject_reason(&self, event: &BridgeEvent) -> Option<String> {
        if !self.supported_assets.is_empty() && !self.supported_assets.contains(&event.asset) {
            return Some(format!("asset {} is not supported", event.asset));
        }
        if let Some(max) = self.max_amount {
            if event.amount > max {
                return Some(format!(
                    "amount {} exceeds the relay ceiling {}",
                    event.amount, max
                ));
            }
        }
        None
    }
}

/// What happened to one event during a drive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Another worker owns the event
    LostClaim,
    Submitted(String),
    Finalized,
    /// Transient failure within budget; back in `Confirmed`
    Requeued,
    Failed(FailureClass),
}

/// Counts from one drive pass over a direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriveSummary {
    pub claimed: usize,
    pub lost: usize,
    pub submitted: usize,
    pub finalized: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl DriveSummary {
    fn record(&mut self, outcome: &DriveOutcome) {
        if *outcome != DriveOutcome::LostClaim {
            self.claimed += 1;
        }
        match outcome {
            DriveOutcome::LostClaim => self.lost += 1,
            DriveOutcome::Submitted(_) => self.submitted += 1,
            DriveOutcome::Finalized => self.finalized += 1,
            DriveOutcome::Requeued => self.requeued += 1,
            DriveOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Record a finalized event's end-to-end latency
pub(crate) fn observe_finalized(event: &BridgeEvent) {
    let elapsed = (Utc::now() - event.created_at).num_milliseconds().max(0) as f64 / 1000.0;
    metrics::record_latency(event.direction.as_str(), elapsed);
}

/// Claims pending events and drives them through the Action Executor
pub struct RelayEngine {
    store: Arc<dyn EventStore>,
    chains: ChainSet,
    executor: ActionExecutor,
    policy: RetryPolicy,
    guard: RelayGuard,
    worker_concurrency: usize,
    batch_size: i64,
}

impl RelayEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        chains: ChainSet,
        executor: ActionExecutor,
        policy: RetryPolicy,
        guard: RelayGuard,
        worker_concurrency: usize,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            chains,
            executor,
            policy,
            guard,
            worker_concurrency: worker_concurrency.max(1),
            batch_size,
        }
    }

    /// One full pass: confirm gating, then drain both directions
    pub async fn tick(&self) -> Result<()> {
        self.promote_observed().await?;
        for direction in Direction::ALL {
            let summary = self.drive_pending(direction).await?;
            if summary.claimed > 0 {
                info!(direction = %direction, ?summary, "Relay pass complete");
            }
        }
        Ok(())
    }

    /// Move `Observed` events whose block is `confirmation_depth` deep on
    /// the origin chain to `Confirmed`.
    ///
    /// A lower head than last time (reorg, lagging node) only delays
    /// promotion; a promoted event is never demoted.
    pub async fn promote_observed(&self) -> Result<usize> {
        let mut promoted = 0;
        for direction in Direction::ALL {
            let origin = self.chains.origin(direction);
            let observed = self
                .store
                .list_by_state(EventState::Observed, Some(direction), self.batch_size)
                .await?;
            if observed.is_empty() {
                continue;
            }

            let head = match origin.reader.head_block().await {
                Ok(head) => head,
                Err(e) => {
                    warn!(chain = %origin.key, error = %e, "Failed to read head; confirmation gating deferred");
                    metrics::record_error("relay", "head_block");
                    continue;
                }
            };

            for event in observed {
                let confirmed_at = event
                    .source_block_number
                    .saturating_add(origin.confirmation_depth);
                if head < confirmed_at {
                    continue;
                }
                let confirm = Transition::new(EventState::Observed, EventState::Confirmed);
                if self
                    .store
                    .transition(&event.idempotency_key, &confirm)
                    .await?
                    .is_some()
                {
                    metrics::record_transition(EventState::Observed, EventState::Confirmed);
                    debug!(key = %event.idempotency_key, head, "Event confirmed");
                    promoted += 1;
                }
            }
        }
        Ok(promoted)
    }

    /// Claim and drive every claimable event of one direction, at most
    /// `worker_concurrency` at a time
    pub async fn drive_pending(&self, direction: Direction) -> Result<DriveSummary> {
        let pending = self
            .store
            .list_claimable(direction, Utc::now(), self.batch_size)
            .await?;
        if pending.is_empty() {
            return Ok(DriveSummary::default());
        }

        let results: Vec<Result<DriveOutcome>> = stream::iter(pending)
            .map(|event| async move { self.drive_event(&event).await })
            .buffer_unordered(self.worker_concurrency)
            .collect()
            .await;

        let mut summary = DriveSummary::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    error!(direction = %direction, error = %e, "Relay drive failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            // Store trouble: stop claiming until the loop backs off
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Drive one `Confirmed` event as far as a single executor call allows
    pub async fn drive_event(&self, event: &BridgeEvent) -> Result<DriveOutcome> {
        let key = &event.idempotency_key;
        let claim = Transition::new(EventState::Confirmed, EventState::Submitting);
        let Some(claimed) = self.store.transition(key, &claim).await? else {
            debug!(key = %key, "Claim lost to another worker");
            return Ok(DriveOutcome::LostClaim);
        };
        metrics::record_transition(EventState::Confirmed, EventState::Submitting);

        if let Some(reason) = self.guard.reject_reason(&claimed) {
            warn!(key = %key, reason = %reason, "Event rejected by relay guard");
            return self
                .fail(key, FailureClass::Permanent, reason)
                .await
                .map(|_| DriveOutcome::Failed(FailureClass::Permanent));
        }

        if let Some(outcome) = self.resolve_from_ledger(&claimed).await? {
            return Ok(outcome);
        }

        let Some(ticket) = self.store.begin_attempt(key).await? else {
            return Ok(DriveOutcome::LostClaim);
        };
        let attempt_no = ticket.attempt_no;

        let chain = self.executor.target_chain(&claimed).to_string();
        let action = claimed.direction.action();
        info!(
            key = %key,
            attempt = attempt_no,
            chain = %chain,
            action = %action,
            amount = %claimed.amount,
            recipient = %claimed.recipient,
            "Executing bridge action"
        );

        match self.executor.execute(&claimed).await {
            Ok(tx_hash) => {
                self.store
                    .finish_attempt(key, attempt_no, AttemptOutcome::Submitted, Some(&tx_hash), None)
                    .await?;
                metrics::record_action(&chain, action.as_str(), "submitted");
                let submitted = Transition::new(EventState::Submitting, EventState::Submitted)
                    .clearing_error()
                    .with_dest_tx(Some(tx_hash.clone()));
                self.apply(key, &submitted).await?;
                info!(key = %key, tx_hash = %tx_hash, "Bridge action submitted");
                Ok(DriveOutcome::Submitted(tx_hash))
            }
            Err(ActionError::Rejected {
                already_processed: true,
                reason,
            }) => {
                self.store
                    .finish_attempt(key, attempt_no, AttemptOutcome::AlreadyProcessed, None, Some(&reason))
                    .await?;
                metrics::record_action(&chain, action.as_str(), "already_processed");
                let finalized = Transition::new(EventState::Submitting, EventState::Finalized)
                    .clearing_error();
                if let Some(done) = self.apply(key, &finalized).await? {
                    observe_finalized(&done);
                }
                info!(key = %key, reason = %reason, "Destination already processed this key; finalized");
                Ok(DriveOutcome::Finalized)
            }
            Err(err @ (ActionError::Permanent(_) | ActionError::Rejected { .. })) => {
                let message = err.to_string();
                self.store
                    .finish_attempt(key, attempt_no, AttemptOutcome::Failed, None, Some(&message))
                    .await?;
                metrics::record_action(&chain, action.as_str(), "permanent");
                error!(key = %key, error = %message, "Permanent executor failure");
                self.fail(key, FailureClass::Permanent, message).await?;
                Ok(DriveOutcome::Failed(FailureClass::Permanent))
            }
            Err(ActionError::Transient(message)) => {
                self.store
                    .finish_attempt(key, attempt_no, AttemptOutcome::Failed, None, Some(&message))
                    .await?;
                metrics::record_action(&chain, action.as_str(), "transient");

                if self.policy.within_budget(ticket.attempt_count) {
                    let retry_at = self.policy.next_retry_after(ticket.attempt_count, Utc::now());
                    warn!(
                        key = %key,
                        attempt = ticket.attempt_count,
                        max_attempts = self.policy.max_attempts,
                        retry_at = %retry_at,
                        error = %message,
                        "Transient executor failure, requeued"
                    );
                    let requeue = Transition::new(EventState::Submitting, EventState::Confirmed)
                        .with_error(message)
                        .retry_after(retry_at);
                    self.apply(key, &requeue).await?;
                    Ok(DriveOutcome::Requeued)
                } else {
                    error!(
                        key = %key,
                        attempt = ticket.attempt_count,
                        error = %message,
                        "Retry budget exhausted"
                    );
                    self.fail(key, FailureClass::Transient, message).await?;
                    Ok(DriveOutcome::Failed(FailureClass::Transient))
                }
            }
        }
    }

    /// Skip the executor when the attempt ledger shows an earlier attempt
    /// already reached the destination
    async fn resolve_from_ledger(&self, event: &BridgeEvent) -> Result<Option<DriveOutcome>> {
        let key = &event.idempotency_key;
        let Some(prior) = self.store.prior_success(key).await? else {
            return Ok(None);
        };

        let outcome = match prior.outcome {
            AttemptOutcome::Submitted => {
                let Some(tx_hash) = prior.dest_tx_hash.clone() else {
                    return Ok(None);
                };
                let submitted = Transition::new(EventState::Submitting, EventState::Submitted)
                    .with_dest_tx(Some(tx_hash.clone()));
                self.apply(key, &submitted).await?;
                DriveOutcome::Submitted(tx_hash)
            }
            _ => {
                let finalized = Transition::new(EventState::Submitting, EventState::Finalized)
                    .with_dest_tx(prior.dest_tx_hash.clone());
                if let Some(done) = self.apply(key, &finalized).await? {
                    observe_finalized(&done);
                }
                DriveOutcome::Finalized
            }
        };

        info!(
            key = %key,
            prior_attempt = prior.attempt_no,
            prior_outcome = %prior.outcome,
            "Earlier attempt already reached destination; executor skipped"
        );
        Ok(Some(outcome))
    }

    async fn fail(&self, key: &IdempotencyKey, class: FailureClass, error: String) -> Result<()> {
        let mut failed = Transition::new(EventState::Submitting, EventState::Failed)
            .with_error(error)
            .with_failure(class);
        if class == FailureClass::Transient {
            failed = failed.retry_after(Utc::now());
        }
        self.apply(key, &failed).await.map(|_| ())
    }

    async fn apply(&self, key: &IdempotencyKey, transition: &Transition) -> Result<Option<BridgeEvent>> {
        let updated = self.store.transition(key, transition).await?;
        match &updated {
            Some(_) => metrics::record_transition(transition.from, transition.to),
            None => warn!(
                key = %key,
                from = %transition.from,
                to = %transition.to,
                "Event left the expected state before the outcome was recorded"
            ),
        }
        Ok(updated)
    }

    pub async fn run(
        self,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let breaker = CircuitBreakerConfig::default();
        let policy = self.policy.clone();
        let this = &self;
        run_periodic("relay", interval, &policy, &breaker, shutdown, || async move {
            this.tick().await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdempotencyKey;

    fn event(asset: &str, amount: u128) -> BridgeEvent {
        let now = Utc::now();
        BridgeEvent {
            idempotency_key: IdempotencyKey::derive("chainA", "0xabc", 0),
            direction: Direction::SourceToDest,
            source_chain: "chainA".to_string(),
            source_tx_hash: "0xabc".to_string(),
            log_index: 0,
            source_block_number: 1,
            asset: asset.to_string(),
            amount: Amount::from_u128(amount),
            sender: "0x1".to_string(),
            recipient: "0x2".to_string(),
            state: EventState::Submitting,
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
        }
    }

    #[test]
    fn test_guard_accepts_everything_when_unconfigured() {
        let guard = RelayGuard::default();
        assert!(guard.reject_reason(&event("ANY", u128::MAX)).is_none());
    }

    #[test]
    fn test_guard_rejects_unsupported_asset_and_ceiling() {
        let guard = RelayGuard::new(vec!["ETR".to_string()], Some(Amount::from_u128(1_000)));
        assert!(guard.reject_reason(&event("ETR", 1_000)).is_none());
        assert!(guard.reject_reason(&event("XYZ", 1)).is_some());
        assert!(guard
            .reject_reason(&event("ETR", 1_001))
            .unwrap()
            .contains("ceiling"));
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = DriveSummary::default();
        summary.record(&DriveOutcome::LostClaim);
        summary.record(&DriveOutcome::Requeued);
        summary.record(&DriveOutcome::Submitted("0x1".to_string()));
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.lost, 1);
        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.submitted, 1);
    }
}
