//! Retry and error recovery
//!
//! Exponential backoff, error classification, the consecutive-failure
//! circuit breaker shared by every polling loop, and the Retry Scheduler
//! that moves `Failed` events back to `Confirmed` or on to `DeadLettered`.

use chrono::{DateTime, Utc};
use eyre::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::{AuditEntry, BridgeEvent, EventStore, Transition};
use crate::metrics;
use crate::types::{EventState, FailureClass};

/// Actor recorded in the audit log for automatic decisions
pub const SYSTEM_ACTOR: &str = "relayer";

/// Backoff and retry budget for relay attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Executor invocations allowed before an event is dead-lettered is
    /// `max_attempts + 1`
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// `min(initial * 2^attempt, max)`
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Whether another attempt fits in the budget after `attempt_count` attempts
    pub fn within_budget(&self, attempt_count: u32) -> bool {
        attempt_count <= self.max_attempts
    }

    /// The earliest time the event may be claimed again
    pub fn next_retry_after(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let backoff = self.backoff_for_attempt(attempt);
        now + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(60))
    }
}

/// Classification of chain adapter error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC timeout, connection loss, rate limit, nonce or fee contention
    Transient,
    /// The destination already executed this relay key
    AlreadyProcessed,
    /// Invalid parameters or a contract rule violation
    Permanent,
    /// Unrecognized; treated as transient so the retry budget bounds it
    Unknown,
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("already processed")
        || error_lower.contains("already relayed")
        || error_lower.contains("key already used")
    {
        return ErrorClass::AlreadyProcessed;
    }

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("nonce too low")
        || error_lower.contains("nonce too high")
        || error_lower.contains("already known")
        || error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("max fee per gas less than")
        || error_lower.contains("insufficient funds for gas")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("execution reverted")
        || error_lower.contains("reverted")
        || error_lower.contains("invalid recipient")
        || error_lower.contains("invalid address")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("unsupported asset")
        || error_lower.contains("exceeds limit")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Circuit breaker configuration for polling loops
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before pausing
    pub threshold: u32,
    /// How long to pause when the breaker trips
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(300),
        }
    }
}

/// Sleep unless shutdown is signalled first. Returns `false` on shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Drive `tick` every `interval` until shutdown.
///
/// A failed tick counts towards the circuit breaker and delays the next tick
/// by `policy.backoff_for_attempt(consecutive_failures)`.
pub async fn run_periodic<F, Fut>(
    component: &str,
    interval: Duration,
    policy: &RetryPolicy,
    breaker: &CircuitBreakerConfig,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut consecutive_failures = 0u32;
    info!(
        component,
        interval_ms = interval.as_millis() as u64,
        "Starting poll loop"
    );

    loop {
        if consecutive_failures >= breaker.threshold {
            warn!(
                component,
                failures = consecutive_failures,
                pause_secs = breaker.pause_duration.as_secs(),
                "Circuit breaker tripped, pausing"
            );
            if !sleep_or_shutdown(breaker.pause_duration, &mut shutdown).await {
                break;
            }
            consecutive_failures = 0;
        }

        let outcome = tokio::select! {
            res = tick() => res,
            _ = shutdown.changed() => break,
        };

        let delay = match outcome {
            Ok(()) => {
                consecutive_failures = 0;
                interval
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let error_class = classify_error(&e.to_string());
                let backoff = policy.backoff_for_attempt(consecutive_failures).max(interval);
                metrics::record_error(component, "tick");
                error!(
                    component,
                    error = %e,
                    ?error_class,
                    consecutive_failures,
                    next_backoff_ms = backoff.as_millis() as u64,
                    "Tick failed, will retry with backoff"
                );
                backoff
            }
        };
        metrics::set_consecutive_failures(component, consecutive_failures);

        if !sleep_or_shutdown(delay, &mut shutdown).await {
            break;
        }
    }

    info!(component, "Shutdown signal received, stopping");
    Ok(())
}

/// Outcome counts of one scheduler tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryTickSummary {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub waiting: usize,
}

/// Moves `Failed` events back into the pending queue or to `DeadLettered`
pub struct RetryScheduler {
    store: Arc<dyn EventStore>,
    policy: RetryPolicy,
    batch_size: i64,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn EventStore>, policy: RetryPolicy, batch_size: i64) -> Self {
        Self {
            store,
            policy,
            batch_size,
        }
    }

    pub async fn tick(&self) -> Result<RetryTickSummary> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<RetryTickSummary> {
        let failed = self
            .store
            .list_by_state(EventState::Failed, None, self.batch_size)
            .await?;
        let mut summary = RetryTickSummary::default();

        for event in failed {
            let permanent = event.failure_class == Some(FailureClass::Permanent);
            if permanent || !self.policy.within_budget(event.attempt_count) {
                if self.dead_letter(&event).await? {
                    summary.dead_lettered += 1;
                }
                continue;
            }

            if event.retry_after.map_or(false, |at| at > now) {
                summary.waiting += 1;
                continue;
            }

            let requeue = Transition::new(EventState::Failed, EventState::Confirmed);
            if self
                .store
                .transition(&event.idempotency_key, &requeue)
                .await?
                .is_some()
            {
                metrics::record_transition(EventState::Failed, EventState::Confirmed);
                info!(
                    key = %event.idempotency_key,
                    attempt_count = event.attempt_count,
                    "Requeued failed event for retry"
                );
                summary.requeued += 1;
            }
        }

        if summary != RetryTickSummary::default() {
            debug!(?summary, "Retry scheduler tick");
        }
        Ok(summary)
    }

    async fn dead_letter(&self, event: &BridgeEvent) -> Result<bool> {
        let mut transition = Transition::new(EventState::Failed, EventState::DeadLettered);
        if let Some(class) = event.failure_class {
            transition = transition.with_failure(class);
        }
        let Some(updated) = self
            .store
            .transition(&event.idempotency_key, &transition)
            .await?
        else {
            return Ok(false);
        };

        metrics::record_transition(EventState::Failed, EventState::DeadLettered);
        metrics::record_dead_letter(updated.failure_class);
        error!(
            key = %updated.idempotency_key,
            direction = %updated.direction,
            amount = %updated.amount,
            attempt_count = updated.attempt_count,
            failure_class = ?updated.failure_class,
            last_error = ?updated.last_error,
            "Event dead-lettered, operator action required"
        );
        self.store
            .record_audit(&AuditEntry::now(
                &updated.idempotency_key,
                "dead_lettered",
                SYSTEM_ACTOR,
                updated.last_error.clone(),
            ))
            .await?;
        Ok(true)
    }

    pub async fn run(self, interval: Duration, shutdown: watch::Receiver<bool>) -> Result<()> {
        let breaker = CircuitBreakerConfig::default();
        let policy = self.policy.clone();
        let this = &self;
        run_periodic("retry", interval, &policy, &breaker, shutdown, || async move {
            this.tick().await.map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_secs(16));
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_secs(30));
        assert_eq!(policy.backoff_for_attempt(64), Duration::from_secs(30));
    }

    #[test]
    fn test_budget_boundary() {
        let policy = RetryPolicy {
            max_attempts: 5,
            ..Default::default()
        };
        assert!(policy.within_budget(5));
        assert!(!policy.within_budget(6));
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error("request timeout"), ErrorClass::Transient);
        assert_eq!(classify_error("nonce too low"), ErrorClass::Transient);
        assert_eq!(
            classify_error("replacement transaction underpriced"),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error("execution reverted: invalid recipient"),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_error("execution reverted: already processed"),
            ErrorClass::AlreadyProcessed
        );
        assert_eq!(classify_error("weird"), ErrorClass::Unknown);
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown_stops_early() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }
}
