//! Chain Observers
//!
//! One observer per chain scans finalized-enough blocks for bridge logs and
//! upserts them into the Event Store as `Observed`. The per-chain cursor only
//! moves after every event in the scanned range has been persisted.

use eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainHandle, ChainSet};
use crate::db::{EventStore, SkippedLog, UpsertOutcome};
use crate::metrics;
use crate::retry::{run_periodic, CircuitBreakerConfig, RetryPolicy};
use crate::types::Direction;

pub mod normalize;

pub use normalize::{normalize, Normalized};

/// Counts from one `poll_new_events` call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    /// Inclusive block range scanned, if any
    pub range: Option<(u64, u64)>,
    pub inserted: usize,
    pub duplicates: usize,
    pub conflicts: usize,
    pub skipped: usize,
    /// Block where scanning stopped because a log had no tx hash
    pub deferred_at: Option<u64>,
    /// Cursor after this poll
    pub cursor: Option<u64>,
}

/// Scans one chain for the bridge events of one direction
pub struct ChainObserver {
    chain: ChainHandle,
    direction: Direction,
    store: Arc<dyn EventStore>,
    max_block_range: u64,
    start_block: u64,
}

impl ChainObserver {
    pub fn new(
        chain: ChainHandle,
        direction: Direction,
        store: Arc<dyn EventStore>,
        max_block_range: u64,
        start_block: u64,
    ) -> Self {
        Self {
            chain,
            direction,
            store,
            max_block_range: max_block_range.max(1),
            start_block,
        }
    }

    pub fn chain_key(&self) -> &str {
        &self.chain.key
    }

    /// Scan the next block range up to `head - confirmation_depth`
    pub async fn poll_new_events(&self) -> Result<PollSummary> {
        let key = self.chain.key.as_str();
        let cursor = self.store.get_cursor(key).await?;
        let head = self.chain.reader.head_block().await?;

        let mut summary = PollSummary {
            cursor,
            ..Default::default()
        };

        let Some(safe) = head.checked_sub(self.chain.confirmation_depth) else {
            return Ok(summary);
        };
        let from = cursor.map_or(self.start_block, |c| c + 1);
        if safe < from {
            return Ok(summary);
        }
        let to = safe.min(from.saturating_add(self.max_block_range - 1));
        summary.range = Some((from, to));

        debug!(chain = key, from, to, head, "Scanning block range");

        let mut logs = self.chain.reader.logs_in_range(from, to).await?;
        logs.retain(|l| l.block_number >= from && l.block_number <= to);
        logs.sort_by_key(|l| (l.block_number, l.log_index.unwrap_or(u64::MAX)));

        for raw in &logs {
            match normalize(key, self.direction, raw) {
                Normalized::Defer => {
                    warn!(
                        chain = key,
                        block = raw.block_number,
                        log_index = ?raw.log_index,
                        "Log without transaction hash, deferring block"
                    );
                    summary.deferred_at = Some(raw.block_number);
                    break;
                }
                Normalized::Skip(reason) => {
                    error!(
                        chain = key,
                        block = raw.block_number,
                        tx_hash = ?raw.tx_hash,
                        log_index = ?raw.log_index,
                        amount = %raw.amount,
                        reason = %reason,
                        "Skipping malformed bridge log"
                    );
                    self.store
                        .record_skipped_log(&SkippedLog {
                            chain: key.to_string(),
                            block_number: raw.block_number,
                            tx_hash: raw.tx_hash.clone(),
                            log_index: raw.log_index,
                            reason,
                        })
                        .await?;
                    metrics::record_skipped_log(key);
                    summary.skipped += 1;
                }
                Normalized::Event(event) => match self.store.upsert_observed(&event).await? {
                    UpsertOutcome::Inserted(stored) => {
                        info!(
                            chain = key,
                            key = %stored.idempotency_key,
                            direction = %stored.direction,
                            asset = %stored.asset,
                            amount = %stored.amount,
                            recipient = %stored.recipient,
                            block = stored.source_block_number,
                            "New bridge event observed"
                        );
                        metrics::record_event_observed(key, stored.direction.as_str());
                        summary.inserted += 1;
                    }
                    UpsertOutcome::Duplicate(stored) => {
                        debug!(
                            chain = key,
                            key = %stored.idempotency_key,
                            observations = stored.observation_count,
                            "Duplicate observation collapsed"
                        );
                        metrics::record_duplicate_observation(key);
                        summary.duplicates += 1;
                    }
                    UpsertOutcome::Conflict(stored) => {
                        error!(
                            chain = key,
                            key = %stored.idempotency_key,
                            stored_amount = %stored.amount,
                            observed_amount = %event.amount,
                            stored_recipient = %stored.recipient,
                            observed_recipient = %event.recipient,
                            "Observation conflicts with stored event payload; keeping stored row"
                        );
                        metrics::record_payload_conflict(key);
                        summary.conflicts += 1;
                    }
                },
            }
        }

        let new_cursor = match summary.deferred_at {
            Some(block) => block.checked_sub(1),
            None => Some(to),
        };
        if let Some(next) = new_cursor.filter(|c| *c >= from) {
            self.store.set_cursor(key, next).await?;
            metrics::record_blocks_processed(key, from, next);
            summary.cursor = Some(next);
        }
        metrics::record_successful_poll(key);

        Ok(summary)
    }

    /// Poll until shutdown, backing off on consecutive failures
    pub async fn run(
        self,
        interval: Duration,
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let component = format!("observer:{}", self.chain.key);
        let breaker = CircuitBreakerConfig::default();
        let this = &self;
        run_periodic(&component, interval, &policy, &breaker, shutdown, || async move {
            this.poll_new_events().await.map(|_| ())
        })
        .await
    }
}

/// Runs the observers for both chains
pub struct ObserverManager {
    observers: Vec<ChainObserver>,
}

impl ObserverManager {
    /// Source observer watches `Locked`; destination observer watches `Burned`
    pub fn new(
        chains: &ChainSet,
        store: Arc<dyn EventStore>,
        max_block_range: u64,
        start_blocks: (u64, u64),
    ) -> Self {
        let observers = vec![
            ChainObserver::new(
                chains.source.clone(),
                Direction::SourceToDest,
                store.clone(),
                max_block_range,
                start_blocks.0,
            ),
            ChainObserver::new(
                chains.destination.clone(),
                Direction::DestToSource,
                store,
                max_block_range,
                start_blocks.1,
            ),
        ];
        info!(
            chains = ?observers.iter().map(|o| o.chain_key()).collect::<Vec<_>>(),
            "Observer manager created"
        );
        Self { observers }
    }

    /// Run all observers until shutdown or until one fails
    pub async fn run(
        self,
        interval: Duration,
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut join_set = JoinSet::new();
        for observer in self.observers {
            join_set.spawn(observer.run(interval, policy.clone(), shutdown.clone()));
        }

        while let Some(done) = join_set.join_next().await {
            match done {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("An observer stopped with error: {:?}", e);
                    join_set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    error!("An observer task panicked: {:?}", e);
                    join_set.abort_all();
                    return Err(eyre::eyre!("observer task panicked: {}", e));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{
        ActionError, ActionRequest, ChainReader, ChainWriter, Completion, RawLog, TxStatus,
    };
    use crate::db::MemoryEventStore;
    use crate::types::{BridgeEventKind, EventState, IdempotencyKey};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubChain {
        head: Mutex<u64>,
        logs: Mutex<Vec<RawLog>>,
        fail_logs: Mutex<bool>,
    }

    #[async_trait]
    impl ChainReader for StubChain {
        async fn head_block(&self) -> Result<u64> {
            Ok(*self.head.lock().unwrap())
        }

        async fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<RawLog>> {
            if *self.fail_logs.lock().unwrap() {
                return Err(eyre::eyre!("connection reset"));
            }
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.block_number >= from && l.block_number <= to)
                .cloned()
                .collect())
        }

        async fn transaction_status(&self, _tx_hash: &str) -> Result<TxStatus> {
            Ok(TxStatus::NotFound)
        }

        async fn find_completion(&self, _key: &IdempotencyKey) -> Result<Option<Completion>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl ChainWriter for StubChain {
        async fn submit_mint(&self, _r: &ActionRequest) -> Result<String, ActionError> {
            Err(ActionError::Permanent("read-only".to_string()))
        }

        async fn submit_release(&self, _r: &ActionRequest) -> Result<String, ActionError> {
            Err(ActionError::Permanent("read-only".to_string()))
        }
    }

    fn lock_log(block: u64, tx: Option<&str>, index: u64, amount: &str) -> RawLog {
        RawLog {
            block_number: block,
            tx_hash: tx.map(str::to_string),
            log_index: Some(index),
            kind: BridgeEventKind::Locked,
            asset: "ETR".to_string(),
            amount: amount.to_string(),
            sender: "0x1111111111111111111111111111111111111111".to_string(),
            recipient: "0xDEAD".to_string(),
            decode_error: None,
        }
    }

    fn setup(head: u64, logs: Vec<RawLog>) -> (Arc<StubChain>, Arc<MemoryEventStore>, ChainObserver) {
        let stub = Arc::new(StubChain {
            head: Mutex::new(head),
            logs: Mutex::new(logs),
            fail_logs: Mutex::new(false),
        });
        let handle = ChainHandle {
            key: "chainA".to_string(),
            confirmation_depth: 2,
            reader: stub.clone(),
            writer: stub.clone(),
        };
        let store = Arc::new(MemoryEventStore::new());
        let observer = ChainObserver::new(handle, Direction::SourceToDest, store.clone(), 100, 1);
        (stub, store, observer)
    }

    #[tokio::test]
    async fn test_poll_respects_confirmation_depth() {
        let (stub, store, observer) = setup(
            12,
            vec![lock_log(5, Some("0xa"), 0, "10"), lock_log(11, Some("0xb"), 0, "20")],
        );

        let summary = observer.poll_new_events().await.unwrap();
        assert_eq!(summary.range, Some((1, 10)));
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.get_cursor("chainA").await.unwrap(), Some(10));

        *stub.head.lock().unwrap() = 13;
        let summary = observer.poll_new_events().await.unwrap();
        assert_eq!(summary.range, Some((11, 11)));
        assert_eq!(summary.inserted, 1);

        let key = IdempotencyKey::derive("chainA", "0xb", 0);
        let event = store.get_event(&key).await.unwrap().unwrap();
        assert_eq!(event.state, EventState::Observed);
    }

    #[tokio::test]
    async fn test_rescan_collapses_duplicates() {
        let (_stub, store, observer) = setup(20, vec![lock_log(5, Some("0xa"), 0, "10")]);
        observer.poll_new_events().await.unwrap();

        // a second observer with no cursor re-reads the same range
        store.set_cursor("chainA", 0).await.unwrap();
        let summary = observer.poll_new_events().await.unwrap();
        assert_eq!(summary.duplicates, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_rpc_failure_keeps_cursor() {
        let (stub, store, observer) = setup(20, vec![lock_log(5, Some("0xa"), 0, "10")]);
        *stub.fail_logs.lock().unwrap() = true;
        assert!(observer.poll_new_events().await.is_err());
        assert_eq!(store.get_cursor("chainA").await.unwrap(), None);

        *stub.fail_logs.lock().unwrap() = false;
        observer.poll_new_events().await.unwrap();
        assert_eq!(store.get_cursor("chainA").await.unwrap(), Some(18));
    }

    #[tokio::test]
    async fn test_malformed_log_is_recorded_and_cursor_advances() {
        let (_stub, store, observer) = setup(
            20,
            vec![
                lock_log(4, Some("0xa"), 0, "not-a-number"),
                lock_log(6, Some("0xb"), 1, "7"),
            ],
        );
        let summary = observer.poll_new_events().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.get_cursor("chainA").await.unwrap(), Some(18));

        let skipped = store.list_skipped_logs("chainA", 10).await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].block_number, 4);
    }

    #[tokio::test]
    async fn test_missing_tx_hash_defers_cursor() {
        let (stub, store, observer) = setup(
            20,
            vec![lock_log(4, Some("0xa"), 0, "1"), lock_log(9, None, 0, "2")],
        );
        let summary = observer.poll_new_events().await.unwrap();
        assert_eq!(summary.deferred_at, Some(9));
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.get_cursor("chainA").await.unwrap(), Some(8));

        stub.logs.lock().unwrap()[1].tx_hash = Some("0xc".to_string());
        let summary = observer.poll_new_events().await.unwrap();
        assert_eq!(summary.range, Some((9, 18)));
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.get_cursor("chainA").await.unwrap(), Some(18));
    }

    #[tokio::test]
    async fn test_oversized_and_undecodable_logs_do_not_pin_cursor() {
        let mut long_recipient = lock_log(5, Some("0xa"), 0, "10");
        long_recipient.recipient = "x".repeat(200);
        let mut undecodable = lock_log(5, Some("0xa"), 1, "");
        undecodable.sender = String::new();
        undecodable.recipient = String::new();
        undecodable.decode_error = Some("buffer overrun".to_string());

        let (_stub, store, observer) = setup(
            20,
            vec![long_recipient, undecodable, lock_log(6, Some("0xb"), 0, "7")],
        );
        let summary = observer.poll_new_events().await.unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.get_cursor("chainA").await.unwrap(), Some(18));

        let later = IdempotencyKey::derive("chainA", "0xb", 0);
        assert!(store.get_event(&later).await.unwrap().is_some());

        let skipped = store.list_skipped_logs("chainA", 10).await.unwrap();
        assert_eq!(skipped.len(), 2);
        assert!(skipped.iter().any(|s| s.reason.starts_with("undecodable")));
    }
}
