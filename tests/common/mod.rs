//! Scripted chains and a wired-up relay pipeline over the in-memory store

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_relayer::chain::{
    ActionError, ActionRequest, ChainHandle, ChainReader, ChainSet, ChainWriter, Completion,
    RawLog, TxStatus,
};
use bridge_relayer::db::{EventStore, MemoryEventStore};
use bridge_relayer::executor::ActionExecutor;
use bridge_relayer::observer::ChainObserver;
use bridge_relayer::reconcile::ReconciliationSweep;
use bridge_relayer::relay::{FinalityTracker, RelayEngine, RelayGuard};
use bridge_relayer::retry::{RetryPolicy, RetryScheduler};
use bridge_relayer::types::{ActionKind, BridgeEventKind, Direction, IdempotencyKey};

pub const SENDER: &str = "0x1111111111111111111111111111111111111111";

/// A chain whose head, logs and write outcomes are driven by the test.
///
/// Writes behave like the bridge vault contract: a key that was already
/// executed is rejected as already processed, so a double submit is visible
/// as a rejection rather than a second execution.
#[derive(Default)]
pub struct MockChain {
    head: Mutex<u64>,
    logs: Mutex<Vec<RawLog>>,
    /// Outcomes for the next writes; a successful default when empty
    script: Mutex<VecDeque<Result<(), ActionError>>>,
    /// Key -> executing tx
    processed: Mutex<HashMap<IdempotencyKey, String>>,
    statuses: Mutex<HashMap<String, TxStatus>>,
    calls: Mutex<Vec<(ActionKind, ActionRequest)>>,
    executed: Mutex<Vec<(ActionKind, ActionRequest)>>,
    /// Leave the tx out of the status table to simulate a dropped broadcast
    hide_new_txs: Mutex<bool>,
    /// Include new txs as reverted
    revert_new_txs: Mutex<bool>,
    unreachable: Mutex<HashSet<&'static str>>,
}

impl MockChain {
    pub fn new(head: u64) -> Arc<Self> {
        let chain = Self::default();
        *chain.head.lock().unwrap() = head;
        Arc::new(chain)
    }

    pub fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    pub fn head(&self) -> u64 {
        *self.head.lock().unwrap()
    }

    pub fn push_log(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), ActionError>>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn transient_failures(&self, n: usize) {
        self.script((0..n).map(|i| Err(ActionError::Transient(format!("request timeout #{}", i)))));
    }

    pub fn hide_new_txs(&self, hide: bool) {
        *self.hide_new_txs.lock().unwrap() = hide;
    }

    pub fn revert_new_txs(&self, revert: bool) {
        *self.revert_new_txs.lock().unwrap() = revert;
    }

    /// Make one RPC (`head_block`, `logs`, `completion`) fail until cleared
    pub fn set_unreachable(&self, call: &'static str, down: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if down {
            set.insert(call);
        } else {
            set.remove(call);
        }
    }

    /// Mark `key` executed on-chain out of band
    pub fn mark_processed(&self, key: &IdempotencyKey, tx_hash: &str) {
        self.processed
            .lock()
            .unwrap()
            .insert(key.clone(), tx_hash.to_string());
    }

    pub fn set_status(&self, tx_hash: &str, status: TxStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(tx_hash.to_string(), status);
    }

    /// Every write call, including failed ones
    pub fn calls(&self) -> Vec<(ActionKind, ActionRequest)> {
        self.calls.lock().unwrap().clone()
    }

    /// Writes that actually executed
    pub fn executed(&self) -> Vec<(ActionKind, ActionRequest)> {
        self.executed.lock().unwrap().clone()
    }

    fn check(&self, call: &'static str) -> eyre::Result<()> {
        if self.unreachable.lock().unwrap().contains(call) {
            return Err(eyre::eyre!("connection refused ({})", call));
        }
        Ok(())
    }

    fn write(&self, kind: ActionKind, request: &ActionRequest) -> Result<String, ActionError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((kind, request.clone()));
            calls.len()
        };

        if self
            .processed
            .lock()
            .unwrap()
            .contains_key(&request.idempotency_key)
        {
            return Err(ActionError::Rejected {
                already_processed: true,
                reason: "relay key already processed".to_string(),
            });
        }

        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            outcome?;
        }

        let tx_hash = format!("0x{:064x}", n);
        let head = self.head();

        if *self.revert_new_txs.lock().unwrap() {
            self.set_status(
                &tx_hash,
                TxStatus::Included {
                    block_number: head,
                    success: false,
                },
            );
            return Ok(tx_hash);
        }

        self.executed.lock().unwrap().push((kind, request.clone()));
        self.mark_processed(&request.idempotency_key, &tx_hash);
        if !*self.hide_new_txs.lock().unwrap() {
            self.set_status(
                &tx_hash,
                TxStatus::Included {
                    block_number: head,
                    success: true,
                },
            );
        }
        Ok(tx_hash)
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn head_block(&self) -> eyre::Result<u64> {
        self.check("head")?;
        Ok(self.head())
    }

    async fn logs_in_range(&self, from: u64, to: u64) -> eyre::Result<Vec<RawLog>> {
        self.check("logs")?;
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.block_number >= from && l.block_number <= to)
            .cloned()
            .collect())
    }

    async fn transaction_status(&self, tx_hash: &str) -> eyre::Result<TxStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(tx_hash)
            .copied()
            .unwrap_or(TxStatus::NotFound))
    }

    async fn find_completion(&self, key: &IdempotencyKey) -> eyre::Result<Option<Completion>> {
        self.check("completion")?;
        Ok(self
            .processed
            .lock()
            .unwrap()
            .get(key)
            .map(|tx| Completion {
                dest_tx_hash: Some(tx.clone()),
            }))
    }
}

#[async_trait]
impl ChainWriter for MockChain {
    async fn submit_mint(&self, request: &ActionRequest) -> Result<String, ActionError> {
        self.write(ActionKind::Mint, request)
    }

    async fn submit_release(&self, request: &ActionRequest) -> Result<String, ActionError> {
        self.write(ActionKind::Release, request)
    }
}

pub fn handle(key: &str, depth: u64, chain: &Arc<MockChain>) -> ChainHandle {
    ChainHandle {
        key: key.to_string(),
        confirmation_depth: depth,
        reader: chain.clone(),
        writer: chain.clone(),
    }
}

pub fn locked_log(block: u64, tx_hash: &str, log_index: u64, amount: &str, recipient: &str) -> RawLog {
    RawLog {
        block_number: block,
        tx_hash: Some(tx_hash.to_string()),
        log_index: Some(log_index),
        kind: BridgeEventKind::Locked,
        asset: "ETR".to_string(),
        amount: amount.to_string(),
        sender: SENDER.to_string(),
        recipient: recipient.to_string(),
        decode_error: None,
    }
}

pub fn burned_log(block: u64, tx_hash: &str, log_index: u64, amount: &str, recipient: &str) -> RawLog {
    RawLog {
        kind: BridgeEventKind::Burned,
        ..locked_log(block, tx_hash, log_index, amount, recipient)
    }
}

/// Both chains, the store and every relay component, with zero backoff
pub struct Harness {
    pub store: Arc<MemoryEventStore>,
    pub source: Arc<MockChain>,
    pub dest: Arc<MockChain>,
    pub chains: ChainSet,
    pub policy: RetryPolicy,
}

impl Harness {
    pub fn new(confirmation_depth: u64, max_attempts: u32) -> Self {
        let source = MockChain::new(0);
        let dest = MockChain::new(0);
        let chains = ChainSet {
            source: handle("chainA", confirmation_depth, &source),
            destination: handle("chainB", confirmation_depth, &dest),
        };
        Self {
            store: Arc::new(MemoryEventStore::new()),
            source,
            dest,
            chains,
            policy: RetryPolicy {
                max_attempts,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
        }
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    pub fn source_observer(&self) -> ChainObserver {
        ChainObserver::new(
            self.chains.source.clone(),
            Direction::SourceToDest,
            self.store(),
            1000,
            0,
        )
    }

    pub fn dest_observer(&self) -> ChainObserver {
        ChainObserver::new(
            self.chains.destination.clone(),
            Direction::DestToSource,
            self.store(),
            1000,
            0,
        )
    }

    pub fn executor(&self) -> ActionExecutor {
        ActionExecutor::new(self.chains.clone(), Duration::from_secs(5))
    }

    pub fn engine(&self) -> RelayEngine {
        self.engine_with(RelayGuard::default(), 4)
    }

    pub fn engine_with(&self, guard: RelayGuard, workers: usize) -> RelayEngine {
        RelayEngine::new(
            self.store(),
            self.chains.clone(),
            self.executor(),
            self.policy.clone(),
            guard,
            workers,
            100,
        )
    }

    /// Drop timeout of zero: an unknown tx counts as dropped at once
    pub fn finality(&self) -> FinalityTracker {
        FinalityTracker::new(
            self.store(),
            self.chains.clone(),
            self.policy.clone(),
            Duration::ZERO,
            100,
        )
    }

    pub fn scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(self.store(), self.policy.clone(), 100)
    }

    pub fn sweep(&self, submitting_timeout: Duration) -> ReconciliationSweep {
        ReconciliationSweep::new(self.store(), self.chains.clone(), submitting_timeout, 100)
    }

    /// Run every component once, in pipeline order
    pub async fn step(&self) {
        self.source_observer().poll_new_events().await.unwrap();
        self.dest_observer().poll_new_events().await.unwrap();
        self.engine().tick().await.unwrap();
        self.finality().tick().await.unwrap();
        self.scheduler().tick().await.unwrap();
    }
}
