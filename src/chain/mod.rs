//! Chain interfaces
//!
//! The relay core only talks to chains through `ChainReader` and
//! `ChainWriter`. `evm` provides the alloy-backed implementation used by the
//! binary; tests plug in scripted chains.

use async_trait::async_trait;
use eyre::Result;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{Amount, BridgeEventKind, Direction, IdempotencyKey};

pub mod evm;

pub use evm::EvmChain;

/// A bridge log as reported by the chain, before normalization.
///
/// Fields are kept loose on purpose: the observer validates them and
/// records anything unusable as a skipped log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: u64,
    pub tx_hash: Option<String>,
    pub log_index: Option<u64>,
    pub kind: BridgeEventKind,
    pub asset: String,
    /// Base-10 amount text
    pub amount: String,
    pub sender: String,
    pub recipient: String,
    /// Set when the log carries a bridge event signature but its payload
    /// could not be decoded; the payload fields are then empty
    pub decode_error: Option<String>,
}

/// Status of a destination transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Known to the node but not yet in a block
    Pending,
    Included { block_number: u64, success: bool },
    /// Unknown to the node (never broadcast, dropped, or reorged out)
    NotFound,
}

/// Destination-side evidence that an action for a key already executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Hash of the executing transaction, when the chain can tell us
    pub dest_tx_hash: Option<String>,
}

/// Read access to one chain
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn head_block(&self) -> Result<u64>;

    /// Bridge logs in `from..=to`
    async fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<RawLog>>;

    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus>;

    /// Look for evidence that the action for `key` already executed here
    async fn find_completion(&self, key: &IdempotencyKey) -> Result<Option<Completion>>;
}

/// Parameters handed to a destination write, copied verbatim from the event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub asset: String,
    pub amount: Amount,
    pub recipient: String,
    pub idempotency_key: IdempotencyKey,
}

/// Failure of a destination write
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    /// Worth retrying: timeouts, connection loss, rate limits, nonce races
    #[error("transient: {0}")]
    Transient(String),
    /// Never retried automatically: bad recipient, unsupported asset
    #[error("permanent: {0}")]
    Permanent(String),
    /// The destination refused the action
    #[error("rejected (already_processed = {already_processed}): {reason}")]
    Rejected {
        already_processed: bool,
        reason: String,
    },
}

/// Write access to one chain. Implementations must pass the idempotency key
/// through to the destination when it can dedupe natively.
#[async_trait]
pub trait ChainWriter: Send + Sync {
    /// Returns the destination transaction hash
    async fn submit_mint(&self, request: &ActionRequest) -> Result<String, ActionError>;

    async fn submit_release(&self, request: &ActionRequest) -> Result<String, ActionError>;
}

/// A configured chain, built once at start and shared by every component
#[derive(Clone)]
pub struct ChainHandle {
    pub key: String,
    pub confirmation_depth: u64,
    pub reader: Arc<dyn ChainReader>,
    pub writer: Arc<dyn ChainWriter>,
}

impl std::fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHandle")
            .field("key", &self.key)
            .field("confirmation_depth", &self.confirmation_depth)
            .finish_non_exhaustive()
    }
}

/// The two chains one relayer instance bridges
#[derive(Debug, Clone)]
pub struct ChainSet {
    pub source: ChainHandle,
    pub destination: ChainHandle,
}

impl ChainSet {
    /// Chain that emits the triggering event for `direction`
    pub fn origin(&self, direction: Direction) -> &ChainHandle {
        match direction {
            Direction::SourceToDest => &self.source,
            Direction::DestToSource => &self.destination,
        }
    }

    /// Chain the action is executed on for `direction`
    pub fn target(&self, direction: Direction) -> &ChainHandle {
        match direction {
            Direction::SourceToDest => &self.destination,
            Direction::DestToSource => &self.source,
        }
    }
}
