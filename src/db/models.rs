use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::types::{Amount, Direction, EventState, FailureClass, IdempotencyKey, ParseError};

/// Width of `bridge_events.asset`. A bytes32 asset that is not a symbol is
/// stored as 0x-prefixed hex (66 characters).
pub const MAX_ASSET_LEN: usize = 130;
/// Width of `bridge_events.sender` and `bridge_events.recipient`
pub const MAX_ADDRESS_LEN: usize = 130;
/// Width of `bridge_events.source_tx_hash`
pub const MAX_TX_HASH_LEN: usize = 130;

// Amounts are stored as NUMERIC(78,0). They travel through SQL as text
// ($n::NUMERIC on write, amount::TEXT on read) and are parsed into `Amount`.

/// The canonical unit of relay work, one row per idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub idempotency_key: IdempotencyKey,
    pub direction: Direction,
    pub source_chain: String,
    pub source_tx_hash: String,
    pub log_index: u64,
    pub source_block_number: u64,
    pub asset: String,
    pub amount: Amount,
    pub sender: String,
    pub recipient: String,
    pub state: EventState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub failure_class: Option<FailureClass>,
    pub dest_tx_hash: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub observation_count: u32,
    pub last_observed_at: DateTime<Utc>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BridgeEvent {
    /// Whether a duplicate observation carries the same payload as this row
    pub fn same_payload(&self, candidate: &NewBridgeEvent) -> bool {
        self.direction == candidate.direction
            && self.asset == candidate.asset
            && self.amount == candidate.amount
            && self.sender == candidate.sender
            && self.recipient == candidate.recipient
            && self.source_block_number == candidate.source_block_number
    }
}

/// A normalized observation produced by a Chain Observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBridgeEvent {
    pub idempotency_key: IdempotencyKey,
    pub direction: Direction,
    pub source_chain: String,
    pub source_tx_hash: String,
    pub log_index: u64,
    pub source_block_number: u64,
    pub asset: String,
    pub amount: Amount,
    pub sender: String,
    pub recipient: String,
}

/// Result of an upsert-on-conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First sighting; row created in `Observed`
    Inserted(BridgeEvent),
    /// Key already present with the same payload; row unchanged
    Duplicate(BridgeEvent),
    /// Key already present but the payload differs; row unchanged
    Conflict(BridgeEvent),
}

impl UpsertOutcome {
    pub fn event(&self) -> &BridgeEvent {
        match self {
            UpsertOutcome::Inserted(e) | UpsertOutcome::Duplicate(e) | UpsertOutcome::Conflict(e) => e,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

/// A compare-and-swap state change.
///
/// Applied only if the row is still in `from`. `retry_after` and
/// `failure_class` are always overwritten; `last_error` and `dest_tx_hash`
/// are kept unless set here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: EventState,
    pub to: EventState,
    pub last_error: Option<String>,
    pub clear_error: bool,
    pub dest_tx_hash: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub failure_class: Option<FailureClass>,
}

impl Transition {
    pub fn new(from: EventState, to: EventState) -> Self {
        Self {
            from,
            to,
            last_error: None,
            clear_error: false,
            dest_tx_hash: None,
            retry_after: None,
            failure_class: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self.clear_error = false;
        self
    }

    pub fn clearing_error(mut self) -> Self {
        self.last_error = None;
        self.clear_error = true;
        self
    }

    pub fn with_dest_tx(mut self, tx_hash: Option<String>) -> Self {
        self.dest_tx_hash = tx_hash;
        self
    }

    pub fn retry_after(mut self, at: DateTime<Utc>) -> Self {
        self.retry_after = Some(at);
        self
    }

    pub fn with_failure(mut self, class: FailureClass) -> Self {
        self.failure_class = Some(class);
        self
    }
}

/// Outcome of one Action Executor invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Recorded before the executor runs
    InFlight,
    Submitted,
    AlreadyProcessed,
    Finalized,
    Reverted,
    Failed,
}

impl AttemptOutcome {
    const ALL: [AttemptOutcome; 6] = [
        AttemptOutcome::InFlight,
        AttemptOutcome::Submitted,
        AttemptOutcome::AlreadyProcessed,
        AttemptOutcome::Finalized,
        AttemptOutcome::Reverted,
        AttemptOutcome::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::InFlight => "in_flight",
            AttemptOutcome::Submitted => "submitted",
            AttemptOutcome::AlreadyProcessed => "already_processed",
            AttemptOutcome::Finalized => "finalized",
            AttemptOutcome::Reverted => "reverted",
            AttemptOutcome::Failed => "failed",
        }
    }

    /// The destination accepted the action (or already had it)
    pub fn reached_destination(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Submitted | AttemptOutcome::AlreadyProcessed | AttemptOutcome::Finalized
        )
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttemptOutcome::ALL
            .iter()
            .copied()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| ParseError::UnknownAttemptOutcome(s.to_string()))
    }
}

/// Returned by `begin_attempt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTicket {
    /// Ledger sequence number, unique per key for the lifetime of the event
    pub attempt_no: u32,
    /// Attempts counted against the retry budget; reset by an operator retry
    pub attempt_count: u32,
}

/// Ledger row for one relay attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAttempt {
    pub idempotency_key: IdempotencyKey,
    pub attempt_no: u32,
    pub outcome: AttemptOutcome,
    pub dest_tx_hash: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A chain log the observer could not normalize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLog {
    pub chain: String,
    pub block_number: u64,
    pub tx_hash: Option<String>,
    pub log_index: Option<u64>,
    pub reason: String,
}

/// Audit trail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub idempotency_key: IdempotencyKey,
    pub action: String,
    pub actor: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn now(
        key: &IdempotencyKey,
        action: impl Into<String>,
        actor: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            idempotency_key: key.clone(),
            action: action.into(),
            actor: actor.into(),
            detail,
            created_at: Utc::now(),
        }
    }
}

/// Event counts per state for the status surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub by_state: BTreeMap<String, i64>,
    pub discarded: i64,
}

impl StateCounts {
    pub fn get(&self, state: EventState) -> i64 {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }

    /// Counts with every state present, zero-filled
    pub fn zero_filled(mut self) -> Self {
        for state in EventState::ALL {
            self.by_state.entry(state.as_str().to_string()).or_insert(0);
        }
        self
    }
}
