//! Common types for the relay pipeline
//!
//! Directions, event states, exact amounts and idempotency keys. Everything
//! that crosses the Event Store boundary is defined here so both store
//! implementations agree on the string forms.

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::hash::keccak256;

/// Errors produced when parsing stored or observed values
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid amount {0:?}: expected a base-10 unsigned integer")]
    InvalidAmount(String),
    #[error("unknown direction {0:?}")]
    UnknownDirection(String),
    #[error("unknown event state {0:?}")]
    UnknownState(String),
    #[error("unknown failure class {0:?}")]
    UnknownFailureClass(String),
    #[error("unknown attempt outcome {0:?}")]
    UnknownAttemptOutcome(String),
    #[error("invalid idempotency key {0:?}")]
    InvalidKey(String),
}

// ============================================================================
// Direction / action
// ============================================================================

/// Which way value moves across the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// `Locked` on the source chain, `mint` on the destination chain
    SourceToDest,
    /// `Burned` on the destination chain, `release` on the source chain
    DestToSource,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::SourceToDest, Direction::DestToSource];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SourceToDest => "source_to_dest",
            Direction::DestToSource => "dest_to_source",
        }
    }

    /// Action performed on the target chain for this direction
    pub fn action(&self) -> ActionKind {
        match self {
            Direction::SourceToDest => ActionKind::Mint,
            Direction::DestToSource => ActionKind::Release,
        }
    }

    /// Event kind the origin chain must emit for this direction
    pub fn expected_event(&self) -> BridgeEventKind {
        match self {
            Direction::SourceToDest => BridgeEventKind::Locked,
            Direction::DestToSource => BridgeEventKind::Burned,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source_to_dest" => Ok(Direction::SourceToDest),
            "dest_to_source" => Ok(Direction::DestToSource),
            other => Err(ParseError::UnknownDirection(other.to_string())),
        }
    }
}

/// Destination-side write performed by the Action Executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Mint,
    Release,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Mint => "mint",
            ActionKind::Release => "release",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-chain event kinds the observers extract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeEventKind {
    Locked,
    Burned,
}

// ============================================================================
// Event state machine
// ============================================================================

/// Lifecycle state of a `BridgeEvent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Observed,
    Confirmed,
    Submitting,
    Submitted,
    Finalized,
    Failed,
    DeadLettered,
}

impl EventState {
    pub const ALL: [EventState; 7] = [
        EventState::Observed,
        EventState::Confirmed,
        EventState::Submitting,
        EventState::Submitted,
        EventState::Finalized,
        EventState::Failed,
        EventState::DeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Observed => "observed",
            EventState::Confirmed => "confirmed",
            EventState::Submitting => "submitting",
            EventState::Submitted => "submitted",
            EventState::Finalized => "finalized",
            EventState::Failed => "failed",
            EventState::DeadLettered => "dead_lettered",
        }
    }

    /// Terminal states are retained for audit and never advanced automatically
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventState::Finalized | EventState::DeadLettered)
    }

    /// Whether `self -> next` is an edge of the relay state machine.
    ///
    /// `DeadLettered -> Confirmed` is only reachable through the operator
    /// requeue path, which also resets the attempt counter.
    pub fn can_transition_to(&self, next: EventState) -> bool {
        use EventState::*;
        matches!(
            (self, next),
            (Observed, Confirmed)
                | (Confirmed, Submitting)
                | (Submitting, Submitted)
                | (Submitting, Finalized)
                | (Submitting, Confirmed)
                | (Submitting, Failed)
                | (Submitted, Finalized)
                | (Submitted, Failed)
                | (Failed, Confirmed)
                | (Failed, DeadLettered)
                | (DeadLettered, Confirmed)
        )
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseError::UnknownState(s.to_string()))
    }
}

/// Why an event sits in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retry budget applies
    Transient,
    /// Never retried automatically
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureClass {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(FailureClass::Transient),
            "permanent" => Ok(FailureClass::Permanent),
            other => Err(ParseError::UnknownFailureClass(other.to_string())),
        }
    }
}

// ============================================================================
// Amount
// ============================================================================

/// Exact token amount in base units.
///
/// Backed by a 256-bit unsigned integer (the width of EVM `uint256` and of
/// the `NUMERIC(78,0)` column). Only base-10 text is accepted or produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Amount(U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);

    pub fn from_u128(value: u128) -> Self {
        Amount(U256::from(value))
    }

    pub fn from_u256(value: U256) -> Self {
        Amount(value)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidAmount(s.to_string()));
        }
        U256::from_str_radix(trimmed, 10)
            .map(Amount)
            .map_err(|_| ParseError::InvalidAmount(s.to_string()))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Idempotency key
// ============================================================================

/// Dedup boundary for a bridge event: `{source_chain}:{tx_hash}:{log_index}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key for an on-chain log. The tx hash is lower-cased so the
    /// same log reported with different hex casing collapses to one key.
    pub fn derive(source_chain: &str, source_tx_hash: &str, log_index: u64) -> Self {
        IdempotencyKey(format!(
            "{}:{}:{}",
            source_chain,
            source_tx_hash.to_ascii_lowercase(),
            log_index
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 32-byte form handed to destination contracts that dedupe natively
    pub fn digest(&self) -> [u8; 32] {
        keccak256(self.0.as_bytes())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let log_index = parts.next().unwrap_or_default();
        let tx_hash = parts.next().unwrap_or_default();
        let chain = parts.next().unwrap_or_default();
        if chain.is_empty() || tx_hash.is_empty() || log_index.parse::<u64>().is_err() {
            return Err(ParseError::InvalidKey(s.to_string()));
        }
        Ok(IdempotencyKey(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_matches_scenario_format() {
        let key = IdempotencyKey::derive("chainA", "0xABC", 2);
        assert_eq!(key.as_str(), "chainA:0xabc:2");
        assert_eq!(key, IdempotencyKey::derive("chainA", "0xabc", 2));
        assert_ne!(key, IdempotencyKey::derive("chainA", "0xabc", 3));
        assert_ne!(key, IdempotencyKey::derive("chainB", "0xabc", 2));
    }

    #[test]
    fn test_key_parse() {
        let key: IdempotencyKey = "chainA:0xabc:2".parse().unwrap();
        assert_eq!(key.as_str(), "chainA:0xabc:2");
        assert!("chainA:0xabc".parse::<IdempotencyKey>().is_err());
        assert!("chainA:0xabc:x".parse::<IdempotencyKey>().is_err());
    }

    #[test]
    fn test_key_digest_is_stable() {
        let key = IdempotencyKey::derive("chainA", "0xabc", 2);
        assert_eq!(key.digest(), key.clone().digest());
        assert_ne!(key.digest(), IdempotencyKey::derive("chainA", "0xabc", 1).digest());
    }

    #[test]
    fn test_amount_exact_above_53_bits() {
        let raw = "500000000000000000000";
        let amount: Amount = raw.parse().unwrap();
        assert_eq!(amount.to_string(), raw);
        assert_eq!(amount, Amount::from_u128(500 * 10u128.pow(18)));

        let huge = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        let max: Amount = huge.parse().unwrap();
        assert_eq!(max.as_u256(), U256::MAX);
        assert_eq!(max.to_string(), huge);
    }

    #[test]
    fn test_amount_rejects_non_decimal() {
        assert!("".parse::<Amount>().is_err());
        assert!("-1".parse::<Amount>().is_err());
        assert!("1.5".parse::<Amount>().is_err());
        assert!("0x10".parse::<Amount>().is_err());
        assert!("1e18".parse::<Amount>().is_err());
        // one past U256::MAX
        assert!(
            "115792089237316195423570985008687907853269984665640564039457584007913129639936"
                .parse::<Amount>()
                .is_err()
        );
    }

    #[test]
    fn test_amount_serde_as_string() {
        let amount = Amount::from_u128(u128::MAX);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, format!("\"{}\"", u128::MAX));
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn test_state_round_trip_strings() {
        for state in EventState::ALL {
            assert_eq!(state.as_str().parse::<EventState>().unwrap(), state);
        }
        assert!("pending".parse::<EventState>().is_err());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use EventState::*;
        assert!(Observed.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Submitting));
        assert!(!Observed.can_transition_to(Submitting));
        assert!(!Confirmed.can_transition_to(Observed));
        assert!(!Submitted.can_transition_to(Submitting));
        for next in EventState::ALL {
            assert!(!Finalized.can_transition_to(next));
            assert!(!next.can_transition_to(Observed));
        }
    }

    #[test]
    fn test_direction_mapping() {
        assert_eq!(Direction::SourceToDest.action(), ActionKind::Mint);
        assert_eq!(Direction::DestToSource.action(), ActionKind::Release);
        assert_eq!(
            Direction::SourceToDest.expected_event(),
            BridgeEventKind::Locked
        );
        assert_eq!(
            "dest_to_source".parse::<Direction>().unwrap(),
            Direction::DestToSource
        );
    }
}
