//! Raw chain log to `NewBridgeEvent`

use crate::chain::RawLog;
use crate::db::{NewBridgeEvent, MAX_ADDRESS_LEN, MAX_ASSET_LEN, MAX_TX_HASH_LEN};
use crate::types::{Amount, Direction, IdempotencyKey};

/// What the observer should do with one raw log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Event(NewBridgeEvent),
    /// Unusable log; record it and move on
    Skip(String),
    /// The log has no transaction hash yet, so no stable key can be derived.
    /// The observer stops short of this block and re-reads it next tick.
    Defer,
}

/// Validate a raw log observed on `chain_key` for `direction`
pub fn normalize(chain_key: &str, direction: Direction, raw: &RawLog) -> Normalized {
    let Some(tx_hash) = raw.tx_hash.as_deref().filter(|h| !h.is_empty()) else {
        return Normalized::Defer;
    };

    if let Some(error) = &raw.decode_error {
        return Normalized::Skip(format!("undecodable {:?} log: {}", raw.kind, error));
    }

    if raw.kind != direction.expected_event() {
        return Normalized::Skip(format!(
            "unexpected {:?} event on a {} chain",
            raw.kind, direction
        ));
    }

    let Some(log_index) = raw.log_index else {
        return Normalized::Skip("missing log index".to_string());
    };

    let amount: Amount = match raw.amount.parse() {
        Ok(amount) => amount,
        Err(e) => return Normalized::Skip(e.to_string()),
    };
    if amount.is_zero() {
        return Normalized::Skip("zero amount".to_string());
    }

    if raw.asset.trim().is_empty() {
        return Normalized::Skip("empty asset".to_string());
    }
    if raw.sender.trim().is_empty() {
        return Normalized::Skip("empty sender".to_string());
    }
    if raw.recipient.trim().is_empty() {
        return Normalized::Skip("empty recipient".to_string());
    }

    // Anything wider than its column would fail the upsert and pin the cursor
    let widths = [
        ("tx hash", tx_hash, MAX_TX_HASH_LEN),
        ("asset", raw.asset.as_str(), MAX_ASSET_LEN),
        ("sender", raw.sender.as_str(), MAX_ADDRESS_LEN),
        ("recipient", raw.recipient.as_str(), MAX_ADDRESS_LEN),
    ];
    for (field, value, limit) in widths {
        let len = value.chars().count();
        if len > limit {
            return Normalized::Skip(format!(
                "{} is {} characters, limit is {}",
                field, len, limit
            ));
        }
    }

    Normalized::Event(NewBridgeEvent {
        idempotency_key: IdempotencyKey::derive(chain_key, tx_hash, log_index),
        direction,
        source_chain: chain_key.to_string(),
        source_tx_hash: tx_hash.to_ascii_lowercase(),
        log_index,
        source_block_number: raw.block_number,
        asset: raw.asset.clone(),
        amount,
        sender: raw.sender.clone(),
        recipient: raw.recipient.clone(),
    })
}
