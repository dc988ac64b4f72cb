//! Hashing helpers shared by the key derivation and the EVM adapter

use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Encode a short asset symbol as a right-padded `bytes32`.
///
/// Returns `None` when the symbol does not fit.
pub fn symbol_to_bytes32(symbol: &str) -> Option<[u8; 32]> {
    let bytes = symbol.as_bytes();
    if bytes.is_empty() || bytes.len() > 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out[..bytes.len()].copy_from_slice(bytes);
    Some(out)
}

/// Decode a right-padded `bytes32` symbol. Trailing zero bytes are dropped.
pub fn bytes32_to_symbol(bytes: &[u8; 32]) -> Option<String> {
    let end = bytes.iter().rposition(|b| *b != 0).map(|i| i + 1)?;
    std::str::from_utf8(&bytes[..end]).ok().map(str::to_string)
}

/// Convert bytes32 to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}
