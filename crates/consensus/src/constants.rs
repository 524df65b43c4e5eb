//! Consensus-wide constants shared across validation.

use crate::Hash256;

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_BASE_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;
/// Coinbase script length bounds.
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;
/// Lock times below this are block heights, above are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Number of previous blocks used for median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Transactions that appear twice in the historical chain. Their outputs may exist in
/// the durable store before the transaction is created a second time.
pub const DUPLICATE_TRANSACTION_IDS: [Hash256; 2] = [
    hash256_from_display_hex("d5d27987d2a3dfc724e359870c6644b40e497bdc0589a033220fe15429d88599"),
    hash256_from_display_hex("e3bf3d07d4b0375638d5f1db5255fe07ba2c4cb067cd81b84ee974b6585fb468"),
];

pub fn is_duplicate_transaction(txid: &Hash256) -> bool {
    DUPLICATE_TRANSACTION_IDS.iter().any(|dup| dup == txid)
}

/// Parses a 64-character big-endian display hex string into internal byte order.
pub const fn hash256_from_display_hex(hex: &str) -> Hash256 {
    let bytes = hex.as_bytes();
    assert!(bytes.len() == 64, "hash hex must be 64 characters");
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        let hi = hex_nibble(bytes[i * 2]);
        let lo = hex_nibble(bytes[i * 2 + 1]);
        out[31 - i] = (hi << 4) | lo;
        i += 1;
    }
    out
}

const fn hex_nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex character"),
    }
}
