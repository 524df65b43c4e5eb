//! Consensus parameter definitions.

use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Self::Mainnet),
            "test" | "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    /// Selects the proof-of-stake rule pipeline instead of the plain proof-of-work one.
    pub proof_of_stake: bool,
    pub pow_limit: Hash256,
    pub pos_limit: Hash256,
    pub pow_target_timespan: i64,
    pub pow_target_spacing: i64,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub pos_target_spacing: i64,
    /// Window over which per-block stake retargeting averages.
    pub pos_target_timespan: i64,
    pub pos_no_retargeting: bool,
    pub coinbase_maturity: u32,
    pub coinstake_maturity: u32,
    pub stake_min_confirmations: u32,
    pub last_pow_block: i32,
    pub premine_height: i32,
    pub premine_reward: Amount,
    pub proof_of_work_reward: Amount,
    pub proof_of_stake_reward: Amount,
    /// First height of protocol era two.
    pub protocol_v2_height: i32,
    /// First block time of protocol era three.
    pub protocol_v3_time: u32,
    pub stake_timestamp_mask: u32,
    pub future_drift_v1: i64,
    pub future_drift_v2: i64,
    pub future_drift_v3: i64,
    pub bip16_time: u32,
    pub bip34_height: i32,
    pub bip65_height: i32,
    pub bip66_height: i32,
    pub csv_height: i32,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hash length"),
            HexError::InvalidHex => write!(f, "invalid hex"),
        }
    }
}

impl std::error::Error for HexError {}

pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&padded[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

fn limit(hex: &str) -> Hash256 {
    hash256_from_hex(hex).unwrap_or([0xff; 32])
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: [0u8; 32],
        proof_of_stake: true,
        pow_limit: limit("00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pos_limit: limit("000000000000ffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_target_spacing: 10 * 60,
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        pos_target_spacing: 64,
        pos_target_timespan: 16 * 60,
        pos_no_retargeting: false,
        coinbase_maturity: 50,
        coinstake_maturity: 500,
        stake_min_confirmations: 50,
        last_pow_block: 12_500,
        premine_height: 2,
        premine_reward: 98_000_000 * COIN,
        proof_of_work_reward: 4 * COIN,
        proof_of_stake_reward: COIN,
        protocol_v2_height: 1,
        protocol_v3_time: 1_470_467_000,
        stake_timestamp_mask: 0x0f,
        future_drift_v1: 2 * 60 * 60,
        future_drift_v2: 128 * 60 * 60,
        future_drift_v3: 15,
        bip16_time: 0,
        bip34_height: 0,
        bip65_height: 0,
        bip66_height: 0,
        csv_height: i32::MAX,
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        pow_allow_min_difficulty_blocks: true,
        coinstake_maturity: 100,
        stake_min_confirmations: 10,
        last_pow_block: 12_500,
        ..mainnet_consensus_params()
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        pow_limit: limit("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pos_limit: limit("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        pos_no_retargeting: true,
        coinbase_maturity: 10,
        coinstake_maturity: 20,
        stake_min_confirmations: 10,
        last_pow_block: i32::MAX,
        ..mainnet_consensus_params()
    }
}
