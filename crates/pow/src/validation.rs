//! Proof-of-work header checks.

use primitive_types::U256;
use stakd_consensus::{ConsensusParams, Hash256};
use stakd_primitives::block::BlockHeader;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(CompactError),
    ZeroTarget,
    TargetAboveLimit,
    HashAboveTarget,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(err) => write!(f, "invalid difficulty bits: {err}"),
            PowError::ZeroTarget => write!(f, "difficulty target is zero"),
            PowError::TargetAboveLimit => write!(f, "difficulty target above proof-of-work limit"),
            PowError::HashAboveTarget => write!(f, "block hash does not meet target"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::InvalidBits(err)
    }
}

/// Checks that `hash` satisfies the compact target `bits` and that the target is within
/// the network's proof-of-work limit.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::ZeroTarget);
    }
    if target > U256::from_little_endian(&params.pow_limit) {
        return Err(PowError::TargetAboveLimit);
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}

pub fn check_header_proof_of_work(
    header: &BlockHeader,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    check_proof_of_work(&header.hash(), header.bits, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_consensus::{consensus_params, Network};

    #[test]
    fn rejects_hash_above_target() {
        let params = consensus_params(Network::Regtest);
        let mut hash = [0u8; 32];
        assert!(check_proof_of_work(&hash, 0x207fffff, &params).is_ok());
        hash[31] = 0x80;
        assert_eq!(
            check_proof_of_work(&hash, 0x207fffff, &params),
            Err(PowError::HashAboveTarget)
        );
    }

    #[test]
    fn rejects_target_above_limit() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0x207fffff, &params),
            Err(PowError::TargetAboveLimit)
        );
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0x1d000000, &params),
            Err(PowError::ZeroTarget)
        );
    }
}
