//! Stake kernel hashing and the v2 stake modifier.

use primitive_types::{U256, U512};
use stakd_consensus::money::Amount;
use stakd_consensus::Hash256;
use stakd_primitives::encoding::Encoder;
use stakd_primitives::hash::sha256d;
use stakd_primitives::outpoint::OutPoint;
use stakd_pow::difficulty::compact_to_u256;

use crate::PosError;

/// Everything the kernel hash commits to, plus the data needed to weight the target.
#[derive(Clone, Debug)]
pub struct KernelInput {
    pub stake_modifier: Hash256,
    /// Creation time of the transaction holding the staked output.
    pub prev_tx_time: u32,
    pub prevout: OutPoint,
    /// Value of the staked output; the target scales linearly with it.
    pub value: Amount,
    pub tx_time: u32,
    pub bits: u32,
    /// Depth of the staked output below the block being validated.
    pub depth: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelProof {
    pub hash_proof: Hash256,
    pub stake_modifier_v2: Hash256,
}

pub fn kernel_hash(input: &KernelInput) -> Hash256 {
    let mut encoder = Encoder::with_capacity(32 + 4 + 36 + 4);
    encoder.write_hash(&input.stake_modifier);
    encoder.write_u32_le(input.prev_tx_time);
    encoder.write_hash(&input.prevout.hash);
    encoder.write_u32_le(input.prevout.index);
    encoder.write_u32_le(input.tx_time);
    sha256d(&encoder.into_inner())
}

pub fn compute_stake_modifier_v2(previous: &Hash256, kernel: &Hash256) -> Hash256 {
    let mut encoder = Encoder::with_capacity(64);
    encoder.write_hash(kernel);
    encoder.write_hash(previous);
    sha256d(&encoder.into_inner())
}

/// Verifies the kernel against the value-weighted target and returns the proof hash
/// together with the next stake modifier.
pub fn check_stake_kernel(
    input: &KernelInput,
    min_confirmations: u32,
) -> Result<KernelProof, PosError> {
    if input.depth < min_confirmations {
        return Err(PosError::StakeTooYoung {
            depth: input.depth,
            required: min_confirmations,
        });
    }
    if input.tx_time < input.prev_tx_time {
        return Err(PosError::StakeTime);
    }
    let target = compact_to_u256(input.bits).map_err(|_| PosError::InvalidBits)?;
    if target.is_zero() {
        return Err(PosError::InvalidBits);
    }
    let weight = U256::from(u64::try_from(input.value).map_err(|_| PosError::KernelTargetMissed)?);
    let weighted = target.full_mul(weight);

    let hash_proof = kernel_hash(input);
    if U512::from(U256::from_little_endian(&hash_proof)) > weighted {
        return Err(PosError::KernelTargetMissed);
    }
    Ok(KernelProof {
        hash_proof,
        stake_modifier_v2: compute_stake_modifier_v2(&input.stake_modifier, &input.prevout.hash),
    })
}
