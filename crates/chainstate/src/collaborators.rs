//! Services the rule set consults but does not own.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use stakd_coinview::UnspentOutputs;
use stakd_consensus::deployments::{flags_for_height, ConsensusFlags};
use stakd_consensus::{ConsensusParams, Hash256};
use stakd_pos::{check_stake_kernel, compute_stake_modifier_v2, KernelInput, KernelProof, PosError};
use stakd_primitives::block::Block;
use stakd_primitives::transaction::{Transaction, TxOut};

use crate::chain::ChainedHeader;
use crate::error::RuleError;
use crate::stake::BlockStake;

pub trait DeploymentTracker: Send + Sync {
    fn flags_for(&self, header: &ChainedHeader) -> ConsensusFlags;
}

/// Activation purely by height and block time from the consensus parameters.
pub struct HeightDeployments {
    params: Arc<ConsensusParams>,
}

impl HeightDeployments {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self { params }
    }
}

impl DeploymentTracker for HeightDeployments {
    fn flags_for(&self, header: &ChainedHeader) -> ConsensusFlags {
        flags_for_height(header.height, header.header.time, &self.params)
    }
}

pub trait TimeSource: Send + Sync {
    /// Network-adjusted unix time in seconds.
    fn adjusted_time(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn adjusted_time(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Per-input script check. Called concurrently from the rayon pool.
pub trait InputVerifier: Send + Sync {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &TxOut,
        flags: &ConsensusFlags,
    ) -> Result<(), String>;
}

pub trait StakeValidator: Send + Sync {
    /// Checks the coinstake kernel of `block` against its parent's stake modifier.
    fn check_proof_of_stake(
        &self,
        params: &ConsensusParams,
        header: &ChainedHeader,
        block: &Block,
        prev_stake: &BlockStake,
        staked: &UnspentOutputs,
    ) -> Result<KernelProof, RuleError>;

    fn compute_stake_modifier(&self, prev_stake: &BlockStake, kernel: &Hash256) -> Hash256;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct KernelStakeValidator;

impl StakeValidator for KernelStakeValidator {
    fn check_proof_of_stake(
        &self,
        params: &ConsensusParams,
        header: &ChainedHeader,
        block: &Block,
        prev_stake: &BlockStake,
        staked: &UnspentOutputs,
    ) -> Result<KernelProof, RuleError> {
        let coinstake = block
            .transactions
            .get(1)
            .ok_or(RuleError::BadStakeBlock("missing coinstake"))?;
        let prevout = coinstake
            .vin
            .first()
            .map(|input| input.prevout)
            .ok_or(RuleError::BadStakeBlock("coinstake without inputs"))?;
        let output = staked
            .output(prevout.index)
            .ok_or(RuleError::BadTransactionMissingInput)?;
        let depth = u32::try_from(header.height)
            .unwrap_or(0)
            .saturating_sub(staked.height);
        let input = KernelInput {
            stake_modifier: prev_stake.stake_modifier_v2,
            prev_tx_time: staked.time,
            prevout,
            value: output.value,
            tx_time: coinstake.time,
            bits: header.header.bits,
            depth,
        };
        check_stake_kernel(&input, params.stake_min_confirmations).map_err(|err| match err {
            PosError::StakeTooYoung { .. } => RuleError::StakeTooYoung,
            PosError::StakeTime => RuleError::StakeTimeViolation,
            PosError::InvalidBits => RuleError::BadDifficultyBits,
            _ => RuleError::StakeHashInvalidTarget,
        })
    }

    fn compute_stake_modifier(&self, prev_stake: &BlockStake, kernel: &Hash256) -> Hash256 {
        compute_stake_modifier_v2(&prev_stake.stake_modifier_v2, kernel)
    }
}
