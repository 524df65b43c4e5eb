//! Proof-of-stake substitutions and additions to the base pipeline.

use std::sync::Arc;

use stakd_consensus::rewards::{proof_of_stake_reward, proof_of_work_reward};
use stakd_pos::{check_block_signature, PosError, ProtocolEra};
use stakd_pow::difficulty::next_target_required;
use stakd_pow::TargetKind;
use stakd_primitives::transaction::Transaction;

use super::execution::check_coinbase_reward;
use super::{Rule, RuleEnv, Stage};
use crate::collaborators::StakeValidator;
use crate::context::ValidationContext;
use crate::error::{ConsensusError, RuleError};
use crate::stake::{BlockStake, StakeChainStore, FLAG_PROOF_OF_STAKE};

fn era(ctx: &ValidationContext, env: &RuleEnv<'_>) -> Result<ProtocolEra, ConsensusError> {
    Ok(ProtocolEra::at(ctx.height()?, ctx.block.header.time, env.params))
}

fn coinstake(ctx: &ValidationContext) -> Result<&Transaction, ConsensusError> {
    ctx.block
        .transactions
        .get(1)
        .ok_or_else(|| RuleError::BadStakeBlock("missing coinstake").into())
}

/// Era-dependent past limit and future drift.
pub struct PosTimestampRule;

impl Rule for PosTimestampRule {
    fn id(&self) -> &'static str {
        "time"
    }

    fn stage(&self) -> Stage {
        Stage::HeaderContextual
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let era = era(ctx, env)?;
        let prev = ctx.prev_header()?;
        let time = i64::from(ctx.block.header.time);
        if time <= era.past_time_limit(prev.header.time, prev.median_time_past()) {
            return Err(RuleError::TimeTooOld.into());
        }
        if time > env.time.adjusted_time() + era.future_drift(env.params) {
            return Err(RuleError::TimeTooNew.into());
        }
        Ok(())
    }
}

/// Per-block retarget from the two previous blocks of the same proof kind.
pub struct PosDifficultyRule;

impl Rule for PosDifficultyRule {
    fn id(&self) -> &'static str {
        "difficulty"
    }

    fn stage(&self) -> Stage {
        Stage::HeaderContextual
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let proof_of_stake = ctx.block.is_proof_of_stake();
        let kind = if proof_of_stake {
            TargetKind::Stake
        } else {
            TargetKind::Work
        };
        let last = ctx.prev_header()?.last_of_kind(proof_of_stake);
        let previous = last
            .as_ref()
            .and_then(|last| last.prev.as_ref())
            .and_then(|prev| prev.last_of_kind(proof_of_stake));
        let expected = next_target_required(
            last.map(|header| header.info()),
            previous.map(|header| header.info()),
            kind,
            env.params,
        )
        .map_err(|_| RuleError::BadDifficultyBits)?;
        if ctx.block.header.bits != expected {
            return Err(RuleError::BadDifficultyBits.into());
        }
        Ok(())
    }
}

pub struct LastPowBlockRule;

impl Rule for LastPowBlockRule {
    fn id(&self) -> &'static str {
        "last-pow"
    }

    fn stage(&self) -> Stage {
        Stage::HeaderContextual
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        if ctx.block.is_proof_of_work() && ctx.height()? > env.params.last_pow_block {
            return Err(RuleError::ProofOfWorkTooHigh.into());
        }
        Ok(())
    }
}

/// Header-time check against the coinstake's masked timestamp. Runs with the header
/// rules, ahead of any body rule.
pub struct CoinstakeTimestampRule;

impl Rule for CoinstakeTimestampRule {
    fn id(&self) -> &'static str {
        "coinstake-time"
    }

    fn stage(&self) -> Stage {
        Stage::HeaderContextual
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        if !ctx.block.is_proof_of_stake() {
            return Ok(());
        }
        let era = era(ctx, env)?;
        let tx_time = coinstake(ctx)?.time;
        if !era.check_coinstake_timestamp(ctx.block.header.time, tx_time, env.params) {
            return Err(RuleError::StakeTimeViolation.into());
        }
        Ok(())
    }
}

pub struct PosBlockStructureRule;

impl Rule for PosBlockStructureRule {
    fn id(&self) -> &'static str {
        "pos-structure"
    }

    fn stage(&self) -> Stage {
        Stage::BodyStructural
    }

    fn check(&self, ctx: &mut ValidationContext, _env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let block = &ctx.block;
        if block.is_proof_of_stake() {
            let coinbase = &block.transactions[0];
            if coinbase.vout.len() != 1 || !coinbase.vout[0].is_empty() {
                return Err(RuleError::BadStakeBlock("coinbase output not empty").into());
            }
        }
        let misplaced = block
            .transactions
            .iter()
            .enumerate()
            .any(|(index, tx)| tx.is_coinstake() && (index != 1 || block.is_proof_of_work()));
        if misplaced {
            return Err(RuleError::BadStakeBlock("coinstake in wrong position").into());
        }
        if block
            .transactions
            .iter()
            .any(|tx| tx.time > block.header.time)
        {
            return Err(RuleError::BadStakeBlock("transaction time after block time").into());
        }
        Ok(())
    }
}

pub struct BlockSignatureRule;

impl Rule for BlockSignatureRule {
    fn id(&self) -> &'static str {
        "block-signature"
    }

    fn stage(&self) -> Stage {
        Stage::BodyStructural
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let era = era(ctx, env)?;
        check_block_signature(&ctx.block, era).map_err(|err| {
            let message = match err {
                PosError::UnexpectedSignature => "signature on proof-of-work block",
                PosError::BadSignature(message) | PosError::UnknownSigner(message) => message,
                _ => "invalid block signature",
            };
            RuleError::BadBlockSignature(message).into()
        })
    }
}

/// Checks the coinstake kernel before the coinstake's input is spent.
pub struct StakeKernelRule {
    validator: Arc<dyn StakeValidator>,
    stakes: Arc<StakeChainStore>,
}

impl StakeKernelRule {
    pub fn new(validator: Arc<dyn StakeValidator>, stakes: Arc<StakeChainStore>) -> Self {
        Self { validator, stakes }
    }
}

impl Rule for StakeKernelRule {
    fn id(&self) -> &'static str {
        "stake-kernel"
    }

    fn stage(&self) -> Stage {
        Stage::Execution
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        if !ctx.block.is_proof_of_stake() {
            return Ok(());
        }
        let header = Arc::clone(ctx.header()?);
        let prev_stake = self.stakes.get(&header.prev_hash())?;
        let staked_txid = coinstake(ctx)?
            .vin
            .first()
            .map(|input| input.prevout.hash)
            .ok_or(RuleError::BadStakeBlock("coinstake without inputs"))?;
        let staked = ctx
            .set
            .access_coins(&staked_txid)
            .ok_or(RuleError::BadTransactionMissingInput)?;
        let proof =
            self.validator
                .check_proof_of_stake(env.params, &header, &ctx.block, &prev_stake, staked)?;
        ctx.stake.hash_proof = Some(proof.hash_proof);
        ctx.stake.stake_modifier_v2 = Some(proof.stake_modifier_v2);
        Ok(())
    }
}

/// Queues the block's stake metadata into the side-store once execution succeeded.
pub struct StakeRecordRule {
    validator: Arc<dyn StakeValidator>,
    stakes: Arc<StakeChainStore>,
}

impl StakeRecordRule {
    pub fn new(validator: Arc<dyn StakeValidator>, stakes: Arc<StakeChainStore>) -> Self {
        Self { validator, stakes }
    }
}

impl Rule for StakeRecordRule {
    fn id(&self) -> &'static str {
        "stake-record"
    }

    fn stage(&self) -> Stage {
        Stage::Execution
    }

    fn check(&self, ctx: &mut ValidationContext, _env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let header = Arc::clone(ctx.header()?);
        let block_stake = if ctx.block.is_proof_of_stake() {
            let coinstake = coinstake(ctx)?;
            let (Some(hash_proof), Some(stake_modifier_v2)) =
                (ctx.stake.hash_proof, ctx.stake.stake_modifier_v2)
            else {
                return Err(ConsensusError::MissingContext("stake kernel proof"));
            };
            let mut stake = BlockStake {
                flags: FLAG_PROOF_OF_STAKE,
                hash_proof,
                stake_modifier_v2,
                stake_time: coinstake.time,
                prevout_stake: coinstake.vin[0].prevout,
            };
            stake.set_entropy_bit(&header.hash);
            stake
        } else {
            let prev_stake = self.stakes.get(&header.prev_hash())?;
            let modifier = self.validator.compute_stake_modifier(&prev_stake, &header.hash);
            BlockStake::for_work(&header.hash, modifier)
        };
        self.stakes.set(&header, block_stake.clone())?;
        ctx.stake.block_stake = Some(block_stake);
        Ok(())
    }
}

/// Stake blocks pay through the coinstake: its value gain is capped at fees plus the
/// stake reward. Work blocks keep the coinbase cap.
pub struct PosRewardRule;

impl Rule for PosRewardRule {
    fn id(&self) -> &'static str {
        "reward"
    }

    fn stage(&self) -> Stage {
        Stage::Execution
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let height = ctx.height()?;
        if !ctx.block.is_proof_of_stake() {
            return check_coinbase_reward(ctx, proof_of_work_reward(height, env.params));
        }
        let value_out = coinstake(ctx)?
            .value_out()
            .ok_or(RuleError::BadCoinstakeAmount)?;
        let reward = value_out - ctx.stake.coinstake_input_value;
        let allowed = ctx
            .fees
            .checked_add(proof_of_stake_reward(height, env.params))
            .ok_or(RuleError::BadCoinstakeAmount)?;
        if reward > allowed {
            return Err(RuleError::BadCoinstakeAmount.into());
        }
        Ok(())
    }
}
