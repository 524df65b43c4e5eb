//! Header rules shared by both pipelines.

use stakd_consensus::deployments::flags_for_height;
use stakd_pow::difficulty::next_work_required;
use stakd_pow::validation::check_proof_of_work;

use super::{Rule, RuleEnv, Stage};
use crate::context::ValidationContext;
use crate::error::{ConsensusError, RuleError};

/// Allowed clock skew for proof-of-work chains.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

pub struct CheckProofOfWorkRule;

impl Rule for CheckProofOfWorkRule {
    fn id(&self) -> &'static str {
        "pow"
    }

    fn stage(&self) -> Stage {
        Stage::HeaderStructural
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        if !ctx.check_pow || ctx.block.is_proof_of_stake() {
            return Ok(());
        }
        let header = &ctx.block.header;
        check_proof_of_work(&header.hash(), header.bits, env.params)
            .map_err(|_| RuleError::HighHash.into())
    }
}

pub struct BlockVersionRule;

impl Rule for BlockVersionRule {
    fn id(&self) -> &'static str {
        "version"
    }

    fn stage(&self) -> Stage {
        Stage::HeaderContextual
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let header = ctx.header()?;
        let floor = flags_for_height(header.height, header.header.time, env.params).min_block_version;
        if header.header.version < floor {
            return Err(RuleError::BadVersion.into());
        }
        Ok(())
    }
}

pub struct CheckDifficultyRule;

impl Rule for CheckDifficultyRule {
    fn id(&self) -> &'static str {
        "difficulty"
    }

    fn stage(&self) -> Stage {
        Stage::HeaderContextual
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let header = ctx.header()?;
        let prev = ctx.prev_header()?;
        let interval = usize::try_from(env.params.difficulty_adjustment_interval()).unwrap_or(1);
        let history = prev.history(interval.max(1));
        let expected = next_work_required(&history, Some(i64::from(header.header.time)), env.params)
            .map_err(|_| RuleError::BadDifficultyBits)?;
        if header.header.bits != expected {
            return Err(RuleError::BadDifficultyBits.into());
        }
        Ok(())
    }
}

pub struct CheckTimestampRule;

impl Rule for CheckTimestampRule {
    fn id(&self) -> &'static str {
        "time"
    }

    fn stage(&self) -> Stage {
        Stage::HeaderContextual
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let time = i64::from(ctx.block.header.time);
        if time <= ctx.prev_header()?.median_time_past() {
            return Err(RuleError::TimeTooOld.into());
        }
        if time > env.time.adjusted_time() + MAX_FUTURE_BLOCK_TIME {
            return Err(RuleError::TimeTooNew.into());
        }
        Ok(())
    }
}
