//! Consensus rules as an ordered pipeline of rule objects over a [`ValidationContext`].
//!
//! [`RuleSet::proof_of_work`] is the base pipeline. [`RuleSet::proof_of_stake`] starts
//! from it, swaps the rules whose meaning changes under staking and adds the stake
//! specific ones.

use std::sync::Arc;

use stakd_consensus::ConsensusParams;

use crate::collaborators::{InputVerifier, StakeValidator, TimeSource};
use crate::context::ValidationContext;
use crate::error::ConsensusError;
use crate::stake::StakeChainStore;

pub mod body;
pub mod execution;
pub mod header;
pub mod stake;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Context-free header checks.
    HeaderStructural,
    /// Header checks against the parent chain.
    HeaderContextual,
    BodyContextual,
    BodyStructural,
    /// Checks that read and update coins.
    Execution,
}

/// Shared inputs every rule may consult.
pub struct RuleEnv<'a> {
    pub params: &'a ConsensusParams,
    pub time: &'a dyn TimeSource,
}

pub trait Rule: Send + Sync {
    fn id(&self) -> &'static str;
    fn stage(&self) -> Stage;
    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError>;
}

#[derive(Default)]
pub struct RuleSet {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proof_of_work(verifier: Option<Arc<dyn InputVerifier>>) -> Self {
        let mut rules = Self::new();
        rules.push(header::CheckProofOfWorkRule);
        rules.push(header::BlockVersionRule);
        rules.push(header::CheckDifficultyRule);
        rules.push(header::CheckTimestampRule);
        rules.push(body::TransactionsFinalRule);
        rules.push(body::CoinbaseHeightRule);
        rules.push(body::BlockSizeRule);
        rules.push(body::CoinbaseRule);
        rules.push(body::MerkleRootRule);
        rules.push(body::TransactionStructureRule);
        rules.push(execution::ExecuteTransactionsRule::new(verifier));
        rules.push(execution::BlockRewardRule);
        rules
    }

    pub fn proof_of_stake(
        verifier: Option<Arc<dyn InputVerifier>>,
        validator: Arc<dyn StakeValidator>,
        stakes: Arc<StakeChainStore>,
    ) -> Self {
        let mut rules = Self::proof_of_work(verifier);
        rules.replace(stake::PosTimestampRule);
        rules.replace(stake::PosDifficultyRule);
        rules.replace(stake::PosRewardRule);
        rules.insert_before(header::CheckDifficultyRule.id(), stake::LastPowBlockRule);
        rules.push(stake::CoinstakeTimestampRule);
        rules.push(stake::PosBlockStructureRule);
        rules.push(stake::BlockSignatureRule);
        rules.insert_before(
            execution::EXECUTE_RULE_ID,
            stake::StakeKernelRule::new(Arc::clone(&validator), Arc::clone(&stakes)),
        );
        rules.push(stake::StakeRecordRule::new(validator, stakes));
        rules
    }

    pub fn push(&mut self, rule: impl Rule + 'static) {
        self.rules.push(Box::new(rule));
    }

    /// Substitutes the rule with the same id, keeping its position; appends if none.
    pub fn replace(&mut self, rule: impl Rule + 'static) {
        match self.rules.iter().position(|existing| existing.id() == rule.id()) {
            Some(index) => self.rules[index] = Box::new(rule),
            None => self.rules.push(Box::new(rule)),
        }
    }

    pub fn insert_before(&mut self, id: &str, rule: impl Rule + 'static) {
        match self.rules.iter().position(|existing| existing.id() == id) {
            Some(index) => self.rules.insert(index, Box::new(rule)),
            None => self.rules.push(Box::new(rule)),
        }
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.id()).collect()
    }

    /// Runs the rules of `stage` in pipeline order, stopping at the first failure.
    pub fn run(
        &self,
        stage: Stage,
        ctx: &mut ValidationContext,
        env: &RuleEnv<'_>,
    ) -> Result<(), ConsensusError> {
        for rule in self.rules.iter().filter(|rule| rule.stage() == stage) {
            rule.check(ctx, env)?;
        }
        Ok(())
    }
}
