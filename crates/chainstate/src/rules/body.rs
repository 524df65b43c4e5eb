//! Block body rules shared by both pipelines.

use std::collections::HashSet;

use stakd_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_BLOCK_BASE_SIZE, MAX_COINBASE_SCRIPT_SIZE, MIN_COINBASE_SCRIPT_SIZE,
};
use stakd_consensus::money::money_range;
use stakd_primitives::merkle::merkle_root;
use stakd_primitives::script::coinbase_height_prefix;
use stakd_primitives::transaction::{Transaction, SEQUENCE_FINAL};

use super::{Rule, RuleEnv, Stage};
use crate::context::ValidationContext;
use crate::error::{ConsensusError, RuleError};

pub fn is_final_tx(tx: &Transaction, height: i32, cutoff_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = i64::from(tx.lock_time);
    let compare = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        cutoff_time
    };
    if lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

pub struct TransactionsFinalRule;

impl Rule for TransactionsFinalRule {
    fn id(&self) -> &'static str {
        "final-tx"
    }

    fn stage(&self) -> Stage {
        Stage::BodyContextual
    }

    fn check(&self, ctx: &mut ValidationContext, _env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let height = ctx.height()?;
        let cutoff = if ctx.flags.uses_median_time_past() {
            ctx.prev_header()?.median_time_past()
        } else {
            i64::from(ctx.block.header.time)
        };
        if ctx
            .block
            .transactions
            .iter()
            .any(|tx| !is_final_tx(tx, height, cutoff))
        {
            return Err(RuleError::BadTransactionNonFinal.into());
        }
        Ok(())
    }
}

/// Coinbase must begin with the serialized block height once BIP34 is active.
pub struct CoinbaseHeightRule;

impl Rule for CoinbaseHeightRule {
    fn id(&self) -> &'static str {
        "bip34"
    }

    fn stage(&self) -> Stage {
        Stage::BodyContextual
    }

    fn check(&self, ctx: &mut ValidationContext, _env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        if !ctx.flags.enforce_bip34 {
            return Ok(());
        }
        let expected = coinbase_height_prefix(ctx.height()?);
        let matches = ctx
            .block
            .transactions
            .first()
            .and_then(|coinbase| coinbase.vin.first())
            .is_some_and(|input| input.script_sig.starts_with(&expected));
        if !matches {
            return Err(RuleError::BadCoinbaseHeight.into());
        }
        Ok(())
    }
}

pub struct BlockSizeRule;

impl Rule for BlockSizeRule {
    fn id(&self) -> &'static str {
        "size"
    }

    fn stage(&self) -> Stage {
        Stage::BodyStructural
    }

    fn check(&self, ctx: &mut ValidationContext, _env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let count = ctx.block.transactions.len();
        if count == 0 || count > MAX_BLOCK_BASE_SIZE as usize {
            return Err(RuleError::BadBlockLength.into());
        }
        if ctx.block.serialized_size() > MAX_BLOCK_BASE_SIZE as usize {
            return Err(RuleError::BadBlockLength.into());
        }
        Ok(())
    }
}

pub struct CoinbaseRule;

impl Rule for CoinbaseRule {
    fn id(&self) -> &'static str {
        "coinbase"
    }

    fn stage(&self) -> Stage {
        Stage::BodyStructural
    }

    fn check(&self, ctx: &mut ValidationContext, _env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let transactions = &ctx.block.transactions;
        if !transactions.first().is_some_and(Transaction::is_coinbase) {
            return Err(RuleError::BadCoinbaseMissing.into());
        }
        if transactions.iter().skip(1).any(Transaction::is_coinbase) {
            return Err(RuleError::BadMultipleCoinbase.into());
        }
        Ok(())
    }
}

pub struct MerkleRootRule;

impl Rule for MerkleRootRule {
    fn id(&self) -> &'static str {
        "merkle"
    }

    fn stage(&self) -> Stage {
        Stage::BodyStructural
    }

    fn check(&self, ctx: &mut ValidationContext, _env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        if !ctx.check_merkle_root {
            return Ok(());
        }
        let computed = merkle_root(&ctx.txids);
        if computed.root != ctx.block.header.merkle_root {
            return Err(RuleError::BadMerkleRoot.into());
        }
        if computed.mutated {
            return Err(RuleError::BadTransactionDuplicate.into());
        }
        Ok(())
    }
}

pub fn check_transaction(tx: &Transaction) -> Result<(), RuleError> {
    if tx.vin.is_empty() {
        return Err(RuleError::BadTransaction("vin empty"));
    }
    if tx.vout.is_empty() {
        return Err(RuleError::BadTransaction("vout empty"));
    }
    if tx.serialized_size() > MAX_BLOCK_BASE_SIZE as usize {
        return Err(RuleError::BadTransaction("oversize"));
    }
    let generated = tx.is_coinbase() || tx.is_coinstake();
    for output in &tx.vout {
        if output.is_empty() && !generated {
            return Err(RuleError::BadTransaction("empty output in user transaction"));
        }
        if output.value < 0 {
            return Err(RuleError::BadTransaction("negative output value"));
        }
        if !money_range(output.value) {
            return Err(RuleError::BadTransaction("output value too large"));
        }
    }
    if tx.value_out().is_none() {
        return Err(RuleError::BadTransaction("total output value too large"));
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    if !tx.vin.iter().all(|input| seen.insert(input.prevout)) {
        return Err(RuleError::BadTransaction("duplicate inputs"));
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(RuleError::BadCoinbaseLength);
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(RuleError::BadTransaction("null prevout"));
    }
    Ok(())
}

pub struct TransactionStructureRule;

impl Rule for TransactionStructureRule {
    fn id(&self) -> &'static str {
        "tx-structure"
    }

    fn stage(&self) -> Stage {
        Stage::BodyStructural
    }

    fn check(&self, ctx: &mut ValidationContext, _env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        for tx in &ctx.block.transactions {
            check_transaction(tx)?;
        }
        Ok(())
    }
}
