//! Rules that replay the block against the coin set.

use std::sync::Arc;

use rayon::prelude::*;
use stakd_consensus::constants::is_duplicate_transaction;
use stakd_consensus::money::{money_range, Amount};
use stakd_consensus::params::hash256_to_hex;
use stakd_consensus::rewards::proof_of_work_reward;
use stakd_log::log_warn;
use stakd_primitives::transaction::TxOut;

use super::{Rule, RuleEnv, Stage};
use crate::collaborators::InputVerifier;
use crate::context::ValidationContext;
use crate::error::{ConsensusError, RuleError};

pub const EXECUTE_RULE_ID: &str = "execute";

struct InputCheck {
    tx_index: usize,
    input_index: usize,
    spent: TxOut,
}

/// Spends every input, adds every output, enforces maturity and value balance, and
/// accumulates fees. Script checks for the whole block run in parallel at the end.
pub struct ExecuteTransactionsRule {
    verifier: Option<Arc<dyn InputVerifier>>,
}

impl ExecuteTransactionsRule {
    pub fn new(verifier: Option<Arc<dyn InputVerifier>>) -> Self {
        Self { verifier }
    }
}

impl Rule for ExecuteTransactionsRule {
    fn id(&self) -> &'static str {
        EXECUTE_RULE_ID
    }

    fn stage(&self) -> Stage {
        Stage::Execution
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let height = ctx.height()?;
        let spend_height = u32::try_from(height).unwrap_or(0);
        let block = Arc::clone(&ctx.block);
        let mut checks = Vec::new();
        let mut fees: Amount = 0;

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = ctx.txids[tx_index];
            if ctx.flags.enforce_bip30
                && !is_duplicate_transaction(&txid)
                && ctx
                    .set
                    .access_coins(&txid)
                    .is_some_and(|coins| !coins.is_fully_spent())
            {
                return Err(RuleError::BadTransactionBip30.into());
            }

            if !tx.is_coinbase() {
                let mut value_in: Amount = 0;
                for (input_index, input) in tx.vin.iter().enumerate() {
                    let coins = ctx
                        .set
                        .access_coins(&input.prevout.hash)
                        .ok_or(RuleError::BadTransactionMissingInput)?;
                    if coins.is_generated() {
                        let maturity = if coins.is_coinstake {
                            env.params.coinstake_maturity
                        } else {
                            env.params.coinbase_maturity
                        };
                        if spend_height.saturating_sub(coins.height) < maturity {
                            return Err(RuleError::BadTransactionPrematureSpend.into());
                        }
                    }
                    let spent = ctx
                        .set
                        .spend(&input.prevout)
                        .ok_or(RuleError::BadTransactionMissingInput)?;
                    value_in = value_in
                        .checked_add(spent.value)
                        .filter(|total| money_range(spent.value) && money_range(*total))
                        .ok_or(RuleError::BadTransactionInputValueOutOfRange)?;
                    if self.verifier.is_some() {
                        checks.push(InputCheck {
                            tx_index,
                            input_index,
                            spent,
                        });
                    }
                }

                if tx.is_coinstake() {
                    ctx.stake.coinstake_input_value = value_in;
                } else {
                    let value_out = tx
                        .value_out()
                        .ok_or(RuleError::BadTransaction("total output value too large"))?;
                    if value_in < value_out {
                        return Err(RuleError::BadTransactionInBelowOut.into());
                    }
                    fees = fees
                        .checked_add(value_in - value_out)
                        .filter(|total| money_range(*total))
                        .ok_or(RuleError::BadTransactionFeeOutOfRange)?;
                }
            }

            ctx.set.add(txid, tx, spend_height);
        }
        ctx.fees = fees;

        if let Some(verifier) = &self.verifier {
            let flags = ctx.flags;
            let result = checks.par_iter().try_for_each(|check| {
                let tx = &block.transactions[check.tx_index];
                verifier
                    .verify_input(tx, check.input_index, &check.spent, &flags)
                    .map_err(|err| (check.tx_index, check.input_index, err))
            });
            if let Err((tx_index, input_index, err)) = result {
                log_warn!(
                    "input verification failed for tx {} input {}: {}",
                    hash256_to_hex(&ctx.txids[tx_index]),
                    input_index,
                    err
                );
                return Err(RuleError::BadInputScript {
                    tx_index,
                    input_index,
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Coinbase may claim at most the fees plus the block subsidy.
pub struct BlockRewardRule;

impl Rule for BlockRewardRule {
    fn id(&self) -> &'static str {
        "reward"
    }

    fn stage(&self) -> Stage {
        Stage::Execution
    }

    fn check(&self, ctx: &mut ValidationContext, env: &RuleEnv<'_>) -> Result<(), ConsensusError> {
        let subsidy = proof_of_work_reward(ctx.height()?, env.params);
        check_coinbase_reward(ctx, subsidy)
    }
}

pub(crate) fn check_coinbase_reward(
    ctx: &ValidationContext,
    subsidy: Amount,
) -> Result<(), ConsensusError> {
    let claimed = ctx
        .block
        .transactions
        .first()
        .and_then(|coinbase| coinbase.value_out())
        .ok_or(RuleError::BadCoinbaseAmount)?;
    let allowed = ctx
        .fees
        .checked_add(subsidy)
        .ok_or(RuleError::BadCoinbaseAmount)?;
    if claimed > allowed {
        return Err(RuleError::BadCoinbaseAmount.into());
    }
    Ok(())
}
