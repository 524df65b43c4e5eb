//! Rule violations and fatal consensus errors.

use std::fmt;

use stakd_coinview::CoinViewError;
use stakd_consensus::params::hash256_to_hex;
use stakd_consensus::Hash256;

use crate::stake::StakeStoreError;

/// A block broke a consensus rule. Expected during normal operation and reported per
/// block; never fatal to the loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleError {
    BadPrevBlock,
    BadVersion,
    HighHash,
    BadDifficultyBits,
    TimeTooOld,
    TimeTooNew,
    BadBlockLength,
    BadCoinbaseMissing,
    BadMultipleCoinbase,
    BadMerkleRoot,
    /// The transaction list hashes to the header root only through a duplicated subtree.
    BadTransactionDuplicate,
    BadTransaction(&'static str),
    BadCoinbaseLength,
    BadCoinbaseHeight,
    BadTransactionNonFinal,
    BadTransactionBip30,
    BadTransactionMissingInput,
    BadTransactionPrematureSpend,
    BadTransactionInputValueOutOfRange,
    BadTransactionInBelowOut,
    BadTransactionFeeOutOfRange,
    BadInputScript { tx_index: usize, input_index: usize },
    BadCoinbaseAmount,
    BadCoinstakeAmount,
    StakeTimeViolation,
    ProofOfWorkTooHigh,
    BadStakeBlock(&'static str),
    BadBlockSignature(&'static str),
    StakeHashInvalidTarget,
    StakeTooYoung,
}

impl RuleError {
    /// Stable identifier for logs and peers.
    pub fn code(&self) -> &'static str {
        match self {
            RuleError::BadPrevBlock => "bad-prevblk",
            RuleError::BadVersion => "bad-version",
            RuleError::HighHash => "high-hash",
            RuleError::BadDifficultyBits => "bad-diffbits",
            RuleError::TimeTooOld => "time-too-old",
            RuleError::TimeTooNew => "time-too-new",
            RuleError::BadBlockLength => "bad-blk-length",
            RuleError::BadCoinbaseMissing => "bad-cb-missing",
            RuleError::BadMultipleCoinbase => "bad-cb-multiple",
            RuleError::BadMerkleRoot => "bad-txnmrklroot",
            RuleError::BadTransactionDuplicate => "bad-txns-duplicate",
            RuleError::BadTransaction(_) => "bad-txns",
            RuleError::BadCoinbaseLength => "bad-cb-length",
            RuleError::BadCoinbaseHeight => "bad-cb-height",
            RuleError::BadTransactionNonFinal => "bad-txns-nonfinal",
            RuleError::BadTransactionBip30 => "bad-txns-BIP30",
            RuleError::BadTransactionMissingInput => "bad-txns-inputs-missingorspent",
            RuleError::BadTransactionPrematureSpend => "bad-txns-premature-spend-of-coinbase",
            RuleError::BadTransactionInputValueOutOfRange => "bad-txns-inputvalues-outofrange",
            RuleError::BadTransactionInBelowOut => "bad-txns-in-belowout",
            RuleError::BadTransactionFeeOutOfRange => "bad-txns-fee-outofrange",
            RuleError::BadInputScript { .. } => "mandatory-script-verify-flag-failed",
            RuleError::BadCoinbaseAmount => "bad-cb-amount",
            RuleError::BadCoinstakeAmount => "bad-cs-amount",
            RuleError::StakeTimeViolation => "stake-time-violation",
            RuleError::ProofOfWorkTooHigh => "proof-of-work-too-high",
            RuleError::BadStakeBlock(_) => "bad-stake-block",
            RuleError::BadBlockSignature(_) => "bad-block-signature",
            RuleError::StakeHashInvalidTarget => "stake-hash-invalid-target",
            RuleError::StakeTooYoung => "prevout-stake-too-young",
        }
    }
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::BadTransaction(message)
            | RuleError::BadStakeBlock(message)
            | RuleError::BadBlockSignature(message) => write!(f, "{}: {message}", self.code()),
            RuleError::BadInputScript {
                tx_index,
                input_index,
            } => write!(
                f,
                "{}: transaction {tx_index} input {input_index}",
                self.code()
            ),
            _ => f.write_str(self.code()),
        }
    }
}

impl std::error::Error for RuleError {}

#[derive(Debug)]
pub enum ConsensusError {
    Validation(RuleError),
    CoinView(CoinViewError),
    StakeStore(StakeStoreError),
    /// The coin view and the loop disagree about the tip.
    TipDesync { loop_tip: Hash256, view_tip: Hash256 },
    MissingContext(&'static str),
    Poisoned(&'static str),
    /// Shutdown was requested while waiting for a block.
    Cancelled,
}

impl ConsensusError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConsensusError::Validation(_) | ConsensusError::Cancelled)
    }
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::Validation(err) => write!(f, "{err}"),
            ConsensusError::CoinView(err) => write!(f, "{err}"),
            ConsensusError::StakeStore(err) => write!(f, "{err}"),
            ConsensusError::TipDesync { loop_tip, view_tip } => write!(
                f,
                "coin view tip {} does not match consensus tip {}",
                hash256_to_hex(view_tip),
                hash256_to_hex(loop_tip)
            ),
            ConsensusError::MissingContext(what) => write!(f, "validation context missing {what}"),
            ConsensusError::Poisoned(what) => write!(f, "{what} lock poisoned"),
            ConsensusError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for ConsensusError {}

impl From<RuleError> for ConsensusError {
    fn from(err: RuleError) -> Self {
        ConsensusError::Validation(err)
    }
}

impl From<CoinViewError> for ConsensusError {
    fn from(err: CoinViewError) -> Self {
        ConsensusError::CoinView(err)
    }
}

impl From<StakeStoreError> for ConsensusError {
    fn from(err: StakeStoreError) -> Self {
        ConsensusError::StakeStore(err)
    }
}
