//! Per-block validation state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use stakd_coinview::{CoinChange, UnspentOutputs};
use stakd_consensus::deployments::ConsensusFlags;
use stakd_consensus::money::Amount;
use stakd_consensus::Hash256;
use stakd_primitives::block::Block;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxOut};

use crate::chain::ChainedHeader;
use crate::error::ConsensusError;
use crate::stake::BlockStake;

#[derive(Clone, Debug)]
struct WorkingEntry {
    current: Option<UnspentOutputs>,
    original: Option<UnspentOutputs>,
    touched: bool,
}

/// The coins a block reads and writes, keyed by txid. Each entry keeps its pre-block
/// state so the changes can be turned into undo data later.
#[derive(Clone, Debug, Default)]
pub struct UnspentOutputSet {
    entries: HashMap<Hash256, WorkingEntry>,
}

impl UnspentOutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads fetched coins; `unspent` lines up with `txids`.
    pub fn set_coins(&mut self, txids: &[Hash256], unspent: Vec<Option<UnspentOutputs>>) {
        for (txid, coins) in txids.iter().zip(unspent) {
            self.entries.entry(*txid).or_insert(WorkingEntry {
                original: coins.clone(),
                current: coins,
                touched: false,
            });
        }
    }

    pub fn access_coins(&self, txid: &Hash256) -> Option<&UnspentOutputs> {
        self.entries.get(txid)?.current.as_ref()
    }

    /// Marks `outpoint` spent and returns the output, or `None` if it is missing or
    /// already spent.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Option<TxOut> {
        let entry = self.entries.get_mut(&outpoint.hash)?;
        let spent = entry.current.as_mut()?.spend(outpoint.index)?;
        entry.touched = true;
        Some(spent)
    }

    /// Records the outputs of `tx`, replacing whatever the set held for `txid`.
    pub fn add(&mut self, txid: Hash256, tx: &Transaction, height: u32) {
        let coins = UnspentOutputs::with_txid(txid, tx, height);
        let entry = self.entries.entry(txid).or_insert(WorkingEntry {
            current: None,
            original: None,
            touched: false,
        });
        entry.current = Some(coins);
        entry.touched = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Post-block state of every touched record, paired with its pre-block state.
    pub fn changes(&self) -> Vec<CoinChange> {
        let mut changes: Vec<CoinChange> = self
            .entries
            .values()
            .filter(|entry| entry.touched)
            .filter_map(|entry| {
                Some(CoinChange {
                    unspent: entry.current.clone()?,
                    original: entry.original.clone(),
                })
            })
            .collect();
        changes.sort_by(|a, b| a.txid().cmp(b.txid()));
        changes
    }
}

/// Proof-of-stake results produced while validating one block.
#[derive(Clone, Debug, Default)]
pub struct StakeData {
    pub hash_proof: Option<Hash256>,
    pub stake_modifier_v2: Option<Hash256>,
    /// Sum of the coinstake's inputs.
    pub coinstake_input_value: Amount,
    pub block_stake: Option<BlockStake>,
}

#[derive(Debug)]
pub struct ValidationContext {
    pub block: Arc<Block>,
    pub txids: Vec<Hash256>,
    pub chained_header: Option<Arc<ChainedHeader>>,
    pub flags: ConsensusFlags,
    pub set: UnspentOutputSet,
    pub stake: StakeData,
    pub fees: Amount,
    /// Stop after the body rules; nothing is fetched or written.
    pub check_only: bool,
    pub check_pow: bool,
    pub check_merkle_root: bool,
}

impl ValidationContext {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            txids: block.txids(),
            block,
            chained_header: None,
            flags: ConsensusFlags::default(),
            set: UnspentOutputSet::new(),
            stake: StakeData::default(),
            fees: 0,
            check_only: false,
            check_pow: true,
            check_merkle_root: true,
        }
    }

    /// Dry-run context for a block template: structure and context only, no proof of
    /// work.
    pub fn for_template(block: Arc<Block>) -> Self {
        Self {
            check_only: true,
            check_pow: false,
            ..Self::new(block)
        }
    }

    pub fn header(&self) -> Result<&Arc<ChainedHeader>, ConsensusError> {
        self.chained_header
            .as_ref()
            .ok_or(ConsensusError::MissingContext("chained header"))
    }

    pub fn prev_header(&self) -> Result<&Arc<ChainedHeader>, ConsensusError> {
        self.header()?
            .prev
            .as_ref()
            .ok_or(ConsensusError::MissingContext("previous header"))
    }

    pub fn height(&self) -> Result<i32, ConsensusError> {
        Ok(self.header()?.height)
    }

    /// Transactions whose coins the block needs: every spent prevout's txid, plus the
    /// block's own txids when overwrites must be detected. Deduplicated, in first-seen
    /// order.
    pub fn coin_txids(&self, include_own: bool) -> Vec<Hash256> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let inputs = self
            .block
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| tx.vin.iter().map(|input| input.prevout.hash));
        let own = self.txids.iter().copied().filter(|_| include_own);
        for txid in inputs.chain(own) {
            if seen.insert(txid) {
                ids.push(txid);
            }
        }
        ids
    }
}
