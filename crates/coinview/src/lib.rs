//! Layered view of the unspent transaction output set.
//!
//! A [`CoinView`] answers "which outputs of these transactions are unspent at the tip"
//! and moves the tip forward (`save_changes`) or back (`rewind`) one block at a time.
//! [`DurableCoinView`] persists to a [`KeyValueStore`](stakd_storage::KeyValueStore);
//! [`CachedCoinView`] decorates any view with a write-back cache. [`CoinViewStack`]
//! walks a chain of decorators to find a particular layer.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use stakd_consensus::Hash256;
use stakd_primitives::encoding::DecodeError;
use stakd_storage::StoreError;

pub mod cache;
pub mod durable;
pub mod stack;
pub mod unspent;

pub use cache::{CacheConfig, CacheStats, CachedCoinView};
pub use durable::DurableCoinView;
pub use stack::CoinViewStack;
pub use unspent::{RewindData, UnspentOutputs};

#[derive(Debug)]
pub enum CoinViewError {
    /// A save named an old tip that is not the view's current tip.
    TipMismatch { expected: Hash256, found: Hash256 },
    Store(StoreError),
    Decode(DecodeError),
    SideStore(String),
    Poisoned(&'static str),
}

impl fmt::Display for CoinViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinViewError::TipMismatch { expected, found } => write!(
                f,
                "coin view tip mismatch: current {}, save expected {}",
                stakd_consensus::params::hash256_to_hex(found),
                stakd_consensus::params::hash256_to_hex(expected),
            ),
            CoinViewError::Store(err) => write!(f, "coin store: {err}"),
            CoinViewError::Decode(err) => write!(f, "coin record decode: {err}"),
            CoinViewError::SideStore(message) => write!(f, "side store flush: {message}"),
            CoinViewError::Poisoned(what) => write!(f, "{what} lock poisoned"),
        }
    }
}

impl std::error::Error for CoinViewError {}

impl From<StoreError> for CoinViewError {
    fn from(err: StoreError) -> Self {
        CoinViewError::Store(err)
    }
}

impl From<DecodeError> for CoinViewError {
    fn from(err: DecodeError) -> Self {
        CoinViewError::Decode(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchCoinsResult {
    pub tip: Hash256,
    /// One slot per requested txid, in request order.
    pub unspent: Vec<Option<UnspentOutputs>>,
}

/// The post-block state of one touched transaction record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoinChange {
    pub unspent: UnspentOutputs,
    /// The record before the block was applied; `None` if the block created it.
    pub original: Option<UnspentOutputs>,
}

impl CoinChange {
    pub fn txid(&self) -> &Hash256 {
        &self.unspent.txid
    }
}

/// Accumulated writes handed from an upper layer to the one below it.
#[derive(Clone, Debug, Default)]
pub struct FlushBatch {
    pub old_tip: Hash256,
    pub new_tip: Hash256,
    /// Records to store; fully spent ones are deleted instead.
    pub upserts: Vec<UnspentOutputs>,
    pub removals: Vec<Hash256>,
    /// Undo entries in application order.
    pub rewinds: Vec<RewindData>,
}

/// State flushed together with, and immediately before, the coin cache.
pub trait SideStore: Send + Sync {
    fn flush(&self) -> Result<(), CoinViewError>;
}

pub trait CoinView: Send + Sync {
    fn tip_hash(&self) -> Result<Hash256, CoinViewError>;

    fn fetch_coins(&self, txids: &[Hash256]) -> Result<FetchCoinsResult, CoinViewError>;

    /// Applies one block's changes and records its undo entry. Fails with
    /// [`CoinViewError::TipMismatch`] and no state change unless `old_tip` is the
    /// current tip.
    fn save_changes(
        &self,
        changes: Vec<CoinChange>,
        old_tip: Hash256,
        new_tip: Hash256,
    ) -> Result<(), CoinViewError>;

    /// Writes a batch accumulated by an upper layer, undo entries included.
    fn apply_flush(&self, batch: FlushBatch) -> Result<(), CoinViewError>;

    /// Undoes the most recent block and returns the new tip.
    fn rewind(&self) -> Result<Hash256, CoinViewError>;

    /// The decorated view, if this layer wraps one.
    fn inner(&self) -> Option<Arc<dyn CoinView>> {
        None
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Builds the undo entry for one block from its changes' pre-block state.
pub fn rewind_from_changes(changes: &[CoinChange], previous_tip: Hash256) -> RewindData {
    let mut rewind = RewindData::new(previous_tip);
    for change in changes {
        match &change.original {
            Some(original) => rewind.outputs_to_restore.push(original.clone()),
            None => rewind.txids_to_remove.push(*change.txid()),
        }
    }
    rewind
}
