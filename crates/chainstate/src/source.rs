//! Where the consensus loop gets its blocks from.

use std::fmt;
use std::sync::Arc;

use stakd_primitives::block::Block;
use tokio::sync::watch;

use crate::chain::ChainedHeader;

/// Becomes `true` once the node is shutting down.
pub type ShutdownSignal = watch::Receiver<bool>;

pub fn is_shutdown(signal: &ShutdownSignal) -> bool {
    *signal.borrow()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("block wait cancelled")
    }
}

impl std::error::Error for Cancelled {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockRequestOptions {
    /// How many blocks past the next one the caller wants to be able to peek at.
    pub lookahead: usize,
}

pub trait BlockSource: Send + Sync {
    /// Blocks until the block after the current location is available. `Ok(None)`
    /// means the source's view of the chain moved below the caller's tip and the
    /// caller must rewind.
    fn next_block(&self, shutdown: &ShutdownSignal) -> Result<Option<Arc<Block>>, Cancelled>;

    /// Repositions the source so the next block returned builds on `tip`.
    fn set_location(&self, tip: &ChainedHeader);

    /// The block `n` positions after the next one, if already buffered.
    fn try_peek_lookahead(&self, n: usize) -> Option<Arc<Block>>;

    fn request_options(&self, options: BlockRequestOptions);
}
