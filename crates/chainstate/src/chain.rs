//! Header chain: chained headers with cumulative work and the active chain index.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use primitive_types::U256;
use stakd_consensus::constants::MEDIAN_TIME_SPAN;
use stakd_consensus::Hash256;
use stakd_pow::difficulty::{block_proof, HeaderInfo};
use stakd_primitives::block::BlockHeader;

/// A header linked to its parent, with height and cumulative chain work.
#[derive(Debug)]
pub struct ChainedHeader {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: i32,
    pub chainwork: U256,
    pub proof_of_stake: bool,
    pub prev: Option<Arc<ChainedHeader>>,
}

impl ChainedHeader {
    pub fn genesis(header: BlockHeader) -> Arc<Self> {
        Arc::new(Self {
            hash: header.hash(),
            chainwork: block_proof(header.bits).unwrap_or_default(),
            header,
            height: 0,
            proof_of_stake: false,
            prev: None,
        })
    }

    pub fn connect(prev: &Arc<ChainedHeader>, header: BlockHeader, proof_of_stake: bool) -> Arc<Self> {
        let work = block_proof(header.bits).unwrap_or_default();
        Arc::new(Self {
            hash: header.hash(),
            chainwork: prev.chainwork.saturating_add(work),
            header,
            height: prev.height + 1,
            proof_of_stake,
            prev: Some(Arc::clone(prev)),
        })
    }

    pub fn prev_hash(&self) -> Hash256 {
        self.header.prev_block
    }

    pub fn info(&self) -> HeaderInfo {
        HeaderInfo {
            height: i64::from(self.height),
            time: i64::from(self.header.time),
            bits: self.header.bits,
        }
    }

    /// Iterates from this header back to genesis.
    pub fn ancestors(self: &Arc<Self>) -> Ancestors {
        Ancestors {
            next: Some(Arc::clone(self)),
        }
    }

    pub fn ancestor(self: &Arc<Self>, height: i32) -> Option<Arc<ChainedHeader>> {
        if height > self.height || height < 0 {
            return None;
        }
        self.ancestors().find(|header| header.height == height)
    }

    pub fn median_time_past(self: &Arc<Self>) -> i64 {
        let mut times: Vec<i64> = self
            .ancestors()
            .take(MEDIAN_TIME_SPAN)
            .map(|header| i64::from(header.header.time))
            .collect();
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Header history oldest first, ending at this header.
    pub fn history(self: &Arc<Self>, count: usize) -> Vec<HeaderInfo> {
        let mut infos: Vec<HeaderInfo> = self.ancestors().take(count).map(|h| h.info()).collect();
        infos.reverse();
        infos
    }

    /// The most recent header at or below this one with the given proof kind.
    pub fn last_of_kind(self: &Arc<Self>, proof_of_stake: bool) -> Option<Arc<ChainedHeader>> {
        self.ancestors()
            .find(|header| header.proof_of_stake == proof_of_stake && header.prev.is_some())
    }
}

pub struct Ancestors {
    next: Option<Arc<ChainedHeader>>,
}

impl Iterator for Ancestors {
    type Item = Arc<ChainedHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.prev.clone();
        Some(current)
    }
}

/// The node's view of the best known header chain.
pub trait HeaderChain: Send + Sync {
    /// Returns the header if it is on the active chain.
    fn get_by_hash(&self, hash: &Hash256) -> Option<Arc<ChainedHeader>>;
    fn get_by_height(&self, height: i32) -> Option<Arc<ChainedHeader>>;
    fn tip(&self) -> Arc<ChainedHeader>;
    /// Makes `header` the active tip, reorganizing the height index to its ancestry.
    fn set_tip(&self, header: Arc<ChainedHeader>);
    fn mark_invalid(&self, _hash: &Hash256) {}
    fn is_invalid(&self, _hash: &Hash256) -> bool {
        false
    }
}

#[derive(Debug)]
struct ChainInner {
    active: Vec<Arc<ChainedHeader>>,
    by_hash: HashMap<Hash256, i32>,
    invalid: HashSet<Hash256>,
}

#[derive(Debug)]
pub struct MemoryHeaderChain {
    inner: RwLock<ChainInner>,
}

impl MemoryHeaderChain {
    pub fn new(genesis: Arc<ChainedHeader>) -> Self {
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash, 0);
        Self {
            inner: RwLock::new(ChainInner {
                active: vec![genesis],
                by_hash,
                invalid: HashSet::new(),
            }),
        }
    }

    pub fn genesis(&self) -> Arc<ChainedHeader> {
        Arc::clone(&self.read().active[0])
    }

    pub fn height(&self) -> i32 {
        self.tip().height
    }

    /// Appends a header on top of the current tip. Returns `None` if it does not
    /// extend the tip.
    pub fn push(&self, header: BlockHeader, proof_of_stake: bool) -> Option<Arc<ChainedHeader>> {
        let tip = self.tip();
        if header.prev_block != tip.hash {
            return None;
        }
        let chained = ChainedHeader::connect(&tip, header, proof_of_stake);
        self.set_tip(Arc::clone(&chained));
        Some(chained)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ChainInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ChainInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HeaderChain for MemoryHeaderChain {
    fn get_by_hash(&self, hash: &Hash256) -> Option<Arc<ChainedHeader>> {
        let inner = self.read();
        let height = *inner.by_hash.get(hash)?;
        inner.active.get(height as usize).cloned()
    }

    fn get_by_height(&self, height: i32) -> Option<Arc<ChainedHeader>> {
        let index = usize::try_from(height).ok()?;
        self.read().active.get(index).cloned()
    }

    fn tip(&self) -> Arc<ChainedHeader> {
        let inner = self.read();
        Arc::clone(&inner.active[inner.active.len() - 1])
    }

    fn set_tip(&self, header: Arc<ChainedHeader>) {
        let mut guard = self.write();
        let inner = &mut *guard;
        let mut branch = Vec::new();
        for ancestor in header.ancestors() {
            let index = ancestor.height as usize;
            if inner
                .active
                .get(index)
                .is_some_and(|active| active.hash == ancestor.hash)
            {
                break;
            }
            branch.push(ancestor);
        }
        let fork_len = branch
            .last()
            .map_or(header.height as usize + 1, |oldest| oldest.height as usize);
        let stale: Vec<_> = inner.active.drain(fork_len..).collect();
        for header in stale {
            inner.by_hash.remove(&header.hash);
        }
        for connected in branch.into_iter().rev() {
            inner.by_hash.insert(connected.hash, connected.height);
            inner.active.push(connected);
        }
    }

    fn mark_invalid(&self, hash: &Hash256) {
        self.write().invalid.insert(*hash);
    }

    fn is_invalid(&self, hash: &Hash256) -> bool {
        self.read().invalid.contains(hash)
    }
}
