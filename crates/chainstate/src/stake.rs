//! Proof-of-stake block metadata: a bounded in-memory window over a durable table,
//! flushed in step with the coin cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use stakd_coinview::{CoinViewError, SideStore};
use stakd_consensus::params::hash256_to_hex;
use stakd_consensus::Hash256;
use stakd_log::log_debug;
use stakd_primitives::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use stakd_primitives::outpoint::OutPoint;
use stakd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::chain::{ChainedHeader, HeaderChain};

pub const FLAG_PROOF_OF_STAKE: u32 = 1 << 0;
pub const FLAG_STAKE_ENTROPY: u32 = 1 << 1;

pub const DEFAULT_STAKE_CACHE_ITEMS: usize = 5_000;

#[derive(Debug)]
pub enum StakeStoreError {
    /// Metadata for a block on the active chain is absent.
    Missing(Hash256),
    Store(StoreError),
    Decode(DecodeError),
    Poisoned,
}

impl fmt::Display for StakeStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StakeStoreError::Missing(hash) => {
                write!(f, "stake metadata missing for block {}", hash256_to_hex(hash))
            }
            StakeStoreError::Store(err) => write!(f, "stake store: {err}"),
            StakeStoreError::Decode(err) => write!(f, "stake record decode: {err}"),
            StakeStoreError::Poisoned => write!(f, "stake cache lock poisoned"),
        }
    }
}

impl std::error::Error for StakeStoreError {}

impl From<StoreError> for StakeStoreError {
    fn from(err: StoreError) -> Self {
        StakeStoreError::Store(err)
    }
}

impl From<DecodeError> for StakeStoreError {
    fn from(err: DecodeError) -> Self {
        StakeStoreError::Decode(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockStake {
    pub flags: u32,
    pub hash_proof: Hash256,
    pub stake_modifier_v2: Hash256,
    pub stake_time: u32,
    pub prevout_stake: OutPoint,
}

impl BlockStake {
    /// Stake data for a proof-of-work block; its hash seeds the next modifier.
    pub fn for_work(block_hash: &Hash256, stake_modifier_v2: Hash256) -> Self {
        let mut stake = Self {
            flags: 0,
            hash_proof: *block_hash,
            stake_modifier_v2,
            stake_time: 0,
            prevout_stake: OutPoint::null(),
        };
        stake.set_entropy_bit(block_hash);
        stake
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.flags & FLAG_PROOF_OF_STAKE != 0
    }

    pub fn entropy_bit(&self) -> bool {
        self.flags & FLAG_STAKE_ENTROPY != 0
    }

    pub fn set_entropy_bit(&mut self, block_hash: &Hash256) {
        if block_hash[0] & 1 == 1 {
            self.flags |= FLAG_STAKE_ENTROPY;
        } else {
            self.flags &= !FLAG_STAKE_ENTROPY;
        }
    }
}

impl Encodable for BlockStake {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.flags);
        encoder.write_hash(&self.hash_proof);
        encoder.write_hash(&self.stake_modifier_v2);
        encoder.write_u32_le(self.stake_time);
        encoder.write_hash(&self.prevout_stake.hash);
        encoder.write_u32_le(self.prevout_stake.index);
    }
}

impl Decodable for BlockStake {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            flags: decoder.read_u32_le()?,
            hash_proof: decoder.read_hash()?,
            stake_modifier_v2: decoder.read_hash()?,
            stake_time: decoder.read_u32_le()?,
            prevout_stake: OutPoint::new(decoder.read_hash()?, decoder.read_u32_le()?),
        })
    }
}

#[derive(Clone, Debug)]
pub struct StakeItem {
    pub block_hash: Hash256,
    pub height: i32,
    pub block_stake: BlockStake,
    pub in_store: bool,
}

pub struct StakeChainStore {
    store: Arc<dyn KeyValueStore>,
    genesis: Hash256,
    threshold: usize,
    items: Mutex<HashMap<Hash256, StakeItem>>,
}

impl StakeChainStore {
    pub fn new(store: Arc<dyn KeyValueStore>, genesis: Hash256, threshold: usize) -> Self {
        Self {
            store,
            genesis,
            threshold: threshold.max(1),
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Hash256, StakeItem>>, StakeStoreError> {
        self.items.lock().map_err(|_| StakeStoreError::Poisoned)
    }

    /// Warms the window from the durable table, walking back from `tip`.
    pub fn load(&self, chain: &dyn HeaderChain, tip: &Hash256) -> Result<usize, StakeStoreError> {
        let Some(start) = chain.get_by_hash(tip) else {
            return Err(StakeStoreError::Missing(*tip));
        };
        let mut items = self.lock()?;
        let mut loaded = 0usize;
        for header in start.ancestors().take(self.threshold) {
            if header.hash == self.genesis {
                break;
            }
            let block_stake = self
                .read(&header.hash)?
                .ok_or(StakeStoreError::Missing(header.hash))?;
            items.insert(
                header.hash,
                StakeItem {
                    block_hash: header.hash,
                    height: header.height,
                    block_stake,
                    in_store: true,
                },
            );
            loaded += 1;
        }
        log_debug!("loaded {loaded} stake records");
        Ok(loaded)
    }

    pub fn get(&self, hash: &Hash256) -> Result<BlockStake, StakeStoreError> {
        if *hash == self.genesis {
            return Ok(BlockStake::for_work(hash, [0u8; 32]));
        }
        if let Some(item) = self.lock()?.get(hash) {
            return Ok(item.block_stake.clone());
        }
        self.read(hash)?.ok_or(StakeStoreError::Missing(*hash))
    }

    /// Queues metadata for `header`; it reaches the durable table on the next flush.
    pub fn set(&self, header: &ChainedHeader, block_stake: BlockStake) -> Result<(), StakeStoreError> {
        self.lock()?.insert(
            header.hash,
            StakeItem {
                block_hash: header.hash,
                height: header.height,
                block_stake,
                in_store: false,
            },
        );
        Ok(())
    }

    pub fn flush_items(&self) -> Result<usize, StakeStoreError> {
        let mut items = self.lock()?;
        let mut batch = WriteBatch::new();
        for item in items.values().filter(|item| !item.in_store) {
            batch.put(Column::StakeMeta, item.block_hash, encode(&item.block_stake));
        }
        let written = batch.len();
        if written > 0 {
            self.store.write_batch(&batch)?;
            for item in items.values_mut() {
                item.in_store = true;
            }
        }

        if items.len() > self.threshold {
            let mut heights: Vec<(i32, Hash256)> =
                items.values().map(|item| (item.height, item.block_hash)).collect();
            heights.sort_unstable();
            let trim = items.len() / 10;
            for (_, hash) in heights.into_iter().take(trim) {
                items.remove(&hash);
            }
            log_debug!("stake cache trimmed {trim} records");
        }
        Ok(written)
    }

    fn read(&self, hash: &Hash256) -> Result<Option<BlockStake>, StakeStoreError> {
        match self.store.get(Column::StakeMeta, hash)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl SideStore for StakeChainStore {
    fn flush(&self) -> Result<(), CoinViewError> {
        self.flush_items()
            .map(|_| ())
            .map_err(|err| CoinViewError::SideStore(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryHeaderChain;
    use stakd_primitives::block::BlockHeader;
    use stakd_storage::memory::MemoryStore;

    fn header(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 7,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_000 + nonce,
            bits: 0x207fffff,
            nonce,
        }
    }

    fn setup(len: u32) -> (Arc<MemoryStore>, MemoryHeaderChain) {
        let chain = MemoryHeaderChain::new(ChainedHeader::genesis(header([0u8; 32], 0)));
        for nonce in 1..len {
            let tip = chain.tip();
            chain.push(header(tip.hash, nonce), true).expect("extends");
        }
        (Arc::new(MemoryStore::new()), chain)
    }

    fn stake(seed: u8) -> BlockStake {
        BlockStake {
            flags: FLAG_PROOF_OF_STAKE,
            hash_proof: [seed; 32],
            stake_modifier_v2: [seed.wrapping_add(1); 32],
            stake_time: 16 * u32::from(seed),
            prevout_stake: OutPoint::new([seed; 32], 1),
        }
    }

    #[test]
    fn genesis_is_synthesized() {
        let (store, chain) = setup(1);
        let genesis = chain.genesis().hash;
        let stakes = StakeChainStore::new(store, genesis, 10);
        let record = stakes.get(&genesis).expect("genesis");
        assert!(!record.is_proof_of_stake());
        assert_eq!(record.stake_modifier_v2, [0u8; 32]);
    }

    #[test]
    fn set_then_flush_persists_and_reloads() {
        let (store, chain) = setup(4);
        let genesis = chain.genesis().hash;
        let stakes = StakeChainStore::new(store.clone(), genesis, 10);
        for height in 1..4 {
            let header = chain.get_by_height(height).expect("header");
            stakes.set(&header, stake(height as u8)).expect("set");
        }
        assert_eq!(stakes.flush_items().expect("flush"), 3);
        assert_eq!(stakes.flush_items().expect("flush again"), 0);

        let reopened = StakeChainStore::new(store, genesis, 10);
        assert_eq!(reopened.load(&chain, &chain.tip().hash).expect("load"), 3);
        let tip = chain.tip();
        assert_eq!(reopened.get(&tip.hash).expect("get"), stake(3));
    }

    #[test]
    fn missing_record_is_an_error() {
        let (store, chain) = setup(3);
        let genesis = chain.genesis().hash;
        let stakes = StakeChainStore::new(store, genesis, 10);
        let tip = chain.tip().hash;
        assert!(matches!(stakes.get(&tip), Err(StakeStoreError::Missing(hash)) if hash == tip));
        assert!(matches!(
            stakes.load(&chain, &tip),
            Err(StakeStoreError::Missing(_))
        ));
    }

    #[test]
    fn flush_trims_oldest_tenth_over_threshold() {
        let (store, chain) = setup(13);
        let genesis = chain.genesis().hash;
        let stakes = StakeChainStore::new(store, genesis, 10);
        for height in 1..13 {
            let header = chain.get_by_height(height).expect("header");
            stakes.set(&header, stake(height as u8)).expect("set");
        }
        stakes.flush_items().expect("flush");
        assert_eq!(stakes.len(), 11);
        let oldest = chain.get_by_height(1).expect("header").hash;
        // Trimmed from memory but still readable through the store.
        assert_eq!(stakes.get(&oldest).expect("read through"), stake(1));
    }
}
