#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stakd_chainstate::chain::{ChainedHeader, HeaderChain, MemoryHeaderChain};
use stakd_chainstate::collaborators::TimeSource;
use stakd_chainstate::source::{BlockRequestOptions, BlockSource, Cancelled, ShutdownSignal};
use stakd_chainstate::{ConsensusLoop, RuleSet};
use stakd_coinview::{CacheConfig, CachedCoinView, CoinView, DurableCoinView};
use stakd_consensus::money::Amount;
use stakd_consensus::{consensus_params, ConsensusParams, Hash256, Network};
use stakd_pow::check_proof_of_work;
use stakd_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::script::{coinbase_height_prefix, p2pkh_script};
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};
use stakd_storage::memory::MemoryStore;

pub const GENESIS_TIME: u32 = 1_600_000_000;
pub const EASY_BITS: u32 = 0x207fffff;

pub fn block_time(height: i32) -> u32 {
    GENESIS_TIME + 16 * height as u32
}

pub struct FixedTime(pub i64);

impl TimeSource for FixedTime {
    fn adjusted_time(&self) -> i64 {
        self.0
    }
}

/// Serves a prepared list of blocks, following `set_location` like a real source.
#[derive(Default)]
pub struct VecBlockSource {
    blocks: Mutex<Vec<Arc<Block>>>,
    position: Mutex<usize>,
    rewind_once: AtomicBool,
    options: Mutex<BlockRequestOptions>,
}

impl VecBlockSource {
    pub fn push(&self, block: Block) {
        self.blocks.lock().expect("blocks").push(Arc::new(block));
    }

    /// The next `next_block` call answers "no block", forcing a rewind.
    pub fn signal_rewind(&self) {
        self.rewind_once.store(true, Ordering::SeqCst);
    }

    pub fn options(&self) -> BlockRequestOptions {
        *self.options.lock().expect("options")
    }
}

impl BlockSource for VecBlockSource {
    fn next_block(&self, _shutdown: &ShutdownSignal) -> Result<Option<Arc<Block>>, Cancelled> {
        if self.rewind_once.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        let blocks = self.blocks.lock().expect("blocks");
        let mut position = self.position.lock().expect("position");
        match blocks.get(*position) {
            Some(block) => {
                *position += 1;
                Ok(Some(Arc::clone(block)))
            }
            None => Err(Cancelled),
        }
    }

    fn set_location(&self, tip: &ChainedHeader) {
        let blocks = self.blocks.lock().expect("blocks");
        *self.position.lock().expect("position") = blocks
            .iter()
            .position(|block| block.header.prev_block == tip.hash)
            .unwrap_or(blocks.len());
    }

    fn try_peek_lookahead(&self, n: usize) -> Option<Arc<Block>> {
        let blocks = self.blocks.lock().expect("blocks");
        let position = *self.position.lock().expect("position");
        blocks.get(position + n).cloned()
    }

    fn request_options(&self, options: BlockRequestOptions) {
        *self.options.lock().expect("options") = options;
    }
}

pub fn regtest() -> Arc<ConsensusParams> {
    Arc::new(consensus_params(Network::Regtest))
}

pub fn coinbase(height: i32, value: Amount, time: u32) -> Transaction {
    let mut script_sig = coinbase_height_prefix(height);
    script_sig.extend_from_slice(&[0x00, 0x00]);
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: vec![TxOut::new(value, p2pkh_script(&[7u8; 20]))],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, value: Amount, time: u32) -> Transaction {
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn::new(prevout, vec![0x51])],
        vout: vec![TxOut::new(value, p2pkh_script(&[8u8; 20]))],
        lock_time: 0,
    }
}

pub fn assemble(prev: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: CURRENT_VERSION,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: EASY_BITS,
            nonce: 0,
        },
        transactions,
        signature: Vec::new(),
    };
    block.header.merkle_root = block.compute_merkle_root().root;
    block
}

pub fn mine(mut block: Block, params: &ConsensusParams) -> Block {
    while check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

pub fn pow_block(prev: Hash256, height: i32, transactions: Vec<Transaction>, params: &ConsensusParams) -> Block {
    mine(assemble(prev, block_time(height), transactions), params)
}

pub fn genesis_block(params: &ConsensusParams) -> Block {
    pow_block([0u8; 32], 0, vec![coinbase(0, 0, GENESIS_TIME)], params)
}

/// A header chain, a cached coin view over a memory store, and a scripted source.
pub struct Harness {
    pub params: Arc<ConsensusParams>,
    pub store: Arc<MemoryStore>,
    pub genesis: Block,
    pub chain: Arc<MemoryHeaderChain>,
    pub durable: Arc<DurableCoinView<Arc<MemoryStore>>>,
    pub cache: Arc<CachedCoinView>,
    pub source: Arc<VecBlockSource>,
}

impl Harness {
    pub fn new() -> Self {
        let params = regtest();
        let genesis = genesis_block(&params);
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MemoryHeaderChain::new(ChainedHeader::genesis(
            genesis.header.clone(),
        )));
        let durable = Arc::new(
            DurableCoinView::open(Arc::clone(&store), genesis.hash()).expect("open durable view"),
        );
        let cache = Arc::new(CachedCoinView::new(
            Arc::clone(&durable) as Arc<dyn CoinView>,
            CacheConfig::default(),
        ));
        Self {
            params,
            store,
            genesis,
            chain,
            durable,
            cache,
            source: Arc::new(VecBlockSource::default()),
        }
    }

    pub fn consensus(&self, rules: RuleSet) -> ConsensusLoop {
        ConsensusLoop::new(
            Arc::clone(&self.params),
            Arc::clone(&self.chain) as Arc<dyn HeaderChain>,
            Arc::clone(&self.cache) as Arc<dyn CoinView>,
            Arc::clone(&self.source) as Arc<dyn BlockSource>,
            rules,
        )
        .with_time_source(Arc::new(FixedTime(i64::from(GENESIS_TIME) + 1_000_000)))
    }

    /// Builds `count` plain proof-of-work blocks on the current tip of the header
    /// chain and queues them on the source. Returns them in order.
    pub fn extend(&self, tip: Hash256, first_height: i32, count: i32) -> Vec<Block> {
        let mut prev = tip;
        (first_height..first_height + count)
            .map(|height| {
                let block = pow_block(
                    prev,
                    height,
                    vec![coinbase(height, 4 * stakd_consensus::money::COIN, block_time(height))],
                    &self.params,
                );
                prev = block.hash();
                self.source.push(block.clone());
                block
            })
            .collect()
    }
}
