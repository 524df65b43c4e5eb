use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stakd_coinview::{
    CacheConfig, CachedCoinView, CoinChange, CoinView, CoinViewError, DurableCoinView,
    SideStore, UnspentOutputs,
};
use stakd_consensus::constants::DUPLICATE_TRANSACTION_IDS;
use stakd_consensus::Hash256;
use stakd_primitives::transaction::TxOut;
use stakd_storage::memory::MemoryStore;
use stakd_storage::{Column, KeyValueStore};

const GENESIS: Hash256 = [0u8; 32];

fn block_hash(n: u8) -> Hash256 {
    let mut hash = [0xb0u8; 32];
    hash[0] = n;
    hash
}

fn coins(id: u8, height: u32, outputs: usize) -> UnspentOutputs {
    UnspentOutputs {
        txid: [id; 32],
        version: 1,
        height,
        time: 1_000 + height,
        is_coinbase: false,
        is_coinstake: false,
        outputs: (0..outputs)
            .map(|i| Some(TxOut::new(100 + i as i64, vec![0x51])))
            .collect(),
    }
}

fn create(record: UnspentOutputs) -> CoinChange {
    CoinChange {
        unspent: record,
        original: None,
    }
}

fn spend(original: &UnspentOutputs, indices: &[u32]) -> CoinChange {
    let mut unspent = original.clone();
    for index in indices {
        unspent.spend(*index);
    }
    CoinChange {
        unspent,
        original: Some(original.clone()),
    }
}

fn stack(config: CacheConfig) -> (Arc<DurableCoinView<Arc<MemoryStore>>>, Arc<MemoryStore>, CachedCoinView) {
    let store = Arc::new(MemoryStore::new());
    let durable = Arc::new(DurableCoinView::open(Arc::clone(&store), GENESIS).expect("durable"));
    let cache = CachedCoinView::new(durable.clone(), config);
    (durable, store, cache)
}

fn ids() -> Vec<Hash256> {
    vec![[1u8; 32], [2u8; 32], [3u8; 32]]
}

#[test]
fn fetch_over_empty_store_reports_genesis_and_absent_slots() {
    let (_, _, cache) = stack(CacheConfig::default());
    let result = cache.fetch_coins(&ids()).expect("fetch");
    assert_eq!(result.tip, GENESIS);
    assert_eq!(result.unspent, vec![None, None, None]);
}

#[test]
fn repeated_fetches_agree_and_count_hits() {
    let (_, _, cache) = stack(CacheConfig::default());
    cache
        .save_changes(vec![create(coins(1, 1, 2))], GENESIS, block_hash(1))
        .expect("save");
    let first = cache.fetch_coins(&ids()).expect("first fetch");
    let second = cache.fetch_coins(&ids()).expect("second fetch");
    assert_eq!(first, second);
    let stats = cache.stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.hits, 4);
}

#[test]
fn save_with_stale_tip_leaves_cache_untouched() {
    let (_, _, cache) = stack(CacheConfig::default());
    cache
        .save_changes(vec![create(coins(1, 1, 1))], GENESIS, block_hash(1))
        .expect("save");
    let before = cache.stats();

    let err = cache
        .save_changes(vec![create(coins(2, 2, 1))], block_hash(9), block_hash(2))
        .expect_err("stale tip");
    assert!(matches!(err, CoinViewError::TipMismatch { .. }));
    assert_eq!(cache.stats(), before);
    assert_eq!(cache.tip_hash().expect("tip"), block_hash(1));
    assert_eq!(
        cache.fetch_coins(&[[2u8; 32]]).expect("fetch").unspent,
        vec![None]
    );
}

#[test]
fn save_then_rewind_is_identity_in_cache_and_after_flush() {
    for flush_between in [false, true] {
        let (durable, _, cache) = stack(CacheConfig::default());
        cache
            .save_changes(
                vec![create(coins(1, 1, 2)), create(coins(2, 1, 1))],
                GENESIS,
                block_hash(1),
            )
            .expect("block 1");
        cache.flush(true).expect("flush block 1");
        let before = cache.fetch_coins(&ids()).expect("before");

        let tx1 = coins(1, 1, 2);
        let tx2 = coins(2, 1, 1);
        cache
            .save_changes(
                vec![spend(&tx1, &[0]), spend(&tx2, &[0]), create(coins(3, 2, 3))],
                block_hash(1),
                block_hash(2),
            )
            .expect("block 2");
        if flush_between {
            cache.flush(true).expect("flush block 2");
            assert_eq!(durable.tip_hash().expect("durable tip"), block_hash(2));
        }

        assert_eq!(cache.rewind().expect("rewind"), block_hash(1));
        assert_eq!(cache.fetch_coins(&ids()).expect("after"), before);

        cache.flush(true).expect("flush rewind");
        assert_eq!(durable.tip_hash().expect("durable tip"), block_hash(1));
        assert_eq!(durable.fetch_coins(&ids()).expect("durable after"), before);
    }
}

#[test]
fn pruned_record_restored_by_rewind_is_pruned_again() {
    let (durable, store, cache) = stack(CacheConfig::default());
    let record = coins(7, 1, 1);
    cache
        .save_changes(vec![create(record.clone())], GENESIS, block_hash(1))
        .expect("block 1");
    cache
        .save_changes(vec![spend(&record, &[0])], block_hash(1), block_hash(2))
        .expect("block 2");
    assert_eq!(cache.stats().items, 0);

    assert_eq!(cache.rewind().expect("rewind 2"), block_hash(1));
    assert_eq!(
        cache.fetch_coins(&[record.txid]).expect("restored").unspent,
        vec![Some(record.clone())]
    );
    cache
        .save_changes(vec![spend(&record, &[0])], block_hash(1), block_hash(3))
        .expect("block 3");
    assert_eq!(cache.stats().items, 0);

    assert_eq!(cache.rewind().expect("rewind 3"), block_hash(1));
    assert_eq!(cache.rewind().expect("rewind 1"), GENESIS);
    let stats = cache.stats();
    assert_eq!((stats.items, stats.dirty, stats.pending_rewinds), (0, 0, 0));

    assert!(!cache.flush(true).expect("flush"));
    assert!(store.is_empty(Column::Coins));
    assert_eq!(durable.tip_hash().expect("durable tip"), GENESIS);
}

#[test]
fn unforced_flush_waits_for_interval_and_second_flush_is_noop() {
    let (durable, store, cache) = stack(CacheConfig {
        max_items: 100,
        flush_interval: Duration::from_secs(3600),
    });
    cache
        .save_changes(vec![create(coins(1, 1, 1))], GENESIS, block_hash(1))
        .expect("save");
    assert!(!cache.flush(false).expect("gated flush"));
    assert_eq!(durable.tip_hash().expect("tip"), GENESIS);

    assert!(cache.flush(true).expect("forced flush"));
    let depth = durable.rewind_depth().expect("depth");
    let records = store.len(Column::Coins);
    assert!(!cache.flush(true).expect("second flush"));
    assert_eq!(durable.rewind_depth().expect("depth"), depth);
    assert_eq!(store.len(Column::Coins), records);
    assert_eq!(cache.stats().dirty, 0);
}

#[test]
fn spent_new_records_are_pruned_before_reaching_the_store() {
    let (_, store, cache) = stack(CacheConfig::default());
    let mut record = coins(5, 1, 1);
    record.spend(0);
    cache
        .save_changes(vec![create(record)], GENESIS, block_hash(1))
        .expect("save");
    assert_eq!(cache.stats().items, 0);
    cache.flush(true).expect("flush");
    assert!(store.is_empty(Column::Coins));
}

#[test]
fn historical_duplicate_is_treated_as_durable() {
    let (_, _, cache) = stack(CacheConfig::default());
    let mut record = coins(0, 1, 1);
    record.txid = DUPLICATE_TRANSACTION_IDS[0];
    record.spend(0);
    cache
        .save_changes(vec![create(record)], GENESIS, block_hash(1))
        .expect("save");
    assert_eq!(cache.stats().items, 1);
    assert_eq!(cache.stats().dirty, 1);
}

#[test]
fn eviction_returns_to_bound_and_keeps_dirty_records() {
    let (_, store, cache) = stack(CacheConfig {
        max_items: 10,
        flush_interval: Duration::from_secs(3600),
    });
    let dirty: Vec<CoinChange> = (1..=5).map(|id| create(coins(id, 1, 1))).collect();
    cache.save_changes(dirty, GENESIS, block_hash(1)).expect("save");

    for id in 100..120u8 {
        store
            .put(
                Column::Coins,
                &[id; 32],
                &stakd_primitives::encoding::encode(&coins(id, 0, 1)),
            )
            .expect("seed");
    }
    let clean: Vec<Hash256> = (100..120u8).map(|id| [id; 32]).collect();
    cache.fetch_coins(&clean).expect("fetch");

    let stats = cache.stats();
    assert!(stats.items <= 10, "items {}", stats.items);
    assert_eq!(stats.dirty, 5);
    let dirty_ids: Vec<Hash256> = (1..=5).map(|id| [id; 32]).collect();
    let fetched = cache.fetch_coins(&dirty_ids).expect("dirty fetch");
    assert!(fetched.unspent.iter().all(Option::is_some));
}

#[test]
fn explicit_evict_drops_a_third_of_clean_records() {
    let (_, store, cache) = stack(CacheConfig::default());
    for id in 0..30u8 {
        store
            .put(
                Column::Coins,
                &[id; 32],
                &stakd_primitives::encoding::encode(&coins(id, 0, 1)),
            )
            .expect("seed");
    }
    let all: Vec<Hash256> = (0..30u8).map(|id| [id; 32]).collect();
    cache.fetch_coins(&all).expect("fetch");
    assert_eq!(cache.evict().expect("evict"), 10);
    assert_eq!(cache.stats().items, 20);
}

struct CountingSideStore {
    flushes: AtomicUsize,
}

impl SideStore for CountingSideStore {
    fn flush(&self) -> Result<(), CoinViewError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn side_store_flushes_with_each_write() {
    let side = Arc::new(CountingSideStore {
        flushes: AtomicUsize::new(0),
    });
    let store = Arc::new(MemoryStore::new());
    let durable = Arc::new(DurableCoinView::open(store, GENESIS).expect("durable"));
    let cache = CachedCoinView::new(durable, CacheConfig::default()).with_side_store(side.clone());

    cache.flush(true).expect("empty flush");
    assert_eq!(side.flushes.load(Ordering::SeqCst), 0);
    cache
        .save_changes(vec![create(coins(1, 1, 1))], GENESIS, block_hash(1))
        .expect("save");
    cache.flush(true).expect("flush");
    assert_eq!(side.flushes.load(Ordering::SeqCst), 1);
}

#[test]
fn rewind_past_cache_reaches_durable_history() {
    let (durable, _, cache) = stack(CacheConfig::default());
    cache
        .save_changes(vec![create(coins(1, 1, 1))], GENESIS, block_hash(1))
        .expect("block 1");
    cache
        .save_changes(vec![create(coins(2, 2, 1))], block_hash(1), block_hash(2))
        .expect("block 2");
    cache.flush(true).expect("flush");

    assert_eq!(cache.rewind().expect("rewind 2"), block_hash(1));
    assert_eq!(cache.rewind().expect("rewind 1"), GENESIS);
    assert_eq!(durable.rewind_depth().expect("depth"), 0);
    let result = cache.fetch_coins(&ids()).expect("fetch");
    assert_eq!(result.tip, GENESIS);
    assert!(result.unspent.iter().all(Option::is_none));
}
