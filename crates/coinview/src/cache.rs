//! Write-back cache over another coin view.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use stakd_consensus::constants::is_duplicate_transaction;
use stakd_consensus::Hash256;
use stakd_log::{log_debug, log_info};

use crate::unspent::{RewindData, UnspentOutputs};
use crate::{CoinChange, CoinView, CoinViewError, FetchCoinsResult, FlushBatch, SideStore};

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Soft bound on cached records; dirty records may push past it.
    pub max_items: usize,
    /// Minimum time between unforced flushes.
    pub flush_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 100_000,
            flush_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
struct CacheItem {
    /// `None` records a transaction known to have no unspent outputs.
    coins: Option<UnspentOutputs>,
    exists_in_durable: bool,
    is_dirty: bool,
}

struct CacheState {
    items: HashMap<Hash256, CacheItem>,
    tip: Option<Hash256>,
    durable_tip: Option<Hash256>,
    pending_rewinds: Vec<RewindData>,
    last_flush: Instant,
}

impl CacheState {
    fn dirty_count(&self) -> usize {
        self.items.values().filter(|item| item.is_dirty).count()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub items: usize,
    pub dirty: usize,
    pub pending_rewinds: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

pub struct CachedCoinView {
    inner: Arc<dyn CoinView>,
    config: CacheConfig,
    side_store: Option<Arc<dyn SideStore>>,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedCoinView {
    pub fn new(inner: Arc<dyn CoinView>, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            side_store: None,
            state: Mutex::new(CacheState {
                items: HashMap::new(),
                tip: None,
                durable_tip: None,
                pending_rewinds: Vec::new(),
                last_flush: Instant::now(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Flushes `side_store` before every write to the inner view.
    pub fn with_side_store(mut self, side_store: Arc<dyn SideStore>) -> Self {
        self.side_store = Some(side_store);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        let (items, dirty, pending_rewinds) = match self.state.lock() {
            Ok(state) => (
                state.items.len(),
                state.dirty_count(),
                state.pending_rewinds.len(),
            ),
            Err(_) => (0, 0, 0),
        };
        CacheStats {
            items,
            dirty,
            pending_rewinds,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, CoinViewError> {
        self.state
            .lock()
            .map_err(|_| CoinViewError::Poisoned("coin cache"))
    }

    fn ensure_tips(&self, state: &mut CacheState) -> Result<Hash256, CoinViewError> {
        if let Some(tip) = state.tip {
            return Ok(tip);
        }
        let tip = self.inner.tip_hash()?;
        state.tip = Some(tip);
        state.durable_tip = Some(tip);
        Ok(tip)
    }

    /// Writes dirty records and pending undo entries to the inner view. Unless `force`
    /// is set this is a no-op until `flush_interval` has passed since the last flush.
    /// Returns whether anything was written.
    pub fn flush(&self, force: bool) -> Result<bool, CoinViewError> {
        let mut state = self.lock()?;
        self.flush_locked(&mut state, force)
    }

    fn flush_locked(&self, state: &mut CacheState, force: bool) -> Result<bool, CoinViewError> {
        if !force && state.last_flush.elapsed() < self.config.flush_interval {
            return Ok(false);
        }
        let dirty = state.dirty_count();
        if dirty == 0 && state.pending_rewinds.is_empty() {
            state.last_flush = Instant::now();
            return Ok(false);
        }
        let tip = self.ensure_tips(state)?;
        let old_tip = state.durable_tip.unwrap_or(tip);

        if let Some(side_store) = &self.side_store {
            side_store.flush()?;
        }

        let mut batch = FlushBatch {
            old_tip,
            new_tip: tip,
            upserts: Vec::with_capacity(dirty),
            removals: Vec::new(),
            rewinds: state.pending_rewinds.clone(),
        };
        for (txid, item) in state.items.iter().filter(|(_, item)| item.is_dirty) {
            match &item.coins {
                Some(coins) => batch.upserts.push(coins.clone()),
                None => batch.removals.push(*txid),
            }
        }
        let written = batch.upserts.len() + batch.removals.len();
        let rewinds = batch.rewinds.len();
        self.inner.apply_flush(batch)?;

        state.items.retain(|_, item| {
            if !item.is_dirty {
                return true;
            }
            item.is_dirty = false;
            match &item.coins {
                Some(coins) if coins.is_fully_spent() => false,
                Some(_) => {
                    item.exists_in_durable = true;
                    true
                }
                None => {
                    item.exists_in_durable = false;
                    true
                }
            }
        });
        state.pending_rewinds.clear();
        state.durable_tip = Some(tip);
        state.last_flush = Instant::now();
        log_debug!("coin cache flushed {written} records and {rewinds} rewind entries");
        Ok(true)
    }

    /// Drops a random third of the clean records, and more if needed to get back under
    /// `max_items`. Dirty records are never dropped.
    pub fn evict(&self) -> Result<usize, CoinViewError> {
        let mut state = self.lock()?;
        Ok(self.evict_locked(&mut state))
    }

    fn evict_locked(&self, state: &mut CacheState) -> usize {
        let mut clean: Vec<Hash256> = state
            .items
            .iter()
            .filter(|(_, item)| !item.is_dirty)
            .map(|(txid, _)| *txid)
            .collect();
        let over = state.items.len().saturating_sub(self.config.max_items);
        let count = (clean.len() / 3).max(over).min(clean.len());
        if count == 0 {
            return 0;
        }
        clean.shuffle(&mut rand::thread_rng());
        for txid in &clean[..count] {
            state.items.remove(txid);
        }
        count
    }

    fn apply_rewind(state: &mut CacheState, rewind: RewindData) {
        for txid in rewind.txids_to_remove {
            let exists_in_durable = state
                .items
                .get(&txid)
                .map_or_else(|| is_duplicate_transaction(&txid), |item| item.exists_in_durable);
            if !exists_in_durable {
                state.items.remove(&txid);
                continue;
            }
            state.items.insert(
                txid,
                CacheItem {
                    coins: None,
                    exists_in_durable,
                    is_dirty: true,
                },
            );
        }
        for coins in rewind.outputs_to_restore {
            // A record pruned since the last flush was created by a block still pending.
            let created_since_flush = !is_duplicate_transaction(&coins.txid)
                && state
                    .pending_rewinds
                    .iter()
                    .any(|pending| pending.txids_to_remove.contains(&coins.txid));
            let item = state.items.entry(coins.txid).or_insert(CacheItem {
                coins: None,
                exists_in_durable: !created_since_flush,
                is_dirty: false,
            });
            item.coins = Some(coins);
            item.is_dirty = true;
        }
        state.tip = Some(rewind.previous_tip);
    }
}

impl CoinView for CachedCoinView {
    fn tip_hash(&self) -> Result<Hash256, CoinViewError> {
        let mut state = self.lock()?;
        self.ensure_tips(&mut state)
    }

    fn fetch_coins(&self, txids: &[Hash256]) -> Result<FetchCoinsResult, CoinViewError> {
        let mut state = self.lock()?;
        let tip = self.ensure_tips(&mut state)?;

        let mut unspent = Vec::with_capacity(txids.len());
        let mut missing = Vec::new();
        for (slot, txid) in txids.iter().enumerate() {
            match state.items.get(txid) {
                Some(item) => unspent.push(item.coins.clone()),
                None => {
                    unspent.push(None);
                    missing.push((slot, *txid));
                }
            }
        }
        self.hits
            .fetch_add((txids.len() - missing.len()) as u64, Ordering::Relaxed);
        self.misses
            .fetch_add(missing.len() as u64, Ordering::Relaxed);

        if !missing.is_empty() {
            let ids: Vec<Hash256> = missing.iter().map(|(_, txid)| *txid).collect();
            let fetched = self.inner.fetch_coins(&ids)?;
            for ((slot, txid), coins) in missing.into_iter().zip(fetched.unspent) {
                state.items.entry(txid).or_insert(CacheItem {
                    exists_in_durable: coins.is_some(),
                    coins: coins.clone(),
                    is_dirty: false,
                });
                unspent[slot] = coins;
            }
            if state.items.len() > self.config.max_items {
                let evicted = self.evict_locked(&mut state);
                log_debug!("coin cache evicted {evicted} records");
            }
        }

        Ok(FetchCoinsResult { tip, unspent })
    }

    fn save_changes(
        &self,
        changes: Vec<CoinChange>,
        old_tip: Hash256,
        new_tip: Hash256,
    ) -> Result<(), CoinViewError> {
        let mut state = self.lock()?;
        let current = self.ensure_tips(&mut state)?;
        if current != old_tip {
            return Err(CoinViewError::TipMismatch {
                expected: old_tip,
                found: current,
            });
        }

        let mut rewind = RewindData::new(old_tip);
        for change in changes {
            let CoinChange { unspent, original } = change;
            let txid = unspent.txid;
            // An uncached record falls back to the caller's pre-block copy.
            let item = state.items.entry(txid).or_insert_with(|| CacheItem {
                exists_in_durable: original.is_some() || is_duplicate_transaction(&txid),
                coins: original,
                is_dirty: false,
            });
            match item.coins.take() {
                Some(previous) => rewind.outputs_to_restore.push(previous),
                None => rewind.txids_to_remove.push(txid),
            }
            let prune = unspent.is_fully_spent() && !item.exists_in_durable;
            item.coins = Some(unspent);
            item.is_dirty = true;
            if prune {
                state.items.remove(&txid);
            }
        }

        state.pending_rewinds.push(rewind);
        state.tip = Some(new_tip);
        Ok(())
    }

    fn apply_flush(&self, batch: FlushBatch) -> Result<(), CoinViewError> {
        let mut state = self.lock()?;
        let current = self.ensure_tips(&mut state)?;
        if current != batch.old_tip {
            return Err(CoinViewError::TipMismatch {
                expected: batch.old_tip,
                found: current,
            });
        }
        for coins in batch.upserts {
            let item = state.items.entry(coins.txid).or_insert(CacheItem {
                coins: None,
                exists_in_durable: true,
                is_dirty: false,
            });
            item.coins = Some(coins);
            item.is_dirty = true;
        }
        for txid in batch.removals {
            let item = state.items.entry(txid).or_insert(CacheItem {
                coins: None,
                exists_in_durable: true,
                is_dirty: false,
            });
            item.coins = None;
            item.is_dirty = true;
        }
        state.pending_rewinds.extend(batch.rewinds);
        state.tip = Some(batch.new_tip);
        Ok(())
    }

    fn rewind(&self) -> Result<Hash256, CoinViewError> {
        let mut state = self.lock()?;
        self.ensure_tips(&mut state)?;
        if let Some(rewind) = state.pending_rewinds.pop() {
            let tip = rewind.previous_tip;
            Self::apply_rewind(&mut state, rewind);
            return Ok(tip);
        }

        // Nothing left in memory to undo; the inner view owns the remaining history.
        if state.dirty_count() > 0 {
            self.flush_locked(&mut state, true)?;
        }
        let tip = self.inner.rewind()?;
        let dropped = state.items.len();
        state.items.clear();
        state.tip = Some(tip);
        state.durable_tip = Some(tip);
        log_info!("coin cache rewound inner view; dropped {dropped} cached records");
        Ok(tip)
    }

    fn inner(&self) -> Option<Arc<dyn CoinView>> {
        Some(Arc::clone(&self.inner))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
