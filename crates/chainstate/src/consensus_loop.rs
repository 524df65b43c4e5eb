//! The consensus loop: the single writer that moves the chain tip.
//!
//! Blocks come from a [`BlockSource`] one at a time. Each is run through the
//! [`RuleSet`] against a fresh [`ValidationContext`]; an accepted block's coin changes
//! are saved to the coin view and the tip advances. Rule violations are reported per
//! block through [`BlockResult`]; anything else stops the loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use stakd_coinview::{CachedCoinView, CoinView, CoinViewStack};
use stakd_consensus::params::hash256_to_hex;
use stakd_consensus::{ConsensusParams, Hash256};
use stakd_log::{log_critical, log_debug, log_info, log_warn};
use stakd_primitives::block::Block;

use crate::chain::{ChainedHeader, HeaderChain};
use crate::collaborators::{DeploymentTracker, HeightDeployments, SystemTimeSource, TimeSource};
use crate::context::ValidationContext;
use crate::error::{ConsensusError, RuleError};
use crate::metrics::{micros, BlockTimings, ConsensusPerformanceCounter};
use crate::rules::{RuleEnv, RuleSet, Stage};
use crate::source::{is_shutdown, BlockRequestOptions, BlockSource, ShutdownSignal};
use crate::stake::StakeChainStore;

/// Outcome of one block pulled from the source.
#[derive(Clone, Debug)]
pub struct BlockResult {
    pub block: Arc<Block>,
    pub chained_header: Option<Arc<ChainedHeader>>,
    pub error: Option<RuleError>,
}

impl BlockResult {
    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
    }
}

/// Admits one coin prefetch at a time.
#[derive(Clone, Default)]
struct PrefetchSlot(Arc<AtomicBool>);

impl PrefetchSlot {
    fn try_claim(&self) -> Option<PrefetchClaim> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(PrefetchClaim(Arc::clone(&self.0)))
    }
}

/// Frees the slot when dropped.
struct PrefetchClaim(Arc<AtomicBool>);

impl Drop for PrefetchClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConsensusLoop {
    params: Arc<ConsensusParams>,
    chain: Arc<dyn HeaderChain>,
    coin_view: Arc<dyn CoinView>,
    cache: Option<Arc<CachedCoinView>>,
    source: Arc<dyn BlockSource>,
    rules: RuleSet,
    deployments: Arc<dyn DeploymentTracker>,
    time: Arc<dyn TimeSource>,
    stakes: Option<Arc<StakeChainStore>>,
    tip: Mutex<Option<Arc<ChainedHeader>>>,
    write_lock: Arc<Mutex<()>>,
    counters: Arc<ConsensusPerformanceCounter>,
    prefetch: PrefetchSlot,
}

impl ConsensusLoop {
    pub fn new(
        params: Arc<ConsensusParams>,
        chain: Arc<dyn HeaderChain>,
        coin_view: Arc<dyn CoinView>,
        source: Arc<dyn BlockSource>,
        rules: RuleSet,
    ) -> Self {
        let cache = CoinViewStack::new(Arc::clone(&coin_view)).find::<CachedCoinView>();
        Self {
            deployments: Arc::new(HeightDeployments::new(Arc::clone(&params))),
            params,
            chain,
            coin_view,
            cache,
            source,
            rules,
            time: Arc::new(SystemTimeSource),
            stakes: None,
            tip: Mutex::new(None),
            write_lock: Arc::new(Mutex::new(())),
            counters: Arc::new(ConsensusPerformanceCounter::default()),
            prefetch: PrefetchSlot::default(),
        }
    }

    pub fn with_deployments(mut self, deployments: Arc<dyn DeploymentTracker>) -> Self {
        self.deployments = deployments;
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn with_stake_store(mut self, stakes: Arc<StakeChainStore>) -> Self {
        self.stakes = Some(stakes);
        self
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn chain(&self) -> &Arc<dyn HeaderChain> {
        &self.chain
    }

    pub fn coin_view(&self) -> &Arc<dyn CoinView> {
        &self.coin_view
    }

    /// The write-back cache layer, if the coin view stack has one.
    pub fn cache(&self) -> Option<&Arc<CachedCoinView>> {
        self.cache.as_ref()
    }

    pub fn counters(&self) -> &Arc<ConsensusPerformanceCounter> {
        &self.counters
    }

    pub fn tip(&self) -> Result<Arc<ChainedHeader>, ConsensusError> {
        self.tip_slot()?
            .clone()
            .ok_or(ConsensusError::MissingContext("consensus tip"))
    }

    fn tip_slot(&self) -> Result<MutexGuard<'_, Option<Arc<ChainedHeader>>>, ConsensusError> {
        self.tip
            .lock()
            .map_err(|_| ConsensusError::Poisoned("consensus tip"))
    }

    fn set_tip(&self, tip: Arc<ChainedHeader>) -> Result<(), ConsensusError> {
        *self.tip_slot()? = Some(tip);
        Ok(())
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>, ConsensusError> {
        self.write_lock
            .lock()
            .map_err(|_| ConsensusError::Poisoned("consensus writer"))
    }

    /// Aligns the loop with the coin view: rewinds the view until its tip is on the
    /// header chain, then points the block source there.
    pub fn initialize(&self) -> Result<(), ConsensusError> {
        let _writer = self.lock_writer()?;
        let mut hash = self.coin_view.tip_hash()?;
        let tip = loop {
            if let Some(header) = self.chain.get_by_hash(&hash) {
                break header;
            }
            log_info!(
                "coin view tip {} is not on the header chain, rewinding",
                hash256_to_hex(&hash)
            );
            hash = self.coin_view.rewind()?;
        };

        if self.cache.is_some() {
            self.source
                .request_options(BlockRequestOptions { lookahead: 1 });
        }
        self.source.set_location(&tip);
        if let Some(stakes) = &self.stakes {
            stakes.load(self.chain.as_ref(), &tip.hash)?;
        }
        log_info!(
            "consensus tip at height {} ({})",
            tip.height,
            hash256_to_hex(&tip.hash)
        );
        self.set_tip(tip)?;
        Ok(())
    }

    /// Results for each block pulled, in application order. Ends on shutdown, when the
    /// source is exhausted, or after yielding a fatal error.
    pub fn execute(&self, shutdown: ShutdownSignal) -> ConsensusIter<'_> {
        ConsensusIter {
            consensus: self,
            shutdown,
            finished: false,
        }
    }

    pub fn execute_next_block(&self, shutdown: &ShutdownSignal) -> Result<BlockResult, ConsensusError> {
        loop {
            let block = match self.source.next_block(shutdown) {
                Ok(Some(block)) => block,
                Ok(None) => {
                    self.rewind_to_known_header()?;
                    continue;
                }
                Err(_) => return Err(ConsensusError::Cancelled),
            };

            let started = Instant::now();
            let mut ctx = ValidationContext::new(block);
            let outcome = self.accept_block(&mut ctx);
            self.counters.record_total(started.elapsed());
            let error = match outcome {
                Ok(()) => None,
                Err(ConsensusError::Validation(err)) => {
                    self.counters.record_rejected();
                    log_debug!(
                        "block {} rejected: {}",
                        hash256_to_hex(&ctx.block.hash()),
                        err
                    );
                    Some(err)
                }
                Err(fatal) => return Err(fatal),
            };
            return Ok(BlockResult {
                block: ctx.block,
                chained_header: ctx.chained_header,
                error,
            });
        }
    }

    fn rewind_to_known_header(&self) -> Result<(), ConsensusError> {
        let _writer = self.lock_writer()?;
        loop {
            let hash = self.coin_view.rewind()?;
            if let Some(header) = self.chain.get_by_hash(&hash) {
                log_info!(
                    "rewound coin view to height {} ({})",
                    header.height,
                    hash256_to_hex(&hash)
                );
                self.source.set_location(&header);
                return self.set_tip(header);
            }
        }
    }

    /// Validates a block template without touching any state.
    pub fn check_block(&self, block: Arc<Block>) -> Result<ValidationContext, ConsensusError> {
        let mut ctx = ValidationContext::for_template(block);
        self.accept_block(&mut ctx)?;
        Ok(ctx)
    }

    pub fn accept_block(&self, ctx: &mut ValidationContext) -> Result<(), ConsensusError> {
        let tip = self.tip()?;
        if ctx.block.header.prev_block != tip.hash {
            return Err(RuleError::BadPrevBlock.into());
        }

        let hash = ctx.block.hash();
        let chained = match self.chain.get_by_hash(&hash) {
            Some(existing) => existing,
            None => ChainedHeader::connect(&tip, ctx.block.header.clone(), ctx.block.is_proof_of_stake()),
        };
        ctx.chained_header = Some(Arc::clone(&chained));

        let env = RuleEnv {
            params: &self.params,
            time: self.time.as_ref(),
        };
        let mut timings = BlockTimings::default();

        let started = Instant::now();
        self.rules.run(Stage::HeaderStructural, ctx, &env)?;
        self.rules.run(Stage::HeaderContextual, ctx, &env)?;
        timings.header_us = micros(started.elapsed());

        ctx.flags = self.deployments.flags_for(&chained);

        let started = Instant::now();
        self.rules.run(Stage::BodyContextual, ctx, &env)?;
        self.rules.run(Stage::BodyStructural, ctx, &env)?;
        timings.body_us = micros(started.elapsed());

        if ctx.check_only {
            return Ok(());
        }

        let _writer = self.lock_writer()?;

        let started = Instant::now();
        let txids = ctx.coin_txids(ctx.flags.enforce_bip30);
        let fetched = self.coin_view.fetch_coins(&txids)?;
        if fetched.tip != tip.hash {
            return Err(ConsensusError::TipDesync {
                loop_tip: tip.hash,
                view_tip: fetched.tip,
            });
        }
        ctx.set.set_coins(&txids, fetched.unspent);
        timings.fetch_us = micros(started.elapsed());

        self.read_ahead();

        let started = Instant::now();
        self.rules.run(Stage::Execution, ctx, &env)?;
        timings.execution_us = micros(started.elapsed());

        let started = Instant::now();
        if self.cache.is_none() {
            if let Some(stakes) = &self.stakes {
                stakes.flush_items()?;
            }
        }
        self.coin_view.save_changes(ctx.set.changes(), tip.hash, hash)?;
        if let Some(cache) = &self.cache {
            cache.flush(false)?;
        }
        timings.persist_us = micros(started.elapsed());

        let inputs = ctx
            .block
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.vin.len() as u64)
            .sum();
        self.counters
            .record_block(ctx.block.transactions.len() as u64, inputs, &timings);

        if chained.chainwork > self.chain.tip().chainwork {
            self.chain.set_tip(Arc::clone(&chained));
        }
        self.set_tip(chained)
    }

    /// Warms the cache with the inputs of the next buffered block on a helper thread.
    /// Skipped while the previous prefetch is still running.
    fn read_ahead(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let Some(next) = self.source.try_peek_lookahead(0) else {
            return;
        };
        let mut seen = HashSet::new();
        let ids: Vec<Hash256> = next
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| tx.vin.iter().map(|input| input.prevout.hash))
            .filter(|txid| seen.insert(*txid))
            .collect();
        if ids.is_empty() {
            return;
        }
        let Some(claim) = self.prefetch.try_claim() else {
            log_debug!("coin prefetch still running; skipping");
            return;
        };
        let cache = Arc::clone(cache);
        let spawned = thread::Builder::new()
            .name("coin-prefetch".to_string())
            .spawn(move || {
                let _claim = claim;
                if let Err(err) = cache.fetch_coins(&ids) {
                    log_debug!("coin prefetch failed: {err}");
                }
            });
        if let Err(err) = spawned {
            log_warn!("failed to start coin prefetch: {err}");
        }
    }

    /// Flushes the coin cache outside block application. Takes the writer lock, so it
    /// never interleaves with a block being applied.
    pub fn flush(&self, force: bool) -> Result<bool, ConsensusError> {
        let _writer = self.lock_writer()?;
        match &self.cache {
            Some(cache) => Ok(cache.flush(force)?),
            None => {
                if let Some(stakes) = &self.stakes {
                    stakes.flush_items()?;
                }
                Ok(false)
            }
        }
    }
}

pub struct ConsensusIter<'a> {
    consensus: &'a ConsensusLoop,
    shutdown: ShutdownSignal,
    finished: bool,
}

impl Iterator for ConsensusIter<'_> {
    type Item = Result<BlockResult, ConsensusError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || is_shutdown(&self.shutdown) {
            return None;
        }
        match self.consensus.execute_next_block(&self.shutdown) {
            Ok(result) => Some(Ok(result)),
            Err(ConsensusError::Cancelled) => {
                self.finished = true;
                None
            }
            Err(err) => {
                log_critical!("consensus loop stopped: {err}");
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefetch_slot_admits_one_claim_at_a_time() {
        let slot = PrefetchSlot::default();
        let claim = slot.try_claim().expect("free slot");
        assert!(slot.try_claim().is_none());
        assert!(slot.clone().try_claim().is_none());

        let worker = thread::spawn(move || drop(claim));
        worker.join().expect("join");
        assert!(slot.try_claim().is_some());
    }
}
