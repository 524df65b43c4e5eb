//! Periodic status line and `status.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use stakd_chainstate::metrics::ConsensusPerformanceSnapshot;
use stakd_chainstate::ConsensusLoop;
use stakd_consensus::params::hash256_to_hex;
use stakd_consensus::Network;
use stakd_log::{log_info, log_warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Backend;

pub const STATUS_FILE_NAME: &str = "status.json";

#[derive(Clone, Debug, Serialize)]
pub struct CacheStatus {
    pub items: usize,
    pub dirty: usize,
    pub pending_rewinds: usize,
    pub hit_rate: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub network: &'static str,
    pub backend: &'static str,
    pub tip_height: i32,
    pub tip_hash: String,
    pub header_height: i32,
    pub header_gap: i32,
    pub cache: Option<CacheStatus>,
    pub processed_blocks: u64,
    pub rejected_blocks: u64,
    pub processed_transactions: u64,
    pub processed_inputs: u64,
    pub average_block_ms: f64,
    pub uptime_secs: u64,
    #[serde(skip)]
    pub counters: ConsensusPerformanceSnapshot,
}

pub fn snapshot_status(
    consensus: &ConsensusLoop,
    network: Network,
    backend: Backend,
    start_time: Instant,
) -> Result<StatusSnapshot, String> {
    let tip = consensus.tip().map_err(|err| err.to_string())?;
    let header_height = consensus.chain().tip().height;
    let counters = consensus.counters().snapshot();
    let cache = consensus.cache().map(|cache| {
        let stats = cache.stats();
        CacheStatus {
            items: stats.items,
            dirty: stats.dirty,
            pending_rewinds: stats.pending_rewinds,
            hit_rate: stats.hit_rate(),
        }
    });
    Ok(StatusSnapshot {
        network: network.as_str(),
        backend: backend.as_str(),
        tip_height: tip.height,
        tip_hash: hash256_to_hex(&tip.hash),
        header_height,
        header_gap: header_height.saturating_sub(tip.height).max(0),
        cache,
        processed_blocks: counters.processed_blocks,
        rejected_blocks: counters.rejected_blocks,
        processed_transactions: counters.processed_transactions,
        processed_inputs: counters.processed_inputs,
        average_block_ms: counters.average_block_ms(),
        uptime_secs: start_time.elapsed().as_secs(),
        counters,
    })
}

pub fn write_status_file(path: &Path, status: &StatusSnapshot) -> Result<(), String> {
    let bytes = serde_json::to_vec_pretty(status).map_err(|err| err.to_string())?;
    write_file_atomic(path, &bytes)
}

pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|err| err.to_string())?;
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&tmp, path).map_err(|err| err.to_string())?;
    }
    Ok(())
}

fn blocks_per_sec(delta: &ConsensusPerformanceSnapshot, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    delta.processed_blocks as f64 / secs
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn log_status(status: &StatusSnapshot, last: Option<&ConsensusPerformanceSnapshot>, elapsed: Duration) {
    let delta = match last {
        Some(last) => status.counters.since(last),
        None => status.counters.clone(),
    };
    let (cache_items, cache_dirty, hit_rate) = status
        .cache
        .as_ref()
        .map_or((0, 0, 0.0), |cache| (cache.items, cache.dirty, cache.hit_rate));
    log_info!(
        "Status: headers {} blocks {} gap {} b/s {:.1} rejected {} blk_ms {:.2} fetch_ms {} exec_ms {} persist_ms {} cache {} dirty {} hit {:.0}% block {} uptime {}s",
        status.header_height,
        status.tip_height,
        status.header_gap,
        blocks_per_sec(&delta, elapsed),
        delta.rejected_blocks,
        delta.average_block_ms(),
        delta.fetch_us / 1_000,
        delta.execution_us / 1_000,
        delta.persist_us / 1_000,
        cache_items,
        cache_dirty,
        hit_rate * 100.0,
        short_hash(&status.tip_hash),
        status.uptime_secs
    );
}

/// Logs a status line every `interval_secs` and refreshes `status_path`. Returns `None`
/// when the interval is zero.
pub fn spawn_status_reporter(
    consensus: Arc<ConsensusLoop>,
    network: Network,
    backend: Backend,
    start_time: Instant,
    interval_secs: u64,
    status_path: PathBuf,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    let interval = Duration::from_secs(interval_secs);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut last: Option<(ConsensusPerformanceSnapshot, Instant)> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }
            match snapshot_status(&consensus, network, backend, start_time) {
                Ok(status) => {
                    let elapsed = last.as_ref().map_or(interval, |(_, at)| at.elapsed());
                    log_status(&status, last.as_ref().map(|(counters, _)| counters), elapsed);
                    if let Err(err) = write_status_file(&status_path, &status) {
                        log_warn!("failed to write {}: {err}", status_path.display());
                    }
                    last = Some((status.counters, Instant::now()));
                }
                Err(err) => log_warn!("status snapshot failed: {err}"),
            }
        }
    }))
}
