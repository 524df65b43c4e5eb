use stakd_log as logging;
use stakd_log::{log_critical, log_debug, log_info, log_warn};

pub mod blockfile;
pub mod config;
pub mod import;
pub mod status;

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use fs2::FileExt;
use stakd_chainstate::chain::HeaderChain;
use stakd_chainstate::collaborators::KernelStakeValidator;
use stakd_chainstate::stake::StakeChainStore;
use stakd_chainstate::{BlockResult, BlockSource, ConsensusLoop, RuleError, RuleSet};
use stakd_coinview::{CacheConfig, CachedCoinView, CoinView, DurableCoinView, SideStore};
use stakd_consensus::params::hash256_to_hex;
use stakd_consensus::{consensus_params, Hash256};
use stakd_storage::fjall::{FjallOptions, FjallStore};
use stakd_storage::memory::MemoryStore;
use stakd_storage::KeyValueStore;
use tokio::sync::watch;

use crate::blockfile::BlockFileIndex;
use crate::config::{parse_args, usage, Backend, CliAction, Config};
use crate::import::FileBlockSource;
use crate::status::{
    snapshot_status, spawn_status_reporter, write_status_file, STATUS_FILE_NAME,
};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DB_DIR_NAME: &str = "db";

/// Holds the exclusive lock on the data directory until dropped.
pub struct DataDirLock {
    _file: File,
}

pub fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let holder = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another stakd instance may be running); lock file {}{holder}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn KeyValueStore>, String> {
    match config.backend {
        Backend::Memory => Ok(Arc::new(MemoryStore::new())),
        Backend::Fjall => {
            let db_path = config.data_dir.join(DB_DIR_NAME);
            let options = FjallOptions {
                cache_bytes: config.db_cache_bytes,
                ..FjallOptions::default()
            };
            let store = FjallStore::open_with_options(&db_path, options)
                .map_err(|err| format!("failed to open {}: {err}", db_path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("stakd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => {
            logging::init(config.log_config());
            for key in &config.unsupported_conf_keys {
                log_warn!("ignoring unsupported key '{key}' in {}", config.conf_path.display());
            }
            let (shutdown_tx, _) = watch::channel(false);
            spawn_signal_handler(shutdown_tx.clone());
            run_node(&config, shutdown_tx).await.map(|_| ())
        }
    }
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("Signal received; requesting shutdown.");
        let _ = shutdown_tx.send(true);
    });
}

/// What one run of the node did to the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub accepted: u64,
    pub rejected: u64,
    pub tip_height: i32,
    pub tip_hash: Hash256,
}

/// Imports the configured block file until it is exhausted or `shutdown_tx` fires, then
/// flushes every cached change to the store.
pub async fn run_node(
    config: &Config,
    shutdown_tx: watch::Sender<bool>,
) -> Result<RunSummary, String> {
    let start_time = Instant::now();
    let import_path = config
        .import
        .clone()
        .ok_or_else(|| "nothing to do: pass --import <file>".to_string())?;

    fs::create_dir_all(&config.data_dir)
        .map_err(|err| format!("failed to create {}: {err}", config.data_dir.display()))?;
    let _lock = lock_data_dir(&config.data_dir)?;
    log_info!(
        "Startup: backend={}, network={}, data_dir={}",
        config.backend.as_str(),
        config.network.as_str(),
        config.data_dir.display()
    );

    let params = Arc::new(consensus_params(config.network));
    let index = Arc::new(
        BlockFileIndex::scan(&import_path)
            .map_err(|err| format!("failed to index {}: {err}", import_path.display()))?,
    );
    let genesis_hash = index.genesis().hash;
    if params.hash_genesis_block != [0u8; 32] && params.hash_genesis_block != genesis_hash {
        return Err(format!(
            "{} starts at {}, not the {} genesis block",
            import_path.display(),
            hash256_to_hex(&genesis_hash),
            config.network.as_str()
        ));
    }
    log_info!(
        "Indexed {} blocks from {}",
        index.height() + 1,
        import_path.display()
    );

    let store = open_store(config)?;
    let chain = Arc::new(index.header_chain());
    let durable = DurableCoinView::open(Arc::clone(&store), genesis_hash)
        .map_err(|err| format!("failed to open coin view: {err}"))?;
    let cache_config = CacheConfig {
        max_items: config.coin_cache_items,
        flush_interval: config.flush_interval,
    };
    let mut cache = CachedCoinView::new(Arc::new(durable) as Arc<dyn CoinView>, cache_config);
    let stakes = if params.proof_of_stake {
        let stakes = Arc::new(StakeChainStore::new(
            Arc::clone(&store),
            genesis_hash,
            config.stake_cache_items,
        ));
        cache = cache.with_side_store(Arc::clone(&stakes) as Arc<dyn SideStore>);
        Some(stakes)
    } else {
        None
    };
    let rules = match &stakes {
        Some(stakes) => {
            RuleSet::proof_of_stake(None, Arc::new(KernelStakeValidator), Arc::clone(stakes))
        }
        None => RuleSet::proof_of_work(None),
    };

    let source = Arc::new(FileBlockSource::new(&import_path, Arc::clone(&index)));
    let mut consensus = ConsensusLoop::new(
        Arc::clone(&params),
        Arc::clone(&chain) as Arc<dyn HeaderChain>,
        Arc::new(cache) as Arc<dyn CoinView>,
        source as Arc<dyn BlockSource>,
        rules,
    );
    if let Some(stakes) = stakes {
        consensus = consensus.with_stake_store(stakes);
    }
    let consensus = Arc::new(consensus);
    consensus
        .initialize()
        .map_err(|err| format!("failed to initialize consensus: {err}"))?;

    let status_path = config.data_dir.join(STATUS_FILE_NAME);
    let reporter = spawn_status_reporter(
        Arc::clone(&consensus),
        config.network,
        config.backend,
        start_time,
        config.status_interval_secs,
        status_path.clone(),
        shutdown_tx.subscribe(),
    );

    let driver = {
        let consensus = Arc::clone(&consensus);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::task::spawn_blocking(move || drive(&consensus, shutdown_rx))
    };
    let outcome = driver
        .await
        .map_err(|err| format!("consensus task failed: {err}"));

    let _ = shutdown_tx.send(true);
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    let (accepted, rejected) = outcome??;

    log_info!("Shutdown: flushing coin cache");
    consensus
        .flush(true)
        .map_err(|err| format!("final flush failed: {err}"))?;
    store
        .sync()
        .map_err(|err| format!("failed to sync store: {err}"))?;
    match snapshot_status(&consensus, config.network, config.backend, start_time) {
        Ok(status) => {
            if let Err(err) = write_status_file(&status_path, &status) {
                log_warn!("failed to write {}: {err}", status_path.display());
            }
        }
        Err(err) => log_warn!("status snapshot failed: {err}"),
    }

    let tip = consensus.tip().map_err(|err| err.to_string())?;
    log_info!(
        "Shutdown: accepted {accepted} rejected {rejected}; tip {} ({})",
        tip.height,
        hash256_to_hex(&tip.hash)
    );
    Ok(RunSummary {
        accepted,
        rejected,
        tip_height: tip.height,
        tip_hash: tip.hash,
    })
}

fn drive(consensus: &ConsensusLoop, shutdown_rx: watch::Receiver<bool>) -> Result<(u64, u64), String> {
    let mut accepted = 0u64;
    let mut rejected = 0u64;
    for result in consensus.execute(shutdown_rx) {
        let result = result.map_err(|err| err.to_string())?;
        if result.is_accepted() {
            accepted += 1;
        } else {
            rejected += 1;
            handle_block_result(consensus, &result);
        }
    }
    Ok((accepted, rejected))
}

fn handle_block_result(consensus: &ConsensusLoop, result: &BlockResult) {
    let Some(error) = &result.error else {
        return;
    };
    let hash = result.block.hash();
    if *error == RuleError::BadPrevBlock {
        match consensus.tip() {
            Ok(tip) => {
                log_debug!(
                    "block {} does not build on tip {}; resetting header chain",
                    hash256_to_hex(&hash),
                    hash256_to_hex(&tip.hash)
                );
                consensus.chain().set_tip(tip);
            }
            Err(err) => log_critical!("consensus tip unavailable: {err}"),
        }
        return;
    }
    consensus.chain().mark_invalid(&hash);
    log_warn!(
        "rejected block {} [{}]: {error}",
        hash256_to_hex(&hash),
        error.code()
    );
}
