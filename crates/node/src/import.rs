//! Block source fed from a block file by a reader thread.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use stakd_chainstate::chain::ChainedHeader;
use stakd_chainstate::source::is_shutdown;
use stakd_chainstate::{BlockRequestOptions, BlockSource, Cancelled, ShutdownSignal};
use stakd_consensus::params::hash256_to_hex;
use stakd_log::{log_debug, log_error, log_warn};
use stakd_primitives::block::Block;

use crate::blockfile::{BlockFileIndex, BlockFileReader};

const READ_AHEAD_BLOCKS: usize = 64;
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ImportState {
    receiver: Option<Receiver<Arc<Block>>>,
    buffered: VecDeque<Arc<Block>>,
    misaligned: bool,
    lookahead: usize,
    reader: Option<JoinHandle<()>>,
}

impl ImportState {
    fn stop_reader(&mut self) {
        self.receiver = None;
        self.buffered.clear();
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                log_warn!("block import reader panicked");
            }
        }
    }
}

/// Serves the blocks of an indexed block file in height order, starting after
/// whatever tip the consensus loop positions it at.
pub struct FileBlockSource {
    path: PathBuf,
    index: Arc<BlockFileIndex>,
    state: Mutex<ImportState>,
}

impl FileBlockSource {
    pub fn new(path: impl Into<PathBuf>, index: Arc<BlockFileIndex>) -> Self {
        Self {
            path: path.into(),
            index,
            state: Mutex::new(ImportState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ImportState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlockSource for FileBlockSource {
    fn next_block(&self, shutdown: &ShutdownSignal) -> Result<Option<Arc<Block>>, Cancelled> {
        let receiver = {
            let mut state = self.state();
            if state.misaligned {
                return Ok(None);
            }
            if let Some(block) = state.buffered.pop_front() {
                return Ok(Some(block));
            }
            state.receiver.clone().ok_or(Cancelled)?
        };
        loop {
            if is_shutdown(shutdown) {
                return Err(Cancelled);
            }
            match receiver.recv_timeout(SHUTDOWN_POLL) {
                Ok(block) => return Ok(Some(block)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Cancelled),
            }
        }
    }

    fn set_location(&self, tip: &ChainedHeader) {
        let mut state = self.state();
        state.stop_reader();

        let aligned = self
            .index
            .get(tip.height)
            .is_some_and(|entry| entry.hash == tip.hash);
        state.misaligned = !aligned;
        if !aligned {
            log_debug!(
                "tip {} at height {} is not in the block file",
                hash256_to_hex(&tip.hash),
                tip.height
            );
            return;
        }
        let Some(start) = self.index.get(tip.height + 1) else {
            return;
        };

        let remaining = (self.index.height() - tip.height) as usize;
        let (sender, receiver) = bounded(READ_AHEAD_BLOCKS + state.lookahead);
        let path = self.path.clone();
        let offset = start.offset;
        let spawned = thread::Builder::new()
            .name("block-import".to_string())
            .spawn(move || read_blocks(path, offset, remaining, sender));
        match spawned {
            Ok(handle) => {
                state.receiver = Some(receiver);
                state.reader = Some(handle);
            }
            Err(err) => log_error!("failed to spawn block import thread: {err}"),
        }
    }

    fn try_peek_lookahead(&self, n: usize) -> Option<Arc<Block>> {
        let mut state = self.state();
        if state.misaligned {
            return None;
        }
        while state.buffered.len() <= n {
            let block = state.receiver.as_ref()?.try_recv().ok()?;
            state.buffered.push_back(block);
        }
        state.buffered.get(n).cloned()
    }

    fn request_options(&self, options: BlockRequestOptions) {
        self.state().lookahead = options.lookahead;
    }
}

impl Drop for FileBlockSource {
    fn drop(&mut self) {
        self.state().stop_reader();
    }
}

fn read_blocks(path: PathBuf, offset: u64, count: usize, sender: Sender<Arc<Block>>) {
    let mut reader = match BlockFileReader::open_at(&path, offset) {
        Ok(reader) => reader,
        Err(err) => {
            log_error!("failed to open block file {}: {err}", path.display());
            return;
        }
    };
    for _ in 0..count {
        match reader.next_block() {
            Ok(Some((_, block))) => {
                if sender.send(Arc::new(block)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                log_error!("block file read failed: {err}");
                return;
            }
        }
    }
}
