//! Framed block files. Each record is a little-endian `u32` length followed by one
//! consensus-encoded block; the first record is the genesis block.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use stakd_chainstate::chain::{ChainedHeader, HeaderChain, MemoryHeaderChain};
use stakd_consensus::params::hash256_to_hex;
use stakd_consensus::Hash256;
use stakd_log::log_warn;
use stakd_primitives::block::{Block, BlockHeader};
use stakd_primitives::encoding::{decode, encode, DecodeError};

pub const MAX_RECORD_LEN: u32 = 32 * 1024 * 1024;

#[derive(Debug)]
pub enum BlockFileError {
    Io(io::Error),
    Decode { offset: u64, source: DecodeError },
    RecordTooLarge { offset: u64, len: u32 },
    Empty,
}

impl std::fmt::Display for BlockFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockFileError::Io(err) => write!(f, "{err}"),
            BlockFileError::Decode { offset, source } => {
                write!(f, "invalid block at offset {offset}: {source}")
            }
            BlockFileError::RecordTooLarge { offset, len } => {
                write!(f, "record at offset {offset} claims {len} bytes")
            }
            BlockFileError::Empty => write!(f, "block file has no genesis block"),
        }
    }
}

impl std::error::Error for BlockFileError {}

impl From<io::Error> for BlockFileError {
    fn from(err: io::Error) -> Self {
        BlockFileError::Io(err)
    }
}

pub struct BlockFileWriter {
    file: BufWriter<File>,
    offset: u64,
}

impl BlockFileWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, BlockFileError> {
        Ok(Self {
            file: BufWriter::new(File::create(path)?),
            offset: 0,
        })
    }

    /// Appends one block and returns the offset of its record.
    pub fn append(&mut self, block: &Block) -> Result<u64, BlockFileError> {
        let bytes = encode(block);
        let len = u32::try_from(bytes.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or(BlockFileError::RecordTooLarge {
                offset: self.offset,
                len: u32::MAX,
            })?;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&bytes)?;
        let offset = self.offset;
        self.offset += 4 + u64::from(len);
        Ok(offset)
    }

    pub fn finish(mut self) -> Result<(), BlockFileError> {
        self.file.flush()?;
        Ok(())
    }
}

pub struct BlockFileReader {
    reader: BufReader<File>,
    offset: u64,
}

impl BlockFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BlockFileError> {
        Self::open_at(path, 0)
    }

    pub fn open_at(path: impl AsRef<Path>, offset: u64) -> Result<Self, BlockFileError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader: BufReader::new(file),
            offset,
        })
    }

    /// The next record and its offset. A record cut short at the end of the file counts
    /// as the end of the file.
    pub fn next_block(&mut self) -> Result<Option<(u64, Block)>, BlockFileError> {
        let offset = self.offset;
        let mut len_bytes = [0u8; 4];
        if !self.read_full(&mut len_bytes)? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_RECORD_LEN {
            return Err(BlockFileError::RecordTooLarge { offset, len });
        }
        let mut bytes = vec![0u8; len as usize];
        if !self.read_full(&mut bytes)? {
            log_warn!("block file ends inside the record at offset {offset}");
            return Ok(None);
        }
        self.offset += 4 + u64::from(len);
        let block = decode(&bytes).map_err(|source| BlockFileError::Decode { offset, source })?;
        Ok(Some((offset, block)))
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<bool, BlockFileError> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IndexedBlock {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub proof_of_stake: bool,
    pub offset: u64,
}

/// Headers and record offsets of the linear chain stored in a block file, indexed by
/// height.
#[derive(Debug)]
pub struct BlockFileIndex {
    entries: Vec<IndexedBlock>,
}

impl BlockFileIndex {
    /// Reads the whole file once. Records that do not extend the chain so far end the
    /// scan.
    pub fn scan(path: impl AsRef<Path>) -> Result<Self, BlockFileError> {
        let mut reader = BlockFileReader::open(path)?;
        let mut entries: Vec<IndexedBlock> = Vec::new();
        while let Some((offset, block)) = reader.next_block()? {
            let hash = block.hash();
            if let Some(last) = entries.last() {
                if block.header.prev_block != last.hash {
                    log_warn!(
                        "block {} at offset {offset} does not extend height {}; ignoring the rest of the file",
                        hash256_to_hex(&hash),
                        entries.len() - 1
                    );
                    break;
                }
            }
            entries.push(IndexedBlock {
                hash,
                proof_of_stake: block.is_proof_of_stake(),
                header: block.header,
                offset,
            });
        }
        if entries.is_empty() {
            return Err(BlockFileError::Empty);
        }
        Ok(Self { entries })
    }

    pub fn genesis(&self) -> &IndexedBlock {
        &self.entries[0]
    }

    /// Height of the last block in the file.
    pub fn height(&self) -> i32 {
        self.entries.len() as i32 - 1
    }

    pub fn get(&self, height: i32) -> Option<&IndexedBlock> {
        usize::try_from(height).ok().and_then(|idx| self.entries.get(idx))
    }

    /// Header chain over every block in the file, tip at the last one.
    pub fn header_chain(&self) -> MemoryHeaderChain {
        let chain = MemoryHeaderChain::new(ChainedHeader::genesis(self.genesis().header.clone()));
        let mut tip: Arc<ChainedHeader> = chain.genesis();
        for entry in &self.entries[1..] {
            tip = ChainedHeader::connect(&tip, entry.header.clone(), entry.proof_of_stake);
        }
        chain.set_tip(tip);
        chain
    }
}
