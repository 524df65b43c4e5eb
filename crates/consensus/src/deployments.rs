//! Height/time activated consensus rules.

use crate::params::ConsensusParams;

pub const SCRIPT_VERIFY_NONE: u32 = 0;
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
pub const SCRIPT_VERIFY_DERSIG: u32 = 1 << 2;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;

/// Use the median time past instead of the block time for lock time checks.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConsensusFlags {
    pub script_flags: u32,
    pub lock_time_flags: u32,
    pub enforce_bip30: bool,
    pub enforce_bip34: bool,
    pub min_block_version: i32,
}

impl ConsensusFlags {
    pub fn uses_median_time_past(&self) -> bool {
        self.lock_time_flags & LOCKTIME_MEDIAN_TIME_PAST != 0
    }
}

pub fn flags_for_height(height: i32, time: u32, params: &ConsensusParams) -> ConsensusFlags {
    let mut flags = ConsensusFlags {
        enforce_bip30: true,
        min_block_version: 1,
        ..ConsensusFlags::default()
    };
    if time >= params.bip16_time {
        flags.script_flags |= SCRIPT_VERIFY_P2SH;
    }
    if height >= params.bip34_height {
        flags.enforce_bip34 = true;
        flags.min_block_version = 2;
    }
    if height >= params.bip66_height {
        flags.script_flags |= SCRIPT_VERIFY_DERSIG;
        flags.min_block_version = 3;
    }
    if height >= params.bip65_height {
        flags.script_flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        flags.min_block_version = 4;
    }
    if height >= params.csv_height {
        flags.script_flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
        flags.lock_time_flags |= LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;
    }
    flags
}
