//! Protocol eras and the timestamp rules that change between them.

use stakd_consensus::ConsensusParams;

/// Eras are ordered; later eras tighten the timestamp rules.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ProtocolEra {
    V1,
    /// Activated by height.
    V2,
    /// Activated by block time.
    V3,
}

impl ProtocolEra {
    pub fn at(height: i32, time: u32, params: &ConsensusParams) -> Self {
        if time >= params.protocol_v3_time && height >= params.protocol_v2_height {
            ProtocolEra::V3
        } else if height >= params.protocol_v2_height {
            ProtocolEra::V2
        } else {
            ProtocolEra::V1
        }
    }

    /// Seconds a block time may run ahead of adjusted network time.
    pub fn future_drift(self, params: &ConsensusParams) -> i64 {
        match self {
            ProtocolEra::V1 => params.future_drift_v1,
            ProtocolEra::V2 => params.future_drift_v2,
            ProtocolEra::V3 => params.future_drift_v3,
        }
    }

    /// Exclusive lower bound for a block's time given its parent's time and median time
    /// past.
    pub fn past_time_limit(self, prev_time: u32, median_time_past: i64) -> i64 {
        match self {
            ProtocolEra::V1 => median_time_past,
            ProtocolEra::V2 | ProtocolEra::V3 => i64::from(prev_time),
        }
    }

    /// The coinstake must carry the block's time, and from V2 that time must have the
    /// masked low bits clear.
    pub fn check_coinstake_timestamp(
        self,
        block_time: u32,
        tx_time: u32,
        params: &ConsensusParams,
    ) -> bool {
        if block_time != tx_time {
            return false;
        }
        match self {
            ProtocolEra::V1 => true,
            ProtocolEra::V2 | ProtocolEra::V3 => tx_time & params.stake_timestamp_mask == 0,
        }
    }
}
