//! Difficulty and compact target utilities.

use stakd_consensus::{ConsensusParams, Hash256};
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    MissingHistory { height: i64 },
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::MissingHistory { height } => {
                write!(f, "retarget needs header at height {height}")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

/// Which limit and spacing a retarget works against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    Work,
    Stake,
}

impl TargetKind {
    pub fn limit(self, params: &ConsensusParams) -> U256 {
        match self {
            TargetKind::Work => U256::from_little_endian(&params.pow_limit),
            TargetKind::Stake => U256::from_little_endian(&params.pos_limit),
        }
    }
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 && mantissa != 0 {
        return Err(CompactError::Negative);
    }
    if size <= 3 {
        return Ok(U256::from(mantissa >> (8 * (3 - size))));
    }
    if mantissa != 0
        && (size > 34 || (mantissa > 0xff && size > 33) || (mantissa > 0xffff && size > 32))
    {
        return Err(CompactError::Overflow);
    }
    Ok(U256::from(mantissa) << (8 * (size - 3)))
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }
    let mut size = value.bits().div_ceil(8) as u32;
    let mut mantissa = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };
    // Keep the sign bit clear by moving one byte into the exponent.
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | (mantissa & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes to meet `bits`; the unit of accumulated chain work.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::one();
    Ok((!target / (target + one)) + one)
}

/// `value * mul / div`, saturating at `cap`.
fn scale(value: U256, mul: u64, div: u64, cap: U256) -> U256 {
    if div == 0 {
        return cap;
    }
    let product = value.full_mul(U256::from(mul)) / U512::from(div);
    U256::try_from(product).map_or(cap, |scaled| scaled.min(cap))
}

/// Interval-based proof-of-work retarget over contiguous headers ending at the
/// current tip.
pub fn next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let limit = TargetKind::Work.limit(params);
    let limit_bits = u256_to_compact(limit);
    let Some(last) = chain.last() else {
        return Ok(limit_bits);
    };
    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    let interval = params.difficulty_adjustment_interval();
    if (last.height + 1) % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            if let Some(next_time) = next_block_time {
                if next_time > last.time + params.pow_target_spacing * 2 {
                    return Ok(limit_bits);
                }
            }
            // Skip the minimum-difficulty blocks back to the last real target.
            let real = chain
                .iter()
                .rev()
                .find(|header| header.height % interval == 0 || header.bits != limit_bits);
            return Ok(real.map_or(limit_bits, |header| header.bits));
        }
        return Ok(last.bits);
    }

    let first_height = last.height - (interval - 1);
    let first = header_at(chain, first_height)?;
    let timespan = params.pow_target_timespan;
    let actual = (last.time - first.time).clamp(timespan / 4, timespan * 4);
    let next = scale(compact_to_u256(last.bits)?, actual as u64, timespan as u64, limit);
    Ok(u256_to_compact(next))
}

/// Per-block retarget toward the target spacing, from the two most recent blocks of the
/// same kind (newest first).
pub fn next_target_required(
    last: Option<HeaderInfo>,
    previous: Option<HeaderInfo>,
    kind: TargetKind,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let limit = kind.limit(params);
    let (Some(last), Some(previous)) = (last, previous) else {
        return Ok(u256_to_compact(limit));
    };
    if params.pos_no_retargeting {
        return Ok(last.bits);
    }

    let spacing = params.pos_target_spacing;
    let mut actual = last.time - previous.time;
    if actual < 0 {
        actual = spacing;
    }
    let interval = params.pos_target_timespan / spacing;
    let numerator = (interval - 1) * spacing + 2 * actual;
    let denominator = (interval + 1) * spacing;
    let next = scale(
        compact_to_u256(last.bits)?,
        numerator as u64,
        denominator as u64,
        limit,
    );
    if next.is_zero() {
        return Ok(u256_to_compact(limit));
    }
    Ok(u256_to_compact(next))
}

fn header_at(chain: &[HeaderInfo], height: i64) -> Result<&HeaderInfo, DifficultyError> {
    let base = chain.first().map_or(0, |header| header.height);
    usize::try_from(height - base)
        .ok()
        .and_then(|idx| chain.get(idx))
        .filter(|header| header.height == height)
        .ok_or(DifficultyError::MissingHistory { height })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_consensus::{consensus_params, Network};

    fn headers(count: i64, spacing: i64, bits: u32) -> Vec<HeaderInfo> {
        (0..count)
            .map(|height| HeaderInfo {
                height,
                time: 1_000_000 + height * spacing,
                bits,
            })
            .collect()
    }

    #[test]
    fn on_schedule_retarget_keeps_bits() {
        let params = consensus_params(Network::Mainnet);
        let interval = params.difficulty_adjustment_interval();
        let chain = headers(interval, params.pow_target_spacing, 0x1c0fffff);
        let bits = next_work_required(&chain, None, &params).expect("retarget");
        let before = compact_to_u256(0x1c0fffff).expect("target");
        let after = compact_to_u256(bits).expect("target");
        // One spacing short of a full timespan, so the target tightens slightly.
        assert!(after <= before);
        assert!(after > before - before / 100);
    }

    #[test]
    fn slow_blocks_are_clamped_to_four_times() {
        let params = consensus_params(Network::Mainnet);
        let interval = params.difficulty_adjustment_interval();
        let chain = headers(interval, params.pow_target_spacing * 100, 0x1b0fffff);
        let bits = next_work_required(&chain, None, &params).expect("retarget");
        let before = compact_to_u256(0x1b0fffff).expect("target");
        let after = compact_to_u256(bits).expect("target");
        assert!(after <= before * 4);
        assert!(after > before * 3);
    }

    #[test]
    fn mid_interval_keeps_last_bits() {
        let params = consensus_params(Network::Mainnet);
        let chain = headers(10, params.pow_target_spacing, 0x1c00ffff);
        assert_eq!(next_work_required(&chain, None, &params), Ok(0x1c00ffff));
    }

    #[test]
    fn retarget_without_window_start_fails() {
        let params = consensus_params(Network::Mainnet);
        let interval = params.difficulty_adjustment_interval();
        let chain: Vec<_> = headers(interval, 600, 0x1c00ffff)
            .into_iter()
            .skip(5)
            .collect();
        assert_eq!(
            next_work_required(&chain, None, &params),
            Err(DifficultyError::MissingHistory { height: 0 })
        );
    }

    #[test]
    fn stake_target_eases_when_blocks_are_slow() {
        let params = consensus_params(Network::Mainnet);
        let bits = 0x1a0fffff;
        let last = HeaderInfo {
            height: 10,
            time: 10_000,
            bits,
        };
        let fast = HeaderInfo {
            height: 9,
            time: 10_000 - params.pos_target_spacing / 2,
            bits,
        };
        let slow = HeaderInfo {
            height: 9,
            time: 10_000 - params.pos_target_spacing * 4,
            bits,
        };
        let base = compact_to_u256(bits).expect("target");
        let tighter = next_target_required(Some(last), Some(fast), TargetKind::Stake, &params)
            .expect("fast");
        let looser = next_target_required(Some(last), Some(slow), TargetKind::Stake, &params)
            .expect("slow");
        assert!(compact_to_u256(tighter).expect("tighter") < base);
        assert!(compact_to_u256(looser).expect("looser") > base);
        assert_eq!(
            next_target_required(None, None, TargetKind::Stake, &params),
            Ok(target_to_compact(&params.pos_limit))
        );
    }
}
