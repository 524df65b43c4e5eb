//! Per-transaction unspent output records and their undo entries.

use stakd_consensus::Hash256;
use stakd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use stakd_primitives::transaction::{Transaction, TxOut};

const FLAG_COINBASE: u8 = 1 << 0;
const FLAG_COINSTAKE: u8 = 1 << 1;

/// Outputs of one transaction that are still spendable. Spent outputs are `None` so
/// indices keep matching the transaction's `vout`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnspentOutputs {
    pub txid: Hash256,
    pub version: i32,
    pub height: u32,
    pub time: u32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
    pub outputs: Vec<Option<TxOut>>,
}

impl UnspentOutputs {
    pub fn from_transaction(tx: &Transaction, height: u32) -> Self {
        Self::with_txid(tx.txid(), tx, height)
    }

    pub fn with_txid(txid: Hash256, tx: &Transaction, height: u32) -> Self {
        Self {
            txid,
            version: tx.version,
            height,
            time: tx.time,
            is_coinbase: tx.is_coinbase(),
            is_coinstake: tx.is_coinstake(),
            outputs: tx.vout.iter().cloned().map(Some).collect(),
        }
    }

    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(index as usize)?.as_ref()
    }

    /// Marks an output spent, returning it if it was unspent.
    pub fn spend(&mut self, index: u32) -> Option<TxOut> {
        self.outputs.get_mut(index as usize)?.take()
    }

    pub fn unspent_count(&self) -> usize {
        self.outputs.iter().filter(|output| output.is_some()).count()
    }

    pub fn is_fully_spent(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    /// Whether the outputs carry a maturity requirement.
    pub fn is_generated(&self) -> bool {
        self.is_coinbase || self.is_coinstake
    }
}

impl Encodable for UnspentOutputs {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.txid);
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.time);
        let mut flags = 0u8;
        if self.is_coinbase {
            flags |= FLAG_COINBASE;
        }
        if self.is_coinstake {
            flags |= FLAG_COINSTAKE;
        }
        encoder.write_u8(flags);
        encoder.write_compact_size(self.outputs.len() as u64);
        for output in &self.outputs {
            match output {
                Some(output) => {
                    encoder.write_bool(true);
                    output.consensus_encode(encoder);
                }
                None => encoder.write_bool(false),
            }
        }
    }
}

impl Decodable for UnspentOutputs {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let txid = decoder.read_hash()?;
        let version = decoder.read_i32_le()?;
        let height = decoder.read_u32_le()?;
        let time = decoder.read_u32_le()?;
        let flags = decoder.read_u8()?;
        if flags & !(FLAG_COINBASE | FLAG_COINSTAKE) != 0 {
            return Err(DecodeError::InvalidData("unknown unspent output flags"));
        }
        let count = decoder.read_compact_size()? as usize;
        if count > decoder.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let mut outputs = Vec::with_capacity(count);
        for _ in 0..count {
            let output = if decoder.read_bool()? {
                Some(TxOut::consensus_decode(decoder)?)
            } else {
                None
            };
            outputs.push(output);
        }
        Ok(Self {
            txid,
            version,
            height,
            time,
            is_coinbase: flags & FLAG_COINBASE != 0,
            is_coinstake: flags & FLAG_COINSTAKE != 0,
            outputs,
        })
    }
}

/// Undo entry for one applied block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RewindData {
    pub previous_tip: Hash256,
    /// Records created by the block; deleted on rewind.
    pub txids_to_remove: Vec<Hash256>,
    /// Records as they were before the block; written back on rewind.
    pub outputs_to_restore: Vec<UnspentOutputs>,
}

impl RewindData {
    pub fn new(previous_tip: Hash256) -> Self {
        Self {
            previous_tip,
            ..Self::default()
        }
    }
}

impl Encodable for RewindData {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.previous_tip);
        encoder.write_compact_size(self.txids_to_remove.len() as u64);
        for txid in &self.txids_to_remove {
            encoder.write_hash(txid);
        }
        encoder.write_list(&self.outputs_to_restore);
    }
}

impl Decodable for RewindData {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let previous_tip = decoder.read_hash()?;
        let count = decoder.read_compact_size()? as usize;
        if count.saturating_mul(32) > decoder.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let mut txids_to_remove = Vec::with_capacity(count);
        for _ in 0..count {
            txids_to_remove.push(decoder.read_hash()?);
        }
        Ok(Self {
            previous_tip,
            txids_to_remove,
            outputs_to_restore: decoder.read_list()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_primitives::encoding::{decode, encode};

    fn record() -> UnspentOutputs {
        UnspentOutputs {
            txid: [3u8; 32],
            version: 1,
            height: 12,
            time: 1_500_000_000,
            is_coinbase: false,
            is_coinstake: true,
            outputs: vec![None, Some(TxOut::new(500, vec![0x51])), None],
        }
    }

    #[test]
    fn spending_keeps_indices_stable() {
        let mut coins = record();
        assert_eq!(coins.unspent_count(), 1);
        assert!(coins.output(0).is_none());
        assert_eq!(coins.spend(1).map(|out| out.value), Some(500));
        assert!(coins.spend(1).is_none());
        assert!(coins.spend(9).is_none());
        assert!(coins.is_fully_spent());
        assert_eq!(coins.outputs.len(), 3);
    }

    #[test]
    fn persisted_form_keeps_spent_holes() {
        let coins = record();
        let decoded: UnspentOutputs = decode(&encode(&coins)).expect("decode");
        assert_eq!(decoded, coins);

        let rewind = RewindData {
            previous_tip: [8u8; 32],
            txids_to_remove: vec![[1u8; 32], [2u8; 32]],
            outputs_to_restore: vec![coins],
        };
        let decoded: RewindData = decode(&encode(&rewind)).expect("decode rewind");
        assert_eq!(decoded, rewind);
    }

    #[test]
    fn unknown_flags_rejected() {
        let mut bytes = encode(&record());
        bytes[32 + 12] = 0x80;
        assert!(decode::<UnspentOutputs>(&bytes).is_err());
    }
}
