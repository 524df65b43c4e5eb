//! Timestamped transactions used by the proof-of-stake chain.

use stakd_consensus::money::{money_range, Amount};
use stakd_consensus::Hash256;

use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            prevout: OutPoint::consensus_decode(decoder)?,
            script_sig: decoder.read_var_bytes()?,
            sequence: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// The zero-value, script-less marker output.
    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            value: decoder.read_i64_le()?,
            script_pubkey: decoder.read_var_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    /// Creation time; consensus-relevant for coinstakes.
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&encode(self))
    }

    pub fn serialized_size(&self) -> usize {
        encode(self).len()
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// A coinstake spends real inputs and marks itself with an empty first output.
    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    /// Sum of output values, or `None` when any value or the running total leaves the
    /// money range.
    pub fn value_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            if !money_range(output.value) {
                return None;
            }
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }

    pub fn consensus_decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.time);
        encoder.write_list(&self.vin);
        encoder.write_list(&self.vout);
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            time: decoder.read_u32_le()?,
            vin: decoder.read_list()?,
            vout: decoder.read_list()?,
            lock_time: decoder.read_u32_le()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_consensus::money::{COIN, MAX_MONEY};

    fn spend(index: u32) -> TxIn {
        TxIn::new(OutPoint::new([7u8; 32], index), vec![0x51])
    }

    #[test]
    fn classifies_coinbase_and_coinstake() {
        let coinbase = Transaction {
            version: 1,
            time: 10,
            vin: vec![TxIn::new(OutPoint::null(), vec![1, 2])],
            vout: vec![TxOut::new(COIN, vec![0x51])],
            lock_time: 0,
        };
        assert!(coinbase.is_coinbase());
        assert!(!coinbase.is_coinstake());

        let coinstake = Transaction {
            version: 1,
            time: 10,
            vin: vec![spend(0)],
            vout: vec![TxOut::empty(), TxOut::new(2 * COIN, vec![0x51])],
            lock_time: 0,
        };
        assert!(coinstake.is_coinstake());
        assert!(!coinstake.is_coinbase());

        let mut plain = coinstake.clone();
        plain.vout[0] = TxOut::new(1, Vec::new());
        assert!(!plain.is_coinstake());
    }

    #[test]
    fn value_out_rejects_overflow() {
        let tx = Transaction {
            version: 1,
            time: 0,
            vin: vec![spend(0)],
            vout: vec![TxOut::new(MAX_MONEY, vec![]), TxOut::new(1, vec![])],
            lock_time: 0,
        };
        assert_eq!(tx.value_out(), None);
    }

    #[test]
    fn time_is_part_of_txid() {
        let mut tx = Transaction {
            version: 1,
            time: 100,
            vin: vec![spend(1)],
            vout: vec![TxOut::new(5, vec![0x51])],
            lock_time: 0,
        };
        let before = tx.txid();
        let decoded = Transaction::consensus_decode_bytes(&encode(&tx)).expect("decode");
        assert_eq!(decoded, tx);
        tx.time = 101;
        assert_ne!(tx.txid(), before);
    }
}
