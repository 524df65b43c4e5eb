//! The canonical, flushed coin set.

use std::any::Any;
use std::sync::{Arc, Mutex};

use stakd_consensus::Hash256;
use stakd_log::{log_debug, log_warn};
use stakd_primitives::encoding::{decode, encode};
use stakd_storage::{Column, KeyValueStore, WriteBatch};

use crate::unspent::{RewindData, UnspentOutputs};
use crate::{rewind_from_changes, CoinChange, CoinView, CoinViewError, FetchCoinsResult, FlushBatch};

const META_TIP: &[u8] = b"tip";
const META_REWIND_COUNTER: &[u8] = b"rewind_counter";

/// Coin view over a key-value store. Every operation runs as one transaction under the
/// view's lock, and every mutation commits as a single atomic batch.
pub struct DurableCoinView<S> {
    store: S,
    genesis: Hash256,
    txn: Mutex<()>,
}

impl<S: KeyValueStore> DurableCoinView<S> {
    /// Opens the view, recording `genesis` as the tip of an empty store.
    pub fn open(store: S, genesis: Hash256) -> Result<Self, CoinViewError> {
        if store.get(Column::Meta, META_TIP)?.is_none() {
            let mut batch = WriteBatch::new();
            batch.put(Column::Meta, META_TIP, genesis.to_vec());
            batch.put(Column::Meta, META_REWIND_COUNTER, 0u32.to_le_bytes().to_vec());
            store.write_batch(&batch)?;
        }
        Ok(Self {
            store,
            genesis,
            txn: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn genesis(&self) -> Hash256 {
        self.genesis
    }

    /// Number of undo entries currently held.
    pub fn rewind_depth(&self) -> Result<u32, CoinViewError> {
        let _txn = self.lock()?;
        self.read_counter()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, CoinViewError> {
        self.txn
            .lock()
            .map_err(|_| CoinViewError::Poisoned("durable coin view"))
    }

    fn read_tip(&self) -> Result<Hash256, CoinViewError> {
        match self.store.get(Column::Meta, META_TIP)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| CoinViewError::Decode(invalid("tip record length"))),
            None => Ok(self.genesis),
        }
    }

    fn read_counter(&self) -> Result<u32, CoinViewError> {
        match self.store.get(Column::Meta, META_REWIND_COUNTER)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CoinViewError::Decode(invalid("rewind counter length")))?;
                Ok(u32::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn read_coins(&self, txid: &Hash256) -> Result<Option<UnspentOutputs>, CoinViewError> {
        match self.store.get(Column::Coins, txid)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn clear_coins(&self, batch: &mut WriteBatch) -> Result<usize, CoinViewError> {
        let mut cleared = 0usize;
        self.store
            .for_each_prefix(Column::Coins, &[], &mut |key: &[u8], _value: &[u8]| {
                batch.delete(Column::Coins, key);
                cleared += 1;
                Ok(())
            })?;
        Ok(cleared)
    }
}

fn invalid(message: &'static str) -> stakd_primitives::encoding::DecodeError {
    stakd_primitives::encoding::DecodeError::InvalidData(message)
}

impl<S: KeyValueStore + 'static> CoinView for DurableCoinView<S> {
    fn tip_hash(&self) -> Result<Hash256, CoinViewError> {
        let _txn = self.lock()?;
        self.read_tip()
    }

    fn fetch_coins(&self, txids: &[Hash256]) -> Result<FetchCoinsResult, CoinViewError> {
        let _txn = self.lock()?;
        let tip = self.read_tip()?;
        let unspent = txids
            .iter()
            .map(|txid| self.read_coins(txid))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FetchCoinsResult { tip, unspent })
    }

    fn save_changes(
        &self,
        changes: Vec<CoinChange>,
        old_tip: Hash256,
        new_tip: Hash256,
    ) -> Result<(), CoinViewError> {
        let rewind = rewind_from_changes(&changes, old_tip);
        self.apply_flush(FlushBatch {
            old_tip,
            new_tip,
            upserts: changes.into_iter().map(|change| change.unspent).collect(),
            removals: Vec::new(),
            rewinds: vec![rewind],
        })
    }

    fn apply_flush(&self, mut flush: FlushBatch) -> Result<(), CoinViewError> {
        let _txn = self.lock()?;
        let current = self.read_tip()?;
        if current != flush.old_tip {
            return Err(CoinViewError::TipMismatch {
                expected: flush.old_tip,
                found: current,
            });
        }

        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, META_TIP, flush.new_tip.to_vec());

        flush.upserts.sort_by(|a, b| a.txid.cmp(&b.txid));
        for coins in &flush.upserts {
            if coins.is_fully_spent() {
                batch.delete(Column::Coins, coins.txid);
            } else {
                batch.put(Column::Coins, coins.txid, encode(coins));
            }
        }
        flush.removals.sort();
        for txid in &flush.removals {
            batch.delete(Column::Coins, *txid);
        }

        let mut counter = self.read_counter()?;
        for rewind in &flush.rewinds {
            counter = counter.checked_add(1).ok_or(CoinViewError::Decode(invalid(
                "rewind counter overflow",
            )))?;
            batch.put(Column::Rewind, counter.to_be_bytes(), encode(rewind));
        }
        batch.put(Column::Meta, META_REWIND_COUNTER, counter.to_le_bytes().to_vec());

        self.store.write_batch(&batch)?;
        log_debug!(
            "coin store committed {} records, {} removals, {} rewind entries (depth {counter})",
            flush.upserts.len(),
            flush.removals.len(),
            flush.rewinds.len(),
        );
        Ok(())
    }

    fn rewind(&self) -> Result<Hash256, CoinViewError> {
        let _txn = self.lock()?;
        let counter = self.read_counter()?;
        let mut batch = WriteBatch::new();

        if counter == 0 {
            let cleared = self.clear_coins(&mut batch)?;
            batch.put(Column::Meta, META_TIP, self.genesis.to_vec());
            self.store.write_batch(&batch)?;
            log_warn!("coin store undo log empty; reset {cleared} records to genesis");
            return Ok(self.genesis);
        }

        let key = counter.to_be_bytes();
        let bytes = self.store.get(Column::Rewind, &key)?.ok_or(CoinViewError::Decode(
            invalid("missing rewind entry"),
        ))?;
        let rewind: RewindData = decode(&bytes)?;

        for txid in &rewind.txids_to_remove {
            batch.delete(Column::Coins, *txid);
        }
        for coins in &rewind.outputs_to_restore {
            batch.put(Column::Coins, coins.txid, encode(coins));
        }
        batch.delete(Column::Rewind, key);
        batch.put(
            Column::Meta,
            META_REWIND_COUNTER,
            (counter - 1).to_le_bytes().to_vec(),
        );
        batch.put(Column::Meta, META_TIP, rewind.previous_tip.to_vec());
        self.store.write_batch(&batch)?;
        Ok(rewind.previous_tip)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_primitives::transaction::TxOut;
    use stakd_storage::memory::MemoryStore;

    fn coins(id: u8, outputs: usize) -> UnspentOutputs {
        UnspentOutputs {
            txid: [id; 32],
            version: 1,
            height: 1,
            time: 0,
            is_coinbase: false,
            is_coinstake: false,
            outputs: (0..outputs)
                .map(|i| Some(TxOut::new(i as i64 + 1, vec![0x51])))
                .collect(),
        }
    }

    #[test]
    fn empty_store_starts_at_genesis() {
        let view = DurableCoinView::open(MemoryStore::new(), [9u8; 32]).expect("open");
        let result = view.fetch_coins(&[[1u8; 32]]).expect("fetch");
        assert_eq!(result.tip, [9u8; 32]);
        assert_eq!(result.unspent, vec![None]);
    }

    #[test]
    fn save_then_rewind_restores_previous_records() {
        let genesis = [0u8; 32];
        let view = DurableCoinView::open(MemoryStore::new(), genesis).expect("open");
        view.save_changes(
            vec![CoinChange {
                unspent: coins(1, 2),
                original: None,
            }],
            genesis,
            [1u8; 32],
        )
        .expect("save block 1");

        let mut spent = coins(1, 2);
        spent.spend(0);
        view.save_changes(
            vec![CoinChange {
                unspent: spent.clone(),
                original: Some(coins(1, 2)),
            }],
            [1u8; 32],
            [2u8; 32],
        )
        .expect("save block 2");
        assert_eq!(view.rewind_depth().expect("depth"), 2);
        assert_eq!(
            view.fetch_coins(&[[1u8; 32]]).expect("fetch").unspent,
            vec![Some(spent)]
        );

        assert_eq!(view.rewind().expect("rewind"), [1u8; 32]);
        assert_eq!(
            view.fetch_coins(&[[1u8; 32]]).expect("fetch").unspent,
            vec![Some(coins(1, 2))]
        );
        assert_eq!(view.rewind().expect("rewind"), genesis);
        let result = view.fetch_coins(&[[1u8; 32]]).expect("fetch");
        assert_eq!(result.unspent, vec![None]);
        assert_eq!(result.tip, genesis);
        assert_eq!(view.rewind_depth().expect("depth"), 0);
    }

    #[test]
    fn fully_spent_records_are_deleted() {
        let genesis = [0u8; 32];
        let view = DurableCoinView::open(MemoryStore::new(), genesis).expect("open");
        let mut record = coins(4, 1);
        record.spend(0);
        view.save_changes(
            vec![CoinChange {
                unspent: record,
                original: Some(coins(4, 1)),
            }],
            genesis,
            [1u8; 32],
        )
        .expect("save");
        assert!(view.store().is_empty(Column::Coins));
    }

    #[test]
    fn rewind_of_empty_log_clears_to_genesis() {
        let store = MemoryStore::new();
        store
            .put(Column::Coins, &[5u8; 32], &encode(&coins(5, 1)))
            .expect("seed");
        let view = DurableCoinView::open(store, [7u8; 32]).expect("open");
        assert_eq!(view.rewind().expect("rewind"), [7u8; 32]);
        assert!(view.store().is_empty(Column::Coins));
    }

    #[test]
    fn tip_mismatch_writes_nothing() {
        let genesis = [0u8; 32];
        let view = DurableCoinView::open(MemoryStore::new(), genesis).expect("open");
        let err = view
            .save_changes(
                vec![CoinChange {
                    unspent: coins(1, 1),
                    original: None,
                }],
                [3u8; 32],
                [4u8; 32],
            )
            .expect_err("mismatch");
        assert!(matches!(err, CoinViewError::TipMismatch { .. }));
        assert!(view.store().is_empty(Column::Coins));
        assert_eq!(view.tip_hash().expect("tip"), genesis);
    }
}
