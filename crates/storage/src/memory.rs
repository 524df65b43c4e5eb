use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-process store used by tests and the `memory` backend.
pub struct MemoryStore {
    columns: RwLock<[ColumnMap; Column::ALL.len()]>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            columns: RwLock::new(Default::default()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> usize {
        self.columns
            .read()
            .map(|columns| columns[column.index()].len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, column: Column) -> bool {
        self.len(column) == 0
    }
}

fn prefix_range<'m>(
    map: &'m ColumnMap,
    prefix: &[u8],
) -> impl Iterator<Item = (&'m Vec<u8>, &'m Vec<u8>)> + 'm {
    let owned = prefix.to_vec();
    map.range::<Vec<u8>, _>((Bound::Included(owned.clone()), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(&owned))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self
            .columns
            .read()
            .map_err(|_| StoreError::Poisoned("memory store"))?;
        Ok(columns[column.index()].get(key).cloned())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let columns = self
            .columns
            .read()
            .map_err(|_| StoreError::Poisoned("memory store"))?;
        for (key, value) in prefix_range(&columns[column.index()], prefix) {
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self
            .columns
            .write()
            .map_err(|_| StoreError::Poisoned("memory store"))?;
        for op in batch.iter() {
            let map = &mut columns[op.column().index()];
            match op {
                WriteOp::Put { key, value, .. } => {
                    map.insert(key.as_slice().to_vec(), value.clone());
                }
                WriteOp::Delete { key, .. } => {
                    map.remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Coins, [1u8; 4], vec![1]);
        batch.delete(Column::Coins, [1u8; 4]);
        batch.put(Column::Coins, [2u8; 4], vec![2]);
        store.write_batch(&batch).expect("write");
        assert_eq!(store.get(Column::Coins, &[1u8; 4]).expect("get"), None);
        assert_eq!(store.get(Column::Coins, &[2u8; 4]).expect("get"), Some(vec![2]));
        assert!(store.is_empty(Column::Meta));
    }

    #[test]
    fn prefix_scan_is_sorted_and_bounded() {
        let store = MemoryStore::new();
        store.put(Column::Rewind, &[0, 2], b"b").expect("put");
        store.put(Column::Rewind, &[0, 1], b"a").expect("put");
        store.put(Column::Rewind, &[1, 0], b"c").expect("put");
        store.put(Column::Meta, &[0, 3], b"other").expect("put");
        let mut keys = Vec::new();
        store
            .for_each_prefix(Column::Rewind, &[0], &mut |key: &[u8], _: &[u8]| {
                keys.push(key.to_vec());
                Ok(())
            })
            .expect("scan");
        assert_eq!(keys, vec![vec![0, 1], vec![0, 2]]);

        let mut count = 0;
        store
            .for_each_prefix(Column::Rewind, &[], &mut |_: &[u8], _: &[u8]| {
                count += 1;
                Ok(())
            })
            .expect("scan");
        assert_eq!(count, 3);
    }
}
