//! RocksDB-backed [`IndexStore`].
//!
//! Each [`Table`] is a column family named by [`Table::name`]. Batches are
//! applied with a single [`WriteBatch`] and a synced write, so a flush is
//! either fully on disk or absent after a crash.

use std::path::Path;

use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, ReadOptions,
    SliceTransform, WriteBatch, WriteOptions, DB,
};

use spindex_core::error::IndexError;
use spindex_core::store::{Batch, BatchOp, IndexStore, KvIter, Table};
use spindex_core::types::HASHX_LEN;

/// Persistent index storage.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a database at `path` with every table's column family.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Table::ALL
            .iter()
            .map(|table| {
                let mut opts = Options::default();
                // UTXO and history keys start with a hashX.
                if matches!(table, Table::Utxo | Table::History) {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(HASHX_LEN));
                }
                ColumnFamilyDescriptor::new(table.name(), opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    fn cf_handle(&self, table: Table) -> Result<&ColumnFamily, IndexError> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| IndexError::Storage(format!("missing column family {}", table.name())))
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), IndexError> {
        self.db.flush().map_err(|e| IndexError::Storage(e.to_string()))
    }

    /// Manual compaction of every column family, reclaiming space after a
    /// history compaction.
    pub fn compact(&self) -> Result<(), IndexError> {
        for table in Table::ALL {
            let cf = self.cf_handle(table)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }
}

impl IndexStore for RocksStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        let cf = self.cf_handle(table)?;
        self.db.get_cf(cf, key).map_err(|e| IndexError::Storage(e.to_string()))
    }

    fn batch_write(&self, batch: Batch) -> Result<(), IndexError> {
        let mut wb = WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { table, key, value } => wb.put_cf(self.cf_handle(table)?, key, value),
                BatchOp::Delete { table, key } => wb.delete_cf(self.cf_handle(table)?, key),
            }
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(wb, &opts).map_err(|e| IndexError::Storage(e.to_string()))
    }

    fn scan<'a>(&'a self, table: Table, prefix: &[u8], start: Option<&[u8]>) -> KvIter<'a> {
        let cf = match self.cf_handle(table) {
            Ok(cf) => cf,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let from = match start {
            Some(start) if start > prefix => start.to_vec(),
            _ => prefix.to_vec(),
        };
        // Scans may span prefixes (compaction walks a whole table).
        let mut read_opts = ReadOptions::default();
        read_opts.set_total_order_seek(true);
        let prefix = prefix.to_vec();
        let iter = self
            .db
            .iterator_cf_opt(cf, read_opts, IteratorMode::From(&from, Direction::Forward))
            .map(|item| {
                item.map(|(k, v)| (k.into_vec(), v.into_vec()))
                    .map_err(|e| IndexError::Storage(e.to_string()))
            })
            .take_while(move |item| match item {
                Ok((k, _)) => k.starts_with(&prefix),
                Err(_) => true,
            });
        Box::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn batch_put_get_delete() {
        let (_dir, store) = open_temp();
        let mut batch = Batch::new();
        batch.put(Table::Headers, vec![0, 0, 0, 1], vec![7u8; 80]);
        batch.put(Table::Meta, b"state".to_vec(), b"x".to_vec());
        store.batch_write(batch).unwrap();
        assert_eq!(store.get(Table::Headers, &[0, 0, 0, 1]).unwrap(), Some(vec![7u8; 80]));
        assert!(store.contains(Table::Meta, b"state").unwrap());
        assert_eq!(store.get(Table::Headers, &[0, 0, 0, 2]).unwrap(), None);

        let mut batch = Batch::new();
        batch.delete(Table::Headers, vec![0, 0, 0, 1]);
        store.batch_write(batch).unwrap();
        assert_eq!(store.get(Table::Headers, &[0, 0, 0, 1]).unwrap(), None);
    }

    #[test]
    fn later_ops_in_batch_win() {
        let (_dir, store) = open_temp();
        let mut batch = Batch::new();
        batch.put(Table::Utxo, vec![1u8; 20], vec![1]);
        batch.delete(Table::Utxo, vec![1u8; 20]);
        batch.put(Table::Utxo, vec![2u8; 20], vec![1]);
        batch.put(Table::Utxo, vec![2u8; 20], vec![2]);
        store.batch_write(batch).unwrap();
        assert_eq!(store.get(Table::Utxo, &[1u8; 20]).unwrap(), None);
        assert_eq!(store.get(Table::Utxo, &[2u8; 20]).unwrap(), Some(vec![2]));
    }

    #[test]
    fn scan_respects_prefix_and_start() {
        let (_dir, store) = open_temp();
        let mut batch = Batch::new();
        for (lead, tail) in [(1u8, 1u8), (1, 2), (1, 3), (2, 1)] {
            let mut key = vec![lead; HASHX_LEN];
            key.extend_from_slice(&[0, 0, tail]);
            batch.put(Table::History, key, vec![tail]);
        }
        store.batch_write(batch).unwrap();

        let prefix = vec![1u8; HASHX_LEN];
        let all: Vec<_> = store.scan(Table::History, &prefix, None).map(Result::unwrap).collect();
        assert_eq!(all.iter().map(|(_, v)| v[0]).collect::<Vec<_>>(), vec![1, 2, 3]);

        let mut start = prefix.clone();
        start.extend_from_slice(&[0, 0, 2]);
        let rest: Vec<_> = store.scan(Table::History, &prefix, Some(&start)).map(Result::unwrap).collect();
        assert_eq!(rest.len(), 2);

        let whole: Vec<_> = store.scan(Table::History, &[], None).map(Result::unwrap).collect();
        assert_eq!(whole.len(), 4);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            let mut batch = Batch::new();
            batch.put(Table::TxHashes, 5u64.to_be_bytes().to_vec(), vec![9u8; 32]);
            store.batch_write(batch).unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.get(Table::TxHashes, &5u64.to_be_bytes()).unwrap(), Some(vec![9u8; 32]));
    }
}
