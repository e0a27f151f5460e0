//! Key-value storage contract and in-memory implementation.
//!
//! The index lives in a handful of named [`Table`]s. Writers build a
//! [`Batch`] of puts and deletes spanning any tables and hand it to
//! [`IndexStore::batch_write`], which applies it atomically: after a crash
//! either every op of the batch is visible or none is.
//!
//! [`MemoryStore`] keeps ordered maps behind a lock and is used by tests.
//! Its scans copy rows out in chunks rather than holding the lock.
//! The production backend is RocksDB (spindex-node).

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::IndexError;

/// Named key spaces of the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// height → raw 80-byte header.
    Headers,
    /// height → cumulative transaction count after the block.
    TxCounts,
    /// txnum → transaction hash.
    TxHashes,
    /// hashX ‖ txnum ‖ vout → value.
    Utxo,
    /// tx_hash prefix ‖ vout ‖ txnum → hashX.
    HashXLookup,
    /// hashX ‖ flush id → packed txnums.
    History,
    /// height → block undo record.
    Undo,
    /// Singleton records such as the flush state.
    Meta,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Headers,
        Table::TxCounts,
        Table::TxHashes,
        Table::Utxo,
        Table::HashXLookup,
        Table::History,
        Table::Undo,
        Table::Meta,
    ];

    /// Stable name, used as the RocksDB column family name.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Headers => "headers",
            Table::TxCounts => "tx_counts",
            Table::TxHashes => "tx_hashes",
            Table::Utxo => "utxo",
            Table::HashXLookup => "hashx_lookup",
            Table::History => "history",
            Table::Undo => "undo",
            Table::Meta => "meta",
        }
    }
}

/// A single write in a [`Batch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { table: Table, key: Vec<u8>, value: Vec<u8> },
    Delete { table: Table, key: Vec<u8> },
}

/// An ordered list of writes applied all-or-nothing.
///
/// Later ops on the same key win.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: Table, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put { table, key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, table: Table, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { table, key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key/value pairs produced by [`IndexStore::scan`].
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), IndexError>> + 'a>;

/// Durable, ordered, atomically-batched key-value store.
pub trait IndexStore: Send + Sync {
    /// Point lookup. `None` if the key is absent.
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError>;

    /// Apply every op in `batch` atomically and durably.
    fn batch_write(&self, batch: Batch) -> Result<(), IndexError>;

    /// Keys of `table` starting with `prefix`, in ascending byte order.
    ///
    /// When `start` is given iteration begins at the first key `>= start`,
    /// which lets a caller resume an interrupted scan from the key after the
    /// last one it processed.
    fn scan<'a>(&'a self, table: Table, prefix: &[u8], start: Option<&[u8]>) -> KvIter<'a>;

    fn contains(&self, table: Table, key: &[u8]) -> Result<bool, IndexError> {
        Ok(self.get(table, key)?.is_some())
    }
}

pub type TableMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory [`IndexStore`] for tests.
///
/// Ordered maps behind a single lock; a batch is applied under the write
/// lock so readers never see part of one.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<Table, TableMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in `table`.
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, BTreeMap::len)
    }

    /// A copy of one table's contents.
    pub fn dump(&self, table: Table) -> TableMap {
        self.tables.read().get(&table).cloned().unwrap_or_default()
    }
}

impl IndexStore for MemoryStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        Ok(self.tables.read().get(&table).and_then(|t| t.get(key).cloned()))
    }

    fn batch_write(&self, batch: Batch) -> Result<(), IndexError> {
        let mut tables = self.tables.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                BatchOp::Delete { table, key } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn scan<'a>(&'a self, table: Table, prefix: &[u8], start: Option<&[u8]>) -> KvIter<'a> {
        let from = match start {
            Some(start) if start > prefix => start.to_vec(),
            _ => prefix.to_vec(),
        };
        Box::new(ChunkedScan {
            store: self,
            table,
            prefix: prefix.to_vec(),
            next: Some(Bound::Included(from)),
            rows: VecDeque::new(),
        })
    }
}

/// Rows copied out per lock acquisition while scanning a [`MemoryStore`].
const SCAN_CHUNK: usize = 256;

/// Scan over a [`MemoryStore`] that copies [`SCAN_CHUNK`] rows at a time
/// and holds no lock in between, so the scanning thread may write to the
/// store before finishing.
struct ChunkedScan<'a> {
    store: &'a MemoryStore,
    table: Table,
    prefix: Vec<u8>,
    /// Lower bound of the next chunk; `None` once the range is exhausted.
    next: Option<Bound<Vec<u8>>>,
    rows: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl ChunkedScan<'_> {
    fn refill(&mut self) {
        let Some(lower) = self.next.take() else {
            return;
        };
        let store = self.store;
        let tables = store.tables.read();
        let Some(map) = tables.get(&self.table) else {
            return;
        };
        let prefix = &self.prefix;
        self.rows.extend(
            map.range((lower, Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .take(SCAN_CHUNK)
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if self.rows.len() == SCAN_CHUNK {
            self.next = self.rows.back().map(|(k, _)| Bound::Excluded(k.clone()));
        }
    }
}

impl Iterator for ChunkedScan<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rows.is_empty() {
            self.refill();
        }
        self.rows.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(iter: KvIter<'_>) -> Vec<Vec<u8>> {
        iter.map(|r| r.unwrap().0).collect()
    }

    // ------------------------------------------------------------------
    // Batch
    // ------------------------------------------------------------------

    #[test]
    fn batch_collects_ops_in_order() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());
        batch.put(Table::Meta, b"a".to_vec(), b"1".to_vec());
        batch.delete(Table::Meta, b"a".to_vec());
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[1], BatchOp::Delete { table: Table::Meta, .. }));
    }

    #[test]
    fn table_names_are_unique() {
        let mut names: Vec<_> = Table::ALL.iter().map(Table::name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Table::ALL.len());
    }

    // ------------------------------------------------------------------
    // MemoryStore
    // ------------------------------------------------------------------

    #[test]
    fn get_after_put_and_delete() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.put(Table::Headers, vec![0, 0, 0, 1], vec![9]);
        store.batch_write(batch).unwrap();
        assert_eq!(store.get(Table::Headers, &[0, 0, 0, 1]).unwrap(), Some(vec![9]));
        assert!(store.contains(Table::Headers, &[0, 0, 0, 1]).unwrap());
        // Same key in another table is independent.
        assert_eq!(store.get(Table::Undo, &[0, 0, 0, 1]).unwrap(), None);

        let mut batch = Batch::new();
        batch.delete(Table::Headers, vec![0, 0, 0, 1]);
        store.batch_write(batch).unwrap();
        assert_eq!(store.get(Table::Headers, &[0, 0, 0, 1]).unwrap(), None);
    }

    #[test]
    fn later_op_on_same_key_wins() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.put(Table::Meta, b"k".to_vec(), b"old".to_vec());
        batch.delete(Table::Meta, b"k".to_vec());
        batch.put(Table::Meta, b"k".to_vec(), b"new".to_vec());
        store.batch_write(batch).unwrap();
        assert_eq!(store.get(Table::Meta, b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn scan_is_ordered_and_prefix_bounded() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        for key in [vec![1, 3], vec![1, 1], vec![2, 0], vec![1, 2], vec![0, 9]] {
            batch.put(Table::Utxo, key, vec![]);
        }
        store.batch_write(batch).unwrap();

        assert_eq!(
            keys(store.scan(Table::Utxo, &[1], None)),
            vec![vec![1, 1], vec![1, 2], vec![1, 3]]
        );
        assert_eq!(keys(store.scan(Table::Utxo, &[], None)).len(), 5);
        assert!(keys(store.scan(Table::Utxo, &[7], None)).is_empty());
    }

    #[test]
    fn scan_resumes_from_continuation_key() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        for i in 0u8..5 {
            batch.put(Table::History, vec![4, i], vec![i]);
        }
        store.batch_write(batch).unwrap();

        assert_eq!(
            keys(store.scan(Table::History, &[4], Some(&[4, 3]))),
            vec![vec![4, 3], vec![4, 4]]
        );
        // A start key before the prefix is clamped to the prefix.
        assert_eq!(keys(store.scan(Table::History, &[4], Some(&[0]))).len(), 5);
    }

    #[test]
    fn scan_spans_chunks_and_tolerates_writes() {
        let store = MemoryStore::new();
        let total = SCAN_CHUNK * 2 + 7;
        let mut batch = Batch::new();
        for i in 0..total as u32 {
            batch.put(Table::TxHashes, i.to_be_bytes().to_vec(), vec![]);
        }
        batch.put(Table::TxHashes, vec![0xff], vec![]);
        store.batch_write(batch).unwrap();

        let mut scan = store.scan(Table::TxHashes, &[0, 0], None);
        let first = scan.next().unwrap().unwrap().0;
        assert_eq!(first, 0u32.to_be_bytes().to_vec());
        // Writing mid-scan must not block on the scan's lock.
        let mut batch = Batch::new();
        batch.delete(Table::TxHashes, (total as u32 - 1).to_be_bytes().to_vec());
        store.batch_write(batch).unwrap();

        let rest = keys(scan);
        assert_eq!(rest.len(), total - 2);
        assert!(rest.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(rest.last().unwrap(), &(total as u32 - 2).to_be_bytes().to_vec());
    }

    #[test]
    fn len_and_dump() {
        let store = MemoryStore::new();
        assert_eq!(store.len(Table::TxHashes), 0);
        let mut batch = Batch::new();
        batch.put(Table::TxHashes, vec![1], vec![2]);
        store.batch_write(batch).unwrap();
        assert_eq!(store.len(Table::TxHashes), 1);
        assert_eq!(store.dump(Table::TxHashes).get(&vec![1]), Some(&vec![2]));
    }
}
