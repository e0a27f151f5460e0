//! Per-script history rows.
//!
//! A hashX's history is the ordered list of txnums that touched it. It is
//! stored as rows keyed `hashX ‖ flush_id` whose values are txnums packed as
//! 5-byte little-endian integers. Each flush appends one row per touched
//! hashX under a fresh, larger flush id, so concatenating a hashX's rows in
//! key order yields its history in chain order.
//!
//! Flush ids are 16 bits. Once they run out the index must be compacted:
//! [`compact_rows`] rewrites a hashX's rows into dense rows numbered from 0.

use std::collections::{HashMap, HashSet};

use spindex_core::error::{ChainStateError, IndexError};
use spindex_core::store::{Batch, Table};
use spindex_core::types::{HashX, HASHX_LEN};

/// Bytes per packed txnum.
pub const TXNUM_LEN: usize = 5;

/// Largest flush id representable in a history key.
pub const MAX_FLUSH_ID: u32 = u16::MAX as u32;

/// Default number of txnums per row written by compaction.
pub const DEFAULT_ROW_ENTRIES: usize = 12_500;

/// Largest txnum that fits in [`TXNUM_LEN`] bytes.
pub const MAX_TXNUM: u64 = (1 << (8 * TXNUM_LEN)) - 1;

pub fn history_key(hashx: &HashX, flush_id: u16) -> Vec<u8> {
    let mut key = Vec::with_capacity(HASHX_LEN + 2);
    key.extend_from_slice(hashx.as_bytes());
    key.extend_from_slice(&flush_id.to_be_bytes());
    key
}

pub fn pack_txnums(txnums: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(txnums.len() * TXNUM_LEN);
    for txnum in txnums {
        out.extend_from_slice(&txnum.to_le_bytes()[..TXNUM_LEN]);
    }
    out
}

pub fn unpack_txnums(packed: &[u8]) -> Result<Vec<u64>, IndexError> {
    if packed.len() % TXNUM_LEN != 0 {
        return Err(ChainStateError::Corrupt(format!("history row of {} bytes", packed.len())).into());
    }
    Ok(packed
        .chunks_exact(TXNUM_LEN)
        .map(|c| {
            let mut buf = [0u8; 8];
            buf[..TXNUM_LEN].copy_from_slice(c);
            u64::from_le_bytes(buf)
        })
        .collect())
}

/// History appended since the last flush.
#[derive(Debug, Default)]
pub struct UnflushedHistory {
    entries: HashMap<HashX, Vec<u64>>,
    count: usize,
}

impl UnflushedHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `txnum` touched every hashX in `touched`.
    pub fn add_tx(&mut self, txnum: u64, touched: &HashSet<HashX>) {
        for hashx in touched {
            self.entries.entry(*hashx).or_default().push(txnum);
        }
        self.count += touched.len();
    }

    /// Number of unflushed entries across all hashXs.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn hashx_count(&self) -> usize {
        self.entries.len()
    }

    /// Rough heap footprint, used for the memory flush trigger.
    pub fn memory_estimate(&self) -> usize {
        self.entries.len() * (HASHX_LEN + 64) + self.count * 8
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HashX, &Vec<u64>)> {
        self.entries.iter()
    }

    /// Append one row per hashX under `flush_id`.
    pub fn write_rows(&self, flush_id: u16, batch: &mut Batch) {
        for (hashx, txnums) in &self.entries {
            batch.put(Table::History, history_key(hashx, flush_id), pack_txnums(txnums));
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
    }
}

/// Drop every txnum `>= tx_count` from one hashX's rows.
///
/// Rows left empty are deleted; partly affected rows are rewritten in place.
/// Returns the number of entries removed.
pub fn truncate_rows(rows: &[(Vec<u8>, Vec<u8>)], tx_count: u64, batch: &mut Batch) -> Result<usize, IndexError> {
    let mut removed = 0;
    for (key, value) in rows.iter().rev() {
        let txnums = unpack_txnums(value)?;
        let keep = txnums.partition_point(|&n| n < tx_count);
        if keep == txnums.len() {
            // Rows are in chain order; earlier rows are untouched.
            break;
        }
        removed += txnums.len() - keep;
        if keep == 0 {
            batch.delete(Table::History, key.clone());
        } else {
            batch.put(Table::History, key.clone(), pack_txnums(&txnums[..keep]));
        }
    }
    Ok(removed)
}

/// Rewrite one hashX's rows into rows of at most `row_entries` txnums keyed
/// `0, 1, 2...`. Rows that already hold the right content are left alone.
///
/// Returns the largest row index used.
pub fn compact_rows(
    hashx: &HashX,
    rows: &[(Vec<u8>, Vec<u8>)],
    row_entries: usize,
    batch: &mut Batch,
) -> Result<u16, IndexError> {
    let existing: HashMap<&[u8], &[u8]> = rows.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
    let full: Vec<u8> = rows.iter().flat_map(|(_, v)| v.iter().copied()).collect();
    let row_size = row_entries.max(1) * TXNUM_LEN;
    let nrows = full.len().div_ceil(row_size);
    if nrows > MAX_FLUSH_ID as usize + 1 {
        return Err(ChainStateError::Corrupt(format!("history of {hashx} needs {nrows} rows")).into());
    }

    let mut keep: HashSet<Vec<u8>> = HashSet::new();
    let mut writes = Vec::new();
    let mut last = 0u16;
    for (n, chunk) in full.chunks(row_size).enumerate() {
        last = n as u16;
        let key = history_key(hashx, last);
        if existing.get(key.as_slice()) == Some(&chunk) {
            keep.insert(key);
        } else {
            keep.insert(key.clone());
            writes.push((key, chunk.to_vec()));
        }
    }
    for (key, _) in rows {
        if !keep.contains(key) {
            batch.delete(Table::History, key.clone());
        }
    }
    for (key, value) in writes {
        batch.put(Table::History, key, value);
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindex_core::store::BatchOp;

    fn hx(b: u8) -> HashX {
        HashX([b; HASHX_LEN])
    }

    fn row(hashx: &HashX, id: u16, txnums: &[u64]) -> (Vec<u8>, Vec<u8>) {
        (history_key(hashx, id), pack_txnums(txnums))
    }

    // ------------------------------------------------------------------
    // Packing
    // ------------------------------------------------------------------

    #[test]
    fn packing_is_five_byte_le() {
        let packed = pack_txnums(&[1, 0x01_0203_0405]);
        assert_eq!(packed, vec![1, 0, 0, 0, 0, 5, 4, 3, 2, 1]);
        assert_eq!(unpack_txnums(&packed).unwrap(), vec![1, 0x01_0203_0405]);
        assert_eq!(unpack_txnums(&pack_txnums(&[MAX_TXNUM])).unwrap(), vec![MAX_TXNUM]);
    }

    #[test]
    fn ragged_row_is_corrupt() {
        assert!(unpack_txnums(&[1, 2, 3]).is_err());
    }

    #[test]
    fn keys_sort_by_flush_id() {
        let h = hx(3);
        assert!(history_key(&h, 1) < history_key(&h, 2));
        assert!(history_key(&h, 255) < history_key(&h, 256));
    }

    // ------------------------------------------------------------------
    // Unflushed accumulation
    // ------------------------------------------------------------------

    #[test]
    fn unflushed_rows_per_hashx() {
        let mut hist = UnflushedHistory::new();
        hist.add_tx(10, &[hx(1), hx(2)].into_iter().collect());
        hist.add_tx(11, &[hx(1)].into_iter().collect());
        assert_eq!(hist.len(), 3);
        assert_eq!(hist.hashx_count(), 2);

        let mut batch = Batch::new();
        hist.write_rows(7, &mut batch);
        assert_eq!(batch.len(), 2);
        let row1 = batch.ops().iter().find_map(|op| match op {
            BatchOp::Put { key, value, .. } if *key == history_key(&hx(1), 7) => Some(value.clone()),
            _ => None,
        });
        assert_eq!(row1, Some(pack_txnums(&[10, 11])));

        hist.clear();
        assert!(hist.is_empty());
    }

    // ------------------------------------------------------------------
    // Truncation
    // ------------------------------------------------------------------

    #[test]
    fn truncate_drops_tail_entries() {
        let h = hx(1);
        let rows = vec![row(&h, 1, &[1, 2]), row(&h, 2, &[5, 6]), row(&h, 3, &[8])];
        let mut batch = Batch::new();
        let removed = truncate_rows(&rows, 6, &mut batch).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            batch.into_ops(),
            vec![
                BatchOp::Delete { table: Table::History, key: history_key(&h, 3) },
                BatchOp::Put { table: Table::History, key: history_key(&h, 2), value: pack_txnums(&[5]) },
            ]
        );
    }

    #[test]
    fn truncate_below_all_rows_is_noop() {
        let h = hx(1);
        let rows = vec![row(&h, 1, &[1, 2])];
        let mut batch = Batch::new();
        assert_eq!(truncate_rows(&rows, 3, &mut batch).unwrap(), 0);
        assert!(batch.is_empty());
    }

    // ------------------------------------------------------------------
    // Compaction
    // ------------------------------------------------------------------

    #[test]
    fn compaction_merges_into_dense_rows() {
        let h = hx(9);
        let rows = vec![row(&h, 4, &[1, 2]), row(&h, 9, &[3]), row(&h, 12, &[4, 5])];
        let mut batch = Batch::new();
        let last = compact_rows(&h, &rows, 2, &mut batch).unwrap();
        assert_eq!(last, 2);

        let ops = batch.into_ops();
        let deletes: Vec<_> = ops.iter().filter(|op| matches!(op, BatchOp::Delete { .. })).collect();
        assert_eq!(deletes.len(), 3);
        let puts: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                BatchOp::Put { key, value, .. } => Some((key.clone(), unpack_txnums(value).unwrap())),
                _ => None,
            })
            .collect();
        assert_eq!(
            puts,
            vec![
                (history_key(&h, 0), vec![1, 2]),
                (history_key(&h, 1), vec![3, 4]),
                (history_key(&h, 2), vec![5]),
            ]
        );
    }

    #[test]
    fn compacted_rows_are_left_alone() {
        let h = hx(9);
        let rows = vec![row(&h, 0, &[1, 2]), row(&h, 1, &[3])];
        let mut batch = Batch::new();
        assert_eq!(compact_rows(&h, &rows, 2, &mut batch).unwrap(), 1);
        assert!(batch.is_empty());
    }

    #[test]
    fn rewritten_key_is_not_deleted() {
        let h = hx(2);
        let rows = vec![row(&h, 0, &[1]), row(&h, 5, &[2])];
        let mut batch = Batch::new();
        compact_rows(&h, &rows, 10, &mut batch).unwrap();
        assert_eq!(
            batch.into_ops(),
            vec![
                BatchOp::Delete { table: Table::History, key: history_key(&h, 5) },
                BatchOp::Put { table: Table::History, key: history_key(&h, 0), value: pack_txnums(&[1, 2]) },
            ]
        );
    }
}
