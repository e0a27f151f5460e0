//! Typed index database over an [`IndexStore`].
//!
//! [`IndexDb`] owns the flushed view of the chain: headers, tx hashes, the
//! UTXO table, history rows and undo records. The block processor is its
//! only writer and hands it whole flushes ([`FlushData`]) or reorg backups;
//! sessions and the mempool read through it concurrently.
//!
//! Every write holds the state lock exclusively from the start of the batch
//! until the in-memory state matches it. Readers take the lock shared, so
//! they see either the state before a flush or the state after it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use spindex_core::coin::Coin;
use spindex_core::error::{ChainStateError, IndexError};
use spindex_core::merkle::MerkleCache;
use spindex_core::store::{Batch, IndexStore, Table};
use spindex_core::types::{Hash256, HashX, OutPoint, HASHX_LEN, HEADER_LEN};

use crate::history::{self, UnflushedHistory, MAX_FLUSH_ID};

/// Layout version of the stored index.
pub const DB_VERSION: u32 = 1;

const STATE_KEY: &[u8] = b"state";

// --- Key encodings ---

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

pub fn txnum_key(txnum: u64) -> [u8; 8] {
    txnum.to_be_bytes()
}

fn txnum_be5(txnum: u64) -> [u8; 5] {
    let b = txnum.to_be_bytes();
    [b[3], b[4], b[5], b[6], b[7]]
}

fn txnum_from_be5(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[3..].copy_from_slice(&bytes[..5]);
    u64::from_be_bytes(buf)
}

/// `hashX ‖ txnum(5, BE) ‖ vout(BE)`.
pub fn utxo_key(hashx: &HashX, txnum: u64, vout: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(HASHX_LEN + 9);
    key.extend_from_slice(hashx.as_bytes());
    key.extend_from_slice(&txnum_be5(txnum));
    key.extend_from_slice(&vout.to_be_bytes());
    key
}

fn lookup_prefix(tx_hash: &Hash256, vout: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(13);
    key.extend_from_slice(&tx_hash.as_bytes()[..4]);
    key.extend_from_slice(&vout.to_be_bytes());
    key
}

/// `tx_hash[..4] ‖ vout(BE) ‖ txnum(5, BE)`.
pub fn lookup_key(tx_hash: &Hash256, vout: u32, txnum: u64) -> Vec<u8> {
    let mut key = lookup_prefix(tx_hash, vout);
    key.extend_from_slice(&txnum_be5(txnum));
    key
}

fn bincode_encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, IndexError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(|e| IndexError::Storage(e.to_string()))
}

fn bincode_decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, IndexError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| ChainStateError::Corrupt(e.to_string()).into())
}

fn u64_le(bytes: &[u8]) -> Result<u64, IndexError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChainStateError::Corrupt(format!("expected 8-byte integer, got {} bytes", bytes.len())))?;
    Ok(u64::from_le_bytes(arr))
}

// --- Records ---

/// An output in the UTXO table, with everything needed to delete or
/// restore both of its keys.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct UtxoRecord {
    pub tx_hash: Hash256,
    pub vout: u32,
    pub hashx: HashX,
    pub txnum: u64,
    pub value: u64,
}

impl UtxoRecord {
    pub fn put(&self, batch: &mut Batch) {
        batch.put(Table::Utxo, utxo_key(&self.hashx, self.txnum, self.vout), self.value.to_le_bytes().to_vec());
        batch.put(Table::HashXLookup, lookup_key(&self.tx_hash, self.vout, self.txnum), self.hashx.as_bytes().to_vec());
    }

    pub fn delete(&self, batch: &mut Batch) {
        batch.delete(Table::Utxo, utxo_key(&self.hashx, self.txnum, self.vout));
        batch.delete(Table::HashXLookup, lookup_key(&self.tx_hash, self.vout, self.txnum));
    }
}

/// What is needed to disconnect one block without refetching it.
#[derive(Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockUndo {
    /// Transaction count before the block.
    pub tx_count_before: u64,
    /// Outputs the block spent, with their prior values.
    pub spent: Vec<UtxoRecord>,
    /// Outputs the block created.
    pub created: Vec<UtxoRecord>,
}

impl BlockUndo {
    /// Every hashX whose history the block appended to.
    pub fn touched(&self) -> impl Iterator<Item = HashX> + '_ {
        self.spent.iter().chain(&self.created).map(|u| u.hashx)
    }
}

/// Persisted flush marker. Authoritative on restart.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct FlushState {
    pub db_version: u32,
    pub genesis_hash: Hash256,
    /// `None` until the genesis block is flushed.
    pub height: Option<u32>,
    pub tip: Hash256,
    pub tx_count: u64,
    /// Largest history flush id in use.
    pub flush_count: u32,
    /// Largest row index written by an unfinished compaction.
    pub comp_flush_count: Option<u32>,
    /// First hashX not yet compacted.
    pub comp_cursor: Option<Vec<u8>>,
    /// Seconds spent indexing.
    pub wall_time: u64,
    pub first_sync: bool,
}

impl FlushState {
    pub fn fresh(genesis_hash: Hash256) -> Self {
        Self {
            db_version: DB_VERSION,
            genesis_hash,
            height: None,
            tip: Hash256::ZERO,
            tx_count: 0,
            flush_count: 0,
            comp_flush_count: None,
            comp_cursor: None,
            wall_time: 0,
            first_sync: true,
        }
    }

    fn write(&self, batch: &mut Batch) -> Result<(), IndexError> {
        batch.put(Table::Meta, STATE_KEY.to_vec(), bincode_encode(self)?);
        Ok(())
    }
}

/// A confirmed unspent output as returned to clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoInfo {
    pub tx_hash: Hash256,
    pub tx_pos: u32,
    pub height: u32,
    pub value: u64,
}

/// Everything connected since the previous flush.
#[derive(Debug, Default)]
pub struct FlushData {
    pub height: u32,
    pub tip: Hash256,
    pub tx_count: u64,
    /// Raw headers of the new blocks, in height order.
    pub headers: Vec<[u8; HEADER_LEN]>,
    /// Cumulative tx count after each new block.
    pub block_tx_counts: Vec<u64>,
    /// Hashes of the new transactions, in txnum order.
    pub tx_hashes: Vec<Hash256>,
    /// Outputs created and still unspent.
    pub adds: Vec<UtxoRecord>,
    /// Flushed outputs spent by the new blocks.
    pub spends: Vec<UtxoRecord>,
    pub history: UnflushedHistory,
    pub undos: Vec<(u32, BlockUndo)>,
    pub elapsed: Duration,
    pub first_sync: bool,
}

/// Result of disconnecting blocks back to a fork point.
#[derive(Debug, Default)]
pub struct BackupSummary {
    pub undone: u32,
    pub touched: HashSet<HashX>,
}

struct DbState {
    flush: FlushState,
    /// Cumulative tx count after each flushed block, indexed by height.
    tx_counts: Vec<u64>,
}

/// The flushed index.
pub struct IndexDb {
    store: Arc<dyn IndexStore>,
    coin: Coin,
    history_limit: u32,
    state: RwLock<DbState>,
    merkle: Mutex<Option<MerkleCache>>,
}

impl IndexDb {
    /// Open the index in `store` for `coin`.
    ///
    /// Fails if the store was built for another chain or another layout.
    /// `max_flush_count` bounds history flush ids; it is capped at 65535.
    pub fn open(store: Arc<dyn IndexStore>, coin: Coin, max_flush_count: u32) -> Result<Self, IndexError> {
        let flush = match store.get(Table::Meta, STATE_KEY)? {
            Some(bytes) => bincode_decode::<FlushState>(&bytes)?,
            None => {
                info!(coin = coin.name, "creating new index");
                FlushState::fresh(coin.genesis_hash)
            }
        };
        if flush.db_version != DB_VERSION {
            return Err(ChainStateError::Corrupt(format!(
                "index layout version {} unsupported (expected {DB_VERSION})",
                flush.db_version
            ))
            .into());
        }
        if flush.genesis_hash != coin.genesis_hash {
            return Err(ChainStateError::GenesisMismatch {
                stored: flush.genesis_hash.to_hex(),
                expected: coin.genesis_hash.to_hex(),
            }
            .into());
        }

        let mut tx_counts = Vec::new();
        for item in store.scan(Table::TxCounts, &[], None) {
            let (_, value) = item?;
            tx_counts.push(u64_le(&value)?);
        }
        let expected = flush.height.map_or(0, |h| h as usize + 1);
        if tx_counts.len() != expected || tx_counts.last().copied().unwrap_or(0) != flush.tx_count {
            return Err(ChainStateError::Corrupt(format!(
                "{} tx counts stored for height {:?}",
                tx_counts.len(),
                flush.height
            ))
            .into());
        }
        if flush.comp_cursor.is_some() {
            warn!("history compaction was interrupted; run spindex-compact to finish it");
        }
        if let Some(height) = flush.height {
            info!(height, tx_count = flush.tx_count, flush_count = flush.flush_count, tip = %flush.tip, "opened index");
        }

        Ok(Self {
            store,
            coin,
            history_limit: max_flush_count.min(MAX_FLUSH_ID),
            state: RwLock::new(DbState { flush, tx_counts }),
            merkle: Mutex::new(None),
        })
    }

    pub fn coin(&self) -> &Coin {
        &self.coin
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    /// Snapshot of the flush marker.
    pub fn flush_state(&self) -> FlushState {
        self.state.read().flush.clone()
    }

    /// Flushed height, `None` for an empty index.
    pub fn height(&self) -> Option<u32> {
        self.state.read().flush.height
    }

    pub fn tip(&self) -> Hash256 {
        self.state.read().flush.tip
    }

    pub fn tx_count(&self) -> u64 {
        self.state.read().flush.tx_count
    }

    /// Effective bound on history flush ids.
    pub fn history_limit(&self) -> u32 {
        self.history_limit
    }

    // --- Headers ---

    fn read_header(&self, height: u32) -> Result<Option<Vec<u8>>, IndexError> {
        self.store.get(Table::Headers, &height_key(height))
    }

    fn read_headers(&self, start: u32, count: u32) -> Result<Vec<Vec<u8>>, IndexError> {
        self.store
            .scan(Table::Headers, &[], Some(&height_key(start)))
            .take(count as usize)
            .map(|item| item.map(|(_, v)| v))
            .collect()
    }

    fn read_header_hashes(&self, start: usize, count: usize) -> Result<Vec<Hash256>, IndexError> {
        let headers = self.read_headers(start as u32, count as u32)?;
        if headers.len() != count {
            return Err(ChainStateError::Corrupt(format!("missing headers in {start}..{}", start + count)).into());
        }
        Ok(headers.iter().map(|h| self.coin.header_hash(h)).collect())
    }

    /// Raw header at `height`, `None` above the tip.
    pub fn header(&self, height: u32) -> Result<Option<Vec<u8>>, IndexError> {
        let _state = self.state.read();
        self.read_header(height)
    }

    /// Up to `count` consecutive raw headers from `start`, stopping at the tip.
    pub fn headers(&self, start: u32, count: u32) -> Result<Vec<Vec<u8>>, IndexError> {
        let _state = self.state.read();
        self.read_headers(start, count)
    }

    /// Hashes of up to `count` flushed blocks from `start`.
    pub fn block_hashes(&self, start: u32, count: u32) -> Result<Vec<Hash256>, IndexError> {
        Ok(self.headers(start, count)?.iter().map(|h| self.coin.header_hash(h)).collect())
    }

    /// Merkle branch and root proving header `index` in the tree of the
    /// first `length` headers.
    pub fn header_branch_and_root(&self, length: u32, index: u32) -> Result<(Vec<Hash256>, Hash256), IndexError> {
        let state = self.state.read();
        let available = state.flush.height.map_or(0, |h| h as usize + 1);
        if length as usize > available {
            return Err(spindex_core::merkle::MerkleError::IndexOutOfRange {
                index: length.saturating_sub(1) as usize,
                count: available,
            }
            .into());
        }
        let source = |start: usize, count: usize| self.read_header_hashes(start, count);
        let mut cache = self.merkle.lock();
        if cache.is_none() {
            *cache = Some(MerkleCache::new(available, &source)?);
        }
        match cache.as_mut() {
            Some(cache) => cache.branch_and_root(length as usize, index as usize, &source),
            None => Err(ChainStateError::Corrupt("merkle cache unavailable".into()).into()),
        }
    }

    // --- Transactions ---

    /// Height of the block containing `txnum`.
    fn txnum_height(tx_counts: &[u64], txnum: u64) -> u32 {
        tx_counts.partition_point(|&count| count <= txnum) as u32
    }

    fn read_tx_hash(&self, txnum: u64) -> Result<Hash256, IndexError> {
        let bytes = self
            .store
            .get(Table::TxHashes, &txnum_key(txnum))?
            .ok_or_else(|| ChainStateError::Corrupt(format!("no tx hash for txnum {txnum}")))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainStateError::Corrupt(format!("bad tx hash for txnum {txnum}")))?;
        Ok(Hash256(arr))
    }

    /// Hashes of the transactions in the block at `height`, in block order.
    pub fn tx_hashes_at(&self, height: u32) -> Result<Option<Vec<Hash256>>, IndexError> {
        let state = self.state.read();
        let Some(&end) = state.tx_counts.get(height as usize) else {
            return Ok(None);
        };
        let start = if height == 0 { 0 } else { state.tx_counts[height as usize - 1] };
        let hashes = self
            .store
            .scan(Table::TxHashes, &[], Some(&txnum_key(start)))
            .take((end - start) as usize)
            .map(|item| {
                let (_, v) = item?;
                let arr: [u8; 32] =
                    v.as_slice().try_into().map_err(|_| ChainStateError::Corrupt("bad tx hash".into()))?;
                Ok(Hash256(arr))
            })
            .collect::<Result<Vec<_>, IndexError>>()?;
        Ok(Some(hashes))
    }

    // --- UTXOs ---

    fn read_utxo(&self, tx_hash: &Hash256, vout: u32) -> Result<Option<UtxoRecord>, IndexError> {
        let prefix = lookup_prefix(tx_hash, vout);
        for item in self.store.scan(Table::HashXLookup, &prefix, None) {
            let (key, value) = item?;
            let txnum = txnum_from_be5(&key[prefix.len()..]);
            // Short hash prefixes collide; confirm the full hash.
            if self.read_tx_hash(txnum)? != *tx_hash {
                continue;
            }
            let hashx = HashX::from_prefix(&value)?;
            let Some(amount) = self.store.get(Table::Utxo, &utxo_key(&hashx, txnum, vout))? else {
                return Err(ChainStateError::Corrupt(format!("lookup entry without UTXO for {tx_hash}:{vout}")).into());
            };
            return Ok(Some(UtxoRecord { tx_hash: *tx_hash, vout, hashx, txnum, value: u64_le(&amount)? }));
        }
        Ok(None)
    }

    /// The flushed UTXO at `tx_hash:vout`, if unspent.
    pub fn lookup_utxo(&self, tx_hash: &Hash256, vout: u32) -> Result<Option<UtxoRecord>, IndexError> {
        let _state = self.state.read();
        self.read_utxo(tx_hash, vout)
    }

    /// `(hashX, value)` for each prevout, `None` where it is not a flushed UTXO.
    pub fn lookup_utxos(&self, prevouts: &[OutPoint]) -> Result<Vec<Option<(HashX, u64)>>, IndexError> {
        let _state = self.state.read();
        prevouts
            .iter()
            .map(|op| Ok(self.read_utxo(&op.hash, op.index)?.map(|u| (u.hashx, u.value))))
            .collect()
    }

    /// Confirmed UTXOs of `hashx` in chain order.
    pub fn utxos(&self, hashx: &HashX) -> Result<Vec<UtxoInfo>, IndexError> {
        let state = self.state.read();
        let mut out = Vec::new();
        for item in self.store.scan(Table::Utxo, hashx.as_bytes(), None) {
            let (key, value) = item?;
            if key.len() != HASHX_LEN + 9 {
                return Err(ChainStateError::Corrupt("bad UTXO key".into()).into());
            }
            let txnum = txnum_from_be5(&key[HASHX_LEN..HASHX_LEN + 5]);
            let mut vout = [0u8; 4];
            vout.copy_from_slice(&key[HASHX_LEN + 5..]);
            out.push(UtxoInfo {
                tx_hash: self.read_tx_hash(txnum)?,
                tx_pos: u32::from_be_bytes(vout),
                height: Self::txnum_height(&state.tx_counts, txnum),
                value: u64_le(&value)?,
            });
        }
        Ok(out)
    }

    // --- History ---

    fn read_history_rows(&self, hashx: &HashX) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexError> {
        self.store.scan(Table::History, hashx.as_bytes(), None).collect()
    }

    /// Confirmed history of `hashx` as `(tx_hash, height)`, at most `limit`
    /// entries.
    pub fn history(&self, hashx: &HashX, limit: usize) -> Result<Vec<(Hash256, u32)>, IndexError> {
        let state = self.state.read();
        let mut out = Vec::new();
        for (_, row) in self.read_history_rows(hashx)? {
            for txnum in history::unpack_txnums(&row)? {
                if out.len() == limit {
                    return Ok(out);
                }
                out.push((self.read_tx_hash(txnum)?, Self::txnum_height(&state.tx_counts, txnum)));
            }
        }
        Ok(out)
    }

    /// Raw txnums of `hashx`'s confirmed history.
    pub fn history_txnums(&self, hashx: &HashX) -> Result<Vec<u64>, IndexError> {
        let _state = self.state.read();
        let mut out = Vec::new();
        for (_, row) in self.read_history_rows(hashx)? {
            out.extend(history::unpack_txnums(&row)?);
        }
        Ok(out)
    }

    fn read_undo(&self, height: u32) -> Result<Option<BlockUndo>, IndexError> {
        self.store.get(Table::Undo, &height_key(height))?.map(|b| bincode_decode(&b)).transpose()
    }

    /// First height whose undo record is retained when the tip is `height`.
    fn undo_floor(&self, height: u32) -> u32 {
        (height + 1).saturating_sub(self.coin.reorg_limit)
    }

    // --- Writes ---

    /// Write one flush atomically.
    pub fn flush(&self, data: FlushData) -> Result<(), IndexError> {
        let mut state = self.state.write();
        let old_height = state.flush.height;
        let first = old_height.map_or(0, |h| h + 1);
        let count = data.headers.len() as u32;
        if count == 0 || first + count - 1 != data.height || data.block_tx_counts.len() != data.headers.len() {
            return Err(ChainStateError::HeightMismatch { expected: first + count.saturating_sub(1), got: data.height }.into());
        }

        let mut batch = Batch::new();
        let mut flush_count = state.flush.flush_count;
        if !data.history.is_empty() {
            if flush_count >= self.history_limit {
                return Err(ChainStateError::HistoryOverflow { flush_count, limit: self.history_limit }.into());
            }
            flush_count += 1;
            data.history.write_rows(flush_count as u16, &mut batch);
        }

        for (i, header) in data.headers.iter().enumerate() {
            let height = first + i as u32;
            batch.put(Table::Headers, height_key(height).to_vec(), header.to_vec());
            batch.put(Table::TxCounts, height_key(height).to_vec(), data.block_tx_counts[i].to_le_bytes().to_vec());
        }
        for (i, hash) in data.tx_hashes.iter().enumerate() {
            batch.put(Table::TxHashes, txnum_key(state.flush.tx_count + i as u64).to_vec(), hash.as_bytes().to_vec());
        }
        for spent in &data.spends {
            spent.delete(&mut batch);
        }
        for add in &data.adds {
            add.put(&mut batch);
        }

        let floor = self.undo_floor(data.height);
        for (height, undo) in &data.undos {
            if *height >= floor {
                batch.put(Table::Undo, height_key(*height).to_vec(), bincode_encode(undo)?);
            }
        }
        let old_floor = old_height.map_or(0, |h| self.undo_floor(h));
        for height in old_floor..floor {
            batch.delete(Table::Undo, height_key(height).to_vec());
        }

        let mut flush = state.flush.clone();
        flush.height = Some(data.height);
        flush.tip = data.tip;
        flush.tx_count = data.tx_count;
        flush.flush_count = flush_count;
        flush.wall_time += data.elapsed.as_secs();
        flush.first_sync = data.first_sync;
        flush.write(&mut batch)?;

        let ops = batch.len();
        self.store.batch_write(batch)?;
        state.tx_counts.extend_from_slice(&data.block_tx_counts);
        state.flush = flush;
        debug!(height = data.height, ops, flush_count, "flush written");
        Ok(())
    }

    /// Disconnect every block above `fork` in one atomic batch.
    ///
    /// Fails with [`ChainStateError::ReorgTooDeep`] if undo records for some
    /// of those heights are no longer retained.
    pub fn backup_to(&self, fork: u32) -> Result<BackupSummary, IndexError> {
        let mut state = self.state.write();
        let Some(height) = state.flush.height else {
            return Ok(BackupSummary::default());
        };
        if fork >= height {
            return Ok(BackupSummary::default());
        }
        let depth = height - fork;
        if fork + 1 < self.undo_floor(height) {
            return Err(ChainStateError::ReorgTooDeep { depth, retained: self.coin.reorg_limit }.into());
        }

        let mut batch = Batch::new();
        let mut touched = HashSet::new();
        for h in (fork + 1..=height).rev() {
            let undo = self.read_undo(h)?.ok_or(ChainStateError::UndoDataMissing(h))?;
            // Restore before deleting so outputs created and spent in the
            // same block end up deleted.
            for spent in &undo.spent {
                spent.put(&mut batch);
            }
            for created in &undo.created {
                created.delete(&mut batch);
            }
            touched.extend(undo.touched());
            batch.delete(Table::Headers, height_key(h).to_vec());
            batch.delete(Table::TxCounts, height_key(h).to_vec());
            batch.delete(Table::Undo, height_key(h).to_vec());
        }

        let tx_count = state.tx_counts[fork as usize];
        for txnum in tx_count..state.flush.tx_count {
            batch.delete(Table::TxHashes, txnum_key(txnum).to_vec());
        }
        let mut removed = 0;
        for hashx in &touched {
            let rows = self.read_history_rows(hashx)?;
            removed += history::truncate_rows(&rows, tx_count, &mut batch)?;
        }

        let header = self
            .read_header(fork)?
            .ok_or_else(|| ChainStateError::Corrupt(format!("missing header at fork height {fork}")))?;
        let mut flush = state.flush.clone();
        flush.height = Some(fork);
        flush.tip = self.coin.header_hash(&header);
        flush.tx_count = tx_count;
        flush.write(&mut batch)?;

        self.store.batch_write(batch)?;
        state.tx_counts.truncate(fork as usize + 1);
        state.flush = flush;
        if let Some(cache) = self.merkle.lock().as_mut() {
            cache.truncate(fork as usize + 1);
        }
        info!(fork, depth, history_removed = removed, tip = %state.flush.tip, "backed up blocks");
        Ok(BackupSummary { undone: depth, touched })
    }

    /// Compact up to `max_hashxs` hashXs' history, resuming at the saved
    /// cursor. Returns `true` once every hashX is compacted.
    pub fn compact_history_step(&self, row_entries: usize, max_hashxs: usize) -> Result<bool, IndexError> {
        let mut state = self.state.write();
        let cursor = state.flush.comp_cursor.clone();
        let mut comp_flush_count = state.flush.comp_flush_count.unwrap_or(0);

        let mut batch = Batch::new();
        let mut current: Option<(HashX, Vec<(Vec<u8>, Vec<u8>)>)> = None;
        let mut processed = 0usize;
        let mut next_cursor = None;
        for item in self.store.scan(Table::History, &[], cursor.as_deref()) {
            let (key, value) = item?;
            let hashx = HashX::from_prefix(&key)?;
            match current.as_mut() {
                Some((cur, rows)) if *cur == hashx => {
                    rows.push((key, value));
                    continue;
                }
                _ => {}
            }
            if let Some((cur, rows)) = current.take() {
                let last = history::compact_rows(&cur, &rows, row_entries, &mut batch)?;
                comp_flush_count = comp_flush_count.max(last as u32);
                processed += 1;
            }
            if processed == max_hashxs {
                next_cursor = Some(hashx.as_bytes().to_vec());
                break;
            }
            current = Some((hashx, vec![(key, value)]));
        }
        if let Some((cur, rows)) = current.take() {
            let last = history::compact_rows(&cur, &rows, row_entries, &mut batch)?;
            comp_flush_count = comp_flush_count.max(last as u32);
            processed += 1;
        }

        let mut flush = state.flush.clone();
        let done = next_cursor.is_none();
        if done {
            flush.flush_count = comp_flush_count;
            flush.comp_flush_count = None;
            flush.comp_cursor = None;
        } else {
            flush.comp_flush_count = Some(comp_flush_count);
            flush.comp_cursor = next_cursor;
        }
        flush.write(&mut batch)?;
        self.store.batch_write(batch)?;
        state.flush = flush;
        debug!(processed, done, comp_flush_count, "compaction step");
        Ok(done)
    }

    /// Compact all history. Returns the new flush count.
    pub fn compact_history(&self, row_entries: usize) -> Result<u32, IndexError> {
        const HASHXS_PER_BATCH: usize = 10_000;
        let before = self.flush_state().flush_count;
        while !self.compact_history_step(row_entries, HASHXS_PER_BATCH)? {}
        let after = self.flush_state().flush_count;
        info!(before, after, "history compaction complete");
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindex_core::store::MemoryStore;

    fn hx(b: u8) -> HashX {
        HashX([b; HASHX_LEN])
    }

    fn th(b: u8) -> Hash256 {
        Hash256([b; 32])
    }

    fn open(store: &Arc<MemoryStore>) -> IndexDb {
        IndexDb::open(store.clone(), Coin::regtest(), 65_535).unwrap()
    }

    fn header(n: u8) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0] = n;
        h
    }

    /// One block with `txs` transactions, each creating one output to `owner`.
    fn block_flush(db: &IndexDb, owner: HashX, txs: u8, seed: u8) -> FlushData {
        let state = db.flush_state();
        let height = state.height.map_or(0, |h| h + 1);
        let mut data = FlushData { height, first_sync: true, ..FlushData::default() };
        let mut undo = BlockUndo { tx_count_before: state.tx_count, ..BlockUndo::default() };
        for i in 0..txs {
            let txnum = state.tx_count + i as u64;
            let tx_hash = th(seed.wrapping_add(i));
            data.tx_hashes.push(tx_hash);
            let rec = UtxoRecord { tx_hash, vout: 0, hashx: owner, txnum, value: 1000 + i as u64 };
            data.adds.push(rec.clone());
            undo.created.push(rec);
            data.history.add_tx(txnum, &[owner].into_iter().collect());
        }
        let hdr = header(seed);
        data.tip = db.coin().header_hash(&hdr);
        data.headers.push(hdr);
        data.tx_count = state.tx_count + txs as u64;
        data.block_tx_counts.push(data.tx_count);
        data.undos.push((height, undo));
        data
    }

    // ------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------

    #[test]
    fn fresh_index_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let db = open(&store);
        assert_eq!(db.height(), None);
        assert_eq!(db.tx_count(), 0);
        assert_eq!(db.history_limit(), 65_535);
    }

    #[test]
    fn genesis_mismatch_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let db = open(&store);
        db.flush(block_flush(&db, hx(1), 1, 1)).unwrap();
        let err = IndexDb::open(store.clone(), Coin::bitcoin(), 65_535).err().unwrap();
        assert!(matches!(err, IndexError::ChainState(ChainStateError::GenesisMismatch { .. })));
    }

    #[test]
    fn history_limit_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let db = IndexDb::open(store, Coin::regtest(), 1_000_000).unwrap();
        assert_eq!(db.history_limit(), MAX_FLUSH_ID);
    }

    // ------------------------------------------------------------------
    // Flush and reads
    // ------------------------------------------------------------------

    #[test]
    fn flush_then_query() {
        let store = Arc::new(MemoryStore::new());
        let db = open(&store);
        db.flush(block_flush(&db, hx(1), 2, 10)).unwrap();
        db.flush(block_flush(&db, hx(1), 1, 20)).unwrap();

        assert_eq!(db.height(), Some(1));
        assert_eq!(db.tx_count(), 3);
        assert_eq!(db.flush_state().flush_count, 2);
        assert_eq!(db.history(&hx(1), 10).unwrap(), vec![(th(10), 0), (th(11), 0), (th(20), 1)]);
        assert_eq!(db.history(&hx(1), 2).unwrap().len(), 2);
        assert_eq!(db.tx_hashes_at(0).unwrap(), Some(vec![th(10), th(11)]));
        assert_eq!(db.tx_hashes_at(2).unwrap(), None);

        let utxos = db.utxos(&hx(1)).unwrap();
        assert_eq!(utxos.len(), 3);
        assert_eq!(utxos[2], UtxoInfo { tx_hash: th(20), tx_pos: 0, height: 1, value: 1000 });

        let rec = db.lookup_utxo(&th(11), 0).unwrap().unwrap();
        assert_eq!((rec.txnum, rec.value), (1, 1001));
        assert_eq!(db.lookup_utxo(&th(11), 1).unwrap(), None);
    }

    #[test]
    fn reopen_restores_state() {
        let store = Arc::new(MemoryStore::new());
        {
            let db = open(&store);
            db.flush(block_flush(&db, hx(1), 2, 10)).unwrap();
        }
        let db = open(&store);
        assert_eq!(db.height(), Some(0));
        assert_eq!(db.tx_count(), 2);
        assert_eq!(db.utxos(&hx(1)).unwrap().len(), 2);
    }

    #[test]
    fn flush_rejects_gap() {
        let store = Arc::new(MemoryStore::new());
        let db = open(&store);
        let mut data = block_flush(&db, hx(1), 1, 1);
        data.height = 5;
        assert!(matches!(db.flush(data), Err(IndexError::ChainState(ChainStateError::HeightMismatch { .. }))));
    }

    #[test]
    fn history_overflow_at_limit() {
        let store = Arc::new(MemoryStore::new());
        let db = IndexDb::open(store, Coin::regtest(), 2).unwrap();
        db.flush(block_flush(&db, hx(1), 1, 1)).unwrap();
        db.flush(block_flush(&db, hx(1), 1, 2)).unwrap();
        let err = db.flush(block_flush(&db, hx(1), 1, 3)).unwrap_err();
        assert!(err.needs_compaction());
        assert_eq!(db.height(), Some(1));
    }

    #[test]
    fn undo_records_are_pruned() {
        let store = Arc::new(MemoryStore::new());
        let db = open(&store);
        let limit = db.coin().reorg_limit;
        for i in 0..limit + 5 {
            db.flush(block_flush(&db, hx(1), 1, i as u8)).unwrap();
        }
        assert_eq!(store.len(Table::Undo), limit as usize);
        assert!(store.get(Table::Undo, &height_key(4)).unwrap().is_none());
        assert!(store.get(Table::Undo, &height_key(5)).unwrap().is_some());
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    #[test]
    fn backup_restores_spent_and_truncates_history() {
        let store = Arc::new(MemoryStore::new());
        let db = open(&store);
        db.flush(block_flush(&db, hx(1), 1, 10)).unwrap();
        let before_utxo = store.dump(Table::Utxo);

        // Block 1 spends the genesis output into hx(2).
        let spent = db.lookup_utxo(&th(10), 0).unwrap().unwrap();
        let mut data = block_flush(&db, hx(2), 1, 20);
        data.spends.push(spent.clone());
        data.undos[0].1.spent.push(spent.clone());
        data.history.add_tx(1, &[hx(1)].into_iter().collect());
        db.flush(data).unwrap();
        assert!(db.utxos(&hx(1)).unwrap().is_empty());
        assert_eq!(db.history_txnums(&hx(1)).unwrap(), vec![0, 1]);

        let summary = db.backup_to(0).unwrap();
        assert_eq!(summary.undone, 1);
        assert!(summary.touched.contains(&hx(1)) && summary.touched.contains(&hx(2)));
        assert_eq!(db.height(), Some(0));
        assert_eq!(db.tx_count(), 1);
        assert_eq!(store.dump(Table::Utxo), before_utxo);
        assert_eq!(db.history_txnums(&hx(1)).unwrap(), vec![0]);
        assert!(db.history_txnums(&hx(2)).unwrap().is_empty());
        assert_eq!(store.len(Table::TxHashes), 1);
        assert_eq!(db.tip(), db.coin().header_hash(&header(10)));
    }

    #[test]
    fn backup_past_retained_undo_fails() {
        let store = Arc::new(MemoryStore::new());
        let db = open(&store);
        let limit = db.coin().reorg_limit;
        for i in 0..limit + 3 {
            db.flush(block_flush(&db, hx(1), 1, i as u8)).unwrap();
        }
        let err = db.backup_to(1).unwrap_err();
        assert!(matches!(err, IndexError::ChainState(ChainStateError::ReorgTooDeep { .. })));
        assert!(err.is_fatal());
    }

    // ------------------------------------------------------------------
    // Header proofs
    // ------------------------------------------------------------------

    #[test]
    fn header_proof_matches_direct_computation() {
        let store = Arc::new(MemoryStore::new());
        let db = open(&store);
        for i in 0..9 {
            db.flush(block_flush(&db, hx(1), 1, i)).unwrap();
        }
        let hashes = db.block_hashes(0, 9).unwrap();
        let (branch, root) = db.header_branch_and_root(9, 8).unwrap();
        let expected = spindex_core::merkle::branch_and_root(&hashes, 8, None).unwrap();
        assert_eq!((branch.clone(), root), expected);
        assert_eq!(spindex_core::merkle::root_from_branch(hashes[8], 8, &branch), root);
        assert!(db.header_branch_and_root(10, 0).is_err());
    }

    // ------------------------------------------------------------------
    // Compaction
    // ------------------------------------------------------------------

    #[test]
    fn compaction_preserves_history_and_resets_flush_count() {
        let store = Arc::new(MemoryStore::new());
        let db = open(&store);
        for i in 0..6 {
            db.flush(block_flush(&db, hx(1 + i % 3), 2, i * 10)).unwrap();
        }
        let before: Vec<_> = (1..=3).map(|b| db.history_txnums(&hx(b)).unwrap()).collect();
        assert_eq!(db.flush_state().flush_count, 6);

        // One hashX per step forces the cursor to be persisted.
        assert!(!db.compact_history_step(3, 1).unwrap());
        assert!(db.flush_state().comp_cursor.is_some());
        while !db.compact_history_step(3, 1).unwrap() {}

        let after: Vec<_> = (1..=3).map(|b| db.history_txnums(&hx(b)).unwrap()).collect();
        assert_eq!(before, after);
        let state = db.flush_state();
        assert_eq!(state.flush_count, 1);
        assert_eq!(state.comp_cursor, None);
        assert_eq!(store.len(Table::History), 6);

        db.flush(block_flush(&db, hx(1), 1, 99)).unwrap();
        assert_eq!(db.history_txnums(&hx(1)).unwrap().last(), Some(&12));
    }
}
