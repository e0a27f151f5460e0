//! Sequential block ingestion.
//!
//! The [`BlockProcessor`] is the index's only writer. It pulls blocks from
//! the daemon in height order, applies them to an in-memory layer of
//! unflushed changes and periodically flushes that layer to the
//! [`IndexDb`] in one atomic batch. A block whose parent is not the local tip
//! triggers a reorg: pending changes are flushed, the fork point is located
//! and the index is backed up to it from stored undo records.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use spindex_core::coin::Coin;
use spindex_core::error::{ChainStateError, DaemonError, IndexError};
use spindex_core::traits::Daemon;
use spindex_core::types::{Block, Hash256, HashX, OutPoint, HEADER_LEN};

use crate::db::{BlockUndo, FlushData, IndexDb, UtxoRecord};
use crate::history::UnflushedHistory;
use crate::notifications::Notifications;

/// Tuning for [`BlockProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Flush after this many unflushed blocks.
    pub flush_interval: u32,
    /// Flush when the oldest unflushed change is this old.
    pub flush_after: Duration,
    /// Flush when unflushed state is estimated above this many MB.
    pub cache_mb: usize,
    /// Blocks requested from the daemon per round.
    pub fetch_batch: u32,
    /// Pause between polls once caught up.
    pub poll_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            flush_interval: 2000,
            flush_after: Duration::from_secs(30),
            cache_mb: 1200,
            fetch_batch: 100,
            poll_interval: Duration::from_secs(2),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
        }
    }
}

/// Outcome of one [`BlockProcessor::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Connected this many blocks.
    Connected(u32),
    /// Backed up to `fork`, undoing `undone` blocks.
    Reorged { fork: u32, undone: u32 },
    /// Already at the daemon's tip.
    CaughtUp,
}

/// Why a forced reorg was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReorgRequestError {
    #[error("still catching up with daemon")]
    NotSynced,
    #[error("cannot undo {requested} blocks, at most {limit} are retained")]
    TooDeep { requested: u32, limit: u32 },
    #[error("block processor has stopped")]
    Stopped,
}

/// Asks a running [`BlockProcessor`] to back up some blocks and resync
/// them from the daemon.
#[derive(Clone)]
pub struct ReorgHandle {
    requests: mpsc::UnboundedSender<u32>,
    synced: watch::Receiver<Option<u32>>,
    limit: u32,
}

impl ReorgHandle {
    pub fn request(&self, count: u32) -> Result<(), ReorgRequestError> {
        if self.synced.borrow().is_none() {
            return Err(ReorgRequestError::NotSynced);
        }
        if count > self.limit {
            return Err(ReorgRequestError::TooDeep { requested: count, limit: self.limit });
        }
        self.requests.send(count).map_err(|_| ReorgRequestError::Stopped)
    }
}

/// Changes not yet flushed.
#[derive(Default)]
struct Unflushed {
    headers: Vec<[u8; HEADER_LEN]>,
    block_tx_counts: Vec<u64>,
    tx_hashes: Vec<Hash256>,
    /// Outputs created since the last flush and not yet spent.
    utxo_cache: HashMap<OutPoint, UtxoRecord>,
    /// Flushed outputs spent since the last flush.
    spends: Vec<UtxoRecord>,
    history: UnflushedHistory,
    undos: Vec<(u32, BlockUndo)>,
}

impl Unflushed {
    fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn memory_estimate(&self) -> usize {
        const UTXO_COST: usize = 160;
        const TX_COST: usize = 48;
        self.utxo_cache.len() * UTXO_COST
            + self.spends.len() * UTXO_COST
            + self.tx_hashes.len() * TX_COST
            + self.history.memory_estimate()
            + self.undos.iter().map(|(_, u)| (u.spent.len() + u.created.len()) * UTXO_COST).sum::<usize>()
    }
}

/// Owns all index mutation.
pub struct BlockProcessor {
    db: Arc<IndexDb>,
    daemon: Arc<dyn Daemon>,
    notifications: Arc<Notifications>,
    coin: Coin,
    config: ProcessorConfig,

    height: Option<u32>,
    tip: Hash256,
    tx_count: u64,
    daemon_height: u32,
    unflushed: Unflushed,
    /// HashXs touched since the last notification.
    touched: HashSet<HashX>,
    last_flush: Instant,
    first_sync: bool,
    notify: bool,
    synced: watch::Sender<Option<u32>>,
    shutdown: Option<watch::Receiver<bool>>,
    reorg_tx: mpsc::UnboundedSender<u32>,
    reorg_rx: mpsc::UnboundedReceiver<u32>,
}

impl BlockProcessor {
    /// Resume from the flushed state of `db`.
    pub fn new(
        db: Arc<IndexDb>,
        daemon: Arc<dyn Daemon>,
        notifications: Arc<Notifications>,
        config: ProcessorConfig,
    ) -> Self {
        let state = db.flush_state();
        let coin = db.coin().clone();
        let (synced, _) = watch::channel(None);
        let (reorg_tx, reorg_rx) = mpsc::unbounded_channel();
        Self {
            db,
            daemon,
            notifications,
            coin,
            config,
            height: state.height,
            tip: state.tip,
            tx_count: state.tx_count,
            daemon_height: 0,
            unflushed: Unflushed::default(),
            touched: HashSet::new(),
            last_flush: Instant::now(),
            first_sync: state.first_sync,
            notify: false,
            synced,
            shutdown: None,
            reorg_tx,
            reorg_rx,
        }
    }

    /// Height of the last connected block, flushed or not.
    pub fn height(&self) -> Option<u32> {
        self.height
    }

    pub fn tip(&self) -> Hash256 {
        self.tip
    }

    pub fn tx_count(&self) -> u64 {
        self.tx_count
    }

    /// Publishes the height each time the processor catches up with the
    /// daemon.
    pub fn synced(&self) -> watch::Receiver<Option<u32>> {
        self.synced.subscribe()
    }

    pub fn reorg_handle(&self) -> ReorgHandle {
        ReorgHandle { requests: self.reorg_tx.clone(), synced: self.synced.subscribe(), limit: self.coin.reorg_limit }
    }

    fn next_height(&self) -> u32 {
        self.height.map_or(0, |h| h + 1)
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fetch and connect the next blocks, reorging first if the daemon's
    /// chain no longer contains the local tip.
    pub async fn advance(&mut self) -> Result<Advance, IndexError> {
        let daemon_height = self.daemon.height().await?;
        self.daemon_height = daemon_height;
        let next = self.next_height();

        if next > daemon_height {
            if let Some(height) = self.height {
                let hashes = self.daemon.block_hashes(height, 1).await?;
                if hashes.first() != Some(&self.tip) {
                    return self.reorg().await;
                }
            }
            self.on_caught_up()?;
            return Ok(Advance::CaughtUp);
        }

        let count = (daemon_height - next + 1).min(self.config.fetch_batch.max(1));
        let hashes = self.daemon.block_hashes(next, count).await?;
        let raws = self.daemon.raw_blocks(&hashes).await?;
        let mut connected = 0;
        for (hash, raw) in hashes.iter().zip(raws) {
            let block = Block::from_bytes(&raw)?;
            let header = block.header.serialize();
            if self.coin.header_hash(&header) != *hash {
                return Err(DaemonError::Parse(format!("block {hash} does not hash to its id")).into());
            }
            if block.header.prev_hash != self.tip {
                if self.height.is_none() {
                    return Err(ChainStateError::ChainDiscontinuity { height: 0, tip: self.tip.to_hex() }.into());
                }
                if connected > 0 {
                    break;
                }
                return self.reorg().await;
            }
            if self.height.is_none() && *hash != self.coin.genesis_hash {
                return Err(ChainStateError::GenesisMismatch {
                    stored: hash.to_hex(),
                    expected: self.coin.genesis_hash.to_hex(),
                }
                .into());
            }
            self.connect_block(&block, header)?;
            connected += 1;
            if self.should_flush() {
                self.flush()?;
            }
            if self.stopping() {
                break;
            }
        }

        if self.height == Some(daemon_height) {
            self.on_caught_up()?;
        }
        Ok(Advance::Connected(connected))
    }

    /// Apply queued forced reorgs, then advance until caught up with the
    /// daemon.
    pub async fn catch_up(&mut self) -> Result<u32, IndexError> {
        self.take_reorg_requests(None)?;
        loop {
            if let Advance::CaughtUp = self.advance().await? {
                return Ok(self.height.unwrap_or(0));
            }
        }
    }

    fn connect_block(&mut self, block: &Block, header: [u8; HEADER_LEN]) -> Result<(), IndexError> {
        let height = self.next_height();
        let mut undo = BlockUndo { tx_count_before: self.tx_count, ..BlockUndo::default() };

        for tx in &block.transactions {
            let txid = tx.txid();
            let txnum = self.tx_count;
            let mut touched = HashSet::new();
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let spent = self.spend_utxo(&input.prev_out)?;
                    touched.insert(spent.hashx);
                    undo.spent.push(spent);
                }
            }
            for (vout, output) in tx.outputs.iter().enumerate() {
                if output.is_unspendable() {
                    continue;
                }
                let hashx = self.coin.hashx_from_script(&output.script_pubkey);
                let record = UtxoRecord { tx_hash: txid, vout: vout as u32, hashx, txnum, value: output.value };
                touched.insert(hashx);
                self.unflushed.utxo_cache.insert(OutPoint::new(txid, vout as u32), record.clone());
                undo.created.push(record);
            }
            self.unflushed.history.add_tx(txnum, &touched);
            self.touched.extend(touched);
            self.unflushed.tx_hashes.push(txid);
            self.tx_count += 1;
        }

        self.unflushed.headers.push(header);
        self.unflushed.block_tx_counts.push(self.tx_count);
        // Undo is only kept for blocks a reorg could still reach.
        if height + self.coin.reorg_limit > self.daemon_height {
            self.unflushed.undos.push((height, undo));
        }
        self.height = Some(height);
        self.tip = self.coin.header_hash(&header);
        Ok(())
    }

    fn spend_utxo(&mut self, prev_out: &OutPoint) -> Result<UtxoRecord, IndexError> {
        if let Some(record) = self.unflushed.utxo_cache.remove(prev_out) {
            return Ok(record);
        }
        match self.db.lookup_utxo(&prev_out.hash, prev_out.index)? {
            Some(record) => {
                self.unflushed.spends.push(record.clone());
                Ok(record)
            }
            None => Err(ChainStateError::MissingUtxo(prev_out.to_string()).into()),
        }
    }

    fn should_flush(&self) -> bool {
        self.unflushed.headers.len() as u32 >= self.config.flush_interval
            || self.last_flush.elapsed() >= self.config.flush_after
            || self.unflushed.memory_estimate() >= self.config.cache_mb * 1024 * 1024
    }

    /// Write all unflushed changes to the index.
    pub fn flush(&mut self) -> Result<(), IndexError> {
        if self.unflushed.is_empty() {
            return Ok(());
        }
        let Some(height) = self.height else {
            return Ok(());
        };
        let unflushed = std::mem::take(&mut self.unflushed);
        let blocks = unflushed.headers.len();
        let data = FlushData {
            height,
            tip: self.tip,
            tx_count: self.tx_count,
            headers: unflushed.headers,
            block_tx_counts: unflushed.block_tx_counts,
            tx_hashes: unflushed.tx_hashes,
            adds: unflushed.utxo_cache.into_values().collect(),
            spends: unflushed.spends,
            history: unflushed.history,
            undos: unflushed.undos,
            elapsed: self.last_flush.elapsed(),
            first_sync: self.first_sync,
        };
        self.db.flush(data)?;
        self.last_flush = Instant::now();
        if self.first_sync {
            info!(height, tx_count = self.tx_count, daemon_height = self.daemon_height, blocks, "sync progress");
        } else {
            debug!(height, tx_count = self.tx_count, blocks, "flushed");
        }
        self.publish(height);
        Ok(())
    }

    fn publish(&mut self, height: u32) {
        let touched = std::mem::take(&mut self.touched);
        if self.notify {
            self.notifications.on_block(touched, height);
        }
    }

    fn on_caught_up(&mut self) -> Result<(), IndexError> {
        if self.first_sync {
            self.first_sync = false;
            info!(height = ?self.height, tx_count = self.tx_count, "caught up with daemon");
        }
        self.flush()?;
        let Some(height) = self.height else {
            return Ok(());
        };
        if !self.notify {
            // From here on every flush is announced to sessions.
            self.notify = true;
            self.touched.clear();
            self.notifications.start(height);
        }
        self.synced.send_replace(Some(height));
        Ok(())
    }

    async fn reorg(&mut self) -> Result<Advance, IndexError> {
        self.flush()?;
        let Some(height) = self.height else {
            return Ok(Advance::CaughtUp);
        };
        let fork = self.find_fork(height).await?;
        warn!(height, fork, depth = height - fork, "chain reorganisation");
        self.back_up_to(fork)
    }

    /// Undo the last `count` blocks even though the daemon still has them.
    /// The next advance reconnects them.
    fn force_reorg(&mut self, count: u32) -> Result<Advance, IndexError> {
        self.flush()?;
        let Some(height) = self.height else {
            return Ok(Advance::CaughtUp);
        };
        let fork = height.saturating_sub(count);
        warn!(height, fork, "forced reorg");
        self.back_up_to(fork)
    }

    fn back_up_to(&mut self, fork: u32) -> Result<Advance, IndexError> {
        let summary = self.db.backup_to(fork)?;
        let state = self.db.flush_state();
        self.height = state.height;
        self.tip = state.tip;
        self.tx_count = state.tx_count;
        self.touched.extend(summary.touched);
        let touched = std::mem::take(&mut self.touched);
        if self.notify {
            self.notifications.on_reorg(touched, fork);
        }
        Ok(Advance::Reorged { fork, undone: summary.undone })
    }

    /// Apply queued forced reorgs. One that cannot be honoured is logged
    /// and skipped.
    fn take_reorg_requests(&mut self, first: Option<u32>) -> Result<(), IndexError> {
        let mut next = first.or_else(|| self.reorg_rx.try_recv().ok());
        while let Some(count) = next {
            match self.force_reorg(count) {
                Ok(_) => {}
                Err(IndexError::ChainState(e @ ChainStateError::ReorgTooDeep { .. })) => {
                    warn!(error = %e, "forced reorg refused");
                }
                Err(e) => return Err(e),
            }
            next = self.reorg_rx.try_recv().ok();
        }
        Ok(())
    }

    /// Last height where the stored chain and the daemon's chain agree,
    /// searched over windows doubling in size below the tip.
    async fn find_fork(&self, height: u32) -> Result<u32, IndexError> {
        let mut start = height;
        let mut count = 1u32;
        loop {
            let ours = self.db.block_hashes(start, count)?;
            let theirs = self.daemon.block_hashes(start, count).await?;
            let matching = ours.iter().zip(&theirs).take_while(|(a, b)| a == b).count() as u32;
            if matching > 0 {
                return Ok(start + matching - 1);
            }
            if start == 0 {
                return Err(ChainStateError::GenesisMismatch {
                    stored: ours.first().map(Hash256::to_hex).unwrap_or_default(),
                    expected: theirs.first().map(Hash256::to_hex).unwrap_or_default(),
                }
                .into());
            }
            count = (count * 2).min(start);
            start -= count;
        }
    }

    /// Run until `shutdown` flips, retrying daemon failures with backoff.
    /// Pending changes are flushed before returning.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), IndexError> {
        let mut shutdown_rx = shutdown.clone();
        self.shutdown = Some(shutdown);
        let mut backoff = self.config.retry_base;
        let mut requested = None;
        while !self.stopping() {
            if let Err(e) = self.take_reorg_requests(requested.take()) {
                error!(error = %e, "block processor stopped");
                return Err(e);
            }
            let pause = match self.advance().await {
                Ok(Advance::CaughtUp) => {
                    backoff = self.config.retry_base;
                    Some(self.config.poll_interval)
                }
                Ok(_) => {
                    backoff = self.config.retry_base;
                    None
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, retry_in = ?backoff, "daemon unavailable");
                    let pause = backoff;
                    backoff = (backoff * 2).min(self.config.retry_max);
                    Some(pause)
                }
                Err(e) => {
                    error!(error = %e, "block processor stopped");
                    return Err(e);
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown_rx.changed() => {}
                    count = self.reorg_rx.recv() => requested = count,
                }
            }
        }
        self.flush()?;
        info!(height = ?self.height, "block processor shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindex_core::store::{MemoryStore, Table};

    use crate::daemon::MemoryDaemon;
    use crate::testkit::{op_return_script, p2pkh_script, spend, ChainBuilder, SUBSIDY};

    struct Harness {
        store: Arc<MemoryStore>,
        db: Arc<IndexDb>,
        daemon: Arc<MemoryDaemon>,
        processor: BlockProcessor,
    }

    fn harness(chain: &ChainBuilder, config: ProcessorConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(IndexDb::open(store.clone(), chain.coin(), 65_535).unwrap());
        let daemon = Arc::new(chain.daemon());
        let processor = BlockProcessor::new(db.clone(), daemon.clone(), Arc::new(Notifications::new()), config);
        Harness { store, db, daemon, processor }
    }

    fn hashx(chain: &ChainBuilder, seed: u8) -> HashX {
        chain.coin().hashx_from_script(&p2pkh_script(seed))
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn indexes_spends_and_outputs() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(1, &p2pkh_script(1));
        let coinbase = chain.coinbase_outpoint(1);
        let tx = spend(&[coinbase], &[(p2pkh_script(2), SUBSIDY - 1000), (op_return_script(b"hi"), 0)]);
        let txid = tx.txid();
        chain.add_block(&p2pkh_script(3), vec![tx]);

        let mut h = harness(&chain, ProcessorConfig::default());
        assert_eq!(h.processor.catch_up().await.unwrap(), 2);
        assert_eq!(h.db.height(), Some(2));
        assert_eq!(h.db.tx_count(), 4);

        assert!(h.db.utxos(&hashx(&chain, 1)).unwrap().is_empty());
        let h1_history = h.db.history(&hashx(&chain, 1), 10).unwrap();
        assert_eq!(h1_history, vec![(coinbase.hash, 1), (txid, 2)]);
        let utxos = h.db.utxos(&hashx(&chain, 2)).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!((utxos[0].tx_hash, utxos[0].height, utxos[0].value), (txid, 2, SUBSIDY - 1000));

        // The OP_RETURN output is not indexed.
        let op_return = chain.coin().hashx_from_script(&op_return_script(b"hi"));
        assert!(h.db.history(&op_return, 10).unwrap().is_empty());
        assert_eq!(h.store.len(Table::Utxo), 3);
    }

    #[tokio::test]
    async fn spend_within_block_and_across_flushes() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(1, &p2pkh_script(1));
        let a = spend(&[chain.coinbase_outpoint(1)], &[(p2pkh_script(2), 100)]);
        let b = spend(&[OutPoint::new(a.txid(), 0)], &[(p2pkh_script(3), 90)]);
        chain.add_block(&p2pkh_script(4), vec![a.clone(), b.clone()]);
        let c = spend(&[OutPoint::new(b.txid(), 0)], &[(p2pkh_script(5), 80)]);
        chain.add_block(&p2pkh_script(4), vec![c.clone()]);

        let config = ProcessorConfig { flush_interval: 1, ..ProcessorConfig::default() };
        let mut h = harness(&chain, config);
        h.processor.catch_up().await.unwrap();

        assert!(h.db.utxos(&hashx(&chain, 2)).unwrap().is_empty());
        assert!(h.db.utxos(&hashx(&chain, 3)).unwrap().is_empty());
        assert_eq!(h.db.utxos(&hashx(&chain, 5)).unwrap().len(), 1);
        // a and b both touch hashX 2 and 3 respectively; one entry per tx.
        assert_eq!(h.db.history(&hashx(&chain, 2), 10).unwrap(), vec![(a.txid(), 2), (b.txid(), 2)]);
        assert_eq!(h.db.history(&hashx(&chain, 3), 10).unwrap(), vec![(b.txid(), 2), (c.txid(), 3)]);
    }

    #[tokio::test]
    async fn missing_utxo_is_fatal() {
        let mut chain = ChainBuilder::new();
        let bogus = spend(&[OutPoint::new(Hash256([9; 32]), 0)], &[(p2pkh_script(2), 1)]);
        chain.add_block(&p2pkh_script(1), vec![bogus]);
        let mut h = harness(&chain, ProcessorConfig::default());
        let err = h.processor.catch_up().await.unwrap_err();
        assert!(matches!(err, IndexError::ChainState(ChainStateError::MissingUtxo(_))));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn wrong_genesis_is_rejected() {
        let chain = ChainBuilder::new();
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(IndexDb::open(store, Coin::regtest(), 65_535).unwrap());
        let mut processor = BlockProcessor::new(
            db,
            Arc::new(chain.daemon()),
            Arc::new(Notifications::new()),
            ProcessorConfig::default(),
        );
        let err = processor.advance().await.unwrap_err();
        assert!(matches!(err, IndexError::ChainState(ChainStateError::GenesisMismatch { .. })));
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn flushes_by_interval_while_syncing() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(9, &p2pkh_script(1));
        let config = ProcessorConfig { flush_interval: 4, fetch_batch: 100, ..ProcessorConfig::default() };
        let mut h = harness(&chain, config);
        h.daemon.truncate(6);
        assert_eq!(h.processor.advance().await.unwrap(), Advance::Connected(7));
        // Caught up at 6: everything is flushed.
        assert_eq!(h.db.height(), Some(6));
        assert!(!h.db.flush_state().first_sync);

        chain.feed(&h.daemon, 7);
        h.processor.catch_up().await.unwrap();
        assert_eq!(h.db.height(), Some(9));
    }

    #[tokio::test]
    async fn unflushed_blocks_are_not_visible() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(3, &p2pkh_script(1));
        let config = ProcessorConfig { flush_interval: 100, fetch_batch: 2, ..ProcessorConfig::default() };
        let mut h = harness(&chain, config);
        assert_eq!(h.processor.advance().await.unwrap(), Advance::Connected(2));
        assert_eq!(h.processor.height(), Some(1));
        assert_eq!(h.db.height(), None);
        h.processor.catch_up().await.unwrap();
        assert_eq!(h.db.height(), Some(3));
    }

    #[tokio::test]
    async fn transient_daemon_errors_surface_as_transient() {
        let chain = ChainBuilder::new();
        let mut h = harness(&chain, ProcessorConfig::default());
        h.daemon.fail_next(1);
        let err = h.processor.advance().await.unwrap_err();
        assert!(err.is_transient());
        h.processor.catch_up().await.unwrap();
        assert_eq!(h.db.height(), Some(0));
    }

    #[tokio::test]
    async fn announces_blocks_after_first_catch_up() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(2, &p2pkh_script(1));
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(IndexDb::open(store, chain.coin(), 65_535).unwrap());
        let daemon = Arc::new(chain.daemon());
        let notifications = Arc::new(Notifications::new());
        let mut events = notifications.subscribe();
        let mut processor =
            BlockProcessor::new(db, daemon.clone(), notifications.clone(), ProcessorConfig::default());
        let mut synced = processor.synced();

        processor.catch_up().await.unwrap();
        assert_eq!(*synced.borrow_and_update(), Some(2));
        let start = events.try_recv().unwrap();
        assert_eq!(start.height, 2);
        assert!(start.touched.is_empty());

        chain.add_empty_blocks(1, &p2pkh_script(7));
        chain.feed(&daemon, 3);
        processor.catch_up().await.unwrap();
        // Held back until the mempool has seen height 3.
        assert!(events.try_recv().is_err());
        notifications.on_mempool(HashSet::new(), 3);
        let event = events.try_recv().unwrap();
        assert_eq!(event.height, 3);
        assert!(event.touched.contains(&hashx(&chain, 7)));
    }

    // ------------------------------------------------------------------
    // Reorgs
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn reorg_to_longer_branch() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(4, &p2pkh_script(1));
        let mut h = harness(&chain, ProcessorConfig::default());
        h.processor.catch_up().await.unwrap();

        let mut fork = chain.fork_at(2, 9);
        fork.add_empty_blocks(3, &p2pkh_script(2));
        h.daemon.truncate(2);
        fork.feed(&h.daemon, 3);

        assert_eq!(h.processor.advance().await.unwrap(), Advance::Reorged { fork: 2, undone: 2 });
        h.processor.catch_up().await.unwrap();
        assert_eq!(h.db.height(), Some(5));
        assert_eq!(h.db.tip(), fork.tip_hash());
        assert_eq!(h.db.utxos(&hashx(&chain, 1)).unwrap().len(), 2);
        assert_eq!(h.db.utxos(&hashx(&chain, 2)).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn reorg_event_carries_the_fork() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(4, &p2pkh_script(1));
        let db = Arc::new(IndexDb::open(Arc::new(MemoryStore::new()), chain.coin(), 65_535).unwrap());
        let daemon = Arc::new(chain.daemon());
        let notifications = Arc::new(Notifications::new());
        let mut events = notifications.subscribe();
        let mut processor =
            BlockProcessor::new(db, daemon.clone(), notifications.clone(), ProcessorConfig::default());
        processor.catch_up().await.unwrap();
        assert_eq!(events.try_recv().unwrap().reorg_fork, None);

        let mut fork = chain.fork_at(2, 9);
        fork.add_empty_blocks(3, &p2pkh_script(2));
        daemon.truncate(2);
        fork.feed(&daemon, 3);
        processor.catch_up().await.unwrap();
        notifications.on_mempool(HashSet::new(), 5);

        let event = events.try_recv().unwrap();
        assert_eq!(event.height, 5);
        assert_eq!(event.reorg_fork, Some(2));
        assert!(event.touched.contains(&hashx(&chain, 1)));
        assert!(event.touched.contains(&hashx(&chain, 2)));
    }

    #[tokio::test]
    async fn reorg_to_shorter_branch() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(4, &p2pkh_script(1));
        let mut h = harness(&chain, ProcessorConfig::default());
        h.processor.catch_up().await.unwrap();

        let mut fork = chain.fork_at(1, 3);
        fork.add_empty_blocks(1, &p2pkh_script(2));
        h.daemon.truncate(1);
        fork.feed(&h.daemon, 2);

        h.processor.catch_up().await.unwrap();
        assert_eq!(h.db.height(), Some(2));
        assert_eq!(h.db.tip(), fork.tip_hash());
        assert_eq!(h.db.history(&hashx(&chain, 1), 100).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn forced_reorg_resyncs_the_same_blocks() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(5, &p2pkh_script(1));
        let mut h = harness(&chain, ProcessorConfig::default());
        let handle = h.processor.reorg_handle();
        assert_eq!(handle.request(2), Err(ReorgRequestError::NotSynced));

        h.processor.catch_up().await.unwrap();
        assert_eq!(
            handle.request(chain.coin().reorg_limit + 1),
            Err(ReorgRequestError::TooDeep { requested: chain.coin().reorg_limit + 1, limit: chain.coin().reorg_limit })
        );
        handle.request(2).unwrap();
        h.processor.take_reorg_requests(None).unwrap();
        assert_eq!(h.db.height(), Some(3));
        assert_eq!(h.db.utxos(&hashx(&chain, 1)).unwrap().len(), 3);

        h.processor.catch_up().await.unwrap();
        assert_eq!(h.db.height(), Some(5));
        assert_eq!(h.db.tip(), chain.tip_hash());
        assert_eq!(h.db.utxos(&hashx(&chain, 1)).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn forced_reorg_is_announced_to_sessions() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(4, &p2pkh_script(1));
        let db = Arc::new(IndexDb::open(Arc::new(MemoryStore::new()), chain.coin(), 65_535).unwrap());
        let notifications = Arc::new(Notifications::new());
        let mut events = notifications.subscribe();
        let mut processor =
            BlockProcessor::new(db, Arc::new(chain.daemon()), notifications.clone(), ProcessorConfig::default());
        processor.catch_up().await.unwrap();
        events.try_recv().unwrap();

        processor.reorg_handle().request(1).unwrap();
        processor.take_reorg_requests(None).unwrap();
        processor.catch_up().await.unwrap();
        notifications.on_mempool(HashSet::new(), 4);
        let event = events.try_recv().unwrap();
        assert_eq!((event.height, event.reorg_fork), (4, Some(3)));
    }
}
