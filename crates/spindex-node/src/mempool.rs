//! Mirror of the daemon's mempool.
//!
//! The tracker polls the daemon for its mempool txids, fetches and decodes
//! new transactions and resolves their inputs against the flushed UTXO set
//! or against other mempool transactions. It provides:
//! - per-hashX balance deltas, transaction summaries and unconfirmed UTXOs
//! - the prevouts mempool transactions spend, to hide them from listings
//! - a compact fee histogram for `mempool.get_fee_histogram`
//!
//! A refresh only runs when the daemon and the index agree on the height, so
//! every resolved input is consistent with one flushed chain state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use spindex_core::error::IndexError;
use spindex_core::traits::Daemon;
use spindex_core::types::{Hash256, HashX, OutPoint, Transaction};

use crate::db::{IndexDb, UtxoInfo};
use crate::notifications::Notifications;

/// Initial size of a fee histogram bucket in vbytes.
pub const HISTOGRAM_BIN_SIZE: f64 = 100_000.0;

/// Tuning for [`MempoolTracker`].
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    pub refresh_interval: Duration,
    pub histogram_interval: Duration,
    pub log_status_interval: Duration,
    /// Raw transactions requested per daemon call.
    pub fetch_chunk: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            histogram_interval: Duration::from_secs(30),
            log_status_interval: Duration::from_secs(60),
            fetch_chunk: 200,
        }
    }
}

/// An accepted mempool transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolTx {
    pub hash: Hash256,
    pub prevouts: Vec<OutPoint>,
    /// `(hashX, value)` of each spent output, parallel to `prevouts`.
    pub in_pairs: Vec<(HashX, u64)>,
    /// One entry per output; `None` for unspendable outputs.
    pub out_pairs: Vec<Option<(HashX, u64)>>,
    pub fee: u64,
    pub vsize: usize,
}

impl MempoolTx {
    fn touched(&self) -> impl Iterator<Item = HashX> + '_ {
        self.in_pairs.iter().map(|(h, _)| *h).chain(self.out_pairs.iter().flatten().map(|(h, _)| *h))
    }
}

/// What a session needs to list a mempool transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSummary {
    pub hash: Hash256,
    pub fee: u64,
    pub has_unconfirmed_inputs: bool,
}

#[derive(Default)]
struct MempoolState {
    txs: HashMap<Hash256, MempoolTx>,
    hashxs: HashMap<HashX, HashSet<Hash256>>,
    /// Prevout → txid of the mempool transaction spending it.
    spends: HashMap<OutPoint, Hash256>,
    histogram: Vec<(f64, usize)>,
}

impl MempoolState {
    fn insert(&mut self, tx: MempoolTx, touched: &mut HashSet<HashX>) {
        for hashx in tx.touched() {
            self.hashxs.entry(hashx).or_default().insert(tx.hash);
            touched.insert(hashx);
        }
        for prevout in &tx.prevouts {
            self.spends.insert(*prevout, tx.hash);
        }
        self.txs.insert(tx.hash, tx);
    }

    fn remove(&mut self, hash: &Hash256, touched: &mut HashSet<HashX>) {
        let Some(tx) = self.txs.remove(hash) else {
            return;
        };
        for hashx in tx.touched() {
            touched.insert(hashx);
            if let Some(set) = self.hashxs.get_mut(&hashx) {
                set.remove(hash);
                if set.is_empty() {
                    self.hashxs.remove(&hashx);
                }
            }
        }
        for prevout in &tx.prevouts {
            if self.spends.get(prevout) == Some(hash) {
                self.spends.remove(prevout);
            }
        }
    }
}

/// Keeps the local view of the daemon's mempool.
pub struct MempoolTracker {
    db: Arc<IndexDb>,
    daemon: Arc<dyn Daemon>,
    notifications: Arc<Notifications>,
    config: MempoolConfig,
    state: RwLock<MempoolState>,
}

impl MempoolTracker {
    pub fn new(
        db: Arc<IndexDb>,
        daemon: Arc<dyn Daemon>,
        notifications: Arc<Notifications>,
        config: MempoolConfig,
    ) -> Self {
        Self { db, daemon, notifications, config, state: RwLock::new(MempoolState::default()) }
    }

    pub fn len(&self) -> usize {
        self.state.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().txs.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.state.read().txs.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<MempoolTx> {
        self.state.read().txs.get(hash).cloned()
    }

    /// Synchronise with the daemon once.
    ///
    /// Returns the height refreshed at, or `None` when the round was skipped
    /// because the daemon and the index are at different heights.
    pub async fn refresh(&self) -> Result<Option<u32>, IndexError> {
        let daemon_height = self.daemon.height().await?;
        if self.db.height() != Some(daemon_height) {
            debug!(daemon_height, indexed = ?self.db.height(), "mempool refresh deferred");
            return Ok(None);
        }
        let hashes: HashSet<Hash256> = self.daemon.mempool_hashes().await?.into_iter().collect();

        let (vanished, new): (Vec<Hash256>, Vec<Hash256>) = {
            let state = self.state.read();
            let vanished = state.txs.keys().filter(|h| !hashes.contains(h)).copied().collect();
            let new = hashes.iter().filter(|h| !state.txs.contains_key(h)).copied().collect();
            (vanished, new)
        };

        let fetched = self.fetch(&new).await?;
        // A block may have been flushed while fetching.
        if self.db.height() != Some(daemon_height) {
            return Ok(None);
        }

        let mut touched = HashSet::new();
        {
            let mut state = self.state.write();
            for hash in &vanished {
                state.remove(hash, &mut touched);
            }
        }
        let accepted = self.accept(fetched)?;
        {
            let mut state = self.state.write();
            for tx in accepted {
                state.insert(tx, &mut touched);
            }
        }
        if !vanished.is_empty() || !touched.is_empty() {
            debug!(removed = vanished.len(), touched = touched.len(), height = daemon_height, "mempool refreshed");
        }
        self.notifications.on_mempool(touched, daemon_height);
        Ok(Some(daemon_height))
    }

    async fn fetch(&self, hashes: &[Hash256]) -> Result<HashMap<Hash256, Transaction>, IndexError> {
        let mut txs = HashMap::with_capacity(hashes.len());
        for chunk in hashes.chunks(self.config.fetch_chunk.max(1)) {
            let raws = self.daemon.raw_transactions(chunk).await?;
            for (hash, raw) in chunk.iter().zip(raws) {
                // Gone from the daemon since the txid list was read.
                let Some(raw) = raw else { continue };
                match Transaction::from_bytes(&raw) {
                    Ok(tx) => {
                        txs.insert(*hash, tx);
                    }
                    Err(e) => warn!(tx = %hash, error = %e, "undecodable mempool transaction"),
                }
            }
        }
        Ok(txs)
    }

    /// Resolve inputs of `pending`, deferring transactions whose parents
    /// are themselves pending until those are accepted.
    fn accept(&self, mut pending: HashMap<Hash256, Transaction>) -> Result<Vec<MempoolTx>, IndexError> {
        let mut accepted: HashMap<Hash256, MempoolTx> = HashMap::new();
        loop {
            let waiting: HashSet<Hash256> = pending.keys().copied().collect();
            let mut deferred = HashMap::new();
            let mut progress = false;
            for (hash, tx) in pending {
                match self.resolve(hash, &tx, &accepted, &waiting)? {
                    Resolved::Accepted(entry) => {
                        accepted.insert(hash, entry);
                        progress = true;
                    }
                    Resolved::Deferred => {
                        deferred.insert(hash, tx);
                    }
                    Resolved::Missing(prevout) => {
                        debug!(tx = %hash, prevout = %prevout, "mempool transaction spends unknown output");
                    }
                }
            }
            pending = deferred;
            if pending.is_empty() || !progress {
                break;
            }
        }
        for hash in pending.keys() {
            error!(tx = %hash, "mempool transaction dropped: parents never resolved");
        }
        Ok(accepted.into_values().collect())
    }

    fn resolve(
        &self,
        hash: Hash256,
        tx: &Transaction,
        accepted: &HashMap<Hash256, MempoolTx>,
        waiting: &HashSet<Hash256>,
    ) -> Result<Resolved, IndexError> {
        let prevouts: Vec<OutPoint> = tx.inputs.iter().map(|input| input.prev_out).collect();
        let mut in_pairs: Vec<Option<(HashX, u64)>> = vec![None; prevouts.len()];
        let mut confirmed = Vec::new();
        {
            let state = self.state.read();
            for (i, prevout) in prevouts.iter().enumerate() {
                let parent = state.txs.get(&prevout.hash).or_else(|| accepted.get(&prevout.hash));
                match parent {
                    Some(parent) => match parent.out_pairs.get(prevout.index as usize).copied().flatten() {
                        Some(pair) => in_pairs[i] = Some(pair),
                        None => return Ok(Resolved::Missing(*prevout)),
                    },
                    None if waiting.contains(&prevout.hash) => return Ok(Resolved::Deferred),
                    None => confirmed.push(i),
                }
            }
        }
        let lookups: Vec<OutPoint> = confirmed.iter().map(|&i| prevouts[i]).collect();
        for (&i, found) in confirmed.iter().zip(self.db.lookup_utxos(&lookups)?) {
            match found {
                Some(pair) => in_pairs[i] = Some(pair),
                None => return Ok(Resolved::Missing(prevouts[i])),
            }
        }
        let in_pairs: Vec<(HashX, u64)> = in_pairs.into_iter().flatten().collect();

        let coin = self.db.coin();
        let out_pairs: Vec<Option<(HashX, u64)>> = tx
            .outputs
            .iter()
            .map(|out| (!out.is_unspendable()).then(|| (coin.hashx_from_script(&out.script_pubkey), out.value)))
            .collect();
        let value_in: u64 = in_pairs.iter().map(|(_, v)| v).sum();
        let value_out: u64 = tx.outputs.iter().map(|o| o.value).sum();
        Ok(Resolved::Accepted(MempoolTx {
            hash,
            prevouts,
            in_pairs,
            out_pairs,
            fee: value_in.saturating_sub(value_out),
            vsize: tx.vsize(),
        }))
    }

    /// Net unconfirmed change to the balance of `hashx`.
    pub fn balance_delta(&self, hashx: &HashX) -> i64 {
        let state = self.state.read();
        let Some(hashes) = state.hashxs.get(hashx) else {
            return 0;
        };
        let mut delta = 0i64;
        for tx in hashes.iter().filter_map(|h| state.txs.get(h)) {
            delta -= tx.in_pairs.iter().filter(|(h, _)| h == hashx).map(|(_, v)| *v as i64).sum::<i64>();
            delta += tx.out_pairs.iter().flatten().filter(|(h, _)| h == hashx).map(|(_, v)| *v as i64).sum::<i64>();
        }
        delta
    }

    /// Mempool transactions touching `hashx`, those with confirmed inputs
    /// only first, then by hash.
    pub fn transaction_summaries(&self, hashx: &HashX) -> Vec<TxSummary> {
        let state = self.state.read();
        let Some(hashes) = state.hashxs.get(hashx) else {
            return Vec::new();
        };
        let mut summaries: Vec<TxSummary> = hashes
            .iter()
            .filter_map(|h| state.txs.get(h))
            .map(|tx| TxSummary {
                hash: tx.hash,
                fee: tx.fee,
                has_unconfirmed_inputs: tx.prevouts.iter().any(|p| state.txs.contains_key(&p.hash)),
            })
            .collect();
        summaries.sort_by(|a, b| (a.has_unconfirmed_inputs, a.hash).cmp(&(b.has_unconfirmed_inputs, b.hash)));
        summaries
    }

    /// Outputs to `hashx` created by mempool transactions, spent or not.
    pub fn unordered_utxos(&self, hashx: &HashX) -> Vec<UtxoInfo> {
        let state = self.state.read();
        let Some(hashes) = state.hashxs.get(hashx) else {
            return Vec::new();
        };
        let mut utxos = Vec::new();
        for tx in hashes.iter().filter_map(|h| state.txs.get(h)) {
            for (pos, pair) in tx.out_pairs.iter().enumerate() {
                if let Some((h, value)) = pair {
                    if h == hashx {
                        utxos.push(UtxoInfo { tx_hash: tx.hash, tx_pos: pos as u32, height: 0, value: *value });
                    }
                }
            }
        }
        utxos
    }

    /// Drop the UTXOs some mempool transaction spends.
    pub fn retain_unspent(&self, utxos: &mut Vec<UtxoInfo>) {
        let state = self.state.read();
        utxos.retain(|u| !state.spends.contains_key(&OutPoint::new(u.tx_hash, u.tx_pos)));
    }

    /// The cached fee histogram as `(fee_rate, vsize)` pairs, highest rate first.
    pub fn fee_histogram(&self) -> Vec<(f64, usize)> {
        self.state.read().histogram.clone()
    }

    /// Recompute the cached fee histogram.
    pub fn update_histogram(&self) {
        let mut state = self.state.write();
        let mut by_rate: BTreeMap<OrderedFloat<f64>, usize> = BTreeMap::new();
        for tx in state.txs.values() {
            *by_rate.entry(OrderedFloat(fee_rate(tx.fee, tx.vsize))).or_default() += tx.vsize;
        }
        state.histogram = compress_histogram(&by_rate, HISTOGRAM_BIN_SIZE);
    }

    /// Poll the daemon until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        let mut histogram = tokio::time::interval(self.config.histogram_interval);
        let mut status = tokio::time::interval(self.config.log_status_interval);
        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh().await {
                        if e.is_transient() {
                            warn!(error = %e, "mempool refresh failed");
                        } else {
                            error!(error = %e, "mempool refresh failed");
                        }
                    }
                }
                _ = histogram.tick() => self.update_histogram(),
                _ = status.tick() => {
                    let (txs, hashxs) = {
                        let state = self.state.read();
                        (state.txs.len(), state.hashxs.len())
                    };
                    info!(txs, hashxs, "mempool status");
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("mempool tracker stopped");
    }
}

enum Resolved {
    Accepted(MempoolTx),
    /// A parent is still waiting to be accepted.
    Deferred,
    Missing(OutPoint),
}

/// Fee rate in sat/vB, floored to one decimal place.
pub fn fee_rate(fee: u64, vsize: usize) -> f64 {
    if vsize == 0 {
        return 0.0;
    }
    (fee as f64 * 10.0 / vsize as f64).floor() / 10.0
}

/// Group `by_rate` into buckets of roughly `bin_size` vbytes, growing 10%
/// per bucket, walking from the highest rate down.
pub fn compress_histogram(by_rate: &BTreeMap<OrderedFloat<f64>, usize>, bin_size: f64) -> Vec<(f64, usize)> {
    let mut bin_size = bin_size;
    let mut compact = Vec::new();
    let mut cum_size = 0usize;
    let mut prev_rate: Option<f64> = None;
    for (rate, &size) in by_rate.iter().rev() {
        // A large lump at one rate closes the pending bucket first.
        if let Some(prev) = prev_rate.filter(|_| size as f64 > 2.0 * bin_size && cum_size > 0) {
            compact.push((prev, cum_size));
            cum_size = 0;
            bin_size *= 1.1;
        }
        cum_size += size;
        if cum_size as f64 > bin_size {
            compact.push((rate.0, cum_size));
            cum_size = 0;
            bin_size *= 1.1;
        }
        prev_rate = Some(rate.0);
    }
    compact
}
