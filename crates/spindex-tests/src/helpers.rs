//! Shared helpers: planned chains, index snapshots and one-shot indexing.

use std::collections::BTreeMap;
use std::sync::Arc;

use spindex_core::error::IndexError;
use spindex_core::store::{MemoryStore, Table, TableMap};
use spindex_core::types::{Hash256, HashX, OutPoint};
use spindex_node_lib::block_processor::{BlockProcessor, ProcessorConfig};
use spindex_node_lib::daemon::MemoryDaemon;
use spindex_node_lib::db::IndexDb;
use spindex_node_lib::notifications::Notifications;
use spindex_node_lib::testkit::{op_return_script, p2pkh_script, spend, ChainBuilder, SUBSIDY};

/// Fee taken by every planned spend.
pub const FEE: u64 = 1_000;

/// One transaction of a [`BlockPlan`].
#[derive(Debug, Clone)]
pub struct TxPlan {
    /// Picks into the pool of unspent outputs, taken modulo its size.
    pub inputs: Vec<usize>,
    /// Seeds of the `p2pkh_script`s paid.
    pub payees: Vec<u8>,
    /// Add a data-carrier output as well.
    pub op_return: bool,
}

/// A block: the coinbase payee's seed and the spends that follow it.
#[derive(Debug, Clone)]
pub struct BlockPlan {
    pub miner: u8,
    pub txs: Vec<TxPlan>,
}

/// A [`ChainBuilder`] together with its spendable outputs.
#[derive(Debug, Clone)]
pub struct PlannedChain {
    pub chain: ChainBuilder,
    pool: Vec<(OutPoint, u64)>,
}

impl Default for PlannedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl PlannedChain {
    /// Just the genesis block, whose coinbase is never spent.
    pub fn new() -> Self {
        Self { chain: ChainBuilder::new(), pool: Vec::new() }
    }

    /// A copy that will build blocks distinct from this chain's.
    pub fn fork(&self, tag: u8) -> Self {
        Self { chain: self.chain.fork_at(self.chain.height(), tag), pool: self.pool.clone() }
    }

    pub fn unspent(&self) -> usize {
        self.pool.len()
    }

    /// Append one block per plan entry.
    pub fn extend(&mut self, plans: &[BlockPlan]) {
        for plan in plans {
            self.add_block(plan);
        }
    }

    pub fn add_block(&mut self, plan: &BlockPlan) {
        let mut txs = Vec::new();
        for tx_plan in &plan.txs {
            let mut inputs = Vec::new();
            let mut total = 0u64;
            for pick in &tx_plan.inputs {
                if self.pool.is_empty() {
                    break;
                }
                let (outpoint, value) = self.pool.swap_remove(pick % self.pool.len());
                inputs.push(outpoint);
                total += value;
            }
            if inputs.is_empty() {
                continue;
            }
            let available = total.saturating_sub(FEE);
            let payees = if tx_plan.payees.is_empty() { vec![0] } else { tx_plan.payees.clone() };
            let share = available / payees.len() as u64;
            let mut outputs: Vec<(Vec<u8>, u64)> = if share == 0 {
                vec![(p2pkh_script(payees[0]), available)]
            } else {
                payees.iter().map(|seed| (p2pkh_script(*seed), share)).collect()
            };
            if tx_plan.op_return {
                outputs.push((op_return_script(b"spindex"), 0));
            }
            let tx = spend(&inputs, &outputs);
            let txid = tx.txid();
            // Later spends in the same block may use these outputs.
            for (vout, (script, value)) in outputs.iter().enumerate() {
                if script[0] != 0x6a {
                    self.pool.push((OutPoint::new(txid, vout as u32), *value));
                }
            }
            txs.push(tx);
        }
        self.chain.add_block(&p2pkh_script(plan.miner), txs);
        let height = self.chain.height();
        self.pool.push((self.chain.coinbase_outpoint(height), SUBSIDY));
    }
}

/// Blocks that move coins around a handful of payees.
pub fn busy_blocks(count: u32, salt: u8) -> Vec<BlockPlan> {
    (0..count)
        .map(|i| {
            let i = i as u8;
            BlockPlan {
                miner: salt.wrapping_add(i),
                txs: vec![
                    TxPlan { inputs: vec![usize::from(i)], payees: vec![1, salt, 3], op_return: i % 3 == 0 },
                    TxPlan { inputs: vec![usize::from(i) * 7, 5], payees: vec![2], op_return: false },
                ],
            }
        })
        .collect()
}

/// Everything in an index that must not depend on how it was built.
///
/// Undo records and flush metadata are excluded. History is compared
/// per hashX rather than per row, since row boundaries follow flushes.
#[derive(Debug, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub height: Option<u32>,
    pub tip: Hash256,
    pub tx_count: u64,
    pub tables: BTreeMap<&'static str, TableMap>,
    pub histories: BTreeMap<HashX, Vec<u64>>,
}

pub fn snapshot(store: &MemoryStore, db: &IndexDb) -> Result<IndexSnapshot, IndexError> {
    let mut tables = BTreeMap::new();
    for table in [Table::Headers, Table::TxCounts, Table::TxHashes, Table::Utxo, Table::HashXLookup] {
        tables.insert(table.name(), store.dump(table));
    }
    let mut histories = BTreeMap::new();
    for key in store.dump(Table::History).keys() {
        let hashx = HashX::from_prefix(key)?;
        if !histories.contains_key(&hashx) {
            histories.insert(hashx, db.history_txnums(&hashx)?);
        }
    }
    Ok(IndexSnapshot { height: db.height(), tip: db.tip(), tx_count: db.tx_count(), tables, histories })
}

/// An index over a fresh in-memory store.
pub struct Indexed {
    pub store: Arc<MemoryStore>,
    pub db: Arc<IndexDb>,
    pub daemon: Arc<MemoryDaemon>,
    pub processor: BlockProcessor,
}

impl Indexed {
    /// An empty index following `daemon`.
    pub fn new(chain: &ChainBuilder, daemon: Arc<MemoryDaemon>, config: ProcessorConfig) -> Result<Self, IndexError> {
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(IndexDb::open(store.clone(), chain.coin(), 65_535)?);
        let processor = BlockProcessor::new(db.clone(), daemon.clone(), Arc::new(Notifications::new()), config);
        Ok(Self { store, db, daemon, processor })
    }

    /// Reopen the same store with a new processor, dropping unflushed state.
    pub fn restart(self, chain: &ChainBuilder, config: ProcessorConfig) -> Result<Self, IndexError> {
        let Self { store, daemon, .. } = self;
        let db = Arc::new(IndexDb::open(store.clone(), chain.coin(), 65_535)?);
        let processor = BlockProcessor::new(db.clone(), daemon.clone(), Arc::new(Notifications::new()), config);
        Ok(Self { store, db, daemon, processor })
    }

    pub fn snapshot(&self) -> Result<IndexSnapshot, IndexError> {
        snapshot(&self.store, &self.db)
    }
}

/// Index all of `chain` in one flush.
pub async fn index_one_pass(chain: &ChainBuilder) -> Result<IndexSnapshot, IndexError> {
    let mut indexed = Indexed::new(chain, Arc::new(chain.daemon()), ProcessorConfig::default())?;
    indexed.processor.catch_up().await?;
    indexed.snapshot()
}

/// Flush after every block, fetching `fetch_batch` blocks at a time.
pub fn flush_every_block(fetch_batch: u32) -> ProcessorConfig {
    ProcessorConfig { flush_interval: 1, fetch_batch, ..ProcessorConfig::default() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_spends_consume_the_pool() {
        let mut planned = PlannedChain::new();
        planned.extend(&busy_blocks(4, 10));
        assert_eq!(planned.chain.height(), 4);
        // Every block adds a coinbase; spends replace their inputs with outputs.
        assert!(planned.unspent() > 4);
        let block = planned.chain.block(2);
        assert_eq!(block.transactions.len(), 3);
    }

    #[test]
    fn forks_diverge() {
        let mut planned = PlannedChain::new();
        planned.extend(&busy_blocks(2, 1));
        let mut a = planned.fork(1);
        let mut b = planned.fork(2);
        a.extend(&busy_blocks(1, 5));
        b.extend(&busy_blocks(1, 5));
        assert_eq!(a.chain.block(2).hash(), b.chain.block(2).hash());
        assert_ne!(a.chain.tip_hash(), b.chain.tip_hash());
    }
}
