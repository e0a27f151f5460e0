//! Synthetic chains for tests and benches.
//!
//! [`ChainBuilder`] assembles well-formed blocks (no proof of work) whose
//! coinbases pay to caller-chosen scripts. Its [`Coin`] is regtest with the
//! builder's own genesis hash, so an index over it opens cleanly.
//! [`TestIndex`] wires a chain to an in-memory index, daemon and mempool.

use std::sync::Arc;

use spindex_core::coin::Coin;
use spindex_core::error::IndexError;
use spindex_core::merkle::merkle_root;
use spindex_core::store::MemoryStore;
use spindex_core::types::{Block, BlockHeader, Hash256, HashX, OutPoint, Transaction, TxIn, TxOut};
use spindex_network::{CostConfig, CostThrottle};

use crate::block_processor::{BlockProcessor, ProcessorConfig, ReorgHandle};
use crate::daemon::MemoryDaemon;
use crate::db::IndexDb;
use crate::mempool::{MempoolConfig, MempoolTracker};
use crate::notifications::Notifications;
use crate::session::{SessionEnv, SessionSettings};

/// Block subsidy paid by every synthetic coinbase.
pub const SUBSIDY: u64 = 50 * 100_000_000;

/// A pay-to-pubkey-hash script with a 20-byte hash filled with `seed`.
pub fn p2pkh_script(seed: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[seed; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// A data-carrier output script.
pub fn op_return_script(data: &[u8]) -> Vec<u8> {
    let mut script = vec![0x6a, data.len() as u8];
    script.extend_from_slice(data);
    script
}

/// A transaction spending `inputs` into `outputs` of `(script, value)`.
pub fn spend(inputs: &[OutPoint], outputs: &[(Vec<u8>, u64)]) -> Transaction {
    Transaction {
        version: 2,
        inputs: inputs
            .iter()
            .map(|prev_out| TxIn { prev_out: *prev_out, script_sig: vec![0x51], sequence: 0xffff_fffe })
            .collect(),
        outputs: outputs.iter().map(|(script, value)| TxOut { value: *value, script_pubkey: script.clone() }).collect(),
        lock_time: 0,
        witnesses: Vec::new(),
    }
}

/// Builds a chain of synthetic blocks.
#[derive(Clone, Debug)]
pub struct ChainBuilder {
    blocks: Vec<Block>,
    genesis_hash: Hash256,
    /// Mixed into coinbases so forks produce distinct blocks.
    tag: u8,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    /// A chain holding only a genesis block paying to `p2pkh_script(0)`.
    pub fn new() -> Self {
        let mut builder = Self { blocks: Vec::new(), genesis_hash: Hash256::ZERO, tag: 0 };
        builder.add_block(&p2pkh_script(0), Vec::new());
        builder.genesis_hash = builder.blocks[0].hash();
        builder
    }

    /// Regtest parameters with this chain's genesis.
    pub fn coin(&self) -> Coin {
        Coin { genesis_hash: self.genesis_hash, ..Coin::regtest() }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, height: u32) -> &Block {
        &self.blocks[height as usize]
    }

    pub fn height(&self) -> u32 {
        self.blocks.len() as u32 - 1
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.blocks[self.blocks.len() - 1].hash()
    }

    /// The coinbase output of the block at `height`.
    pub fn coinbase_outpoint(&self, height: u32) -> OutPoint {
        OutPoint::new(self.blocks[height as usize].transactions[0].txid(), 0)
    }

    fn coinbase(&self, height: u32, script: &[u8]) -> Transaction {
        let mut script_sig = height.to_le_bytes().to_vec();
        script_sig.push(self.tag);
        Transaction {
            version: 1,
            inputs: vec![TxIn { prev_out: OutPoint::null(), script_sig, sequence: 0xffff_ffff }],
            outputs: vec![TxOut { value: SUBSIDY, script_pubkey: script.to_vec() }],
            lock_time: 0,
            witnesses: Vec::new(),
        }
    }

    /// Append a block whose coinbase pays `payout`, followed by `txs`.
    pub fn add_block(&mut self, payout: &[u8], txs: Vec<Transaction>) -> &Block {
        let height = self.blocks.len() as u32;
        let mut transactions = vec![self.coinbase(height, payout)];
        transactions.extend(txs);
        let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        let prev_hash = self.blocks.last().map_or(Hash256::ZERO, Block::hash);
        let header = BlockHeader {
            version: 0x2000_0000,
            prev_hash,
            merkle_root: merkle_root(&txids),
            time: 1_600_000_000 + height * 600,
            bits: 0x207f_ffff,
            nonce: self.tag as u32,
        };
        self.blocks.push(Block { header, transactions });
        &self.blocks[height as usize]
    }

    /// Append `count` blocks with only a coinbase paying `payout`.
    pub fn add_empty_blocks(&mut self, count: u32, payout: &[u8]) {
        for _ in 0..count {
            self.add_block(payout, Vec::new());
        }
    }

    /// A copy of this chain truncated to `height`, producing blocks distinct
    /// from this chain's from then on.
    pub fn fork_at(&self, height: u32, tag: u8) -> Self {
        let mut fork = self.clone();
        fork.blocks.truncate(height as usize + 1);
        fork.tag = tag;
        fork
    }

    /// Push blocks `from..` to `daemon`.
    pub fn feed(&self, daemon: &MemoryDaemon, from: u32) {
        for block in self.blocks.iter().skip(from as usize) {
            daemon.push_block(block);
        }
    }

    /// A daemon serving this whole chain.
    pub fn daemon(&self) -> MemoryDaemon {
        let daemon = MemoryDaemon::new();
        self.feed(&daemon, 0);
        daemon
    }
}

/// A synced index over a [`ChainBuilder`] chain.
pub struct TestIndex {
    pub chain: ChainBuilder,
    pub store: Arc<MemoryStore>,
    pub db: Arc<IndexDb>,
    pub daemon: Arc<MemoryDaemon>,
    pub notifications: Arc<Notifications>,
    pub processor: BlockProcessor,
    pub mempool: Arc<MempoolTracker>,
}

impl TestIndex {
    /// Index all of `chain` and take a first mempool snapshot.
    pub async fn new(chain: ChainBuilder) -> Result<Self, IndexError> {
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(IndexDb::open(store.clone(), chain.coin(), 65_535)?);
        let daemon = Arc::new(chain.daemon());
        let notifications = Arc::new(Notifications::new());
        let processor =
            BlockProcessor::new(db.clone(), daemon.clone(), notifications.clone(), ProcessorConfig::default());
        let mempool = Arc::new(MempoolTracker::new(
            db.clone(),
            daemon.clone(),
            notifications.clone(),
            MempoolConfig::default(),
        ));
        let mut index = Self { chain, store, db, daemon, notifications, processor, mempool };
        index.sync().await?;
        Ok(index)
    }

    /// Catch up with the daemon, then refresh the mempool.
    pub async fn sync(&mut self) -> Result<(), IndexError> {
        self.processor.catch_up().await?;
        self.mempool.refresh().await?;
        Ok(())
    }

    /// Mine a block on the test chain and hand it to the daemon.
    pub fn mine(&mut self, payout: &[u8], txs: Vec<Transaction>) {
        let height = self.chain.height() + 1;
        self.chain.add_block(payout, txs);
        self.chain.feed(&self.daemon, height);
    }

    /// Replace the chain above `fork` with `blocks` new blocks paying
    /// `payout` and hand them to the daemon.
    pub fn reorg(&mut self, fork: u32, tag: u8, blocks: u32, payout: &[u8]) {
        let mut branch = self.chain.fork_at(fork, tag);
        branch.add_empty_blocks(blocks, payout);
        self.daemon.truncate(fork);
        branch.feed(&self.daemon, fork + 1);
        self.chain = branch;
    }

    pub fn reorg_handle(&self) -> ReorgHandle {
        self.processor.reorg_handle()
    }

    pub fn hashx(&self, script: &[u8]) -> HashX {
        self.chain.coin().hashx_from_script(script)
    }

    /// The client-facing script hash of `script`.
    pub fn script_hash(&self, script: &[u8]) -> String {
        self.chain.coin().script_hash_hex(script)
    }

    /// Session state over this index.
    pub fn session_env(&self, cost: CostConfig, settings: SessionSettings) -> Arc<SessionEnv> {
        Arc::new(SessionEnv::new(
            self.db.clone(),
            self.mempool.clone(),
            self.daemon.clone(),
            Arc::new(CostThrottle::new(cost)),
            None,
            settings,
        ))
    }
}
