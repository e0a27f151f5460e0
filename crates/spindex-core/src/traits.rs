//! Trait interfaces between the index and its collaborators.
//!
//! - [`Daemon`]: the full node the index is derived from (spindex-node
//!   implements it over JSON-RPC and provides an in-memory double).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;
use crate::types::Hash256;

/// Version information reported by the daemon.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub version: u64,
    pub subversion: String,
    /// Minimum relay fee in coin units per kB.
    pub relay_fee: f64,
}

/// The full node the index follows.
///
/// Every call may fail transiently (connection loss, warm-up); callers
/// retry. Raw blocks and transactions are returned in wire format.
#[async_trait]
pub trait Daemon: Send + Sync {
    /// Height of the daemon's best chain.
    async fn height(&self) -> Result<u32, DaemonError>;

    /// Hashes of `count` consecutive blocks starting at `first`.
    ///
    /// Stops early at the daemon's tip, so the result may be shorter.
    async fn block_hashes(&self, first: u32, count: u32) -> Result<Vec<Hash256>, DaemonError>;

    /// Raw blocks for the given hashes, in the same order.
    async fn raw_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Vec<u8>>, DaemonError>;

    /// Txids currently in the daemon's mempool.
    async fn mempool_hashes(&self) -> Result<Vec<Hash256>, DaemonError>;

    /// Raw transactions for the given txids. `None` for any the daemon no
    /// longer knows (evicted or confirmed between calls).
    async fn raw_transactions(&self, hashes: &[Hash256]) -> Result<Vec<Option<Vec<u8>>>, DaemonError>;

    /// `getrawtransaction` pass-through: hex string, or the daemon's JSON
    /// object when `verbose`.
    async fn transaction(&self, hash: &Hash256, verbose: bool) -> Result<serde_json::Value, DaemonError>;

    /// Submit a raw transaction (hex). Returns its txid.
    async fn broadcast(&self, raw_hex: &str) -> Result<Hash256, DaemonError>;

    /// Fee estimate in coin units per kB for confirmation within `blocks`.
    /// `None` when the daemon has insufficient data.
    async fn estimate_fee(&self, blocks: u32, mode: Option<&str>) -> Result<Option<f64>, DaemonError>;

    async fn network_info(&self) -> Result<NetworkInfo, DaemonError>;

    /// The daemon URL with any password removed.
    fn logged_url(&self) -> String;

    /// Send later calls to `url`. The current URL stays in use on error.
    fn set_url(&self, url: &str) -> Result<(), DaemonError>;
}
