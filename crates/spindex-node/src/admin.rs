//! Local admin interface.
//!
//! A JSON-RPC server on a loopback port through which an operator inspects
//! and steers a running server: listing sessions, groups and peers,
//! disconnecting or logging sessions, querying the index for a script or
//! address, forcing a reorg, switching daemons and stopping cleanly.
//! `spindex-rpc` is its command-line client.

use std::sync::Arc;
use std::time::Instant;

use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use spindex_core::coin::Coin;
use spindex_core::error::IndexError;
use spindex_core::traits::Daemon;
use spindex_core::types::HashX;
use spindex_network::peers::{Peer, PeerState};

use crate::block_processor::ReorgHandle;
use crate::session::server_subversion;
use crate::session_manager::{SessionManager, SessionSummary};

/// Bad arguments or a refused request.
const BAD_REQUEST: i32 = 1;
/// The index or daemon failed.
const INTERNAL: i32 = 2;

/// History and UTXO lines `query` returns per item unless told otherwise.
pub const DEFAULT_QUERY_LIMIT: usize = 1000;
/// Blocks `reorg` undoes when no count is given.
pub const DEFAULT_REORG_COUNT: u32 = 3;

fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

fn index_error(e: IndexError) -> ErrorObjectOwned {
    rpc_error(INTERNAL, &e.to_string())
}

/// Summary returned by `getinfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoJson {
    pub version: String,
    pub coin: String,
    pub daemon: String,
    pub daemon_height: Option<u32>,
    pub db_height: Option<u32>,
    pub db_tip: String,
    pub tx_count: u64,
    pub mempool_txs: usize,
    pub sessions: usize,
    pub logged_sessions: usize,
    pub subs: usize,
    pub groups: usize,
    pub peers: usize,
    pub uptime_secs: u64,
}

/// One row of `groups`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupJson {
    pub name: String,
    pub sessions: Vec<u64>,
    pub cost: f64,
    pub retained_cost: f64,
}

/// One row of `peers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerJson {
    pub host: String,
    pub ip: Option<String>,
    pub tcp_port: Option<u16>,
    pub ssl_port: Option<u16>,
    pub state: String,
    pub source: String,
    pub failures: u32,
    pub protocol_max: Option<String>,
    pub server_version: Option<String>,
    pub verified_secs_ago: Option<u64>,
}

impl From<&Peer> for PeerJson {
    fn from(peer: &Peer) -> Self {
        let state = match peer.state {
            PeerState::Provisional => "provisional",
            PeerState::Verified => "verified",
            PeerState::Blacklisted { .. } => "blacklisted",
        };
        Self {
            host: peer.host.clone(),
            ip: peer.ip.map(|ip| ip.to_string()),
            tcp_port: peer.ports.tcp_port,
            ssl_port: peer.ports.ssl_port,
            state: state.to_string(),
            source: format!("{:?}", peer.source).to_lowercase(),
            failures: peer.failures,
            protocol_max: peer.features.as_ref().map(|f| f.protocol_max.clone()),
            server_version: peer.features.as_ref().map(|f| f.server_version.clone()),
            verified_secs_ago: peer.last_verified.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// Admin methods.
#[rpc(server)]
pub trait AdminRpc {
    /// Summary of server state.
    #[method(name = "getinfo")]
    async fn getinfo(&self) -> Result<InfoJson, ErrorObjectOwned>;

    /// Connected sessions, oldest first.
    #[method(name = "sessions")]
    async fn sessions(&self) -> Result<Vec<SessionSummary>, ErrorObjectOwned>;

    /// Subnet groups and their costs.
    #[method(name = "groups")]
    async fn groups(&self) -> Result<Vec<GroupJson>, ErrorObjectOwned>;

    /// Every known peer server.
    #[method(name = "peers")]
    async fn peers(&self) -> Result<Vec<PeerJson>, ErrorObjectOwned>;

    /// Queue a peer for verification, e.g. `"electrum.example t50001 s50002"`.
    #[method(name = "add_peer")]
    async fn add_peer(&self, real_name: String) -> Result<String, ErrorObjectOwned>;

    /// Disconnect sessions by id or group name, or `all`.
    #[method(name = "disconnect")]
    async fn disconnect(&self, session_ids: Vec<String>) -> Result<Vec<String>, ErrorObjectOwned>;

    /// Toggle request logging of sessions by id or group name, or `all`,
    /// `none` or `new`.
    #[method(name = "log")]
    async fn log(&self, session_ids: Vec<String>) -> Result<Vec<String>, ErrorObjectOwned>;

    /// History, UTXOs and balance of scripts (hex) or addresses.
    #[method(name = "query")]
    async fn query(&self, items: Vec<String>, limit: Option<usize>) -> Result<Vec<String>, ErrorObjectOwned>;

    /// Undo the last `count` blocks and resync them from the daemon.
    #[method(name = "reorg")]
    async fn reorg(&self, count: Option<u32>) -> Result<String, ErrorObjectOwned>;

    /// Shut the server down cleanly.
    #[method(name = "stop")]
    async fn stop(&self) -> Result<String, ErrorObjectOwned>;

    /// Switch daemons; the configured URL when none is given.
    #[method(name = "daemon_url")]
    async fn daemon_url(&self, daemon_url: Option<String>) -> Result<String, ErrorObjectOwned>;
}

/// Server-side state of the admin interface.
pub struct AdminRpcImpl {
    manager: Arc<SessionManager>,
    reorg: ReorgHandle,
    stop: watch::Sender<bool>,
    configured_daemon_url: String,
    started: Instant,
}

impl AdminRpcImpl {
    pub fn new(
        manager: Arc<SessionManager>,
        reorg: ReorgHandle,
        stop: watch::Sender<bool>,
        configured_daemon_url: String,
    ) -> Self {
        Self { manager, reorg, stop, configured_daemon_url, started: Instant::now() }
    }

    /// Hex is read as a script, anything else as an address.
    fn item_hashx(coin: &Coin, item: &str) -> Option<(String, HashX)> {
        if let Ok(script) = hex::decode(item) {
            return Some((format!("Script: {item}"), coin.hashx_from_script(&script)));
        }
        let script = coin.address_to_script(item).ok()?;
        Some((format!("Address: {item}"), coin.hashx_from_script(&script)))
    }
}

/// `1234567` as `1,234,567`.
fn grouped(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Satoshis as whole coins with eight decimals.
fn coin_value(sats: u64) -> String {
    format!("{}.{:08}", grouped(sats / 100_000_000), sats % 100_000_000)
}

#[async_trait]
impl AdminRpcServer for AdminRpcImpl {
    async fn getinfo(&self) -> Result<InfoJson, ErrorObjectOwned> {
        let env = self.manager.env();
        let sessions = self.manager.sessions();
        Ok(InfoJson {
            version: server_subversion(),
            coin: env.db.coin().name.to_string(),
            daemon: env.daemon.logged_url(),
            daemon_height: env.daemon.height().await.ok(),
            db_height: env.db.height(),
            db_tip: env.db.tip().to_hex(),
            tx_count: env.db.tx_count(),
            mempool_txs: env.mempool.len(),
            sessions: sessions.len(),
            logged_sessions: sessions.iter().filter(|s| s.logging).count(),
            subs: env.subscription_count(),
            groups: env.cost.group_count(),
            peers: env.peers.as_ref().map_or(0, |p| p.peer_count()),
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }

    async fn sessions(&self) -> Result<Vec<SessionSummary>, ErrorObjectOwned> {
        Ok(self.manager.sessions())
    }

    async fn groups(&self) -> Result<Vec<GroupJson>, ErrorObjectOwned> {
        Ok(self
            .manager
            .env()
            .cost
            .groups()
            .into_iter()
            .map(|g| GroupJson { name: g.key.to_string(), sessions: g.sessions, cost: g.cost, retained_cost: g.retained })
            .collect())
    }

    async fn peers(&self) -> Result<Vec<PeerJson>, ErrorObjectOwned> {
        let peers = self.manager.env().peers.as_ref().map(|p| p.peers()).unwrap_or_default();
        Ok(peers.iter().map(PeerJson::from).collect())
    }

    async fn add_peer(&self, real_name: String) -> Result<String, ErrorObjectOwned> {
        let peers = self.manager.env().peers.as_ref().ok_or_else(|| rpc_error(BAD_REQUEST, "peer discovery is off"))?;
        peers.add_named(&real_name).map_err(|e| rpc_error(BAD_REQUEST, &e.to_string()))?;
        Ok(format!("peer '{real_name}' added"))
    }

    async fn disconnect(&self, session_ids: Vec<String>) -> Result<Vec<String>, ErrorObjectOwned> {
        Ok(self.manager.disconnect(&session_ids))
    }

    async fn log(&self, session_ids: Vec<String>) -> Result<Vec<String>, ErrorObjectOwned> {
        Ok(self.manager.toggle_log(&session_ids))
    }

    async fn query(&self, items: Vec<String>, limit: Option<usize>) -> Result<Vec<String>, ErrorObjectOwned> {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let db = &self.manager.env().db;
        let mut lines = Vec::new();
        for item in &items {
            let Some((label, hashx)) = Self::item_hashx(db.coin(), item) else {
                lines.push(format!("Unrecognised: {item}"));
                continue;
            };
            lines.push(label);

            let history = db.history(&hashx, limit).map_err(index_error)?;
            if history.is_empty() {
                lines.push("No history found".to_string());
            }
            for (n, (tx_hash, height)) in history.iter().enumerate() {
                lines.push(format!("History #{}: height {} tx_hash {tx_hash}", grouped(n as u64), grouped(u64::from(*height))));
            }

            let utxos = db.utxos(&hashx).map_err(index_error)?;
            if utxos.is_empty() {
                lines.push("No UTXOs found".to_string());
            }
            for (n, utxo) in utxos.iter().take(limit).enumerate() {
                lines.push(format!(
                    "UTXO #{}: tx_hash {} tx_pos {} height {} value {}",
                    grouped(n as u64 + 1),
                    utxo.tx_hash,
                    grouped(u64::from(utxo.tx_pos)),
                    grouped(u64::from(utxo.height)),
                    grouped(utxo.value)
                ));
            }
            let balance: u64 = utxos.iter().map(|u| u.value).sum();
            lines.push(format!("Balance: {}", coin_value(balance)));
        }
        Ok(lines)
    }

    async fn reorg(&self, count: Option<u32>) -> Result<String, ErrorObjectOwned> {
        let count = count.unwrap_or(DEFAULT_REORG_COUNT);
        self.reorg.request(count).map_err(|e| rpc_error(BAD_REQUEST, &e.to_string()))?;
        info!(count, "reorg scheduled over admin rpc");
        Ok(format!("scheduled a reorg of {} blocks", grouped(u64::from(count))))
    }

    async fn stop(&self) -> Result<String, ErrorObjectOwned> {
        info!("stop requested over admin rpc");
        self.stop.send_replace(true);
        Ok("stopping".to_string())
    }

    async fn daemon_url(&self, daemon_url: Option<String>) -> Result<String, ErrorObjectOwned> {
        let url = daemon_url.unwrap_or_else(|| self.configured_daemon_url.clone());
        let daemon = &self.manager.env().daemon;
        daemon.set_url(&url).map_err(|e| rpc_error(BAD_REQUEST, &format!("an error occurred: {e}")))?;
        info!(daemon = %daemon.logged_url(), "daemon switched over admin rpc");
        Ok(format!("now using daemon at {}", daemon.logged_url()))
    }
}

/// Start the admin server on `addr`.
///
/// Returns a [`ServerHandle`] that can be used to stop the server.
pub async fn start_admin_server(addr: &str, admin: AdminRpcImpl) -> Result<ServerHandle, std::io::Error> {
    let server = Server::builder().build(addr).await?;
    info!(addr = %server.local_addr()?, "admin rpc listening");
    Ok(server.start(admin.into_rpc()))
}
