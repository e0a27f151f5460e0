//! Client sessions.
//!
//! A [`Session`] is the protocol state machine of one connection. It is
//! transport-agnostic: the session manager feeds it request lines and chain
//! events and writes out whatever it returns. Every handler charges the
//! session's cost account before it answers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use spindex_core::error::{DaemonError, IndexError};
use spindex_core::hash::sha256;
use spindex_core::merkle;
use spindex_core::traits::Daemon;
use spindex_core::types::{Hash256, HashX};
use spindex_network::cost::costs;
use spindex_network::protocol::{
    error_response, negotiate_version, notification, parse_line, result_response, Incoming, Params, Request,
};
use spindex_network::{
    CostThrottle, HostPorts, PeerFeatures, PeerManager, ProtocolVersion, RpcError, RpcResult, SessionId,
    PROTOCOL_MAX, PROTOCOL_MIN,
};

use crate::db::{IndexDb, UtxoInfo};
use crate::mempool::MempoolTracker;
use crate::notifications::ChainEvent;

/// Most headers returned by one `blockchain.block.headers` call.
pub const MAX_CHUNK_SIZE: u32 = 2016;
/// Client names are truncated to this many characters.
pub const MAX_CLIENT_NAME: usize = 17;
/// Bytes of a serialized history entry, for the `max_send` bound.
const HISTORY_ENTRY_BYTES: usize = 107;
const TX_HASH_CACHE_HEIGHTS: usize = 1000;
const DEFAULT_BANNER: &str = "You are connected to a $SERVER_SUBVERSION server.";

/// Per-server settings every session reads.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_send: usize,
    pub max_subs_per_session: usize,
    pub max_subs: usize,
    pub donation_address: String,
    /// Banner template; `None` uses a built-in line.
    pub banner: Option<String>,
    /// Hosts advertised in `server.features`.
    pub hosts: BTreeMap<String, HostPorts>,
    pub services: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_send: 1_000_000,
            max_subs_per_session: 50_000,
            max_subs: 250_000,
            donation_address: String::new(),
            banner: None,
            hosts: BTreeMap::new(),
            services: Vec::new(),
        }
    }
}

/// `spindex <version>`, as reported by `server.version`.
pub fn server_subversion() -> String {
    format!("spindex {}", env!("CARGO_PKG_VERSION"))
}

/// Everything sessions share: the index, the mempool, the daemon and the
/// caches built from them.
pub struct SessionEnv {
    pub db: Arc<IndexDb>,
    pub mempool: Arc<MempoolTracker>,
    pub daemon: Arc<dyn Daemon>,
    pub cost: Arc<CostThrottle>,
    pub peers: Option<Arc<PeerManager>>,
    pub settings: SessionSettings,
    subs: AtomicUsize,
    tx_hashes: Mutex<TxHashCache>,
    fees: Mutex<FeeCache>,
}

/// Transaction hashes of recently queried blocks.
#[derive(Default)]
struct TxHashCache {
    /// Bumped on every invalidation; a lookup that raced one is not cached.
    generation: u64,
    by_height: HashMap<u32, Arc<Vec<Hash256>>>,
}

#[derive(Default)]
struct FeeCache {
    tip: Hash256,
    estimates: HashMap<(u64, Option<String>), Option<f64>>,
}

impl SessionEnv {
    pub fn new(
        db: Arc<IndexDb>,
        mempool: Arc<MempoolTracker>,
        daemon: Arc<dyn Daemon>,
        cost: Arc<CostThrottle>,
        peers: Option<Arc<PeerManager>>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            db,
            mempool,
            daemon,
            cost,
            peers,
            settings,
            subs: AtomicUsize::new(0),
            tx_hashes: Mutex::new(TxHashCache::default()),
            fees: Mutex::new(FeeCache::default()),
        }
    }

    /// Script hash subscriptions across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.subs.load(Ordering::Relaxed)
    }

    /// Forget cached block data `event` may have replaced: everything above
    /// the fork of a reorg, otherwise anything above the new tip.
    pub fn on_chain_event(&self, event: &ChainEvent) {
        let keep = event.reorg_fork.map_or(event.height, |fork| fork.min(event.height));
        let mut cache = self.tx_hashes.lock();
        cache.generation += 1;
        cache.by_height.retain(|h, _| *h <= keep);
    }

    /// Forget all cached block data, for when chain events were missed.
    pub fn clear_block_caches(&self) {
        let mut cache = self.tx_hashes.lock();
        cache.generation += 1;
        cache.by_height.clear();
    }

    /// Transaction hashes of the block at `height` and whether they came
    /// from the cache.
    fn block_tx_hashes(&self, height: u32) -> Result<(Arc<Vec<Hash256>>, bool), RpcError> {
        let generation = {
            let cache = self.tx_hashes.lock();
            if let Some(hashes) = cache.by_height.get(&height) {
                return Ok((hashes.clone(), true));
            }
            cache.generation
        };
        let hashes = self
            .db
            .tx_hashes_at(height)
            .map_err(internal)?
            .ok_or_else(|| RpcError::bad_request(format!("block height {height} not on chain")))?;
        let hashes = Arc::new(hashes);
        let mut cache = self.tx_hashes.lock();
        if cache.generation == generation {
            if cache.by_height.len() >= TX_HASH_CACHE_HEIGHTS {
                cache.by_height.clear();
            }
            cache.by_height.insert(height, hashes.clone());
        }
        Ok((hashes, false))
    }

    fn cached_fee(&self, tip: Hash256, key: &(u64, Option<String>)) -> Option<Option<f64>> {
        let mut fees = self.fees.lock();
        if fees.tip != tip {
            fees.tip = tip;
            fees.estimates.clear();
        }
        fees.estimates.get(key).copied()
    }

    fn store_fee(&self, tip: Hash256, key: (u64, Option<String>), fee: Option<f64>) {
        let mut fees = self.fees.lock();
        if fees.tip == tip {
            fees.estimates.insert(key, fee);
        }
    }

    /// Our `server.features` object.
    pub fn features(&self) -> PeerFeatures {
        PeerFeatures {
            hosts: self.settings.hosts.clone(),
            pruning: None,
            server_version: server_subversion(),
            protocol_min: PROTOCOL_MIN.to_string(),
            protocol_max: PROTOCOL_MAX.to_string(),
            genesis_hash: self.db.coin().genesis_hash.to_hex(),
            hash_function: self.db.coin().hash_function.to_string(),
            services: self.settings.services.clone(),
        }
    }
}

fn internal(e: IndexError) -> RpcError {
    warn!(error = %e, "index read failed");
    RpcError::internal(e.to_string())
}

fn daemon_error(e: DaemonError) -> RpcError {
    RpcError::daemon(format!("daemon error: {e}"))
}

/// `major.minor.revision` from a daemon's integer version.
fn daemon_version_string(version: u64) -> String {
    let (major, rest) = (version / 1_000_000, version % 1_000_000);
    let (minor, revision) = (rest / 10_000, rest % 10_000 / 100);
    format!("{major}.{minor}.{revision}")
}

fn height_param(value: u64) -> Result<u32, RpcError> {
    u32::try_from(value).map_err(|_| RpcError::bad_request(format!("height {value} out of range")))
}

fn utxo_json(utxo: &UtxoInfo) -> Value {
    json!({
        "tx_hash": utxo.tx_hash.to_hex(),
        "tx_pos": utxo.tx_pos,
        "height": utxo.height,
        "value": utxo.value,
    })
}

struct ScriptSub {
    script_hash: String,
    status: Option<String>,
}

/// Protocol state of one client connection.
pub struct Session {
    id: SessionId,
    addr: SocketAddr,
    env: Arc<SessionEnv>,
    version: Option<ProtocolVersion>,
    client: String,
    headers_subscribed: bool,
    notified_height: Option<u32>,
    subs: HashMap<HashX, ScriptSub>,
    close: bool,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr, env: Arc<SessionEnv>) -> Self {
        env.cost.register(id, addr.ip());
        Self {
            id,
            addr,
            env,
            version: None,
            client: String::new(),
            headers_subscribed: false,
            notified_height: None,
            subs: HashMap::new(),
            close: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    /// Set when the session must be closed after its pending output.
    pub fn should_close(&self) -> bool {
        self.close
    }

    fn bump(&self, cost: f64) {
        self.env.cost.charge(self.id, cost);
    }

    /// Answer one line of input. `None` when nothing is to be sent back,
    /// as for notifications.
    pub async fn handle_line(&mut self, line: &[u8]) -> Option<Value> {
        match parse_line(line) {
            Err(response) => Some(response),
            Ok(Incoming::Single(request)) => self.answer(request).await,
            Ok(Incoming::Batch(requests)) => {
                let mut responses = Vec::with_capacity(requests.len());
                for request in requests {
                    if let Some(response) = self.answer(request).await {
                        responses.push(response);
                    }
                }
                (!responses.is_empty()).then(|| Value::Array(responses))
            }
        }
    }

    async fn answer(&mut self, request: Result<Request, (Value, RpcError)>) -> Option<Value> {
        let request = match request {
            Ok(request) => request,
            Err((id, err)) => return Some(error_response(id, &err)),
        };
        let result = self.handle_request(&request).await;
        let id = request.id?;
        Some(match result {
            Ok(value) => result_response(id, value),
            Err(err) => {
                debug!(session = self.id, method = %request.method, code = err.code, "request failed");
                error_response(id, &err)
            }
        })
    }

    /// Dispatch one request.
    pub async fn handle_request(&mut self, request: &Request) -> RpcResult {
        let method = request.method.as_str();
        if self.version.is_none() && method != "server.version" {
            return Err(RpcError::bad_request("use server.version to identify client"));
        }
        let params = &request.params;
        match method {
            "server.version" => self.server_version(params),
            "server.ping" => {
                Params::new(params, &[])?;
                self.bump(costs::PING);
                Ok(Value::Null)
            }
            "server.banner" => self.banner(params).await,
            "server.donation_address" => {
                Params::new(params, &[])?;
                self.bump(costs::DONATION_ADDRESS);
                Ok(json!(self.env.settings.donation_address))
            }
            "server.features" => {
                Params::new(params, &[])?;
                self.bump(costs::FEATURES);
                serde_json::to_value(self.env.features()).map_err(|e| RpcError::internal(e.to_string()))
            }
            "server.peers.subscribe" => {
                Params::new(params, &[])?;
                self.bump(costs::PEERS_SUBSCRIBE);
                Ok(Value::Array(self.env.peers.as_ref().map(|p| p.verified_peers()).unwrap_or_default()))
            }
            "server.add_peer" => self.add_peer(params).await,
            "blockchain.headers.subscribe" => self.headers_subscribe(params),
            "blockchain.block.header" => self.block_header(params),
            "blockchain.block.headers" => self.block_headers(params),
            "blockchain.estimatefee" => self.estimatefee(params).await,
            "blockchain.relayfee" => {
                Params::new(params, &[])?;
                self.bump(costs::RELAYFEE);
                let info = self.env.daemon.network_info().await.map_err(daemon_error)?;
                Ok(json!(info.relay_fee))
            }
            "blockchain.scripthash.get_balance" => self.get_balance(params),
            "blockchain.scripthash.get_history" => self.get_history(params),
            "blockchain.scripthash.get_mempool" => self.get_mempool(params),
            "blockchain.scripthash.listunspent" => self.listunspent(params),
            "blockchain.scripthash.subscribe" => self.scripthash_subscribe(params),
            "blockchain.scripthash.unsubscribe" => self.scripthash_unsubscribe(params),
            "blockchain.transaction.broadcast" => self.broadcast(params).await,
            "blockchain.transaction.get" => self.transaction_get(params).await,
            "blockchain.transaction.get_merkle" => self.transaction_merkle(params),
            "blockchain.transaction.id_from_pos" => self.id_from_pos(params),
            "mempool.get_fee_histogram" => {
                Params::new(params, &[])?;
                self.bump(costs::FEE_HISTOGRAM);
                let histogram = self.env.mempool.fee_histogram();
                Ok(Value::Array(histogram.into_iter().map(|(rate, size)| json!([rate, size])).collect()))
            }
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    // ---------------------------------------------------------------------
    // server.*
    // ---------------------------------------------------------------------

    fn server_version(&mut self, params: &Value) -> RpcResult {
        if self.version.is_some() {
            return Err(RpcError::bad_request("server.version already sent"));
        }
        let p = Params::new(params, &["client_name", "protocol_version"])?;
        self.bump(costs::SERVER_VERSION);
        if let Some(name) = p.get(0) {
            let name = name.as_str().map_or_else(|| name.to_string(), str::to_string);
            self.client = name.chars().take(MAX_CLIENT_NAME).collect();
        }
        match negotiate_version(p.get(1), PROTOCOL_MIN, PROTOCOL_MAX) {
            Some(version) => {
                self.version = Some(version);
                debug!(session = self.id, client = %self.client, %version, "protocol negotiated");
                Ok(json!([server_subversion(), version.to_string()]))
            }
            None => {
                info!(session = self.id, client = %self.client, requested = ?p.get(1), "unsupported protocol version");
                self.close = true;
                Err(RpcError::bad_request(format!(
                    "unsupported protocol version: {}",
                    p.get(1).map_or_else(|| "none".to_string(), Value::to_string)
                )))
            }
        }
    }

    async fn banner(&self, params: &Value) -> RpcResult {
        Params::new(params, &[])?;
        self.bump(costs::BANNER);
        let template = self.env.settings.banner.as_deref().unwrap_or(DEFAULT_BANNER);
        let (daemon_version, daemon_subversion) = match self.env.daemon.network_info().await {
            Ok(info) => (daemon_version_string(info.version), info.subversion),
            Err(_) => ("unknown".to_string(), "unknown".to_string()),
        };
        let banner = template
            .replace("$SERVER_VERSION", env!("CARGO_PKG_VERSION"))
            .replace("$SERVER_SUBVERSION", &server_subversion())
            .replace("$DAEMON_VERSION", &daemon_version)
            .replace("$DAEMON_SUBVERSION", &daemon_subversion)
            .replace("$DONATION_ADDRESS", &self.env.settings.donation_address);
        Ok(json!(banner))
    }

    async fn add_peer(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["features"])?;
        let features = p.required(0)?;
        self.bump(costs::ADD_PEER);
        let Some(peers) = &self.env.peers else {
            return Ok(json!(false));
        };
        match peers.add_peer(features, Some(self.addr.ip())).await {
            Ok(accepted) => Ok(json!(accepted)),
            Err(e) => {
                info!(session = self.id, error = %e, "add_peer rejected");
                Ok(json!(false))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Headers
    // ---------------------------------------------------------------------

    fn tip_header(&self) -> Result<(u32, Vec<u8>), RpcError> {
        let height = self.env.db.height().ok_or_else(|| RpcError::internal("index is empty"))?;
        let header = self
            .env
            .db
            .header(height)
            .map_err(internal)?
            .ok_or_else(|| RpcError::internal(format!("missing header at height {height}")))?;
        Ok((height, header))
    }

    fn headers_subscribe(&mut self, params: &Value) -> RpcResult {
        Params::new(params, &[])?;
        self.bump(costs::HEADERS_SUBSCRIBE);
        let (height, header) = self.tip_header()?;
        self.headers_subscribed = true;
        self.notified_height = Some(height);
        Ok(json!({"hex": hex::encode(header), "height": height}))
    }

    /// Branch and root proving the header at `height` against the
    /// checkpoint `cp_height`.
    fn header_proof(&self, cp_height: u32, height: u32) -> Result<(Vec<Value>, Value), RpcError> {
        let tip = self.env.db.height().unwrap_or(0);
        if !(height <= cp_height && cp_height <= tip) {
            return Err(RpcError::bad_request(format!(
                "header height {height} must be <= cp_height {cp_height} which must be <= chain height {tip}"
            )));
        }
        let (branch, root) = self.env.db.header_branch_and_root(cp_height + 1, height).map_err(internal)?;
        Ok((branch.iter().map(|h| json!(h.to_hex())).collect(), json!(root.to_hex())))
    }

    fn block_header(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["height", "cp_height"])?;
        let height = height_param(p.u64(0)?)?;
        let cp_height = height_param(p.u64_or(1, 0)?)?;
        self.bump(costs::BLOCK_HEADER);
        let header = self
            .env
            .db
            .header(height)
            .map_err(internal)?
            .ok_or_else(|| RpcError::bad_request(format!("height {height} out of range")))?;
        if cp_height == 0 {
            return Ok(json!(hex::encode(header)));
        }
        self.bump(costs::CHECKPOINT_PROOF);
        let (branch, root) = self.header_proof(cp_height, height)?;
        Ok(json!({"header": hex::encode(header), "branch": branch, "root": root}))
    }

    fn block_headers(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["start_height", "count", "cp_height"])?;
        let start = height_param(p.u64(0)?)?;
        let requested = p.u64(1)?;
        let cp_height = height_param(p.u64_or(2, 0)?)?;
        let mut cost = requested as f64 / 50.0 * costs::HEADERS_PER_CHUNK_OF_50;

        let count = requested.min(u64::from(MAX_CHUNK_SIZE)) as u32;
        let headers = self.env.db.headers(start, count).map_err(internal)?;
        let count = headers.len() as u32;
        let mut result = json!({
            "hex": hex::encode(headers.concat()),
            "count": count,
            "max": MAX_CHUNK_SIZE,
        });
        if count > 0 && cp_height > 0 {
            cost += costs::CHECKPOINT_PROOF;
            let (branch, root) = self.header_proof(cp_height, start + count - 1)?;
            result["branch"] = Value::Array(branch);
            result["root"] = root;
        }
        self.bump(cost);
        Ok(result)
    }

    // ---------------------------------------------------------------------
    // Fees
    // ---------------------------------------------------------------------

    async fn estimatefee(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["number", "mode"])?;
        let number = p.u64(0)?;
        let mode = match p.get(1) {
            None => None,
            Some(Value::String(m)) if m == "CONSERVATIVE" || m == "ECONOMICAL" => Some(m.clone()),
            Some(other) => return Err(RpcError::bad_request(format!("unknown estimatefee mode: {other}"))),
        };
        self.bump(costs::ESTIMATEFEE);
        let blocks = u32::try_from(number).map_err(|_| RpcError::bad_request(format!("{number} blocks out of range")))?;

        let tip = self.env.db.tip();
        let key = (number, mode);
        let fee = match self.env.cached_fee(tip, &key) {
            Some(fee) => fee,
            None => {
                self.bump(costs::ESTIMATEFEE_DAEMON);
                let fee = self.env.daemon.estimate_fee(blocks, key.1.as_deref()).await.map_err(daemon_error)?;
                self.env.store_fee(tip, key, fee);
                fee
            }
        };
        Ok(fee.map_or(json!(-1), |f| json!(f)))
    }

    // ---------------------------------------------------------------------
    // Script hashes
    // ---------------------------------------------------------------------

    fn script_hash_param(&self, p: &Params<'_>) -> Result<(HashX, String), RpcError> {
        let script_hash = p.str(0)?;
        let hashx = self
            .env
            .db
            .coin()
            .hashx_from_script_hash(script_hash)
            .map_err(|_| RpcError::bad_request(format!("{script_hash} is not a valid script hash")))?;
        Ok((hashx, script_hash.to_string()))
    }

    /// Confirmed history, refusing one too large to send.
    fn confirmed_history(&self, hashx: &HashX) -> Result<Vec<(Hash256, u32)>, RpcError> {
        let limit = self.env.settings.max_send.saturating_sub(200) / HISTORY_ENTRY_BYTES;
        let history = self.env.db.history(hashx, limit + 1).map_err(internal)?;
        if history.len() > limit {
            return Err(RpcError::bad_request("history too large"));
        }
        Ok(history)
    }

    /// The status digest of `hashx`: `None` when it has no history.
    fn status(&self, hashx: &HashX) -> Result<Option<String>, RpcError> {
        let history = self.confirmed_history(hashx)?;
        let mempool = self.env.mempool.transaction_summaries(hashx);
        self.bump(costs::HISTORY + history.len() as f64 * costs::HISTORY_PER_ENTRY);
        if history.is_empty() && mempool.is_empty() {
            self.bump(costs::STATUS);
            return Ok(None);
        }
        let mut status = String::new();
        for (hash, height) in &history {
            status.push_str(&format!("{hash}:{height}:"));
        }
        for tx in &mempool {
            let height = if tx.has_unconfirmed_inputs { -1 } else { 0 };
            status.push_str(&format!("{}:{height}:", tx.hash));
        }
        self.bump(costs::STATUS + status.len() as f64 * costs::STATUS_PER_BYTE);
        Ok(Some(hex::encode(sha256(status.as_bytes()))))
    }

    fn get_balance(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["scripthash"])?;
        let (hashx, _) = self.script_hash_param(&p)?;
        let utxos = self.env.db.utxos(&hashx).map_err(internal)?;
        self.bump(costs::UTXOS + utxos.len() as f64 / 50.0 * costs::UTXOS_PER_50);
        let confirmed: u64 = utxos.iter().map(|u| u.value).sum();
        let unconfirmed = self.env.mempool.balance_delta(&hashx);
        Ok(json!({"confirmed": confirmed, "unconfirmed": unconfirmed}))
    }

    fn mempool_history(&self, hashx: &HashX) -> Vec<Value> {
        let summaries = self.env.mempool.transaction_summaries(hashx);
        self.bump(costs::MEMPOOL + summaries.len() as f64 / 50.0 * costs::MEMPOOL_PER_50);
        summaries
            .iter()
            .map(|tx| {
                let height = if tx.has_unconfirmed_inputs { -1 } else { 0 };
                json!({"tx_hash": tx.hash.to_hex(), "height": height, "fee": tx.fee})
            })
            .collect()
    }

    fn get_history(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["scripthash"])?;
        let (hashx, _) = self.script_hash_param(&p)?;
        let history = self.confirmed_history(&hashx)?;
        self.bump(costs::HISTORY + history.len() as f64 * costs::HISTORY_PER_ENTRY);
        let mut entries: Vec<Value> = history
            .iter()
            .map(|(hash, height)| json!({"tx_hash": hash.to_hex(), "height": height}))
            .collect();
        entries.extend(self.mempool_history(&hashx));
        Ok(Value::Array(entries))
    }

    fn get_mempool(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["scripthash"])?;
        let (hashx, _) = self.script_hash_param(&p)?;
        Ok(Value::Array(self.mempool_history(&hashx)))
    }

    fn listunspent(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["scripthash"])?;
        let (hashx, _) = self.script_hash_param(&p)?;
        let mut utxos = self.env.db.utxos(&hashx).map_err(internal)?;
        let mut unconfirmed = self.env.mempool.unordered_utxos(&hashx);
        unconfirmed.sort_by_key(|u| (u.tx_hash, u.tx_pos));
        utxos.extend(unconfirmed);
        self.env.mempool.retain_unspent(&mut utxos);
        self.bump(costs::UTXOS + utxos.len() as f64 / 50.0 * costs::UTXOS_PER_50);
        Ok(Value::Array(utxos.iter().map(utxo_json).collect()))
    }

    fn scripthash_subscribe(&mut self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["scripthash"])?;
        let (hashx, script_hash) = self.script_hash_param(&p)?;
        let is_new = !self.subs.contains_key(&hashx);
        if is_new {
            let limit = self.env.settings.max_subs_per_session;
            if self.subs.len() >= limit {
                return Err(RpcError::bad_request(format!("too many subscriptions in session: limit {limit}")));
            }
            let global = self.env.settings.max_subs;
            if self.env.subscription_count() >= global {
                warn!(session = self.id, limit = global, "global subscription limit reached");
                self.close = true;
                return Err(RpcError::bad_request(format!("server subscription limit {global} reached")));
            }
        }
        let status = self.status(&hashx)?;
        self.subs.insert(hashx, ScriptSub { script_hash, status: status.clone() });
        if is_new {
            self.env.subs.fetch_add(1, Ordering::Relaxed);
            self.env.cost.set_subscriptions(self.id, self.subs.len());
        }
        Ok(json!(status))
    }

    fn scripthash_unsubscribe(&mut self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["scripthash"])?;
        let (hashx, _) = self.script_hash_param(&p)?;
        self.bump(costs::UNSUBSCRIBE);
        let removed = self.subs.remove(&hashx).is_some();
        if removed {
            self.env.subs.fetch_sub(1, Ordering::Relaxed);
            self.env.cost.set_subscriptions(self.id, self.subs.len());
        }
        Ok(json!(removed))
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    fn tx_hash_param(p: &Params<'_>, index: usize) -> Result<Hash256, RpcError> {
        let s = p.str(index)?;
        Hash256::from_hex(s).map_err(|_| RpcError::bad_request(format!("{s} should be a transaction hash")))
    }

    async fn broadcast(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["raw_tx"])?;
        let raw = p.str(0)?;
        self.bump(costs::BROADCAST + raw.len() as f64 * costs::BROADCAST_PER_BYTE);
        match self.env.daemon.broadcast(raw).await {
            Ok(hash) => {
                info!(session = self.id, tx = %hash, "sent transaction");
                Ok(json!(hash.to_hex()))
            }
            Err(DaemonError::Rpc { message, .. }) => {
                info!(session = self.id, error = %message, "broadcast rejected");
                Err(RpcError::bad_request(format!(
                    "the transaction was rejected by network rules.\n\n{message}\n[{raw}]"
                )))
            }
            Err(e) => Err(daemon_error(e)),
        }
    }

    async fn transaction_get(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["tx_hash", "verbose"])?;
        let hash = Self::tx_hash_param(&p, 0)?;
        let verbose = p.bool_or(1, false)?;
        self.bump(costs::TRANSACTION_GET);
        self.env.daemon.transaction(&hash, verbose).await.map_err(daemon_error)
    }

    fn block_tx_hashes(&self, height: u32) -> Result<Arc<Vec<Hash256>>, RpcError> {
        let (hashes, cached) = self.env.block_tx_hashes(height)?;
        let mut cost = costs::TX_HASHES_LOOKUP;
        if !cached {
            cost += hashes.len() as f64 * costs::TX_HASHES_PER_TX;
        }
        self.bump(cost);
        Ok(hashes)
    }

    fn merkle_branch(&self, hashes: &[Hash256], pos: usize) -> Result<Vec<Value>, RpcError> {
        self.bump(costs::MERKLE_BRANCH);
        let (branch, _) = merkle::branch_and_root(hashes, pos, None).map_err(|e| RpcError::internal(e.to_string()))?;
        Ok(branch.iter().map(|h| json!(h.to_hex())).collect())
    }

    fn transaction_merkle(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["tx_hash", "height"])?;
        let tx_hash = Self::tx_hash_param(&p, 0)?;
        let height = height_param(p.u64(1)?)?;
        let hashes = self.block_tx_hashes(height)?;
        let pos = hashes
            .iter()
            .position(|h| *h == tx_hash)
            .ok_or_else(|| RpcError::bad_request(format!("tx {tx_hash} not in block at height {height}")))?;
        let branch = self.merkle_branch(&hashes, pos)?;
        Ok(json!({"block_height": height, "merkle": branch, "pos": pos}))
    }

    fn id_from_pos(&self, params: &Value) -> RpcResult {
        let p = Params::new(params, &["height", "tx_pos", "merkle"])?;
        let height = height_param(p.u64(0)?)?;
        let pos = p.u64(1)? as usize;
        let want_merkle = p.bool_or(2, false)?;
        let hashes = self.block_tx_hashes(height)?;
        let tx_hash = hashes
            .get(pos)
            .ok_or_else(|| RpcError::bad_request(format!("no tx at position {pos} in block at height {height}")))?;
        if !want_merkle {
            return Ok(json!(tx_hash.to_hex()));
        }
        let branch = self.merkle_branch(&hashes, pos)?;
        Ok(json!({"tx_hash": tx_hash.to_hex(), "merkle": branch}))
    }

    // ---------------------------------------------------------------------
    // Notifications
    // ---------------------------------------------------------------------

    /// Notifications owed after the chain or mempool changed. `touched` is
    /// `None` when events were missed, in which case every subscription is
    /// rechecked.
    pub fn notifications(&mut self, touched: Option<&HashSet<HashX>>) -> Vec<Value> {
        let mut out = Vec::new();
        if self.headers_subscribed {
            match self.tip_header() {
                Ok((height, header)) if self.notified_height != Some(height) => {
                    self.notified_height = Some(height);
                    out.push(notification(
                        "blockchain.headers.subscribe",
                        json!([{"hex": hex::encode(header), "height": height}]),
                    ));
                }
                Ok(_) => {}
                Err(e) => warn!(session = self.id, error = %e, "cannot read tip header"),
            }
        }

        let changed: Vec<HashX> = match touched {
            Some(touched) if touched.len() < self.subs.len() => {
                touched.iter().filter(|h| self.subs.contains_key(h)).copied().collect()
            }
            Some(touched) => self.subs.keys().filter(|h| touched.contains(h)).copied().collect(),
            None => self.subs.keys().copied().collect(),
        };
        for hashx in changed {
            let status = match self.status(&hashx) {
                Ok(status) => status,
                Err(e) => {
                    warn!(session = self.id, error = %e, "cannot compute status");
                    continue;
                }
            };
            let Some(sub) = self.subs.get_mut(&hashx) else { continue };
            if sub.status != status {
                sub.status = status.clone();
                out.push(notification("blockchain.scripthash.subscribe", json!([sub.script_hash, status])));
            }
        }
        out
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.subs.is_empty() {
            self.env.subs.fetch_sub(self.subs.len(), Ordering::Relaxed);
        }
        self.env.cost.remove(self.id);
    }
}
