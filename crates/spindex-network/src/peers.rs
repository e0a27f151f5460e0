//! Peer server discovery and verification.
//!
//! Peers come from configured seeds and from `server.add_peer` announcements.
//! A new peer is provisional until a direct verification round confirms it
//! is reachable, follows the same chain and speaks a compatible protocol
//! version. Only verified peers are handed to clients.
//!
//! A failed verification blacklists the peer with exponential backoff:
//! `base_backoff * 2^(failures - 1)`, capped at `max_backoff`. Blacklisted
//! peers are never returned to clients and re-announcements are refused
//! until the backoff expires. After `max_failures` consecutive failures the
//! peer is forgotten.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use spindex_core::error::PeerError;

use crate::config::PeerConfig;
use crate::protocol::ProtocolVersion;

/// Ports a peer listens on for one of its hostnames.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPorts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_port: Option<u16>,
}

/// The `server.features` object, both ours and a peer's.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFeatures {
    pub hosts: BTreeMap<String, HostPorts>,
    #[serde(default)]
    pub pruning: Option<u64>,
    #[serde(default)]
    pub server_version: String,
    pub protocol_min: String,
    pub protocol_max: String,
    pub genesis_hash: String,
    #[serde(default = "default_hash_function")]
    pub hash_function: String,
    #[serde(default)]
    pub services: Vec<String>,
}

fn default_hash_function() -> String {
    "sha256".to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Provisional,
    Verified,
    Blacklisted { retry_at: Instant },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSource {
    Seed,
    Announced,
    /// Added by an operator.
    Admin,
}

/// Parse a peer's "real name": a hostname followed by `t[port]` and
/// `s[port]` tags, e.g. `electrum.example t50001 s`. A tag without a port
/// means the default one. Other tags are ignored.
pub fn parse_real_name(real_name: &str) -> Result<(String, HostPorts), PeerError> {
    let mut parts = real_name.split_whitespace();
    let host = parts.next().ok_or_else(|| PeerError::BadFeatures("empty peer name".into()))?;
    let mut ports = HostPorts::default();
    for tag in parts {
        let (slot, default) = match tag.as_bytes()[0] {
            b't' => (&mut ports.tcp_port, 50001),
            b's' => (&mut ports.ssl_port, 50002),
            _ => continue,
        };
        let port = match &tag[1..] {
            "" => default,
            digits => digits.parse().map_err(|_| PeerError::BadFeatures(format!("bad port tag {tag}")))?,
        };
        *slot = Some(port);
    }
    if ports.tcp_port.is_none() && ports.ssl_port.is_none() {
        return Err(PeerError::BadFeatures(format!("{host}: no ports given")));
    }
    Ok((host.to_string(), ports))
}

/// A known peer server.
#[derive(Clone, Debug)]
pub struct Peer {
    pub host: String,
    pub ports: HostPorts,
    pub ip: Option<IpAddr>,
    pub features: Option<PeerFeatures>,
    pub state: PeerState,
    pub failures: u32,
    pub last_verified: Option<Instant>,
    pub source: PeerSource,
}

impl Peer {
    fn new(host: String, ports: HostPorts, ip: Option<IpAddr>, source: PeerSource) -> Self {
        Self {
            host,
            ports,
            ip,
            features: None,
            state: PeerState::Provisional,
            failures: 0,
            last_verified: None,
            source,
        }
    }

    fn is_blacklisted(&self, now: Instant) -> bool {
        matches!(self.state, PeerState::Blacklisted { retry_at } if now < retry_at)
    }

    fn is_due(&self, now: Instant, verify_interval: Duration) -> bool {
        match self.state {
            PeerState::Provisional => true,
            PeerState::Blacklisted { retry_at } => now >= retry_at,
            PeerState::Verified => self.last_verified.is_none_or(|t| now.duration_since(t) >= verify_interval),
        }
    }

    /// Entry for `server.peers.subscribe`: `[ip, host, [features...]]`.
    pub fn subscribe_entry(&self) -> Value {
        let mut tags = Vec::new();
        if let Some(features) = &self.features {
            tags.push(format!("v{}", features.protocol_max));
            if let Some(pruning) = features.pruning {
                tags.push(format!("p{pruning}"));
            }
        }
        if let Some(port) = self.ports.ssl_port {
            tags.push(format!("s{port}"));
        }
        if let Some(port) = self.ports.tcp_port {
            tags.push(format!("t{port}"));
        }
        let ip = self.ip.map_or_else(|| self.host.clone(), |ip| ip.to_string());
        json!([ip, self.host, tags])
    }
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Fetches a peer's features over the wire.
#[async_trait]
pub trait PeerVerifier: Send + Sync {
    async fn fetch_features(&self, host: &str, port: u16) -> Result<PeerFeatures, PeerError>;
}

/// Resolves hostnames to addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, PeerError>;
}

/// Resolver backed by the system's name lookup.
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, PeerError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| PeerError::Resolve(format!("{host}: {e}")))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Verifier that opens a TCP session, negotiates a version and requests
/// `server.features`.
pub struct TcpPeerVerifier {
    pub client_name: String,
    pub protocol_min: ProtocolVersion,
    pub protocol_max: ProtocolVersion,
    pub timeout: Duration,
}

impl TcpPeerVerifier {
    async fn exchange(&self, host: &str, port: u16) -> Result<PeerFeatures, PeerError> {
        let unreachable = |e: std::io::Error| PeerError::Unreachable(format!("{host}:{port}: {e}"));
        let stream = TcpStream::connect((host, port)).await.map_err(unreachable)?;
        let (reader, mut writer) = stream.into_split();

        let requests = [
            json!({"jsonrpc": "2.0", "id": 0, "method": "server.version",
                   "params": [self.client_name, [self.protocol_min.to_string(), self.protocol_max.to_string()]]}),
            json!({"jsonrpc": "2.0", "id": 1, "method": "server.features", "params": []}),
        ];
        for request in &requests {
            let mut line = request.to_string().into_bytes();
            line.push(b'\n');
            writer.write_all(&line).await.map_err(unreachable)?;
        }

        let mut lines = BufReader::new(reader).lines();
        let mut version_ok = false;
        while let Some(line) = lines.next_line().await.map_err(unreachable)? {
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                return Err(PeerError::BadFeatures(format!("{host}: unparseable response")));
            };
            if let Some(err) = msg.get("error") {
                return Err(PeerError::BadFeatures(format!("{host}: {err}")));
            }
            match msg.get("id").and_then(Value::as_u64) {
                Some(0) => version_ok = msg.get("result").is_some_and(Value::is_array),
                Some(1) if version_ok => {
                    let result = msg.get("result").cloned().unwrap_or(Value::Null);
                    return serde_json::from_value(result)
                        .map_err(|e| PeerError::BadFeatures(format!("{host}: {e}")));
                }
                _ => {}
            }
        }
        Err(PeerError::Unreachable(format!("{host}:{port}: connection closed")))
    }
}

#[async_trait]
impl PeerVerifier for TcpPeerVerifier {
    async fn fetch_features(&self, host: &str, port: u16) -> Result<PeerFeatures, PeerError> {
        tokio::time::timeout(self.timeout, self.exchange(host, port))
            .await
            .map_err(|_| PeerError::Unreachable(format!("{host}:{port}: timed out")))?
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Maintains the set of known peer servers.
pub struct PeerManager {
    config: PeerConfig,
    verifier: Arc<dyn PeerVerifier>,
    resolver: Arc<dyn Resolver>,
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerManager {
    pub fn new(config: PeerConfig, verifier: Arc<dyn PeerVerifier>, resolver: Arc<dyn Resolver>) -> Self {
        Self { config, verifier, resolver, peers: Mutex::new(HashMap::new()) }
    }

    /// Add the configured `host:port` seeds as provisional peers.
    pub fn add_seeds(&self) {
        let mut peers = self.peers.lock();
        for seed in &self.config.seeds {
            let Some((host, port)) = seed.rsplit_once(':') else {
                warn!(seed, "peers: seed must be host:port");
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                warn!(seed, "peers: bad seed port");
                continue;
            };
            let ports = HostPorts { tcp_port: Some(port), ssl_port: None };
            peers
                .entry(host.to_string())
                .or_insert_with(|| Peer::new(host.to_string(), ports, None, PeerSource::Seed));
        }
    }

    /// Handle a `server.add_peer` announcement from a client at `source`.
    ///
    /// Returns `Ok(true)` when the peer is known or queued for verification.
    pub async fn add_peer(&self, features: &Value, source: Option<IpAddr>) -> Result<bool, PeerError> {
        let features: PeerFeatures = serde_json::from_value(features.clone())
            .map_err(|e| PeerError::BadFeatures(e.to_string()))?;
        if features.hosts.is_empty() {
            return Err(PeerError::BadFeatures("no hosts".into()));
        }
        let Some(source) = source else {
            return Ok(false);
        };

        // Accept the first claimed host that resolves to the announcer.
        let mut claimed = None;
        for (host, ports) in &features.hosts {
            match self.resolver.resolve(host).await {
                Ok(addrs) if addrs.contains(&source) => {
                    claimed = Some((host.clone(), ports.clone()));
                    break;
                }
                Ok(_) => debug!(%host, %source, "peers: announced host does not match source"),
                Err(e) => debug!(%host, error = %e, "peers: cannot resolve announced host"),
            }
        }
        let Some((host, ports)) = claimed else {
            let host = features.hosts.keys().next().cloned().unwrap_or_default();
            warn!(%host, %source, "peers: rejected add_peer, source address mismatch");
            return Err(PeerError::SourceMismatch { host, source_ip: source.to_string() });
        };

        let now = Instant::now();
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get(&host) {
            if peer.is_blacklisted(now) {
                return Err(PeerError::Blacklisted(host));
            }
            return Ok(true);
        }
        info!(%host, %source, "peers: queued announced peer for verification");
        peers.insert(host.clone(), Peer::new(host, ports, Some(source), PeerSource::Announced));
        Ok(true)
    }

    /// Queue a peer named by an operator for verification. Clears any
    /// blacklisting of that host.
    pub fn add_named(&self, real_name: &str) -> Result<(), PeerError> {
        let (host, ports) = parse_real_name(real_name)?;
        info!(%host, "peers: operator added peer");
        self.peers.lock().insert(host.clone(), Peer::new(host, ports, None, PeerSource::Admin));
        Ok(())
    }

    /// Verify every peer that is provisional, due for re-verification, or
    /// whose blacklist period has expired. Returns how many succeeded.
    pub async fn verify_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<Peer> = self
            .peers
            .lock()
            .values()
            .filter(|p| p.is_due(now, self.config.verify_interval))
            .cloned()
            .collect();

        let mut verified = 0;
        for peer in due {
            let outcome = self.verify(&peer).await;
            if self.record_outcome(&peer.host, outcome) {
                verified += 1;
            }
        }
        verified
    }

    async fn verify(&self, peer: &Peer) -> Result<(IpAddr, PeerFeatures), PeerError> {
        let port = peer
            .ports
            .tcp_port
            .ok_or_else(|| PeerError::Unreachable(format!("{}: no tcp port", peer.host)))?;
        let ip = match peer.ip {
            Some(ip) => ip,
            None => self
                .resolver
                .resolve(&peer.host)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| PeerError::Resolve(peer.host.clone()))?,
        };
        let features = self.verifier.fetch_features(&peer.host, port).await?;
        self.check_features(&peer.host, &features)?;
        Ok((ip, features))
    }

    fn check_features(&self, host: &str, features: &PeerFeatures) -> Result<(), PeerError> {
        if !features.genesis_hash.eq_ignore_ascii_case(&self.config.genesis_hash) {
            return Err(PeerError::GenesisMismatch {
                host: host.to_string(),
                genesis: features.genesis_hash.clone(),
            });
        }
        let mismatch = || PeerError::ProtocolMismatch {
            host: host.to_string(),
            min: features.protocol_min.clone(),
            max: features.protocol_max.clone(),
        };
        let min = ProtocolVersion::parse(&features.protocol_min).ok_or_else(mismatch)?;
        let max = ProtocolVersion::parse(&features.protocol_max).ok_or_else(mismatch)?;
        if max.min(self.config.protocol_max) < min.max(self.config.protocol_min) {
            return Err(mismatch());
        }
        Ok(())
    }

    /// Apply a verification result. Returns `true` on success.
    fn record_outcome(&self, host: &str, outcome: Result<(IpAddr, PeerFeatures), PeerError>) -> bool {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(host) else {
            return false;
        };
        match outcome {
            Ok((ip, features)) => {
                if peer.state != PeerState::Verified {
                    info!(%host, protocol_max = %features.protocol_max, "peers: peer verified");
                }
                peer.ip = Some(ip);
                peer.features = Some(features);
                peer.state = PeerState::Verified;
                peer.failures = 0;
                peer.last_verified = Some(now);
                true
            }
            Err(e) => {
                peer.failures += 1;
                if peer.failures >= self.config.max_failures {
                    warn!(%host, failures = peer.failures, error = %e, "peers: forgetting peer");
                    peers.remove(host);
                } else {
                    let backoff = self.backoff(peer.failures);
                    warn!(%host, failures = peer.failures, backoff_secs = backoff.as_secs(), error = %e,
                        "peers: verification failed, blacklisted");
                    peer.state = PeerState::Blacklisted { retry_at: now + backoff };
                }
                false
            }
        }
    }

    /// Blacklist period after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(30);
        self.config
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.config.max_backoff)
    }

    /// Verified peers for `server.peers.subscribe`, in random order.
    pub fn verified_peers(&self) -> Vec<Value> {
        let mut entries: Vec<Value> = self
            .peers
            .lock()
            .values()
            .filter(|p| p.state == PeerState::Verified)
            .map(Peer::subscribe_entry)
            .collect();
        entries.shuffle(&mut rand::thread_rng());
        entries.truncate(self.config.max_returned);
        entries
    }

    pub fn is_blacklisted(&self, host: &str) -> bool {
        let now = Instant::now();
        self.peers.lock().get(host).is_some_and(|p| p.is_blacklisted(now))
    }

    pub fn peer(&self, host: &str) -> Option<Peer> {
        self.peers.lock().get(host).cloned()
    }

    /// Every known peer, sorted by host.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.host.cmp(&b.host));
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Background loop: verify due peers until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.add_seeds();
        let period = self.config.base_backoff.min(self.config.verify_interval);
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let verified = self.verify_due().await;
                    debug!(verified, known = self.peer_count(), "peers: verification round");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("peers: manager stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
