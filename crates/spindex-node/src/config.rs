//! Server configuration.
//!
//! [`ServerConfig`] is read in three layers, later ones winning:
//!
//! 1. compiled defaults ([`ServerConfig::default`])
//! 2. an optional TOML file
//! 3. `SPINDEX_*` environment variables, e.g. `SPINDEX_TCP_PORT=50001`
//!
//! The server binary then applies its command-line flags on top. Helpers
//! convert the flat settings into the per-component config structs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use spindex_core::coin::Coin;
use spindex_network::{CostConfig, HostPorts, PeerConfig, PROTOCOL_MAX, PROTOCOL_MIN};

use crate::block_processor::ProcessorConfig;
use crate::history::MAX_FLUSH_ID;
use crate::mempool::MempoolConfig;
use crate::session::SessionSettings;
use crate::session_manager::ManagerConfig;

/// Settings for a server instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `mainnet`, `testnet` or `regtest`.
    pub network: String,
    /// Root of persistent state. Defaults to `<data dir>/spindex/<network>`.
    pub data_dir: Option<PathBuf>,
    /// Daemon RPC URL, credentials included.
    pub daemon_url: String,
    pub daemon_timeout_secs: u64,
    pub log_level: String,
    /// `text` or `json`.
    pub log_format: String,

    pub host: String,
    /// Client port; the coin's default when unset.
    pub tcp_port: Option<u16>,
    /// Admin RPC port on localhost; 0 disables the admin interface.
    pub rpc_port: u16,
    /// Hostname advertised to clients and peers.
    pub report_host: Option<String>,
    pub max_sessions: usize,
    pub session_timeout_secs: u64,
    pub max_send: usize,
    pub max_recv: usize,
    pub max_subs_per_session: usize,
    pub max_subs: usize,
    pub donation_address: String,
    pub banner_file: Option<PathBuf>,
    pub services: Vec<String>,

    pub cache_mb: usize,
    /// Undo depth; the coin's default when unset.
    pub reorg_limit: Option<u32>,
    pub flush_interval: u32,
    pub max_flush_count: u32,
    pub max_hist_row_entries: usize,
    pub fetch_batch: u32,
    pub mempool_refresh_secs: u64,
    pub histogram_refresh_secs: u64,
    pub log_status_secs: u64,

    pub cost_soft_limit: f64,
    pub cost_hard_limit: f64,
    pub request_sleep_ms: u64,
    pub bw_unit_cost: f64,
    pub session_group_by_subnet_ipv4: u8,
    pub session_group_by_subnet_ipv6: u8,

    /// `host:port` peers to verify at startup.
    pub peer_seeds: Vec<String>,
    pub peer_discovery: bool,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            data_dir: None,
            daemon_url: "http://127.0.0.1:8332".to_string(),
            daemon_timeout_secs: 60,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            host: "127.0.0.1".to_string(),
            tcp_port: None,
            rpc_port: 8000,
            report_host: None,
            max_sessions: 1000,
            session_timeout_secs: 600,
            max_send: 1_000_000,
            max_recv: 1_000_000,
            max_subs_per_session: 50_000,
            max_subs: 250_000,
            donation_address: String::new(),
            banner_file: None,
            services: Vec::new(),
            cache_mb: 1200,
            reorg_limit: None,
            flush_interval: 2000,
            max_flush_count: MAX_FLUSH_ID,
            max_hist_row_entries: 12_500,
            fetch_batch: 100,
            mempool_refresh_secs: 5,
            histogram_refresh_secs: 30,
            log_status_secs: 60,
            cost_soft_limit: 1000.0,
            cost_hard_limit: 10_000.0,
            request_sleep_ms: 2500,
            bw_unit_cost: 5000.0,
            session_group_by_subnet_ipv4: 24,
            session_group_by_subnet_ipv6: 48,
            peer_seeds: Vec::new(),
            peer_discovery: true,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Load defaults, then `path` if given, then `SPINDEX_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("SPINDEX")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("peer_seeds")
                    .with_list_parse_key("services"),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse a TOML document over the defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?.try_deserialize()
    }

    /// Chain parameters for [`network`](Self::network), with the configured
    /// reorg limit applied.
    pub fn coin(&self) -> Result<Coin, ConfigError> {
        let mut coin = Coin::for_network(&self.network)
            .ok_or_else(|| ConfigError::Message(format!("unknown network: {}", self.network)))?;
        if let Some(limit) = self.reorg_limit {
            coin.reorg_limit = limit;
        }
        Ok(coin)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("spindex").join(self.network.to_lowercase())
        })
    }

    /// Path to the RocksDB index directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("index")
    }

    /// Socket address string for the client listener.
    pub fn tcp_addr(&self, coin: &Coin) -> String {
        format!("{}:{}", self.host, self.tcp_port.unwrap_or(coin.tcp_port))
    }

    /// Socket address for the admin RPC listener, which only binds
    /// loopback.
    pub fn rpc_addr(&self) -> Option<String> {
        (self.rpc_port != 0).then(|| format!("127.0.0.1:{}", self.rpc_port))
    }

    /// Flush count limit, capped by what history keys can hold.
    pub fn effective_max_flush_count(&self) -> u32 {
        self.max_flush_count.min(MAX_FLUSH_ID)
    }

    pub fn daemon_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            flush_interval: self.flush_interval,
            cache_mb: self.cache_mb,
            fetch_batch: self.fetch_batch,
            ..ProcessorConfig::default()
        }
    }

    pub fn mempool_config(&self) -> MempoolConfig {
        MempoolConfig {
            refresh_interval: Duration::from_secs(self.mempool_refresh_secs),
            histogram_interval: Duration::from_secs(self.histogram_refresh_secs),
            log_status_interval: Duration::from_secs(self.log_status_secs),
            ..MempoolConfig::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_sessions: self.max_sessions,
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            max_recv: self.max_recv,
            ..ManagerConfig::default()
        }
    }

    pub fn cost_config(&self) -> CostConfig {
        CostConfig {
            soft_limit: self.cost_soft_limit,
            hard_limit: self.cost_hard_limit,
            request_sleep: Duration::from_millis(self.request_sleep_ms),
            bw_unit_cost: self.bw_unit_cost,
            group_ipv4_prefix: self.session_group_by_subnet_ipv4,
            group_ipv6_prefix: self.session_group_by_subnet_ipv6,
            ..CostConfig::default()
        }
    }

    pub fn peer_config(&self, coin: &Coin) -> PeerConfig {
        PeerConfig {
            seeds: self.peer_seeds.clone(),
            genesis_hash: coin.genesis_hash.to_hex(),
            protocol_min: PROTOCOL_MIN,
            protocol_max: PROTOCOL_MAX,
            ..PeerConfig::default()
        }
    }

    /// Session settings. `banner` is the text of `banner_file`, read by the
    /// caller.
    pub fn session_settings(&self, coin: &Coin, banner: Option<String>) -> SessionSettings {
        let mut hosts = BTreeMap::new();
        if let Some(host) = &self.report_host {
            hosts.insert(
                host.clone(),
                HostPorts { tcp_port: Some(self.tcp_port.unwrap_or(coin.tcp_port)), ssl_port: None },
            );
        }
        SessionSettings {
            max_send: self.max_send,
            max_subs_per_session: self.max_subs_per_session,
            max_subs: self.max_subs,
            donation_address: self.donation_address.clone(),
            banner,
            hosts,
            services: self.services.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.network, "mainnet");
        assert_eq!(cfg.max_sessions, 1000);
        assert_eq!(cfg.max_flush_count, 65_535);
        assert_eq!(cfg.cost_config().hard_limit, 10_000.0);
        assert_eq!(cfg.coin().unwrap().reorg_limit, 200);
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg = ServerConfig::from_toml(
            r#"
            network = "regtest"
            tcp_port = 60401
            reorg_limit = 50
            peer_seeds = ["electrum.example.org:50001"]
            cost_hard_limit = 0.0
            "#,
        )
        .unwrap();
        let coin = cfg.coin().unwrap();
        assert_eq!(coin.reorg_limit, 50);
        assert_eq!(cfg.tcp_addr(&coin), "127.0.0.1:60401");
        assert_eq!(cfg.peer_config(&coin).seeds, vec!["electrum.example.org:50001".to_string()]);
        assert!(!cfg.cost_config().enabled());
        assert_eq!(cfg.max_subs, 250_000);
    }

    #[test]
    fn unknown_network_is_rejected() {
        let cfg = ServerConfig { network: "dogecoin".into(), ..ServerConfig::default() };
        assert!(cfg.coin().is_err());
    }

    #[test]
    fn paths_follow_network() {
        let cfg = ServerConfig { network: "testnet".into(), ..ServerConfig::default() };
        assert!(cfg.data_dir().ends_with("spindex/testnet"));
        let cfg = ServerConfig { data_dir: Some(PathBuf::from("/tmp/spindex-test")), ..cfg };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/spindex-test/index"));
    }

    #[test]
    fn default_port_comes_from_coin() {
        let cfg = ServerConfig::default();
        let coin = cfg.coin().unwrap();
        assert_eq!(cfg.tcp_addr(&coin), "127.0.0.1:50001");
    }

    #[test]
    fn admin_rpc_binds_loopback_unless_disabled() {
        let cfg = ServerConfig { host: "0.0.0.0".into(), ..ServerConfig::default() };
        assert_eq!(cfg.rpc_addr().as_deref(), Some("127.0.0.1:8000"));
        let cfg = ServerConfig::from_toml("rpc_port = 0").unwrap();
        assert_eq!(cfg.rpc_addr(), None);
    }

    #[test]
    fn flush_count_limit_is_capped() {
        let cfg = ServerConfig { max_flush_count: 1_000_000, ..ServerConfig::default() };
        assert_eq!(cfg.effective_max_flush_count(), MAX_FLUSH_ID);
        let cfg = ServerConfig { max_flush_count: 100, ..cfg };
        assert_eq!(cfg.effective_max_flush_count(), 100);
    }

    #[test]
    fn report_host_is_advertised() {
        let cfg = ServerConfig { report_host: Some("spindex.example.org".into()), ..ServerConfig::default() };
        let coin = cfg.coin().unwrap();
        let settings = cfg.session_settings(&coin, None);
        assert_eq!(settings.hosts["spindex.example.org"].tcp_port, Some(50001));
        assert_eq!(settings.max_send, 1_000_000);
    }
}
