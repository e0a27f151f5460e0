//! Server composition and lifecycle.
//!
//! The [`Controller`] opens the index, starts the block processor and waits
//! for it to catch up with the daemon before starting the mempool tracker,
//! the client listener, peer discovery and the loopback admin RPC. It stops
//! every task when the processor fails or shutdown is requested, locally or
//! over admin RPC, and maps the outcome onto the process exit status.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use spindex_core::error::IndexError;
use spindex_core::traits::Daemon;
use spindex_network::{CostThrottle, DnsResolver, PeerManager, TcpPeerVerifier};

use crate::admin::{start_admin_server, AdminRpcImpl};
use crate::block_processor::BlockProcessor;
use crate::config::ServerConfig;
use crate::daemon::RpcDaemon;
use crate::db::IndexDb;
use crate::mempool::MempoolTracker;
use crate::notifications::Notifications;
use crate::session::{server_subversion, SessionEnv};
use crate::session_manager::SessionManager;
use crate::storage::RocksStore;

/// Exit status for a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit status after a fatal error.
pub const EXIT_FATAL: i32 = 1;
/// Exit status when history must be compacted before restarting.
pub const EXIT_NEEDS_COMPACTION: i32 = 65;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("configuration: {0}")] Config(#[from] ::config::ConfigError),
    #[error(transparent)] Index(#[from] IndexError),
    #[error("i/o: {0}")] Io(#[from] io::Error),
    #[error("task failed: {0}")] Task(String),
}

impl ControllerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ControllerError::Index(e) if e.needs_compaction() => EXIT_NEEDS_COMPACTION,
            _ => EXIT_FATAL,
        }
    }
}

/// Exit status for the outcome of [`Controller::run`].
pub fn exit_code(result: &Result<(), ControllerError>) -> i32 {
    match result {
        Ok(()) => EXIT_OK,
        Err(e) => e.exit_code(),
    }
}

/// Runs a server instance.
pub struct Controller {
    config: ServerConfig,
}

impl Controller {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open the on-disk index and the daemon connection, bind the client
    /// port and serve until `shutdown` flips or a task fails.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let coin = self.config.coin()?;
        let data_dir = self.config.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        info!(
            server = %server_subversion(),
            coin = coin.name,
            data_dir = %data_dir.display(),
            "starting"
        );

        let store = Arc::new(RocksStore::open(self.config.db_path())?);
        let db = Arc::new(IndexDb::open(store, coin.clone(), self.config.effective_max_flush_count())?);
        let daemon = RpcDaemon::new(&self.config.daemon_url, self.config.daemon_timeout()).map_err(IndexError::from)?;
        info!(daemon = %daemon.logged_url(), "daemon configured");

        let addr = self.config.tcp_addr(&coin);
        let listener = TcpListener::bind(&addr).await?;
        self.serve(db, Arc::new(daemon), listener, shutdown).await
    }

    /// Serve over an opened index and daemon.
    pub async fn serve(
        &self,
        db: Arc<IndexDb>,
        daemon: Arc<dyn Daemon>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        let coin = db.coin().clone();
        let (stop, stopping) = watch::channel(false);
        let notifications = Arc::new(Notifications::new());

        let processor =
            BlockProcessor::new(db.clone(), daemon.clone(), notifications.clone(), self.config.processor_config());
        let mut synced = processor.synced();
        let reorg = processor.reorg_handle();
        let mut processor_task = tokio::spawn(processor.run(stopping.clone()));

        info!(height = ?db.height(), "catching up with daemon");
        let mut stopped = None;
        let caught_up = tokio::select! {
            result = synced.wait_for(Option::is_some) => result.is_ok(),
            _ = shutdown.changed() => false,
            result = &mut processor_task => {
                stopped = Some(result);
                false
            }
        };
        if !caught_up {
            stop.send_replace(true);
            return match stopped {
                Some(result) => joined(result),
                None => finish(processor_task, &self.config).await,
            };
        }

        let mempool = Arc::new(MempoolTracker::new(
            db.clone(),
            daemon.clone(),
            notifications.clone(),
            self.config.mempool_config(),
        ));
        let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(mempool.clone().run(stopping.clone()))];

        let peers = if self.config.peer_discovery {
            let peer_config = self.config.peer_config(&coin);
            let verifier = TcpPeerVerifier {
                client_name: server_subversion(),
                protocol_min: peer_config.protocol_min,
                protocol_max: peer_config.protocol_max,
                timeout: peer_config.verify_timeout,
            };
            let peers = Arc::new(PeerManager::new(peer_config, Arc::new(verifier), Arc::new(DnsResolver)));
            peers.add_seeds();
            tasks.push(tokio::spawn(peers.clone().run(stopping.clone())));
            Some(peers)
        } else {
            None
        };

        let banner = match &self.config.banner_file {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read banner file");
                    None
                }
            },
            None => None,
        };
        let env = Arc::new(SessionEnv::new(
            db.clone(),
            mempool,
            daemon,
            Arc::new(CostThrottle::new(self.config.cost_config())),
            peers,
            self.config.session_settings(&coin, banner),
        ));
        let manager = Arc::new(SessionManager::new(env, notifications, self.config.manager_config()));
        tasks.push(tokio::spawn(manager.clone().housekeeping(stopping.clone())));

        let (admin_stop, mut admin_stopping) = watch::channel(false);
        let admin = match self.config.rpc_addr() {
            Some(addr) => {
                let admin = AdminRpcImpl::new(manager.clone(), reorg, admin_stop, self.config.daemon_url.clone());
                match start_admin_server(&addr, admin).await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(%addr, error = %e, "cannot start admin rpc");
                        None
                    }
                }
            }
            None => None,
        };

        let serve_stop = stopping.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = manager.serve(listener, serve_stop).await {
                error!(error = %e, "listener failed");
            }
        }));

        tokio::select! {
            _ = shutdown.changed() => info!("shutdown requested"),
            Ok(_) = admin_stopping.wait_for(|stop| *stop) => info!("shutdown requested over admin rpc"),
            result = &mut processor_task => stopped = Some(result),
        }
        stop.send_replace(true);
        if let Some(handle) = admin {
            let _ = handle.stop();
        }
        for task in tasks {
            let _ = task.await;
        }
        match stopped {
            Some(result) => joined(result),
            None => finish(processor_task, &self.config).await,
        }
    }
}

/// Wait for the processor to flush and stop, bounded by the shutdown
/// timeout.
async fn finish(
    processor_task: JoinHandle<Result<(), IndexError>>,
    config: &ServerConfig,
) -> Result<(), ControllerError> {
    let timeout = config.shutdown_timeout();
    match tokio::time::timeout(timeout, processor_task).await {
        Ok(result) => joined(result),
        Err(_) => {
            error!(?timeout, "block processor did not stop in time");
            Err(ControllerError::Task("block processor shutdown timed out".into()))
        }
    }
}

fn joined(result: Result<Result<(), IndexError>, tokio::task::JoinError>) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(ControllerError::Task(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    use spindex_core::error::ChainStateError;
    use spindex_core::store::MemoryStore;

    use crate::daemon::MemoryDaemon;
    use crate::testkit::{p2pkh_script, ChainBuilder};

    fn test_config() -> ServerConfig {
        ServerConfig { network: "regtest".into(), peer_discovery: false, rpc_port: 0, ..ServerConfig::default() }
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&Ok(())), EXIT_OK);
        let overflow: IndexError = ChainStateError::HistoryOverflow { flush_count: 65_535, limit: 65_535 }.into();
        assert_eq!(exit_code(&Err(overflow.into())), EXIT_NEEDS_COMPACTION);
        let missing: IndexError = ChainStateError::MissingUtxo("00:0".into()).into();
        assert_eq!(exit_code(&Err(missing.into())), EXIT_FATAL);
        assert_eq!(exit_code(&Err(ControllerError::Task("x".into()))), EXIT_FATAL);
    }

    #[tokio::test]
    async fn serves_clients_after_catching_up() {
        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(3, &p2pkh_script(1));
        let db = Arc::new(IndexDb::open(Arc::new(MemoryStore::new()), chain.coin(), 65_535).unwrap());
        let daemon = Arc::new(chain.daemon());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let controller = Controller::new(test_config());
        let server = tokio::spawn(async move { controller.serve(db, daemon, listener, shutdown_rx).await });

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = TcpStream::connect(addr).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let (reader, mut writer) = stream.unwrap().into_split();
        let mut lines = BufReader::new(reader).lines();
        for (id, method, params) in
            [(1, "server.version", json!(["t", "1.4"])), (2, "blockchain.headers.subscribe", json!([]))]
        {
            let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
            writer.write_all(format!("{request}\n").as_bytes()).await.unwrap();
        }
        let _version: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let tip: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(tip["result"]["height"], json!(3));

        shutdown_tx.send_replace(true);
        let result = tokio::time::timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn fatal_processor_error_stops_the_server() {
        let chain = ChainBuilder::new();
        let db = Arc::new(IndexDb::open(Arc::new(MemoryStore::new()), chain.coin(), 65_535).unwrap());
        // A daemon whose first block is not the coin's genesis.
        let mut alien = ChainBuilder::new();
        alien.add_empty_blocks(1, &p2pkh_script(3));
        let daemon = MemoryDaemon::new();
        daemon.push_block(alien.block(1));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = Controller::new(test_config());
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            controller.serve(db, Arc::new(daemon), listener, shutdown_rx),
        )
        .await
        .unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, ControllerError::Index(IndexError::ChainState(_))));
        assert_eq!(err.exit_code(), EXIT_FATAL);
    }

    #[tokio::test]
    async fn admin_stop_shuts_the_server_down() {
        use jsonrpsee::core::client::ClientT;
        use jsonrpsee::http_client::HttpClientBuilder;
        use jsonrpsee::rpc_params;

        let mut chain = ChainBuilder::new();
        chain.add_empty_blocks(2, &p2pkh_script(1));
        let db = Arc::new(IndexDb::open(Arc::new(MemoryStore::new()), chain.coin(), 65_535).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = Controller::new(ServerConfig { rpc_port, ..test_config() });
        let server =
            tokio::spawn(async move { controller.serve(db, Arc::new(chain.daemon()), listener, shutdown_rx).await });

        let client = HttpClientBuilder::default().build(format!("http://127.0.0.1:{rpc_port}")).unwrap();
        let mut reply: Option<String> = None;
        for _ in 0..50 {
            if let Ok(r) = client.request("stop", rpc_params![]).await {
                reply = Some(r);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(reply.as_deref(), Some("stopping"));
        let result = tokio::time::timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
