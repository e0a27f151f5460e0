//! # spindex-node: the index server proper.
//!
//! Composes the spindex subsystems into a running server:
//! - [`storage::RocksStore`]: RocksDB backend of the index store contract
//! - [`db::IndexDb`]: typed index of UTXOs, history, headers and undo records
//! - [`block_processor::BlockProcessor`]: the single writer, including reorgs
//! - [`mempool::MempoolTracker`]: local mirror of the daemon's mempool
//! - [`notifications::Notifications`]: merged chain events for sessions
//! - [`session_manager::SessionManager`]: client connections and sessions
//! - [`daemon::RpcDaemon`]: JSON-RPC client of the full node
//! - [`controller::Controller`]: startup, shutdown and exit status
//! - [`admin::AdminRpcImpl`]: loopback JSON-RPC for operators
//! - [`config::ServerConfig`]: layered configuration

pub mod admin;
pub mod block_processor;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod db;
pub mod history;
pub mod mempool;
pub mod notifications;
pub mod session;
pub mod session_manager;
pub mod storage;
pub mod testkit;

pub use admin::{start_admin_server, AdminRpcImpl};
pub use block_processor::{BlockProcessor, ProcessorConfig, ReorgHandle};
pub use config::ServerConfig;
pub use controller::{exit_code, Controller, ControllerError};
pub use daemon::{MemoryDaemon, RpcDaemon};
pub use db::IndexDb;
pub use mempool::{MempoolConfig, MempoolTracker};
pub use notifications::{ChainEvent, Notifications};
pub use session::{Session, SessionEnv, SessionSettings};
pub use session_manager::{ManagerConfig, SessionManager};
pub use storage::RocksStore;
