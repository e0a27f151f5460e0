//! spindex-rpc — command-line client of a running server's admin interface.
//!
//! Sends one admin request to the loopback JSON-RPC port and prints the
//! reply: lists of lines one per line, anything else as indented JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use serde_json::Value;

/// Admin client for spindex-server.
#[derive(Parser, Debug)]
#[command(name = "spindex-rpc", version, about = "Send admin commands to a running spindex server")]
struct Cli {
    /// Admin RPC port of the server
    #[arg(long, short, default_value_t = 8000)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Summary of server state.
    Getinfo,
    /// Connected sessions.
    Sessions,
    /// Session groups and their costs.
    Groups,
    /// Known peer servers.
    Peers,
    /// Add a peer, e.g. "electrum.example t50001 s50002".
    AddPeer { real_name: String },
    /// Disconnect sessions by id or group name, or "all".
    Disconnect {
        #[arg(required = true)]
        session_ids: Vec<String>,
    },
    /// Toggle request logging by session id or group name, or "all", "none" or "new".
    Log {
        #[arg(required = true)]
        session_ids: Vec<String>,
    },
    /// History, UTXOs and balance of scripts (hex) or addresses.
    Query {
        #[arg(required = true)]
        items: Vec<String>,
        /// Most history and UTXO lines per item
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Undo the last blocks and resync them from the daemon.
    Reorg { count: Option<u32> },
    /// Shut the server down cleanly.
    Stop,
    /// Switch daemons; the configured URL when none is given.
    DaemonUrl { url: Option<String> },
}

impl Commands {
    /// Method name and positional parameters of the request.
    fn request(&self) -> Result<(&'static str, ArrayParams)> {
        let mut params = ArrayParams::new();
        let method = match self {
            Commands::Getinfo => "getinfo",
            Commands::Sessions => "sessions",
            Commands::Groups => "groups",
            Commands::Peers => "peers",
            Commands::Stop => "stop",
            Commands::AddPeer { real_name } => {
                params.insert(real_name)?;
                "add_peer"
            }
            Commands::Disconnect { session_ids } => {
                params.insert(session_ids)?;
                "disconnect"
            }
            Commands::Log { session_ids } => {
                params.insert(session_ids)?;
                "log"
            }
            Commands::Query { items, limit } => {
                params.insert(items)?;
                params.insert(limit)?;
                "query"
            }
            Commands::Reorg { count } => {
                params.insert(count)?;
                "reorg"
            }
            Commands::DaemonUrl { url } => {
                params.insert(url)?;
                "daemon_url"
            }
        };
        Ok((method, params))
    }
}

/// Text to print for a reply.
fn render(reply: &Value) -> Result<String> {
    match reply {
        Value::String(text) => Ok(text.clone()),
        Value::Array(items) if items.iter().all(Value::is_string) => {
            Ok(items.iter().filter_map(Value::as_str).collect::<Vec<_>>().join("\n"))
        }
        other => Ok(serde_json::to_string_pretty(other)?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (method, params) = cli.command.request()?;
    let url = format!("http://127.0.0.1:{}", cli.port);
    let client = jsonrpsee::http_client::HttpClientBuilder::default()
        .build(&url)
        .context("Failed to connect to RPC")?;

    let reply: Value = client
        .request(method, params)
        .await
        .with_context(|| format!("RPC {method} failed (is spindex-server running with its admin port at {url}?)"))?;
    println!("{}", render(&reply)?);
    Ok(())
}
