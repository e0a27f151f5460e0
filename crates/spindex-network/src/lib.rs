//! # spindex-network: client-facing protocol plumbing.
//!
//! JSON-RPC framing and version negotiation for client sessions, cost
//! accounting with subnet groups, and verification of peer servers.
//! Sessions themselves live in spindex-node, which owns the index.

pub mod config;
pub mod cost;
pub mod peers;
pub mod protocol;

pub use config::{CostConfig, PeerConfig};
pub use cost::{Admission, CostThrottle, GroupKey, GroupSummary, SessionId};
pub use peers::{DnsResolver, HostPorts, PeerFeatures, PeerManager, PeerVerifier, Resolver, TcpPeerVerifier};
pub use protocol::{ProtocolVersion, RpcError, RpcResult, PROTOCOL_MAX, PROTOCOL_MIN};
