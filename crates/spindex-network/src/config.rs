//! Settings for session cost accounting and peer management.

use std::time::Duration;

use crate::protocol::{ProtocolVersion, PROTOCOL_MAX, PROTOCOL_MIN};

/// Limits and rates for [`crate::cost::CostThrottle`].
#[derive(Debug, Clone)]
pub struct CostConfig {
    /// Above this effective cost responses are delayed.
    pub soft_limit: f64,
    /// At or above this effective cost the session is disconnected.
    pub hard_limit: f64,
    /// Delay applied when the cost reaches the hard limit; scaled linearly
    /// between the soft and hard limits.
    pub request_sleep: Duration,
    /// Bytes sent per unit of cost.
    pub bw_unit_cost: f64,
    /// Prefix length grouping IPv4 clients.
    pub group_ipv4_prefix: u8,
    /// Prefix length grouping IPv6 clients.
    pub group_ipv6_prefix: u8,
    /// Share of a group's cost attributed to each member.
    pub group_weight: f64,
    /// Period of retained group cost decay.
    pub group_decay_interval: Duration,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            soft_limit: 1000.0,
            hard_limit: 10_000.0,
            request_sleep: Duration::from_millis(2500),
            bw_unit_cost: 5000.0,
            group_ipv4_prefix: 24,
            group_ipv6_prefix: 48,
            group_weight: 1.0,
            group_decay_interval: Duration::from_secs(300),
        }
    }
}

impl CostConfig {
    /// A hard limit of zero disables cost accounting.
    pub fn enabled(&self) -> bool {
        self.hard_limit > 0.0
    }

    /// Base per-second decay of a session's cost.
    pub fn decay_per_sec(&self) -> f64 {
        self.hard_limit / 10_000.0
    }

    /// Retained group cost removed each [`group_decay_interval`](Self::group_decay_interval).
    pub fn group_decay(&self) -> f64 {
        self.group_decay_interval.as_secs_f64() * self.hard_limit / 5000.0
    }
}

/// Settings for [`crate::peers::PeerManager`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// `host:port` peers verified at startup.
    pub seeds: Vec<String>,
    /// Genesis hash (display hex) a peer must share.
    pub genesis_hash: String,
    pub protocol_min: ProtocolVersion,
    pub protocol_max: ProtocolVersion,
    /// First blacklist period; doubles with each consecutive failure.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures after which a peer is forgotten.
    pub max_failures: u32,
    /// How often verified peers are re-checked.
    pub verify_interval: Duration,
    /// Connect and response timeout for a verification round.
    pub verify_timeout: Duration,
    /// Maximum peers returned by `server.peers.subscribe`.
    pub max_returned: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            genesis_hash: String::new(),
            protocol_min: PROTOCOL_MIN,
            protocol_max: PROTOCOL_MAX,
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(6 * 60 * 60),
            max_failures: 8,
            verify_interval: Duration::from_secs(600),
            verify_timeout: Duration::from_secs(30),
            max_returned: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cost_rates() {
        let cfg = CostConfig::default();
        assert!(cfg.enabled());
        assert_eq!(cfg.decay_per_sec(), 1.0);
        assert_eq!(cfg.group_decay(), 600.0);
    }

    #[test]
    fn zero_hard_limit_disables() {
        let cfg = CostConfig { hard_limit: 0.0, ..CostConfig::default() };
        assert!(!cfg.enabled());
    }

    #[test]
    fn default_peer_range_matches_protocol() {
        let cfg = PeerConfig::default();
        assert!(cfg.protocol_min <= cfg.protocol_max);
        assert!(cfg.base_backoff < cfg.max_backoff);
    }
}
