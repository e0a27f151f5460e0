//! Per-session and per-subnet cost accounting.
//!
//! Every request a session makes adds to its cost; the cost leaks away over
//! time. Sessions whose address falls in the same subnet form a group, and a
//! session's *effective* cost includes what the other members of its groups
//! have spent. When a session disconnects its cost stays with its groups as
//! retained cost, so reconnecting from the same subnet does not reset it.
//!
//! # Thresholds
//!
//! - effective cost at or below `soft_limit`: served immediately
//! - between the limits: served after a delay proportional to the excess
//! - at or above `hard_limit`: disconnected

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::CostConfig;

/// Identifier of a client session.
pub type SessionId = u64;

/// Request costs, in abstract cost units.
pub mod costs {
    pub const SERVER_VERSION: f64 = 0.5;
    pub const PING: f64 = 0.1;
    pub const HEADERS_SUBSCRIBE: f64 = 0.25;
    pub const BLOCK_HEADER: f64 = 0.25;
    pub const CHECKPOINT_PROOF: f64 = 1.0;
    pub const HEADERS_PER_CHUNK_OF_50: f64 = 1.0;
    pub const RELAYFEE: f64 = 1.0;
    pub const ESTIMATEFEE: f64 = 0.1;
    pub const ESTIMATEFEE_DAEMON: f64 = 2.0;
    pub const BROADCAST: f64 = 0.25;
    pub const BROADCAST_PER_BYTE: f64 = 1.0 / 5000.0;
    pub const TRANSACTION_GET: f64 = 1.0;
    pub const TX_HASHES_LOOKUP: f64 = 0.25;
    pub const TX_HASHES_PER_TX: f64 = 0.000_04;
    pub const MERKLE_BRANCH: f64 = 0.1;
    pub const UNSUBSCRIBE: f64 = 0.1;
    pub const UTXOS: f64 = 1.0;
    pub const UTXOS_PER_50: f64 = 1.0;
    pub const HISTORY: f64 = 0.2;
    pub const HISTORY_PER_ENTRY: f64 = 0.001;
    pub const MEMPOOL: f64 = 0.25;
    pub const MEMPOOL_PER_50: f64 = 1.0;
    pub const STATUS: f64 = 0.1;
    pub const STATUS_PER_BYTE: f64 = 0.000_02;
    pub const ADD_PEER: f64 = 100.0;
    pub const PEERS_SUBSCRIBE: f64 = 1.0;
    pub const BANNER: f64 = 0.5;
    pub const DONATION_ADDRESS: f64 = 0.1;
    pub const FEATURES: f64 = 0.2;
    pub const FEE_HISTOGRAM: f64 = 1.0;
}

/// Subnet a client address belongs to, e.g. `203.0.113.0/24`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Groups an address belongs to. Private and loopback addresses are
/// ungrouped.
pub fn group_keys(ip: IpAddr, config: &CostConfig) -> Vec<GroupKey> {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    if is_private(&ip) {
        return Vec::new();
    }
    let key = match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(config.group_ipv4_prefix.min(32));
            let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
            format!("{}/{}", Ipv4Addr::from(u32::from(v4) & mask), bits)
        }
        IpAddr::V6(v6) => {
            let bits = u32::from(config.group_ipv6_prefix.min(128));
            let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
            format!("{}/{}", Ipv6Addr::from(u128::from(v6) & mask), bits)
        }
    };
    vec![GroupKey(key)]
}

/// Verdict for the next response of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Proceed,
    Delay(Duration),
    Disconnect,
}

/// One subnet group as the admin interface lists it.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSummary {
    pub key: GroupKey,
    pub cost: f64,
    pub retained: f64,
    pub sessions: Vec<SessionId>,
}

#[derive(Debug)]
struct SessionCost {
    cost: f64,
    decay_per_sec: f64,
    updated: Instant,
    groups: Vec<GroupKey>,
}

impl SessionCost {
    fn current(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        (self.cost - self.decay_per_sec * elapsed).max(0.0)
    }

    fn settle(&mut self, now: Instant) {
        self.cost = self.current(now);
        self.updated = now;
    }
}

#[derive(Debug, Default)]
struct Group {
    retained: f64,
    members: HashSet<SessionId>,
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<SessionId, SessionCost>,
    groups: HashMap<GroupKey, Group>,
}

impl State {
    fn group_cost(&self, key: &GroupKey, now: Instant) -> f64 {
        self.groups.get(key).map_or(0.0, |group| {
            group.retained
                + group
                    .members
                    .iter()
                    .filter_map(|id| self.sessions.get(id))
                    .map(|s| s.current(now))
                    .sum::<f64>()
        })
    }

    fn effective_cost(&self, id: SessionId, weight: f64, now: Instant) -> f64 {
        let Some(session) = self.sessions.get(&id) else {
            return 0.0;
        };
        let own = session.current(now);
        let extra: f64 = session
            .groups
            .iter()
            .map(|key| (self.group_cost(key, now) - own) * weight)
            .sum();
        own + extra.max(0.0)
    }
}

/// Shared cost ledger for all sessions.
pub struct CostThrottle {
    config: CostConfig,
    state: Mutex<State>,
}

impl CostThrottle {
    pub fn new(config: CostConfig) -> Self {
        Self { config, state: Mutex::new(State::default()) }
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------

    /// Start accounting for a new session connecting from `ip`.
    pub fn register(&self, id: SessionId, ip: IpAddr) {
        let groups = group_keys(ip, &self.config);
        let mut state = self.state.lock();
        for key in &groups {
            state.groups.entry(key.clone()).or_default().members.insert(id);
        }
        debug!(session = id, %ip, groups = groups.len(), "cost: session registered");
        state.sessions.insert(
            id,
            SessionCost {
                cost: 0.0,
                decay_per_sec: self.config.decay_per_sec(),
                updated: Instant::now(),
                groups,
            },
        );
    }

    /// Stop accounting for a session, leaving its cost with its groups.
    pub fn remove(&self, id: SessionId) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(session) = state.sessions.remove(&id) else {
            return;
        };
        let cost = session.current(now);
        for key in &session.groups {
            if let Some(group) = state.groups.get_mut(key) {
                group.members.remove(&id);
                group.retained += cost;
            }
        }
        debug!(session = id, cost, "cost: session removed");
    }

    // -------------------------------------------------------------------------
    // Charging
    // -------------------------------------------------------------------------

    /// Add `cost` units to a session.
    pub fn charge(&self, id: SessionId, cost: f64) {
        let now = Instant::now();
        if let Some(session) = self.state.lock().sessions.get_mut(&id) {
            session.settle(now);
            session.cost += cost;
        }
    }

    /// Charge for `bytes` sent to the session.
    pub fn charge_bytes(&self, id: SessionId, bytes: usize) {
        if self.config.bw_unit_cost > 0.0 {
            self.charge(id, bytes as f64 / self.config.bw_unit_cost);
        }
    }

    /// Slow a session's decay in proportion to its subscriptions, which
    /// generate notification traffic without requests.
    pub fn set_subscriptions(&self, id: SessionId, count: usize) {
        let now = Instant::now();
        if let Some(session) = self.state.lock().sessions.get_mut(&id) {
            session.settle(now);
            session.decay_per_sec = self.config.hard_limit / (10_000.0 + 5.0 * count as f64);
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// The session's own decayed cost.
    pub fn cost(&self, id: SessionId) -> f64 {
        let now = Instant::now();
        self.state.lock().sessions.get(&id).map_or(0.0, |s| s.current(now))
    }

    /// Own cost plus the weighted cost of the session's group peers.
    pub fn effective_cost(&self, id: SessionId) -> f64 {
        self.state.lock().effective_cost(id, self.config.group_weight, Instant::now())
    }

    pub fn group_cost(&self, key: &GroupKey) -> f64 {
        self.state.lock().group_cost(key, Instant::now())
    }

    /// Decide how to treat the session's next response.
    pub fn admission(&self, id: SessionId) -> Admission {
        if !self.config.enabled() {
            return Admission::Proceed;
        }
        let cost = self.effective_cost(id);
        let (soft, hard) = (self.config.soft_limit, self.config.hard_limit);
        if cost >= hard {
            info!(session = id, cost, hard, "cost: hard limit reached");
            Admission::Disconnect
        } else if cost > soft {
            let fraction = ((cost - soft) / (hard - soft).max(f64::EPSILON)).min(1.0);
            Admission::Delay(self.config.request_sleep.mul_f64(fraction))
        } else {
            Admission::Proceed
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Every group, sorted by key.
    pub fn groups(&self) -> Vec<GroupSummary> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut groups: Vec<GroupSummary> = state
            .groups
            .iter()
            .map(|(key, group)| {
                let mut sessions: Vec<SessionId> = group.members.iter().copied().collect();
                sessions.sort_unstable();
                GroupSummary { key: key.clone(), cost: state.group_cost(key, now), retained: group.retained, sessions }
            })
            .collect();
        groups.sort_by(|a, b| a.key.cmp(&b.key));
        groups
    }

    pub fn session_groups(&self, id: SessionId) -> Vec<GroupKey> {
        self.state.lock().sessions.get(&id).map(|s| s.groups.clone()).unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Decay retained group cost by one interval's worth and drop groups
    /// with no members and no retained cost. Returns the number dropped.
    pub fn decay_groups(&self) -> usize {
        let decay = self.config.group_decay();
        let mut state = self.state.lock();
        let before = state.groups.len();
        state.groups.retain(|_, group| {
            group.retained = (group.retained - decay).max(0.0);
            !group.members.is_empty() || group.retained > 0.0
        });
        before - state.groups.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
