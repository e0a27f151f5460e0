//! Accepting connections and running sessions.
//!
//! The [`SessionManager`] owns the TCP listener and one task per connection.
//! A connection task reads newline-delimited JSON-RPC, hands each line to its
//! [`Session`], applies the cost throttle's verdict before replying, and
//! forwards chain events as subscription notifications. Background
//! housekeeping closes idle sessions, decays group costs and logs status.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use spindex_core::types::HashX;
use spindex_network::protocol::to_line;
use spindex_network::{Admission, SessionId};

use crate::notifications::{ChainEvent, Notifications};
use crate::session::{Session, SessionEnv};

/// Limits for [`SessionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_sessions: usize,
    /// Sessions silent for longer are closed.
    pub session_timeout: Duration,
    /// Longest accepted request line in bytes.
    pub max_recv: usize,
    pub sweep_interval: Duration,
    pub log_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_timeout: Duration::from_secs(600),
            max_recv: 1_000_000,
            sweep_interval: Duration::from_secs(60),
            log_interval: Duration::from_secs(3600),
        }
    }
}

/// Counters a connection task keeps for the admin interface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub client: String,
    pub protocol: Option<String>,
    pub subs: usize,
    pub requests: u64,
    pub recv_bytes: u64,
    pub send_bytes: u64,
}

/// One row of the `sessions` admin listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub addr: String,
    pub age_secs: u64,
    pub cost: f64,
    pub groups: Vec<String>,
    pub logging: bool,
    #[serde(flatten)]
    pub stats: SessionStats,
}

/// State shared between a connection task and the session table.
struct SessionShared {
    last_recv: Mutex<Instant>,
    stats: Mutex<SessionStats>,
    log: AtomicBool,
}

impl SessionShared {
    fn new(log: bool) -> Self {
        Self {
            last_recv: Mutex::new(Instant::now()),
            stats: Mutex::new(SessionStats::default()),
            log: AtomicBool::new(log),
        }
    }
}

enum Target {
    Session(SessionId),
    Group(Vec<SessionId>),
}

struct SessionEntry {
    addr: SocketAddr,
    opened: Instant,
    shared: Arc<SessionShared>,
    closer: watch::Sender<bool>,
}

/// Runs every client session.
pub struct SessionManager {
    env: Arc<SessionEnv>,
    notifications: Arc<Notifications>,
    config: ManagerConfig,
    sessions: DashMap<SessionId, SessionEntry>,
    next_id: AtomicU64,
    paused: AtomicBool,
    /// Whether sessions start with request logging on.
    log_new: AtomicBool,
}

/// Outcome of reading one request line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineRead {
    Line,
    TooLong,
    Eof,
}

/// Read up to the next newline into `buf`, without it.
///
/// Bytes read before a cancellation stay in `buf`, so calling again after a
/// `select!` picked another branch continues the same line.
pub(crate) async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> io::Result<LineRead> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(LineRead::Eof);
        }
        let (taken, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => {
                buf.extend_from_slice(&available[..i]);
                (i + 1, true)
            }
            None => {
                buf.extend_from_slice(available);
                (available.len(), false)
            }
        };
        reader.consume(taken);
        if buf.len() > max {
            return Ok(LineRead::TooLong);
        }
        if done {
            return Ok(LineRead::Line);
        }
    }
}

/// Merge every event already queued behind `first`. `None` when the
/// receiver lagged and some events were lost.
fn coalesce(first: ChainEvent, events: &mut broadcast::Receiver<ChainEvent>) -> Option<HashSet<HashX>> {
    let mut touched: Option<HashSet<HashX>> = Some(first.touched.iter().copied().collect());
    loop {
        match events.try_recv() {
            Ok(event) => {
                if let Some(set) = touched.as_mut() {
                    set.extend(event.touched.iter().copied());
                }
            }
            Err(TryRecvError::Lagged(_)) => touched = None,
            Err(_) => return touched,
        }
    }
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Value) -> io::Result<usize> {
    let line = to_line(message);
    writer.write_all(&line).await?;
    Ok(line.len())
}

impl SessionManager {
    pub fn new(env: Arc<SessionEnv>, notifications: Arc<Notifications>, config: ManagerConfig) -> Self {
        Self {
            env,
            notifications,
            config,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            paused: AtomicBool::new(false),
            log_new: AtomicBool::new(false),
        }
    }

    pub fn env(&self) -> &Arc<SessionEnv> {
        &self.env
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether new connections are currently accepted.
    pub fn accepting(&self) -> bool {
        !self.paused.load(Ordering::Relaxed)
    }

    /// Decide whether to take another connection. Refusing starts once
    /// `max_sessions` is reached and stops below 95% of it.
    fn admit(&self) -> bool {
        let count = self.sessions.len();
        let max = self.config.max_sessions;
        if self.paused.load(Ordering::Relaxed) {
            if count > max * 19 / 20 {
                return false;
            }
            self.paused.store(false, Ordering::Relaxed);
            info!(sessions = count, "accepting connections again");
            return true;
        }
        if count >= max {
            self.paused.store(true, Ordering::Relaxed);
            warn!(sessions = count, max, "session limit reached, refusing connections");
            return false;
        }
        true
    }

    /// Accept connections until `shutdown` flips, then close every session.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "listening for clients");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if !self.admit() {
                        debug!(%addr, "connection refused");
                        continue;
                    }
                    let manager = self.clone();
                    tokio::spawn(async move { manager.run_connection(stream, addr).await });
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(sessions = self.sessions.len(), "closing sessions");
        for entry in self.sessions.iter() {
            entry.closer.send_replace(true);
        }
        Ok(())
    }

    /// Close session `id` if it is connected.
    pub fn close_session(&self, id: SessionId) -> bool {
        match self.sessions.get(&id) {
            Some(entry) => {
                entry.closer.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Every connected session, oldest first.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        let cost = &self.env.cost;
        let mut rows: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                id: *entry.key(),
                addr: entry.addr.to_string(),
                age_secs: entry.opened.elapsed().as_secs(),
                cost: cost.cost(*entry.key()),
                groups: cost.session_groups(*entry.key()).iter().map(ToString::to_string).collect(),
                logging: entry.shared.log.load(Ordering::Relaxed),
                stats: entry.shared.stats.lock().clone(),
            })
            .collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    /// Resolve a session id or a group name.
    fn resolve_target(&self, target: &str) -> Option<Target> {
        if let Ok(id) = target.parse::<SessionId>() {
            return self.sessions.contains_key(&id).then_some(Target::Session(id));
        }
        self.env.cost.groups().into_iter().find(|g| g.key.as_str() == target).map(|g| Target::Group(g.sessions))
    }

    /// Close the sessions named by id or group, or all of them. Returns
    /// one line per target.
    pub fn disconnect(&self, targets: &[String]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut ids = BTreeSet::new();
        for target in targets {
            if target == "all" {
                ids.extend(self.sessions.iter().map(|e| *e.key()));
                lines.push("disconnecting all sessions".to_string());
                continue;
            }
            match self.resolve_target(target) {
                Some(Target::Session(id)) => {
                    lines.push(format!("disconnecting session {id}"));
                    ids.insert(id);
                }
                Some(Target::Group(members)) => {
                    lines.push(format!("disconnecting group {target}"));
                    ids.extend(members);
                }
                None => lines.push(format!("unknown: {target}")),
            }
        }
        let closed = ids.into_iter().filter(|id| self.close_session(*id)).count();
        if closed > 0 {
            info!(closed, "disconnecting sessions on admin request");
        }
        lines
    }

    /// Switch request logging. `all` and `none` set every session and
    /// sessions yet to connect, `new` flips the latter only, and ids or
    /// group names flip those sessions. Returns one line per change.
    pub fn toggle_log(&self, targets: &[String]) -> Vec<String> {
        let describe = |on: bool, what: String| if on { format!("logging {what}") } else { format!("not logging {what}") };
        let mut lines = Vec::new();
        let mut flipped = HashSet::new();
        let mut flip = |id: SessionId, lines: &mut Vec<String>| {
            if !flipped.insert(id) {
                return;
            }
            if let Some(entry) = self.sessions.get(&id) {
                let on = !entry.shared.log.fetch_xor(true, Ordering::Relaxed);
                lines.push(describe(on, format!("session {id}")));
            }
        };
        for target in targets {
            match target.as_str() {
                "all" | "none" => {
                    let on = target == "all";
                    for entry in self.sessions.iter() {
                        entry.shared.log.store(on, Ordering::Relaxed);
                    }
                    self.log_new.store(on, Ordering::Relaxed);
                    lines.push(if on { "logging all sessions" } else { "logging no sessions" }.to_string());
                }
                "new" => {
                    let on = !self.log_new.fetch_xor(true, Ordering::Relaxed);
                    lines.push(describe(on, "new sessions".to_string()));
                }
                _ => match self.resolve_target(target) {
                    Some(Target::Session(id)) => flip(id, &mut lines),
                    Some(Target::Group(members)) => {
                        for id in members {
                            flip(id, &mut lines);
                        }
                    }
                    None => lines.push(format!("unknown: {target}")),
                },
            }
        }
        lines
    }

    /// Close sessions idle past the timeout. Returns how many.
    pub fn sweep_stale(&self) -> usize {
        let timeout = self.config.session_timeout;
        let mut closed = 0;
        for entry in self.sessions.iter() {
            if entry.shared.last_recv.lock().elapsed() > timeout {
                debug!(session = *entry.key(), addr = %entry.addr, "closing idle session");
                entry.closer.send_replace(true);
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "closed stale sessions");
        }
        closed
    }

    /// Periodic maintenance until `shutdown` flips.
    pub async fn housekeeping(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        let mut decay = tokio::time::interval(self.env.cost.config().group_decay_interval);
        let mut status = tokio::time::interval(self.config.log_interval);
        let mut events = self.notifications.subscribe();
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    self.sweep_stale();
                }
                _ = decay.tick() => {
                    let dropped = self.env.cost.decay_groups();
                    if dropped > 0 {
                        debug!(dropped, "dropped idle cost groups");
                    }
                }
                _ = status.tick() => info!(
                    sessions = self.sessions.len(),
                    groups = self.env.cost.group_count(),
                    subs = self.env.subscription_count(),
                    "session status"
                ),
                event = events.recv() => match event {
                    Ok(event) => self.env.on_chain_event(&event),
                    Err(RecvError::Lagged(_)) => self.env.clear_block_caches(),
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (closer, close_rx) = watch::channel(false);
        let shared = Arc::new(SessionShared::new(self.log_new.load(Ordering::Relaxed)));
        self.sessions.insert(id, SessionEntry { addr, opened: Instant::now(), shared: shared.clone(), closer });
        debug!(session = id, %addr, "session opened");

        let (reader, writer) = stream.into_split();
        let session = Session::new(id, addr, self.env.clone());
        let result = self.drive(session, BufReader::new(reader), writer, close_rx, shared).await;
        if let Err(e) = result {
            debug!(session = id, error = %e, "session i/o error");
        }
        self.sessions.remove(&id);
        debug!(session = id, "session closed");
    }

    /// Run `session` over a reader and writer until either side closes.
    async fn drive<R, W>(
        &self,
        mut session: Session,
        mut reader: R,
        mut writer: W,
        mut close_rx: watch::Receiver<bool>,
        shared: Arc<SessionShared>,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let id = session.id();
        let cost = self.env.cost.clone();
        let mut events = self.notifications.subscribe();
        let mut buf = Vec::new();
        loop {
            tokio::select! {
                _ = close_rx.changed() => break,
                read = read_line(&mut reader, &mut buf, self.config.max_recv) => {
                    match read? {
                        LineRead::Eof => break,
                        LineRead::TooLong => {
                            info!(session = id, max = self.config.max_recv, "request line too long");
                            break;
                        }
                        LineRead::Line => {}
                    }
                    *shared.last_recv.lock() = Instant::now();
                    let line = std::mem::take(&mut buf);
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    if shared.log.load(Ordering::Relaxed) {
                        info!(session = id, request = %String::from_utf8_lossy(&line), "request");
                    }
                    let response = session.handle_line(&line).await;
                    {
                        let mut stats = shared.stats.lock();
                        stats.requests += 1;
                        stats.recv_bytes += line.len() as u64 + 1;
                        stats.subs = session.subscription_count();
                        stats.protocol = session.protocol_version().map(|v| v.to_string());
                        if stats.client != session.client() {
                            stats.client = session.client().to_string();
                        }
                    }
                    match cost.admission(id) {
                        Admission::Disconnect => {
                            info!(session = id, addr = %session.addr(), "disconnecting: cost limit exceeded");
                            break;
                        }
                        Admission::Delay(delay) => tokio::time::sleep(delay).await,
                        Admission::Proceed => {}
                    }
                    if let Some(response) = response {
                        let sent = write_message(&mut writer, &response).await?;
                        cost.charge_bytes(id, sent);
                        shared.stats.lock().send_bytes += sent as u64;
                    }
                    if session.should_close() {
                        break;
                    }
                }
                event = events.recv() => {
                    let touched = match event {
                        Ok(event) => coalesce(event, &mut events),
                        Err(RecvError::Lagged(missed)) => {
                            debug!(session = id, missed, "session lagged behind chain events");
                            None
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if session.protocol_version().is_none() {
                        continue;
                    }
                    for message in session.notifications(touched.as_ref()) {
                        let sent = write_message(&mut writer, &message).await?;
                        cost.charge_bytes(id, sent);
                        shared.stats.lock().send_bytes += sent as u64;
                    }
                }
            }
        }
        writer.flush().await?;
        Ok(())
    }
}
