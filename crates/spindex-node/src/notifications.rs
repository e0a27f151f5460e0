//! Notification bus between the indexers and sessions.
//!
//! The block processor and the mempool tracker each report the hashXs they
//! touched at a height. A block arriving makes the mempool stale until the
//! tracker has refreshed against it, so [`Notifications`] holds reports back
//! until both sides agree on a height and then publishes one merged
//! [`ChainEvent`]. A transaction that moves from the mempool into a block is
//! therefore announced once.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use spindex_core::types::HashX;

/// Capacity of the event channel; slower receivers observe `Lagged`.
pub const EVENT_CAPACITY: usize = 64;

/// Something changed at `height`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEvent {
    pub height: u32,
    pub touched: Arc<HashSet<HashX>>,
    /// Lowest common ancestor of any reorg merged into this event. Blocks
    /// above it were replaced, even those below `height`.
    pub reorg_fork: Option<u32>,
}

#[derive(Default)]
struct Pending {
    mempool: BTreeMap<u32, HashSet<HashX>>,
    blocks: BTreeMap<u32, HashSet<HashX>>,
    highest_block: Option<u32>,
    reorg_fork: Option<u32>,
}

/// Merges block and mempool reports into [`ChainEvent`]s.
pub struct Notifications {
    pending: Mutex<Pending>,
    tx: broadcast::Sender<ChainEvent>,
}

impl Default for Notifications {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifications {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { pending: Mutex::new(Pending::default()), tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.tx.subscribe()
    }

    /// Announce the starting height with nothing touched.
    pub fn start(&self, height: u32) {
        self.pending.lock().highest_block = Some(height);
        self.publish(height, HashSet::new(), None);
    }

    /// The block processor reached `height`, touching `touched`.
    pub fn on_block(&self, touched: HashSet<HashX>, height: u32) {
        self.report_block(touched, height, None);
    }

    /// The block processor backed the chain down to `fork`, touching the
    /// hashXs of every undone block.
    pub fn on_reorg(&self, touched: HashSet<HashX>, fork: u32) {
        self.report_block(touched, fork, Some(fork));
    }

    fn report_block(&self, touched: HashSet<HashX>, height: u32, fork: Option<u32>) {
        let ready = {
            let mut pending = self.pending.lock();
            pending.blocks.entry(height).or_default().extend(touched);
            pending.highest_block = Some(height);
            if let Some(fork) = fork {
                pending.reorg_fork = Some(pending.reorg_fork.map_or(fork, |f| f.min(fork)));
            }
            Self::take_ready(&mut pending)
        };
        if let Some((height, touched, fork)) = ready {
            self.publish(height, touched, fork);
        }
    }

    /// The mempool refreshed against the chain at `height`.
    pub fn on_mempool(&self, touched: HashSet<HashX>, height: u32) {
        let ready = {
            let mut pending = self.pending.lock();
            pending.mempool.entry(height).or_default().extend(touched);
            Self::take_ready(&mut pending)
        };
        if let Some((height, touched, fork)) = ready {
            self.publish(height, touched, fork);
        }
    }

    fn take_ready(pending: &mut Pending) -> Option<(u32, HashSet<HashX>, Option<u32>)> {
        let common = pending.mempool.keys().filter(|h| pending.blocks.contains_key(h)).max().copied();
        let height = match common {
            Some(height) => height,
            None => {
                let latest_mempool = pending.mempool.keys().next_back().copied();
                match (latest_mempool, pending.highest_block) {
                    (Some(m), Some(b)) if m == b => m,
                    // Waiting for the other side to catch up.
                    _ => return None,
                }
            }
        };
        let mut touched = HashSet::new();
        for map in [&mut pending.mempool, &mut pending.blocks] {
            let rest = map.split_off(&(height + 1));
            for (_, set) in std::mem::replace(map, rest) {
                touched.extend(set);
            }
        }
        Some((height, touched, pending.reorg_fork.take()))
    }

    fn publish(&self, height: u32, touched: HashSet<HashX>, reorg_fork: Option<u32>) {
        trace!(height, touched = touched.len(), ?reorg_fork, "chain event");
        // No receivers simply means no sessions yet.
        let _ = self.tx.send(ChainEvent { height, touched: Arc::new(touched), reorg_fork });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindex_core::types::HASHX_LEN;

    fn set(bytes: &[u8]) -> HashSet<HashX> {
        bytes.iter().map(|b| HashX([*b; HASHX_LEN])).collect()
    }

    fn drain(rx: &mut broadcast::Receiver<ChainEvent>) -> Vec<(u32, HashSet<HashX>)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push((event.height, (*event.touched).clone()));
        }
        out
    }

    #[test]
    fn mempool_waits_for_block() {
        let n = Notifications::new();
        let mut rx = n.subscribe();
        n.start(5);
        n.on_mempool(set(b"ab"), 6);
        assert_eq!(drain(&mut rx), vec![(5, set(b""))]);
        n.on_block(set(b"bc"), 6);
        assert_eq!(drain(&mut rx), vec![(6, set(b"abc"))]);
    }

    #[test]
    fn mempool_at_tip_notifies_immediately() {
        let n = Notifications::new();
        let mut rx = n.subscribe();
        n.start(5);
        drain(&mut rx);
        n.on_mempool(set(b"a"), 5);
        assert_eq!(drain(&mut rx), vec![(5, set(b"a"))]);
    }

    #[test]
    fn quick_blocks_merge_into_one_event() {
        let n = Notifications::new();
        let mut rx = n.subscribe();
        n.start(5);
        n.on_mempool(set(b"a"), 5);
        assert_eq!(drain(&mut rx), vec![(5, set(b"")), (5, set(b"a"))]);

        // Mempool refreshed while block 6 was still being processed.
        n.on_mempool(set(b"a"), 6);
        n.on_block(set(b"ab"), 7);
        n.on_block(set(b"c"), 8);
        assert!(drain(&mut rx).is_empty());

        n.on_mempool(set(b""), 8);
        assert_eq!(drain(&mut rx), vec![(8, set(b"abc"))]);
    }

    #[test]
    fn superseded_mempool_reports_are_kept() {
        let n = Notifications::new();
        let mut rx = n.subscribe();
        n.start(5);
        drain(&mut rx);
        n.on_mempool(set(b"m"), 6);
        n.on_block(set(b"x"), 7);
        n.on_mempool(set(b"n"), 7);
        assert_eq!(drain(&mut rx), vec![(7, set(b"mnx"))]);
    }

    #[test]
    fn block_before_mempool_waits() {
        let n = Notifications::new();
        let mut rx = n.subscribe();
        n.start(1);
        drain(&mut rx);
        n.on_block(set(b"x"), 2);
        assert!(drain(&mut rx).is_empty());
        n.on_mempool(set(b"y"), 2);
        assert_eq!(drain(&mut rx), vec![(2, set(b"xy"))]);
    }

    #[test]
    fn reorg_fork_survives_the_merge() {
        let n = Notifications::new();
        let mut rx = n.subscribe();
        n.start(4);
        drain(&mut rx);
        n.on_reorg(set(b"ab"), 2);
        n.on_block(set(b"c"), 5);
        assert!(rx.try_recv().is_err());

        n.on_mempool(set(b""), 5);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.height, 5);
        assert_eq!(*event.touched, set(b"abc"));
        assert_eq!(event.reorg_fork, Some(2));

        // Later events no longer carry it.
        n.on_block(set(b"d"), 6);
        n.on_mempool(set(b""), 6);
        assert_eq!(rx.try_recv().unwrap().reorg_fork, None);
    }
}
