//! # Neighbor and Relayer Tracking
//!
//! [`NeighborMap`] maps a node identity to its live [`PeerSession`]. The
//! distinctive operation is `put` (insert-if-absent): a `false` return is a
//! broken caller invariant, and call sites abort on it.
//!
//! [`RelayersMap`] records which remote relayers have recently advertised a
//! given destination. Records carry an activity timestamp with a 60 s TTL:
//! expired records are invisible to readers and pruned on write.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::identity::NodeId;
use crate::session::PeerSession;

/// How long a remote relayer advertisement stays visible.
pub const RELAYER_ACTIVE_TTL: Duration = Duration::from_secs(60);

/// Identity → live session. Point reads take the shared lock; snapshots do
/// too, so iteration never holds the map against writers.
pub struct NeighborMap {
    inner: RwLock<HashMap<NodeId, Arc<PeerSession>>>,
}

impl NeighborMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &NodeId) -> Option<Arc<PeerSession>> {
        self.inner.read().expect("neighbor lock poisoned").get(key).cloned()
    }

    /// Insert-if-absent. `false` means the slot was occupied; callers
    /// treat that as a design violation and abort.
    pub fn put(&self, key: NodeId, session: Arc<PeerSession>) -> bool {
        let mut map = self.inner.write().expect("neighbor lock poisoned");
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, session);
        true
    }

    /// Unconditional overwrite. The displaced session, if any, must have
    /// been disconnected by the caller beforehand.
    pub fn set(&self, key: NodeId, session: Arc<PeerSession>) {
        self.inner
            .write()
            .expect("neighbor lock poisoned")
            .insert(key, session);
    }

    pub fn delete(&self, key: &NodeId) {
        self.inner.write().expect("neighbor lock poisoned").remove(key);
    }

    /// Snapshot of all sessions for lock-free iteration.
    pub fn slice(&self) -> Vec<Arc<PeerSession>> {
        self.inner
            .read()
            .expect("neighbor lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("neighbor lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NeighborMap {
    fn default() -> Self {
        Self::new()
    }
}

struct RemoteRelayerRecord {
    id: NodeId,
    active_at: Instant,
}

/// Destination → recently-active relayer identities.
pub struct RelayersMap {
    inner: RwLock<HashMap<NodeId, Vec<RemoteRelayerRecord>>>,
}

impl RelayersMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Record that `relayer` currently serves `dest`. Refreshes the
    /// activity timestamp of an existing (dest, relayer) pair.
    pub fn add(&self, dest: NodeId, relayer: NodeId) {
        self.add_at(dest, relayer, Instant::now());
    }

    /// Still-active relayer ids for `dest`.
    pub fn get(&self, dest: &NodeId) -> Vec<NodeId> {
        self.get_at(dest, Instant::now())
    }

    fn add_at(&self, dest: NodeId, relayer: NodeId, now: Instant) {
        let mut map = self.inner.write().expect("relayers lock poisoned");
        let records = map.entry(dest).or_default();
        records.retain(|r| now.duration_since(r.active_at) < RELAYER_ACTIVE_TTL);
        match records.iter_mut().find(|r| r.id == relayer) {
            Some(record) => record.active_at = now,
            None => records.push(RemoteRelayerRecord {
                id: relayer,
                active_at: now,
            }),
        }
    }

    fn get_at(&self, dest: &NodeId, now: Instant) -> Vec<NodeId> {
        let map = self.inner.read().expect("relayers lock poisoned");
        let Some(records) = map.get(dest) else {
            return Vec::new();
        };
        records
            .iter()
            .filter(|r| now.duration_since(r.active_at) < RELAYER_ACTIVE_TTL)
            .map(|r| r.id)
            .collect()
    }
}

impl Default for RelayersMap {
    fn default() -> Self {
        Self::new()
    }
}
