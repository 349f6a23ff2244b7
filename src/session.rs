//! # Peer Session
//!
//! One [`PeerSession`] per live neighbor. The session owns the three
//! priority rings feeding its send and sync loops and the exit signals the
//! loops fire when they return. `disconnect` is the single teardown path:
//! it flips the closing flag, disposes the rings (which the loops observe
//! as a distinguished error on their next poll), then joins both loops.
//!
//! [`ExitSignal`] replaces the close-a-channel join idiom: a signal that
//! was never armed reports completion immediately, so disconnecting a
//! session whose loops never started cannot deadlock.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::host::AuthToken;
use crate::identity::NodeId;
use crate::messages::SyncPoint;
use crate::ring::RingBuffer;
use crate::transport::MAX_INCOMING_STREAMS;

/// Ring capacity for a non-relayer session.
pub const SESSION_RING_CAPACITY: usize = 1024;

/// Outbound scheduling class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

/// One queued outbound payload. `fingerprint: None` means "do not dedup".
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub fingerprint: Option<Vec<u8>>,
    pub data: Vec<u8>,
}

const SIGNAL_IDLE: u8 = 0;
const SIGNAL_ARMED: u8 = 1;
const SIGNAL_FIRED: u8 = 2;

/// One-shot completion signal with an explicit "never started" state.
pub struct ExitSignal {
    state: AtomicU8,
    notify: Notify,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SIGNAL_IDLE),
            notify: Notify::new(),
        }
    }

    /// Mark the guarded task as pending; `wait` now blocks until `fire`.
    pub fn arm(&self) {
        let _ = self.state.compare_exchange(
            SIGNAL_IDLE,
            SIGNAL_ARMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn fire(&self) {
        self.state.store(SIGNAL_FIRED, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Resolves once fired, or immediately if the task never armed.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.state.load(Ordering::Acquire) != SIGNAL_ARMED {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Live state for one authenticated neighbor.
pub struct PeerSession {
    node_id: NodeId,
    address: String,
    is_relayer: bool,
    high_ring: RingBuffer<OutboundMessage>,
    normal_ring: RingBuffer<OutboundMessage>,
    sync_ring: RingBuffer<Vec<SyncPoint>>,
    closing: AtomicBool,
    ops: ExitSignal,
    stn: ExitSignal,
    consumer_auth: Mutex<Option<AuthToken>>,
}

impl PeerSession {
    pub fn new(node_id: NodeId, address: String, is_relayer: bool, ring_capacity: usize) -> Self {
        Self {
            node_id,
            address,
            is_relayer,
            high_ring: RingBuffer::new(ring_capacity),
            normal_ring: RingBuffer::new(ring_capacity),
            sync_ring: RingBuffer::new(ring_capacity),
            closing: AtomicBool::new(false),
            ops: ExitSignal::new(),
            stn: ExitSignal::new(),
            consumer_auth: Mutex::new(None),
        }
    }

    /// Relayer sessions absorb the stream fan-in of the whole mesh, so
    /// their rings scale with the multiplexing limit.
    pub fn ring_capacity(is_relayer: bool) -> usize {
        if is_relayer {
            SESSION_RING_CAPACITY * MAX_INCOMING_STREAMS
        } else {
            SESSION_RING_CAPACITY
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_relayer(&self) -> bool {
        self.is_relayer
    }

    pub fn closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub(crate) fn set_consumer_auth(&self, token: AuthToken) {
        *self.consumer_auth.lock().expect("auth lock poisoned") = Some(token);
    }

    /// Credential recorded at handshake, for authorizing control messages.
    pub fn consumer_auth(&self) -> Option<AuthToken> {
        self.consumer_auth
            .lock()
            .expect("auth lock poisoned")
            .clone()
    }

    /// Enqueue on the ring matching `priority`; `false` on a full or
    /// disposed ring (the producer treats both as a transient failure).
    pub(crate) fn offer(&self, priority: Priority, msg: OutboundMessage) -> bool {
        let ring = match priority {
            Priority::High => &self.high_ring,
            Priority::Normal => &self.normal_ring,
        };
        ring.offer(msg).unwrap_or(false)
    }

    pub(crate) fn offer_sync_points(&self, points: Vec<SyncPoint>) -> bool {
        self.sync_ring.offer(points).unwrap_or(false)
    }

    pub(crate) fn high_ring(&self) -> &RingBuffer<OutboundMessage> {
        &self.high_ring
    }

    pub(crate) fn normal_ring(&self) -> &RingBuffer<OutboundMessage> {
        &self.normal_ring
    }

    pub(crate) fn sync_ring(&self) -> &RingBuffer<Vec<SyncPoint>> {
        &self.sync_ring
    }

    /// Declare that the send and sync loops are about to start; must be
    /// called before the session becomes reachable from a neighbor map.
    pub(crate) fn arm_loops(&self) {
        self.ops.arm();
        self.stn.arm();
    }

    pub(crate) fn fire_ops(&self) {
        self.ops.fire();
    }

    pub(crate) fn fire_stn(&self) {
        self.stn.fire();
    }

    /// Idempotent teardown: flag, dispose the rings, join the loops.
    /// Concurrent callers after the first return without waiting.
    pub async fn disconnect(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.high_ring.dispose();
        self.normal_ring.dispose();
        self.sync_ring.dispose();
        self.ops.wait().await;
        self.stn.wait().await;
    }
}
