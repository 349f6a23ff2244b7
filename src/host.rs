//! # Peer Host
//!
//! The top-level object of the transport core. A [`PeerHost`] listens for
//! inbound consumer sessions, drives persistent outbound sessions to the
//! configured relayers, periodically advertises its consumer list to
//! neighboring relayers, and routes application messages either onto a
//! direct session's rings or into relay envelopes fanned out across
//! candidate relayers.
//!
//! ## Session lifecycle
//!
//! Every authenticated session runs three loops: the send loop (drains the
//! high and normal rings in dedup-filtered priority batches), the receive
//! loop (reader + handler pair over a bounded channel), and the sync loop
//! (feeds the neighbor's gossiped sync points to the consensus layer).
//! The send and sync loops fire the session's exit signals on return;
//! `PeerSession::disconnect` joins them. Teardown closes the listener,
//! disposes the host's own rings, and disconnects every neighbor
//! concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, DedupCache, DEDUP_TTL};
use crate::config::Config;
use crate::identity::NodeId;
use crate::messages::{
    build_authentication_message, build_consumers_message, build_relay_message,
    build_typed_message, parse_network_message, peer_scoped_key, relay_base_fingerprint,
    relay_link_fingerprint, snapshot_message_key, PeerMessage, SyncPoint,
    MESSAGE_TYPE_AUTHENTICATION, MESSAGE_TYPE_CONSUMERS, MESSAGE_TYPE_RELAY,
    PROTOCOL_VERSION,
};
use crate::metrics::MetricPool;
use crate::neighbors::{NeighborMap, RelayersMap};
use crate::ring::RingBuffer;
use crate::session::{ExitSignal, OutboundMessage, PeerSession, Priority};
use crate::transport::{validate_relayer_address, Client, Listener, Transport};

/// Hard ceiling on the inbound handshake round trip.
pub const AUTHENTICATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-iteration drain cap for the high ring.
const SEND_BATCH_HIGH: usize = 16;

/// Per-iteration drain cap across both rings.
const SEND_BATCH_TOTAL: usize = 32;

/// Idle pacing for the ring-polling loops; there is no blocking ring wait.
const RING_IDLE_INTERVAL: Duration = Duration::from_millis(300);

/// Capacity of the reader→handler channel; a full channel means a stuck
/// handler and fails the session.
const RECEIVE_QUEUE_SIZE: usize = 1024;

/// Credential minted by the consensus layer for an authenticated peer.
#[derive(Clone, Debug)]
pub struct AuthToken {
    pub peer_id: NodeId,
    pub is_relayer: bool,
    pub data: Vec<u8>,
}

/// Contract the consensus layer provides to the transport core.
#[async_trait]
pub trait SyncHandle: Send + Sync {
    /// Handshake bytes to present to `remote_id` when dialing it.
    fn build_authentication_message(&self, remote_id: NodeId) -> Vec<u8>;

    /// Verify inbound handshake bytes; the token identifies the peer and
    /// carries its relayer role.
    async fn authenticate_as(
        &self,
        self_id: NodeId,
        data: &[u8],
        timeout_secs: u64,
    ) -> Result<AuthToken>;

    /// Backend for the host's dedup cache.
    fn get_cache_store(&self) -> Arc<dyn CacheStore>;

    /// Application dispatch for messages the core does not route itself.
    async fn handle_peer_message(&self, from: NodeId, msg: PeerMessage) -> Result<()>;

    /// Consume a neighbor's latest sync points; called from the per-session
    /// sync loop, opaque to the core.
    async fn sync_neighbor_graph(&self, peer_id: NodeId, points: Vec<SyncPoint>) -> Result<()>;
}

pub struct PeerHost {
    node_id: NodeId,
    address: String,
    is_relayer: bool,
    config: Config,
    transport: Arc<dyn Transport>,
    handle: Arc<dyn SyncHandle>,

    relayers: NeighborMap,
    consumers: NeighborMap,
    remote_relayers: RwLock<Option<Arc<RelayersMap>>>,
    dedup: DedupCache,

    sent_metric: MetricPool,
    received_metric: MetricPool,

    // The host is a pseudo-peer: its own rings exist for accounting
    // symmetry and are disposed exactly once, at teardown.
    high_ring: RingBuffer<OutboundMessage>,
    normal_ring: RingBuffer<OutboundMessage>,
    sync_ring: RingBuffer<Vec<SyncPoint>>,

    closing: AtomicBool,
    shutdown: ExitSignal,
    listener: Mutex<Option<Arc<dyn Listener>>>,
}

impl PeerHost {
    pub fn new(
        handle: Arc<dyn SyncHandle>,
        transport: Arc<dyn Transport>,
        node_id: NodeId,
        address: String,
        is_relayer: bool,
        config: Config,
    ) -> Arc<Self> {
        let ring_capacity = PeerSession::ring_capacity(is_relayer);
        let dedup = DedupCache::new(handle.get_cache_store());
        let metrics_enabled = config.metrics_enabled;
        let shutdown = ExitSignal::new();
        shutdown.arm();
        Arc::new(Self {
            node_id,
            address,
            is_relayer,
            config,
            transport,
            handle,
            relayers: NeighborMap::new(),
            consumers: NeighborMap::new(),
            remote_relayers: RwLock::new(None),
            dedup,
            sent_metric: MetricPool::new(metrics_enabled),
            received_metric: MetricPool::new(metrics_enabled),
            high_ring: RingBuffer::new(ring_capacity),
            normal_ring: RingBuffer::new(ring_capacity),
            sync_ring: RingBuffer::new(ring_capacity),
            closing: AtomicBool::new(false),
            shutdown,
            listener: Mutex::new(None),
        })
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

    fn closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Enabled counter pools keyed "sent"/"received".
    pub fn metric(&self) -> HashMap<String, HashMap<u8, u64>> {
        let mut metrics = HashMap::new();
        if self.sent_metric.enabled() {
            metrics.insert("sent".to_string(), self.sent_metric.snapshot());
        }
        if self.received_metric.enabled() {
            metrics.insert("received".to_string(), self.received_metric.snapshot());
        }
        metrics
    }

    /// All live sessions, relayers first, deduplicated by identity.
    pub fn neighbors(&self) -> Vec<Arc<PeerSession>> {
        let mut peers = self.relayers.slice();
        for consumer in self.consumers.slice() {
            if peers.iter().any(|p| p.node_id() == consumer.node_id()) {
                continue;
            }
            peers.push(consumer);
        }
        peers
    }

    pub fn get_neighbor(&self, id: &NodeId) -> Option<Arc<PeerSession>> {
        self.relayers.get(id).or_else(|| self.consumers.get(id))
    }

    fn enable_remote_relayers(&self) {
        let mut guard = self.remote_relayers.write().expect("relayers lock poisoned");
        if guard.is_none() {
            *guard = Some(Arc::new(RelayersMap::new()));
        }
    }

    fn remote_relayers_map(&self) -> Option<Arc<RelayersMap>> {
        self.remote_relayers
            .read()
            .expect("relayers lock poisoned")
            .clone()
    }

    /// Direct sessions to relayers known to serve `dest`.
    pub fn get_remote_relayers(&self, dest: &NodeId) -> Vec<Arc<PeerSession>> {
        let Some(map) = self.remote_relayers_map() else {
            return Vec::new();
        };
        map.get(dest)
            .iter()
            .filter_map(|id| self.get_neighbor(id))
            .collect()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Route a message toward `to`: silently succeed for the local node or
    /// a dedup hit, enqueue on a direct session, or wrap in a relay
    /// envelope fanned out across candidate relayers. Only a full ring on
    /// the direct path surfaces as an error.
    pub fn send_to_peer(
        &self,
        to: NodeId,
        message_type: u8,
        key: Option<Vec<u8>>,
        data: Vec<u8>,
        priority: Priority,
    ) -> Result<()> {
        if to == self.node_id {
            return Ok(());
        }
        if self.dedup.contains(key.as_deref(), DEDUP_TTL) {
            return Ok(());
        }
        self.sent_metric.record(message_type);

        if let Some(peer) = self.get_neighbor(&to) {
            let accepted = peer.offer(
                priority,
                OutboundMessage {
                    fingerprint: key,
                    data,
                },
            );
            if !accepted {
                bail!("peer {} send {:?} timeout", to, priority);
            }
            return Ok(());
        }

        let envelope = build_relay_message(to, &data);
        self.fan_out_relay(to, &envelope, priority);
        Ok(())
    }

    pub fn send_high_to_peer(
        &self,
        to: NodeId,
        message_type: u8,
        key: Option<Vec<u8>>,
        data: Vec<u8>,
    ) -> Result<()> {
        self.send_to_peer(to, message_type, key, data, Priority::High)
    }

    /// Snapshot traffic: fingerprint `dest || snap || "SNAP" || type`,
    /// normal priority.
    pub fn send_snapshot_message_to_peer(
        &self,
        to: NodeId,
        snap: [u8; 32],
        message_type: u8,
        data: &[u8],
    ) -> Result<()> {
        let key = snapshot_message_key(&to, &snap, message_type);
        let payload = build_typed_message(message_type, data);
        self.send_to_peer(to, message_type, Some(key), payload, Priority::Normal)
    }

    /// Offer a relay envelope to every candidate relayer for its
    /// destination, each under its own per-link fingerprint. Best-effort:
    /// a full ring is logged, never propagated.
    fn fan_out_relay(&self, destination: NodeId, envelope: &[u8], priority: Priority) {
        let base = relay_base_fingerprint(envelope);
        let mut candidates = self.get_remote_relayers(&destination);
        if candidates.is_empty() {
            candidates = self.relayers.slice();
        }
        for peer in candidates {
            if !peer.is_relayer() {
                panic!("relay candidate {} is not a relayer", peer.node_id());
            }
            let link_key = relay_link_fingerprint(&base, &peer.node_id());
            let accepted = peer.offer(
                priority,
                OutboundMessage {
                    fingerprint: Some(link_key.to_vec()),
                    data: envelope.to_vec(),
                },
            );
            if !accepted {
                debug!(peer = %peer.node_id(), "relay offer dropped");
            }
        }
    }

    /// Forward a relay envelope received from a neighbor. A direct session
    /// to the destination wins; otherwise the envelope re-enters the
    /// fan-out with fresh per-link fingerprints, and the dedup filter in
    /// each send loop suppresses cycles within the TTL.
    fn forward_relay_message(&self, destination: NodeId, payload: Vec<u8>) {
        self.sent_metric.record(MESSAGE_TYPE_RELAY);
        let envelope = build_relay_message(destination, &payload);
        if let Some(peer) = self.get_neighbor(&destination) {
            let base = relay_base_fingerprint(&envelope);
            let link_key = relay_link_fingerprint(&base, &peer.node_id());
            let accepted = peer.offer(
                Priority::Normal,
                OutboundMessage {
                    fingerprint: Some(link_key.to_vec()),
                    data: envelope,
                },
            );
            if !accepted {
                debug!(peer = %destination, "relay delivery dropped");
            }
            return;
        }
        self.fan_out_relay(destination, &envelope, Priority::Normal);
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Route one parsed inbound message. Core types are handled here;
    /// everything else goes to the consensus layer.
    pub async fn handle_peer_message(&self, from: NodeId, msg: PeerMessage) -> Result<()> {
        match msg {
            // Handshake already completed; a stray frame is ignored.
            PeerMessage::Authentication { .. } => Ok(()),
            PeerMessage::Consumers { consumers } => {
                self.record_remote_consumers(from, consumers);
                Ok(())
            }
            PeerMessage::Relay {
                destination,
                payload,
            } => {
                if destination == self.node_id {
                    let inner = parse_network_message(PROTOCOL_VERSION, &payload)
                        .context("relayed payload malformed")?;
                    Box::pin(self.handle_peer_message(from, inner)).await
                } else {
                    self.forward_relay_message(destination, payload);
                    Ok(())
                }
            }
            PeerMessage::SyncPoints { points } => {
                self.update_sync_point(from, points);
                Ok(())
            }
            other => self.handle.handle_peer_message(from, other).await,
        }
    }

    /// A relayer neighbor advertised the consumers it serves.
    fn record_remote_consumers(&self, from: NodeId, consumers: Vec<NodeId>) {
        let Some(sender) = self.get_neighbor(&from) else {
            return;
        };
        if !sender.is_relayer() {
            return;
        }
        let Some(map) = self.remote_relayers_map() else {
            return;
        };
        for id in consumers {
            if id == self.node_id {
                continue;
            }
            map.add(id, from);
        }
    }

    /// Offer a neighbor's sync-point batch to its session's sync ring.
    /// A full or disposed ring drops the batch; the neighbor regossips.
    pub fn update_sync_point(&self, peer_id: NodeId, points: Vec<SyncPoint>) {
        let Some(session) = self.get_neighbor(&peer_id) else {
            return;
        };
        if !session.offer_sync_points(points) {
            debug!(peer = %peer_id, "sync ring full, batch dropped");
        }
    }

    // ========================================================================
    // Session loops
    // ========================================================================

    /// Single sender per session: drains dedup-filtered priority batches
    /// and transmits them. Always closes the client and fires `ops`.
    async fn loop_sending_stream(
        &self,
        p: &Arc<PeerSession>,
        client: Arc<dyn Client>,
    ) -> Result<()> {
        let result = self.sending_stream_inner(p, client.as_ref()).await;
        client.close("loop_sending_stream").await;
        p.fire_ops();
        result
    }

    async fn sending_stream_inner(&self, p: &Arc<PeerSession>, client: &dyn Client) -> Result<()> {
        while !self.closing() && !p.closing() {
            let mut batch: Vec<OutboundMessage> = Vec::new();

            while batch.len() < SEND_BATCH_HIGH {
                match p.high_ring().poll() {
                    Err(err) => bail!("peer {} high ring: {}", p.node_id(), err),
                    Ok(None) => break,
                    Ok(Some(msg)) => {
                        if self.dedup.contains(msg.fingerprint.as_deref(), DEDUP_TTL) {
                            continue;
                        }
                        batch.push(msg);
                    }
                }
            }

            while batch.len() < SEND_BATCH_TOTAL {
                match p.normal_ring().poll() {
                    Err(err) => bail!("peer {} normal ring: {}", p.node_id(), err),
                    Ok(None) => break,
                    Ok(Some(msg)) => {
                        if self.dedup.contains(msg.fingerprint.as_deref(), DEDUP_TTL) {
                            continue;
                        }
                        batch.push(msg);
                    }
                }
            }

            if batch.is_empty() {
                tokio::time::sleep(RING_IDLE_INTERVAL).await;
                continue;
            }

            for msg in batch {
                let OutboundMessage { fingerprint, data } = msg;
                // Re-check at transmit time: an earlier message in this
                // batch may have stored the same fingerprint.
                if self.dedup.contains(fingerprint.as_deref(), DEDUP_TTL) {
                    continue;
                }
                client
                    .send(data)
                    .await
                    .with_context(|| format!("send to {} failed", p.address()))?;
                if let Some(key) = fingerprint {
                    self.dedup.store(&key, SystemTime::now());
                }
            }
        }
        Ok(())
    }

    /// Reader half of the receive pipeline, plus its handler task. The
    /// reader treats a full handler queue as a failed peer and closes the
    /// session rather than blocking.
    async fn loop_receive_message(self: Arc<Self>, peer: Arc<PeerSession>, client: Arc<dyn Client>) {
        let (tx, mut rx) = mpsc::channel::<PeerMessage>(RECEIVE_QUEUE_SIZE);

        let handler = {
            let host = self.clone();
            let client = client.clone();
            let peer_id = peer.node_id();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(err) = host.handle_peer_message(peer_id, msg).await {
                        debug!(peer = %peer_id, error = %err, "peer message handler failed");
                        break;
                    }
                }
                client.close("handle_peer_message").await;
            })
        };

        while !self.closing() {
            let tm = match client.receive().await {
                Ok(tm) => tm,
                Err(err) => {
                    debug!(peer = %peer.address(), error = %err, "receive failed");
                    break;
                }
            };
            let msg = match parse_network_message(tm.version, &tm.data) {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(peer = %peer.address(), error = %err, "message parse failed");
                    break;
                }
            };
            self.received_metric.record(msg.message_type());

            if tx.try_send(msg).is_err() {
                warn!(peer = %peer.address(), "peer receive queue full");
                break;
            }
        }

        drop(tx);
        client.close("loop_receive_message").await;
        let _ = handler.await;
    }

    /// Per-session sync loop: keeps only the most recent sync-point batch
    /// the neighbor gossiped and hands it to the consensus layer.
    async fn sync_to_neighbor_loop(&self, p: Arc<PeerSession>) {
        while !self.closing() && !p.closing() {
            let mut latest: Option<Vec<SyncPoint>> = None;
            loop {
                match p.sync_ring().poll() {
                    Ok(Some(points)) => latest = Some(points),
                    Ok(None) => break,
                    Err(_) => {
                        p.fire_stn();
                        return;
                    }
                }
            }
            if let Some(points) = latest {
                if let Err(err) = self.handle.sync_neighbor_graph(p.node_id(), points).await {
                    debug!(peer = %p.node_id(), error = %err, "neighbor graph sync failed");
                }
            }
            tokio::time::sleep(RING_IDLE_INTERVAL).await;
        }
        p.fire_stn();
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Inbound handshake: one authentication frame within the 3 s ceiling,
    /// verified by the consensus layer. The session takes the identity
    /// from the token and the address actually observed on the transport.
    async fn authenticate_neighbor(&self, client: &dyn Client) -> Result<Arc<PeerSession>> {
        let handshake = async {
            let tm = client.receive().await?;
            let data = match parse_network_message(tm.version, &tm.data)? {
                PeerMessage::Authentication { data } => data,
                other => bail!(
                    "peer authentication invalid message type {}",
                    other.message_type()
                ),
            };
            self.received_metric.record(MESSAGE_TYPE_AUTHENTICATION);

            let token = self
                .handle
                .authenticate_as(
                    self.node_id,
                    &data,
                    self.config.handshake_timeout.as_secs(),
                )
                .await?;
            if token.peer_id == self.node_id {
                bail!("authentication token names the local node");
            }

            let session = Arc::new(PeerSession::new(
                token.peer_id,
                client.remote_addr(),
                token.is_relayer,
                PeerSession::ring_capacity(token.is_relayer),
            ));
            session.set_consumer_auth(token);
            Ok(session)
        };

        match tokio::time::timeout(AUTHENTICATION_TIMEOUT, handshake).await {
            Ok(result) => result,
            Err(_) => bail!("authenticate timeout"),
        }
    }

    // ========================================================================
    // Inbound lifecycle
    // ========================================================================

    /// Bind the listener and accept consumer sessions until teardown.
    /// Also starts the periodic consumers broadcast. Accept is raced
    /// against the host cancellation signal so teardown never leaves a
    /// task parked in it.
    pub async fn listen_consumers(self: Arc<Self>) -> Result<()> {
        info!(node = %self.node_id, addr = %self.address, "listening for consumers");
        let listener = self.transport.listen(&self.address).await?;
        *self.listener.lock().expect("listener lock poisoned") = Some(listener.clone());
        self.enable_remote_relayers();

        {
            let host = self.clone();
            tokio::spawn(async move { host.broadcast_consumers_loop().await });
        }

        while !self.closing() {
            let client = tokio::select! {
                _ = self.shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok(client) => client,
                    Err(err) => {
                        debug!(error = %err, "accept failed");
                        continue;
                    }
                },
            };
            let host = self.clone();
            tokio::spawn(async move { host.run_consumer_session(client).await });
        }

        info!(node = %self.node_id, addr = %self.address, "listen consumers done");
        Ok(())
    }

    async fn run_consumer_session(self: Arc<Self>, client: Arc<dyn Client>) {
        let session = match self.authenticate_neighbor(client.as_ref()).await {
            Ok(session) => session,
            Err(err) => {
                debug!(remote = %client.remote_addr(), error = %err, "authentication failed");
                client.close("authenticate_neighbor").await;
                return;
            }
        };
        let peer_id = session.node_id();
        debug!(peer = %peer_id, addr = %session.address(), "consumer authenticated");

        // A reconnecting peer replaces its old session deliberately.
        if let Some(old) = self.consumers.get(&peer_id) {
            old.disconnect().await;
            self.consumers.delete(&peer_id);
        }
        session.arm_loops();
        if !self.consumers.put(peer_id, session.clone()) {
            panic!("consumer session collision for {}", peer_id);
        }

        {
            let host = self.clone();
            let p = session.clone();
            tokio::spawn(async move { host.sync_to_neighbor_loop(p).await });
        }
        {
            let host = self.clone();
            let p = session.clone();
            let c = client.clone();
            tokio::spawn(async move { host.loop_receive_message(p, c).await });
        }

        let result = self.loop_sending_stream(&session, client.clone()).await;
        debug!(peer = %peer_id, result = ?result.err(), "consumer send loop ended");

        self.consumers.delete(&peer_id);
        session.disconnect().await;
        client.close("listen_consumers").await;
    }

    /// Advertise the current consumer list to every relayer neighbor, once
    /// per round gap, each copy under a peer-scoped fingerprint.
    async fn broadcast_consumers_loop(self: Arc<Self>) {
        let gap = self.config.snapshot_round_gap;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + gap, gap);
        while !self.closing() {
            let consumers: Vec<NodeId> = self
                .consumers
                .slice()
                .iter()
                .map(|p| p.node_id())
                .collect();
            let msg = build_consumers_message(&consumers);
            for peer in self.neighbors() {
                if !peer.is_relayer() {
                    continue;
                }
                let key = peer_scoped_key(&msg, &peer.node_id());
                if let Err(err) = self.send_to_peer(
                    peer.node_id(),
                    MESSAGE_TYPE_CONSUMERS,
                    Some(key.to_vec()),
                    msg.clone(),
                    Priority::Normal,
                ) {
                    debug!(peer = %peer.node_id(), error = %err, "consumers broadcast dropped");
                }
            }
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
        }
    }

    // ========================================================================
    // Outbound lifecycle
    // ========================================================================

    /// Supervised connection to a configured relayer: dial, handshake, run
    /// the session loops, and redial one round gap after any failure, until
    /// teardown. Aborts on a misconfigured address, a self-loop, or a live
    /// session for the same identity (single-connect invariant).
    pub async fn connect_relayer(self: Arc<Self>, remote_id: NodeId, addr: &str) {
        if let Err(err) = validate_relayer_address(addr) {
            panic!("connect_relayer({}): {}", remote_id, err);
        }
        if remote_id == self.node_id {
            panic!("connect_relayer({}) to the local node", remote_id);
        }
        if self.is_relayer {
            self.enable_remote_relayers();
        }

        while !self.closing() {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(self.config.snapshot_round_gap) => {}
            }
            if self.closing() {
                break;
            }
            if let Some(old) = self.relayers.get(&remote_id) {
                panic!(
                    "connect_relayer({}) found a live session at {}",
                    remote_id,
                    old.address()
                );
            }
            let session = Arc::new(PeerSession::new(
                remote_id,
                addr.to_string(),
                true,
                PeerSession::ring_capacity(true),
            ));
            let result = self.clone().run_relayer_session(session).await;
            info!(relayer = %remote_id, addr = addr, result = ?result.err(), "relayer session ended");
        }
    }

    async fn run_relayer_session(self: Arc<Self>, session: Arc<PeerSession>) -> Result<()> {
        let client = self
            .transport
            .dial(session.address())
            .await
            .with_context(|| format!("dial {} failed", session.address()))?;

        let auth = self.handle.build_authentication_message(session.node_id());
        if let Err(err) = client.send(build_authentication_message(&auth)).await {
            client.close("connect_relayer").await;
            session.disconnect().await;
            return Err(err.context("handshake send failed"));
        }
        self.sent_metric.record(MESSAGE_TYPE_AUTHENTICATION);

        let peer_id = session.node_id();
        session.arm_loops();
        if !self.relayers.put(peer_id, session.clone()) {
            panic!("relayer session collision for {}", peer_id);
        }

        {
            let host = self.clone();
            let p = session.clone();
            tokio::spawn(async move { host.sync_to_neighbor_loop(p).await });
        }
        {
            let host = self.clone();
            let p = session.clone();
            let c = client.clone();
            tokio::spawn(async move { host.loop_receive_message(p, c).await });
        }

        let result = self.loop_sending_stream(&session, client.clone()).await;
        debug!(relayer = %peer_id, result = ?result.as_ref().err(), "relayer send loop ended");

        self.relayers.delete(&peer_id);
        session.disconnect().await;
        client.close("connect_relayer").await;
        result
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stop accepting, dispose the host rings, and disconnect every
    /// neighbor. Returns only after all session loops have signalled exit.
    pub async fn teardown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.fire();

        let listener = self
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take();
        if let Some(listener) = listener {
            listener.close().await;
        }

        self.high_ring.dispose();
        self.normal_ring.dispose();
        self.sync_ring.dispose();

        let mut joins = JoinSet::new();
        for peer in self.neighbors() {
            joins.spawn(async move { peer.disconnect().await });
        }
        while joins.join_next().await.is_some() {}

        info!(node = %self.node_id, addr = %self.address, "teardown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCacheStore;
    use crate::messages::MESSAGE_TYPE_SNAPSHOT;
    use crate::transport::TransportMessage;
    use std::sync::Mutex as StdMutex;

    fn make_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; 32])
    }

    struct StubTransport;

    #[async_trait]
    impl Transport for StubTransport {
        async fn listen(&self, _addr: &str) -> Result<Arc<dyn Listener>> {
            bail!("no listener in unit tests")
        }

        async fn dial(&self, _addr: &str) -> Result<Arc<dyn Client>> {
            bail!("no dialing in unit tests")
        }
    }

    struct StubHandle {
        cache: Arc<LruCacheStore>,
        received: StdMutex<Vec<(NodeId, PeerMessage)>>,
    }

    impl StubHandle {
        fn new() -> Self {
            Self {
                cache: Arc::new(LruCacheStore::new(4096)),
                received: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SyncHandle for StubHandle {
        fn build_authentication_message(&self, _remote_id: NodeId) -> Vec<u8> {
            Vec::new()
        }

        async fn authenticate_as(
            &self,
            _self_id: NodeId,
            _data: &[u8],
            _timeout_secs: u64,
        ) -> Result<AuthToken> {
            bail!("no inbound auth in unit tests")
        }

        fn get_cache_store(&self) -> Arc<dyn CacheStore> {
            self.cache.clone()
        }

        async fn handle_peer_message(&self, from: NodeId, msg: PeerMessage) -> Result<()> {
            self.received.lock().unwrap().push((from, msg));
            Ok(())
        }

        async fn sync_neighbor_graph(
            &self,
            _peer_id: NodeId,
            _points: Vec<SyncPoint>,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct CaptureClient {
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl CaptureClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Client for CaptureClient {
        async fn send(&self, data: Vec<u8>) -> Result<()> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }

        async fn receive(&self) -> Result<TransportMessage> {
            std::future::pending().await
        }

        fn remote_addr(&self) -> String {
            "127.0.0.1:9000".to_string()
        }

        async fn close(&self, _reason: &str) {}
    }

    fn make_host(handle: Arc<StubHandle>) -> Arc<PeerHost> {
        PeerHost::new(
            handle,
            Arc::new(StubTransport),
            make_id(0xaa),
            "127.0.0.1:7000".to_string(),
            true,
            Config {
                snapshot_round_gap: Duration::from_millis(50),
                handshake_timeout: Duration::from_secs(1),
                metrics_enabled: true,
            },
        )
    }

    fn make_session(seed: u8, is_relayer: bool, capacity: usize) -> Arc<PeerSession> {
        Arc::new(PeerSession::new(
            make_id(seed),
            format!("127.0.0.1:{}", 8000 + seed as u16),
            is_relayer,
            capacity,
        ))
    }

    #[test]
    fn send_to_self_is_silent_success() {
        let host = make_host(Arc::new(StubHandle::new()));
        host.send_to_peer(
            host.node_id(),
            MESSAGE_TYPE_SNAPSHOT,
            Some(vec![1, 2, 3]),
            vec![0xab],
            Priority::High,
        )
        .unwrap();
        // Nothing was scheduled: no sent counter, no dedup entry.
        assert!(host.metric().get("sent").unwrap().is_empty());
        assert!(!host.dedup.contains(Some(&[1, 2, 3]), DEDUP_TTL));
    }

    #[test]
    fn direct_send_enqueues_and_dedup_suppresses() {
        let host = make_host(Arc::new(StubHandle::new()));
        let peer = make_session(1, false, 16);
        assert!(host.consumers.put(peer.node_id(), peer.clone()));

        let key = vec![9u8; 32];
        host.send_to_peer(
            peer.node_id(),
            MESSAGE_TYPE_SNAPSHOT,
            Some(key.clone()),
            vec![0x01],
            Priority::Normal,
        )
        .unwrap();
        assert_eq!(peer.normal_ring().len(), 1);

        // Once the fingerprint is recorded, the same send is a silent no-op.
        host.dedup.store(&key, SystemTime::now());
        host.send_to_peer(
            peer.node_id(),
            MESSAGE_TYPE_SNAPSHOT,
            Some(key),
            vec![0x01],
            Priority::Normal,
        )
        .unwrap();
        assert_eq!(peer.normal_ring().len(), 1);
    }

    #[test]
    fn direct_send_surfaces_backpressure() {
        let host = make_host(Arc::new(StubHandle::new()));
        let peer = make_session(1, false, 2);
        assert!(host.consumers.put(peer.node_id(), peer.clone()));

        for i in 0..2 {
            assert!(peer.offer(
                Priority::High,
                OutboundMessage {
                    fingerprint: None,
                    data: vec![i],
                },
            ));
        }
        let err = host
            .send_to_peer(
                peer.node_id(),
                MESSAGE_TYPE_SNAPSHOT,
                None,
                vec![0xff],
                Priority::High,
            )
            .unwrap_err();
        assert!(err.to_string().contains("timeout"), "got: {}", err);
    }

    #[test]
    fn relay_fallback_wraps_envelope() {
        let host = make_host(Arc::new(StubHandle::new()));
        let relayer = make_session(2, true, 16);
        assert!(host.relayers.put(relayer.node_id(), relayer.clone()));

        let dest = make_id(3);
        host.send_to_peer(dest, MESSAGE_TYPE_SNAPSHOT, None, vec![0xff], Priority::Normal)
            .unwrap();

        assert_eq!(relayer.normal_ring().len(), 1);
        let queued = relayer.normal_ring().poll().unwrap().unwrap();
        assert!(queued.fingerprint.is_some());
        let msg = parse_network_message(PROTOCOL_VERSION, &queued.data).unwrap();
        assert_eq!(
            msg,
            PeerMessage::Relay {
                destination: dest,
                payload: vec![0xff],
            }
        );
    }

    #[test]
    fn relay_fan_out_uses_distinct_link_fingerprints() {
        let host = make_host(Arc::new(StubHandle::new()));
        let r1 = make_session(2, true, 16);
        let r2 = make_session(3, true, 16);
        assert!(host.relayers.put(r1.node_id(), r1.clone()));
        assert!(host.relayers.put(r2.node_id(), r2.clone()));

        let dest = make_id(4);
        host.enable_remote_relayers();
        let map = host.remote_relayers_map().unwrap();
        map.add(dest, r1.node_id());
        map.add(dest, r2.node_id());

        host.send_to_peer(dest, MESSAGE_TYPE_SNAPSHOT, None, vec![0x55], Priority::Normal)
            .unwrap();

        let q1 = r1.normal_ring().poll().unwrap().unwrap();
        let q2 = r2.normal_ring().poll().unwrap().unwrap();
        assert_eq!(q1.data, q2.data);
        assert_ne!(q1.fingerprint, q2.fingerprint);
    }

    #[test]
    #[should_panic(expected = "not a relayer")]
    fn relay_candidate_must_be_relayer() {
        let host = make_host(Arc::new(StubHandle::new()));
        let bogus = make_session(2, false, 16);
        assert!(host.relayers.put(bogus.node_id(), bogus));
        let _ = host.send_to_peer(
            make_id(3),
            MESSAGE_TYPE_SNAPSHOT,
            None,
            vec![0x01],
            Priority::Normal,
        );
    }

    #[tokio::test]
    async fn consumers_advertisement_records_remote_relayers() {
        let host = make_host(Arc::new(StubHandle::new()));
        host.enable_remote_relayers();
        let relayer = make_session(2, true, 16);
        assert!(host.relayers.put(relayer.node_id(), relayer.clone()));

        let advertised = vec![make_id(7), make_id(8), host.node_id()];
        host.handle_peer_message(
            relayer.node_id(),
            PeerMessage::Consumers {
                consumers: advertised,
            },
        )
        .await
        .unwrap();

        let serving: Vec<NodeId> = host
            .get_remote_relayers(&make_id(7))
            .iter()
            .map(|p| p.node_id())
            .collect();
        assert_eq!(serving, vec![relayer.node_id()]);
        // The local id is never recorded as someone's consumer.
        assert!(host
            .remote_relayers_map()
            .unwrap()
            .get(&host.node_id())
            .is_empty());
    }

    #[tokio::test]
    async fn consumers_from_non_relayer_ignored() {
        let host = make_host(Arc::new(StubHandle::new()));
        host.enable_remote_relayers();
        let consumer = make_session(2, false, 16);
        assert!(host.consumers.put(consumer.node_id(), consumer.clone()));

        host.handle_peer_message(
            consumer.node_id(),
            PeerMessage::Consumers {
                consumers: vec![make_id(7)],
            },
        )
        .await
        .unwrap();
        assert!(host.get_remote_relayers(&make_id(7)).is_empty());
    }

    #[tokio::test]
    async fn relay_envelope_for_local_node_unwraps() {
        let handle = Arc::new(StubHandle::new());
        let host = make_host(handle.clone());
        let from = make_id(2);

        let inner = build_typed_message(MESSAGE_TYPE_SNAPSHOT, &[0x0a]);
        host.handle_peer_message(
            from,
            PeerMessage::Relay {
                destination: host.node_id(),
                payload: inner,
            },
        )
        .await
        .unwrap();

        let received = handle.received.lock().unwrap();
        assert_eq!(
            received.as_slice(),
            &[(from, PeerMessage::Snapshot { data: vec![0x0a] })]
        );
    }

    #[tokio::test]
    async fn relay_envelope_forwards_to_direct_destination() {
        let host = make_host(Arc::new(StubHandle::new()));
        let dest = make_session(3, false, 16);
        assert!(host.consumers.put(dest.node_id(), dest.clone()));

        let inner = build_typed_message(MESSAGE_TYPE_SNAPSHOT, &[0x0b]);
        host.handle_peer_message(
            make_id(2),
            PeerMessage::Relay {
                destination: dest.node_id(),
                payload: inner.clone(),
            },
        )
        .await
        .unwrap();

        let queued = dest.normal_ring().poll().unwrap().unwrap();
        let msg = parse_network_message(PROTOCOL_VERSION, &queued.data).unwrap();
        assert_eq!(
            msg,
            PeerMessage::Relay {
                destination: dest.node_id(),
                payload: inner,
            }
        );
    }

    #[tokio::test]
    async fn send_loop_prioritizes_high_and_caps_batches() {
        let host = make_host(Arc::new(StubHandle::new()));
        let peer = make_session(1, false, 64);
        peer.arm_loops();
        let client = CaptureClient::new();

        for i in 0..20u8 {
            assert!(peer.offer(
                Priority::High,
                OutboundMessage {
                    fingerprint: None,
                    data: vec![1, i],
                },
            ));
            assert!(peer.offer(
                Priority::Normal,
                OutboundMessage {
                    fingerprint: None,
                    data: vec![2, i],
                },
            ));
        }

        let sender = {
            let host = host.clone();
            let peer = peer.clone();
            let client = client.clone();
            tokio::spawn(async move {
                let sync_host = host.clone();
                let sync_peer = peer.clone();
                tokio::spawn(async move { sync_host.sync_to_neighbor_loop(sync_peer).await });
                let _ = host.loop_sending_stream(&peer, client).await;
            })
        };

        // Let the loop drain everything, then stop it through disconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(2), peer.disconnect())
            .await
            .expect("disconnect joins the loops");
        sender.await.unwrap();

        let sent = client.sent();
        assert_eq!(sent.len(), 40);
        // First batch: 16 high then 16 normal; leftovers follow in class FIFO.
        assert!(sent[..16].iter().all(|m| m[0] == 1));
        assert!(sent[16..32].iter().all(|m| m[0] == 2));
        let highs: Vec<u8> = sent.iter().filter(|m| m[0] == 1).map(|m| m[1]).collect();
        let normals: Vec<u8> = sent.iter().filter(|m| m[0] == 2).map(|m| m[1]).collect();
        assert_eq!(highs, (0..20).collect::<Vec<u8>>());
        assert_eq!(normals, (0..20).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn send_loop_transmits_fingerprint_once() {
        let host = make_host(Arc::new(StubHandle::new()));
        let peer = make_session(1, false, 64);
        peer.arm_loops();
        let client = CaptureClient::new();

        let key = vec![0x11u8; 32];
        for i in 0..3u8 {
            assert!(peer.offer(
                Priority::Normal,
                OutboundMessage {
                    fingerprint: Some(key.clone()),
                    data: vec![i],
                },
            ));
        }

        let sender = {
            let host = host.clone();
            let peer = peer.clone();
            let client = client.clone();
            tokio::spawn(async move {
                let sync_host = host.clone();
                let sync_peer = peer.clone();
                tokio::spawn(async move { sync_host.sync_to_neighbor_loop(sync_peer).await });
                let _ = host.loop_sending_stream(&peer, client).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        // A later message under the same fingerprint is filtered at drain.
        assert!(peer.offer(
            Priority::Normal,
            OutboundMessage {
                fingerprint: Some(key.clone()),
                data: vec![9],
            },
        ));
        tokio::time::sleep(Duration::from_millis(400)).await;

        tokio::time::timeout(Duration::from_secs(2), peer.disconnect())
            .await
            .expect("disconnect joins the loops");
        sender.await.unwrap();

        assert_eq!(client.sent(), vec![vec![0u8]]);
        assert!(host.dedup.contains(Some(&key), DEDUP_TTL));
    }
}
