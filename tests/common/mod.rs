//! Shared test fabric: an in-memory transport implementing the same
//! contracts as the quinn layer, plus a scriptable sync handle.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use meshwire::cache::{CacheStore, LruCacheStore};
use meshwire::host::{AuthToken, SyncHandle};
use meshwire::identity::NodeId;
use meshwire::messages::{PeerMessage, SyncPoint};
use meshwire::transport::{Client, Listener, Transport, TransportMessage};
use meshwire::PROTOCOL_VERSION;

/// One-time tracing initialization. Use RUST_LOG=debug for verbose output.
static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Atomic port counter for unique addresses across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

pub fn test_addr() -> String {
    format!("127.0.0.1:{}", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

pub fn make_id(seed: u8) -> NodeId {
    NodeId::from_bytes([seed; 32])
}

// ============================================================================
// In-memory transport
// ============================================================================

const LINK_QUEUE_SIZE: usize = 4096;

/// Shared close state for one bidirectional link.
struct Link {
    closed: AtomicBool,
    notify: Notify,
}

impl Link {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct MemoryClient {
    remote: String,
    link: Arc<Link>,
    tx: mpsc::Sender<TransportMessage>,
    rx: Mutex<mpsc::Receiver<TransportMessage>>,
}

#[async_trait]
impl Client for MemoryClient {
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        if self.link.is_closed() {
            bail!("connection closed");
        }
        self.tx
            .try_send(TransportMessage {
                version: PROTOCOL_VERSION,
                data,
            })
            .map_err(|_| anyhow::anyhow!("connection saturated or closed"))
    }

    async fn receive(&self) -> Result<TransportMessage> {
        let mut rx = self.rx.lock().await;
        loop {
            if self.link.is_closed() {
                bail!("connection closed");
            }
            tokio::select! {
                _ = self.link.notify.notified() => continue,
                msg = rx.recv() => return msg.context("connection closed"),
            }
        }
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    async fn close(&self, _reason: &str) {
        self.link.close();
    }
}

fn memory_pair(dialer_addr: String, listener_addr: String) -> (Arc<MemoryClient>, Arc<MemoryClient>) {
    let link = Arc::new(Link {
        closed: AtomicBool::new(false),
        notify: Notify::new(),
    });
    let (a_tx, b_rx) = mpsc::channel(LINK_QUEUE_SIZE);
    let (b_tx, a_rx) = mpsc::channel(LINK_QUEUE_SIZE);
    let dialer = Arc::new(MemoryClient {
        remote: listener_addr,
        link: link.clone(),
        tx: a_tx,
        rx: Mutex::new(a_rx),
    });
    let accepted = Arc::new(MemoryClient {
        remote: dialer_addr,
        link,
        tx: b_tx,
        rx: Mutex::new(b_rx),
    });
    (dialer, accepted)
}

pub struct MemoryListener {
    addr: String,
    incoming: Mutex<mpsc::Receiver<Arc<MemoryClient>>>,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Arc<dyn Client>> {
        let client = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .context("listener closed")?;
        Ok(client)
    }

    async fn close(&self) {
        self.network
            .listeners
            .lock()
            .expect("network lock poisoned")
            .remove(&self.addr);
    }
}

/// Address registry shared by every transport of one simulated network.
pub struct MemoryNetwork {
    listeners: StdMutex<HashMap<String, mpsc::Sender<Arc<MemoryClient>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: StdMutex::new(HashMap::new()),
        })
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn new(network: &Arc<MemoryNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network: network.clone(),
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>> {
        let (tx, rx) = mpsc::channel(64);
        let mut listeners = self
            .network
            .listeners
            .lock()
            .expect("network lock poisoned");
        if listeners.contains_key(addr) {
            bail!("address {} already bound", addr);
        }
        listeners.insert(addr.to_string(), tx);
        Ok(Arc::new(MemoryListener {
            addr: addr.to_string(),
            incoming: Mutex::new(rx),
            network: self.network.clone(),
        }))
    }

    async fn dial(&self, addr: &str) -> Result<Arc<dyn Client>> {
        let tx = self
            .network
            .listeners
            .lock()
            .expect("network lock poisoned")
            .get(addr)
            .cloned()
            .with_context(|| format!("nothing listening at {}", addr))?;
        let (dialer, accepted) = memory_pair(test_addr(), addr.to_string());
        tx.send(accepted)
            .await
            .map_err(|_| anyhow::anyhow!("listener at {} went away", addr))?;
        Ok(dialer)
    }
}

// ============================================================================
// Scriptable sync handle
// ============================================================================

/// Handshake wire layout used by the test handle:
/// `sender_id (32) || is_relayer (1) || intended_receiver_id (32)`.
pub struct TestHandle {
    id: NodeId,
    is_relayer: bool,
    cache: Arc<LruCacheStore>,
    received: StdMutex<Vec<(NodeId, PeerMessage)>>,
    synced: StdMutex<Vec<(NodeId, Vec<SyncPoint>)>>,
}

impl TestHandle {
    pub fn new(id: NodeId, is_relayer: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            is_relayer,
            cache: Arc::new(LruCacheStore::new(4096)),
            received: StdMutex::new(Vec::new()),
            synced: StdMutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<(NodeId, PeerMessage)> {
        self.received.lock().unwrap().clone()
    }

    pub fn synced(&self) -> Vec<(NodeId, Vec<SyncPoint>)> {
        self.synced.lock().unwrap().clone()
    }

    /// Poll until at least `count` application messages arrived.
    pub async fn wait_for_messages(&self, count: usize, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            if self.received.lock().unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl SyncHandle for TestHandle {
    fn build_authentication_message(&self, remote_id: NodeId) -> Vec<u8> {
        let mut data = Vec::with_capacity(65);
        data.extend_from_slice(self.id.as_bytes());
        data.push(self.is_relayer as u8);
        data.extend_from_slice(remote_id.as_bytes());
        data
    }

    async fn authenticate_as(
        &self,
        self_id: NodeId,
        data: &[u8],
        _timeout_secs: u64,
    ) -> Result<AuthToken> {
        if data.len() != 65 {
            bail!("credential has {} bytes, want 65", data.len());
        }
        let peer_id = NodeId::from_slice(&data[..32]).context("peer id malformed")?;
        let intended = NodeId::from_slice(&data[33..]).context("receiver id malformed")?;
        if intended != self_id {
            bail!("credential addressed to {}, not us", intended);
        }
        Ok(AuthToken {
            peer_id,
            is_relayer: data[32] == 1,
            data: data.to_vec(),
        })
    }

    fn get_cache_store(&self) -> Arc<dyn CacheStore> {
        self.cache.clone()
    }

    async fn handle_peer_message(&self, from: NodeId, msg: PeerMessage) -> Result<()> {
        self.received.lock().unwrap().push((from, msg));
        Ok(())
    }

    async fn sync_neighbor_graph(&self, peer_id: NodeId, points: Vec<SyncPoint>) -> Result<()> {
        self.synced.lock().unwrap().push((peer_id, points));
        Ok(())
    }
}

/// Poll `probe` until it returns true or the budget runs out.
pub async fn wait_until<F>(budget: Duration, mut probe: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Dial, retrying until the listener has come up.
pub async fn dial_retry<T: Transport + ?Sized>(transport: &T, addr: &str) -> Arc<dyn Client> {
    for _ in 0..500 {
        if let Ok(client) = transport.dial(addr).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("nothing ever listened at {}", addr);
}
