//! # Transport Contracts
//!
//! The core drives sessions through these traits and never touches the
//! datagram layer directly: [`Transport`] dials and binds, [`Listener`]
//! accepts, [`Client`] moves framed messages for one session. The quinn
//! implementation lives in [`crate::quic`]; tests substitute an in-memory
//! fabric implementing the same contracts.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

/// Stream fan-in multiplier for relayer ring sizing.
pub const MAX_INCOMING_STREAMS: usize = 128;

/// Upper bound on a single framed payload.
pub const TRANSPORT_MESSAGE_MAX_SIZE: usize = 32 * 1024 * 1024;

/// One framed message as read off the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportMessage {
    pub version: u8,
    pub data: Vec<u8>,
}

/// Bidirectional framed stream to one remote peer. Implementations are
/// shared across the send, receive, and teardown paths, so every method
/// takes `&self` and `close` may be called from any of them, repeatedly.
#[async_trait]
pub trait Client: Send + Sync {
    async fn send(&self, data: Vec<u8>) -> Result<()>;
    async fn receive(&self) -> Result<TransportMessage>;
    fn remote_addr(&self) -> String;
    async fn close(&self, reason: &str);
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Arc<dyn Client>>;
    async fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>>;
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Client>>;
}

/// Validate a configured relayer address: parseable "host:port", a
/// specified IP, and a port outside the reserved low range.
pub fn validate_relayer_address(addr: &str) -> Result<SocketAddr> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid address {}", addr))?;
    if socket_addr.ip().is_unspecified() {
        bail!("invalid address {}: unspecified ip", addr);
    }
    if socket_addr.port() < 80 {
        bail!("invalid address {}: reserved port {}", addr, socket_addr.port());
    }
    Ok(socket_addr)
}
