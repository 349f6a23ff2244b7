//! # Meshwire - Authenticated Relay-Mesh Transport Core
//!
//! Meshwire maintains authenticated, multiplexed, bidirectional streaming
//! sessions between consensus nodes over QUIC and routes application
//! messages either directly to a destination peer or through relayer
//! peers, with bounded per-peer queues, fingerprint deduplication,
//! priority scheduling, and flood-style relaying with loop suppression.
//!
//! ## Architecture
//!
//! A [`PeerHost`] owns the mesh state: two neighbor maps (inbound
//! `consumers` and outbound `relayers`), a destination→relayer discovery
//! map fed by gossiped consumer lists, and a shared dedup cache. Each
//! authenticated neighbor gets a [`session::PeerSession`] running three
//! loops (send, receive, sync) until either side closes.
//!
//! The consensus layer plugs in through [`SyncHandle`]: it builds and
//! verifies handshake messages, supplies the dedup cache backend, and
//! consumes application messages and sync points. The datagram layer is
//! abstracted behind [`transport::Transport`]; [`quic::QuicTransport`] is
//! the production implementation.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |-------------|----------------------------------------------------|
//! | `host` | `PeerHost`: lifecycle, dispatch, relay topology |
//! | `session` | per-neighbor rings, exit signals, disconnection |
//! | `neighbors` | identity→session and destination→relayer maps |
//! | `ring` | bounded non-blocking disposable queues |
//! | `cache` | TTL fingerprint dedup over a pluggable store |
//! | `messages` | wire payloads, fingerprints, sync points |
//! | `transport` | datagram transport contracts |
//! | `quic` | quinn implementation of the contracts |
//! | `metrics` | optional per-message-type counters |
//! | `identity` | 32-byte opaque node ids |
//! | `config` | host tunables |

pub mod cache;
pub mod config;
pub mod host;
pub mod identity;
pub mod messages;
pub mod metrics;
pub mod neighbors;
pub mod quic;
pub mod ring;
pub mod session;
pub mod transport;

pub use cache::{CacheStore, DedupCache, LruCacheStore, DEDUP_TTL};
pub use config::Config;
pub use host::{AuthToken, PeerHost, SyncHandle, AUTHENTICATION_TIMEOUT};
pub use identity::NodeId;
pub use messages::{PeerMessage, SyncPoint, PROTOCOL_VERSION};
pub use quic::QuicTransport;
pub use session::{OutboundMessage, PeerSession, Priority};
pub use transport::{Client, Listener, Transport, TransportMessage, MAX_INCOMING_STREAMS};
