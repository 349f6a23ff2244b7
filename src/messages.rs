//! # Wire Protocol Messages
//!
//! Every payload carried by the transport starts with a one-byte message
//! type. The transport core parses the types it routes on (authentication,
//! consumer advertisements, relay envelopes, sync points) and hands
//! everything else to the consensus layer opaquely.
//!
//! | Type | Body |
//! |--------------------|---------------------------------------------|
//! | `Authentication` | opaque handshake bytes from the sync handle |
//! | `Snapshot` | opaque application payload |
//! | `Consumers` | concatenated 32-byte node ids |
//! | `Relay` | 32-byte destination + inner payload |
//! | `SyncPoints` | bounded bincode `Vec<SyncPoint>` |
//!
//! Sync points use bincode with a hard deserialization limit so a hostile
//! peer cannot force an oversized allocation.

use anyhow::{bail, Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Protocol version carried in the outer transport frame.
pub const PROTOCOL_VERSION: u8 = 1;

pub const MESSAGE_TYPE_AUTHENTICATION: u8 = 1;
pub const MESSAGE_TYPE_SNAPSHOT: u8 = 2;
pub const MESSAGE_TYPE_CONSUMERS: u8 = 3;
pub const MESSAGE_TYPE_RELAY: u8 = 4;
pub const MESSAGE_TYPE_SYNC_POINTS: u8 = 5;

/// Maximum encoded size of a sync-point batch.
const MAX_SYNC_POINTS_SIZE: u64 = 64 * 1024;

/// Returns bincode options with the size limit enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_SYNC_POINTS_SIZE)
        .with_fixint_encoding()
}

/// A round position gossiped by a neighbor; consumed opaquely by the
/// consensus layer's sync hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub node_id: NodeId,
    pub number: u64,
    pub hash: [u8; 32],
}

/// A parsed inbound payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Authentication { data: Vec<u8> },
    Snapshot { data: Vec<u8> },
    Consumers { consumers: Vec<NodeId> },
    Relay { destination: NodeId, payload: Vec<u8> },
    SyncPoints { points: Vec<SyncPoint> },
}

impl PeerMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            PeerMessage::Authentication { .. } => MESSAGE_TYPE_AUTHENTICATION,
            PeerMessage::Snapshot { .. } => MESSAGE_TYPE_SNAPSHOT,
            PeerMessage::Consumers { .. } => MESSAGE_TYPE_CONSUMERS,
            PeerMessage::Relay { .. } => MESSAGE_TYPE_RELAY,
            PeerMessage::SyncPoints { .. } => MESSAGE_TYPE_SYNC_POINTS,
        }
    }
}

pub fn build_authentication_message(data: &[u8]) -> Vec<u8> {
    build_typed_message(MESSAGE_TYPE_AUTHENTICATION, data)
}

pub fn build_snapshot_message(data: &[u8]) -> Vec<u8> {
    build_typed_message(MESSAGE_TYPE_SNAPSHOT, data)
}

pub fn build_consumers_message(consumers: &[NodeId]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + consumers.len() * NodeId::LEN);
    payload.push(MESSAGE_TYPE_CONSUMERS);
    for id in consumers {
        payload.extend_from_slice(id.as_bytes());
    }
    payload
}

/// Wrap a payload in a relay envelope addressed to `destination`.
pub fn build_relay_message(destination: NodeId, payload: &[u8]) -> Vec<u8> {
    let mut envelope = Vec::with_capacity(1 + NodeId::LEN + payload.len());
    envelope.push(MESSAGE_TYPE_RELAY);
    envelope.extend_from_slice(destination.as_bytes());
    envelope.extend_from_slice(payload);
    envelope
}

pub fn build_sync_points_message(points: &[SyncPoint]) -> Result<Vec<u8>> {
    let body = bincode_options()
        .serialize(points)
        .context("sync points batch exceeds encoding limit")?;
    Ok(build_typed_message(MESSAGE_TYPE_SYNC_POINTS, &body))
}

/// Prefix `data` with an application message type byte.
pub fn build_typed_message(message_type: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + data.len());
    payload.push(message_type);
    payload.extend_from_slice(data);
    payload
}

/// Parse a framed payload received from the transport.
pub fn parse_network_message(version: u8, data: &[u8]) -> Result<PeerMessage> {
    if version != PROTOCOL_VERSION {
        bail!("unsupported protocol version {}", version);
    }
    let Some((&message_type, body)) = data.split_first() else {
        bail!("empty network message");
    };
    match message_type {
        MESSAGE_TYPE_AUTHENTICATION => Ok(PeerMessage::Authentication {
            data: body.to_vec(),
        }),
        MESSAGE_TYPE_SNAPSHOT => Ok(PeerMessage::Snapshot {
            data: body.to_vec(),
        }),
        MESSAGE_TYPE_CONSUMERS => {
            if body.len() % NodeId::LEN != 0 {
                bail!("consumers body length {} not id-aligned", body.len());
            }
            let consumers = body
                .chunks_exact(NodeId::LEN)
                .filter_map(NodeId::from_slice)
                .collect();
            Ok(PeerMessage::Consumers { consumers })
        }
        MESSAGE_TYPE_RELAY => {
            if body.len() < NodeId::LEN {
                bail!("relay envelope too short: {} bytes", body.len());
            }
            let (dest, payload) = body.split_at(NodeId::LEN);
            let destination =
                NodeId::from_slice(dest).context("relay destination malformed")?;
            Ok(PeerMessage::Relay {
                destination,
                payload: payload.to_vec(),
            })
        }
        MESSAGE_TYPE_SYNC_POINTS => {
            let points: Vec<SyncPoint> = bincode_options()
                .deserialize(body)
                .context("sync points body malformed")?;
            Ok(PeerMessage::SyncPoints { points })
        }
        other => bail!("unknown message type {}", other),
    }
}

// ============================================================================
// Fingerprints
// ============================================================================

/// Dedup key for snapshot traffic: `dest || snap || "SNAP" || type`.
pub fn snapshot_message_key(dest: &NodeId, snap: &[u8; 32], message_type: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(NodeId::LEN + 32 + 5);
    key.extend_from_slice(dest.as_bytes());
    key.extend_from_slice(snap);
    key.extend_from_slice(b"SNAP");
    key.push(message_type);
    key
}

/// Base fingerprint of a relay envelope: `H(H(envelope) || "REMOTE")`.
pub fn relay_base_fingerprint(envelope: &[u8]) -> [u8; 32] {
    let inner = blake3::hash(envelope);
    let mut keyed = Vec::with_capacity(32 + 6);
    keyed.extend_from_slice(inner.as_bytes());
    keyed.extend_from_slice(b"REMOTE");
    *blake3::hash(&keyed).as_bytes()
}

/// Per-link fingerprint: `H(base || relayer_id)`. Lets one logical payload
/// transit different relayers while suppressing re-forwarding by the same
/// node within the dedup TTL.
pub fn relay_link_fingerprint(base: &[u8; 32], relayer: &NodeId) -> [u8; 32] {
    let mut keyed = Vec::with_capacity(32 + NodeId::LEN);
    keyed.extend_from_slice(base);
    keyed.extend_from_slice(relayer.as_bytes());
    *blake3::hash(&keyed).as_bytes()
}

/// Peer-scoped fingerprint for broadcast traffic: `H(msg || peer_id)`.
pub fn peer_scoped_key(msg: &[u8], peer: &NodeId) -> [u8; 32] {
    let mut keyed = Vec::with_capacity(msg.len() + NodeId::LEN);
    keyed.extend_from_slice(msg);
    keyed.extend_from_slice(peer.as_bytes());
    *blake3::hash(&keyed).as_bytes()
}
