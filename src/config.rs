//! Host configuration.

use std::time::Duration;

/// Tunables for a [`PeerHost`](crate::host::PeerHost).
#[derive(Clone, Debug)]
pub struct Config {
    /// Cadence of the consumers broadcast and of outbound relayer redials.
    pub snapshot_round_gap: Duration,
    /// Budget handed to `SyncHandle::authenticate_as`, in whole seconds.
    pub handshake_timeout: Duration,
    /// Enables the sent/received counter pools.
    pub metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshot_round_gap: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
            metrics_enabled: false,
        }
    }
}
