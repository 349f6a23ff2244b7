//! Per-message-type counters, optional and off by default.

use std::collections::HashMap;
use std::sync::Mutex;

/// Counts handled messages by type byte. A disabled pool is a no-op and is
/// omitted from [`PeerHost::metric`](crate::host::PeerHost::metric).
pub struct MetricPool {
    enabled: bool,
    counters: Mutex<HashMap<u8, u64>>,
}

impl MetricPool {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, message_type: u8) {
        if !self.enabled {
            return;
        }
        let mut counters = self.counters.lock().expect("metric lock poisoned");
        *counters.entry(message_type).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> HashMap<u8, u64> {
        self.counters.lock().expect("metric lock poisoned").clone()
    }
}
