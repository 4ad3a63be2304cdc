use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bridge tuning knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Inner deadline for payload preparation: the worker stops adding
    /// transactions once this much time has passed, but still finishes
    /// encoding what it has.
    pub payload_soft_limit_ms: u64,
    /// Outer deadline: the consensus caller gets whatever is ready by now,
    /// possibly nothing.
    pub payload_hard_limit_ms: u64,
    /// Capacity of the verified-sender cache.
    pub sender_cache_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            payload_soft_limit_ms: 100,
            payload_hard_limit_ms: 150,
            sender_cache_size: 16_384,
        }
    }
}

impl BridgeConfig {
    pub fn soft_limit(&self) -> Duration {
        Duration::from_millis(self.payload_soft_limit_ms)
    }

    pub fn hard_limit(&self) -> Duration {
        Duration::from_millis(self.payload_hard_limit_ms)
    }
}
