use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// How long `connect()` waits for the READY handshake before failing.
    pub connect_timeout_ms: u64,
    /// Poll granularity of the combined send/heartbeat loop.
    pub heartbeat_poll_ms: u64,
    /// The read side treats the connection as dead after
    /// `heartbeat_interval * stale_multiplier` without any inbound traffic.
    pub stale_multiplier: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            heartbeat_poll_ms: 100,
            stale_multiplier: 3,
        }
    }
}
