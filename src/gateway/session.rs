use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// One connected period's parameters: the resolved gateway URL, the auth
/// token, and the heartbeat interval negotiated by the READY handshake.
/// Replaced wholesale on every connection attempt; the interval is the only
/// field written after construction, exactly once.
pub struct Session {
    gateway_url: String,
    token: String,
    /// Milliseconds; 0 while the handshake has not completed.
    heartbeat_interval_ms: AtomicU64,
}

impl Session {
    pub fn new(gateway_url: &str, token: &str) -> Self {
        Self {
            gateway_url: gateway_url.to_string(),
            token: token.to_string(),
            heartbeat_interval_ms: AtomicU64::new(0),
        }
    }

    pub fn gateway_url(&self) -> &str {
        &self.gateway_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Records the interval from the handshake payload. Only the first
    /// nonzero write per connection attempt takes effect.
    pub fn set_heartbeat_interval(&self, ms: u64) -> bool {
        if ms == 0 {
            return false;
        }
        self.heartbeat_interval_ms
            .compare_exchange(0, ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms.load(Ordering::Acquire)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_interval_ms() {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
