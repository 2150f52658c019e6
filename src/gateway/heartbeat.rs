use std::time::Duration;

use tokio::time::Instant;

/// Decides when a keepalive is due. Lives inside the outbound drain loop so
/// heartbeat emission is naturally serialized with other outgoing frames on
/// the one socket; there is no separate OS timer.
pub(crate) struct HeartbeatClock {
    interval: Option<Duration>,
    last_beat: Option<Instant>,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self {
            interval: None,
            last_beat: None,
        }
    }

    /// Feeds the interval from the session. The first nonzero value arms the
    /// clock; later calls are ignored.
    pub fn observe_interval(&mut self, ms: u64) {
        if self.interval.is_none() && ms > 0 {
            self.interval = Some(Duration::from_millis(ms));
        }
    }

    /// Checked on every drain-loop iteration. Returns true when a keepalive
    /// should go out now, and re-arms for the next one. With no interval
    /// known (handshake pending) nothing is ever due.
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };
        match self.last_beat {
            None => {
                // First observation after the handshake: start counting, the
                // first beat goes out one full interval from here.
                self.last_beat = Some(now);
                false
            }
            Some(last) if now.duration_since(last) >= interval => {
                self.last_beat = Some(now);
                true
            }
            Some(_) => false,
        }
    }
}
