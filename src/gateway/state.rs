use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

/// Gateway connection lifecycle. Stored as an atomic integer; every
/// transition goes through compare-and-swap so racing writers cannot both
/// claim the same transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        write!(f, "{}", s)
    }
}

/// The connection state register plus awaitable signals. The atomic is the
/// source of truth; a `watch` channel mirrors it so waiters can suspend
/// instead of spinning.
pub struct StateMachine {
    state: AtomicU8,
    signal: watch::Sender<ConnectionState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            signal,
        }
    }

    pub fn current(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn publish(&self) {
        // Re-read the register rather than publishing the CAS target: if a
        // later transition already landed, the watch converges on it.
        let _ = self.signal.send_replace(self.current());
    }

    /// Single CAS transition. Exactly one of any set of racing callers with
    /// the same `from` observes `true`.
    pub fn try_transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.publish();
        }
        ok
    }

    /// Claims the Connecting transition. Fails unless currently Disconnected,
    /// which bounds in-flight connect attempts to one.
    pub fn begin_connect(&self) -> bool {
        self.try_transition(ConnectionState::Disconnected, ConnectionState::Connecting)
    }

    pub fn complete_connect(&self) -> bool {
        self.try_transition(ConnectionState::Connecting, ConnectionState::Connected)
    }

    /// Claims the Disconnecting transition from either Connected or
    /// Connecting. Returns the prior state to the single winner; losers get
    /// `None` and must not run cleanup.
    pub fn begin_disconnect(&self) -> Option<ConnectionState> {
        for from in [ConnectionState::Connected, ConnectionState::Connecting] {
            if self.try_transition(from, ConnectionState::Disconnecting) {
                return Some(from);
            }
        }
        None
    }

    /// Called once by the cleanup owner after all background tasks exited.
    pub fn complete_disconnect(&self) {
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::Release);
        self.publish();
    }

    pub async fn wait_for(&self, target: ConnectionState) {
        let mut rx = self.signal.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|s| *s == target).await;
    }

    pub async fn wait_connected(&self) {
        self.wait_for(ConnectionState::Connected).await;
    }

    pub async fn wait_disconnected(&self) {
        self.wait_for(ConnectionState::Disconnected).await;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_initial_state_is_disconnected() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_begin_connect_only_from_disconnected() {
        let sm = StateMachine::new();
        assert!(sm.begin_connect());
        assert_eq!(sm.current(), ConnectionState::Connecting);
        // Second connect while one is in flight must lose.
        assert!(!sm.begin_connect());
    }

    #[test]
    fn test_complete_connect_requires_connecting() {
        let sm = StateMachine::new();
        assert!(!sm.complete_connect());
        sm.begin_connect();
        assert!(sm.complete_connect());
        assert_eq!(sm.current(), ConnectionState::Connected);
    }

    #[test]
    fn test_begin_disconnect_claims_from_connected_and_connecting() {
        let sm = StateMachine::new();
        sm.begin_connect();
        assert_eq!(sm.begin_disconnect(), Some(ConnectionState::Connecting));

        sm.complete_disconnect();
        sm.begin_connect();
        sm.complete_connect();
        assert_eq!(sm.begin_disconnect(), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_begin_disconnect_from_disconnected_is_noop() {
        let sm = StateMachine::new();
        assert_eq!(sm.begin_disconnect(), None);
        assert_eq!(sm.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_concurrent_disconnects_have_one_winner() {
        let sm = Arc::new(StateMachine::new());
        sm.begin_connect();
        sm.complete_connect();

        let mut winners = 0;
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let sm = sm.clone();
                    s.spawn(move || sm.begin_disconnect().is_some())
                })
                .collect();
            for h in handles {
                if h.join().unwrap() {
                    winners += 1;
                }
            }
        });
        assert_eq!(winners, 1);
        assert_eq!(sm.current(), ConnectionState::Disconnecting);
    }

    #[tokio::test]
    async fn test_wait_connected_wakes_on_transition() {
        let sm = Arc::new(StateMachine::new());
        let waiter = {
            let sm = sm.clone();
            tokio::spawn(async move { sm.wait_connected().await })
        };
        sm.begin_connect();
        sm.complete_connect();
        waiter.await.unwrap();
        assert_eq!(sm.current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_wait_disconnected_returns_immediately_when_already_there() {
        let sm = StateMachine::new();
        sm.wait_disconnected().await;
    }
}
