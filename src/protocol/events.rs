use serde_json::Value;

/// Notifications published to the client's event channel. Subscribers take
/// the receiver once; the publisher never holds references to subscriber
/// state, so a failed consumer cannot poison the connection tasks.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The READY handshake completed and the state machine reached Connected.
    Connected,
    /// The connection reached Disconnected. `expected` is true for
    /// caller-initiated disconnects.
    Disconnected { expected: bool, reason: String },
    /// Any dispatch event other than READY, forwarded verbatim.
    Dispatch { t: String, d: Value },
    /// The gateway socket closed with an explicit server close frame.
    GatewayClosed { code: u16, reason: String },
}
