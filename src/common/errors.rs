use std::time::Duration;

use thiserror::Error;

/// Gateway connection failures surfaced to `connect()` callers or captured
/// into a [`DisconnectReason`](crate::gateway::DisconnectReason).
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The READY handshake did not complete within the configured timeout.
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    /// A connect was attempted while another connection is active or pending.
    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    /// The attempt's cancellation scope fired while the handshake was in
    /// flight (a racing disconnect or client shutdown).
    #[error("connection attempt cancelled")]
    Cancelled,

    /// The socket closed without a server close frame (I/O error, stream end).
    #[error("socket closed: {0}")]
    SocketClosed(String),

    /// The server sent an explicit close frame.
    #[error("server closed connection: code={code}, reason='{reason}'")]
    ServerClose { code: u16, reason: String },

    /// No inbound traffic for a multiple of the heartbeat interval.
    #[error("connection stale: no server traffic for {0:?}")]
    Stale(Duration),

    /// A malformed or out-of-contract frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Failures from the REST collaborator. `NotFound` is distinguished so the
/// delete queue can absorb it as an idempotent no-op.
#[derive(Debug, Clone, Error)]
pub enum RestError {
    #[error("resource not found")]
    NotFound,

    #[error("http status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Resolution of a queued action's completion handle.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The queue was stopped before the action reached the wire.
    #[error("action queue stopped")]
    Stopped,

    /// The action was removed from the queue before it reached the wire
    /// (a queued send deleted before transmission).
    #[error("action aborted before send")]
    Aborted,

    #[error(transparent)]
    Rest(#[from] RestError),
}

/// Voice transport failures, surfaced to the voice join caller only. They
/// never affect the primary gateway connection.
#[derive(Debug, Clone, Error)]
pub enum VoiceError {
    #[error("voice support is disabled")]
    Disabled,

    #[error("gateway is not connected")]
    NotConnected,

    #[error("voice handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("IP discovery timed out")]
    DiscoveryTimeout,

    #[error("malformed IP discovery response: {0}")]
    MalformedDiscovery(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("transport error: {0}")]
    Transport(String),
}
