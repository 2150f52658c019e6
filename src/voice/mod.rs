pub mod constants;
pub mod discovery;
pub mod gateway;
pub mod pacer;
pub mod rtp;

pub use gateway::VoiceConnection;
pub use rtp::RtpStream;

use crate::common::types::{SessionId, UserId};

/// Voice session lifecycle: Idle until the signaling handshake starts UDP
/// discovery, Ready once the server acknowledges the protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Discovering,
    Ready,
}

/// Everything needed to join a voice endpoint, handed to the client by
/// whatever dispatched the voice-server assignment.
#[derive(Debug, Clone)]
pub struct VoiceServerInfo {
    /// Hostname of the voice signaling endpoint.
    pub endpoint: String,
    pub server_id: String,
    pub session_id: SessionId,
    pub token: String,
    pub user_id: UserId,
}
