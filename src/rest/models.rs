use serde::{Deserialize, Serialize};

use crate::common::types::{ChannelId, MessageId, UserId};

/// Body of a message create/edit call.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub content: String,
    /// Client-generated nonce echoed back by the server, used to correlate
    /// queued sends with their confirmations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl OutgoingMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            nonce: None,
        }
    }
}

/// The server-confirmed message entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub content: String,
    #[serde(default)]
    pub author_id: Option<UserId>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}
