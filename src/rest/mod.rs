pub mod client;
pub mod models;

pub use client::HttpMessageApi;
pub use models::{OutgoingMessage, ServerMessage};

use async_trait::async_trait;

use crate::common::{
    errors::RestError,
    types::{ChannelId, MessageId},
};

/// The REST surface the outgoing action queue drains into. Kept behind a
/// trait so queue ordering and failure policy are testable against a
/// recording mock.
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn send_message(
        &self,
        channel: ChannelId,
        message: &OutgoingMessage,
    ) -> Result<ServerMessage, RestError>;

    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> Result<(), RestError>;

    async fn delete_message(&self, channel: ChannelId, message: MessageId)
    -> Result<(), RestError>;
}
