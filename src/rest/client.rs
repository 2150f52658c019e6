use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;

use super::{MessageApi, OutgoingMessage, ServerMessage};
use crate::{
    common::{
        errors::RestError,
        http::HttpClient,
        types::{AnyResult, ChannelId, MessageId},
    },
    configs::RestConfig,
};

/// Production `MessageApi` over HTTP.
pub struct HttpMessageApi {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpMessageApi {
    pub fn new(config: &RestConfig) -> AnyResult<Self> {
        Ok(Self {
            http: HttpClient::new(config.timeout_ms)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// Installed by the client on connect, cleared on disconnect.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    fn message_url(&self, channel: ChannelId, message: Option<MessageId>) -> String {
        match message {
            Some(id) => format!("{}/channels/{}/messages/{}", self.base_url, channel, id),
            None => format!("{}/channels/{}/messages", self.base_url, channel),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.read().as_deref() {
            Some(token) => req.header("Authorization", token.to_string()),
            None => req,
        }
    }

    fn check_status(status: StatusCode) -> Result<(), RestError> {
        if status == StatusCode::NOT_FOUND {
            return Err(RestError::NotFound);
        }
        if !status.is_success() {
            return Err(RestError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn send_message(
        &self,
        channel: ChannelId,
        message: &OutgoingMessage,
    ) -> Result<ServerMessage, RestError> {
        let response = self
            .authorize(self.http.post(self.message_url(channel, None)))
            .json(message)
            .send()
            .await
            .map_err(|e| RestError::Transport(e.to_string()))?;

        Self::check_status(response.status())?;
        response
            .json::<ServerMessage>()
            .await
            .map_err(|e| RestError::Decode(e.to_string()))
    }

    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> Result<(), RestError> {
        let response = self
            .authorize(self.http.patch(self.message_url(channel, Some(message))))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .map_err(|e| RestError::Transport(e.to_string()))?;

        Self::check_status(response.status())
    }

    async fn delete_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), RestError> {
        let response = self
            .authorize(self.http.delete(self.message_url(channel, Some(message))))
            .send()
            .await
            .map_err(|e| RestError::Transport(e.to_string()))?;

        Self::check_status(response.status())
    }
}
