pub mod cache;
pub mod client;
pub mod common;
pub mod configs;
pub mod gateway;
pub mod protocol;
pub mod queue;
pub mod rest;
pub mod voice;

pub use client::ChatClient;
pub use common::errors::{GatewayError, QueueError, RestError, VoiceError};
pub use configs::Config;
pub use gateway::ConnectionState;
pub use protocol::ClientEvent;
pub use voice::{VoiceServerInfo, VoiceState};
