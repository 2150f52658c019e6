pub mod backoff;
pub mod handler;
pub mod heartbeat;
pub mod outbound;
pub mod reconnect;
pub mod session;
pub mod socket;
pub mod state;

pub use session::Session;
pub use socket::{Connector, SocketRx, SocketTx, WireFrame, WsConnector};
pub use state::{ConnectionState, StateMachine};

use crate::common::errors::GatewayError;

/// Why a connection ended. Expected terminations (the caller asked) stop
/// here; unexpected ones carry the captured error and drive the reconnect
/// supervisor.
#[derive(Debug)]
pub enum DisconnectReason {
    Expected,
    Unexpected { source: GatewayError },
}

impl DisconnectReason {
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Expected)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Expected => "requested by caller".to_string(),
            Self::Unexpected { source } => source.to_string(),
        }
    }
}
