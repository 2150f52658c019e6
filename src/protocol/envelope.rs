use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::opcodes;

/// The wire envelope shared by the gateway and voice signaling sockets:
/// `{op, t (event type), d (payload)}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

impl Envelope {
    pub fn new(op: u8, d: Value) -> Self {
        Self { op, t: None, d }
    }

    /// Keepalive frame. No payload body beyond the op code.
    pub fn heartbeat() -> Self {
        Self::new(opcodes::gateway::HEARTBEAT, Value::Null)
    }

    pub fn identify(token: &str) -> Self {
        Self::new(
            opcodes::gateway::IDENTIFY,
            serde_json::json!({ "token": token }),
        )
    }

    pub fn dispatch(t: &str, d: Value) -> Self {
        Self {
            op: opcodes::gateway::DISPATCH,
            t: Some(t.to_string()),
            d,
        }
    }

    pub fn is_dispatch(&self, event: &str) -> bool {
        self.op == opcodes::gateway::DISPATCH && self.t.as_deref() == Some(event)
    }

    pub fn to_json(&self) -> String {
        // The envelope is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
