use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RestConfig {
    /// Base URL of the REST API, without a trailing slash.
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://chat.example.com/api/v1".to_string(),
            timeout_ms: 10_000,
        }
    }
}
