use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// When false, message operations call the REST layer directly instead
    /// of going through the outgoing action queue.
    pub enabled: bool,
    /// Sleep between drain passes when a kind-queue is empty.
    pub drain_interval_ms: u64,
    /// First backlog warning fires at this many pending actions; each
    /// subsequent warning threshold doubles.
    pub warning_start: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drain_interval_ms: 100,
            warning_start: 30,
        }
    }
}
