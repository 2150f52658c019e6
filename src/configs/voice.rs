use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VoiceConfig {
    /// Capability flag resolved at client construction. When false,
    /// `join_voice` fails without touching the network.
    pub enabled: bool,
    /// Duration of one pre-encoded audio frame.
    pub frame_duration_ms: u64,
    /// Sample rate the frame timestamps advance against.
    pub sample_rate: u32,
    /// Target depth of the outgoing frame buffer; below this the pacer asks
    /// the producer for more audio.
    pub buffer_length_ms: u64,
    /// Timeout for the UDP IP discovery round trip.
    pub discovery_timeout_ms: u64,
    /// How long `join_voice` waits for the signaling handshake to reach Ready.
    pub connect_timeout_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_duration_ms: 20,
            sample_rate: 48_000,
            buffer_length_ms: 1_000,
            discovery_timeout_ms: 2_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl VoiceConfig {
    /// Samples one frame advances the RTP timestamp by.
    pub fn samples_per_frame(&self) -> u32 {
        self.sample_rate / 1000 * self.frame_duration_ms as u32
    }

    /// Frame-buffer depth corresponding to `buffer_length_ms`.
    pub fn buffer_frames(&self) -> usize {
        (self.buffer_length_ms / self.frame_duration_ms.max(1)) as usize
    }
}
