/// Voice signaling protocol version appended to the WebSocket URL.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Size of the UDP IP-discovery request and response.
pub const DISCOVERY_PACKET_SIZE: usize = 70;

/// RTP fixed header: version/flags, payload type, sequence, timestamp, SSRC.
pub const RTP_HEADER_SIZE: usize = 12;
pub const RTP_VERSION_BYTE: u8 = 0x80;
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;

/// Within this distance of the next frame boundary the pacer busy-polls the
/// stopwatch instead of sleeping, for sub-millisecond pacing accuracy.
pub const SPIN_THRESHOLD_NANOS: u64 = 1_500_000;

/// Transport mode used when the server's offer list holds nothing we prefer.
pub const DEFAULT_VOICE_MODE: &str = "plain";

/// Offered modes in preference order.
pub const PREFERRED_MODES: [&str; 2] = ["plain", "xsalsa20_poly1305"];

/// Fallback signaling heartbeat interval when HELLO omits one.
pub const DEFAULT_VOICE_HEARTBEAT_MS: u64 = 30_000;
