use rand::Rng;

use super::constants::{RTP_HEADER_SIZE, RTP_PAYLOAD_TYPE, RTP_VERSION_BYTE};

/// RTP sequence/timestamp register for one voice session. The sequence
/// advances by one per transmitted packet and wraps modulo 16 bits; the
/// timestamp advances by exactly one frame's sample count per frame tick,
/// whether or not a packet went out, so the remote jitter buffer sees a
/// continuous timeline.
pub struct RtpStream {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    samples_per_frame: u32,
}

impl RtpStream {
    pub fn new(ssrc: u32, samples_per_frame: u32) -> Self {
        Self {
            ssrc,
            // Random starting sequence, standard RTP practice.
            sequence: rand::thread_rng().r#gen(),
            timestamp: 0,
            samples_per_frame,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Stamps the current sequence/timestamp into a fixed 12-byte header.
    pub fn header(&self) -> [u8; RTP_HEADER_SIZE] {
        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = RTP_VERSION_BYTE;
        header[1] = RTP_PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Builds header + payload into `out` and advances the sequence number.
    /// The timestamp is advanced separately, once per frame tick.
    pub fn packetize(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&self.header());
        out.extend_from_slice(payload);
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Advances the timestamp by one frame of samples. Called on every frame
    /// tick regardless of whether the queue had a packet to transmit.
    pub fn advance_frame(&mut self) {
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_frame);
    }
}
