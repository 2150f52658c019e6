use std::{io::Cursor, net::SocketAddr, time::Duration};

use byteorder::{LittleEndian, ReadBytesExt};
use tokio::net::UdpSocket;

use super::constants::DISCOVERY_PACKET_SIZE;
use crate::common::errors::VoiceError;

/// Builds the 70-byte discovery request: SSRC big-endian in bytes 0-3, the
/// rest zero padding.
pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    packet[0..4].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Parses the discovery response: bytes 4-67 hold our externally visible IP
/// as a null-terminated ASCII string, bytes 68-69 the port, little-endian.
pub fn parse_discovery_response(buf: &[u8]) -> Result<(String, u16), VoiceError> {
    if buf.len() < DISCOVERY_PACKET_SIZE {
        return Err(VoiceError::MalformedDiscovery(format!(
            "short packet: {} bytes",
            buf.len()
        )));
    }

    let ip_field = &buf[4..68];
    let end = ip_field
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(ip_field.len());
    let ip = std::str::from_utf8(&ip_field[..end])
        .map_err(|e| VoiceError::MalformedDiscovery(format!("IP field not ASCII: {}", e)))?
        .to_string();
    if ip.is_empty() {
        return Err(VoiceError::MalformedDiscovery("empty IP field".into()));
    }

    let port = Cursor::new(&buf[68..70])
        .read_u16::<LittleEndian>()
        .map_err(|e| VoiceError::MalformedDiscovery(e.to_string()))?;

    Ok((ip, port))
}

/// Runs the discovery round trip against the voice endpoint.
pub async fn discover_ip(
    socket: &UdpSocket,
    addr: SocketAddr,
    ssrc: u32,
    timeout: Duration,
) -> Result<(String, u16), VoiceError> {
    let packet = discovery_request(ssrc);
    socket
        .send_to(&packet, addr)
        .await
        .map_err(|e| VoiceError::Transport(e.to_string()))?;

    let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => parse_discovery_response(&buf[..n]),
        Ok(Err(e)) => Err(VoiceError::Transport(e.to_string())),
        Err(_) => Err(VoiceError::DiscoveryTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(ip: &str, port: u16) -> [u8; DISCOVERY_PACKET_SIZE] {
        let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
        buf[4..4 + ip.len()].copy_from_slice(ip.as_bytes());
        buf[68..70].copy_from_slice(&port.to_le_bytes());
        buf
    }

    #[test]
    fn test_request_layout() {
        let packet = discovery_request(0xDEAD_BEEF);
        assert_eq!(packet.len(), 70);
        assert_eq!(&packet[0..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(packet[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_valid_response() {
        let buf = response("203.0.113.7", 50_004);
        let (ip, port) = parse_discovery_response(&buf).unwrap();
        assert_eq!(ip, "203.0.113.7");
        assert_eq!(port, 50_004);
    }

    #[test]
    fn test_port_is_little_endian() {
        let mut buf = response("198.51.100.1", 0);
        buf[68] = 0x34;
        buf[69] = 0x12;
        let (_, port) = parse_discovery_response(&buf).unwrap();
        assert_eq!(port, 0x1234);
    }

    #[test]
    fn test_short_packet_rejected() {
        let buf = [0u8; 20];
        assert!(matches!(
            parse_discovery_response(&buf),
            Err(VoiceError::MalformedDiscovery(_))
        ));
    }

    #[test]
    fn test_empty_ip_rejected() {
        let buf = response("", 1234);
        assert!(matches!(
            parse_discovery_response(&buf),
            Err(VoiceError::MalformedDiscovery(_))
        ));
    }
}
