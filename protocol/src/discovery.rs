use crate::error::ProtocolError;
use crate::io::{Cursor, Reader};

/// Message type of an IP discovery request.
pub const DISCOVERY_REQUEST: u16 = 0x0001;

/// Message type of an IP discovery response.
pub const DISCOVERY_RESPONSE: u16 = 0x0002;

/// Value of the length field: the payload after the 4-byte type/length prefix.
pub const DISCOVERY_MESSAGE_LEN: u16 = 70;

/// Total size of a discovery message on the wire.
pub const DISCOVERY_PACKET_SIZE: usize = 74;

const ADDRESS_FIELD_LEN: usize = 64;

/// The externally visible address advertised by a discovery response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub ssrc: u32,
    pub address: String,
    pub port: u16,
}

/// Builds the 74-byte discovery request: type, length, ssrc, zero padding.
#[must_use]
pub fn encode_discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
    let mut w = Cursor::new(&mut buf);
    // 74 bytes into a 74-byte buffer cannot fail
    let _ = w.write_u16(DISCOVERY_REQUEST);
    let _ = w.write_u16(DISCOVERY_MESSAGE_LEN);
    let _ = w.write_u32(ssrc);
    buf
}

/// Decodes a discovery response: the echoed ssrc, a NUL-padded ASCII address
/// and a big-endian port.
pub fn decode_discovery_response(buffer: &[u8]) -> Result<DiscoveryResponse, ProtocolError> {
    let mut r = Reader::new(buffer);

    let message_type = r.read_u16()?;
    if message_type != DISCOVERY_RESPONSE {
        return Err(ProtocolError::UnexpectedMessageType(message_type));
    }

    let length = r.read_u16()?;
    if length != DISCOVERY_MESSAGE_LEN {
        return Err(ProtocolError::LengthMismatch {
            expected: DISCOVERY_MESSAGE_LEN,
            got: length,
        });
    }

    let ssrc = r.read_u32()?;

    let raw_address = r.read_bytes(ADDRESS_FIELD_LEN)?;
    let terminated = raw_address
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(ADDRESS_FIELD_LEN);
    let address = std::str::from_utf8(&raw_address[..terminated])
        .map_err(|_| ProtocolError::InvalidAddress)?
        .to_owned();

    let port = r.read_u16()?;

    Ok(DiscoveryResponse { ssrc, address, port })
}

/// Builds a discovery response; the server side of the exchange, used by
/// loopback responders in tests.
#[must_use]
pub fn encode_discovery_response(response: &DiscoveryResponse) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
    let mut w = Cursor::new(&mut buf);
    let _ = w.write_u16(DISCOVERY_RESPONSE);
    let _ = w.write_u16(DISCOVERY_MESSAGE_LEN);
    let _ = w.write_u32(response.ssrc);
    let address = response.address.as_bytes();
    let _ = w.write_bytes(&address[..address.len().min(ADDRESS_FIELD_LEN)]);
    let _ = w.advance(ADDRESS_FIELD_LEN.saturating_sub(address.len()));
    let _ = w.write_u16(response.port);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let request = encode_discovery_request(0xDEAD_BEEF);
        assert_eq!(request.len(), DISCOVERY_PACKET_SIZE);
        assert_eq!(&request[..8], &[0x00, 0x01, 0x00, 70, 0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(request[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn roundtrip_response() {
        let response = DiscoveryResponse {
            ssrc: 12345,
            address: "203.0.113.17".to_string(),
            port: 50000,
        };
        let encoded = encode_discovery_response(&response);
        assert_eq!(decode_discovery_response(&encoded).unwrap(), response);
    }

    #[test]
    fn request_type_is_rejected_as_response() {
        let request = encode_discovery_request(1);
        assert_eq!(
            decode_discovery_response(&request),
            Err(ProtocolError::UnexpectedMessageType(DISCOVERY_REQUEST))
        );
    }

    #[test]
    fn wrong_length_field_is_rejected() {
        let mut encoded = encode_discovery_response(&DiscoveryResponse {
            ssrc: 1,
            address: "1.2.3.4".to_string(),
            port: 80,
        });
        encoded[3] = 69;
        assert_eq!(
            decode_discovery_response(&encoded),
            Err(ProtocolError::LengthMismatch { expected: 70, got: 69 })
        );
    }

    #[test]
    fn truncated_response_is_rejected() {
        let encoded = encode_discovery_response(&DiscoveryResponse {
            ssrc: 1,
            address: "1.2.3.4".to_string(),
            port: 80,
        });
        assert!(decode_discovery_response(&encoded[..20]).is_err());
    }
}
