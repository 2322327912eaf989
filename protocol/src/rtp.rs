use crate::error::ProtocolError;
use crate::io::{Cursor, Reader};

/// Size of the fixed RTP header in bytes.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP version 2, no padding, no extension, no CSRCs.
pub const RTP_VERSION_FLAGS: u8 = 0x80;

/// Payload type used for Opus audio.
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;

/// The mutable fields of an outbound RTP header.
///
/// Version/flags and payload type are fixed constants; sequence, timestamp
/// and ssrc vary per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Writes exactly [`RTP_HEADER_LEN`] bytes in network byte order.
    pub fn write(&self, w: &mut Cursor<'_>) -> Result<(), ProtocolError> {
        w.write_u8(RTP_VERSION_FLAGS)?;
        w.write_u8(RTP_PAYLOAD_TYPE)?;
        w.write_u16(self.sequence)?;
        w.write_u32(self.timestamp)?;
        w.write_u32(self.ssrc)?;
        Ok(())
    }

    /// Serializes into a stack buffer, for use as authenticated data.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut buf = [0u8; RTP_HEADER_LEN];
        let mut w = Cursor::new(&mut buf);
        // writing 12 bytes into a 12-byte buffer cannot fail
        let _ = self.write(&mut w);
        buf
    }
}

/// A parsed RTP packet borrowing the datagram it was parsed from.
///
/// The payload is a zero-copy view of `buffer[12..]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub version_flags: u8,
    pub payload_type: u8,
    pub header: RtpHeader,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buffer);
        let version_flags = r.read_u8()?;
        let payload_type = r.read_u8()?;
        let header = RtpHeader {
            sequence: r.read_u16()?,
            timestamp: r.read_u32()?,
            ssrc: r.read_u32()?,
        };

        Ok(Self {
            version_flags,
            payload_type,
            header,
            payload: r.remaining(),
        })
    }
}
