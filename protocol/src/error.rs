use std::fmt;

/// Wire format encoding/decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    PacketTooShort { expected: usize, got: usize },
    BufferTooSmall { needed: usize, capacity: usize },
    UnexpectedMessageType(u16),
    LengthMismatch { expected: u16, got: u16 },
    InvalidAddress,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PacketTooShort { expected, got } => {
                write!(f, "packet too short: expected at least {} bytes, got {}", expected, got)
            }
            ProtocolError::BufferTooSmall { needed, capacity } => {
                write!(f, "buffer too small: needed {} bytes, capacity {}", needed, capacity)
            }
            ProtocolError::UnexpectedMessageType(ty) => {
                write!(f, "unexpected message type: 0x{:04x}", ty)
            }
            ProtocolError::LengthMismatch { expected, got } => {
                write!(f, "length field mismatch: expected {}, got {}", expected, got)
            }
            ProtocolError::InvalidAddress => {
                write!(f, "address field is not valid ASCII")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
