pub mod discovery;
pub mod error;
pub mod gateway;
pub mod io;
pub mod rtp;

pub use discovery::{decode_discovery_response, encode_discovery_request, DiscoveryResponse};
pub use error::ProtocolError;
pub use gateway::GatewayMessage;
pub use rtp::{RtpHeader, RtpPacket, RTP_HEADER_LEN};
