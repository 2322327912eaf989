use concord_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the voice connection SDK.
///
/// Per-packet failures inside the running pipelines are not represented
/// here: a frame that cannot be encrypted is dropped with a log line, and an
/// inbound packet that fails authentication is discarded silently.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// The parent gateway did not deliver a correlated voice-state update and
    /// server assignment within the configured timeout.
    #[error("did not receive a voice state update and server assignment in time")]
    HandshakeTimeout,

    /// Every IP discovery attempt timed out.
    #[error("failed to discover external address after {attempts} attempts")]
    IpDiscoveryFailed { attempts: u32 },

    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] ProtocolError),

    /// An outbound frame could not be sealed.
    #[error("could not encrypt audio frame")]
    EncryptionFailure,

    /// The underlying datagram socket failed.
    #[error("voice transport closed: {0}")]
    TransportClosed(#[from] std::io::Error),

    /// The signaling gateway connection closed and will not be retried.
    #[error("voice gateway closed: code {code:?}: {reason}")]
    GatewayClosed { code: Option<u16>, reason: String },

    /// A channel to a connection task is gone; the connection is shut down.
    #[error("voice connection is disconnected")]
    Disconnected,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid gateway payload: {0}")]
    Payload(#[from] serde_json::Error),
}
