pub mod builder;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod parent;
pub mod streams;
pub mod udp;

pub use builder::VoiceConnectionBuilder;
pub use config::{RetryPolicy, VoiceConnectionConfig};
pub use connection::VoiceConnection;
pub use crypto::{EncryptionMode, NonceStrategyKind, VoiceEncryption};
pub use error::VoiceError;
pub use frame::{
    frame_channel, AudioFrame, AudioFrameProvider, DefaultFrameInterceptor, FrameInterceptor,
    InterceptorContext,
};
pub use gateway::{
    CloseBehavior, GatewayState, VoiceConnectionData, VoiceEvent, VoiceGatewayConfiguration,
};
pub use parent::{ParentEvent, ParentGatewayHandle, UpdateVoiceState};
pub use streams::{VoicePacket, VoiceStreams};
pub use udp::{UdpSocketFactory, VoiceUdpSocket};
