//! Entry point: configures and performs the connection handshake.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use concord_protocol::gateway::VOICE_GATEWAY_VERSION;

use crate::config::{RetryPolicy, VoiceConnectionConfig};
use crate::connection::VoiceConnection;
use crate::crypto::VoiceEncryption;
use crate::error::VoiceError;
use crate::frame::{AudioFrameProvider, DefaultFrameInterceptor, FrameInterceptor};
use crate::gateway::{VoiceConnectionData, VoiceGatewayConfiguration};
use crate::parent::{ParentEvent, ParentGatewayHandle, UpdateVoiceState};
use crate::udp::UdpSocketFactory;

use async_trait::async_trait;

/// The provider used when the caller supplies none: no audio, ever.
struct EmptyFrameProvider;

#[async_trait]
impl AudioFrameProvider for EmptyFrameProvider {
    async fn provide(&mut self) -> Option<crate::frame::AudioFrame> {
        None
    }
}

/// Builds a [`VoiceConnection`] against a channel of a guild.
///
/// `build()` sends the voice-state update over the parent channel, awaits the
/// correlated acknowledgment and server assignment, and hands back the
/// assembled (not yet connected) connection.
pub struct VoiceConnectionBuilder {
    parent: ParentGatewayHandle,
    self_id: u64,
    guild_id: u64,
    channel_id: u64,
    config: VoiceConnectionConfig,
    frame_provider: Option<Box<dyn AudioFrameProvider>>,
    frame_interceptor: Option<Box<dyn FrameInterceptor>>,
}

impl VoiceConnectionBuilder {
    #[must_use]
    pub fn new(parent: ParentGatewayHandle, self_id: u64, guild_id: u64, channel_id: u64) -> Self {
        Self {
            parent,
            self_id,
            guild_id,
            channel_id,
            config: VoiceConnectionConfig::default(),
            frame_provider: None,
            frame_interceptor: None,
        }
    }

    /// Bound on waiting for the handshake events. Defaults to 5 seconds.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    #[must_use]
    pub fn self_mute(mut self, self_mute: bool) -> Self {
        self.config.self_mute = self_mute;
        self
    }

    #[must_use]
    pub fn self_deaf(mut self, self_deaf: bool) -> Self {
        self.config.self_deaf = self_deaf;
        self
    }

    /// Enables the inbound pipeline. Disabled by default; when disabled the
    /// connection exposes empty streams.
    #[must_use]
    pub fn receive_voice(mut self, receive_voice: bool) -> Self {
        self.config.receive_voice = receive_voice;
        self
    }

    #[must_use]
    pub fn encryption(mut self, encryption: VoiceEncryption) -> Self {
        self.config.encryption = encryption;
        self
    }

    /// Grace period before a "moved" close is treated as a real close.
    /// Defaults to 100 milliseconds.
    #[must_use]
    pub fn detach_timeout(mut self, detach_timeout: Duration) -> Self {
        self.config.detach_timeout = detach_timeout;
        self
    }

    /// Cadence of the frame provider. Defaults to 20 milliseconds.
    #[must_use]
    pub fn frame_interval(mut self, frame_interval: Duration) -> Self {
        self.config.frame_interval = frame_interval;
        self
    }

    #[must_use]
    pub fn ip_discovery_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.ip_discovery_retry = retry;
        self
    }

    #[must_use]
    pub fn ip_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.ip_discovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn reconnect_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.reconnect_retry = retry;
        self
    }

    #[must_use]
    pub fn socket_factory(mut self, factory: UdpSocketFactory) -> Self {
        self.config.socket_factory = factory;
        self
    }

    #[must_use]
    pub fn frame_provider(mut self, provider: impl AudioFrameProvider) -> Self {
        self.frame_provider = Some(Box::new(provider));
        self
    }

    #[must_use]
    pub fn frame_interceptor(mut self, interceptor: impl FrameInterceptor) -> Self {
        self.frame_interceptor = Some(Box::new(interceptor));
        self
    }

    /// Performs the parent handshake and assembles the connection.
    ///
    /// # Errors
    /// [`VoiceError::HandshakeTimeout`] when the correlated voice-state
    /// update and server assignment do not both arrive within the timeout.
    /// Nothing is left allocated on failure.
    pub async fn build(self) -> Result<VoiceConnection, VoiceError> {
        self.config.validate()?;

        // subscribe before sending so the answers cannot be missed
        let events = self.parent.events();
        self.parent.update_voice_state(UpdateVoiceState {
            guild_id: self.guild_id,
            channel_id: Some(self.channel_id),
            self_mute: self.config.self_mute,
            self_deaf: self.config.self_deaf,
        })?;

        let (session_id, token, endpoint) =
            tokio::time::timeout(self.config.timeout, correlate(events, self.guild_id, self.self_id))
                .await
                .map_err(|_| VoiceError::HandshakeTimeout)??;

        debug!("voice handshake complete, endpoint {}", endpoint);

        let data = VoiceConnectionData {
            self_id: self.self_id,
            guild_id: self.guild_id,
            session_id,
        };
        let gateway_config = VoiceGatewayConfiguration {
            token,
            endpoint: format!("wss://{}/?v={}", endpoint, VOICE_GATEWAY_VERSION),
        };

        Ok(VoiceConnection::new(
            data,
            Arc::new(self.config),
            self.parent,
            gateway_config,
            self.frame_provider
                .unwrap_or_else(|| Box::new(EmptyFrameProvider)),
            self.frame_interceptor
                .unwrap_or_else(|| Box::new(DefaultFrameInterceptor::default())),
        ))
    }
}

/// Waits for the voice-state acknowledgment and the server assignment for
/// `guild_id`, in either order.
async fn correlate(
    mut events: broadcast::Receiver<ParentEvent>,
    guild_id: u64,
    self_id: u64,
) -> Result<(String, String, String), VoiceError> {
    let mut session_id: Option<String> = None;
    let mut server: Option<(String, String)> = None;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Err(VoiceError::Disconnected),
        };

        match event {
            ParentEvent::VoiceStateUpdate {
                guild_id: event_guild,
                user_id,
                session_id: event_session,
                ..
            } if event_guild == guild_id && user_id == self_id => {
                session_id = Some(event_session);
            }
            ParentEvent::VoiceServerUpdate {
                guild_id: event_guild,
                token,
                endpoint: Some(endpoint),
            } if event_guild == guild_id => {
                server = Some((token, endpoint));
            }
            _ => {}
        }

        if let (Some(session_id), Some((token, endpoint))) = (&session_id, &server) {
            return Ok((session_id.clone(), token.clone(), endpoint.clone()));
        }
    }
}
