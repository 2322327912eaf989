//! The voice connection aggregate and its lifecycle event task.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};

use async_channel::Receiver;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::VoiceConnectionConfig;
use crate::crypto::KEY_LEN;
use crate::frame::{
    spawn_frame_pacer, AudioFrame, AudioFrameProvider, FrameInterceptor, InterceptorContext,
};
use crate::gateway::{
    CloseBehavior, GatewayCommand, GatewayState, VoiceConnectionData, VoiceEvent, VoiceGateway,
    VoiceGatewayConfiguration, VoiceGatewayHandle,
};
use crate::parent::{ParentGatewayHandle, UpdateVoiceState};
use crate::streams::VoiceStreams;
use crate::udp::{discover_external_address, spawn_frame_sender, FrameSenderConfig, VoiceUdpSocket};

/// An established voice connection: one signaling gateway, one UDP socket,
/// one outbound pipeline and one inbound pipeline (or its no-op stand-in),
/// all hanging off one cancellation scope.
pub struct VoiceConnection {
    data: VoiceConnectionData,
    config: Arc<VoiceConnectionConfig>,
    parent: ParentGatewayHandle,
    gateway: VoiceGateway,
    streams: VoiceStreams,
    provider: StdMutex<Option<Box<dyn AudioFrameProvider>>>,
    interceptor: Arc<Mutex<Box<dyn FrameInterceptor>>>,
    cancel: CancellationToken,
}

impl VoiceConnection {
    pub(crate) fn new(
        data: VoiceConnectionData,
        config: Arc<VoiceConnectionConfig>,
        parent: ParentGatewayHandle,
        gateway_config: VoiceGatewayConfiguration,
        provider: Box<dyn AudioFrameProvider>,
        interceptor: Box<dyn FrameInterceptor>,
    ) -> Self {
        let gateway = VoiceGateway::new(
            data.clone(),
            gateway_config,
            config.reconnect_retry.clone(),
        );
        let streams = VoiceStreams::new(config.receive_voice);

        Self {
            data,
            config,
            parent,
            gateway,
            streams,
            provider: StdMutex::new(Some(provider)),
            interceptor: Arc::new(Mutex::new(interceptor)),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn data(&self) -> &VoiceConnectionData {
        &self.data
    }

    /// The inbound frame streams. Empty (but valid) when receive is
    /// disabled.
    #[must_use]
    pub fn streams(&self) -> &VoiceStreams {
        &self.streams
    }

    #[must_use]
    pub fn gateway_state(&self) -> GatewayState {
        self.gateway.state()
    }

    /// Opens the signaling gateway and starts the lifecycle event task.
    /// Calling it again is a no-op.
    pub fn connect(&self) {
        let provider = self
            .provider
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(provider) = provider else {
            debug!("voice connection already started");
            return;
        };

        let frames = spawn_frame_pacer(
            provider,
            self.config.frame_interval,
            self.cancel.child_token(),
        );

        spawn_lifecycle(LifecycleContext {
            config: Arc::clone(&self.config),
            streams: self.streams.clone(),
            gateway: self.gateway.handle().clone(),
            events: self.gateway.handle().events(),
            frames,
            interceptor: Arc::clone(&self.interceptor),
            cancel: self.cancel.clone(),
        });
        self.gateway.spawn(self.cancel.child_token());

        info!("voice connection starting (guild {})", self.data.guild_id);
    }

    /// Leaves the voice channel and cancels every task of this connection.
    /// Idempotent.
    pub fn disconnect(&self) {
        debug!("disconnecting voice connection (guild {})", self.data.guild_id);
        let _ = self.parent.update_voice_state(UpdateVoiceState {
            guild_id: self.data.guild_id,
            channel_id: None,
            self_mute: self.config.self_mute,
            self_deaf: self.config.self_deaf,
        });
        let _ = self.gateway.handle().send(GatewayCommand::Stop);
        self.cancel.cancel();
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One generation of sender + streams tasks, replaced wholesale on every
/// session description.
struct Pipelines {
    cancel: CancellationToken,
    sender: Option<JoinHandle<()>>,
    streams: Option<JoinHandle<()>>,
}

impl Pipelines {
    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.sender.take() {
            task.abort();
        }
        if let Some(task) = self.streams.take() {
            task.abort();
        }
    }
}

pub(crate) struct LifecycleContext {
    pub config: Arc<VoiceConnectionConfig>,
    pub streams: VoiceStreams,
    pub gateway: VoiceGatewayHandle,
    pub events: broadcast::Receiver<VoiceEvent>,
    pub frames: Receiver<Option<AudioFrame>>,
    pub interceptor: Arc<Mutex<Box<dyn FrameInterceptor>>>,
    pub cancel: CancellationToken,
}

/// Reacts to gateway events: Ready drives transport setup, SessionDescription
/// (re)starts the pipelines, Speaking grows the ssrc map, Close stops the
/// pipelines and either waits out the detach grace period or tears down.
///
/// All mutable connection state lives in this task; other tasks see it only
/// through channels.
pub(crate) fn spawn_lifecycle(mut ctx: LifecycleContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ssrc: Option<u32> = None;
        let mut server: Option<SocketAddr> = None;
        let mut socket: Option<VoiceUdpSocket> = None;
        let mut pipelines: Option<Pipelines> = None;
        let mut detach_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,

                () = async {
                    match detach_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    warn!("voice session did not recover within the detach grace period");
                    break;
                }

                event = ctx.events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("lifecycle lagged {} gateway events behind", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };

                    match event {
                        VoiceEvent::Ready { ssrc: new_ssrc, ip, port, modes } => {
                            detach_deadline = None;

                            let mode = ctx.config.encryption.mode();
                            if !modes.iter().any(|m| m.as_str() == mode.as_str()) {
                                warn!("server did not advertise encryption mode {}", mode);
                            }

                            let ip_addr: IpAddr = match ip.parse() {
                                Ok(addr) => addr,
                                Err(_) => {
                                    error!("unusable media server address {}:{}", ip, port);
                                    break;
                                }
                            };
                            let server_addr = SocketAddr::new(ip_addr, port);

                            if let Some(old) = socket.take() {
                                old.stop();
                            }
                            let new_socket = match ctx.config.socket_factory.connect().await {
                                Ok(socket) => socket,
                                Err(e) => {
                                    error!("failed to open voice socket: {}", e);
                                    break;
                                }
                            };
                            socket = Some(new_socket.clone());
                            server = Some(server_addr);
                            ssrc = Some(new_ssrc);

                            let external = match discover_external_address(
                                &new_socket,
                                server_addr,
                                new_ssrc,
                                &ctx.config.ip_discovery_retry,
                                ctx.config.ip_discovery_timeout,
                            )
                            .await
                            {
                                Ok(address) => address,
                                Err(e) => {
                                    error!("ip discovery failed: {}", e);
                                    break;
                                }
                            };

                            if ctx.gateway.send(GatewayCommand::SelectProtocol {
                                address: external.ip().to_string(),
                                port: external.port(),
                                mode,
                            })
                            .is_err()
                            {
                                break;
                            }
                        }

                        VoiceEvent::SessionDescription { mode, secret_key } => {
                            detach_deadline = None;

                            let (Some(ssrc), Some(server), Some(socket)) =
                                (ssrc, server, socket.as_ref())
                            else {
                                warn!("session description before transport setup; ignoring");
                                continue;
                            };

                            let key: [u8; KEY_LEN] = match secret_key.as_slice().try_into() {
                                Ok(key) => key,
                                Err(_) => {
                                    error!("invalid session key length {}", secret_key.len());
                                    continue;
                                }
                            };
                            if mode != ctx.config.encryption.mode().as_str() {
                                warn!(
                                    "negotiated mode {} differs from configured {}",
                                    mode,
                                    ctx.config.encryption.mode()
                                );
                            }

                            // at most one active generation of each pipeline
                            if let Some(mut old) = pipelines.take() {
                                old.stop();
                            }
                            let pipeline_cancel = ctx.cancel.child_token();

                            let opener = ctx.config.encryption.create_opener(&key);
                            let streams_task = ctx.streams.spawn_listener(
                                socket.clone(),
                                server,
                                opener,
                                pipeline_cancel.child_token(),
                            );

                            let sealer = ctx.config.encryption.create_sealer(&key);
                            let sender_task = spawn_frame_sender(FrameSenderConfig {
                                server,
                                socket: socket.clone(),
                                ssrc,
                                sealer,
                                frames: ctx.frames.clone(),
                                interceptor: Arc::clone(&ctx.interceptor),
                                context: InterceptorContext::new(ssrc, ctx.gateway.clone()),
                                cancel: pipeline_cancel.child_token(),
                            });

                            pipelines = Some(Pipelines {
                                cancel: pipeline_cancel,
                                sender: Some(sender_task),
                                streams: streams_task,
                            });
                            info!("voice pipelines started (mode {})", mode);
                        }

                        VoiceEvent::Speaking { user_id, ssrc, .. } => {
                            ctx.streams.register_user(ssrc, user_id);
                        }

                        VoiceEvent::ClientDisconnect { user_id } => {
                            // the ssrc map never shrinks during a connection
                            trace!("user {} disconnected from voice", user_id);
                        }

                        VoiceEvent::Closed { behavior, code, reason } => {
                            if let Some(mut old) = pipelines.take() {
                                old.stop();
                            }
                            match behavior {
                                CloseBehavior::Moved => {
                                    debug!(
                                        "voice session moved ({:?}); holding for {:?}",
                                        code, ctx.config.detach_timeout
                                    );
                                    detach_deadline =
                                        Some(Instant::now() + ctx.config.detach_timeout);
                                }
                                CloseBehavior::Resume | CloseBehavior::Reidentify => {
                                    debug!(
                                        "voice gateway reconnecting after close {:?} ({})",
                                        code, reason
                                    );
                                }
                                CloseBehavior::Fatal => {
                                    warn!("voice gateway closed: {:?} ({})", code, reason);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(mut pipelines) = pipelines.take() {
            pipelines.stop();
        }
        if let Some(socket) = socket.take() {
            socket.stop();
        }
        ctx.cancel.cancel();
        debug!("voice connection lifecycle stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;

    use concord_protocol::discovery::{
        encode_discovery_response, DiscoveryResponse, DISCOVERY_PACKET_SIZE,
    };
    use concord_protocol::rtp::RtpPacket;

    use crate::config::RetryPolicy;
    use crate::crypto::VoiceEncryption;
    use crate::frame::{frame_channel, DefaultFrameInterceptor};

    /// Media-server double: answers IP discovery for the expected ssrc and
    /// forwards every other datagram to the test.
    async fn spawn_media_server(ssrc: u32) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let datagram = &buf[..n];
                if n == DISCOVERY_PACKET_SIZE && datagram[..2] == [0x00, 0x01] {
                    let echoed = u32::from_be_bytes(datagram[4..8].try_into().unwrap());
                    if echoed == ssrc {
                        let response = encode_discovery_response(&DiscoveryResponse {
                            ssrc,
                            address: "127.0.0.1".to_string(),
                            port: peer.port(),
                        });
                        let _ = socket.send_to(&response, peer).await;
                    }
                } else if tx.send(datagram.to_vec()).is_err() {
                    break;
                }
            }
        });

        (addr, rx)
    }

    struct Harness {
        gateway: VoiceGatewayHandle,
        commands: mpsc::UnboundedReceiver<GatewayCommand>,
        frame_tx: async_channel::Sender<AudioFrame>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    fn start_lifecycle(config: VoiceConnectionConfig) -> Harness {
        let (gateway, commands) = VoiceGatewayHandle::pair();
        let config = Arc::new(config);
        let streams = VoiceStreams::new(config.receive_voice);
        let (frame_tx, provider) = frame_channel(16);
        let cancel = CancellationToken::new();

        let frames = spawn_frame_pacer(
            Box::new(provider),
            config.frame_interval,
            cancel.child_token(),
        );
        let interceptor: Arc<Mutex<Box<dyn FrameInterceptor>>> =
            Arc::new(Mutex::new(Box::new(DefaultFrameInterceptor::default())));

        let task = spawn_lifecycle(LifecycleContext {
            config,
            streams,
            gateway: gateway.clone(),
            events: gateway.events(),
            frames,
            interceptor,
            cancel: cancel.clone(),
        });

        Harness { gateway, commands, frame_tx, cancel, task }
    }

    fn quick_config() -> VoiceConnectionConfig {
        VoiceConnectionConfig {
            frame_interval: Duration::from_millis(5),
            ip_discovery_retry: RetryPolicy::linear(
                Duration::from_millis(10),
                Duration::from_millis(20),
                3,
            ),
            ip_discovery_timeout: Duration::from_millis(500),
            encryption: VoiceEncryption::AeadAes256Gcm,
            ..VoiceConnectionConfig::default()
        }
    }

    fn ready_event(ssrc: u32, server: SocketAddr) -> VoiceEvent {
        VoiceEvent::Ready {
            ssrc,
            ip: server.ip().to_string(),
            port: server.port(),
            modes: vec![
                "aead_aes256_gcm".to_string(),
                "xsalsa20_poly1305_lite".to_string(),
            ],
        }
    }

    async fn expect_select_protocol(harness: &mut Harness) -> (String, u16) {
        loop {
            let command = tokio::time::timeout(Duration::from_secs(5), harness.commands.recv())
                .await
                .expect("timed out waiting for a gateway command")
                .expect("command channel closed");
            match command {
                GatewayCommand::SelectProtocol { address, port, mode } => {
                    assert_eq!(mode, crate::crypto::EncryptionMode::AeadAes256Gcm);
                    return (address, port);
                }
                GatewayCommand::Speaking { .. } => continue,
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn ready_drives_discovery_select_protocol_and_first_packet() {
        let (server, mut media_rx) = spawn_media_server(12345).await;
        let mut harness = start_lifecycle(quick_config());

        harness.gateway.emit(ready_event(12345, server));
        let (address, port) = expect_select_protocol(&mut harness).await;
        assert_eq!(address, "127.0.0.1");
        assert!(port > 0);

        harness.gateway.emit(VoiceEvent::SessionDescription {
            mode: "aead_aes256_gcm".to_string(),
            secret_key: vec![1u8; KEY_LEN],
        });

        harness
            .frame_tx
            .send(AudioFrame::new(vec![0x78, 1, 2, 3]))
            .await
            .unwrap();

        let datagram = tokio::time::timeout(Duration::from_secs(5), media_rx.recv())
            .await
            .expect("timed out waiting for the first audio packet")
            .unwrap();

        let packet = RtpPacket::parse(&datagram).unwrap();
        assert_eq!(packet.header.ssrc, 12345);
        assert_eq!(packet.header.timestamp, 0);

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn moved_close_is_superseded_by_a_new_ready() {
        let (server, _media_rx) = spawn_media_server(777).await;
        let config = VoiceConnectionConfig {
            detach_timeout: Duration::from_secs(5),
            ..quick_config()
        };
        let mut harness = start_lifecycle(config);

        harness.gateway.emit(ready_event(777, server));
        expect_select_protocol(&mut harness).await;

        harness.gateway.emit(VoiceEvent::Closed {
            behavior: CloseBehavior::Moved,
            code: Some(4014),
            reason: String::new(),
        });

        // recovery within the grace period keeps the lifecycle alive
        harness.gateway.emit(ready_event(777, server));
        expect_select_protocol(&mut harness).await;
        assert!(!harness.task.is_finished());

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn moved_close_tears_down_after_the_grace_period() {
        let config = VoiceConnectionConfig {
            detach_timeout: Duration::from_millis(50),
            ..quick_config()
        };
        let harness = start_lifecycle(config);

        harness.gateway.emit(VoiceEvent::Closed {
            behavior: CloseBehavior::Moved,
            code: Some(4014),
            reason: String::new(),
        });

        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("lifecycle should end after the grace period")
            .unwrap();
    }

    #[tokio::test]
    async fn fatal_close_stops_the_lifecycle() {
        let harness = start_lifecycle(quick_config());

        harness.gateway.emit(VoiceEvent::Closed {
            behavior: CloseBehavior::Fatal,
            code: Some(4004),
            reason: "authentication failed".to_string(),
        });

        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("lifecycle should end on a fatal close")
            .unwrap();
    }

    #[tokio::test]
    async fn speaking_events_grow_the_ssrc_map() {
        let (gateway, _commands) = VoiceGatewayHandle::pair();
        let config = Arc::new(quick_config());
        let streams = VoiceStreams::new(true);
        let cancel = CancellationToken::new();
        let (_frame_tx, provider) = frame_channel(1);
        let frames = spawn_frame_pacer(
            Box::new(provider),
            config.frame_interval,
            cancel.child_token(),
        );
        let interceptor: Arc<Mutex<Box<dyn FrameInterceptor>>> =
            Arc::new(Mutex::new(Box::new(DefaultFrameInterceptor::default())));

        let task = spawn_lifecycle(LifecycleContext {
            config,
            streams: streams.clone(),
            gateway: gateway.clone(),
            events: gateway.events(),
            frames,
            interceptor,
            cancel: cancel.clone(),
        });

        gateway.emit(VoiceEvent::Speaking { user_id: 42, ssrc: 5, flags: 1 });

        tokio::time::timeout(Duration::from_secs(5), async {
            while streams.user_for_ssrc(5).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(streams.user_for_ssrc(5), Some(42));

        cancel.cancel();
        let _ = task.await;
    }
}
