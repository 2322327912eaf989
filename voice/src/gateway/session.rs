//! The websocket session loop behind [`super::VoiceGateway`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use concord_protocol::gateway::{
    opcode, ClientDisconnect, GatewayMessage, Hello, Identify, Ready, Resume, SelectProtocol,
    SelectProtocolData, SessionDescription, Speaking,
};

use super::{
    CloseBehavior, GatewayCommand, GatewayState, VoiceConnectionData, VoiceEvent,
    VoiceGatewayConfiguration, VoiceGatewayHandle,
};
use crate::config::RetryPolicy;
use crate::error::VoiceError;

enum SessionOutcome {
    /// Stopped on command; do not reconnect.
    Stopped,
    Closed {
        behavior: CloseBehavior,
        code: Option<u16>,
        reason: String,
    },
}

struct SessionResult {
    outcome: SessionOutcome,
    /// Whether this session reached Ready/Resumed; resets the retry budget.
    established: bool,
}

/// Session loop with reconnect: runs websocket sessions until stopped,
/// cancelled, fatally closed, or out of retries.
pub(super) async fn run(
    data: VoiceConnectionData,
    config: VoiceGatewayConfiguration,
    handle: VoiceGatewayHandle,
    mut commands: mpsc::UnboundedReceiver<GatewayCommand>,
    state: watch::Sender<GatewayState>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) {
    let mut resume = false;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let _ = state.send(GatewayState::Connecting);

        let closed = match run_session(&data, &config, &handle, &mut commands, &state, resume, &cancel).await
        {
            Ok(SessionResult { outcome: SessionOutcome::Stopped, .. }) => break,
            Ok(SessionResult {
                outcome: SessionOutcome::Closed { behavior, code, reason },
                established,
            }) => {
                if established {
                    attempt = 0;
                }
                handle.emit(VoiceEvent::Closed { behavior, code, reason: reason.clone() });
                match behavior {
                    CloseBehavior::Fatal => {
                        warn!("voice gateway closed for good: {:?} ({})", code, reason);
                        break;
                    }
                    CloseBehavior::Resume => resume = true,
                    CloseBehavior::Moved | CloseBehavior::Reidentify => resume = false,
                }
                format!("{:?} ({})", code, reason)
            }
            Err(e) => {
                resume = false;
                e.to_string()
            }
        };

        attempt += 1;
        if attempt > retry.max_attempts() {
            warn!("voice gateway reconnect attempts exhausted: {}", closed);
            handle.emit(VoiceEvent::Closed {
                behavior: CloseBehavior::Fatal,
                code: None,
                reason: "reconnect attempts exhausted".to_string(),
            });
            break;
        }

        let _ = state.send(GatewayState::Resuming);
        let backoff = retry.backoff(attempt - 1);
        debug!("voice gateway reconnecting in {:?} after: {}", backoff, closed);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    let _ = state.send(GatewayState::Disconnected);
    debug!("voice gateway stopped");
}

fn text_frame<T: Serialize>(op: u8, payload: &T) -> Result<Message, VoiceError> {
    let message = GatewayMessage::new(op, payload)?;
    Ok(Message::Text(serde_json::to_string(&message)?.into()))
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn spawn_heartbeat(
    interval_ms: u64,
    writer: mpsc::UnboundedSender<Message>,
    last_sent: Arc<AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            let nonce = epoch_millis();
            last_sent.store(nonce, Ordering::Relaxed);
            let Ok(frame) = text_frame(opcode::HEARTBEAT, &nonce) else { break };
            if writer.send(frame).is_err() {
                break;
            }
        }
    })
}

/// Runs one websocket session until it ends one way or another.
async fn run_session(
    data: &VoiceConnectionData,
    config: &VoiceGatewayConfiguration,
    handle: &VoiceGatewayHandle,
    commands: &mut mpsc::UnboundedReceiver<GatewayCommand>,
    state: &watch::Sender<GatewayState>,
    resume: bool,
    cancel: &CancellationToken,
) -> Result<SessionResult, VoiceError> {
    debug!("connecting to voice gateway at {}", config.endpoint);
    let (stream, _) = tokio_tungstenite::connect_async(config.endpoint.as_str()).await?;
    let (mut write, mut read) = stream.split();

    // dedicated write task so the heartbeat and the session loop share one sink
    let (writer, mut writer_rx) = mpsc::unbounded_channel::<Message>();
    let write_task = tokio::spawn(async move {
        while let Some(message) = writer_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    let _ = state.send(GatewayState::Identifying);
    if resume {
        trace!("resuming voice gateway session {}", data.session_id);
        let payload = Resume {
            server_id: data.guild_id.to_string(),
            session_id: data.session_id.clone(),
            token: config.token.clone(),
        };
        let _ = writer.send(text_frame(opcode::RESUME, &payload)?);
    } else {
        let payload = Identify {
            server_id: data.guild_id.to_string(),
            user_id: data.self_id.to_string(),
            session_id: data.session_id.clone(),
            token: config.token.clone(),
        };
        let _ = writer.send(text_frame(opcode::IDENTIFY, &payload)?);
    }

    let last_heartbeat = Arc::new(AtomicU64::new(0));
    let mut heartbeat: Option<JoinHandle<()>> = None;
    let mut established = false;

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = state.send(GatewayState::Closing);
                let _ = writer.send(Message::Close(None));
                break SessionResult { outcome: SessionOutcome::Stopped, established };
            }

            command = commands.recv() => match command {
                Some(GatewayCommand::Stop) | None => {
                    let _ = state.send(GatewayState::Closing);
                    let _ = writer.send(Message::Close(None));
                    break SessionResult { outcome: SessionOutcome::Stopped, established };
                }
                Some(GatewayCommand::SelectProtocol { address, port, mode }) => {
                    let payload = SelectProtocol {
                        protocol: "udp".to_string(),
                        data: SelectProtocolData { address, port, mode: mode.as_str().to_string() },
                    };
                    let _ = writer.send(text_frame(opcode::SELECT_PROTOCOL, &payload)?);
                }
                Some(GatewayCommand::Speaking { ssrc, flags }) => {
                    let payload = Speaking { speaking: flags, delay: 0, ssrc, user_id: None };
                    let _ = writer.send(text_frame(opcode::SPEAKING, &payload)?);
                }
            },

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let message: GatewayMessage = match serde_json::from_str(text.as_str()) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("unparseable voice gateway frame: {}", e);
                            continue;
                        }
                    };
                    handle_frame(
                        &message,
                        handle,
                        state,
                        &writer,
                        &mut heartbeat,
                        &last_heartbeat,
                        &mut established,
                    );
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    break SessionResult {
                        outcome: SessionOutcome::Closed {
                            behavior: CloseBehavior::classify(code),
                            code,
                            reason,
                        },
                        established,
                    };
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(e)) => {
                    warn!("voice gateway read error: {}", e);
                    break SessionResult {
                        outcome: SessionOutcome::Closed {
                            behavior: CloseBehavior::Resume,
                            code: None,
                            reason: e.to_string(),
                        },
                        established,
                    };
                }
                None => {
                    break SessionResult {
                        outcome: SessionOutcome::Closed {
                            behavior: CloseBehavior::Resume,
                            code: None,
                            reason: "stream ended".to_string(),
                        },
                        established,
                    };
                }
            },
        }
    };

    if let Some(task) = heartbeat.take() {
        task.abort();
    }
    drop(writer);
    let _ = write_task.await;

    Ok(result)
}

fn handle_frame(
    message: &GatewayMessage,
    handle: &VoiceGatewayHandle,
    state: &watch::Sender<GatewayState>,
    writer: &mpsc::UnboundedSender<Message>,
    heartbeat: &mut Option<JoinHandle<()>>,
    last_heartbeat: &Arc<AtomicU64>,
    established: &mut bool,
) {
    match message.op {
        opcode::HELLO => match message.payload::<Hello>() {
            Ok(hello) => {
                let interval = hello.heartbeat_interval as u64;
                trace!("voice gateway hello, heartbeat every {}ms", interval);
                if let Some(task) = heartbeat.take() {
                    task.abort();
                }
                *heartbeat = Some(spawn_heartbeat(
                    interval,
                    writer.clone(),
                    Arc::clone(last_heartbeat),
                ));
            }
            Err(e) => warn!("bad hello payload: {}", e),
        },
        opcode::READY => match message.payload::<Ready>() {
            Ok(ready) => {
                *established = true;
                let _ = state.send(GatewayState::Ready);
                info!("voice gateway ready (ssrc {})", ready.ssrc);
                handle.emit(VoiceEvent::Ready {
                    ssrc: ready.ssrc,
                    ip: ready.ip,
                    port: ready.port,
                    modes: ready.modes,
                });
            }
            Err(e) => warn!("bad ready payload: {}", e),
        },
        opcode::SESSION_DESCRIPTION => match message.payload::<SessionDescription>() {
            Ok(description) => {
                let _ = state.send(GatewayState::Active);
                handle.emit(VoiceEvent::SessionDescription {
                    mode: description.mode,
                    secret_key: description.secret_key,
                });
            }
            Err(e) => warn!("bad session description payload: {}", e),
        },
        opcode::SPEAKING => match message.payload::<Speaking>() {
            Ok(speaking) => {
                let user_id = speaking
                    .user_id
                    .as_deref()
                    .and_then(|id| id.parse::<u64>().ok());
                if let Some(user_id) = user_id {
                    handle.emit(VoiceEvent::Speaking {
                        user_id,
                        ssrc: speaking.ssrc,
                        flags: speaking.speaking,
                    });
                }
            }
            Err(e) => warn!("bad speaking payload: {}", e),
        },
        opcode::HEARTBEAT_ACK => {
            let sent = last_heartbeat.load(Ordering::Relaxed);
            if sent > 0 {
                trace!("heartbeat ack, latency {}ms", epoch_millis().saturating_sub(sent));
            }
        }
        opcode::RESUMED => {
            *established = true;
            let _ = state.send(GatewayState::Active);
            info!("voice gateway session resumed");
        }
        opcode::CLIENT_DISCONNECT => match message.payload::<ClientDisconnect>() {
            Ok(disconnect) => {
                if let Ok(user_id) = disconnect.user_id.parse::<u64>() {
                    handle.emit(VoiceEvent::ClientDisconnect { user_id });
                }
            }
            Err(e) => warn!("bad client disconnect payload: {}", e),
        },
        other => trace!("ignoring voice gateway op {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::VoiceGateway;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::linear(Duration::from_millis(10), Duration::from_millis(20), 1)
    }

    /// Minimal media-server double: accepts one websocket, sends Hello and
    /// (after the Identify arrives) Ready, then idles.
    async fn spawn_server(identify_tx: oneshot::Sender<GatewayMessage>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            ws.send(Message::Text(
                r#"{"op":8,"d":{"heartbeat_interval":60000.0}}"#.into(),
            ))
            .await
            .unwrap();

            let identify = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        break serde_json::from_str::<GatewayMessage>(text.as_str()).unwrap();
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("expected identify, got {:?}", other),
                }
            };
            let _ = identify_tx.send(identify);

            ws.send(Message::Text(
                r#"{"op":2,"d":{"ssrc":99,"ip":"203.0.113.5","port":4000,
                    "modes":["aead_aes256_gcm","xsalsa20_poly1305_lite"]}}"#
                    .into(),
            ))
            .await
            .unwrap();

            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn session_identifies_then_emits_ready_and_stops_cleanly() {
        let (identify_tx, identify_rx) = oneshot::channel();
        let addr = spawn_server(identify_tx).await;

        let data = VoiceConnectionData {
            self_id: 10,
            guild_id: 20,
            session_id: "session".to_string(),
        };
        let config = VoiceGatewayConfiguration {
            token: "token".to_string(),
            endpoint: format!("ws://{}", addr),
        };

        let gateway = VoiceGateway::new(data, config, quick_retry());
        let mut events = gateway.handle().events();
        let cancel = CancellationToken::new();
        let task = gateway.spawn(cancel.clone()).unwrap();
        assert!(gateway.spawn(cancel.clone()).is_none(), "spawn is one-shot");

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, VoiceEvent::Ready { ssrc: 99, .. }));
        assert_eq!(gateway.state(), GatewayState::Ready);

        let identify = identify_rx.await.unwrap();
        assert_eq!(identify.op, opcode::IDENTIFY);
        let payload: Identify = identify.payload().unwrap();
        assert_eq!(payload.server_id, "20");
        assert_eq!(payload.user_id, "10");
        assert_eq!(payload.session_id, "session");
        assert_eq!(payload.token, "token");

        gateway.handle().send(GatewayCommand::Stop).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gateway.state(), GatewayState::Disconnected);
    }
}
