//! The signaling gateway: a persistent JSON-framed control connection to the
//! media server.

mod session;

use std::sync::Mutex;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::crypto::EncryptionMode;
use crate::error::VoiceError;

const EVENT_CAPACITY: usize = 64;

/// Identity of one audio session, produced once per handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceConnectionData {
    pub self_id: u64,
    pub guild_id: u64,
    pub session_id: String,
}

/// Endpoint and token assigned by the server for the signaling gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceGatewayConfiguration {
    pub token: String,
    pub endpoint: String,
}

/// Lifecycle states of the signaling gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Active,
    Resuming,
    Closing,
}

/// What a gateway close means for the connection. Classification is an
/// explicit function of the close code, never a timing heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// The session relocated server-side; hold on for the detach grace
    /// period instead of tearing down.
    Moved,
    /// Transient failure; the session can be resumed in place.
    Resume,
    /// The session is gone but a fresh identify may succeed.
    Reidentify,
    /// Not recoverable on this gateway.
    Fatal,
}

impl CloseBehavior {
    #[must_use]
    pub fn classify(code: Option<u16>) -> Self {
        match code {
            Some(4014) => CloseBehavior::Moved,
            Some(4006 | 4009) => CloseBehavior::Reidentify,
            None | Some(1006 | 4015) => CloseBehavior::Resume,
            Some(_) => CloseBehavior::Fatal,
        }
    }
}

/// Events emitted by the gateway, consumed by the lifecycle handler.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    Ready {
        ssrc: u32,
        ip: String,
        port: u16,
        modes: Vec<String>,
    },
    SessionDescription {
        mode: String,
        secret_key: Vec<u8>,
    },
    Speaking {
        user_id: u64,
        ssrc: u32,
        flags: u32,
    },
    ClientDisconnect {
        user_id: u64,
    },
    Closed {
        behavior: CloseBehavior,
        code: Option<u16>,
        reason: String,
    },
}

/// Commands accepted by the gateway session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommand {
    SelectProtocol {
        address: String,
        port: u16,
        mode: EncryptionMode,
    },
    Speaking {
        ssrc: u32,
        flags: u32,
    },
    Stop,
}

/// Cloneable handle to a running (or injected, in tests) gateway session.
#[derive(Debug, Clone)]
pub struct VoiceGatewayHandle {
    events: broadcast::Sender<VoiceEvent>,
    commands: mpsc::UnboundedSender<GatewayCommand>,
}

impl VoiceGatewayHandle {
    /// Creates a handle together with the command drain consumed by the
    /// session task.
    pub(crate) fn pair() -> (Self, mpsc::UnboundedReceiver<GatewayCommand>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        (Self { events, commands }, commands_rx)
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub fn send(&self, command: GatewayCommand) -> Result<(), VoiceError> {
        self.commands.send(command).map_err(|_| VoiceError::Disconnected)
    }

    pub(crate) fn emit(&self, event: VoiceEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

struct SessionParts {
    commands: mpsc::UnboundedReceiver<GatewayCommand>,
    state: watch::Sender<GatewayState>,
}

/// The signaling gateway connection owned by one [`crate::VoiceConnection`].
pub struct VoiceGateway {
    data: VoiceConnectionData,
    config: VoiceGatewayConfiguration,
    retry: RetryPolicy,
    handle: VoiceGatewayHandle,
    state: watch::Receiver<GatewayState>,
    parts: Mutex<Option<SessionParts>>,
}

impl VoiceGateway {
    pub(crate) fn new(
        data: VoiceConnectionData,
        config: VoiceGatewayConfiguration,
        retry: RetryPolicy,
    ) -> Self {
        let (handle, commands) = VoiceGatewayHandle::pair();
        let (state_tx, state_rx) = watch::channel(GatewayState::Disconnected);
        Self {
            data,
            config,
            retry,
            handle,
            state: state_rx,
            parts: Mutex::new(Some(SessionParts { commands, state: state_tx })),
        }
    }

    #[must_use]
    pub fn handle(&self) -> &VoiceGatewayHandle {
        &self.handle
    }

    #[must_use]
    pub fn state(&self) -> GatewayState {
        *self.state.borrow()
    }

    /// Starts the session task. Returns `None` when already started.
    pub(crate) fn spawn(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let parts = self.parts.lock().ok()?.take()?;
        Some(tokio::spawn(session::run(
            self.data.clone(),
            self.config.clone(),
            self.handle.clone(),
            parts.commands,
            parts.state,
            self.retry.clone(),
            cancel,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_classify_explicitly() {
        assert_eq!(CloseBehavior::classify(Some(4014)), CloseBehavior::Moved);
        assert_eq!(CloseBehavior::classify(Some(4006)), CloseBehavior::Reidentify);
        assert_eq!(CloseBehavior::classify(Some(4009)), CloseBehavior::Reidentify);
        assert_eq!(CloseBehavior::classify(Some(4015)), CloseBehavior::Resume);
        assert_eq!(CloseBehavior::classify(Some(1006)), CloseBehavior::Resume);
        assert_eq!(CloseBehavior::classify(None), CloseBehavior::Resume);
        assert_eq!(CloseBehavior::classify(Some(4004)), CloseBehavior::Fatal);
        assert_eq!(CloseBehavior::classify(Some(1000)), CloseBehavior::Fatal);
    }

    #[tokio::test]
    async fn handle_routes_commands_and_events() {
        let (handle, mut commands) = VoiceGatewayHandle::pair();
        let mut events = handle.events();

        handle
            .send(GatewayCommand::Speaking { ssrc: 1, flags: 1 })
            .unwrap();
        assert_eq!(
            commands.recv().await,
            Some(GatewayCommand::Speaking { ssrc: 1, flags: 1 })
        );

        handle.emit(VoiceEvent::ClientDisconnect { user_id: 5 });
        assert!(matches!(
            events.recv().await,
            Ok(VoiceEvent::ClientDisconnect { user_id: 5 })
        ));
    }
}
