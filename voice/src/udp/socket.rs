use std::net::SocketAddr;
use std::sync::Arc;

use async_channel::{bounded, Receiver, Sender, TrySendError};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::VoiceError;

const RECV_BUFFER_SIZE: usize = 2048;
const INBOUND_QUEUE_SIZE: usize = 256;

/// A datagram socket scoped to one voice connection: send, a cloneable
/// inbound stream, and an idempotent stop releasing the receive loop.
#[derive(Debug, Clone)]
pub struct VoiceUdpSocket {
    socket: Arc<UdpSocket>,
    inbound: Receiver<(SocketAddr, Vec<u8>)>,
    stop: CancellationToken,
    leased: bool,
}

impl VoiceUdpSocket {
    /// Binds an ephemeral local port and starts the receive loop.
    pub async fn bind() -> Result<Self, VoiceError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        debug!("voice udp socket bound to {}", socket.local_addr()?);

        let socket = Arc::new(socket);
        let (tx, rx) = bounded(INBOUND_QUEUE_SIZE);
        let stop = CancellationToken::new();
        spawn_recv_loop(Arc::clone(&socket), tx, stop.clone());

        Ok(Self { socket, inbound: rx, stop, leased: false })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, VoiceError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send(&self, target: SocketAddr, data: &[u8]) -> Result<(), VoiceError> {
        self.socket.send_to(data, target).await?;
        Ok(())
    }

    /// A stream of `(peer, datagram)` pairs; callers filter by peer address.
    #[must_use]
    pub fn incoming(&self) -> Receiver<(SocketAddr, Vec<u8>)> {
        self.inbound.clone()
    }

    /// Stops the receive loop. Idempotent. On a leased (pooled) socket this
    /// only drops this connection's use; the owner stops the socket itself.
    pub fn stop(&self) {
        if !self.leased {
            self.stop.cancel();
        }
    }

    fn leased_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.leased = true;
        clone
    }
}

fn spawn_recv_loop(
    socket: Arc<UdpSocket>,
    tx: Sender<(SocketAddr, Vec<u8>)>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((n, peer)) => {
                        match tx.try_send((peer, buf[..n].to_vec())) {
                            Ok(()) => {}
                            // queue full: drop the datagram, consumers are lagging
                            Err(TrySendError::Full(_)) => trace!("inbound datagram queue full"),
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(e) => {
                        warn!("udp receive error: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("udp receive loop stopped");
    });
}

/// How a connection obtains its UDP socket. The default binds a fresh
/// ephemeral socket per connection; `Shared` opts into a pooled socket
/// injected by the application and reference-counted through its `Arc`.
#[derive(Debug, Clone, Default)]
pub enum UdpSocketFactory {
    #[default]
    Ephemeral,
    Shared(Arc<VoiceUdpSocket>),
}

impl UdpSocketFactory {
    pub async fn connect(&self) -> Result<VoiceUdpSocket, VoiceError> {
        match self {
            Self::Ephemeral => VoiceUdpSocket::bind().await,
            Self::Shared(socket) => Ok(socket.leased_clone()),
        }
    }
}
