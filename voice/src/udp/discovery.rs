use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_channel::Receiver;
use tracing::{debug, trace};

use concord_protocol::discovery::{decode_discovery_response, encode_discovery_request};
use concord_protocol::ProtocolError;

use crate::config::RetryPolicy;
use crate::error::VoiceError;
use crate::udp::VoiceUdpSocket;

/// Learns this process's externally visible address by echoing our ssrc off
/// the media server. One request per attempt, bounded by `attempt_timeout`;
/// responses carrying a foreign ssrc are ignored and the wait continues.
pub(crate) async fn discover_external_address(
    socket: &VoiceUdpSocket,
    server: SocketAddr,
    ssrc: u32,
    retry: &RetryPolicy,
    attempt_timeout: Duration,
) -> Result<SocketAddr, VoiceError> {
    let incoming = socket.incoming();
    let request = encode_discovery_request(ssrc);

    for attempt in 0..retry.max_attempts() {
        trace!(
            "discovering external address (attempt {}/{})",
            attempt + 1,
            retry.max_attempts()
        );
        socket.send(server, &request).await?;

        match tokio::time::timeout(attempt_timeout, recv_response(&incoming, server, ssrc)).await {
            Ok(Some((address, port))) => {
                let ip: IpAddr = address
                    .parse()
                    .map_err(|_| VoiceError::MalformedPacket(ProtocolError::InvalidAddress))?;
                let external = SocketAddr::new(ip, port);
                debug!("external address discovered: {}", external);
                return Ok(external);
            }
            // inbound stream closed: the socket was stopped underneath us
            Ok(None) => return Err(VoiceError::Disconnected),
            Err(_) => {
                trace!("ip discovery attempt timed out");
                if attempt + 1 < retry.max_attempts() {
                    tokio::time::sleep(retry.backoff(attempt)).await;
                }
            }
        }
    }

    Err(VoiceError::IpDiscoveryFailed { attempts: retry.max_attempts() })
}

async fn recv_response(
    incoming: &Receiver<(SocketAddr, Vec<u8>)>,
    server: SocketAddr,
    ssrc: u32,
) -> Option<(String, u16)> {
    loop {
        let (peer, datagram) = incoming.recv().await.ok()?;
        if peer != server {
            continue;
        }
        match decode_discovery_response(&datagram) {
            Ok(response) if response.ssrc == ssrc => {
                return Some((response.address, response.port));
            }
            Ok(response) => {
                trace!("ignoring discovery response for foreign ssrc {}", response.ssrc);
            }
            Err(e) => {
                trace!("ignoring non-discovery datagram: {}", e);
            }
        }
    }
}
