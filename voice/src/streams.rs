//! Inbound audio: demultiplexes encrypted RTP by sender, decrypts, and
//! republishes as frame streams.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use concord_protocol::io::Cursor;
use concord_protocol::rtp::{RtpHeader, RtpPacket};

use crate::crypto::Opener;
use crate::frame::AudioFrame;
use crate::udp::VoiceUdpSocket;

const STREAM_CAPACITY: usize = 64;

/// A decrypted inbound RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

/// The receive side of a connection.
///
/// Publishes three views of the same traffic: raw decrypted packets, frames
/// keyed by ssrc, and frames keyed by user id once a Speaking event has
/// resolved the sender. When receive is disabled the same handles exist but
/// never publish.
#[derive(Debug, Clone)]
pub struct VoiceStreams {
    packets: broadcast::Sender<VoicePacket>,
    frames: broadcast::Sender<(u32, AudioFrame)>,
    user_frames: broadcast::Sender<(u64, AudioFrame)>,
    ssrc_to_user: Arc<DashMap<u32, u64>>,
    enabled: bool,
}

impl VoiceStreams {
    pub(crate) fn new(enabled: bool) -> Self {
        let (packets, _) = broadcast::channel(STREAM_CAPACITY);
        let (frames, _) = broadcast::channel(STREAM_CAPACITY);
        let (user_frames, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            packets,
            frames,
            user_frames,
            ssrc_to_user: Arc::new(DashMap::new()),
            enabled,
        }
    }

    /// All decrypted RTP packets, in arrival order per sender.
    #[must_use]
    pub fn incoming_packets(&self) -> broadcast::Receiver<VoicePacket> {
        self.packets.subscribe()
    }

    /// Decrypted frames keyed by sender ssrc.
    #[must_use]
    pub fn incoming_frames(&self) -> broadcast::Receiver<(u32, AudioFrame)> {
        self.frames.subscribe()
    }

    /// Decrypted frames keyed by user id; a sender appears here once a
    /// Speaking event has mapped its ssrc.
    #[must_use]
    pub fn incoming_user_frames(&self) -> broadcast::Receiver<(u64, AudioFrame)> {
        self.user_frames.subscribe()
    }

    #[must_use]
    pub fn user_for_ssrc(&self, ssrc: u32) -> Option<u64> {
        self.ssrc_to_user.get(&ssrc).map(|entry| *entry.value())
    }

    /// Records an ssrc → user resolution. The map only grows for the life of
    /// the connection.
    pub(crate) fn register_user(&self, ssrc: u32, user_id: u64) {
        self.ssrc_to_user.insert(ssrc, user_id);
    }

    /// Starts the decrypt loop over `socket`, or does nothing when receive is
    /// disabled.
    pub(crate) fn spawn_listener(
        &self,
        socket: VoiceUdpSocket,
        server: SocketAddr,
        opener: Opener,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.enabled {
            return None;
        }

        let streams = self.clone();
        Some(tokio::spawn(async move {
            let incoming = socket.incoming();
            debug!("voice streams listening");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    datagram = incoming.recv() => {
                        let Ok((peer, datagram)) = datagram else { break };
                        if peer != server {
                            continue;
                        }
                        streams.handle_datagram(&datagram, &opener);
                    }
                }
            }

            debug!("voice streams stopped");
        }))
    }

    /// Decrypts one datagram and publishes it. Anything that fails to parse
    /// or authenticate is dropped without disturbing the pipeline.
    fn handle_datagram(&self, datagram: &[u8], opener: &Opener) {
        let packet = match RtpPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("dropping unparseable datagram: {}", e);
                return;
            }
        };

        let Some((nonce, ciphertext_len)) = opener.strip_nonce(packet.payload) else {
            trace!("dropping packet too short for a nonce");
            return;
        };

        let mut plaintext = vec![0u8; ciphertext_len];
        let mut dst = Cursor::new(&mut plaintext);
        let header_bytes = packet.header.to_bytes();
        if !opener.apply(&packet.payload[..ciphertext_len], &mut dst, &header_bytes, &nonce) {
            trace!("dropping packet that failed authentication (ssrc {})", packet.header.ssrc);
            return;
        }
        let written = dst.written();
        plaintext.truncate(written);

        let header = packet.header;
        let _ = self.packets.send(VoicePacket { header, payload: plaintext.clone() });

        let frame = AudioFrame::new(plaintext);
        let _ = self.frames.send((header.ssrc, frame.clone()));

        if let Some(user_id) = self.user_for_ssrc(header.ssrc) {
            let _ = self.user_frames.send((user_id, frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Sealer, VoiceEncryption};

    const KEY: [u8; 32] = [3u8; 32];

    fn sealed_packet(sealer: &mut Sealer, sequence: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let header = RtpHeader { sequence, timestamp: 0, ssrc };
        let header_bytes = header.to_bytes();

        let mut buf = vec![0u8; 256];
        let mut dst = Cursor::new(&mut buf);
        dst.write_bytes(&header_bytes).unwrap();
        let nonce = sealer.generate_nonce();
        assert!(sealer.apply(payload, &mut dst, &header_bytes, &nonce));
        assert!(sealer.append_nonce(&nonce, &mut dst));
        let len = dst.written();
        buf.truncate(len);
        buf
    }

    #[test]
    fn corrupted_packet_does_not_stop_later_packets() {
        let scheme = VoiceEncryption::AeadAes256Gcm;
        let mut sealer = scheme.create_sealer(&KEY);
        let opener = scheme.create_opener(&KEY);

        let streams = VoiceStreams::new(true);
        let mut frames = streams.incoming_frames();

        let first = sealed_packet(&mut sealer, 1, 77, b"one");
        let mut corrupted = sealed_packet(&mut sealer, 2, 77, b"two");
        corrupted[20] ^= 0xFF;
        let third = sealed_packet(&mut sealer, 3, 77, b"three");

        streams.handle_datagram(&first, &opener);
        streams.handle_datagram(&corrupted, &opener);
        streams.handle_datagram(&third, &opener);

        assert_eq!(frames.try_recv().unwrap().1.data(), b"one");
        assert_eq!(frames.try_recv().unwrap().1.data(), b"three");
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn frames_are_keyed_by_ssrc_and_resolved_user() {
        let scheme = VoiceEncryption::XSalsa20Poly1305(Default::default());
        let mut sealer = scheme.create_sealer(&KEY);
        let opener = scheme.create_opener(&KEY);

        let streams = VoiceStreams::new(true);
        let mut frames = streams.incoming_frames();
        let mut user_frames = streams.incoming_user_frames();

        let unresolved = sealed_packet(&mut sealer, 1, 42, b"early");
        streams.handle_datagram(&unresolved, &opener);

        streams.register_user(42, 900);
        let resolved = sealed_packet(&mut sealer, 2, 42, b"late");
        streams.handle_datagram(&resolved, &opener);

        assert_eq!(frames.try_recv().unwrap().0, 42);
        assert_eq!(frames.try_recv().unwrap().0, 42);

        // only the post-resolution packet reaches the user stream
        let (user_id, frame) = user_frames.try_recv().unwrap();
        assert_eq!(user_id, 900);
        assert_eq!(frame.data(), b"late");
        assert!(user_frames.try_recv().is_err());
    }

    #[test]
    fn raw_packet_stream_carries_headers() {
        let scheme = VoiceEncryption::AeadAes256Gcm;
        let mut sealer = scheme.create_sealer(&KEY);
        let opener = scheme.create_opener(&KEY);

        let streams = VoiceStreams::new(true);
        let mut packets = streams.incoming_packets();

        let datagram = sealed_packet(&mut sealer, 9, 5, b"payload");
        streams.handle_datagram(&datagram, &opener);

        let packet = packets.try_recv().unwrap();
        assert_eq!(packet.header.sequence, 9);
        assert_eq!(packet.header.ssrc, 5);
        assert_eq!(packet.payload, b"payload");
    }

    #[tokio::test]
    async fn disabled_streams_spawn_nothing() {
        let streams = VoiceStreams::new(false);
        let socket = VoiceUdpSocket::bind().await.unwrap();
        let opener = VoiceEncryption::AeadAes256Gcm.create_opener(&KEY);

        let task = streams.spawn_listener(
            socket.clone(),
            "127.0.0.1:1".parse().unwrap(),
            opener,
            CancellationToken::new(),
        );
        assert!(task.is_none());
        socket.stop();
    }
}
