use std::net::SocketAddr;
use std::sync::Arc;

use async_channel::Receiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use concord_protocol::io::Cursor;
use concord_protocol::rtp::RtpHeader;

use crate::crypto::Sealer;
use crate::error::VoiceError;
use crate::frame::{AudioFrame, FrameInterceptor, InterceptorContext};
use crate::udp::VoiceUdpSocket;

const PACKET_BUFFER_SIZE: usize = 2048;

/// Assembles one encrypted RTP packet at a time into a fixed buffer.
///
/// The sequence counter starts at a random value and wraps at the 16-bit
/// boundary; the timestamp advances by each sent frame's sample count.
/// Counters move in [`advance`](Self::advance), after a successful send, so
/// a dropped frame never burns a sequence number.
pub(crate) struct AudioPacketBuilder {
    buffer: Vec<u8>,
    sealer: Sealer,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl AudioPacketBuilder {
    pub(crate) fn new(ssrc: u32, sealer: Sealer, initial_sequence: u16) -> Self {
        Self {
            buffer: vec![0u8; PACKET_BUFFER_SIZE],
            sealer,
            ssrc,
            sequence: initial_sequence,
            timestamp: 0,
        }
    }

    pub(crate) fn build(&mut self, frame: &AudioFrame) -> Result<&[u8], VoiceError> {
        let header = RtpHeader {
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };
        let header_bytes = header.to_bytes();

        let mut cursor = Cursor::new(&mut self.buffer);
        cursor.write_bytes(&header_bytes)?;

        let nonce = self.sealer.generate_nonce();
        if !self.sealer.apply(frame.data(), &mut cursor, &header_bytes, &nonce) {
            return Err(VoiceError::EncryptionFailure);
        }
        if !self.sealer.append_nonce(&nonce, &mut cursor) {
            return Err(VoiceError::EncryptionFailure);
        }

        let len = cursor.written();
        Ok(&self.buffer[..len])
    }

    pub(crate) fn advance(&mut self, samples: u16) {
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(u32::from(samples));
    }

    #[cfg(test)]
    pub(crate) fn sequence(&self) -> u16 {
        self.sequence
    }

    #[cfg(test)]
    pub(crate) fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

pub(crate) struct FrameSenderConfig {
    pub server: SocketAddr,
    pub socket: VoiceUdpSocket,
    pub ssrc: u32,
    pub sealer: Sealer,
    pub frames: Receiver<Option<AudioFrame>>,
    pub interceptor: Arc<Mutex<Box<dyn FrameInterceptor>>>,
    pub context: InterceptorContext,
    pub cancel: CancellationToken,
}

/// The outbound pipeline: paced frames in, encrypted datagrams out.
///
/// A frame that fails to encrypt is dropped and the pipeline continues; a
/// socket failure or cancellation ends it.
pub(crate) fn spawn_frame_sender(config: FrameSenderConfig) -> JoinHandle<()> {
    let FrameSenderConfig {
        server,
        socket,
        ssrc,
        sealer,
        frames,
        interceptor,
        context,
        cancel,
    } = config;

    tokio::spawn(async move {
        let mut builder = AudioPacketBuilder::new(ssrc, sealer, rand::random());
        debug!("audio sender started (ssrc {})", ssrc);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => {
                    let Ok(frame) = frame else { break };

                    let frame = interceptor.lock().await.intercept(&context, frame);
                    let Some(frame) = frame else { continue };
                    if frame.is_empty() {
                        continue;
                    }

                    let samples = frame.sample_count();
                    match builder.build(&frame) {
                        Ok(packet) => {
                            if let Err(e) = socket.send(server, packet).await {
                                error!("audio sender stopping, transport failed: {}", e);
                                break;
                            }
                            builder.advance(samples);
                        }
                        Err(e) => warn!("dropping audio frame: {}", e),
                    }
                }
            }
        }

        debug!("audio sender stopped (ssrc {})", ssrc);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::VoiceEncryption;
    use concord_protocol::rtp::{RtpPacket, RTP_HEADER_LEN};

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    fn builder_with_sequence(initial: u16) -> AudioPacketBuilder {
        let sealer = VoiceEncryption::AeadAes256Gcm.create_sealer(&test_key());
        AudioPacketBuilder::new(12345, sealer, initial)
    }

    #[test]
    fn first_packet_carries_initial_sequence_and_zero_timestamp() {
        let mut builder = builder_with_sequence(4711);
        let frame = AudioFrame::silence();

        let packet = builder.build(&frame).unwrap().to_vec();
        let parsed = RtpPacket::parse(&packet).unwrap();

        assert_eq!(parsed.header.sequence, 4711);
        assert_eq!(parsed.header.timestamp, 0);
        assert_eq!(parsed.header.ssrc, 12345);
    }

    #[test]
    fn sequence_increments_by_one_per_sent_frame() {
        let mut builder = builder_with_sequence(100);
        let frame = AudioFrame::silence();

        for expected in 100u16..110 {
            let packet = builder.build(&frame).unwrap().to_vec();
            assert_eq!(RtpPacket::parse(&packet).unwrap().header.sequence, expected);
            builder.advance(frame.sample_count());
        }
    }

    #[test]
    fn sequence_wraps_at_the_sixteen_bit_boundary() {
        let mut builder = builder_with_sequence(u16::MAX);
        builder.advance(960);
        assert_eq!(builder.sequence(), 0);
    }

    #[test]
    fn timestamp_advances_by_sample_count() {
        let mut builder = builder_with_sequence(0);
        let frame = AudioFrame::silence(); // 960 samples

        builder.advance(frame.sample_count());
        assert_eq!(builder.timestamp(), 960);
        builder.advance(frame.sample_count());
        assert_eq!(builder.timestamp(), 1920);
    }

    #[test]
    fn failed_build_does_not_burn_a_sequence_number() {
        let mut builder = builder_with_sequence(50);
        // larger than the packet buffer; encryption output cannot fit
        let oversized = AudioFrame::new(vec![0x78; PACKET_BUFFER_SIZE + 1]);

        assert!(matches!(builder.build(&oversized), Err(VoiceError::EncryptionFailure)));
        assert_eq!(builder.sequence(), 50);
    }

    #[test]
    fn built_packet_decrypts_with_the_paired_opener() {
        let scheme = VoiceEncryption::AeadAes256Gcm;
        let mut builder = AudioPacketBuilder::new(1, scheme.create_sealer(&test_key()), 0);
        let opener = scheme.create_opener(&test_key());

        let frame = AudioFrame::new(vec![0x78, 1, 2, 3, 4]);
        let packet = builder.build(&frame).unwrap().to_vec();

        let parsed = RtpPacket::parse(&packet).unwrap();
        let (nonce, ciphertext_len) = opener.strip_nonce(parsed.payload).unwrap();

        let mut out = vec![0u8; packet.len()];
        let mut dst = Cursor::new(&mut out);
        assert!(opener.apply(
            &parsed.payload[..ciphertext_len],
            &mut dst,
            &packet[..RTP_HEADER_LEN],
            &nonce,
        ));
        let written = dst.written();
        assert_eq!(&out[..written], frame.data());
    }
}
