//! Opus audio frames and the hooks that feed them into a connection.

use std::time::Duration;

use async_channel::{bounded, Receiver, Sender};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::gateway::{GatewayCommand, VoiceGatewayHandle};
use concord_protocol::gateway::speaking;

/// Sample rate of the encoded audio carried by a connection.
pub const SAMPLE_RATE: u32 = 48_000;

/// The canonical encoded silence frame.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Number of silence frames transmitted after the provider runs dry, before
/// the speaking flag is cleared.
pub const SILENCE_FRAME_COUNT: u8 = 5;

/// A frame of opaque encoded audio. The sample count is derived from the
/// frame's own header bits, never supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Vec<u8>,
}

impl AudioFrame {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn silence() -> Self {
        Self::new(SILENCE_FRAME.to_vec())
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of PCM samples this frame decodes to, parsed from the Opus
    /// table-of-contents byte. Malformed frames count as zero samples.
    #[must_use]
    pub fn sample_count(&self) -> u16 {
        packet_sample_count(SAMPLE_RATE, &self.data) as u16
    }
}

fn packet_sample_count(sample_rate: u32, packet: &[u8]) -> u32 {
    if packet.is_empty() {
        return 0;
    }
    let Some(frames) = packet_frame_count(packet) else {
        return 0;
    };
    let samples = frames * samples_per_frame(sample_rate, packet[0]);
    // anything beyond 120ms of audio in one packet is invalid
    if samples * 25 > sample_rate * 3 {
        0
    } else {
        samples
    }
}

fn packet_frame_count(packet: &[u8]) -> Option<u32> {
    match packet[0] & 0x03 {
        0 => Some(1),
        3 => packet.get(1).map(|&b| u32::from(b & 0x3F)),
        _ => Some(2),
    }
}

fn samples_per_frame(sample_rate: u32, toc: u8) -> u32 {
    let shift = u32::from(toc >> 3) & 0x03;
    if toc & 0x80 != 0 {
        (sample_rate << shift) / 400
    } else if toc & 0x60 == 0x60 {
        if toc & 0x08 != 0 {
            sample_rate / 50
        } else {
            sample_rate / 100
        }
    } else if shift == 3 {
        sample_rate * 60 / 1000
    } else {
        (sample_rate << shift) / 100
    }
}

/// Source of outbound audio. `provide` is polled once per frame interval by
/// the pacing task; returning `None` means there is nothing to play right
/// now (the interceptor turns that into silence handling).
#[async_trait]
pub trait AudioFrameProvider: Send + 'static {
    async fn provide(&mut self) -> Option<AudioFrame>;
}

/// A provider fed through a channel: the application pushes frames at its
/// own pace, the pacer drains one per tick.
pub struct ChannelFrameProvider {
    frames: Receiver<AudioFrame>,
}

#[async_trait]
impl AudioFrameProvider for ChannelFrameProvider {
    async fn provide(&mut self) -> Option<AudioFrame> {
        self.frames.try_recv().ok()
    }
}

/// Creates a [`ChannelFrameProvider`] together with its feeding half.
#[must_use]
pub fn frame_channel(capacity: usize) -> (Sender<AudioFrame>, ChannelFrameProvider) {
    let (tx, rx) = bounded(capacity);
    (tx, ChannelFrameProvider { frames: rx })
}

/// Timer-driven task polling the provider at the frame cadence and pushing
/// into a rendezvous channel consumed by the sender pipeline.
pub(crate) fn spawn_frame_pacer(
    mut provider: Box<dyn AudioFrameProvider>,
    interval: Duration,
    cancel: CancellationToken,
) -> Receiver<Option<AudioFrame>> {
    let (tx, rx) = bounded(1);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let frame = provider.provide().await;
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        trace!("frame pacer stopped");
    });

    rx
}

/// Handle given to interceptors for announcing speaking-state changes.
#[derive(Clone)]
pub struct InterceptorContext {
    ssrc: u32,
    gateway: VoiceGatewayHandle,
}

impl InterceptorContext {
    pub(crate) fn new(ssrc: u32, gateway: VoiceGatewayHandle) -> Self {
        Self { ssrc, gateway }
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sends a speaking update over the signaling gateway. Errors are
    /// ignored; a closed gateway ends the pipeline independently.
    pub fn set_speaking(&self, flags: u32) {
        let _ = self.gateway.send(GatewayCommand::Speaking { ssrc: self.ssrc, flags });
    }
}

/// Hook between the frame provider and the packetizer. May pass a frame
/// through, replace it, or suppress it entirely by returning `None`.
pub trait FrameInterceptor: Send + 'static {
    fn intercept(&mut self, ctx: &InterceptorContext, frame: Option<AudioFrame>) -> Option<AudioFrame>;
}

/// Default interceptor: raises the speaking flag on the first voiced frame,
/// pads the end of speech with [`SILENCE_FRAME_COUNT`] silence frames, then
/// clears the speaking flag.
#[derive(Debug, Default)]
pub struct DefaultFrameInterceptor {
    speaking: bool,
    silence_left: u8,
}

impl FrameInterceptor for DefaultFrameInterceptor {
    fn intercept(&mut self, ctx: &InterceptorContext, frame: Option<AudioFrame>) -> Option<AudioFrame> {
        match frame {
            Some(frame) => {
                if !self.speaking {
                    ctx.set_speaking(speaking::MICROPHONE);
                    self.speaking = true;
                }
                self.silence_left = SILENCE_FRAME_COUNT;
                Some(frame)
            }
            None if self.speaking => {
                if self.silence_left > 0 {
                    self.silence_left -= 1;
                    Some(AudioFrame::silence())
                } else {
                    ctx.set_speaking(speaking::NONE);
                    self.speaking = false;
                    None
                }
            }
            None => None,
        }
    }
}
