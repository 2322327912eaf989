use std::time::Duration;

use crate::crypto::VoiceEncryption;
use crate::error::VoiceError;
use crate::udp::UdpSocketFactory;

/// A bounded retry schedule whose delay grows linearly from `start` to `max`
/// over `max_attempts` attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    start: Duration,
    max: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn linear(start: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            start,
            max: max.max(start),
            max_attempts: max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to sleep after a failed attempt (zero-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.max_attempts <= 1 {
            return self.start;
        }
        let step = (self.max - self.start) / (self.max_attempts - 1);
        self.start + step * attempt.min(self.max_attempts - 1)
    }
}

/// Immutable configuration of one voice connection, validated when the
/// builder assembles it. In-flight connections never mutate these values.
#[derive(Debug, Clone)]
pub struct VoiceConnectionConfig {
    /// Bound on the parent-gateway handshake (voice state + server
    /// assignment correlation).
    pub timeout: Duration,
    pub self_mute: bool,
    pub self_deaf: bool,
    /// When false the inbound pipeline is a no-op stand-in with empty
    /// streams.
    pub receive_voice: bool,
    pub encryption: VoiceEncryption,
    /// Grace period after a "moved" close before the connection is
    /// considered dead.
    pub detach_timeout: Duration,
    /// Cadence of the outbound frame provider.
    pub frame_interval: Duration,
    pub ip_discovery_retry: RetryPolicy,
    /// Per-attempt bound on waiting for a discovery response.
    pub ip_discovery_timeout: Duration,
    /// Reconnect schedule of the signaling gateway.
    pub reconnect_retry: RetryPolicy,
    pub socket_factory: UdpSocketFactory,
}

impl VoiceConnectionConfig {
    pub(crate) fn validate(&self) -> Result<(), VoiceError> {
        if self.timeout.is_zero() {
            return Err(VoiceError::InvalidConfiguration("timeout must be non-zero"));
        }
        if self.detach_timeout.is_zero() {
            return Err(VoiceError::InvalidConfiguration("detach_timeout must be non-zero"));
        }
        if self.frame_interval.is_zero() {
            return Err(VoiceError::InvalidConfiguration("frame_interval must be non-zero"));
        }
        if self.ip_discovery_timeout.is_zero() {
            return Err(VoiceError::InvalidConfiguration(
                "ip_discovery_timeout must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for VoiceConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            self_mute: false,
            self_deaf: false,
            receive_voice: false,
            encryption: VoiceEncryption::default(),
            detach_timeout: Duration::from_millis(100),
            frame_interval: Duration::from_millis(20),
            ip_discovery_retry: RetryPolicy::linear(
                Duration::from_secs(2),
                Duration::from_secs(30),
                5,
            ),
            ip_discovery_timeout: Duration::from_secs(5),
            reconnect_retry: RetryPolicy::linear(
                Duration::from_secs(2),
                Duration::from_secs(20),
                10,
            ),
            socket_factory: UdpSocketFactory::default(),
        }
    }
}
