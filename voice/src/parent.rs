//! Boundary to the application's primary signaling channel.
//!
//! The SDK does not own that channel or its reconnect logic; it only needs a
//! filterable event stream and a way to send voice-state updates. The
//! embedding application feeds events in with [`ParentGatewayHandle::publish`]
//! and services the outbound updates from the receiver returned by
//! [`ParentGatewayHandle::new`].

use tokio::sync::{broadcast, mpsc};

use crate::error::VoiceError;

const EVENT_CAPACITY: usize = 64;

/// Events the voice subsystem consumes from the parent channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentEvent {
    /// Our own (or another member's) voice state changed; carries the
    /// session id binding us to the voice session.
    VoiceStateUpdate {
        guild_id: u64,
        user_id: u64,
        channel_id: Option<u64>,
        session_id: String,
    },
    /// The server assigned (or reassigned) a voice endpoint for a guild.
    /// `endpoint` is absent while the server is migrating.
    VoiceServerUpdate {
        guild_id: u64,
        token: String,
        endpoint: Option<String>,
    },
}

/// The voice-state update sent over the parent channel to join, move or
/// leave a voice channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateVoiceState {
    pub guild_id: u64,
    pub channel_id: Option<u64>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Cloneable handle pairing the parent channel's event stream with its
/// outbound voice-state sender.
#[derive(Debug, Clone)]
pub struct ParentGatewayHandle {
    events: broadcast::Sender<ParentEvent>,
    updates: mpsc::UnboundedSender<UpdateVoiceState>,
}

impl ParentGatewayHandle {
    /// Creates the handle plus the drain of outbound voice-state updates the
    /// application must forward to its gateway.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpdateVoiceState>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (updates, updates_rx) = mpsc::unbounded_channel();
        (Self { events, updates }, updates_rx)
    }

    /// Feeds a parent-channel event into every listening voice connection.
    pub fn publish(&self, event: ParentEvent) {
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ParentEvent> {
        self.events.subscribe()
    }

    pub(crate) fn update_voice_state(&self, update: UpdateVoiceState) -> Result<(), VoiceError> {
        self.updates.send(update).map_err(|_| VoiceError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_subscribers() {
        let (handle, _updates) = ParentGatewayHandle::new();
        let mut first = handle.events();
        let mut second = handle.events();

        handle.publish(ParentEvent::VoiceServerUpdate {
            guild_id: 1,
            token: "t".to_string(),
            endpoint: Some("voice.example.com:443".to_string()),
        });

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn voice_state_updates_reach_the_application_drain() {
        let (handle, mut updates) = ParentGatewayHandle::new();
        let update = UpdateVoiceState {
            guild_id: 9,
            channel_id: Some(10),
            self_mute: false,
            self_deaf: true,
        };
        handle.update_voice_state(update.clone()).unwrap();
        assert_eq!(updates.recv().await, Some(update));
    }
}
