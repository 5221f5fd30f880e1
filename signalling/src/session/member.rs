//! Capability interface `{ Id, Role, Send, SendRaw, Disconnect }`: the Room
//! addresses members polymorphically whether they are a locally-attached
//! WebSocket or a remote replica reached through the coordination bus.

use std::sync::Arc;

use coordination_bus::{CoordinationBus, Envelope};
use signaling_proto::ws::WebSocketMessage;

use super::{DisconnectReason, SessionHandle};

pub trait Member: Send + Sync {
    fn user_id(&self) -> &str;
    fn send_typed(&self, message: WebSocketMessage);
    fn send_raw(&self, bytes: Vec<u8>);
    fn disconnect(&self, reason: DisconnectReason);
}

/// A member whose WebSocket is attached to this replica.
pub struct LocalMember {
    handle: SessionHandle,
}

impl LocalMember {
    pub fn new(handle: SessionHandle) -> Self {
        Self { handle }
    }
}

impl Member for LocalMember {
    fn user_id(&self) -> &str {
        &self.handle.user_id
    }

    fn send_typed(&self, message: WebSocketMessage) {
        if let Err(err) = self.handle.send_typed(message) {
            tracing::warn!(user_id = %self.handle.user_id, %err, "dropping message to local member");
            if matches!(err, super::SendError::ChannelFull) {
                self.handle.disconnect(DisconnectReason::SlowConsumer);
            }
        }
    }

    fn send_raw(&self, bytes: Vec<u8>) {
        if let Err(err) = self.handle.send_raw(bytes) {
            tracing::warn!(user_id = %self.handle.user_id, %err, "dropping raw frame to local member");
            if matches!(err, super::SendError::ChannelFull) {
                self.handle.disconnect(DisconnectReason::SlowConsumer);
            }
        }
    }

    fn disconnect(&self, reason: DisconnectReason) {
        self.handle.disconnect(reason);
    }
}

/// A member known to this room only through bus reconciliation: their
/// session lives on another replica. Sends are re-routed through the bus's
/// direct channel; the owning replica applies them to its own `LocalMember`.
pub struct RemoteMember {
    user_id: String,
    room_id: String,
    bus: Arc<dyn CoordinationBus>,
}

impl RemoteMember {
    pub fn new(user_id: String, room_id: String, bus: Arc<dyn CoordinationBus>) -> Self {
        Self { user_id, room_id, bus }
    }
}

impl Member for RemoteMember {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn send_typed(&self, message: WebSocketMessage) {
        let event_type = message.event_type.clone();
        self.send_raw_with_event_type(prost::Message::encode_to_vec(&message), event_type);
    }

    fn send_raw(&self, bytes: Vec<u8>) {
        self.send_raw_with_event_type(bytes, "raw".to_owned());
    }

    /// Best effort only: this replica does not own the socket. The actual
    /// close happens when the owning replica applies the `Kick`/`Leave`
    /// command it receives over the bus; this just mirrors local membership
    /// removal so callers can treat every member uniformly.
    fn disconnect(&self, _reason: DisconnectReason) {
        tracing::debug!(user_id = %self.user_id, "disconnect requested for remote member, deferring to owning replica");
    }
}

impl RemoteMember {
    fn send_raw_with_event_type(&self, bytes: Vec<u8>, event_type: String) {
        let envelope = Envelope::direct(self.user_id.clone(), event_type, bytes, "hub");
        let envelope = Envelope { room_id: self.room_id.clone(), ..envelope };
        let bus = self.bus.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            if let Err(err) = bus.send_direct(&user_id, envelope).await {
                tracing::warn!(%user_id, %err, "failed to deliver direct envelope to remote member");
            }
        });
    }
}
