//! Commands accepted by the room executor, and the inbound wire decoding
//! that turns a session's framed `WebSocketMessage` into one.

use coordination_bus::Envelope;
use prost::Message;
use signaling_proto::{common, sfu, ws};
use std::sync::Arc;

use crate::errors::RoomError;
use crate::identity::IdentityClaims;
use crate::session::{DisconnectReason, Member};

use super::Role;

/// The content of an SDP/ICE signaling fragment, independent of which wire
/// event carried it.
#[derive(Clone)]
pub enum SignalKind {
    Offer(String),
    Answer(String),
    Candidate(common::IceCandidate),
    Renegotiate(String),
}

impl SignalKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            SignalKind::Offer(_) => "offer",
            SignalKind::Answer(_) => "answer",
            SignalKind::Candidate(_) => "candidate",
            SignalKind::Renegotiate(_) => "renegotiate",
        }
    }
}

#[derive(Clone)]
pub enum Command {
    Join { user_id: String, identity: IdentityClaims, member: Arc<dyn Member> },
    Leave { user_id: String },
    Disconnect { user_id: String, reason: DisconnectReason },
    SetAudio { user_id: String, on: bool },
    SetVideo { user_id: String, on: bool },
    SetHandRaised { user_id: String, on: bool },
    RequestScreenShare { user_id: String },
    AcceptScreenShare { user_id: String, target_user_id: String },
    DenyScreenShare { user_id: String, target_user_id: String },
    ChatAdd { user_id: String, content: String },
    ChatDelete { user_id: String, chat_id: String },
    ChatRecent { user_id: String, limit: u32 },
    AcceptWaiting { user_id: String, target_user_id: String },
    DenyWaiting { user_id: String, target_user_id: String },
    Promote { user_id: String, target_user_id: String, role: Role },
    Kick { user_id: String, target_user_id: String },
    RelaySignal { user_id: String, target_user_id: String, signal: SignalKind },
    Caption { user_id: String, payload: Vec<u8> },
    SummaryRequest { user_id: String },
    UpdateSettings { user_id: String, require_approval: Option<bool>, max_participants: Option<usize> },
    /// Issued by the Hub for every new WS upgrade, host-side: the executor
    /// decides whether this is a fresh admission or a reattachment to a
    /// member still inside its disconnect grace window.
    Reconnect { user_id: String, identity: IdentityClaims, prior_session: String, member: Arc<dyn Member> },
    /// Fires once a disconnected member's grace window elapses. Ignored if
    /// the member has since reconnected (its epoch will have moved on).
    DisconnectGraceExpired { user_id: String, epoch: u64 },
    BroadcastSnapshot,
    ExternalBusEvent(Envelope),
    /// Delivered by a room's own SFU event listener task; never sent by a
    /// client and never subject to the declarative role check.
    SfuEvent { user_id: String, event: sfu::SfuEvent },
}

impl Command {
    /// Minimum role required, or `None` for commands the executor issues to
    /// itself (system events bypass the declarative `>=` check).
    pub fn min_role(&self) -> Option<Role> {
        match self {
            Command::Join { .. }
            | Command::Leave { .. }
            | Command::Disconnect { .. }
            | Command::Reconnect { .. }
            | Command::DisconnectGraceExpired { .. }
            | Command::BroadcastSnapshot
            | Command::ExternalBusEvent(_)
            | Command::SfuEvent { .. } => None,
            Command::UpdateSettings { .. } => Some(Role::Host),
            Command::SetAudio { .. }
            | Command::SetVideo { .. }
            | Command::SetHandRaised { .. }
            | Command::RequestScreenShare { .. }
            | Command::ChatAdd { .. }
            | Command::ChatRecent { .. }
            | Command::RelaySignal { .. } => Some(Role::Participant),
            Command::ChatDelete { .. } => Some(Role::Participant),
            Command::AcceptScreenShare { .. }
            | Command::DenyScreenShare { .. }
            | Command::AcceptWaiting { .. }
            | Command::DenyWaiting { .. }
            | Command::Kick { .. }
            | Command::SummaryRequest { .. } => Some(Role::Host),
            Command::Promote { .. } => Some(Role::Host),
            Command::Caption { .. } => Some(Role::Participant),
        }
    }

    pub fn actor(&self) -> Option<&str> {
        match self {
            Command::Join { user_id, .. }
            | Command::Leave { user_id }
            | Command::Disconnect { user_id, .. }
            | Command::SetAudio { user_id, .. }
            | Command::SetVideo { user_id, .. }
            | Command::SetHandRaised { user_id, .. }
            | Command::RequestScreenShare { user_id }
            | Command::AcceptScreenShare { user_id, .. }
            | Command::DenyScreenShare { user_id, .. }
            | Command::ChatAdd { user_id, .. }
            | Command::ChatDelete { user_id, .. }
            | Command::ChatRecent { user_id, .. }
            | Command::AcceptWaiting { user_id, .. }
            | Command::DenyWaiting { user_id, .. }
            | Command::Promote { user_id, .. }
            | Command::Kick { user_id, .. }
            | Command::RelaySignal { user_id, .. }
            | Command::Caption { user_id, .. }
            | Command::SummaryRequest { user_id }
            | Command::UpdateSettings { user_id, .. } => Some(user_id),
            Command::BroadcastSnapshot
            | Command::ExternalBusEvent(_)
            | Command::Reconnect { .. }
            | Command::DisconnectGraceExpired { .. }
            | Command::SfuEvent { .. } => None,
        }
    }
}

/// Translates one inbound frame into a `Command`. Unknown event types are a
/// protocol error; the session that sent it stays open.
pub fn decode_inbound(user_id: &str, message: ws::WebSocketMessage) -> Result<Command, RoomError> {
    let user_id = user_id.to_owned();
    let payload = message.payload.as_slice();

    let command = match message.event_type.as_str() {
        "add_chat" => {
            let body = ws::AddChat::decode(payload).map_err(decode_err)?;
            Command::ChatAdd { user_id, content: body.content }
        }
        "delete_chat" => {
            let body = ws::DeleteChat::decode(payload).map_err(decode_err)?;
            Command::ChatDelete { user_id, chat_id: body.chat_id }
        }
        "recents_chat" => {
            let body = ws::RecentsChat::decode(payload).map_err(decode_err)?;
            Command::ChatRecent { user_id, limit: body.limit }
        }
        "raise_hand" => Command::SetHandRaised { user_id, on: true },
        "lower_hand" => Command::SetHandRaised { user_id, on: false },
        "toggle_audio" => {
            let body = ws::ToggleAudio::decode(payload).map_err(decode_err)?;
            Command::SetAudio { user_id, on: body.on }
        }
        "toggle_video" => {
            let body = ws::ToggleVideo::decode(payload).map_err(decode_err)?;
            Command::SetVideo { user_id, on: body.on }
        }
        "request_screenshare" => Command::RequestScreenShare { user_id },
        "accept_screenshare" => {
            let body = ws::AcceptScreenshare::decode(payload).map_err(decode_err)?;
            Command::AcceptScreenShare { user_id, target_user_id: body.user_id }
        }
        "deny_screenshare" => {
            let body = ws::DenyScreenshare::decode(payload).map_err(decode_err)?;
            Command::DenyScreenShare { user_id, target_user_id: body.user_id }
        }
        "accept_waiting" => {
            let body = ws::AcceptWaiting::decode(payload).map_err(decode_err)?;
            Command::AcceptWaiting { user_id, target_user_id: body.user_id }
        }
        "deny_waiting" => {
            let body = ws::DenyWaiting::decode(payload).map_err(decode_err)?;
            Command::DenyWaiting { user_id, target_user_id: body.user_id }
        }
        "kick" => {
            let body = ws::Kick::decode(payload).map_err(decode_err)?;
            Command::Kick { user_id, target_user_id: body.user_id }
        }
        "offer" => {
            let body = ws::Offer::decode(payload).map_err(decode_err)?;
            Command::RelaySignal { user_id, target_user_id: body.target_user_id, signal: SignalKind::Offer(body.sdp) }
        }
        "answer" => {
            let body = ws::Answer::decode(payload).map_err(decode_err)?;
            Command::RelaySignal { user_id, target_user_id: body.target_user_id, signal: SignalKind::Answer(body.sdp) }
        }
        "candidate" => {
            let body = ws::Candidate::decode(payload).map_err(decode_err)?;
            let candidate = body.candidate.unwrap_or_default();
            Command::RelaySignal { user_id, target_user_id: body.target_user_id, signal: SignalKind::Candidate(candidate) }
        }
        "renegotiate" => {
            let body = ws::Renegotiate::decode(payload).map_err(decode_err)?;
            Command::RelaySignal { user_id, target_user_id: body.target_user_id, signal: SignalKind::Renegotiate(body.sdp) }
        }
        "caption" => Command::Caption { user_id, payload: payload.to_vec() },
        "summary_request" => Command::SummaryRequest { user_id },
        "update_settings" => {
            let body = ws::UpdateSettings::decode(payload).map_err(decode_err)?;
            Command::UpdateSettings {
                user_id,
                require_approval: body.require_approval,
                max_participants: body.max_participants.map(|v| v as usize),
            }
        }
        "ping" | "pong" => return Err(RoomError::UnknownTarget("heartbeat frames are handled by the session, not the room".to_owned())),
        other => return Err(RoomError::UnknownTarget(other.to_owned())),
    };

    Ok(command)
}

fn decode_err(err: prost::DecodeError) -> RoomError {
    RoomError::UnknownTarget(format!("malformed payload: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_hand_has_no_payload_and_decodes() {
        let message = ws::WebSocketMessage {
            event_type: "raise_hand".to_owned(),
            payload: Vec::new(),
            correlation_id: None,
        };
        let command = decode_inbound("user-1", message).unwrap();
        assert!(matches!(command, Command::SetHandRaised { on: true, .. }));
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let message = ws::WebSocketMessage {
            event_type: "not_a_real_event".to_owned(),
            payload: Vec::new(),
            correlation_id: None,
        };
        assert!(decode_inbound("user-1", message).is_err());
    }

    #[test]
    fn toggle_audio_decodes_its_payload() {
        let body = ws::ToggleAudio { on: true };
        let message = ws::WebSocketMessage {
            event_type: "toggle_audio".to_owned(),
            payload: body.encode_to_vec(),
            correlation_id: None,
        };
        let command = decode_inbound("user-1", message).unwrap();
        assert!(matches!(command, Command::SetAudio { on: true, .. }));
    }
}
