use serde::{Deserialize, Serialize};

/// A message crossing the coordination bus. `payload` is the already-encoded
/// wire bytes of the event (see `signaling-proto`); the bus never looks
/// inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub room_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub sender_id: String,
    /// Minimum role (as its wire-format rank) allowed to receive this
    /// envelope; subscribers below this rank filter it out locally
    ///.
    pub min_role_rank: u8,
    pub target_user_id: Option<String>,
}

impl Envelope {
    pub fn broadcast(room_id: impl Into<String>, event_type: impl Into<String>, payload: Vec<u8>, sender_id: impl Into<String>, min_role_rank: u8) -> Self {
        Self {
            room_id: room_id.into(),
            event_type: event_type.into(),
            payload,
            sender_id: sender_id.into(),
            min_role_rank,
            target_user_id: None,
        }
    }

    pub fn direct(target_user_id: impl Into<String>, event_type: impl Into<String>, payload: Vec<u8>, sender_id: impl Into<String>) -> Self {
        Self {
            room_id: String::new(),
            event_type: event_type.into(),
            payload,
            sender_id: sender_id.into(),
            min_role_rank: 0,
            target_user_id: Some(target_user_id.into()),
        }
    }
}
