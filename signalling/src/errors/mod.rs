//! Six-kind error taxonomy shared by every module-owned error
//! enum, and the single conversion into the wire-level `ws::Error` message.

use signaling_proto::ws;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Authorization,
    Validation,
    Conflict,
    Unavailable,
    Internal,
}

impl From<ErrorKind> for ws::ErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Protocol => ws::ErrorKind::Protocol,
            ErrorKind::Authorization => ws::ErrorKind::Authorization,
            ErrorKind::Validation => ws::ErrorKind::Validation,
            ErrorKind::Conflict => ws::ErrorKind::Conflict,
            ErrorKind::Unavailable => ws::ErrorKind::Unavailable,
            ErrorKind::Internal => ws::ErrorKind::Internal,
        }
    }
}

/// Implemented by every module-owned error enum so `Room`/`ClientSession`
/// can convert any of them into the single wire representation without a
/// per-call-site match.
pub trait ToErrorEvent {
    fn kind(&self) -> ErrorKind;
    fn code(&self) -> &'static str;
}

pub fn to_error_event<E: ToErrorEvent + std::fmt::Display>(err: &E) -> ws::Error {
    ws::Error {
        kind: ws::ErrorKind::from(err.kind()) as i32,
        code: err.code().to_owned(),
        message: err.to_string(),
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoomError {
    #[error("room {0} no longer exists")]
    RoomGone(String),
    #[error("user {0} is not a member of this room")]
    UserGone(String),
    #[error("user is already a member of this room")]
    AlreadyInRoom,
    #[error("only the host can perform this action")]
    InsufficientRole,
    #[error("chat content must be 1..=1000 bytes, got {0}")]
    ChatContentInvalid(usize),
    #[error("unknown target user {0}")]
    UnknownTarget(String),
    #[error("coordination bus unavailable: {0}")]
    BusUnavailable(String),
    #[error("sfu unavailable: {0}")]
    SfuUnavailable(String),
    #[error("rate limit exceeded for this action")]
    RateLimited,
}

impl ToErrorEvent for RoomError {
    fn kind(&self) -> ErrorKind {
        match self {
            RoomError::RoomGone(_) | RoomError::UserGone(_) | RoomError::AlreadyInRoom => {
                ErrorKind::Conflict
            }
            RoomError::InsufficientRole => ErrorKind::Authorization,
            RoomError::ChatContentInvalid(_) | RoomError::UnknownTarget(_) | RoomError::RateLimited => {
                ErrorKind::Validation
            }
            RoomError::BusUnavailable(_) | RoomError::SfuUnavailable(_) => ErrorKind::Unavailable,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RoomError::RoomGone(_) => "room_gone",
            RoomError::UserGone(_) => "user_gone",
            RoomError::AlreadyInRoom => "already_in_room",
            RoomError::InsufficientRole => "insufficient_role",
            RoomError::ChatContentInvalid(_) => "chat_content_invalid",
            RoomError::UnknownTarget(_) => "unknown_target",
            RoomError::BusUnavailable(_) => "bus_unavailable",
            RoomError::SfuUnavailable(_) => "sfu_unavailable",
            RoomError::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("frame of {0} bytes exceeds the maximum inbound size")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown event type {0}")]
    UnknownEvent(String),
}

impl ToErrorEvent for SessionError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }

    fn code(&self) -> &'static str {
        match self {
            SessionError::FrameTooLarge(_) => "frame_too_large",
            SessionError::Malformed(_) => "malformed_frame",
            SessionError::UnknownEvent(_) => "unknown_event",
        }
    }
}

impl ToErrorEvent for crate::identity::AuthError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Authorization
    }

    fn code(&self) -> &'static str {
        match self {
            crate::identity::AuthError::MissingToken => "missing_token",
            crate::identity::AuthError::InvalidToken(_) => "invalid_token",
        }
    }
}

impl From<sfu_client::SfuError> for RoomError {
    fn from(err: sfu_client::SfuError) -> Self {
        RoomError::SfuUnavailable(err.to_string())
    }
}

impl From<coordination_bus::BusError> for RoomError {
    fn from(err: coordination_bus::BusError) -> Self {
        RoomError::BusUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_error_maps_to_expected_kind() {
        assert_eq!(RoomError::AlreadyInRoom.kind(), ErrorKind::Conflict);
        assert_eq!(RoomError::InsufficientRole.kind(), ErrorKind::Authorization);
        assert_eq!(RoomError::ChatContentInvalid(0).kind(), ErrorKind::Validation);
    }

    #[test]
    fn to_error_event_carries_message_and_code() {
        let err = RoomError::RoomGone("room-1".to_owned());
        let event = to_error_event(&err);
        assert_eq!(event.code, "room_gone");
        assert_eq!(event.kind, ws::ErrorKind::Conflict as i32);
    }
}
