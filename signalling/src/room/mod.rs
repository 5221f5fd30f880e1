//! The Room: aggregate state for one logical meeting, serialized through a
//! single command channel consumed by one executor task. No
//! field here is ever touched outside that task; everything else submits
//! commands and reads back outputs over channels.

pub mod chat;
pub mod command;
mod executor;
mod sfu_listener;

pub use command::Command;

use std::sync::Arc;
use std::time::Duration;

use coordination_bus::CoordinationBus;
use sfu_client::SfuClient;
use signaling_proto::common;
use signaling_proto::ws::WebSocketMessage;
use tokio::sync::mpsc;

use crate::errors::RoomError;
use crate::metrics::Metrics;
use crate::rate_limit::ConnectionRateLimiter;
use crate::session::Member;

/// Ordered: `waiting < participant < screenshare < host`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Waiting,
    Participant,
    Screenshare,
    Host,
}

impl Role {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl From<Role> for common::Role {
    fn from(role: Role) -> Self {
        match role {
            Role::Waiting => common::Role::Waiting,
            Role::Participant => common::Role::Participant,
            Role::Screenshare => common::Role::Screenshare,
            Role::Host => common::Role::Host,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MediaFlags {
    pub audio_on: bool,
    pub video_on: bool,
    pub screen_sharing: bool,
    pub hand_raised: bool,
}

impl From<MediaFlags> for common::MediaFlags {
    fn from(flags: MediaFlags) -> Self {
        common::MediaFlags {
            audio_on: flags.audio_on,
            video_on: flags.video_on,
            screen_sharing: flags.screen_sharing,
            hand_raised: flags.hand_raised,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub require_approval: bool,
    pub max_participants: usize,
    pub reconnect_grace: Duration,
    pub chat_history_capacity: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            require_approval: false,
            max_participants: 500,
            reconnect_grace: Duration::from_secs(30),
            chat_history_capacity: 100,
        }
    }
}

pub(crate) struct ParticipantRecord {
    pub display_name: String,
    pub role: Role,
    pub flags: MediaFlags,
    pub member: Arc<dyn Member>,
    /// Bumped on every disconnect/reconnect so a delayed grace-window
    /// teardown can tell whether it still applies to the member it was
    /// scheduled for.
    pub epoch: u64,
    /// Handle to this member's SFU event listener task, if one was started
    /// (nothing runs for members still in `waiting`). Aborted at teardown.
    pub sfu_listener: Option<tokio::task::AbortHandle>,
}

impl ParticipantRecord {
    pub fn to_proto(&self, user_id: &str) -> common::Participant {
        common::Participant {
            user_id: user_id.to_owned(),
            display_name: self.display_name.clone(),
            role: common::Role::from(self.role) as i32,
            flags: Some(self.flags.into()),
        }
    }
}

struct CommandEnvelope {
    command: Command,
}

/// Handle held by the Hub and by sessions; submitting a command is the only
/// way anything outside the executor task mutates room state.
#[derive(Clone)]
pub struct RoomHandle {
    pub room_id: String,
    command_tx: mpsc::Sender<CommandEnvelope>,
}

impl RoomHandle {
    pub fn submit(&self, command: Command) -> Result<(), RoomError> {
        self.command_tx
            .try_send(CommandEnvelope { command })
            .map_err(|_| RoomError::RoomGone(self.room_id.clone()))
    }

    /// Decodes one inbound frame from a session and translates it into a
    /// `Command`, then submits it. Permission enforcement happens inside the
    /// executor against the member's *current* role, never here.
    pub fn dispatch_inbound(&self, user_id: &str, message: WebSocketMessage) -> Result<(), RoomError> {
        let command = command::decode_inbound(user_id, message)?;
        self.submit(command)
    }

    pub fn handle_disconnect(&self, user_id: &str, reason: crate::session::DisconnectReason) {
        let _ = self.submit(Command::Disconnect { user_id: user_id.to_owned(), reason });
    }
}

/// Spawns the executor task for a freshly created room and returns the
/// handle used to address it. `on_empty` is invoked exactly once, after the
/// last member leaves and the command channel has drained, so the Hub can
/// remove the room from its registry.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    room_id: String,
    settings: RoomSettings,
    bus: Arc<dyn CoordinationBus>,
    sfu: Arc<SfuClient>,
    metrics: Arc<Metrics>,
    event_rate_limiter: Arc<dyn ConnectionRateLimiter>,
    on_empty: impl FnOnce(String) + Send + 'static,
) -> RoomHandle {
    const COMMAND_CHANNEL_CAPACITY: usize = 1024;
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let handle = RoomHandle { room_id: room_id.clone(), command_tx };

    tokio::spawn(executor::run(
        room_id,
        settings,
        bus,
        sfu,
        metrics,
        event_rate_limiter,
        handle.clone(),
        command_rx,
        on_empty,
    ));

    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_rank_is_strictly_ordered() {
        assert!(Role::Waiting < Role::Participant);
        assert!(Role::Participant < Role::Screenshare);
        assert!(Role::Screenshare < Role::Host);
    }

    #[test]
    fn submit_against_a_dropped_executor_reports_room_gone() {
        let (command_tx, command_rx) = mpsc::channel(1);
        drop(command_rx);
        let handle = RoomHandle { room_id: "room-1".to_owned(), command_tx };

        let err = handle.submit(Command::Leave { user_id: "user-1".to_owned() }).unwrap_err();
        assert_eq!(err, RoomError::RoomGone("room-1".to_owned()));
    }

    #[test]
    fn dispatch_inbound_rejects_an_unknown_event_type_without_touching_the_channel() {
        let (command_tx, mut command_rx) = mpsc::channel(1);
        let handle = RoomHandle { room_id: "room-1".to_owned(), command_tx };

        let message = WebSocketMessage {
            event_type: "not-a-real-event".to_owned(),
            payload: Vec::new(),
            correlation_id: None,
        };
        let result = handle.dispatch_inbound("user-1", message);
        assert!(result.is_err());
        assert!(command_rx.try_recv().is_err());
    }

    #[test]
    fn handle_disconnect_submits_the_reported_reason_unmodified() {
        let (command_tx, mut command_rx) = mpsc::channel(1);
        let handle = RoomHandle { room_id: "room-1".to_owned(), command_tx };

        handle.handle_disconnect("user-1", crate::session::DisconnectReason::SlowConsumer);

        let envelope = command_rx.try_recv().expect("command should have been submitted");
        match envelope.command {
            Command::Disconnect { user_id, reason } => {
                assert_eq!(user_id, "user-1");
                assert_eq!(reason, crate::session::DisconnectReason::SlowConsumer);
            }
            _ => panic!("expected Disconnect command"),
        }
    }
}
