//! The room's single executor task. Everything in [`State`]
//! is owned by this task alone; it is never touched from any other task,
//! which is what gives the room linearizability without locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use coordination_bus::{CoordinationBus, Envelope};
use prost::Message;
use sfu_client::SfuClient;
use signaling_proto::{common, sfu, ws, CreateSessionRequest, DeleteSessionRequest, HandleSignalRequest, SignalPayload};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use crate::errors::{to_error_event, RoomError, ToErrorEvent};
use crate::identity::IdentityClaims;
use crate::metrics::Metrics;
use crate::rate_limit::ConnectionRateLimiter;
use crate::session::{DisconnectReason, Member, RemoteMember};

use super::chat::ChatRing;
use super::command::SignalKind;
use super::sfu_listener;
use super::{Command, CommandEnvelope, ParticipantRecord, Role, RoomHandle, RoomSettings};

const MEMBER_JOINED: &str = "room.member_joined";
const MEMBER_LEFT: &str = "room.member_left";
const MEMBER_UPDATED: &str = "room.member_updated";
const CHAT_ADDED: &str = "room.chat_added";
const CHAT_DELETED: &str = "room.chat_deleted";

struct State {
    room_id: String,
    settings: RoomSettings,
    hosts: HashMap<String, ParticipantRecord>,
    participants: HashMap<String, ParticipantRecord>,
    waiting: HashMap<String, ParticipantRecord>,
    chat: ChatRing,
    degraded: bool,
    bus: Arc<dyn CoordinationBus>,
    sfu: Arc<SfuClient>,
    metrics: Arc<Metrics>,
    event_rate_limiter: Arc<dyn ConnectionRateLimiter>,
    self_handle: RoomHandle,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    room_id: String,
    settings: RoomSettings,
    bus: Arc<dyn CoordinationBus>,
    sfu: Arc<SfuClient>,
    metrics: Arc<Metrics>,
    event_rate_limiter: Arc<dyn ConnectionRateLimiter>,
    self_handle: RoomHandle,
    mut command_rx: mpsc::Receiver<CommandEnvelope>,
    on_empty: impl FnOnce(String) + Send + 'static,
) {
    let bus_stream = match bus.subscribe_room(&room_id).await {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!(%room_id, %err, "room starting without bus subscription, coordination is local-only");
            None
        }
    };
    let mut bus_stream = bus_stream.unwrap_or_else(|| Box::pin(tokio_stream::empty::<Envelope>()));

    let mut state = State {
        chat: ChatRing::new(settings.chat_history_capacity),
        room_id: room_id.clone(),
        settings,
        hosts: HashMap::new(),
        participants: HashMap::new(),
        waiting: HashMap::new(),
        degraded: false,
        bus,
        sfu,
        metrics,
        event_rate_limiter,
        self_handle,
    };

    loop {
        tokio::select! {
            biased;
            command = command_rx.recv() => {
                let Some(envelope) = command else { break };
                handle_command(&mut state, envelope.command).await;
                if state.is_empty() {
                    break;
                }
            }
            envelope = bus_stream.next() => {
                match envelope {
                    Some(envelope) => handle_command(&mut state, Command::ExternalBusEvent(envelope)).await,
                    None => {
                        state.degraded = true;
                        tracing::warn!(room_id = %state.room_id, "bus subscription ended, room is now local-only");
                    }
                }
            }
        }
    }

    command_rx.close();
    while command_rx.try_recv().is_ok() {}
    let _ = state.bus.unsubscribe_room(&state.room_id).await;
    let _ = state.metrics.room_participant_count.remove_label_values(&[&state.room_id]);
    on_empty(state.room_id);
}

impl State {
    fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.participants.is_empty() && self.waiting.is_empty()
    }

    fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.hosts.contains_key(user_id) {
            Some(Role::Host)
        } else if self.participants.contains_key(user_id) {
            Some(Role::Participant)
        } else if self.waiting.contains_key(user_id) {
            Some(Role::Waiting)
        } else {
            None
        }
    }

    fn bucket_mut(&mut self, role: Role) -> &mut HashMap<String, ParticipantRecord> {
        match role {
            Role::Waiting => &mut self.waiting,
            Role::Participant => &mut self.participants,
            Role::Screenshare => &mut self.participants,
            Role::Host => &mut self.hosts,
        }
    }

    fn record(&self, user_id: &str) -> Option<&ParticipantRecord> {
        self.hosts.get(user_id).or_else(|| self.participants.get(user_id)).or_else(|| self.waiting.get(user_id))
    }

    fn record_mut(&mut self, user_id: &str) -> Option<&mut ParticipantRecord> {
        if self.hosts.contains_key(user_id) {
            self.hosts.get_mut(user_id)
        } else if self.participants.contains_key(user_id) {
            self.participants.get_mut(user_id)
        } else {
            self.waiting.get_mut(user_id)
        }
    }

    fn remove_everywhere(&mut self, user_id: &str) -> Option<ParticipantRecord> {
        self.hosts
            .remove(user_id)
            .or_else(|| self.participants.remove(user_id))
            .or_else(|| self.waiting.remove(user_id))
    }

    fn all_members(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.hosts.values().chain(self.participants.values()).chain(self.waiting.values())
    }

    fn send_error<E: ToErrorEvent + std::fmt::Display>(&self, user_id: &str, err: &E) {
        if let Some(record) = self.record(user_id) {
            let event = to_error_event(err);
            let message = ws::WebSocketMessage {
                event_type: "error".to_owned(),
                payload: event.encode_to_vec(),
                correlation_id: None,
            };
            record.member.send_typed(message);
        }
    }

    fn publish_member_update(&self, user_id: &str) {
        if let Some(participant) = self.record(user_id).map(|r| r.to_proto(user_id)) {
            self.publish(MEMBER_UPDATED, Role::Waiting, participant.encode_to_vec(), user_id);
        }
    }

    fn publish(&self, event_type: &str, min_role: Role, payload: Vec<u8>, sender_id: &str) {
        let envelope = Envelope::broadcast(self.room_id.clone(), event_type, payload, sender_id, min_role.rank());
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if let Err(err) = bus.publish_room(envelope).await {
                tracing::warn!(%err, "failed to publish room envelope");
            }
        });
    }

    fn broadcast_snapshot(&self) {
        let to_proto = |map: &HashMap<String, ParticipantRecord>| {
            map.iter().map(|(id, record)| record.to_proto(id)).collect::<Vec<_>>()
        };

        let flagged = |predicate: fn(&ParticipantRecord) -> bool| {
            self.hosts
                .iter()
                .chain(self.participants.iter())
                .filter(|(_, r)| predicate(r))
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>()
        };

        let snapshot = ws::RoomState {
            hosts: to_proto(&self.hosts),
            participants: to_proto(&self.participants),
            waiting: to_proto(&self.waiting),
            hand_raised: flagged(|r| r.flags.hand_raised),
            screen_sharing: flagged(|r| r.flags.screen_sharing),
            degraded: self.degraded,
        };

        let message = ws::WebSocketMessage {
            event_type: "room_state".to_owned(),
            payload: snapshot.encode_to_vec(),
            correlation_id: None,
        };

        for record in self.all_members() {
            record.member.send_typed(message.clone());
        }
    }
}

async fn handle_command(state: &mut State, command: Command) {
    let started = Instant::now();
    let event_label = command_label(&command);

    if let (Some(min_role), Some(actor)) = (command.min_role(), command.actor()) {
        match state.role_of(actor) {
            Some(role) if role >= min_role => {}
            Some(_) => {
                state.send_error(actor, &RoomError::InsufficientRole);
                record_metric(state, event_label, started, "rejected");
                return;
            }
            None => {
                state.send_error(actor, &RoomError::UserGone(actor.to_owned()));
                record_metric(state, event_label, started, "rejected");
                return;
            }
        }
    }

    let actor = command.actor().map(str::to_owned);
    let outcome = dispatch(state, command).await;
    if let Err(err) = &outcome {
        match &actor {
            Some(actor) => state.send_error(actor, err),
            None => tracing::warn!(%err, "command failed with no actor to notify"),
        }
    }
    record_metric(state, event_label, started, if outcome.is_ok() { "ok" } else { "error" });
    record_participant_count(state);
}

fn record_metric(state: &State, event_type: &'static str, started: Instant, status: &'static str) {
    state.metrics.events_total.with_label_values(&[event_type, status]).inc();
    state.metrics.event_processing_duration_seconds.observe(started.elapsed().as_secs_f64());
}

fn record_participant_count(state: &State) {
    let count = (state.hosts.len() + state.participants.len()) as i64;
    state.metrics.room_participant_count.with_label_values(&[&state.room_id]).set(count);
}

fn command_label(command: &Command) -> &'static str {
    match command {
        Command::Join { .. } => "join",
        Command::Leave { .. } => "leave",
        Command::Disconnect { .. } => "disconnect",
        Command::SetAudio { .. } => "toggle_audio",
        Command::SetVideo { .. } => "toggle_video",
        Command::SetHandRaised { .. } => "hand_raised",
        Command::RequestScreenShare { .. } => "request_screenshare",
        Command::AcceptScreenShare { .. } => "accept_screenshare",
        Command::DenyScreenShare { .. } => "deny_screenshare",
        Command::ChatAdd { .. } => "add_chat",
        Command::ChatDelete { .. } => "delete_chat",
        Command::ChatRecent { .. } => "recents_chat",
        Command::AcceptWaiting { .. } => "accept_waiting",
        Command::DenyWaiting { .. } => "deny_waiting",
        Command::Promote { .. } => "promote",
        Command::Kick { .. } => "kick",
        Command::RelaySignal { .. } => "signal_relay",
        Command::Caption { .. } => "caption",
        Command::SummaryRequest { .. } => "summary_request",
        Command::UpdateSettings { .. } => "update_settings",
        Command::Reconnect { .. } => "reconnect",
        Command::DisconnectGraceExpired { .. } => "disconnect_grace_expired",
        Command::BroadcastSnapshot => "broadcast_snapshot",
        Command::ExternalBusEvent(_) => "external_bus_event",
        Command::SfuEvent { .. } => "sfu_event",
    }
}

async fn dispatch(state: &mut State, command: Command) -> Result<(), RoomError> {
    match command {
        Command::Join { user_id, identity, member } => {
            admit(state, user_id, identity, member).await;
            Ok(())
        }
        Command::Leave { user_id } => teardown(state, &user_id, DisconnectReason::GracefulClose).await,
        Command::Disconnect { user_id, reason } => {
            begin_disconnect(state, user_id, reason).await;
            Ok(())
        }
        Command::Reconnect { user_id, identity, prior_session, member } => {
            if let Some(record) = state.record_mut(&user_id) {
                tracing::info!(%user_id, %prior_session, "member reattached within grace window");
                record.epoch += 1;
                record.member = member;
                state.publish_member_update(&user_id);
                state.broadcast_snapshot();
            } else {
                admit(state, user_id, identity, member).await;
            }
            Ok(())
        }
        Command::DisconnectGraceExpired { user_id, epoch } => {
            match state.record(&user_id) {
                Some(record) if record.epoch == epoch => teardown(state, &user_id, DisconnectReason::Timeout).await,
                _ => Ok(()),
            }
        }
        Command::UpdateSettings { require_approval, max_participants, .. } => {
            if let Some(value) = require_approval {
                state.settings.require_approval = value;
            }
            if let Some(value) = max_participants {
                state.settings.max_participants = value;
            }
            let update = ws::RoomSettingsUpdated {
                require_approval: state.settings.require_approval,
                max_participants: state.settings.max_participants as u32,
            };
            let message = ws::WebSocketMessage { event_type: "room_settings_updated".to_owned(), payload: update.encode_to_vec(), correlation_id: None };
            for record in state.hosts.values().chain(state.participants.values()) {
                record.member.send_typed(message.clone());
            }
            Ok(())
        }
        Command::SetAudio { user_id, on } => {
            mutate_flags(state, &user_id, |flags| flags.audio_on = on);
            state.publish_member_update(&user_id);
            state.broadcast_snapshot();
            Ok(())
        }
        Command::SetVideo { user_id, on } => {
            mutate_flags(state, &user_id, |flags| flags.video_on = on);
            state.publish_member_update(&user_id);
            state.broadcast_snapshot();
            Ok(())
        }
        Command::SetHandRaised { user_id, on } => {
            mutate_flags(state, &user_id, |flags| flags.hand_raised = on);
            state.publish_member_update(&user_id);
            state.broadcast_snapshot();
            let set_key = format!("hand_raised:{}", state.room_id);
            let bus = state.bus.clone();
            let target = user_id.clone();
            tokio::spawn(async move {
                let result = if on { bus.set_add(&set_key, &target).await } else { bus.set_remove(&set_key, &target).await };
                if let Err(err) = result {
                    tracing::warn!(%err, "failed to update hand-raised distributed set");
                }
            });
            Ok(())
        }
        Command::RequestScreenShare { user_id } => {
            if !state.event_rate_limiter.check(&user_id) {
                state.metrics.rate_limit_rejections_total.inc();
                return Err(RoomError::RateLimited);
            }
            let Some(record) = state.participants.get(&user_id) else {
                return Err(RoomError::UserGone(user_id));
            };
            let request = common::Participant { user_id: user_id.clone(), display_name: record.display_name.clone(), role: common::Role::Participant as i32, flags: Some(record.flags.into()) };
            let message = ws::WebSocketMessage { event_type: "request_screenshare".to_owned(), payload: request.encode_to_vec(), correlation_id: None };
            for host in state.hosts.values() {
                host.member.send_typed(message.clone());
            }
            Ok(())
        }
        Command::AcceptScreenShare { target_user_id, .. } => {
            let Some(mut record) = state.participants.remove(&target_user_id) else {
                return Err(RoomError::UserGone(target_user_id));
            };
            record.role = Role::Screenshare;
            record.flags.screen_sharing = true;
            state.participants.insert(target_user_id.clone(), record);
            state.publish_member_update(&target_user_id);
            state.broadcast_snapshot();
            Ok(())
        }
        Command::DenyScreenShare { target_user_id, .. } => {
            if let Some(record) = state.participants.get_mut(&target_user_id) {
                record.flags.screen_sharing = false;
            }
            state.publish_member_update(&target_user_id);
            Ok(())
        }
        Command::ChatAdd { user_id, content } => {
            if !state.event_rate_limiter.check(&user_id) {
                state.metrics.rate_limit_rejections_total.inc();
                return Err(RoomError::RateLimited);
            }
            let display_name = state.record(&user_id).map(|r| r.display_name.clone()).unwrap_or_default();
            let entry = state.chat.add(&user_id, &display_name, content)?;
            state.publish(CHAT_ADDED, Role::Participant, entry.encode_to_vec(), &user_id);
            let message = ws::WebSocketMessage { event_type: "add_chat".to_owned(), payload: entry.encode_to_vec(), correlation_id: None };
            for record in state.hosts.values().chain(state.participants.values()) {
                record.member.send_typed(message.clone());
            }
            Ok(())
        }
        Command::ChatDelete { user_id, chat_id } => {
            let is_host = state.hosts.contains_key(&user_id);
            state.chat.delete(&user_id, &chat_id, is_host)?;
            let deleted = ws::ChatDeleted { chat_id: chat_id.clone() };
            state.publish(CHAT_DELETED, Role::Participant, deleted.encode_to_vec(), &user_id);
            let message = ws::WebSocketMessage { event_type: "delete_chat".to_owned(), payload: deleted.encode_to_vec(), correlation_id: None };
            for record in state.hosts.values().chain(state.participants.values()) {
                record.member.send_typed(message.clone());
            }
            Ok(())
        }
        Command::ChatRecent { user_id, limit } => {
            let entries = state.chat.recent(limit);
            let result = ws::RecentsChatResult { entries };
            if let Some(record) = state.record(&user_id) {
                let message = ws::WebSocketMessage { event_type: "recents_chat".to_owned(), payload: result.encode_to_vec(), correlation_id: None };
                record.member.send_typed(message);
            }
            Ok(())
        }
        Command::AcceptWaiting { target_user_id, .. } => {
            let Some(mut record) = state.waiting.remove(&target_user_id) else {
                return Err(RoomError::UserGone(target_user_id));
            };
            record.role = Role::Participant;
            state.participants.insert(target_user_id.clone(), record);
            open_sfu_session(state, &target_user_id).await;
            state.publish_member_update(&target_user_id);
            state.broadcast_snapshot();
            Ok(())
        }
        Command::DenyWaiting { target_user_id, .. } => {
            if let Some(record) = state.waiting.remove(&target_user_id) {
                record.member.disconnect(DisconnectReason::Kicked);
            }
            Ok(())
        }
        Command::Promote { target_user_id, role, .. } => {
            let Some(mut record) = state.remove_everywhere(&target_user_id) else {
                return Err(RoomError::UserGone(target_user_id));
            };
            record.role = role;
            state.bucket_mut(role).insert(target_user_id, record);
            state.broadcast_snapshot();
            Ok(())
        }
        Command::Kick { target_user_id, .. } => teardown(state, &target_user_id, DisconnectReason::Kicked).await,
        Command::RelaySignal { user_id, target_user_id, signal } => {
            if state.record(&target_user_id).is_none() {
                return Err(RoomError::UnknownTarget(target_user_id));
            }

            let event_type = signal.event_type();
            let kind = match &signal {
                SignalKind::Offer(sdp) => signaling_proto::sfu::signal_payload::Kind::OfferSdp(sdp.clone()),
                SignalKind::Answer(sdp) => signaling_proto::sfu::signal_payload::Kind::AnswerSdp(sdp.clone()),
                SignalKind::Candidate(ice) => signaling_proto::sfu::signal_payload::Kind::Ice(ice.clone()),
                SignalKind::Renegotiate(sdp) => signaling_proto::sfu::signal_payload::Kind::OfferSdp(sdp.clone()),
            };
            let request = HandleSignalRequest {
                user_id: user_id.clone(),
                room_id: state.room_id.clone(),
                signal: Some(SignalPayload { kind: Some(kind) }),
            };
            if let Err(err) = state.sfu.handle_signal(request).await {
                return Err(RoomError::SfuUnavailable(err.to_string()));
            }

            let wire_payload = match signal {
                SignalKind::Offer(sdp) => ws::Offer { target_user_id: target_user_id.clone(), sdp }.encode_to_vec(),
                SignalKind::Answer(sdp) => ws::Answer { target_user_id: target_user_id.clone(), sdp }.encode_to_vec(),
                SignalKind::Candidate(ice) => ws::Candidate { target_user_id: target_user_id.clone(), candidate: Some(ice) }.encode_to_vec(),
                SignalKind::Renegotiate(sdp) => ws::Renegotiate { target_user_id: target_user_id.clone(), sdp }.encode_to_vec(),
            };
            let message = ws::WebSocketMessage { event_type: event_type.to_owned(), payload: wire_payload, correlation_id: None };
            if let Some(record) = state.record(&target_user_id) {
                record.member.send_typed(message);
            }
            Ok(())
        }
        Command::Caption { payload, .. } => {
            let message = ws::WebSocketMessage { event_type: "caption".to_owned(), payload, correlation_id: None };
            for record in state.hosts.values().chain(state.participants.values()) {
                record.member.send_typed(message.clone());
            }
            Ok(())
        }
        Command::SummaryRequest { user_id } => {
            let message = ws::WebSocketMessage { event_type: "summary_request".to_owned(), payload: Vec::new(), correlation_id: None };
            if let Some(record) = state.record(&user_id) {
                record.member.send_typed(message);
            }
            Ok(())
        }
        Command::BroadcastSnapshot => {
            state.broadcast_snapshot();
            Ok(())
        }
        Command::ExternalBusEvent(envelope) => {
            handle_bus_event(state, envelope);
            Ok(())
        }
        Command::SfuEvent { user_id, event } => {
            handle_sfu_event(state, &user_id, event);
            Ok(())
        }
    }
}

/// Shared by `Join` and by `Reconnect`'s fallback when no grace-window
/// record exists: computes the member's role, seats them, and opens an SFU
/// session unless they land in `waiting`.
async fn admit(state: &mut State, user_id: String, identity: IdentityClaims, member: Arc<dyn Member>) {
    let role = if state.settings.require_approval && !state.hosts.is_empty() {
        Role::Waiting
    } else if state.hosts.is_empty() {
        Role::Host
    } else {
        Role::Participant
    };

    let record = ParticipantRecord { display_name: identity.display_name, role, flags: Default::default(), member, epoch: 0, sfu_listener: None };
    state.bucket_mut(role).insert(user_id.clone(), record);

    if role != Role::Waiting {
        open_sfu_session(state, &user_id).await;
    }

    let participant = state.record(&user_id).map(|r| r.to_proto(&user_id));
    if let Some(participant) = participant {
        state.publish(MEMBER_JOINED, Role::Waiting, participant.encode_to_vec(), &user_id);
    }
    state.broadcast_snapshot();
}

/// Opens the SFU session for a member already seated in `hosts` or
/// `participants`, then spawns the event listener that feeds
/// `Command::SfuEvent` back into this same room.
async fn open_sfu_session(state: &mut State, user_id: &str) {
    let request = CreateSessionRequest { user_id: user_id.to_owned(), room_id: state.room_id.clone() };
    if let Err(err) = state.sfu.create_session(request).await {
        tracing::warn!(%err, %user_id, "sfu create_session failed");
        return;
    }

    let handle = sfu_listener::spawn(state.self_handle.clone(), state.sfu.clone(), user_id.to_owned());
    match state.record_mut(user_id) {
        Some(record) => record.sfu_listener = Some(handle),
        None => handle.abort(),
    }
}

/// `Kicked`/`ServerShutdown`/`ProtocolError` tear down immediately; the
/// remaining reasons open a disconnect grace window so a client that
/// reconnects quickly reattaches to the same seat instead of losing it.
async fn begin_disconnect(state: &mut State, user_id: String, reason: DisconnectReason) {
    let grace_eligible = matches!(reason, DisconnectReason::GracefulClose | DisconnectReason::SlowConsumer | DisconnectReason::Timeout);
    if !grace_eligible {
        let _ = teardown(state, &user_id, reason).await;
        return;
    }

    let Some(record) = state.record_mut(&user_id) else { return };
    record.epoch += 1;
    let epoch = record.epoch;

    let grace = state.settings.reconnect_grace;
    let handle = state.self_handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let _ = handle.submit(Command::DisconnectGraceExpired { user_id, epoch });
    });
}

/// Forwards a server-streamed SFU event to the owning member over the
/// existing wire messages; there is no dedicated client-facing event for
/// `track_added` yet, so it is only logged.
fn handle_sfu_event(state: &State, user_id: &str, event: sfu::SfuEvent) {
    let Some(record) = state.record(user_id) else { return };
    let wire = match event.event {
        Some(sfu::sfu_event::Event::RenegotiationOfferSdp(sdp)) => {
            Some(ws::WebSocketMessage {
                event_type: "renegotiate".to_owned(),
                payload: ws::Renegotiate { target_user_id: user_id.to_owned(), sdp }.encode_to_vec(),
                correlation_id: None,
            })
        }
        Some(sfu::sfu_event::Event::AnswerSdp(sdp)) => {
            Some(ws::WebSocketMessage {
                event_type: "answer".to_owned(),
                payload: ws::Answer { target_user_id: user_id.to_owned(), sdp }.encode_to_vec(),
                correlation_id: None,
            })
        }
        Some(sfu::sfu_event::Event::Ice(candidate)) => {
            Some(ws::WebSocketMessage {
                event_type: "candidate".to_owned(),
                payload: ws::Candidate { target_user_id: user_id.to_owned(), candidate: Some(candidate) }.encode_to_vec(),
                correlation_id: None,
            })
        }
        Some(sfu::sfu_event::Event::TrackAdded(track)) => {
            tracing::debug!(%user_id, track_id = %track.track_id, owner = %track.owner_user_id, "sfu reported a new track");
            None
        }
        None => None,
    };

    if let Some(message) = wire {
        record.member.send_typed(message);
    }
}

fn mutate_flags(state: &mut State, user_id: &str, mutate: impl FnOnce(&mut crate::room::MediaFlags)) {
    for map in [&mut state.hosts, &mut state.participants, &mut state.waiting] {
        if let Some(record) = map.get_mut(user_id) {
            mutate(&mut record.flags);
            return;
        }
    }
}

async fn teardown(state: &mut State, user_id: &str, reason: DisconnectReason) -> Result<(), RoomError> {
    let Some(record) = state.remove_everywhere(user_id) else {
        return Ok(());
    };

    if let Some(handle) = &record.sfu_listener {
        handle.abort();
    }
    record.member.disconnect(reason);
    let request = DeleteSessionRequest { user_id: user_id.to_owned(), room_id: state.room_id.clone() };
    if let Err(err) = state.sfu.delete_session(request).await {
        tracing::warn!(%err, %user_id, "sfu delete_session failed on teardown");
    }

    let set_key = format!("hand_raised:{}", state.room_id);
    let bus = state.bus.clone();
    let target = user_id.to_owned();
    tokio::spawn(async move {
        let _ = bus.set_remove(&set_key, &target).await;
    });

    state.publish(MEMBER_LEFT, Role::Waiting, user_id.as_bytes().to_vec(), user_id);
    state.broadcast_snapshot();
    Ok(())
}

fn handle_bus_event(state: &mut State, envelope: Envelope) {
    match envelope.event_type.as_str() {
        MEMBER_JOINED => {
            let Ok(participant) = common::Participant::decode(envelope.payload.as_slice()) else { return };
            if state.record(&participant.user_id).is_some() {
                return;
            }
            let role = match common::Role::try_from(participant.role).unwrap_or(common::Role::Participant) {
                common::Role::Host => Role::Host,
                common::Role::Screenshare => Role::Screenshare,
                common::Role::Waiting => Role::Waiting,
                _ => Role::Participant,
            };
            let remote = RemoteMember::new(participant.user_id.clone(), state.room_id.clone(), state.bus.clone());
            let record = ParticipantRecord {
                display_name: participant.display_name,
                role,
                flags: participant.flags.map(from_proto_flags).unwrap_or_default(),
                member: Arc::new(remote),
                epoch: 0,
                sfu_listener: None,
            };
            state.bucket_mut(role).insert(participant.user_id, record);
            state.broadcast_snapshot();
        }
        MEMBER_LEFT => {
            let user_id = String::from_utf8_lossy(&envelope.payload).into_owned();
            if state.remove_everywhere(&user_id).is_some() {
                state.broadcast_snapshot();
            }
        }
        MEMBER_UPDATED => {
            let Ok(participant) = common::Participant::decode(envelope.payload.as_slice()) else { return };
            if state.record(&participant.user_id).is_none() {
                return;
            }
            if let Some(flags) = participant.flags {
                mutate_flags(state, &participant.user_id, |f| *f = from_proto_flags(flags));
            }
            state.broadcast_snapshot();
        }
        CHAT_ADDED | CHAT_DELETED => {
            // Chat history is replica-local; cross-replica chat mirrors are a
            // known best-effort gap (per-topic order across replicas is
            // best-effort, not strict).
        }
        other => {
            tracing::debug!(event_type = other, "ignoring unrecognized bus envelope");
        }
    }
}

fn from_proto_flags(flags: common::MediaFlags) -> crate::room::MediaFlags {
    crate::room::MediaFlags {
        audio_on: flags.audio_on,
        video_on: flags.video_on,
        screen_sharing: flags.screen_sharing,
        hand_raised: flags.hand_raised,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use coordination_bus::LocalBus;
    use sfu_client::CircuitBreakerConfig;

    use crate::identity::IdentityClaims;
    use crate::rate_limit::TokenBucketRateLimiter;

    struct RecordingMember {
        sent: Mutex<Vec<ws::WebSocketMessage>>,
        disconnected: Mutex<Option<DisconnectReason>>,
    }

    impl RecordingMember {
        fn new(_user_id: &str) -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), disconnected: Mutex::new(None) })
        }

        fn error_codes(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.event_type == "error")
                .map(|m| ws::Error::decode(m.payload.as_slice()).unwrap().code)
                .collect()
        }
    }

    impl Member for RecordingMember {
        fn user_id(&self) -> &str {
            "recording-member"
        }

        fn send_typed(&self, message: ws::WebSocketMessage) {
            self.sent.lock().unwrap().push(message);
        }

        fn send_raw(&self, _bytes: Vec<u8>) {}

        fn disconnect(&self, reason: DisconnectReason) {
            *self.disconnected.lock().unwrap() = Some(reason);
        }
    }

    fn identity(user_id: &str) -> IdentityClaims {
        IdentityClaims { subject: user_id.to_owned(), display_name: user_id.to_owned(), email: None }
    }

    fn test_state(settings: RoomSettings) -> State {
        let (command_tx, _command_rx) = mpsc::channel(16);
        let self_handle = RoomHandle { room_id: "room-1".to_owned(), command_tx };
        State {
            room_id: "room-1".to_owned(),
            settings,
            hosts: HashMap::new(),
            participants: HashMap::new(),
            waiting: HashMap::new(),
            chat: ChatRing::new(100),
            degraded: false,
            bus: Arc::new(LocalBus::new()),
            sfu: Arc::new(SfuClient::new("http://127.0.0.1:1", CircuitBreakerConfig::default())),
            metrics: Arc::new(Metrics::new()),
            event_rate_limiter: Arc::new(TokenBucketRateLimiter::new(1_000)),
            self_handle,
        }
    }

    #[tokio::test]
    async fn first_joiner_becomes_host_second_becomes_participant() {
        let mut state = test_state(RoomSettings::default());
        handle_command(&mut state, Command::Join { user_id: "u1".into(), identity: identity("u1"), member: RecordingMember::new("u1") }).await;
        assert_eq!(state.role_of("u1"), Some(Role::Host));

        handle_command(&mut state, Command::Join { user_id: "u2".into(), identity: identity("u2"), member: RecordingMember::new("u2") }).await;
        assert_eq!(state.role_of("u2"), Some(Role::Participant));
    }

    #[tokio::test]
    async fn second_joiner_waits_for_approval_then_admission_makes_them_a_participant() {
        let settings = RoomSettings { require_approval: true, ..RoomSettings::default() };
        let mut state = test_state(settings);
        handle_command(&mut state, Command::Join { user_id: "host".into(), identity: identity("host"), member: RecordingMember::new("host") }).await;
        handle_command(&mut state, Command::Join { user_id: "guest".into(), identity: identity("guest"), member: RecordingMember::new("guest") }).await;
        assert_eq!(state.role_of("guest"), Some(Role::Waiting));

        handle_command(&mut state, Command::AcceptWaiting { user_id: "host".into(), target_user_id: "guest".into() }).await;
        assert_eq!(state.role_of("guest"), Some(Role::Participant));
    }

    #[tokio::test]
    async fn invalid_chat_content_is_reported_back_to_sender() {
        let mut state = test_state(RoomSettings::default());
        let member = RecordingMember::new("u1");
        handle_command(&mut state, Command::Join { user_id: "u1".into(), identity: identity("u1"), member: member.clone() }).await;

        handle_command(&mut state, Command::ChatAdd { user_id: "u1".into(), content: String::new() }).await;

        assert!(member.error_codes().contains(&"chat_content_invalid".to_owned()));
    }

    #[tokio::test]
    async fn participant_cannot_kick_and_is_told_why() {
        let mut state = test_state(RoomSettings::default());
        let participant = RecordingMember::new("p1");
        handle_command(&mut state, Command::Join { user_id: "host".into(), identity: identity("host"), member: RecordingMember::new("host") }).await;
        handle_command(&mut state, Command::Join { user_id: "p1".into(), identity: identity("p1"), member: participant.clone() }).await;

        handle_command(&mut state, Command::Kick { user_id: "p1".into(), target_user_id: "host".into() }).await;

        assert!(participant.error_codes().contains(&"insufficient_role".to_owned()));
        assert_eq!(state.role_of("host"), Some(Role::Host));
    }

    #[tokio::test]
    async fn relay_signal_reports_sfu_unavailable_when_the_sfu_cannot_be_reached() {
        let mut state = test_state(RoomSettings::default());
        let sender = RecordingMember::new("a");
        handle_command(&mut state, Command::Join { user_id: "a".into(), identity: identity("a"), member: sender.clone() }).await;
        handle_command(&mut state, Command::Join { user_id: "b".into(), identity: identity("b"), member: RecordingMember::new("b") }).await;

        handle_command(&mut state, Command::RelaySignal { user_id: "a".into(), target_user_id: "b".into(), signal: SignalKind::Offer("sdp".into()) }).await;

        assert!(sender.error_codes().contains(&"sfu_unavailable".to_owned()));
    }

    #[tokio::test]
    async fn exhausted_event_rate_limit_rejects_chat_and_notifies_sender() {
        let mut state = test_state(RoomSettings::default());
        state.event_rate_limiter = Arc::new(TokenBucketRateLimiter::new(1));
        let member = RecordingMember::new("u1");
        handle_command(&mut state, Command::Join { user_id: "u1".into(), identity: identity("u1"), member: member.clone() }).await;

        handle_command(&mut state, Command::ChatAdd { user_id: "u1".into(), content: "hi".into() }).await;
        handle_command(&mut state, Command::ChatAdd { user_id: "u1".into(), content: "hi again".into() }).await;

        assert!(member.error_codes().contains(&"rate_limited".to_owned()));
    }

    #[tokio::test]
    async fn kick_removes_the_target_from_every_bucket() {
        let mut state = test_state(RoomSettings::default());
        let participant = RecordingMember::new("p1");
        handle_command(&mut state, Command::Join { user_id: "host".into(), identity: identity("host"), member: RecordingMember::new("host") }).await;
        handle_command(&mut state, Command::Join { user_id: "p1".into(), identity: identity("p1"), member: participant.clone() }).await;

        handle_command(&mut state, Command::Kick { user_id: "host".into(), target_user_id: "p1".into() }).await;

        assert!(state.role_of("p1").is_none());
        assert_eq!(*participant.disconnected.lock().unwrap(), Some(DisconnectReason::Kicked));
    }

    #[tokio::test]
    async fn accepting_screenshare_for_a_second_participant_is_not_rejected() {
        let mut state = test_state(RoomSettings::default());
        handle_command(&mut state, Command::Join { user_id: "host".into(), identity: identity("host"), member: RecordingMember::new("host") }).await;
        handle_command(&mut state, Command::Join { user_id: "p1".into(), identity: identity("p1"), member: RecordingMember::new("p1") }).await;
        handle_command(&mut state, Command::Join { user_id: "p2".into(), identity: identity("p2"), member: RecordingMember::new("p2") }).await;

        handle_command(&mut state, Command::AcceptScreenShare { user_id: "host".into(), target_user_id: "p1".into() }).await;
        handle_command(&mut state, Command::AcceptScreenShare { user_id: "host".into(), target_user_id: "p2".into() }).await;

        assert!(state.participants.get("p1").is_some_and(|r| r.flags.screen_sharing));
        assert!(state.participants.get("p2").is_some_and(|r| r.flags.screen_sharing));
    }

    #[tokio::test]
    async fn participant_count_metric_reflects_current_membership() {
        let mut state = test_state(RoomSettings::default());
        handle_command(&mut state, Command::Join { user_id: "host".into(), identity: identity("host"), member: RecordingMember::new("host") }).await;
        handle_command(&mut state, Command::Join { user_id: "p1".into(), identity: identity("p1"), member: RecordingMember::new("p1") }).await;
        assert_eq!(state.metrics.room_participant_count.with_label_values(&["room-1"]).get(), 2);

        handle_command(&mut state, Command::Kick { user_id: "host".into(), target_user_id: "p1".into() }).await;
        assert_eq!(state.metrics.room_participant_count.with_label_values(&["room-1"]).get(), 1);
    }
}
