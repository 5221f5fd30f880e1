//! Client session: one per WebSocket. Three cooperating tasks — reader,
//! writer, heartbeat — sharing no mutable state except the
//! outbound channel.

mod member;

pub use member::{LocalMember, Member, RemoteMember};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prost::Message as _;
use salvo::websocket::{Message as WsMessage, WebSocket};
use signaling_proto::ws::WebSocketMessage;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;

use crate::errors::{to_error_event, RoomError, SessionError, ToErrorEvent};
use crate::metrics::Metrics;
use crate::room::{Role, RoomHandle};
use crate::wire::WsCodec;

/// Consecutive `dispatch_inbound` failures tolerated before the connection is
/// treated as persistently misbehaving rather than momentarily confused.
const MAX_CONSECUTIVE_PROTOCOL_ERRORS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    GracefulClose,
    Kicked,
    SlowConsumer,
    ProtocolError,
    Timeout,
    ServerShutdown,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("outbound channel is full")]
    ChannelFull,
    #[error("session has already closed")]
    Closed,
}

pub enum OutboundFrame {
    Typed(WebSocketMessage),
    Raw(Vec<u8>),
}

/// Handle returned by [`ClientSession::spawn`]; implements the `{ Id, Role,
/// Send, SendRaw, Disconnect }` capability interface.
///
/// `disconnect` is signaled over a `watch` channel rather than the bounded
/// outbound queue: a close has to land even when that queue is already full
/// of a slow consumer's backlog, otherwise the close itself would be the
/// first thing dropped.
#[derive(Clone)]
pub struct SessionHandle {
    pub user_id: String,
    pub role: watch::Receiver<Role>,
    outbound: mpsc::Sender<OutboundFrame>,
    close: watch::Sender<Option<DisconnectReason>>,
    torn_down: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn send_typed(&self, message: WebSocketMessage) -> Result<(), SendError> {
        self.outbound.try_send(OutboundFrame::Typed(message)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        self.outbound.try_send(OutboundFrame::Raw(bytes)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.close.send(Some(reason));
    }

    /// The reason passed to the most recent `disconnect` call, if any.
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        *self.close.borrow()
    }

    /// True if session teardown has already been initiated. Used to make
    /// teardown idempotent: exactly one `DeleteSession`/cleanup pass per
    /// connection, regardless of how many things trigger it concurrently.
    pub fn mark_torn_down(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }
}

pub struct SessionConfig {
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub outbound_capacity: usize,
}

fn error_message<E: ToErrorEvent + std::fmt::Display>(err: &E) -> WebSocketMessage {
    let event = to_error_event(err);
    WebSocketMessage { event_type: "error".to_owned(), payload: event.encode_to_vec(), correlation_id: None }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 256 * 1024,
            heartbeat_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            outbound_capacity: 256,
        }
    }
}

/// Spawns the reader/writer/heartbeat tasks for one accepted WebSocket and
/// returns the handle the rest of the system uses to address it.
pub struct ClientSession;

impl ClientSession {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        user_id: String,
        initial_role: Role,
        ws: WebSocket,
        codec: Arc<dyn WsCodec>,
        config: SessionConfig,
        room: RoomHandle,
        metrics: Arc<Metrics>,
    ) -> SessionHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (role_tx, role_rx) = watch::channel(initial_role);
        let (close_tx, close_rx) = watch::channel(None);
        let torn_down = Arc::new(AtomicBool::new(false));

        let handle = SessionHandle {
            user_id: user_id.clone(),
            role: role_rx,
            outbound: outbound_tx,
            close: close_tx,
            torn_down: torn_down.clone(),
        };

        let (mut ws_sink, mut ws_stream) = futures_util::StreamExt::split(ws);

        let reader_codec = codec.clone();
        let reader_room = room.clone();
        let reader_user_id = user_id.clone();
        let reader_config_max_frame = config.max_frame_bytes;
        let reader_read_timeout = config.read_timeout;
        let reader_handle = handle.clone();
        let reader_metrics = metrics.clone();
        tokio::spawn(async move {
            let mut consecutive_protocol_errors = 0u32;

            loop {
                let next = tokio::time::timeout(reader_read_timeout, ws_stream.next()).await;
                let message = match next {
                    Ok(Some(Ok(message))) => message,
                    Ok(Some(Err(err))) => {
                        tracing::warn!(user_id = %reader_user_id, %err, "websocket read error");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::info!(user_id = %reader_user_id, "read timeout, closing session");
                        reader_handle.disconnect(DisconnectReason::Timeout);
                        break;
                    }
                };

                if message.is_close() {
                    break;
                }
                if message.is_ping() || message.is_pong() {
                    continue;
                }

                let bytes = message.as_bytes();
                if bytes.len() > reader_config_max_frame {
                    tracing::warn!(user_id = %reader_user_id, len = bytes.len(), "frame too large");
                    reader_handle.disconnect(DisconnectReason::ProtocolError);
                    break;
                }

                match reader_codec.decode(bytes) {
                    Ok(decoded) => match reader_room.dispatch_inbound(&reader_user_id, decoded) {
                        Ok(()) => consecutive_protocol_errors = 0,
                        Err(err) => {
                            tracing::warn!(user_id = %reader_user_id, %err, "dispatch rejected inbound frame");
                            let _ = reader_handle.send_typed(error_message(&err));
                            if matches!(err, RoomError::RoomGone(_)) {
                                reader_handle.disconnect(DisconnectReason::ProtocolError);
                                break;
                            }
                            consecutive_protocol_errors += 1;
                            if consecutive_protocol_errors >= MAX_CONSECUTIVE_PROTOCOL_ERRORS {
                                reader_handle.disconnect(DisconnectReason::ProtocolError);
                                break;
                            }
                        }
                    },
                    Err(err) => {
                        tracing::warn!(user_id = %reader_user_id, %err, "malformed frame");
                        let _ = reader_handle.send_typed(error_message(&SessionError::Malformed(err.to_string())));
                        reader_handle.disconnect(DisconnectReason::ProtocolError);
                        break;
                    }
                }
            }

            if reader_handle.mark_torn_down() {
                let reason = reader_handle.close_reason().unwrap_or(DisconnectReason::GracefulClose);
                reader_room.handle_disconnect(&reader_user_id, reason);
            }
            reader_metrics.active_connections.dec();
        });

        let writer_codec = codec;
        let mut writer_close_rx = close_rx;
        tokio::spawn(async move {
            let mut outbound_rx = outbound_rx;
            loop {
                tokio::select! {
                    biased;
                    changed = writer_close_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let _ = ws_sink.send(WsMessage::close()).await;
                        break;
                    }
                    frame = outbound_rx.recv() => {
                        match frame {
                            Some(OutboundFrame::Typed(message)) => {
                                let bytes = writer_codec.encode(&message);
                                if ws_sink.send(WsMessage::binary(bytes)).await.is_err() {
                                    break;
                                }
                            }
                            Some(OutboundFrame::Raw(bytes)) => {
                                if ws_sink.send(WsMessage::binary(bytes)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = ws_sink.send(WsMessage::close()).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        let heartbeat_handle = handle.clone();
        let heartbeat_interval = config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                if heartbeat_handle
                    .send_typed(WebSocketMessage {
                        event_type: "ping".to_owned(),
                        payload: Vec::new(),
                        correlation_id: None,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        handle
    }
}

use futures_util::SinkExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_torn_down_is_idempotent() {
        let (tx, _rx) = mpsc::channel(1);
        let (_role_tx, role_rx) = watch::channel(Role::Participant);
        let (close_tx, _close_rx) = watch::channel(None);
        let handle = SessionHandle {
            user_id: "user-1".into(),
            role: role_rx,
            outbound: tx,
            close: close_tx,
            torn_down: Arc::new(AtomicBool::new(false)),
        };

        assert!(handle.mark_torn_down());
        assert!(!handle.mark_torn_down());
    }
}
