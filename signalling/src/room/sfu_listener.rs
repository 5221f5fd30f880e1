//! Drains one member's server-streamed SFU events and resubmits each as a
//! `Command::SfuEvent` on the room's own queue. One instance per member with
//! an open SFU session; its lifetime is bounded by the `AbortHandle` stashed
//! on that member's `ParticipantRecord` and aborted at teardown.

use std::sync::Arc;
use std::time::Duration;

use sfu_client::SfuClient;
use signaling_proto::ListenEventsRequest;
use tokio_stream::StreamExt;

use super::{Command, RoomHandle};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub fn spawn(room: RoomHandle, sfu: Arc<SfuClient>, user_id: String) -> tokio::task::AbortHandle {
    let join_handle = tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let request = ListenEventsRequest { user_id: user_id.clone(), room_id: room.room_id.clone() };
            match sfu.listen_events(request).await {
                Ok(mut stream) => {
                    backoff = INITIAL_BACKOFF;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(event) => {
                                let command = Command::SfuEvent { user_id: user_id.clone(), event };
                                if room.submit(command).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%user_id, %err, "sfu event stream errored, reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%user_id, %err, "failed to open sfu event stream, retrying");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    });

    join_handle.abort_handle()
}
