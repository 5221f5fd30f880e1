use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::{BusError, CoordinationBus, Envelope, EnvelopeStream};

const CHANNEL_CAPACITY: usize = 1024;

/// In-process stand-in for [`crate::RedisBus`], used in single-instance
/// mode: the control plane must keep functioning with coordination
/// disabled. Same trait, same semantics, no network hop.
#[derive(Default)]
pub struct LocalBus {
    room_topics: DashMap<String, broadcast::Sender<Envelope>>,
    direct_topics: DashMap<String, broadcast::Sender<Envelope>>,
    sets: DashMap<String, Arc<DashSet<String>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, map: &DashMap<String, broadcast::Sender<Envelope>>, key: &str) -> broadcast::Sender<Envelope> {
        map.entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn stream_from(rx: broadcast::Receiver<Envelope>) -> EnvelopeStream {
        let stream = BroadcastStream::new(rx).filter_map(|item| match item {
            Ok(envelope) => Some(envelope),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "local bus subscriber lagged, dropping envelopes");
                None
            }
        });
        Box::pin(stream)
    }
}

#[async_trait::async_trait]
impl CoordinationBus for LocalBus {
    async fn subscribe_room(&self, room_id: &str) -> Result<EnvelopeStream, BusError> {
        let sender = self.topic(&self.room_topics, room_id);
        Ok(Self::stream_from(sender.subscribe()))
    }

    async fn unsubscribe_room(&self, room_id: &str) -> Result<(), BusError> {
        self.room_topics.remove(room_id);
        Ok(())
    }

    async fn publish_room(&self, envelope: Envelope) -> Result<(), BusError> {
        let sender = self.topic(&self.room_topics, &envelope.room_id);
        // No subscribers yet is not an error: the room may be alone on this replica.
        let _ = sender.send(envelope);
        Ok(())
    }

    async fn send_direct(&self, user_id: &str, envelope: Envelope) -> Result<(), BusError> {
        let sender = self.topic(&self.direct_topics, user_id);
        let _ = sender.send(envelope);
        Ok(())
    }

    async fn subscribe_direct(&self, user_id: &str) -> Result<EnvelopeStream, BusError> {
        let sender = self.topic(&self.direct_topics, user_id);
        Ok(Self::stream_from(sender.subscribe()))
    }

    async fn set_add(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        let set = self
            .sets
            .entry(set_key.to_string())
            .or_insert_with(|| Arc::new(DashSet::new()))
            .clone();
        set.insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        if let Some(set) = self.sets.get(set_key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, BusError> {
        Ok(self
            .sets
            .get(set_key)
            .map(|set| set.iter().map(|m| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_delivered_to_subscriber() {
        let bus = LocalBus::new();
        let mut stream = bus.subscribe_room("room-1").await.unwrap();

        bus.publish_room(Envelope::broadcast("room-1", "room_state", vec![1, 2, 3], "host-1", 0))
            .await
            .unwrap();

        let received = stream.next().await.expect("envelope delivered");
        assert_eq!(received.event_type, "room_state");
        assert_eq!(received.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn set_membership_survives_reconnect_read() {
        let bus = LocalBus::new();
        bus.set_add("hand_raised:room-1", "user-a").await.unwrap();
        bus.set_add("hand_raised:room-1", "user-b").await.unwrap();
        bus.set_remove("hand_raised:room-1", "user-a").await.unwrap();

        let members = bus.set_members("hand_raised:room-1").await.unwrap();
        assert_eq!(members, vec!["user-b".to_string()]);
    }

    #[tokio::test]
    async fn direct_channel_is_scoped_per_user() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe_direct("user-a").await.unwrap();
        let mut b = bus.subscribe_direct("user-b").await.unwrap();

        bus.send_direct("user-a", Envelope::direct("user-a", "error", vec![9], "system"))
            .await
            .unwrap();

        let received = a.next().await.expect("delivered to user-a");
        assert_eq!(received.sender_id, "system");
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), b.next())
            .await
            .is_err());
    }
}
