use futures_util::StreamExt as _;
use redis::AsyncCommands;

use crate::{BusError, CoordinationBus, Envelope, EnvelopeStream};

const ROOM_CHANNEL_PREFIX: &str = "signalling:room:";
const DIRECT_CHANNEL_PREFIX: &str = "signalling:user:";

/// Production [`CoordinationBus`], backed by Redis pub/sub for fan-out and
/// plain SADD/SREM/SMEMBERS for the distributed sets.
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn new(redis_uri: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_uri)
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))
    }

    fn room_channel(room_id: &str) -> String {
        format!("{ROOM_CHANNEL_PREFIX}{room_id}")
    }

    fn direct_channel(user_id: &str) -> String {
        format!("{DIRECT_CHANNEL_PREFIX}{user_id}")
    }

    async fn subscribe_channel(&self, channel: String) -> Result<EnvelopeStream, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| BusError::SubscriptionFailed(err.to_string()))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|err| BusError::SubscriptionFailed(err.to_string()))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let bytes: Vec<u8> = msg.get_payload_bytes().to_vec();
            match serde_json::from_slice::<Envelope>(&bytes) {
                Ok(envelope) => Some(envelope),
                Err(err) => {
                    tracing::warn!(%err, "dropping malformed envelope from redis bus");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait::async_trait]
impl CoordinationBus for RedisBus {
    async fn subscribe_room(&self, room_id: &str) -> Result<EnvelopeStream, BusError> {
        self.subscribe_channel(Self::room_channel(room_id)).await
    }

    async fn unsubscribe_room(&self, _room_id: &str) -> Result<(), BusError> {
        // The subscription lives on the `ConnectionManager` returned from
        // `subscribe_room`; dropping that stream unsubscribes it.
        Ok(())
    }

    async fn publish_room(&self, envelope: Envelope) -> Result<(), BusError> {
        let channel = Self::room_channel(&envelope.room_id);
        let payload = serde_json::to_vec(&envelope)
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))
    }

    async fn send_direct(&self, user_id: &str, envelope: Envelope) -> Result<(), BusError> {
        let channel = Self::direct_channel(user_id);
        let payload = serde_json::to_vec(&envelope)
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))
    }

    async fn subscribe_direct(&self, user_id: &str) -> Result<EnvelopeStream, BusError> {
        self.subscribe_channel(Self::direct_channel(user_id)).await
    }

    async fn set_add(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        conn.sadd::<_, _, ()>(set_key, member)
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))
    }

    async fn set_remove(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        conn.srem::<_, _, ()>(set_key, member)
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.connection().await?;
        conn.smembers(set_key)
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|err| BusError::Unavailable(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_namespaced_and_disjoint() {
        assert_eq!(RedisBus::room_channel("abc"), "signalling:room:abc");
        assert_eq!(RedisBus::direct_channel("abc"), "signalling:user:abc");
        assert_ne!(RedisBus::room_channel("abc"), RedisBus::direct_channel("abc"));
    }
}
