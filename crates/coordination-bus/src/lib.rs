//! The cross-instance coordination layer.
//!
//! Any number of control-plane replicas can serve members of the same room.
//! [`CoordinationBus`] is the seam between the `Room` executor and whatever
//! carries messages between replicas: a per-room publish/subscribe topic, a
//! direct per-user channel, and a distributed set primitive used to answer
//! "who currently has their hand raised" consistently across replicas.
//!
//! Two implementations are provided. [`RedisBus`] is the production
//! implementation. [`LocalBus`] degrades to an in-process dispatcher with
//! identical semantics, used when `coordination_store_enabled = false` (the
//! control plane must keep working in single-instance mode).

mod envelope;
mod local;
mod redis_bus;

pub use envelope::Envelope;
pub use local::LocalBus;
pub use redis_bus::RedisBus;

use std::pin::Pin;

use futures_util::Stream;
use thiserror::Error;

pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("coordination store unreachable: {0}")]
    Unavailable(String),
    #[error("subscription for topic {0} failed")]
    SubscriptionFailed(String),
}

/// A room-scoped publish/subscribe fan-out, a direct-to-user channel, and a
/// distributed set abstraction. Implementors must tolerate being polled
/// concurrently from many rooms' executors at once.
#[async_trait::async_trait]
pub trait CoordinationBus: Send + Sync {
    /// Subscribe this replica to a room's topic. Called the first time this
    /// replica hosts a member of the room.
    async fn subscribe_room(&self, room_id: &str) -> Result<EnvelopeStream, BusError>;

    /// Unsubscribe once this replica hosts no member of the room.
    async fn unsubscribe_room(&self, room_id: &str) -> Result<(), BusError>;

    /// Fan an envelope out to every replica subscribed to the room's topic,
    /// this replica included (subscribers filter out their own sends).
    async fn publish_room(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Deliver a unicast envelope to whichever replica currently holds the
    /// named user's session (admit tokens, targeted errors).
    async fn send_direct(&self, user_id: &str, envelope: Envelope) -> Result<(), BusError>;

    /// Subscribe to this replica's direct channel for a locally-held user.
    async fn subscribe_direct(&self, user_id: &str) -> Result<EnvelopeStream, BusError>;

    /// Add a member to a distributed set (e.g. `hand_raised:{room_id}`).
    async fn set_add(&self, set_key: &str, member: &str) -> Result<(), BusError>;

    /// Remove a member from a distributed set.
    async fn set_remove(&self, set_key: &str, member: &str) -> Result<(), BusError>;

    /// Read back the full membership of a distributed set, used on
    /// reconnect to reconcile a replica's local view.
    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, BusError>;

    /// Readiness probe: used by `/health/ready`.
    async fn ping(&self) -> Result<(), BusError>;
}
