//! Typed façade over the rendezvous store.
//!
//! The backing store is eventually consistent; the only atomicity assumed is
//! insert-if-absent and conditional updates whose predicate is checked at
//! commit time. Every conditional method returns whether a row actually
//! matched: zero rows affected is the signal for "lost the race", and
//! callers must treat it as such rather than as an error.

use crate::rendezvous::record::RoomRecord;
use crate::types::{PeerId, Role, RoomId};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient RPC failure; the caller may retry with backoff.
    #[error("rendezvous unavailable: {0}")]
    Unavailable(String),
    /// The store returned a row this client cannot interpret.
    #[error("malformed room record: {0}")]
    Corrupt(String),
}

/// Change notification for a single room.
///
/// The bus may deliver the same update more than once; consumers guard
/// critical transitions with single-shot flags or conditional updates.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Inserted(RoomRecord),
    Updated(RoomRecord),
    Deleted,
}

/// Live change-notification subscription for one room.
///
/// Dropping the subscription detaches it from the bus.
pub struct RoomSubscription {
    receiver: broadcast::Receiver<RoomEvent>,
}

impl RoomSubscription {
    pub fn new(receiver: broadcast::Receiver<RoomEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` once the bus is gone. A lagged receiver skips
    /// ahead rather than failing: missed intermediate states are recovered
    /// by re-reading the row.
    pub async fn next(&mut self) -> Option<RoomEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "room subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Typed access to the single signaling row of one room.
#[async_trait]
pub trait RendezvousStore: Send + Sync {
    /// Read the row for this room.
    async fn fetch(&self, room: &RoomId) -> Result<Option<RoomRecord>, StoreError>;

    /// Insert the row only if no row exists for the room. Returns whether
    /// the insert won; `false` means another initiator got there first.
    async fn insert_if_absent(&self, record: RoomRecord) -> Result<bool, StoreError>;

    /// Write the offer column, predicated on `initiator_id` still being
    /// `initiator`. Refreshes `updated_at`.
    async fn publish_offer(
        &self,
        room: &RoomId,
        initiator: PeerId,
        offer: &str,
    ) -> Result<bool, StoreError>;

    /// Claim the receiver slot and write the answer in one conditional
    /// update predicated on `receiver_id` being null. Returns whether the
    /// update matched; `false` means the slot was already taken.
    async fn claim_receiver(
        &self,
        room: &RoomId,
        receiver: PeerId,
        answer: &str,
    ) -> Result<bool, StoreError>;

    /// Heartbeat: rewrite the occupant's own id column, refreshing
    /// `updated_at`. Predicated on the occupant still holding that slot.
    async fn touch(&self, room: &RoomId, occupant: PeerId, role: Role) -> Result<bool, StoreError>;

    /// Delete the row for this room.
    async fn delete(&self, room: &RoomId) -> Result<(), StoreError>;

    /// Subscribe to insert/update/delete notifications for this room.
    async fn subscribe(&self, room: &RoomId) -> Result<RoomSubscription, StoreError>;
}
