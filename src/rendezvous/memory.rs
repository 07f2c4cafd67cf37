//! In-process rendezvous store.
//!
//! Backs the demo binary and the scenario tests. All conditional updates
//! commit under one lock, so the matched/unmatched signal is exact; change
//! notifications fan out over a per-room broadcast channel after commit,
//! which reproduces the duplicate-delivery behavior of a real bus (late
//! subscribers miss nothing they cannot re-read).

use crate::rendezvous::record::RoomRecord;
use crate::rendezvous::store::{RendezvousStore, RoomEvent, RoomSubscription, StoreError};
use crate::types::{PeerId, Role, RoomId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{Mutex, broadcast};
use tracing::trace;

const NOTIFY_CAPACITY: usize = 64;

#[derive(Default)]
pub struct MemoryRendezvous {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomId, RoomRecord>,
    topics: HashMap<RoomId, broadcast::Sender<RoomEvent>>,
}

impl Inner {
    fn notify(&mut self, room: &RoomId, event: RoomEvent) {
        if let Some(sender) = self.topics.get(room) {
            // No receivers is fine; the event is simply unobserved.
            let _ = sender.send(event);
        }
    }
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rooms. Test helper.
    pub async fn room_count(&self) -> usize {
        self.inner.lock().await.rooms.len()
    }

    /// Insert a pre-built row unconditionally, notifying subscribers.
    ///
    /// Lets tests seed stale rows with backdated `updated_at` instead of
    /// sleeping past the reclamation horizons.
    pub async fn seed(&self, record: RoomRecord) {
        let mut inner = self.inner.lock().await;
        let room = record.room_id.clone();
        inner.rooms.insert(room.clone(), record.clone());
        inner.notify(&room, RoomEvent::Inserted(record));
    }
}

#[async_trait]
impl RendezvousStore for MemoryRendezvous {
    async fn fetch(&self, room: &RoomId) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.inner.lock().await.rooms.get(room).cloned())
    }

    async fn insert_if_absent(&self, record: RoomRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.rooms.contains_key(&record.room_id) {
            return Ok(false);
        }
        let room = record.room_id.clone();
        inner.rooms.insert(room.clone(), record.clone());
        inner.notify(&room, RoomEvent::Inserted(record));
        trace!(%room, "room record inserted");
        Ok(true)
    }

    async fn publish_offer(
        &self,
        room: &RoomId,
        initiator: PeerId,
        offer: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.rooms.get_mut(room) else {
            return Ok(false);
        };
        if record.initiator_id != initiator {
            return Ok(false);
        }
        record.offer = Some(offer.to_string());
        record.updated_at = Utc::now();
        let snapshot = record.clone();
        inner.notify(room, RoomEvent::Updated(snapshot));
        Ok(true)
    }

    async fn claim_receiver(
        &self,
        room: &RoomId,
        receiver: PeerId,
        answer: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.rooms.get_mut(room) else {
            return Ok(false);
        };
        if record.receiver_id.is_some() {
            return Ok(false);
        }
        record.receiver_id = Some(receiver);
        record.answer = Some(answer.to_string());
        record.updated_at = Utc::now();
        let snapshot = record.clone();
        inner.notify(room, RoomEvent::Updated(snapshot));
        trace!(%room, receiver = %receiver.short(), "receiver slot claimed");
        Ok(true)
    }

    async fn touch(&self, room: &RoomId, occupant: PeerId, role: Role) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.rooms.get_mut(room) else {
            return Ok(false);
        };
        let holds_slot = match role {
            Role::Initiator => record.initiator_id == occupant,
            Role::Receiver => record.receiver_id == Some(occupant),
        };
        if !holds_slot {
            return Ok(false);
        }
        record.updated_at = Utc::now();
        let snapshot = record.clone();
        inner.notify(room, RoomEvent::Updated(snapshot));
        Ok(true)
    }

    async fn delete(&self, room: &RoomId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.rooms.remove(room).is_some() {
            inner.notify(room, RoomEvent::Deleted);
            trace!(%room, "room record deleted");
        }
        Ok(())
    }

    async fn subscribe(&self, room: &RoomId) -> Result<RoomSubscription, StoreError> {
        let mut inner = self.inner.lock().await;
        let sender = inner
            .topics
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(NOTIFY_CAPACITY).0);
        Ok(RoomSubscription::new(sender.subscribe()))
    }
}
