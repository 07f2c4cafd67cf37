//! The signaling record: one row per room, at most two occupants.

use crate::types::{PeerId, RoomId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel stored in the offer column to mark the initiator slot as taken
/// before the real offer has been computed.
pub const CLAIMED: &str = "CLAIMED";

/// The single rendezvous row mediating one session.
///
/// Invariants:
/// - created only by a peer transitioning into the initiator role;
/// - `receiver_id` is set exactly once, via a conditional update predicated
///   on it being null;
/// - a row whose `updated_at` exceeds the expiry horizon is eligible for
///   reclamation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: RoomId,
    /// Base64 SHA-256 of the passphrase; informational mismatch check only.
    pub passphrase_hash: String,
    pub initiator_id: PeerId,
    pub receiver_id: Option<PeerId>,
    /// Base64 session description, or the `CLAIMED` sentinel.
    pub offer: Option<String>,
    /// Base64 session description from the receiver.
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoomRecord {
    /// Fresh row for an initiator claiming an empty room.
    pub fn claim(room_id: RoomId, initiator_id: PeerId, passphrase_hash: String) -> Self {
        let now = Utc::now();
        Self {
            room_id,
            passphrase_hash,
            initiator_id,
            receiver_id: None,
            offer: Some(CLAIMED.to_string()),
            answer: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Both slots taken.
    pub fn is_fully_occupied(&self) -> bool {
        self.receiver_id.is_some()
    }

    /// Whether `peer` holds either slot of this row.
    pub fn occupies(&self, peer: PeerId) -> bool {
        self.initiator_id == peer || self.receiver_id == Some(peer)
    }

    /// The offer column holds a real description, not the sentinel.
    pub fn has_real_offer(&self) -> bool {
        matches!(self.offer.as_deref(), Some(offer) if offer != CLAIMED)
    }

    /// Row age relative to `now`, measured from the last heartbeat.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RoomRecord {
        RoomRecord::claim(RoomId::new("alpha-1"), PeerId::generate(), "fp".into())
    }

    #[test]
    fn fresh_claim_holds_the_sentinel() {
        let r = record();
        assert_eq!(r.offer.as_deref(), Some(CLAIMED));
        assert!(!r.has_real_offer());
        assert!(!r.is_fully_occupied());
    }

    #[test]
    fn occupancy_covers_both_slots() {
        let mut r = record();
        let receiver = PeerId::generate();
        assert!(r.occupies(r.initiator_id));
        assert!(!r.occupies(receiver));

        r.receiver_id = Some(receiver);
        assert!(r.occupies(receiver));
        assert!(r.is_fully_occupied());
    }

    #[test]
    fn age_tracks_updated_at() {
        let mut r = record();
        let now = Utc::now();
        r.updated_at = now - Duration::seconds(10);
        assert!(r.age(now) >= Duration::seconds(10));
    }
}
