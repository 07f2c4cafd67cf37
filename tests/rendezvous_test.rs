//! Tests for the rendezvous store: conditional updates, the lost-the-race
//! signal, and change notifications.

use sotto::rendezvous::{CLAIMED, MemoryRendezvous, RendezvousStore, RoomEvent, RoomRecord};
use sotto::types::{PeerId, Role, RoomId};
use std::sync::Arc;

fn claim(room: &str) -> (RoomRecord, PeerId) {
    let initiator = PeerId::generate();
    let record = RoomRecord::claim(RoomId::new(room), initiator, "fp".into());
    (record, initiator)
}

#[tokio::test]
async fn test_insert_if_absent_is_first_wins() {
    let store = MemoryRendezvous::new();
    let (first, _) = claim("alpha-1");
    let (second, _) = claim("alpha-1");

    assert!(store.insert_if_absent(first).await.unwrap());
    assert!(!store.insert_if_absent(second).await.unwrap());

    let row = store.fetch(&RoomId::new("alpha-1")).await.unwrap().unwrap();
    assert_eq!(row.offer.as_deref(), Some(CLAIMED));
}

#[tokio::test]
async fn test_concurrent_receiver_claims_match_exactly_once() {
    let store = Arc::new(MemoryRendezvous::new());
    let room = RoomId::new("race");
    let (record, _) = claim("race");
    store.insert_if_absent(record).await.unwrap();

    let mut claims = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let room = room.clone();
        claims.push(tokio::spawn(async move {
            store
                .claim_receiver(&room, PeerId::generate(), &format!("answer-{i}"))
                .await
                .unwrap()
        }));
    }

    let mut wins = 0;
    for handle in claims {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn test_publish_offer_is_conditional_on_initiator() {
    let store = MemoryRendezvous::new();
    let room = RoomId::new("beta-2");
    let (record, initiator) = claim("beta-2");
    store.insert_if_absent(record).await.unwrap();

    // A stranger cannot overwrite the offer column.
    assert!(
        !store
            .publish_offer(&room, PeerId::generate(), "ZXZpbA==")
            .await
            .unwrap()
    );
    assert!(store.publish_offer(&room, initiator, "b2ZmZXI=").await.unwrap());

    let row = store.fetch(&room).await.unwrap().unwrap();
    assert_eq!(row.offer.as_deref(), Some("b2ZmZXI="));
}

#[tokio::test]
async fn test_touch_refreshes_updated_at_for_occupants_only() {
    let store = MemoryRendezvous::new();
    let room = RoomId::new("hb");
    let (record, initiator) = claim("hb");
    let created = record.updated_at;
    store.insert_if_absent(record).await.unwrap();

    assert!(store.touch(&room, initiator, Role::Initiator).await.unwrap());
    let row = store.fetch(&room).await.unwrap().unwrap();
    assert!(row.updated_at >= created);

    // Wrong role column, and a non-occupant: zero rows affected.
    assert!(!store.touch(&room, initiator, Role::Receiver).await.unwrap());
    assert!(
        !store
            .touch(&room, PeerId::generate(), Role::Initiator)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_subscription_delivers_room_lifecycle() {
    let store = MemoryRendezvous::new();
    let room = RoomId::new("events");
    let mut sub = store.subscribe(&room).await.unwrap();

    let (record, initiator) = claim("events");
    store.insert_if_absent(record).await.unwrap();
    store.publish_offer(&room, initiator, "b2ZmZXI=").await.unwrap();
    store.delete(&room).await.unwrap();

    assert!(matches!(sub.next().await, Some(RoomEvent::Inserted(_))));
    match sub.next().await {
        Some(RoomEvent::Updated(row)) => assert_eq!(row.offer.as_deref(), Some("b2ZmZXI=")),
        other => panic!("expected update, got {other:?}"),
    }
    assert!(matches!(sub.next().await, Some(RoomEvent::Deleted)));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let store = MemoryRendezvous::new();
    let room = RoomId::new("gone");
    store.delete(&room).await.unwrap();
    store.delete(&room).await.unwrap();
    assert!(store.fetch(&room).await.unwrap().is_none());
}
