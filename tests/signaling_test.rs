//! Signaling scenarios: role election, the receiver race, stale-row
//! reclamation, gathering timeout, and passphrase mismatch.

use sotto::media::SyntheticPipeline;
use sotto::rendezvous::{CLAIMED, MemoryRendezvous, RendezvousStore, RoomRecord};
use sotto::session::loopback::{Gathering, LoopbackFactory, LoopbackNetwork};
use sotto::session::signaling::{SessionCore, SessionEvent, SessionSlot};
use sotto::session::{Phase, TransportFactory};
use sotto::types::{PeerId, RoomId, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

type Peer = (
    Arc<SessionCore>,
    watch::Receiver<Phase>,
    mpsc::UnboundedReceiver<SessionEvent>,
);

fn start_peer(
    name: &str,
    room: &str,
    passphrase: &str,
    store: Arc<MemoryRendezvous>,
    transports: Arc<dyn TransportFactory>,
) -> Peer {
    SessionCore::start(
        SessionConfig::new(room, passphrase, name),
        SessionSlot::new(),
        store,
        transports,
        Arc::new(SyntheticPipeline::new()),
    )
    .expect("session should start")
}

async fn wait_for_phase(rx: &mut watch::Receiver<Phase>, wanted: Phase, secs: u64) {
    tokio::time::timeout(Duration::from_secs(secs), async {
        loop {
            if *rx.borrow_and_update() == wanted {
                return;
            }
            rx.changed().await.expect("phase channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
}

#[tokio::test]
async fn test_happy_two_party_handshake() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();
    let room = RoomId::new("ALPHA-1");

    let (_alice, mut alice_phase, mut alice_events) = start_peer(
        "Alice",
        "alpha-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
    );

    // The row appears with the claimed sentinel before the offer is ready.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(row) = store.fetch(&room).await.unwrap() {
                assert_eq!(row.receiver_id, None);
                if row.offer.as_deref() != Some(CLAIMED) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("initiator never published an offer");

    let (_bob, mut bob_phase, mut bob_events) = start_peer(
        "Bob",
        "ALPHA-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
    );

    wait_for_phase(&mut alice_phase, Phase::Connected, 4).await;
    wait_for_phase(&mut bob_phase, Phase::Connected, 4).await;

    // The row is fully occupied with both descriptions.
    let row = store.fetch(&room).await.unwrap().unwrap();
    assert!(row.receiver_id.is_some());
    assert!(row.answer.is_some());

    // Each side learns the other's display name via the introduction frame.
    let alice_sees = wait_for_remote_name(&mut alice_events, "Bob").await;
    let bob_sees = wait_for_remote_name(&mut bob_events, "Alice").await;
    assert_eq!(alice_sees, "Bob");
    assert_eq!(bob_sees, "Alice");
}

async fn wait_for_remote_name(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    wanted: &str,
) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::RemoteParticipant(p) = event {
                if p.display_name == wanted {
                    return p.display_name;
                }
            }
        }
        panic!("event stream ended before the remote name arrived");
    })
    .await
    .expect("timed out waiting for the remote participant name")
}

#[tokio::test]
async fn test_receiver_race_admits_exactly_one() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();

    let (_alice, mut alice_phase, _alice_events) = start_peer(
        "Alice",
        "RACE-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
    );

    // Make sure Alice holds the initiator slot with a real offer before the
    // contenders arrive, so the race is over the receiver column alone.
    let room = RoomId::new("RACE-1");
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(row) = store.fetch(&room).await.unwrap() {
                if row.offer.as_deref().is_some_and(|offer| offer != CLAIMED) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("initiator never published an offer");

    // Two contenders race for the single receiver slot.
    let (_bob, bob_phase, _bob_events) = start_peer(
        "Bob",
        "RACE-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
    );
    let (_carol, carol_phase, _carol_events) = start_peer(
        "Carol",
        "RACE-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
    );

    wait_for_phase(&mut alice_phase, Phase::Connected, 6).await;

    let mut contenders = [bob_phase, carol_phase];
    let mut connected = 0;
    let mut full = 0;
    for rx in &mut contenders {
        let settled = tokio::time::timeout(Duration::from_secs(6), async {
            loop {
                let phase = *rx.borrow_and_update();
                if phase == Phase::Connected || phase == Phase::RoomFull {
                    return phase;
                }
                rx.changed().await.expect("phase channel closed");
            }
        })
        .await
        .expect("contender never settled");
        match settled {
            Phase::Connected => connected += 1,
            Phase::RoomFull => full += 1,
            _ => unreachable!(),
        }
    }
    assert_eq!(connected, 1, "exactly one contender wins the slot");
    assert_eq!(full, 1, "the other observes zero rows affected");
}

#[tokio::test]
async fn test_stale_full_row_is_reclaimed_by_a_stranger() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();
    let room = RoomId::new("BETA-2");

    let mut stale = RoomRecord::claim(room.clone(), PeerId::generate(), "old-fp".into());
    stale.receiver_id = Some(PeerId::generate());
    stale.offer = Some("b2xk".into());
    stale.answer = Some("b2xk".into());
    stale.updated_at = chrono::Utc::now() - chrono::Duration::seconds(13);
    store.seed(stale).await;

    let (carol, _phase, _events) = start_peer(
        "Carol",
        "BETA-2",
        "fresh-pass",
        store.clone(),
        Arc::new(LoopbackFactory::new(network)),
    );

    // The stale row is deleted and a fresh initiator claim succeeds.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(row) = store.fetch(&room).await.unwrap() {
                if row.initiator_id == carol.peer_id() {
                    assert_eq!(row.receiver_id, None);
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stale row was never reclaimed");
}

#[tokio::test]
async fn test_fresh_full_row_means_room_full() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();

    // Fully occupied only 5 s ago: under the 12 s horizon for strangers.
    let mut fresh = RoomRecord::claim(RoomId::new("FULL-1"), PeerId::generate(), "fp".into());
    fresh.receiver_id = Some(PeerId::generate());
    fresh.updated_at = chrono::Utc::now() - chrono::Duration::seconds(5);
    store.seed(fresh).await;

    let (_carol, mut phase, _events) = start_peer(
        "Carol",
        "FULL-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network)),
    );
    wait_for_phase(&mut phase, Phase::RoomFull, 5).await;

    // The fresh row was left alone.
    assert!(store.fetch(&RoomId::new("FULL-1")).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_gathering_that_never_completes_is_committed_at_timeout() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();
    let room = RoomId::new("SLOW-1");

    // Alice's transport never finishes gathering; Bob's is normal.
    let (_alice, _alice_phase, _alice_events) = start_peer(
        "Alice",
        "SLOW-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::with_gathering(
            network.clone(),
            Gathering::Never,
        )),
    );

    // The offer is still committed once the 4 s gathering timeout fires.
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(row) = store.fetch(&room).await.unwrap() {
                if row.offer.as_deref().is_some_and(|offer| offer != CLAIMED) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("offer was never committed despite the gathering timeout");

    let (_bob, mut bob_phase, _bob_events) = start_peer(
        "Bob",
        "SLOW-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
    );
    wait_for_phase(&mut bob_phase, Phase::Connected, 30).await;
}

#[tokio::test]
async fn test_passphrase_mismatch_is_surfaced_and_fatal() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();
    let room = RoomId::new("LOCKED-1");

    let (_alice, _alice_phase, _alice_events) = start_peer(
        "Alice",
        "LOCKED-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
    );
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.fetch(&room).await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("initiator never claimed the room");

    let (_mallory, mut phase, mut events) = start_peer(
        "Mallory",
        "LOCKED-1",
        "wrong-pass",
        store.clone(),
        Arc::new(LoopbackFactory::new(network)),
    );
    wait_for_phase(&mut phase, Phase::SecurityError, 5).await;

    // The mismatch is surfaced and the session exits on its own.
    let saw_warning = tokio::time::timeout(Duration::from_secs(5), async {
        let mut warned = false;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Warning(_) => warned = true,
                SessionEvent::Terminated => return warned,
                _ => {}
            }
        }
        warned
    })
    .await
    .expect("mismatched session never terminated");
    assert!(saw_warning);

    // Alice's claim is untouched.
    assert!(store.fetch(&room).await.unwrap().is_some());
}

#[tokio::test]
async fn test_duplicate_row_updates_do_not_disturb_a_live_session() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();
    let room = RoomId::new("DUP-1");

    let (alice, mut alice_phase, _alice_events) = start_peer(
        "Alice",
        "DUP-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
    );
    let (_bob, mut bob_phase, _bob_events) = start_peer(
        "Bob",
        "DUP-1",
        "hunter2",
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
    );
    wait_for_phase(&mut alice_phase, Phase::Connected, 6).await;
    wait_for_phase(&mut bob_phase, Phase::Connected, 6).await;

    // Replay the settled row several times: the same answer redelivered
    // must be applied at most once, so the session stays connected.
    for _ in 0..5 {
        let row = store.fetch(&room).await.unwrap().unwrap();
        store
            .touch(&room, row.initiator_id, sotto::types::Role::Initiator)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.phase(), Phase::Connected);
    assert_eq!(*bob_phase.borrow(), Phase::Connected);
}
