//! End-to-end session scenarios over the in-memory store and loopback
//! transport: chat, privacy sync, file transfer, and orderly termination.

use rand::RngCore;
use sotto::media::SyntheticPipeline;
use sotto::rendezvous::MemoryRendezvous;
use sotto::session::loopback::{LoopbackFactory, LoopbackNetwork};
use sotto::session::signaling::{SessionCore, SessionEvent, SessionSlot};
use sotto::session::{DataChannel, Phase, SessionError};
use sotto::types::SessionConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Peer {
    core: Arc<SessionCore>,
    phase: watch::Receiver<Phase>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

async fn connected_pair(room: &str) -> (Peer, Peer, Arc<MemoryRendezvous>) {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();

    let (a_core, a_phase, a_events) = SessionCore::start(
        SessionConfig::new(room, "hunter2", "Alice"),
        SessionSlot::new(),
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
        Arc::new(SyntheticPipeline::new()),
    )
    .expect("alice should start");
    let (b_core, b_phase, b_events) = SessionCore::start(
        SessionConfig::new(room, "hunter2", "Bob"),
        SessionSlot::new(),
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
        Arc::new(SyntheticPipeline::new()),
    )
    .expect("bob should start");

    let mut alice = Peer {
        core: a_core,
        phase: a_phase,
        events: a_events,
    };
    let mut bob = Peer {
        core: b_core,
        phase: b_phase,
        events: b_events,
    };
    wait_for_phase(&mut alice.phase, Phase::Connected).await;
    wait_for_phase(&mut bob.phase, Phase::Connected).await;
    (alice, bob, store)
}

async fn wait_for_phase(rx: &mut watch::Receiver<Phase>, wanted: Phase) {
    tokio::time::timeout(Duration::from_secs(8), async {
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

async fn next_matching<T>(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut pick: impl FnMut(SessionEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(8), async {
        while let Some(event) = events.recv().await {
            if let Some(found) = pick(event) {
                return found;
            }
        }
        panic!("event stream ended early");
    })
    .await
    .expect("timed out waiting for a session event")
}

#[tokio::test]
async fn test_chat_round_trip_preserves_unicode() {
    let (alice, mut bob, _store) = connected_pair("ROOM-C").await;

    alice.core.send_chat("hello 你好").await.unwrap();
    let text = next_matching(&mut bob.events, |event| match event {
        SessionEvent::Chat { text } => Some(text),
        _ => None,
    })
    .await;
    assert_eq!(text, "hello 你好");

    // And the other direction.
    bob.core.send_chat("back at you 🌙").await.unwrap();
    let mut alice_events = alice.events;
    let reply = next_matching(&mut alice_events, |event| match event {
        SessionEvent::Chat { text } => Some(text),
        _ => None,
    })
    .await;
    assert_eq!(reply, "back at you 🌙");
}

#[tokio::test]
async fn test_file_transfer_end_to_end() {
    let (alice, mut bob, _store) = connected_pair("FILES-1").await;

    let mut payload = vec![0u8; 1024 * 1024 + 17];
    rand::thread_rng().fill_bytes(&mut payload);

    alice
        .core
        .send_file("photo.jpg", "image/jpeg", &payload)
        .await
        .unwrap();

    let mut progress = Vec::new();
    let file = tokio::time::timeout(Duration::from_secs(8), async {
        loop {
            match bob.events.recv().await.expect("event stream ended") {
                SessionEvent::FileProgress { received, .. } => progress.push(received),
                SessionEvent::FileReceived(file) => return file,
                SessionEvent::FileAborted { .. } => panic!("transfer aborted"),
                _ => {}
            }
        }
    })
    .await
    .expect("file never arrived");

    assert_eq!(file.name, "photo.jpg");
    assert_eq!(file.mime_type, "image/jpeg");
    assert_eq!(file.bytes, payload);

    // Receiver progress is monotonically non-decreasing and reaches 100%.
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last().copied(), Some(payload.len() as u64));
}

#[tokio::test]
async fn test_only_one_outbound_transfer_at_a_time() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();
    let alice_factory = Arc::new(LoopbackFactory::new(network.clone()));

    let (a_core, mut a_phase, _a_events) = SessionCore::start(
        SessionConfig::new("BUSY-1", "hunter2", "Alice"),
        SessionSlot::new(),
        store.clone(),
        alice_factory.clone(),
        Arc::new(SyntheticPipeline::new()),
    )
    .expect("alice should start");
    let (_b_core, mut b_phase, mut b_events) = SessionCore::start(
        SessionConfig::new("BUSY-1", "hunter2", "Bob"),
        SessionSlot::new(),
        store,
        Arc::new(LoopbackFactory::new(network)),
        Arc::new(SyntheticPipeline::new()),
    )
    .expect("bob should start");
    wait_for_phase(&mut a_phase, Phase::Connected).await;
    wait_for_phase(&mut b_phase, Phase::Connected).await;

    // Pin Alice's outbound delivery so the first transfer stalls on the
    // backpressure threshold and stays in flight.
    let channel = alice_factory
        .last_connection()
        .expect("alice has a live transport")
        .loopback_channel();
    channel.set_paused(true);

    let alice = a_core;
    let big = vec![3u8; 4 * 1024 * 1024];
    let first = {
        let alice = alice.clone();
        tokio::spawn(
            async move { alice.send_file("a.bin", "application/octet-stream", &big).await },
        )
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while channel.buffered_amount() < 1024 * 1024 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first transfer never reached the threshold");

    // While the first streams, a second request is refused locally.
    let second = alice.send_file("b.bin", "text/plain", b"tiny").await;
    assert!(matches!(second, Err(SessionError::TransferBusy)));

    channel.set_paused(false);
    first.await.unwrap().unwrap();
    let file = next_matching(&mut b_events, |event| match event {
        SessionEvent::FileReceived(file) => Some(file),
        _ => None,
    })
    .await;
    assert_eq!(file.name, "a.bin");
    assert_eq!(file.bytes.len(), 4 * 1024 * 1024);
}

#[tokio::test]
async fn test_privacy_update_drives_remote_flags() {
    let (alice, mut bob, _store) = connected_pair("MUTE-1").await;

    alice.core.set_muted(true).await.unwrap();
    let participant = next_matching(&mut bob.events, |event| match event {
        SessionEvent::RemoteParticipant(p) if !p.audio_enabled => Some(p),
        _ => None,
    })
    .await;
    assert!(!participant.audio_enabled);
    assert!(participant.video_enabled);

    alice.core.set_muted(false).await.unwrap();
    let participant = next_matching(&mut bob.events, |event| match event {
        SessionEvent::RemoteParticipant(p) if p.audio_enabled => Some(p),
        _ => None,
    })
    .await;
    assert!(participant.audio_enabled);
}

#[tokio::test]
async fn test_termination_propagates_before_the_channel_closes() {
    let (alice, mut bob, store) = connected_pair("BYE-1").await;
    let mut alice_events = alice.events;

    alice.core.exit();

    // Both sides finish cleanly; the peer is told rather than abandoned.
    next_matching(&mut alice_events, |event| match event {
        SessionEvent::Terminated => Some(()),
        _ => None,
    })
    .await;
    next_matching(&mut bob.events, |event| match event {
        SessionEvent::Terminated => Some(()),
        _ => None,
    })
    .await;

    assert_eq!(*bob.phase.borrow(), Phase::Idle);
    assert_eq!(store.room_count().await, 0);

    // No reconnect loop: the room stays empty afterwards.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.room_count().await, 0);
}

#[tokio::test]
async fn test_renegotiation_is_initiator_only_and_throttled() {
    let (alice, bob, _store) = connected_pair("NEGO-1").await;

    // Exactly one side won the initiator role.
    let alice_first = alice.core.request_renegotiation().await;
    let bob_first = bob.core.request_renegotiation().await;
    assert!(alice_first ^ bob_first, "only the initiator renegotiates");

    // A second request inside the throttle window is refused.
    let initiator = if alice_first { alice.core } else { bob.core };
    assert!(!initiator.request_renegotiation().await);
}

#[tokio::test]
async fn test_session_slot_rejects_a_second_concurrent_session() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();
    let slot = SessionSlot::new();

    let (_first, _phase, _events) = SessionCore::start(
        SessionConfig::new("SOLO-1", "hunter2", "Alice"),
        slot.clone(),
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
        Arc::new(SyntheticPipeline::new()),
    )
    .expect("first session should start");

    let second = SessionCore::start(
        SessionConfig::new("SOLO-2", "hunter2", "Alice"),
        slot,
        store,
        Arc::new(LoopbackFactory::new(network)),
        Arc::new(SyntheticPipeline::new()),
    );
    assert!(matches!(second, Err(SessionError::AlreadyActive)));
}

#[tokio::test]
async fn test_media_denial_is_terminal() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();

    let (_core, mut phase, _events) = SessionCore::start(
        SessionConfig::new("NOCAM-1", "hunter2", "Alice"),
        SessionSlot::new(),
        store.clone(),
        Arc::new(LoopbackFactory::new(network)),
        Arc::new(SyntheticPipeline::denied()),
    )
    .expect("core should start even when media will fail");

    wait_for_phase(&mut phase, Phase::MediaError).await;
    assert_eq!(store.room_count().await, 0, "no row claimed without media");
}

#[tokio::test]
async fn test_busy_camera_falls_back_to_audio_only() {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();

    let (core, mut phase, _events) = SessionCore::start(
        SessionConfig::new("AUDIO-1", "hunter2", "Alice"),
        SessionSlot::new(),
        store.clone(),
        Arc::new(LoopbackFactory::new(network)),
        Arc::new(SyntheticPipeline::video_busy()),
    )
    .expect("core should start");

    wait_for_phase(&mut phase, Phase::Preparing).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let local = core.local_participant();
            if local.stream.is_some() {
                assert!(!local.video_enabled, "fallback stream must be audio-only");
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("media was never acquired");
}
