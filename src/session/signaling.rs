//! Signaling state machine.
//!
//! Drives one peer from `Idle` through role election and offer/answer
//! exchange to `Connected`, over nothing but a single shared room row with
//! conditional updates and change notifications. Every mutating signaling
//! flow runs on one supervisor loop: helper tasks (listener, heartbeat,
//! watchers, timers) post commands back instead of transitioning state
//! themselves, so no two signaling coroutines ever interleave for the same
//! session.

use crate::crypto::{self, CryptoError, SessionKey};
use crate::media::{self, MediaPipeline, MediaStream};
use crate::protocol::{Frame, FrameError};
use crate::rendezvous::{RendezvousStore, RoomEvent, RoomRecord, StoreError};
use crate::session::governor::ResourceGovernor;
use crate::session::transport::{
    ChannelPayload, ConnectionState, DataChannel, IceConfig, PeerConnection, TransportFactory,
};
use crate::session::{
    ELECTION_ATTEMPTS, GATHERING_TIMEOUT, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL,
    HEARTBEAT_STRIKES, NEGOTIATION_THROTTLE, Phase, RECONNECT_DELAY, RECONNECT_DELAY_RACE,
    RECONNECT_DELAY_VISIBILITY, ROOM_FULL_EXPIRY, RPC_RETRIES, RPC_RETRY_BACKOFF, SESSION_EXPIRY,
};
use crate::transfer::{self, FileMeta, InboundAssembly, ReceivedFile, TransferError};
use crate::types::{Participant, PeerId, PrivacyMode, Role, SessionConfig};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use rand::RngCore;
use rand::rngs::OsRng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session is already active in this slot")]
    AlreadyActive,
    #[error("insecure context: strong crypto unavailable")]
    Security,
    #[error("session is not connected")]
    NotConnected,
    #[error("another outbound file transfer is in flight")]
    TransferBusy,
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Events surfaced to the embedder.
#[derive(Debug)]
pub enum SessionEvent {
    Phase(Phase),
    /// Remote participant appeared or changed (name, flags, stream).
    RemoteParticipant(Participant),
    /// Decrypted inbound chat message.
    Chat { text: String },
    FileProgress { id: String, received: u64, total: u64 },
    FileReceived(ReceivedFile),
    FileAborted { id: String },
    /// Recoverable trouble worth showing the user.
    Warning(String),
    /// The session is over; the core is inert.
    Terminated,
}

/// The tab-wide singleton slot: at most one live session core per slot.
///
/// The browser original kept peer identity and the signaling channel as
/// process globals; here the would-be globals are session fields and the
/// singleton rule is enforced by this explicit guard.
#[derive(Default)]
pub struct SessionSlot {
    active: AtomicBool,
}

impl SessionSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acquire(&self) -> bool {
        !self.active.swap(true, Ordering::SeqCst)
    }

    fn release(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

enum Command {
    Connect,
    Reconnect,
    /// A real offer appeared on the row (receiver side).
    RemoteOffer(RoomRecord),
    /// An answer appeared on the row (initiator side).
    RemoteAnswer(RoomRecord),
    Visibility { visible: bool },
    Exit { notify_peer: bool },
}

pub struct SessionCore {
    config: SessionConfig,
    peer_id: PeerId,
    key: SessionKey,
    store: Arc<dyn RendezvousStore>,
    transports: Arc<dyn TransportFactory>,
    media: Arc<dyn MediaPipeline>,
    ice: IceConfig,
    governor: ResourceGovernor,
    slot: Arc<SessionSlot>,

    events: mpsc::UnboundedSender<SessionEvent>,
    phase_tx: watch::Sender<Phase>,
    commands: mpsc::UnboundedSender<Command>,

    /// Weak self-handle for spawning tasks that close over the core.
    self_weak: std::sync::Weak<SessionCore>,

    role: Mutex<Option<Role>>,
    signaling_in_progress: AtomicBool,
    processed_offer: AtomicBool,
    processed_answer: AtomicBool,
    reconnect_pending: AtomicBool,
    exiting: AtomicBool,
    /// We hold a slot in the live row (initiator insert or receiver claim
    /// won); only then may exit delete the row.
    occupies_row: AtomicBool,
    heartbeat_strikes: AtomicU32,
    last_negotiation: Mutex<Option<Instant>>,

    /// Current outbound privacy mode; starts from the configured one.
    privacy_mode: Mutex<PrivacyMode>,
    local_participant: Mutex<Participant>,
    remote_participant: Mutex<Option<Participant>>,
    assembly: Mutex<Option<InboundAssembly>>,
}

impl SessionCore {
    /// Construct the core and begin connecting.
    ///
    /// Fails fast on an occupied slot or an insecure crypto context; every
    /// other outcome is reported through the phase watch and event stream.
    pub fn start(
        config: SessionConfig,
        slot: Arc<SessionSlot>,
        store: Arc<dyn RendezvousStore>,
        transports: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaPipeline>,
    ) -> Result<
        (
            Arc<SessionCore>,
            watch::Receiver<Phase>,
            mpsc::UnboundedReceiver<SessionEvent>,
        ),
        SessionError,
    > {
        if !slot.acquire() {
            return Err(SessionError::AlreadyActive);
        }

        let key = match SessionKey::derive(&config.passphrase, &config.room) {
            Ok(key) => key,
            Err(_) => {
                slot.release();
                return Err(SessionError::Security);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let local = Participant::new(config.display_name.clone());
        let core = Arc::new_cyclic(|self_weak| SessionCore {
            self_weak: self_weak.clone(),
            peer_id: PeerId::generate(),
            key,
            store,
            transports,
            media,
            ice: IceConfig::default(),
            governor: ResourceGovernor::new(),
            slot,
            events: events_tx,
            phase_tx,
            commands: commands_tx,
            role: Mutex::new(None),
            signaling_in_progress: AtomicBool::new(false),
            processed_offer: AtomicBool::new(false),
            processed_answer: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            occupies_row: AtomicBool::new(false),
            heartbeat_strikes: AtomicU32::new(0),
            last_negotiation: Mutex::new(None),
            privacy_mode: Mutex::new(config.privacy),
            local_participant: Mutex::new(local),
            remote_participant: Mutex::new(None),
            assembly: Mutex::new(None),
            config,
        });

        let supervisor = core.clone();
        tokio::spawn(supervisor.run(commands_rx));
        let _ = core.commands.send(Command::Connect);

        Ok((core.clone(), phase_rx, events_rx))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    pub fn role(&self) -> Option<Role> {
        *self.role.lock().unwrap()
    }

    pub fn local_participant(&self) -> Participant {
        self.local_participant.lock().unwrap().clone()
    }

    pub fn remote_participant(&self) -> Option<Participant> {
        self.remote_participant.lock().unwrap().clone()
    }

    /// Request orderly teardown: notify the peer, clean up, go inert.
    pub fn exit(&self) {
        let _ = self.commands.send(Command::Exit { notify_peer: true });
    }

    /// Tab-visibility hook. Becoming visible while disconnected but still
    /// holding a role schedules a fast reconnect.
    pub fn set_visibility(&self, visible: bool) {
        let _ = self.commands.send(Command::Visibility { visible });
    }

    // =========================================================================
    // SUPERVISOR
    // =========================================================================

    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Connect | Command::Reconnect => self.establish().await,
                Command::RemoteOffer(record) => self.handle_remote_offer(record).await,
                Command::RemoteAnswer(record) => self.handle_remote_answer(record).await,
                Command::Visibility { visible } => {
                    if visible && self.phase() != Phase::Connected && self.role().is_some() {
                        self.schedule_reconnect(RECONNECT_DELAY_VISIBILITY);
                    }
                }
                Command::Exit { notify_peer } => {
                    self.shutdown(notify_peer).await;
                    break;
                }
            }
            if self.exiting.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Guarded signaling entry. Reentry while a flow is in progress is a
    /// no-op; change-notification handlers observe the same flag.
    async fn establish(&self) {
        if self.exiting.load(Ordering::SeqCst) || self.phase().is_terminal() {
            return;
        }
        if self.signaling_in_progress.swap(true, Ordering::SeqCst) {
            debug!("signaling already in progress, ignoring reentry");
            return;
        }
        self.try_establish().await;
        self.signaling_in_progress.store(false, Ordering::SeqCst);
    }

    async fn try_establish(&self) {
        // Cleanup must complete before a replacement transport exists.
        self.governor.cleanup().await;
        self.reset_signaling_flags();
        self.set_phase(Phase::Preparing);

        // Media first: a denied pipeline is terminal regardless of the room.
        let mode = *self.privacy_mode.lock().unwrap();
        let stream =
            match media::acquire_with_fallback(self.media.as_ref(), mode).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "media pipeline failed");
                    self.set_phase(Phase::MediaError);
                    return;
                }
            };
        {
            let mut local = self.local_participant.lock().unwrap();
            local.audio_enabled = true;
            local.video_enabled = stream.has_video();
            local.stream = Some(stream.clone());
        }
        self.governor.adopt_stream(stream);

        // Subscribe before the first read so transitions happening during
        // the handshake are not missed.
        let subscription = match self.rpc_subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(%err, "could not subscribe to room notifications");
                self.emit_warning("rendezvous service unreachable");
                return;
            }
        };
        let Some(listener) = self.self_weak.upgrade() else {
            return;
        };
        self.governor.track(tokio::spawn(async move {
            let mut subscription = subscription;
            while let Some(event) = subscription.next().await {
                listener.on_room_event(event);
            }
        }));

        self.elect_role().await;
    }

    // =========================================================================
    // ROLE ELECTION
    // =========================================================================

    async fn elect_role(&self) {
        for attempt in 1..=ELECTION_ATTEMPTS {
            let record = match self.rpc_fetch().await {
                Ok(record) => record,
                Err(err) => {
                    warn!(%err, "role election read failed");
                    // The subscription stays alive; room activity retriggers.
                    self.emit_warning("rendezvous service unreachable");
                    return;
                }
            };

            match record {
                None => {
                    let claim = RoomRecord::claim(
                        self.config.room.clone(),
                        self.peer_id,
                        crypto::fingerprint(&self.config.passphrase),
                    );
                    match self.rpc_insert(claim).await {
                        Ok(true) => {
                            self.set_role(Role::Initiator);
                            self.occupies_row.store(true, Ordering::SeqCst);
                            info!(room = %self.config.room, attempt, "elected initiator");
                            if let Err(err) = self.run_initiator().await {
                                warn!(%err, "initiator handshake failed");
                                self.schedule_reconnect(RECONNECT_DELAY);
                            }
                            return;
                        }
                        Ok(false) => {
                            debug!(attempt, "insert collision, restarting election");
                            continue;
                        }
                        Err(err) => {
                            warn!(%err, "room claim failed");
                            self.emit_warning("rendezvous service unreachable");
                            return;
                        }
                    }
                }
                Some(record) if record.is_fully_occupied() => {
                    let occupant = record.occupies(self.peer_id);
                    if reclaimable(&record, self.peer_id, Utc::now()) {
                        info!(room = %self.config.room, occupant, "reclaiming stale room record");
                        if self.rpc_delete().await.is_err() {
                            self.emit_warning("rendezvous service unreachable");
                            return;
                        }
                        continue;
                    }
                    warn!(room = %self.config.room, "room is full");
                    self.set_phase(Phase::RoomFull);
                    return;
                }
                Some(record) => {
                    // Initiator-only row.
                    if record.passphrase_hash != crypto::fingerprint(&self.config.passphrase) {
                        warn!(room = %self.config.room, "passphrase fingerprint mismatch");
                        self.emit_warning("passphrase does not match this room");
                        self.set_phase(Phase::SecurityError);
                        let _ = self.commands.send(Command::Exit { notify_peer: false });
                        return;
                    }
                    if record.initiator_id == self.peer_id {
                        // Our own claim from a previous transport.
                        debug!("clearing our stale initiator row");
                        if self.rpc_delete().await.is_err() {
                            return;
                        }
                        continue;
                    }
                    self.set_role(Role::Receiver);
                    if !record.has_real_offer() {
                        // Offer still the claimed sentinel: do not advance;
                        // the listener delivers the real offer.
                        debug!("offer still claimed, waiting for notification");
                        return;
                    }
                    self.processed_offer.store(true, Ordering::SeqCst);
                    info!(room = %self.config.room, attempt, "elected receiver");
                    if let Err(err) = self.run_receiver(record).await {
                        warn!(%err, "receiver handshake failed");
                        self.schedule_reconnect(RECONNECT_DELAY);
                    }
                    return;
                }
            }
        }

        warn!("role election exhausted its attempts");
        self.emit_warning("could not join the room, retrying on room activity");
    }

    // =========================================================================
    // HANDSHAKES
    // =========================================================================

    async fn run_initiator(&self) -> Result<(), EstablishError> {
        let connection = self.build_transport(Role::Initiator).await;
        connection.start_offer().await?;
        let _ = tokio::time::timeout(GATHERING_TIMEOUT, connection.wait_gathering()).await;

        let description = connection
            .local_description()
            .await
            .ok_or(EstablishError::NoLocalDescription)?;
        let offer = BASE64.encode(description);

        let published = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.rpc_publish_offer(&offer))
            .await
            .map_err(|_| EstablishError::HandshakeTimeout)?
            .map_err(EstablishError::Store)?;
        if !published {
            // The row vanished or changed hands while we gathered.
            return Err(EstablishError::LostRow);
        }

        self.start_heartbeat();
        // The answer arrives via the room listener; processed_answer
        // guarantees it is applied exactly once.
        Ok(())
    }

    async fn run_receiver(&self, record: RoomRecord) -> Result<(), EstablishError> {
        let offer = record.offer.as_deref().ok_or(EstablishError::NoOffer)?;
        let description = decode_description(offer)?;

        let connection = self.build_transport(Role::Receiver).await;
        connection.apply_remote(&description).await?;
        connection.start_answer().await?;
        let _ = tokio::time::timeout(GATHERING_TIMEOUT, connection.wait_gathering()).await;

        let answer = BASE64.encode(
            connection
                .local_description()
                .await
                .ok_or(EstablishError::NoLocalDescription)?,
        );

        let claimed = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.rpc_claim_receiver(&answer))
            .await
            .map_err(|_| EstablishError::HandshakeTimeout)?
            .map_err(EstablishError::Store)?;
        if claimed {
            self.occupies_row.store(true, Ordering::SeqCst);
            self.set_phase(Phase::Ready);
            self.start_heartbeat();
            return Ok(());
        }

        // Zero rows affected. Either we lost the race, or our earlier
        // attempt succeeded and its ack was lost: re-read to tell apart.
        let row = self.rpc_fetch().await.map_err(EstablishError::Store)?;
        match row {
            Some(row) if row.receiver_id == Some(self.peer_id) => {
                debug!("receiver claim had already succeeded");
                self.occupies_row.store(true, Ordering::SeqCst);
                self.set_phase(Phase::Ready);
                self.start_heartbeat();
                Ok(())
            }
            _ => {
                warn!(room = %self.config.room, "lost the receiver race");
                self.set_phase(Phase::RoomFull);
                Ok(())
            }
        }
    }

    /// Construct the transport, adopt it, and hook up its watchers and the
    /// shared data-channel message handler.
    async fn build_transport(&self, role: Role) -> Arc<dyn PeerConnection> {
        let connection = self.transports.create(role, &self.ice);
        if let Some(stream) = self.governor.local_stream() {
            connection.attach_local(stream).await;
        }
        self.governor.adopt_connection(connection.clone());

        // Connection-state watcher.
        let Some(watcher) = self.self_weak.upgrade() else {
            return connection;
        };
        let mut state_rx = connection.state();
        self.governor.track(tokio::spawn(async move {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => watcher.on_transport_connected().await,
                    state if state.is_lost() => {
                        watcher.on_transport_lost();
                        return;
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        }));

        // Remote-track watcher.
        let Some(tracker) = self.self_weak.upgrade() else {
            return connection;
        };
        let mut remote_rx = connection.remote_stream();
        self.governor.track(tokio::spawn(async move {
            loop {
                let stream = remote_rx.borrow_and_update().clone();
                if let Some(stream) = stream {
                    tracker.on_remote_stream(stream);
                }
                if remote_rx.changed().await.is_err() {
                    return;
                }
            }
        }));

        // Both sides install the same message handler.
        if let Some(mut inbox) = connection.data_channel().take_receiver() {
            let Some(handler) = self.self_weak.upgrade() else {
                return connection;
            };
            self.governor.track(tokio::spawn(async move {
                while let Some(payload) = inbox.recv().await {
                    match payload {
                        ChannelPayload::Text(text) => {
                            if let Some(frame) = Frame::decode(&text) {
                                handler.handle_frame(frame);
                            }
                        }
                        ChannelPayload::Binary(bytes) => handler.handle_chunk(&bytes),
                    }
                }
            }));
        }

        connection
    }

    // =========================================================================
    // ROOM EVENTS
    // =========================================================================

    /// Change-notification callback. Read-only: anything mutating is posted
    /// to the supervisor, and skipped outright while a signaling flow holds
    /// the in-progress flag (a duplicate delivery retries it).
    fn on_room_event(&self, event: RoomEvent) {
        if self.exiting.load(Ordering::SeqCst) || self.phase().is_terminal() {
            return;
        }
        if self.signaling_in_progress.load(Ordering::SeqCst) {
            debug!("signaling in progress, deferring room event");
            return;
        }

        match event {
            RoomEvent::Inserted(record) | RoomEvent::Updated(record) => match self.role() {
                Some(Role::Initiator) => {
                    if record.initiator_id == self.peer_id
                        && record.answer.is_some()
                        && !self.processed_answer.load(Ordering::SeqCst)
                    {
                        let _ = self.commands.send(Command::RemoteAnswer(record));
                    }
                }
                Some(Role::Receiver) => {
                    if record.has_real_offer() && !self.processed_offer.load(Ordering::SeqCst) {
                        let _ = self.commands.send(Command::RemoteOffer(record));
                    }
                }
                None => {
                    // Lost or unfinished election; room activity is the
                    // retrigger the subscription is kept alive for.
                    if self.phase() == Phase::Preparing {
                        self.schedule_reconnect(RECONNECT_DELAY_RACE);
                    }
                }
            },
            RoomEvent::Deleted => {
                if self.phase() == Phase::Preparing {
                    self.schedule_reconnect(RECONNECT_DELAY_RACE);
                }
            }
        }
    }

    /// Receiver side: the real offer replaced the claimed sentinel.
    async fn handle_remote_offer(&self, record: RoomRecord) {
        if self.exiting.load(Ordering::SeqCst)
            || self.phase().is_terminal()
            || self.role() != Some(Role::Receiver)
        {
            return;
        }
        if self.processed_offer.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.signaling_in_progress.swap(true, Ordering::SeqCst) {
            self.processed_offer.store(false, Ordering::SeqCst);
            return;
        }
        if let Err(err) = self.run_receiver(record).await {
            warn!(%err, "receiver handshake failed");
            self.schedule_reconnect(RECONNECT_DELAY);
        }
        self.signaling_in_progress.store(false, Ordering::SeqCst);
    }

    /// Initiator side: apply the answer exactly once.
    async fn handle_remote_answer(&self, record: RoomRecord) {
        if self.exiting.load(Ordering::SeqCst)
            || self.phase().is_terminal()
            || self.role() != Some(Role::Initiator)
            || record.initiator_id != self.peer_id
        {
            return;
        }
        let Some(answer) = record.answer.as_deref() else {
            return;
        };
        if self.processed_answer.swap(true, Ordering::SeqCst) {
            return;
        }

        let description = match decode_description(answer) {
            Ok(description) => description,
            Err(err) => {
                warn!(%err, "discarding malformed answer");
                return;
            }
        };
        let Some(connection) = self.governor.connection() else {
            return;
        };
        match connection.apply_remote(&description).await {
            Ok(()) => {
                debug!("answer applied");
                self.set_phase(Phase::Ready);
            }
            Err(err) => {
                warn!(%err, "failed to apply answer");
                self.schedule_reconnect(RECONNECT_DELAY);
            }
        }
    }

    // =========================================================================
    // TRANSPORT EVENTS
    // =========================================================================

    async fn on_transport_connected(&self) {
        self.set_phase(Phase::Connected);
        self.heartbeat_strikes.store(0, Ordering::SeqCst);
        info!(room = %self.config.room, "peer connected");

        // Introduce ourselves and sync privacy state. The encrypted
        // introduction doubles as the first authenticated frame: a peer
        // with the wrong key can neither produce nor read it.
        if let Err(err) = self.send_peer_info().await {
            debug!(%err, "could not send introduction");
        }
        if let Err(err) = self.send_privacy_update().await {
            debug!(%err, "could not send privacy state");
        }
    }

    fn on_transport_lost(&self) {
        if self.exiting.load(Ordering::SeqCst) || self.phase().is_terminal() {
            return;
        }
        warn!(room = %self.config.room, "connection lost");
        self.emit_warning("connection lost, reconnecting");
        self.schedule_reconnect(RECONNECT_DELAY);
    }

    fn on_remote_stream(&self, stream: MediaStream) {
        self.update_remote(|remote| remote.stream = Some(stream));
    }

    // =========================================================================
    // INBOUND FRAMES
    // =========================================================================

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Chat { data, iv } => match crypto::decrypt_text(&self.key, &data, &iv) {
                Ok(text) => {
                    let _ = self.events.send(SessionEvent::Chat { text });
                }
                Err(err) => warn!(%err, "dropping undecryptable chat frame"),
            },
            Frame::PeerInfo { data, iv } => match crypto::decrypt_text(&self.key, &data, &iv) {
                Ok(name) => self.update_remote(|remote| remote.display_name = name),
                Err(err) => warn!(%err, "dropping undecryptable introduction"),
            },
            Frame::PrivacyUpdate {
                filter,
                audio_enabled,
                video_enabled,
            } => {
                debug!(?filter, audio_enabled, video_enabled, "privacy update");
                self.update_remote(|remote| {
                    remote.audio_enabled = audio_enabled;
                    remote.video_enabled = video_enabled;
                });
            }
            Frame::FileMeta {
                id,
                name,
                size,
                mime_type,
            } => {
                {
                    let mut assembly = self.assembly.lock().unwrap();
                    if let Some(previous) = assembly.take() {
                        warn!(id = previous.id(), "discarding incomplete inbound file");
                    }
                    *assembly = Some(InboundAssembly::new(FileMeta {
                        id: id.clone(),
                        name,
                        size,
                        mime_type,
                    }));
                }
                let _ = self.events.send(SessionEvent::FileProgress {
                    id,
                    received: 0,
                    total: size,
                });
            }
            Frame::FileAbort { id } => {
                let aborted = {
                    let mut assembly = self.assembly.lock().unwrap();
                    if assembly.as_ref().is_some_and(|a| a.id() == id) {
                        *assembly = None;
                        true
                    } else {
                        false
                    }
                };
                if aborted {
                    let _ = self.events.send(SessionEvent::FileAborted { id });
                }
            }
            Frame::SessionTerminate => {
                info!(room = %self.config.room, "peer requested teardown");
                let _ = self.commands.send(Command::Exit { notify_peer: false });
            }
        }
    }

    fn handle_chunk(&self, frame: &[u8]) {
        enum Outcome {
            Progress { id: String, received: u64, total: u64 },
            Done(ReceivedFile),
            Aborted(String),
            Stray,
        }

        let outcome = {
            let mut assembly = self.assembly.lock().unwrap();
            match assembly.as_mut() {
                None => Outcome::Stray,
                Some(current) => {
                    let id = current.id().to_string();
                    match current.accept_chunk(&self.key, frame) {
                        Ok(Some(file)) => {
                            *assembly = None;
                            Outcome::Done(file)
                        }
                        Ok(None) => Outcome::Progress {
                            id,
                            received: current.received(),
                            total: current.total(),
                        },
                        Err(err) => {
                            // Partial data is discarded; no resumption.
                            warn!(%err, %id, "inbound file assembly aborted");
                            *assembly = None;
                            Outcome::Aborted(id)
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Progress { id, received, total } => {
                let _ = self.events.send(SessionEvent::FileProgress {
                    id,
                    received,
                    total,
                });
            }
            Outcome::Done(file) => {
                let total = file.bytes.len() as u64;
                let _ = self.events.send(SessionEvent::FileProgress {
                    id: file.id.clone(),
                    received: total,
                    total,
                });
                let _ = self.events.send(SessionEvent::FileReceived(file));
            }
            Outcome::Aborted(id) => {
                let _ = self.events.send(SessionEvent::FileAborted { id });
            }
            Outcome::Stray => warn!("dropping file chunk without a transfer in progress"),
        }
    }

    fn update_remote(&self, apply: impl FnOnce(&mut Participant)) {
        let participant = {
            let mut remote = self.remote_participant.lock().unwrap();
            let participant = remote.get_or_insert_with(|| Participant::new(""));
            apply(participant);
            participant.clone()
        };
        let _ = self
            .events
            .send(SessionEvent::RemoteParticipant(participant));
    }

    // =========================================================================
    // OUTBOUND OPERATIONS
    // =========================================================================

    /// Encrypt and send a chat message.
    pub async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        let channel = self.open_channel()?;
        let (data, iv) = crypto::encrypt_text(&self.key, text)?;
        let frame = Frame::Chat { data, iv }.encode()?;
        channel
            .send_text(&frame)
            .await
            .map_err(|_| SessionError::NotConnected)
    }

    async fn send_peer_info(&self) -> Result<(), SessionError> {
        let channel = self.open_channel()?;
        let name = self.local_participant.lock().unwrap().display_name.clone();
        let (data, iv) = crypto::encrypt_text(&self.key, &name)?;
        let frame = Frame::PeerInfo { data, iv }.encode()?;
        channel
            .send_text(&frame)
            .await
            .map_err(|_| SessionError::NotConnected)
    }

    /// Push the local privacy state to the peer.
    pub async fn send_privacy_update(&self) -> Result<(), SessionError> {
        let channel = self.open_channel()?;
        let filter = *self.privacy_mode.lock().unwrap();
        let (audio_enabled, video_enabled) = {
            let local = self.local_participant.lock().unwrap();
            (local.audio_enabled, local.video_enabled)
        };
        let frame = Frame::PrivacyUpdate {
            filter,
            audio_enabled,
            video_enabled,
        }
        .encode()?;
        channel
            .send_text(&frame)
            .await
            .map_err(|_| SessionError::NotConnected)
    }

    /// Switch the outbound privacy mode and mirror it to the peer.
    pub async fn set_privacy_mode(&self, mode: PrivacyMode) -> Result<(), SessionError> {
        *self.privacy_mode.lock().unwrap() = mode;
        let _ = self.media.set_privacy_mode(mode).await;
        {
            let mut local = self.local_participant.lock().unwrap();
            let has_video = local.stream.as_ref().is_some_and(|s| s.has_video());
            local.video_enabled = has_video && mode != PrivacyMode::Black;
        }
        if self.phase() == Phase::Connected {
            self.send_privacy_update().await?;
        }
        Ok(())
    }

    /// Toggle the microphone and mirror the change to the peer.
    pub async fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        {
            let local = self.local_participant.lock().unwrap();
            if let Some(stream) = &local.stream {
                stream.set_audio_enabled(!muted);
            }
        }
        self.local_participant.lock().unwrap().audio_enabled = !muted;
        if self.phase() == Phase::Connected {
            self.send_privacy_update().await?;
        }
        Ok(())
    }

    /// Stream a file to the peer. Completes when the transfer settles; only
    /// one outbound transfer may be in flight per session.
    pub async fn send_file(
        &self,
        name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<(), SessionError> {
        let channel = self.open_channel()?;
        let token = self
            .governor
            .begin_transfer()
            .ok_or(SessionError::TransferBusy)?;

        let mut id_bytes = [0u8; 8];
        OsRng.fill_bytes(&mut id_bytes);
        let meta = FileMeta {
            id: hex::encode(id_bytes),
            name: name.to_string(),
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
        };

        let events = self.events.clone();
        let id = meta.id.clone();
        let total = meta.size;
        let result = transfer::send_file(
            channel.as_ref(),
            &self.key,
            &meta,
            bytes,
            &token,
            move |sent| {
                let _ = events.send(SessionEvent::FileProgress {
                    id: id.clone(),
                    received: sent,
                    total,
                });
            },
        )
        .await;
        self.governor.end_transfer();

        match result {
            Ok(()) => Ok(()),
            Err(TransferError::Canceled) | Err(TransferError::ChannelLost) => {
                let _ = self.events.send(SessionEvent::FileAborted { id: meta.id });
                Err(TransferError::Canceled.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Cancel the in-flight outbound transfer, if any. Honored at the next
    /// chunk boundary.
    pub fn cancel_file_transfer(&self) {
        self.governor.cancel_transfer();
    }

    /// Renegotiate the transport. Honored only by the initiator, only while
    /// negotiation is stable, and at most once per throttle window.
    pub async fn request_renegotiation(&self) -> bool {
        if self.role() != Some(Role::Initiator) {
            return false;
        }
        let Some(connection) = self.governor.connection() else {
            return false;
        };
        if !connection.is_stable() {
            return false;
        }
        {
            let mut last = self.last_negotiation.lock().unwrap();
            if last.is_some_and(|at| at.elapsed() < NEGOTIATION_THROTTLE) {
                return false;
            }
            *last = Some(Instant::now());
        }

        if connection.start_offer().await.is_err() {
            return false;
        }
        let _ = tokio::time::timeout(GATHERING_TIMEOUT, connection.wait_gathering()).await;
        let Some(description) = connection.local_description().await else {
            return false;
        };
        let offer = BASE64.encode(description);
        matches!(self.rpc_publish_offer(&offer).await, Ok(true))
    }

    fn open_channel(&self) -> Result<Arc<dyn DataChannel>, SessionError> {
        let connection = self
            .governor
            .connection()
            .ok_or(SessionError::NotConnected)?;
        let channel = connection.data_channel();
        if !channel.is_open() {
            return Err(SessionError::NotConnected);
        }
        Ok(channel)
    }

    // =========================================================================
    // HEARTBEAT AND RECONNECT
    // =========================================================================

    fn start_heartbeat(&self) {
        let Some(core) = self.self_weak.upgrade() else {
            return;
        };
        self.governor.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if core.exiting.load(Ordering::SeqCst) || core.phase().is_terminal() {
                    return;
                }
                let Some(role) = core.role() else { return };

                let ok = matches!(
                    core.store.touch(&core.config.room, core.peer_id, role).await,
                    Ok(true)
                );
                if ok {
                    core.heartbeat_strikes.store(0, Ordering::SeqCst);
                    continue;
                }
                let strikes = core.heartbeat_strikes.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(strikes, "heartbeat failed");
                if strikes >= HEARTBEAT_STRIKES && core.phase() == Phase::Connected {
                    core.emit_warning("lost the room record, reconnecting");
                    core.schedule_reconnect(RECONNECT_DELAY);
                    return;
                }
            }
        }));
    }

    /// Schedule at most one pending reconnect.
    fn schedule_reconnect(&self, delay: Duration) {
        if self.exiting.load(Ordering::SeqCst) || self.phase().is_terminal() {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(?delay, "reconnect scheduled");
        let Some(core) = self.self_weak.upgrade() else {
            return;
        };
        self.governor.track(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            core.reconnect_pending.store(false, Ordering::SeqCst);
            let _ = core.commands.send(Command::Reconnect);
        }));
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    async fn shutdown(&self, notify_peer: bool) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }

        if notify_peer {
            if let Some(connection) = self.governor.connection() {
                if let Ok(frame) = Frame::SessionTerminate.encode() {
                    // Delivered before the channel closes: the channel is
                    // ordered and cleanup only closes it afterwards.
                    let _ = connection.data_channel().send_text(&frame).await;
                }
            }
        }

        if self.occupies_row.swap(false, Ordering::SeqCst) {
            let _ = self.store.delete(&self.config.room).await;
        }

        self.governor.cleanup().await;
        self.reset_signaling_flags();
        *self.role.lock().unwrap() = None;
        *self.remote_participant.lock().unwrap() = None;

        if !self.phase().is_terminal() {
            self.set_phase(Phase::Idle);
        }
        let _ = self.events.send(SessionEvent::Terminated);
        self.slot.release();
        info!(room = %self.config.room, "session ended");
    }

    fn reset_signaling_flags(&self) {
        self.processed_offer.store(false, Ordering::SeqCst);
        self.processed_answer.store(false, Ordering::SeqCst);
        self.reconnect_pending.store(false, Ordering::SeqCst);
        self.heartbeat_strikes.store(0, Ordering::SeqCst);
        *self.assembly.lock().unwrap() = None;
    }

    fn set_role(&self, role: Role) {
        *self.role.lock().unwrap() = Some(role);
    }

    fn set_phase(&self, phase: Phase) {
        let changed = self.phase_tx.send_if_modified(|current| {
            if *current == phase || current.is_terminal() {
                return false;
            }
            // Ready may race the transport's own Connected signal.
            if *current == Phase::Connected && phase == Phase::Ready {
                return false;
            }
            *current = phase;
            true
        });
        if changed {
            let _ = self.events.send(SessionEvent::Phase(phase));
        }
    }

    fn emit_warning(&self, message: &str) {
        let _ = self.events.send(SessionEvent::Warning(message.to_string()));
    }

    // =========================================================================
    // STORE RPC WITH RETRY
    // =========================================================================

    async fn rpc_fetch(&self) -> Result<Option<RoomRecord>, StoreError> {
        retry(|| self.store.fetch(&self.config.room)).await
    }

    async fn rpc_insert(&self, record: RoomRecord) -> Result<bool, StoreError> {
        retry(|| self.store.insert_if_absent(record.clone())).await
    }

    async fn rpc_publish_offer(&self, offer: &str) -> Result<bool, StoreError> {
        retry(|| self.store.publish_offer(&self.config.room, self.peer_id, offer)).await
    }

    async fn rpc_claim_receiver(&self, answer: &str) -> Result<bool, StoreError> {
        retry(|| self.store.claim_receiver(&self.config.room, self.peer_id, answer)).await
    }

    async fn rpc_delete(&self) -> Result<(), StoreError> {
        retry(|| self.store.delete(&self.config.room)).await
    }

    async fn rpc_subscribe(&self) -> Result<crate::rendezvous::RoomSubscription, StoreError> {
        retry(|| self.store.subscribe(&self.config.room)).await
    }
}

/// Retry a transient store RPC with a short backoff.
async fn retry<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= RPC_RETRIES {
                    return Err(err);
                }
                debug!(%err, attempt, "store rpc failed, retrying");
                tokio::time::sleep(RPC_RETRY_BACKOFF).await;
            }
        }
    }
}

/// Whether `peer` may reclaim this fully-occupied row at `now`: occupants
/// may self-reclaim after the session-expiry horizon, anyone else only
/// after the longer room-full horizon.
pub(crate) fn reclaimable(
    record: &RoomRecord,
    peer: PeerId,
    now: chrono::DateTime<Utc>,
) -> bool {
    let horizon = if record.occupies(peer) {
        SESSION_EXPIRY
    } else {
        ROOM_FULL_EXPIRY
    };
    record.age(now) >= chrono::Duration::milliseconds(horizon.as_millis() as i64)
}

fn decode_description(encoded: &str) -> Result<String, EstablishError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| EstablishError::MalformedDescription)?;
    String::from_utf8(bytes).map_err(|_| EstablishError::MalformedDescription)
}

#[derive(Error, Debug)]
enum EstablishError {
    #[error(transparent)]
    Transport(#[from] crate::session::transport::TransportError),
    #[error("rendezvous error: {0}")]
    Store(StoreError),
    #[error("transport produced no local description")]
    NoLocalDescription,
    #[error("handshake rpc timed out")]
    HandshakeTimeout,
    #[error("room record lost during handshake")]
    LostRow,
    #[error("room record carries no offer")]
    NoOffer,
    #[error("room record carries a malformed description")]
    MalformedDescription,
}
