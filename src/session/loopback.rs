//! In-process transport wired through offer/answer tokens.
//!
//! Descriptions are opaque `lo-…` tokens registered in a shared
//! [`LoopbackNetwork`]; applying the answer on the offering side splices the
//! two endpoints' channels together. Delivery order matches send order, and
//! the close marker travels through the same queue as payloads, so a close
//! observed by the peer arrives after every frame sent before it, matching
//! the ordering contract of an ordered+reliable channel.
//!
//! Test knobs: candidate gathering can be delayed or withheld entirely, and
//! delivery can be paused to pin `buffered_amount` above the backpressure
//! threshold.

use crate::media::MediaStream;
use crate::session::transport::{
    ChannelPayload, ConnectionState, DataChannel, IceConfig, PeerConnection, TransportError,
    TransportFactory,
};
use crate::types::Role;
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tracing::trace;

/// How candidate gathering behaves on a loopback connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gathering {
    /// Complete immediately (the default).
    Immediate,
    /// Complete after a delay.
    After(Duration),
    /// Never complete; callers must hit the gathering timeout.
    Never,
}

/// Shared registry resolving description tokens to endpoints.
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: Mutex<HashMap<String, Weak<LoopbackConnection>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, token: String, conn: Weak<LoopbackConnection>) {
        self.endpoints.lock().unwrap().insert(token, conn);
    }

    fn resolve(&self, token: &str) -> Option<Arc<LoopbackConnection>> {
        self.endpoints.lock().unwrap().get(token)?.upgrade()
    }
}

fn fresh_token(kind: &str) -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    format!("lo-{kind}-{}", hex::encode(bytes))
}

enum Outgoing {
    Payload(ChannelPayload),
    Close,
}

/// One endpoint's ordered data channel.
pub struct LoopbackChannel {
    open: AtomicBool,
    buffered: AtomicUsize,
    paused: AtomicBool,
    low_water: Notify,
    pending: Mutex<VecDeque<Outgoing>>,
    /// Sender into the peer's inbox; set when the pair is wired.
    peer_inbox: Mutex<Option<mpsc::UnboundedSender<ChannelPayload>>>,
    /// The peer connection, for close propagation.
    peer_conn: Mutex<Weak<LoopbackConnection>>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<ChannelPayload>>>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelPayload>>>,
}

impl LoopbackChannel {
    fn new() -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            open: AtomicBool::new(true),
            buffered: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            low_water: Notify::new(),
            pending: Mutex::new(VecDeque::new()),
            peer_inbox: Mutex::new(None),
            peer_conn: Mutex::new(Weak::new()),
            inbox_tx: Mutex::new(Some(inbox_tx)),
            inbox_rx: Mutex::new(Some(inbox_rx)),
        })
    }

    /// Pin delivery. Queued bytes accumulate in `buffered_amount` until
    /// [`LoopbackChannel::set_paused`] releases them.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        if !paused {
            self.pump();
        }
    }

    fn enqueue(&self, item: Outgoing) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        if let Outgoing::Payload(payload) = &item {
            self.buffered
                .fetch_add(payload_len(payload), Ordering::SeqCst);
        }
        self.pending.lock().unwrap().push_back(item);
        self.pump();
        Ok(())
    }

    /// Drain the pending queue into the peer's inbox, preserving order.
    fn pump(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        let peer = self.peer_inbox.lock().unwrap().clone();
        let Some(peer) = peer else { return };

        loop {
            let item = self.pending.lock().unwrap().pop_front();
            match item {
                Some(Outgoing::Payload(payload)) => {
                    let len = payload_len(&payload);
                    // A dropped peer inbox behaves like a closed channel.
                    let _ = peer.send(payload);
                    self.buffered.fetch_sub(len, Ordering::SeqCst);
                    self.low_water.notify_waiters();
                }
                Some(Outgoing::Close) => {
                    drop(peer);
                    *self.peer_inbox.lock().unwrap() = None;
                    if let Some(remote) = self.peer_conn.lock().unwrap().upgrade() {
                        remote.remote_closed();
                    }
                    return;
                }
                None => return,
            }
        }
    }

    /// The peer side closed: end the inbound stream after whatever was
    /// already delivered.
    fn shutdown_inbound(&self) {
        self.open.store(false, Ordering::SeqCst);
        *self.inbox_tx.lock().unwrap() = None;
        *self.peer_inbox.lock().unwrap() = None;
        self.low_water.notify_waiters();
    }
}

fn payload_len(payload: &ChannelPayload) -> usize {
    match payload {
        ChannelPayload::Text(text) => text.len(),
        ChannelPayload::Binary(bytes) => bytes.len(),
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.enqueue(Outgoing::Payload(ChannelPayload::Text(text.to_string())))
    }

    async fn send_binary(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.enqueue(Outgoing::Payload(ChannelPayload::Binary(payload)))
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn wait_buffered_below(&self, low_water: usize) {
        loop {
            let notified = self.low_water.notified();
            if self.buffered.load(Ordering::SeqCst) < low_water || !self.open.load(Ordering::SeqCst)
            {
                return;
            }
            notified.await;
        }
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChannelPayload>> {
        self.inbox_rx.lock().unwrap().take()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            // Travels the queue so in-flight frames land first.
            self.pending.lock().unwrap().push_back(Outgoing::Close);
            self.paused.store(false, Ordering::SeqCst);
            self.pump();
            self.low_water.notify_waiters();
        }
    }
}

/// One peer's connection object.
pub struct LoopbackConnection {
    network: Arc<LoopbackNetwork>,
    gathering: Gathering,
    channel: Arc<LoopbackChannel>,
    state_tx: watch::Sender<ConnectionState>,
    remote_stream_tx: watch::Sender<Option<MediaStream>>,
    local_stream: Mutex<Option<MediaStream>>,
    local_desc: Mutex<Option<String>>,
    self_weak: Mutex<Weak<LoopbackConnection>>,
    gathered: Arc<Notify>,
    gathering_done: Arc<AtomicBool>,
    negotiating: AtomicBool,
    wired: AtomicBool,
}

impl LoopbackConnection {
    fn new(network: Arc<LoopbackNetwork>, gathering: Gathering) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        let (remote_stream_tx, _) = watch::channel(None);
        let conn = Arc::new(Self {
            network,
            gathering,
            channel: LoopbackChannel::new(),
            state_tx,
            remote_stream_tx,
            local_stream: Mutex::new(None),
            local_desc: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
            gathered: Arc::new(Notify::new()),
            gathering_done: Arc::new(AtomicBool::new(false)),
            negotiating: AtomicBool::new(false),
            wired: AtomicBool::new(false),
        });
        *conn.self_weak.lock().unwrap() = Arc::downgrade(&conn);
        conn
    }

    /// The endpoint's channel with its loopback-only knobs exposed.
    pub fn loopback_channel(&self) -> Arc<LoopbackChannel> {
        self.channel.clone()
    }

    fn begin_local(&self, kind: &str) -> String {
        let token = fresh_token(kind);
        *self.local_desc.lock().unwrap() = Some(token.clone());
        self.network
            .register(token.clone(), self.self_weak.lock().unwrap().clone());
        self.negotiating.store(true, Ordering::SeqCst);
        if !self.wired.load(Ordering::SeqCst) {
            self.state_tx.send_replace(ConnectionState::Connecting);
        }
        self.start_gathering();
        token
    }

    fn start_gathering(&self) {
        match self.gathering {
            Gathering::Immediate => {
                self.gathering_done.store(true, Ordering::SeqCst);
                self.gathered.notify_waiters();
            }
            Gathering::After(delay) => {
                let done = self.gathering_done.clone();
                let notify = self.gathered.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    done.store(true, Ordering::SeqCst);
                    notify.notify_waiters();
                });
            }
            Gathering::Never => {}
        }
    }

    fn wire(a: &Arc<LoopbackConnection>, b: &Arc<LoopbackConnection>) {
        {
            let a_inbox = a.channel.inbox_tx.lock().unwrap().clone();
            let b_inbox = b.channel.inbox_tx.lock().unwrap().clone();
            *a.channel.peer_inbox.lock().unwrap() = b_inbox;
            *b.channel.peer_inbox.lock().unwrap() = a_inbox;
            *a.channel.peer_conn.lock().unwrap() = Arc::downgrade(b);
            *b.channel.peer_conn.lock().unwrap() = Arc::downgrade(a);
        }

        a.remote_stream_tx
            .send_replace(b.local_stream.lock().unwrap().clone());
        b.remote_stream_tx
            .send_replace(a.local_stream.lock().unwrap().clone());

        for conn in [a, b] {
            conn.wired.store(true, Ordering::SeqCst);
            conn.negotiating.store(false, Ordering::SeqCst);
            conn.state_tx.send_replace(ConnectionState::Connected);
            conn.channel.pump();
        }
        trace!("loopback endpoints wired");
    }

    /// Called by the peer's channel once its close marker drains.
    fn remote_closed(&self) {
        self.channel.shutdown_inbound();
        self.state_tx.send_replace(ConnectionState::Closed);
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn attach_local(&self, stream: MediaStream) {
        *self.local_stream.lock().unwrap() = Some(stream);
    }

    async fn start_offer(&self) -> Result<(), TransportError> {
        self.begin_local("offer");
        if self.wired.load(Ordering::SeqCst) {
            // Renegotiation on a live pair: nothing to re-splice in-process.
            self.negotiating.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn apply_remote(&self, description: &str) -> Result<(), TransportError> {
        let remote = self
            .network
            .resolve(description)
            .ok_or(TransportError::UnknownDescription)?;
        let this = self
            .self_weak
            .lock()
            .unwrap()
            .upgrade()
            .ok_or(TransportError::InvalidState("connection dropped"))?;

        let offering = this.local_desc.lock().unwrap().is_some();
        if offering {
            // Answer applied on the offering side completes negotiation.
            LoopbackConnection::wire(&this, &remote);
        } else {
            *this.channel.peer_conn.lock().unwrap() = Arc::downgrade(&remote);
            this.state_tx.send_replace(ConnectionState::Connecting);
        }
        Ok(())
    }

    async fn start_answer(&self) -> Result<(), TransportError> {
        if self.channel.peer_conn.lock().unwrap().upgrade().is_none() {
            return Err(TransportError::InvalidState("no remote offer applied"));
        }
        self.begin_local("answer");
        Ok(())
    }

    async fn wait_gathering(&self) {
        if matches!(self.gathering, Gathering::Never) {
            // Hold forever; the caller's timeout commits what
            // `local_description` already holds.
            return std::future::pending::<()>().await;
        }
        loop {
            let notified = self.gathered.notified();
            if self.gathering_done.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    async fn local_description(&self) -> Option<String> {
        self.local_desc.lock().unwrap().clone()
    }

    fn is_stable(&self) -> bool {
        !self.negotiating.load(Ordering::SeqCst)
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn remote_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.remote_stream_tx.subscribe()
    }

    fn data_channel(&self) -> Arc<dyn DataChannel> {
        self.channel.clone()
    }

    async fn close(&self) {
        self.channel.close().await;
        self.state_tx.send_replace(ConnectionState::Closed);
    }
}

/// Construct an already-wired endpoint pair on a fresh network. The fast
/// path for channel-level tests that do not involve signaling.
pub async fn wired_pair() -> (Arc<LoopbackConnection>, Arc<LoopbackConnection>) {
    let network = LoopbackNetwork::new();
    let a = LoopbackConnection::new(network.clone(), Gathering::Immediate);
    let b = LoopbackConnection::new(network.clone(), Gathering::Immediate);

    a.start_offer().await.expect("offer");
    let offer = a.local_description().await.expect("offer description");
    b.apply_remote(&offer).await.expect("apply offer");
    b.start_answer().await.expect("answer");
    let answer = b.local_description().await.expect("answer description");
    a.apply_remote(&answer).await.expect("apply answer");
    (a, b)
}

/// Builds loopback connections against a shared network.
pub struct LoopbackFactory {
    network: Arc<LoopbackNetwork>,
    gathering: Gathering,
    last: Mutex<Option<Arc<LoopbackConnection>>>,
}

impl LoopbackFactory {
    pub fn new(network: Arc<LoopbackNetwork>) -> Self {
        Self {
            network,
            gathering: Gathering::Immediate,
            last: Mutex::new(None),
        }
    }

    pub fn with_gathering(network: Arc<LoopbackNetwork>, gathering: Gathering) -> Self {
        Self {
            network,
            gathering,
            last: Mutex::new(None),
        }
    }

    /// The most recently created connection. Lets tests reach the loopback
    /// knobs (pause, close) behind a session core.
    pub fn last_connection(&self) -> Option<Arc<LoopbackConnection>> {
        self.last.lock().unwrap().clone()
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, _role: Role, _ice: &IceConfig) -> Arc<dyn PeerConnection> {
        let connection = LoopbackConnection::new(self.network.clone(), self.gathering);
        *self.last.lock().unwrap() = Some(connection.clone());
        connection
    }
}
