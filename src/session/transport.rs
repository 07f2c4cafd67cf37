//! Transport seam: the peer connection and its single ordered data channel.
//!
//! The signaling machine drives these traits and never touches a concrete
//! transport. The in-process loopback implementation lives next door; a real
//! embedder binds them to its real-time stack and keeps the same semantics:
//! descriptions are opaque base64 blobs, the channel is ordered+reliable,
//! and `Closed`/`Failed` is a connection-lost signal, not an error return.

use crate::media::MediaStream;
use crate::types::Role;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("remote description not recognized")]
    UnknownDescription,
    #[error("operation out of order: {0}")]
    InvalidState(&'static str),
}

/// Peer-connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    /// `Closed` and `Failed` both emit connection-lost.
    pub fn is_lost(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// One inbound data-channel message.
#[derive(Debug, Clone)]
pub enum ChannelPayload {
    Text(String),
    Binary(Vec<u8>),
}

/// The ordered+reliable data channel. Created by the initiator, received by
/// the receiver; both sides install the same message handling.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    async fn send_binary(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Bytes queued locally but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    /// Resolves once `buffered_amount` drops below `low_water`. The
    /// low-water callback of the backpressure protocol.
    async fn wait_buffered_below(&self, low_water: usize);

    /// The channel's single consumer takes the inbound message stream once.
    /// The stream ends (yields `None`) when the peer side closes.
    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChannelPayload>>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// A peer connection under negotiation or in service.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach the local processed media stream before negotiation so the
    /// remote side observes it on track arrival.
    async fn attach_local(&self, stream: MediaStream);

    /// Begin local-description generation and candidate gathering as the
    /// offering side. The local description is available immediately;
    /// gathering continues in the background.
    async fn start_offer(&self) -> Result<(), TransportError>;

    /// Apply the remote description. Callers guarantee exactly-once.
    async fn apply_remote(&self, description: &str) -> Result<(), TransportError>;

    /// Begin local-description generation as the answering side. Requires a
    /// previously applied remote offer.
    async fn start_answer(&self) -> Result<(), TransportError>;

    /// Resolves when candidate gathering completes. May never resolve;
    /// callers race it against the gathering timeout and commit whatever
    /// [`PeerConnection::local_description`] holds.
    async fn wait_gathering(&self);

    async fn local_description(&self) -> Option<String>;

    /// Negotiation is stable: no offer/answer exchange in flight.
    fn is_stable(&self) -> bool;

    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Remote media stream, set on track arrival.
    fn remote_stream(&self) -> watch::Receiver<Option<MediaStream>>;

    fn data_channel(&self) -> Arc<dyn DataChannel>;

    async fn close(&self);
}

/// Builds a fresh peer connection per role election. The governor must have
/// torn the previous one down before this is called again.
pub trait TransportFactory: Send + Sync {
    fn create(&self, role: Role, ice: &IceConfig) -> Arc<dyn PeerConnection>;
}

/// One ICE server entry.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

/// Curated ICE configuration handed to the transport.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    /// STUN plus an always-available TURN relay so restrictive networks
    /// still connect.
    fn default() -> Self {
        Self {
            servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::turn(
                    "turn:openrelay.metered.ca:443?transport=tcp",
                    "openrelayproject",
                    "openrelayproject",
                ),
            ],
            candidate_pool_size: 2,
        }
    }
}
