//! Data-channel wire frames.
//!
//! Text frames are JSON objects tagged by `type`; binary frames are opaque
//! encrypted file chunks framed as `nonce[12] ‖ ciphertext` with no further
//! sub-framing. The channel is ordered+reliable, so frame order is message
//! order.

use crate::crypto::NONCE_LEN;
use crate::types::PrivacyMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("binary frame shorter than nonce ({0} bytes)")]
    Truncated(usize),
}

/// JSON frames exchanged over the data channel.
///
/// Unknown `type` values must be tolerated by receivers (forward
/// compatibility), which is why inbound parsing goes through
/// [`Frame::decode`] instead of bare serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Authenticated-encrypted UTF-8 chat message.
    #[serde(rename = "chat")]
    Chat { data: String, iv: String },

    /// Encrypted introduction carrying the sender's display name. Sent as
    /// the first frame after connection; doubling as the proof that both
    /// sides derived the same key.
    #[serde(rename = "peer-info")]
    PeerInfo { data: String, iv: String },

    /// Peer's current privacy mode; drives the remote participant's
    /// display flags.
    #[serde(rename = "privacy-update", rename_all = "camelCase")]
    PrivacyUpdate {
        filter: PrivacyMode,
        audio_enabled: bool,
        video_enabled: bool,
    },

    /// Declaration that a file transfer is beginning.
    #[serde(rename = "file-meta", rename_all = "camelCase")]
    FileMeta {
        id: String,
        name: String,
        size: u64,
        mime_type: String,
    },

    /// Sender canceled a transfer mid-stream.
    #[serde(rename = "file-abort")]
    FileAbort { id: String },

    /// Peer requested orderly teardown.
    #[serde(rename = "session-terminate")]
    SessionTerminate,
}

impl Frame {
    pub fn command(&self) -> &'static str {
        match self {
            Frame::Chat { .. } => "chat",
            Frame::PeerInfo { .. } => "peer-info",
            Frame::PrivacyUpdate { .. } => "privacy-update",
            Frame::FileMeta { .. } => "file-meta",
            Frame::FileAbort { .. } => "file-abort",
            Frame::SessionTerminate => "session-terminate",
        }
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an inbound text frame. Unknown types and malformed JSON are
    /// logged and dropped rather than surfaced as errors.
    pub fn decode(text: &str) -> Option<Frame> {
        match serde_json::from_str::<Frame>(text) {
            Ok(frame) => Some(frame),
            Err(_) => {
                match serde_json::from_str::<serde_json::Value>(text) {
                    Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
                        Some(kind) => debug!(kind, "ignoring unknown frame type"),
                        None => warn!("dropping untagged text frame"),
                    },
                    Err(err) => warn!(%err, "dropping unparseable text frame"),
                }
                None
            }
        }
    }
}

/// Assemble an on-wire binary frame: `nonce ‖ ciphertext`.
pub fn encode_chunk(nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    frame.extend_from_slice(nonce);
    frame.extend_from_slice(ciphertext);
    frame
}

/// Split an inbound binary frame into (nonce, ciphertext).
pub fn split_chunk(frame: &[u8]) -> Result<(&[u8], &[u8]), FrameError> {
    if frame.len() < NONCE_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    Ok(frame.split_at(NONCE_LEN))
}
