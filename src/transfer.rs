//! File transfer engine: chunked, per-chunk encrypted, backpressure-aware.
//!
//! Outbound streams 64 KiB plaintext chunks, each sealed with a fresh nonce
//! and framed as `nonce ‖ ciphertext`. The sender runs ahead only while the
//! channel's buffered amount stays under the 1 MiB threshold, then parks on
//! the low-water mark at half that. Inbound keeps at most one assembly per
//! channel and discards it wholesale on any authentication failure.

use crate::crypto::{CryptoError, SessionKey, decrypt_bytes, encrypt_bytes};
use crate::protocol::{Frame, FrameError, encode_chunk, split_chunk};
use crate::session::transport::{DataChannel, TransportError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Plaintext bytes per chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Buffered-amount ceiling above which the sender pauses.
pub const BUFFER_THRESHOLD: usize = 1024 * 1024;

/// Resume mark: half the threshold.
pub const BUFFER_LOW_WATER: usize = BUFFER_THRESHOLD / 2;

/// Largest file accepted for sending; checked before any frame goes out.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("file of {0} bytes exceeds the {MAX_FILE_SIZE}-byte limit")]
    TooLarge(u64),
    #[error("transfer canceled")]
    Canceled,
    #[error("data channel lost mid-transfer")]
    ChannelLost,
    #[error("chunk exceeds declared file size")]
    Overrun,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<TransportError> for TransferError {
    fn from(_: TransportError) -> Self {
        // Every transport-level send failure mid-transfer means the channel
        // is gone; the protocol treats that as cancellation.
        TransferError::ChannelLost
    }
}

/// Declared metadata for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

impl FileMeta {
    pub fn frame(&self) -> Frame {
        Frame::FileMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
        }
    }
}

/// A fully reassembled inbound file, ready to hand to the application layer.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Stream `bytes` over the channel as an encrypted chunked transfer.
///
/// `on_progress` observes the offset cursor after each chunk is handed to
/// the channel. Cancellation is honored at every chunk boundary: the next
/// send attempt emits `file-abort` and the transfer fails with `Canceled`.
/// A channel that closes mid-transfer counts as cancellation too, minus the
/// abort frame there is no longer anywhere to send.
pub async fn send_file(
    channel: &dyn DataChannel,
    key: &SessionKey,
    meta: &FileMeta,
    bytes: &[u8],
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u64) + Send,
) -> Result<(), TransferError> {
    if bytes.len() as u64 > MAX_FILE_SIZE {
        return Err(TransferError::TooLarge(bytes.len() as u64));
    }

    channel.send_text(&meta.frame().encode()?).await?;

    let mut offset = 0usize;
    while offset < bytes.len() {
        if cancel.is_cancelled() {
            abort_transfer(channel, &meta.id).await;
            return Err(TransferError::Canceled);
        }
        if !channel.is_open() {
            return Err(TransferError::ChannelLost);
        }

        if channel.buffered_amount() >= BUFFER_THRESHOLD {
            tokio::select! {
                _ = cancel.cancelled() => {
                    abort_transfer(channel, &meta.id).await;
                    return Err(TransferError::Canceled);
                }
                _ = channel.wait_buffered_below(BUFFER_LOW_WATER) => {}
            }
            if !channel.is_open() {
                return Err(TransferError::ChannelLost);
            }
        }

        let end = (offset + CHUNK_SIZE).min(bytes.len());
        let (ciphertext, nonce) = encrypt_bytes(key, &bytes[offset..end])?;
        channel.send_binary(encode_chunk(&nonce, &ciphertext)).await?;

        offset = end;
        on_progress(offset as u64);
    }

    debug!(id = %meta.id, size = bytes.len(), "file transfer sent");
    Ok(())
}

async fn abort_transfer(channel: &dyn DataChannel, id: &str) {
    if let Ok(frame) = (Frame::FileAbort { id: id.to_string() }).encode() {
        // Best effort: the channel may already be gone.
        let _ = channel.send_text(&frame).await;
    }
}

/// In-progress inbound file. At most one per channel; a new `file-meta`
/// while this is incomplete discards it.
pub struct InboundAssembly {
    meta: FileMeta,
    chunks: Vec<Vec<u8>>,
    received: u64,
}

impl InboundAssembly {
    pub fn new(meta: FileMeta) -> Self {
        Self {
            meta,
            chunks: Vec::new(),
            received: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn total(&self) -> u64 {
        self.meta.size
    }

    /// Decrypt and append one binary frame.
    ///
    /// Returns the finished file once the byte counter reaches the declared
    /// size. Any failure poisons the assembly; the caller discards it and
    /// its partial data.
    pub fn accept_chunk(
        &mut self,
        key: &SessionKey,
        frame: &[u8],
    ) -> Result<Option<ReceivedFile>, TransferError> {
        let (nonce, ciphertext) = split_chunk(frame)?;
        let plaintext = decrypt_bytes(key, ciphertext, nonce)?;

        self.received += plaintext.len() as u64;
        if self.received > self.meta.size {
            warn!(id = %self.meta.id, "inbound file overran its declared size");
            return Err(TransferError::Overrun);
        }
        self.chunks.push(plaintext);

        if self.received == self.meta.size {
            let mut bytes = Vec::with_capacity(self.meta.size as usize);
            for chunk in self.chunks.drain(..) {
                bytes.extend_from_slice(&chunk);
            }
            return Ok(Some(ReceivedFile {
                id: self.meta.id.clone(),
                name: self.meta.name.clone(),
                mime_type: self.meta.mime_type.clone(),
                bytes,
            }));
        }
        Ok(None)
    }
}
