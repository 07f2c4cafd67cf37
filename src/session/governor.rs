//! Centralized tracking of every long-lived handle a session acquires.
//!
//! The peer connection holds tasks that close over session state, and the
//! session holds the peer connection; the cycle is broken here, explicitly,
//! by closing and dropping every handle in one place instead of relying on
//! scope death. After [`ResourceGovernor::cleanup`] returns, no background
//! activity remains and a replacement transport may be constructed.

use crate::media::MediaStream;
use crate::session::transport::PeerConnection;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
pub struct ResourceGovernor {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connection: Mutex<Option<Arc<dyn PeerConnection>>>,
    local_stream: Mutex<Option<MediaStream>>,
    transfer: Mutex<Option<CancellationToken>>,
}

impl ResourceGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a spawned task (timer, watcher, listener) for abort on cleanup.
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        // Finished tasks accumulate across reconnects; drop them as we go.
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Adopt the session's peer connection. Cleanup must have run since the
    /// previous one; a replacement may not shadow a live transport.
    pub fn adopt_connection(&self, connection: Arc<dyn PeerConnection>) {
        let mut slot = self.connection.lock().unwrap();
        debug_assert!(slot.is_none(), "transport adopted over a live one");
        *slot = Some(connection);
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.connection.lock().unwrap().clone()
    }

    pub fn adopt_stream(&self, stream: MediaStream) {
        *self.local_stream.lock().unwrap() = Some(stream);
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local_stream.lock().unwrap().clone()
    }

    /// Claim the single outbound-transfer slot. `None` while a transfer is
    /// already in flight.
    pub fn begin_transfer(&self) -> Option<CancellationToken> {
        let mut slot = self.transfer.lock().unwrap();
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return None;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Some(token)
    }

    /// Release the outbound slot after the transfer settles.
    pub fn end_transfer(&self) {
        *self.transfer.lock().unwrap() = None;
    }

    /// Cancel any in-flight outbound transfer without releasing the slot;
    /// the sender observes the token and aborts at the next chunk boundary.
    pub fn cancel_transfer(&self) {
        if let Some(token) = self.transfer.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Tear down everything, idempotently:
    /// cancel the in-flight transfer, close the peer connection and its
    /// channel, stop local media tracks, and abort every tracked task
    /// (timers, watchers, the subscription listener).
    ///
    /// The connection is closed before tasks are aborted so a caller running
    /// inside a tracked task still finishes the teardown it started.
    pub async fn cleanup(&self) {
        if let Some(token) = self.transfer.lock().unwrap().take() {
            token.cancel();
        }

        let connection = self.connection.lock().unwrap().take();
        if let Some(connection) = connection {
            connection.data_channel().close().await;
            connection.close().await;
        }

        if let Some(stream) = self.local_stream.lock().unwrap().take() {
            stream.stop_all();
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let aborted = tasks.len();
        for task in tasks {
            task.abort();
        }
        if aborted > 0 {
            debug!(aborted, "session resources cleaned up");
        }
    }
}
