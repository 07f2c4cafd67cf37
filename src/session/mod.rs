//! Session core: signaling state machine, transport seam, resource governor.

pub mod governor;
pub mod loopback;
pub mod signaling;
pub mod transport;

pub use governor::ResourceGovernor;
pub use loopback::{Gathering, LoopbackFactory, LoopbackNetwork};
pub use signaling::{SessionCore, SessionError, SessionEvent, SessionSlot};
pub use transport::{
    ChannelPayload, ConnectionState, DataChannel, IceConfig, IceServer, PeerConnection,
    TransportError, TransportFactory,
};

use std::time::Duration;

// =============================================================================
// TIMING CONSTANTS
// =============================================================================
// Tests depend on these exact values; change them only with the wire peers.

/// Heartbeat interval while occupying a room slot.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive heartbeat failures tolerated while connected before a
/// reconnect is scheduled.
pub const HEARTBEAT_STRIKES: u32 = 3;

/// Hard cap on ICE candidate gathering. When it elapses the current local
/// description is committed regardless of candidate completeness.
pub const GATHERING_TIMEOUT: Duration = Duration::from_secs(4);

/// Hard cap on a handshake store write; falling past it schedules a
/// reconnect.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);

/// Age at which a row we occupy counts as abandoned and self-reclaimable.
pub const SESSION_EXPIRY: Duration = Duration::from_secs(8);

/// Age at which any third party may reclaim a fully-occupied row.
pub const ROOM_FULL_EXPIRY: Duration = Duration::from_secs(12);

/// Minimum spacing between honored renegotiation requests.
pub const NEGOTIATION_THROTTLE: Duration = Duration::from_secs(5);

/// Default reconnect delay.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Reconnect delay when triggered by a tab-visibility change.
pub const RECONNECT_DELAY_VISIBILITY: Duration = Duration::from_millis(500);

/// Reconnect delay after losing a signaling race.
pub const RECONNECT_DELAY_RACE: Duration = Duration::from_millis(300);

/// Role-election attempts before the entry attempt is failed.
pub const ELECTION_ATTEMPTS: u32 = 3;

/// Transient store-RPC retries within one election step.
pub const RPC_RETRIES: u32 = 3;

/// Backoff between store-RPC retries.
pub const RPC_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Session phase as surfaced to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Media acquired, role election and handshake in progress.
    Preparing,
    /// Handshake written; waiting for the transport to come up.
    Ready,
    Connected,
    // Terminal phases. Nothing recovers from these.
    SecurityError,
    MediaError,
    RoomFull,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::SecurityError | Phase::MediaError | Phase::RoomFull)
    }
}
