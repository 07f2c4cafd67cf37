//! Core identifiers and session configuration.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Room identifier, case-normalized to uppercase.
///
/// The room id doubles as the key-derivation salt, so normalization must
/// happen before any crypto: "alpha-1" and "ALPHA-1" are the same room and
/// must derive the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 128-bit random peer identifier.
///
/// Generated once per session-core lifetime (the browser-tab analogue) and
/// stable across reconnect attempts within it. A new core is a new peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Short prefix for logging.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Shared-secret passphrase. Never persisted, never transmitted, never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(..)")
    }
}

/// Privacy mode applied to outbound video by the external media pipeline
/// and mirrored to the peer via privacy-update frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMode {
    None,
    Blur,
    Mosaic,
    Black,
}

/// Signaling role elected against the room record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Writes the offer; owns the data channel and renegotiation.
    Initiator,
    /// Claims the receiver slot and writes the answer.
    Receiver,
}

/// Immutable per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room: RoomId,
    pub passphrase: Passphrase,
    pub display_name: String,
    pub privacy: PrivacyMode,
    pub recording_protection: bool,
    pub ephemeral: bool,
}

impl SessionConfig {
    pub fn new(room: &str, passphrase: &str, display_name: &str) -> Self {
        Self {
            room: RoomId::new(room),
            passphrase: Passphrase::new(passphrase),
            display_name: display_name.to_string(),
            privacy: PrivacyMode::None,
            recording_protection: false,
            ephemeral: false,
        }
    }

    /// Entry via magic link: generated guest name, privacy mode `none`.
    pub fn from_magic_link(link: &MagicLink) -> Self {
        Self::new(&link.room, &link.passphrase, &guest_name())
    }
}

/// Room and passphrase carried in a magic-link URL fragment.
///
/// This is the only surface that transports a passphrase in-band; callers
/// must treat the link itself as an out-of-band share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicLink {
    pub room: String,
    pub passphrase: String,
}

/// Parse a `room=<id>&pass=<passphrase>` URL fragment.
///
/// Returns `None` unless both keys are present and non-empty. Values are
/// percent-decoded just enough for the characters a share link produces
/// (`%20` and `+` for spaces).
pub fn parse_magic_link(fragment: &str) -> Option<MagicLink> {
    let fragment = fragment.strip_prefix('#').unwrap_or(fragment);
    let mut room = None;
    let mut passphrase = None;

    for pair in fragment.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.replace('+', " ").replace("%20", " ");
        match key {
            "room" => room = Some(value),
            "pass" => passphrase = Some(value),
            _ => {}
        }
    }

    match (room, passphrase) {
        (Some(room), Some(passphrase)) if !room.is_empty() && !passphrase.is_empty() => {
            Some(MagicLink { room, passphrase })
        }
        _ => None,
    }
}

/// Display name for magic-link guests.
pub fn guest_name() -> String {
    format!("Guest-{:04}", OsRng.next_u32() % 10_000)
}

/// One side of the participant view: display name, privacy flags, and the
/// attached media stream if any.
///
/// The remote participant's flags are driven solely by inbound
/// privacy-update frames, never inferred from the transport.
#[derive(Debug, Clone)]
pub struct Participant {
    pub display_name: String,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub stream: Option<crate::media::MediaStream>,
}

impl Participant {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            audio_enabled: true,
            video_enabled: true,
            stream: None,
        }
    }
}
