pub mod crypto;
pub mod media;
pub mod protocol;
pub mod rendezvous;
pub mod session;
pub mod transfer;
pub mod types;

pub use crypto::{CryptoError, SessionKey, fingerprint};
pub use media::{MediaError, MediaPipeline, MediaStream, SyntheticPipeline};
pub use protocol::Frame;
pub use rendezvous::{MemoryRendezvous, RendezvousStore, RoomEvent, RoomRecord};
pub use session::{
    Phase, SessionCore, SessionError, SessionEvent, SessionSlot,
    loopback::{Gathering, LoopbackFactory, LoopbackNetwork},
};
pub use transfer::{ReceivedFile, TransferError};
pub use types::{
    MagicLink, Participant, Passphrase, PeerId, PrivacyMode, Role, RoomId, SessionConfig,
    parse_magic_link,
};
