//! Rendezvous layer: the single shared room record and the typed store
//! façade that brokers it between exactly two peers.

pub mod memory;
pub mod record;
pub mod store;

pub use memory::MemoryRendezvous;
pub use record::{CLAIMED, RoomRecord};
pub use store::{RendezvousStore, RoomEvent, RoomSubscription, StoreError};
