//! Serverless shared-state rooms.
//! Peers elect a host by racing for a deterministic identity; the host relays
//! state to everyone else and a participant takes over when it disappears.

pub mod config;
pub mod election;
pub mod error;
pub mod establish;
pub mod hints;
pub mod identity;
pub mod loopback;
pub mod member;
pub mod observer;
pub mod protocol;
pub mod room;
pub mod status;
pub mod transport;
pub mod wire;

pub use config::RoomConfig;
pub use error::{ErrorClass, ErrorKind, RoomError, TransportError};
pub use hints::{FileHints, HintStore, MemoryHints};
pub use identity::{host_identity, PeerId, RoomId};
pub use loopback::LoopbackNetwork;
pub use member::{Member, MemberEvent, RoleKind};
pub use observer::{Emitter, Subscription};
pub use protocol::Payload;
pub use room::{Action, Room, RoomBuilder, RoomEvent, RoomState};
pub use status::{ConnectionStatus, StatusOrderError};
pub use transport::{Connection, ConnectionEvent, Endpoint, EndpointEvent, Transport};
pub use wire::{decode_payload, encode_payload, PayloadDecodeError, PayloadEncodeError};
