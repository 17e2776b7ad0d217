//! Room and peer identities, and the deterministic host identity of a room.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace of every host identity.
const HOST_ID_NAMESPACE: Uuid = Uuid::from_u128(0x0b5d37ef_71a8_4691_87f3_f380af4f27e0);

/// Opaque room identifier, stable for one collaboration session.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        RoomId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId::new(s)
    }
}

/// Name of an endpoint on the transport.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Fresh random id, used by participants.
    pub fn random() -> Self {
        PeerId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId::new(s)
    }
}

/// Derive the host identity of a room: the name-based (v5) UUID of the room
/// id in the host namespace.
pub fn host_identity(room: &RoomId) -> PeerId {
    let id = Uuid::new_v5(&HOST_ID_NAMESPACE, room.as_str().as_bytes());
    PeerId(id.hyphenated().to_string())
}
