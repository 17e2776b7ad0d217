//! Transport error kinds, their classification, and the room-level error.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, RoomId};
use crate::status::StatusOrderError;

/// Error kinds a transport reports to the core.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    BrowserIncompatible,
    Disconnected,
    InvalidId,
    InvalidKey,
    Network,
    PeerUnavailable,
    SslUnavailable,
    ServerError,
    SocketError,
    SocketClosed,
    UnavailableId,
    #[serde(rename = "webrtc")]
    WebRtc,
}

/// How the establisher reacts to an error kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorClass {
    /// Abort immediately, no retry.
    Fatal,
    /// Back off and retry, bounded.
    Retryable,
    /// Not decided here; propagated unchanged to the caller.
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BrowserIncompatible => "browser-incompatible",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::InvalidId => "invalid-id",
            ErrorKind::InvalidKey => "invalid-key",
            ErrorKind::Network => "network",
            ErrorKind::PeerUnavailable => "peer-unavailable",
            ErrorKind::SslUnavailable => "ssl-unavailable",
            ErrorKind::ServerError => "server-error",
            ErrorKind::SocketError => "socket-error",
            ErrorKind::SocketClosed => "socket-closed",
            ErrorKind::UnavailableId => "unavailable-id",
            ErrorKind::WebRtc => "webrtc",
        }
    }

    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::BrowserIncompatible
            | ErrorKind::InvalidId
            | ErrorKind::InvalidKey
            | ErrorKind::SslUnavailable
            | ErrorKind::ServerError
            | ErrorKind::SocketError
            | ErrorKind::SocketClosed
            | ErrorKind::UnavailableId => ErrorClass::Fatal,
            ErrorKind::Network | ErrorKind::WebRtc => ErrorClass::Retryable,
            ErrorKind::PeerUnavailable | ErrorKind::Disconnected => ErrorClass::Other,
        }
    }

    pub fn is_fatal(self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced by a transport endpoint.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Terminal error observed by a room's caller.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RoomError {
    #[error("transport error ({0})")]
    Transport(#[from] TransportError),
    #[error("connection from {from} to {to} timed out")]
    ConnectTimeout { from: PeerId, to: PeerId },
    #[error("endpoint {id} failed to open after {attempts} attempts")]
    RetriesExhausted { id: PeerId, attempts: u32 },
    #[error("room {room} unavailable after {cycles} election cycles")]
    RoomUnavailable { room: RoomId, cycles: u32 },
    #[error("members cannot reconnect")]
    CannotReconnect,
    #[error(transparent)]
    Status(#[from] StatusOrderError),
    #[error("room is closed")]
    Closed,
}

impl RoomError {
    /// Short machine-readable kind, e.g. `"unavailable-id"` or `"timeout"`.
    pub fn kind(&self) -> &'static str {
        match self {
            RoomError::Transport(e) => e.kind.as_str(),
            RoomError::ConnectTimeout { .. } => "timeout",
            RoomError::RetriesExhausted { .. } => "retries-exhausted",
            RoomError::RoomUnavailable { .. } => "room-unavailable",
            RoomError::CannotReconnect => "cannot-reconnect",
            RoomError::Status(_) => "status-order",
            RoomError::Closed => "closed",
        }
    }

    /// The transport error kind, if this error came from the transport.
    pub fn transport_kind(&self) -> Option<ErrorKind> {
        match self {
            RoomError::Transport(e) => Some(e.kind),
            _ => None,
        }
    }
}
