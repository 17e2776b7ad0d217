//! Transport facade consumed by the core: named endpoints, data connections,
//! and their lifecycle events. Events are delivered over unbounded channels;
//! dropping a receiver releases the listener.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::TransportError;
use crate::identity::PeerId;

/// Events of an endpoint (a named peer registered with the signaling service).
pub enum EndpointEvent {
    /// The endpoint's identity is registered and usable.
    Open,
    Error(TransportError),
    /// Lost the signaling service; the endpoint cannot recover.
    Disconnected,
    /// A remote peer opened a connection to this endpoint.
    Connection(Arc<dyn Connection>, UnboundedReceiver<ConnectionEvent>),
}

impl fmt::Debug for EndpointEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointEvent::Open => f.write_str("Open"),
            EndpointEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
            EndpointEvent::Disconnected => f.write_str("Disconnected"),
            EndpointEvent::Connection(c, _) => {
                f.debug_tuple("Connection").field(&c.peer()).finish()
            }
        }
    }
}

/// Events of a single data connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open,
    Data(Vec<u8>),
    Close,
    Error(TransportError),
}

/// Receiver half of endpoint events.
pub type EndpointEvents = UnboundedReceiver<EndpointEvent>;
/// Receiver half of connection events.
pub type ConnectionEvents = UnboundedReceiver<ConnectionEvent>;

/// Creates endpoints.
pub trait Transport: Send + Sync {
    /// Start registering `id`. The outcome arrives as `Open` or `Error` on the
    /// returned events.
    fn create_endpoint(&self, id: &PeerId) -> (Arc<dyn Endpoint>, EndpointEvents);
}

/// A named peer on the transport.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &PeerId;

    /// Start a connection to `target`. Returns `None` when the transport
    /// folded the request into an existing in-flight connection.
    fn connect(&self, target: &PeerId) -> Option<(Arc<dyn Connection>, ConnectionEvents)>;

    fn is_disconnected(&self) -> bool;

    /// Release the identity and close every connection. Idempotent.
    fn destroy(&self);
}

/// One data channel to a remote peer.
pub trait Connection: Send + Sync {
    /// The remote peer.
    fn peer(&self) -> &PeerId;

    fn is_open(&self) -> bool;

    fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Close both halves. Idempotent.
    fn close(&self);
}
