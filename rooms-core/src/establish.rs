//! Connection establisher: brings up an endpoint under a given identity and
//! opens a data connection to a remote peer, with bounded retries.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::RoomConfig;
use crate::error::{ErrorClass, ErrorKind, RoomError, TransportError};
use crate::identity::PeerId;
use crate::transport::{
    Connection, ConnectionEvent, ConnectionEvents, Endpoint, EndpointEvent, EndpointEvents,
    Transport,
};

/// An endpoint whose identity is registered, together with its event stream.
pub struct Established {
    pub endpoint: Arc<dyn Endpoint>,
    pub events: EndpointEvents,
}

/// Create an endpoint named `id` and wait until it opens.
///
/// Attempt `n` waits at most `open_timeout(n)`. Timeouts and retryable errors
/// (network, webrtc) destroy the endpoint and retry, the latter after
/// `create_retry_delay(n)`. Every other error is returned unchanged.
pub async fn establish_self(
    transport: &dyn Transport,
    id: &PeerId,
    config: &RoomConfig,
) -> Result<Established, RoomError> {
    let mut attempt: u32 = 0;
    loop {
        let (endpoint, mut events) = transport.create_endpoint(id);
        let window = config.open_timeout(attempt);
        match time::timeout(window, wait_open(&mut events)).await {
            Ok(Ok(())) => {
                tracing::debug!(peer = %id, attempt, "endpoint open");
                return Ok(Established { endpoint, events });
            }
            Ok(Err(e)) => {
                endpoint.destroy();
                if e.kind.class() != ErrorClass::Retryable {
                    tracing::debug!(peer = %id, error = %e, "endpoint failed");
                    return Err(e.into());
                }
                if attempt >= config.create_retry_limit {
                    return Err(RoomError::RetriesExhausted {
                        id: id.clone(),
                        attempts: attempt + 1,
                    });
                }
                let delay = config.create_retry_delay(attempt);
                tracing::warn!(peer = %id, error = %e, ?delay, "endpoint error, retrying");
                time::sleep(delay).await;
            }
            Err(_) => {
                endpoint.destroy();
                if attempt >= config.create_retry_limit {
                    return Err(RoomError::RetriesExhausted {
                        id: id.clone(),
                        attempts: attempt + 1,
                    });
                }
                tracing::warn!(peer = %id, ?window, "endpoint open timed out, retrying");
            }
        }
        attempt += 1;
    }
}

async fn wait_open(events: &mut EndpointEvents) -> Result<(), TransportError> {
    while let Some(event) = events.recv().await {
        match event {
            EndpointEvent::Open => return Ok(()),
            EndpointEvent::Error(e) => return Err(e),
            EndpointEvent::Disconnected => {
                return Err(TransportError::new(
                    ErrorKind::Disconnected,
                    "endpoint disconnected before opening",
                ))
            }
            EndpointEvent::Connection(conn, _) => conn.close(),
        }
    }
    Err(TransportError::new(
        ErrorKind::Disconnected,
        "endpoint event stream ended",
    ))
}

/// In-flight connection attempts. Dropping it closes every attempt still held
/// and aborts its watcher.
#[derive(Default)]
struct Attempts {
    slots: Vec<Option<Attempt>>,
}

struct Attempt {
    connection: Arc<dyn Connection>,
    watcher: JoinHandle<()>,
}

type Opened = (usize, ConnectionEvents);

impl Attempts {
    fn launch(
        &mut self,
        endpoint: &Arc<dyn Endpoint>,
        target: &PeerId,
        opened: &mpsc::UnboundedSender<Opened>,
    ) {
        let Some((connection, mut events)) = endpoint.connect(target) else {
            tracing::debug!(to = %target, "connect folded into an in-flight attempt");
            return;
        };
        let index = self.slots.len();
        let opened = opened.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::Open => {
                        let _ = opened.send((index, events));
                        return;
                    }
                    ConnectionEvent::Close => return,
                    ConnectionEvent::Error(e) => {
                        tracing::debug!(attempt = index, error = %e, "connect attempt failed");
                        return;
                    }
                    ConnectionEvent::Data(_) => {}
                }
            }
        });
        self.slots.push(Some(Attempt {
            connection,
            watcher,
        }));
    }

    fn take(&mut self, index: usize) -> Option<Arc<dyn Connection>> {
        let attempt = self.slots.get_mut(index)?.take()?;
        attempt.watcher.abort();
        Some(attempt.connection)
    }
}

impl Drop for Attempts {
    fn drop(&mut self) {
        for attempt in self.slots.drain(..).flatten() {
            attempt.watcher.abort();
            attempt.connection.close();
        }
    }
}

/// Open a data connection from `endpoint` to `target`.
///
/// The first attempt starts immediately; further attempts start at
/// `connect_retry_offsets()` while earlier ones stay pending. The first to open
/// wins and the rest are closed. `peer-unavailable` or a fatal endpoint error
/// ends the whole operation, as does the `connect_deadline()`.
pub async fn establish_to_peer(
    endpoint: &Arc<dyn Endpoint>,
    events: &mut EndpointEvents,
    target: &PeerId,
    config: &RoomConfig,
) -> Result<(Arc<dyn Connection>, ConnectionEvents), RoomError> {
    if endpoint.is_disconnected() {
        return Err(TransportError::new(
            ErrorKind::Disconnected,
            format!("cannot connect to {}, endpoint is disconnected", target),
        )
        .into());
    }

    let start = Instant::now();
    let deadline = start + config.connect_deadline();
    let offsets = config.connect_retry_offsets();
    let mut next_retry = 0;

    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel::<Opened>();
    let mut attempts = Attempts::default();
    attempts.launch(endpoint, target, &opened_tx);

    loop {
        let retry_at = offsets
            .get(next_retry)
            .map(|offset| start + *offset)
            .unwrap_or(deadline);

        tokio::select! {
            Some((index, conn_events)) = opened_rx.recv() => {
                if let Some(connection) = attempts.take(index) {
                    tracing::debug!(to = %target, attempt = index, "connection open");
                    return Ok((connection, conn_events));
                }
            }
            event = events.recv() => match event {
                Some(EndpointEvent::Error(e))
                    if e.kind == ErrorKind::PeerUnavailable || e.kind.is_fatal() =>
                {
                    tracing::debug!(to = %target, error = %e, "giving up on peer");
                    return Err(e.into());
                }
                Some(EndpointEvent::Error(e)) => {
                    tracing::warn!(to = %target, error = %e, "endpoint error while connecting");
                }
                Some(EndpointEvent::Connection(conn, _)) => conn.close(),
                Some(EndpointEvent::Open) => {}
                Some(EndpointEvent::Disconnected) | None => {
                    return Err(TransportError::new(
                        ErrorKind::Disconnected,
                        format!("endpoint disconnected while connecting to {}", target),
                    )
                    .into());
                }
            },
            _ = time::sleep_until(retry_at), if next_retry < offsets.len() => {
                tracing::debug!(to = %target, attempt = next_retry + 1, "issuing parallel connect attempt");
                attempts.launch(endpoint, target, &opened_tx);
                next_retry += 1;
            }
            _ = time::sleep_until(deadline) => {
                tracing::warn!(to = %target, "connection timed out");
                return Err(RoomError::ConnectTimeout {
                    from: endpoint.id().clone(),
                    to: target.clone(),
                });
            }
        }
    }
}
