//! In-process transport: a shared signaling registry plus paired data links.
//! Used by the simulation binary and by tests; supports fault injection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::error::{ErrorKind, TransportError};
use crate::identity::PeerId;
use crate::transport::{
    Connection, ConnectionEvent, ConnectionEvents, Endpoint, EndpointEvent, EndpointEvents,
    Transport,
};

/// Handle to one in-process network. Clones share the registry.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Registry>>,
    created: Arc<AtomicU64>,
}

#[derive(Default)]
struct Registry {
    endpoints: HashMap<PeerId, Registration>,
    faults: VecDeque<ErrorKind>,
    latency: Duration,
    next_serial: u64,
}

struct Registration {
    serial: u64,
    events: UnboundedSender<EndpointEvent>,
    state: Arc<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    destroyed: AtomicBool,
    disconnected: AtomicBool,
    links: Mutex<Vec<Arc<Link>>>,
}

impl EndpointState {
    fn attach(self: &Arc<Self>, link: &Arc<Link>) {
        link.owners.lock().push(Arc::downgrade(self));
        self.links.lock().push(link.clone());
    }

    fn detach(&self, link: &Link) {
        self.links
            .lock()
            .retain(|l| !std::ptr::eq(Arc::as_ptr(l), link));
    }

    fn close_links(&self) {
        let links = std::mem::take(&mut *self.links.lock());
        for link in links {
            link.close();
        }
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to `Open` events of endpoints and connections.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Make the next endpoint creation fail with `kind`.
    pub fn fail_next_create(&self, kind: ErrorKind) {
        self.inner.lock().faults.push_back(kind);
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.inner.lock().endpoints.contains_key(id)
    }

    /// Number of endpoints created so far, including failed ones.
    pub fn endpoints_created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Deliver an endpoint error of `kind` to `id`. Returns false when `id`
    /// is not registered.
    pub fn inject_error(&self, id: &PeerId, kind: ErrorKind) -> bool {
        let events = self.inner.lock().endpoints.get(id).map(|r| r.events.clone());
        let Some(events) = events else {
            return false;
        };
        events
            .send(EndpointEvent::Error(TransportError::new(kind, "injected fault")))
            .is_ok()
    }

    /// Simulate `id` losing the signaling service: its identity is released,
    /// its links close and it receives `Disconnected`. Returns false when `id`
    /// was not registered.
    pub fn sever(&self, id: &PeerId) -> bool {
        let removed = self.inner.lock().endpoints.remove(id);
        let Some(registration) = removed else {
            return false;
        };
        tracing::debug!(peer = %id, "loopback: severing endpoint");
        registration.state.disconnected.store(true, Ordering::SeqCst);
        registration.state.close_links();
        let _ = registration.events.send(EndpointEvent::Disconnected);
        true
    }
}

impl Transport for LoopbackNetwork {
    fn create_endpoint(&self, id: &PeerId) -> (Arc<dyn Endpoint>, EndpointEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(EndpointState::default());
        self.created.fetch_add(1, Ordering::SeqCst);

        let mut registry = self.inner.lock();
        let serial = registry.next_serial;
        registry.next_serial += 1;
        let endpoint = Arc::new(LoopbackEndpoint {
            id: id.clone(),
            serial,
            network: self.clone(),
            events: tx.clone(),
            state: state.clone(),
        });

        if let Some(kind) = registry.faults.pop_front() {
            drop(registry);
            let _ = tx.send(EndpointEvent::Error(TransportError::new(
                kind,
                "injected fault",
            )));
            return (endpoint, rx);
        }
        if registry.endpoints.contains_key(id) {
            drop(registry);
            let _ = tx.send(EndpointEvent::Error(TransportError::new(
                ErrorKind::UnavailableId,
                format!("ID \"{}\" is taken", id),
            )));
            return (endpoint, rx);
        }
        registry.endpoints.insert(
            id.clone(),
            Registration {
                serial,
                events: tx.clone(),
                state: state.clone(),
            },
        );
        let latency = registry.latency;
        drop(registry);

        deliver(latency, move || {
            if !state.destroyed.load(Ordering::SeqCst) {
                let _ = tx.send(EndpointEvent::Open);
            }
        });
        (endpoint, rx)
    }
}

/// Run `f` now, or after `latency` on the current runtime.
fn deliver(latency: Duration, f: impl FnOnce() + Send + 'static) {
    if latency.is_zero() {
        f();
    } else {
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            f();
        });
    }
}

struct LoopbackEndpoint {
    id: PeerId,
    serial: u64,
    network: LoopbackNetwork,
    events: UnboundedSender<EndpointEvent>,
    state: Arc<EndpointState>,
}

impl Endpoint for LoopbackEndpoint {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn connect(&self, target: &PeerId) -> Option<(Arc<dyn Connection>, ConnectionEvents)> {
        if self.is_disconnected() {
            return None;
        }
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (target_side, latency) = {
            let registry = self.network.inner.lock();
            let side = registry
                .endpoints
                .get(target)
                .map(|r| (r.events.clone(), r.state.clone()));
            (side, registry.latency)
        };

        let Some((target_events, target_state)) = target_side else {
            let link = Arc::new(Link::new(local_tx, None));
            self.state.attach(&link);
            let _ = self.events.send(EndpointEvent::Error(TransportError::new(
                ErrorKind::PeerUnavailable,
                format!("Could not connect to peer {}", target),
            )));
            let conn = LoopbackConnection {
                link,
                side: Side::Local,
                peer: target.clone(),
            };
            return Some((Arc::new(conn), local_rx));
        };

        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link::new(local_tx, Some(remote_tx)));
        self.state.attach(&link);
        target_state.attach(&link);
        let remote = LoopbackConnection {
            link: link.clone(),
            side: Side::Remote,
            peer: self.id.clone(),
        };
        let _ = target_events.send(EndpointEvent::Connection(Arc::new(remote), remote_rx));

        let opening = link.clone();
        deliver(latency, move || opening.open());
        let local = LoopbackConnection {
            link,
            side: Side::Local,
            peer: target.clone(),
        };
        Some((Arc::new(local), local_rx))
    }

    fn is_disconnected(&self) -> bool {
        self.state.destroyed.load(Ordering::SeqCst) || self.state.disconnected.load(Ordering::SeqCst)
    }

    fn destroy(&self) {
        if self.state.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut registry = self.network.inner.lock();
            if registry.endpoints.get(&self.id).map(|r| r.serial) == Some(self.serial) {
                registry.endpoints.remove(&self.id);
            }
        }
        self.state.close_links();
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// The half returned to the connecting endpoint.
    Local,
    /// The half delivered to the target endpoint.
    Remote,
}

/// Both halves of one data channel.
struct Link {
    open: AtomicBool,
    closed: AtomicBool,
    local: UnboundedSender<ConnectionEvent>,
    remote: Option<UnboundedSender<ConnectionEvent>>,
    /// Endpoints listing this link; it leaves their lists on close.
    owners: Mutex<Vec<Weak<EndpointState>>>,
}

impl Link {
    fn new(
        local: UnboundedSender<ConnectionEvent>,
        remote: Option<UnboundedSender<ConnectionEvent>>,
    ) -> Self {
        Self {
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            local,
            remote,
            owners: Mutex::new(Vec::new()),
        }
    }

    fn open(&self) {
        if self.closed.load(Ordering::SeqCst) || self.remote.is_none() {
            return;
        }
        self.open.store(true, Ordering::SeqCst);
        let _ = self.local.send(ConnectionEvent::Open);
        if let Some(remote) = &self.remote {
            let _ = remote.send(ConnectionEvent::Open);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.local.send(ConnectionEvent::Close);
        if let Some(remote) = &self.remote {
            let _ = remote.send(ConnectionEvent::Close);
        }
        let owners = std::mem::take(&mut *self.owners.lock());
        for owner in owners.iter().filter_map(Weak::upgrade) {
            owner.detach(self);
        }
    }

    fn towards(&self, from: Side) -> Option<&UnboundedSender<ConnectionEvent>> {
        match from {
            Side::Local => self.remote.as_ref(),
            Side::Remote => Some(&self.local),
        }
    }
}

struct LoopbackConnection {
    link: Arc<Link>,
    side: Side,
    peer: PeerId,
}

impl Connection for LoopbackConnection {
    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::new(
                ErrorKind::Disconnected,
                format!("connection to {} is not open", self.peer),
            ));
        }
        self.link
            .towards(self.side)
            .and_then(|tx| tx.send(ConnectionEvent::Data(data)).ok())
            .ok_or_else(|| {
                TransportError::new(ErrorKind::Network, format!("{} went away", self.peer))
            })
    }

    fn close(&self) {
        self.link.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PeerId {
        PeerId::new(s)
    }

    fn live_links(net: &LoopbackNetwork, id: &PeerId) -> usize {
        net.inner
            .lock()
            .endpoints
            .get(id)
            .map_or(0, |r| r.state.links.lock().len())
    }

    #[tokio::test]
    async fn endpoint_opens_and_claims_identity() {
        let net = LoopbackNetwork::new();
        let (_ep, mut events) = net.create_endpoint(&pid("a"));
        assert!(matches!(events.recv().await, Some(EndpointEvent::Open)));
        assert!(net.is_registered(&pid("a")));
    }

    #[tokio::test]
    async fn second_claim_is_unavailable_id() {
        let net = LoopbackNetwork::new();
        let (_a, _ea) = net.create_endpoint(&pid("a"));
        let (b, mut eb) = net.create_endpoint(&pid("a"));
        match eb.recv().await {
            Some(EndpointEvent::Error(e)) => assert_eq!(e.kind, ErrorKind::UnavailableId),
            other => panic!("expected error, got {other:?}"),
        }
        // The loser's destroy must not release the winner's identity.
        b.destroy();
        assert!(net.is_registered(&pid("a")));
    }

    #[tokio::test]
    async fn injected_fault() {
        let net = LoopbackNetwork::new();
        net.fail_next_create(ErrorKind::Network);
        let (_a, mut ea) = net.create_endpoint(&pid("a"));
        match ea.recv().await {
            Some(EndpointEvent::Error(e)) => assert_eq!(e.kind, ErrorKind::Network),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(!net.is_registered(&pid("a")));
    }

    #[tokio::test]
    async fn connect_and_exchange_data() {
        let net = LoopbackNetwork::new();
        let (host, mut host_events) = net.create_endpoint(&pid("host"));
        let (guest, _guest_events) = net.create_endpoint(&pid("guest"));
        assert!(matches!(host_events.recv().await, Some(EndpointEvent::Open)));

        let (conn, mut conn_events) = guest.connect(&pid("host")).unwrap();
        assert_eq!(conn_events.recv().await, Some(ConnectionEvent::Open));

        let (inbound, mut inbound_events) = match host_events.recv().await {
            Some(EndpointEvent::Connection(c, rx)) => (c, rx),
            other => panic!("expected connection, got {other:?}"),
        };
        assert_eq!(inbound.peer(), &pid("guest"));
        assert_eq!(inbound_events.recv().await, Some(ConnectionEvent::Open));

        conn.send(b"hi".to_vec()).unwrap();
        assert_eq!(
            inbound_events.recv().await,
            Some(ConnectionEvent::Data(b"hi".to_vec()))
        );
        inbound.send(b"yo".to_vec()).unwrap();
        assert_eq!(
            conn_events.recv().await,
            Some(ConnectionEvent::Data(b"yo".to_vec()))
        );

        host.destroy();
        assert_eq!(conn_events.recv().await, Some(ConnectionEvent::Close));
        assert!(conn.send(vec![1]).is_err());
    }

    #[tokio::test]
    async fn connect_to_missing_peer_reports_on_endpoint() {
        let net = LoopbackNetwork::new();
        let (guest, mut events) = net.create_endpoint(&pid("guest"));
        assert!(matches!(events.recv().await, Some(EndpointEvent::Open)));
        let (conn, _rx) = guest.connect(&pid("nobody")).unwrap();
        assert!(!conn.is_open());
        match events.recv().await {
            Some(EndpointEvent::Error(e)) => assert_eq!(e.kind, ErrorKind::PeerUnavailable),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sever_disconnects_and_frees_identity() {
        let net = LoopbackNetwork::new();
        let (host, mut host_events) = net.create_endpoint(&pid("host"));
        let (guest, _ge) = net.create_endpoint(&pid("guest"));
        let (_conn, mut conn_events) = guest.connect(&pid("host")).unwrap();
        assert_eq!(conn_events.recv().await, Some(ConnectionEvent::Open));

        assert!(net.sever(&pid("host")));
        assert!(host.is_disconnected());
        assert!(!net.is_registered(&pid("host")));
        assert_eq!(conn_events.recv().await, Some(ConnectionEvent::Close));
        let mut saw_disconnect = false;
        while let Ok(ev) = host_events.try_recv() {
            saw_disconnect |= matches!(ev, EndpointEvent::Disconnected);
        }
        assert!(saw_disconnect);
        assert!(!net.sever(&pid("host")));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_open() {
        let net = LoopbackNetwork::new();
        net.set_latency(Duration::from_millis(100));
        let (_a, mut ea) = net.create_endpoint(&pid("a"));
        assert!(ea.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(ea.try_recv(), Ok(EndpointEvent::Open)));
    }

    #[tokio::test]
    async fn closed_links_are_released() {
        let net = LoopbackNetwork::new();
        let (_host, mut host_events) = net.create_endpoint(&pid("host"));
        assert!(matches!(host_events.recv().await, Some(EndpointEvent::Open)));

        for i in 0..50 {
            let guest_id = pid(&format!("guest-{i}"));
            let (guest, _guest_events) = net.create_endpoint(&guest_id);
            let (conn, mut conn_events) = guest.connect(&pid("host")).unwrap();
            assert_eq!(conn_events.recv().await, Some(ConnectionEvent::Open));
            assert_eq!(live_links(&net, &pid("host")), 1);
            conn.close();
            assert_eq!(live_links(&net, &guest_id), 0);
            guest.destroy();
        }
        assert_eq!(live_links(&net, &pid("host")), 0);
    }

    #[tokio::test]
    async fn failed_attempts_are_released_on_close() {
        let net = LoopbackNetwork::new();
        let (guest, _events) = net.create_endpoint(&pid("guest"));
        for _ in 0..10 {
            let (conn, _rx) = guest.connect(&pid("nobody")).unwrap();
            conn.close();
        }
        assert_eq!(live_links(&net, &pid("guest")), 0);
    }

    #[tokio::test]
    async fn injected_endpoint_error() {
        let net = LoopbackNetwork::new();
        let (_a, mut ea) = net.create_endpoint(&pid("a"));
        assert!(matches!(ea.recv().await, Some(EndpointEvent::Open)));
        assert!(net.inject_error(&pid("a"), ErrorKind::SocketError));
        match ea.recv().await {
            Some(EndpointEvent::Error(e)) => assert_eq!(e.kind, ErrorKind::SocketError),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(!net.inject_error(&pid("missing"), ErrorKind::SocketError));
    }
}
