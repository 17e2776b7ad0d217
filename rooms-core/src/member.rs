//! A member of a room: one endpoint, its links, and a forward-only status.
//!
//! A host owns every inbound link and relays each payload it receives to all
//! of them (the sender included) plus itself. A participant owns one link to
//! the host and refuses inbound links.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::error::RoomError;
use crate::establish::{establish_self, establish_to_peer, Established};
use crate::identity::{host_identity, PeerId, RoomId};
use crate::status::{ConnectionStatus, StatusCell, StatusOrderError};
use crate::transport::{
    Connection, ConnectionEvent, ConnectionEvents, Endpoint, EndpointEvent, EndpointEvents,
    Transport,
};

/// Which identity a member claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    /// Claims the room's host identity.
    Host,
    /// Connects to the host under a random identity.
    Participant,
}

impl RoleKind {
    pub fn opposite(self) -> RoleKind {
        match self {
            RoleKind::Host => RoleKind::Participant,
            RoleKind::Participant => RoleKind::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Host => "host",
            RoleKind::Participant => "participant",
        }
    }
}

/// What a member reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberEvent {
    Status(ConnectionStatus),
    /// A payload to apply locally.
    Data(Vec<u8>),
    /// A link from `peer` opened. `first` is false when another link to the
    /// same peer was already open.
    PeerJoined { peer: PeerId, first: bool },
    /// The last link to `peer` closed.
    PeerLeft(PeerId),
}

type LinkId = u64;

/// An owned connection plus the task forwarding its events.
struct Link {
    peer: PeerId,
    connection: Arc<dyn Connection>,
    pump: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.pump.abort();
        self.connection.close();
    }
}

enum Role {
    Host {
        /// Open links.
        connections: HashMap<LinkId, Link>,
        /// Inbound links waiting for `Open`.
        joining: HashMap<LinkId, Link>,
    },
    Participant {
        host: Option<(LinkId, Link)>,
    },
}

struct WireEvent {
    link: LinkId,
    event: ConnectionEvent,
}

enum Step {
    Endpoint(Option<EndpointEvent>),
    Wire(WireEvent),
}

pub struct Member {
    transport: Arc<dyn Transport>,
    config: RoomConfig,
    kind: RoleKind,
    role: Role,
    status: StatusCell,
    did_connect: bool,
    id: Option<PeerId>,
    endpoint: Option<Arc<dyn Endpoint>>,
    endpoint_events: Option<EndpointEvents>,
    wire_tx: UnboundedSender<WireEvent>,
    wire_rx: UnboundedReceiver<WireEvent>,
    next_link: LinkId,
    pending: VecDeque<MemberEvent>,
}

impl Member {
    pub fn new(transport: Arc<dyn Transport>, kind: RoleKind, config: RoomConfig) -> Self {
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let role = match kind {
            RoleKind::Host => Role::Host {
                connections: HashMap::new(),
                joining: HashMap::new(),
            },
            RoleKind::Participant => Role::Participant { host: None },
        };
        Self {
            transport,
            config,
            kind,
            role,
            status: StatusCell::new(),
            did_connect: false,
            id: None,
            endpoint: None,
            endpoint_events: None,
            wire_tx,
            wire_rx,
            next_link: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    pub fn kind(&self) -> RoleKind {
        self.kind
    }

    pub fn is_host(&self) -> bool {
        self.kind == RoleKind::Host
    }

    /// Set once the member has been connected; never cleared.
    pub fn did_connect(&self) -> bool {
        self.did_connect
    }

    /// Identity of the live endpoint.
    pub fn id(&self) -> Option<&PeerId> {
        self.id.as_ref()
    }

    /// Number of open links (host) or 1/0 for a participant's host link.
    pub fn link_count(&self) -> usize {
        match &self.role {
            Role::Host { connections, .. } => connections.len(),
            Role::Participant { host } => usize::from(host.is_some()),
        }
    }

    /// Connect to `room` in this member's role. On failure the member is torn
    /// down and cannot be reused.
    pub async fn connect(&mut self, room: &RoomId) -> Result<(), RoomError> {
        if self.status.get() == ConnectionStatus::Disconnected {
            return Err(RoomError::CannotReconnect);
        }
        self.set_status(ConnectionStatus::Connecting)?;

        let host_id = host_identity(room);
        tracing::debug!(room = %room, role = self.kind.as_str(), host = %host_id, "member connecting");
        let result = match self.kind {
            RoleKind::Host => self.connect_as_host(&host_id).await,
            RoleKind::Participant => self.connect_as_participant(&host_id).await,
        };

        match result {
            Ok(()) => {
                self.did_connect = true;
                self.set_status(ConnectionStatus::Connected)?;
                Ok(())
            }
            Err(e) => {
                self.tear_down();
                Err(e)
            }
        }
    }

    async fn connect_as_host(&mut self, host_id: &PeerId) -> Result<(), RoomError> {
        let Established { endpoint, events } =
            establish_self(self.transport.as_ref(), host_id, &self.config).await?;
        self.install(endpoint, events);
        Ok(())
    }

    async fn connect_as_participant(&mut self, host_id: &PeerId) -> Result<(), RoomError> {
        let id = PeerId::random();
        let Established {
            endpoint,
            mut events,
        } = establish_self(self.transport.as_ref(), &id, &self.config).await?;
        match establish_to_peer(&endpoint, &mut events, host_id, &self.config).await {
            Ok((connection, conn_events)) => {
                self.install(endpoint, events);
                let (link_id, link) = self.spawn_link(connection, conn_events);
                self.role = Role::Participant {
                    host: Some((link_id, link)),
                };
                Ok(())
            }
            Err(e) => {
                endpoint.destroy();
                Err(e)
            }
        }
    }

    fn install(&mut self, endpoint: Arc<dyn Endpoint>, events: EndpointEvents) {
        self.id = Some(endpoint.id().clone());
        self.endpoint = Some(endpoint);
        self.endpoint_events = Some(events);
    }

    fn spawn_link(
        &mut self,
        connection: Arc<dyn Connection>,
        mut events: ConnectionEvents,
    ) -> (LinkId, Link) {
        let link = self.next_link;
        self.next_link += 1;
        let tx = self.wire_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let last = matches!(event, ConnectionEvent::Close | ConnectionEvent::Error(_));
                if tx.send(WireEvent { link, event }).is_err() || last {
                    return;
                }
            }
            let _ = tx.send(WireEvent {
                link,
                event: ConnectionEvent::Close,
            });
        });
        let peer = connection.peer().clone();
        (
            link,
            Link {
                peer,
                connection,
                pump,
            },
        )
    }

    fn set_status(&mut self, next: ConnectionStatus) -> Result<(), StatusOrderError> {
        if self.status.set(next)? {
            self.pending.push_back(MemberEvent::Status(next));
        }
        Ok(())
    }

    /// Send `data` to the room. Host: every open link plus local delivery.
    /// Participant: the host link. Does nothing unless connected.
    pub fn broadcast(&mut self, data: Vec<u8>) {
        if self.status.get() != ConnectionStatus::Connected {
            tracing::debug!(status = %self.status.get(), "broadcast while not connected, dropped");
            return;
        }
        match &self.role {
            Role::Host { connections, .. } => {
                for link in connections.values() {
                    if let Err(e) = link.connection.send(data.clone()) {
                        tracing::debug!(peer = %link.peer, error = %e, "relay failed");
                    }
                }
                self.pending.push_back(MemberEvent::Data(data));
            }
            Role::Participant { host } => {
                if let Some((_, link)) = host {
                    if let Err(e) = link.connection.send(data) {
                        tracing::debug!(peer = %link.peer, error = %e, "send to host failed");
                    }
                }
            }
        }
    }

    /// Send `data` to `peer` only. Returns whether any link accepted it.
    pub fn send_to(&self, peer: &PeerId, data: &[u8]) -> bool {
        let mut sent = false;
        let mut send = |link: &Link| {
            if link.peer == *peer && link.connection.is_open() {
                match link.connection.send(data.to_vec()) {
                    Ok(()) => sent = true,
                    Err(e) => tracing::debug!(peer = %peer, error = %e, "send failed"),
                }
            }
        };
        match &self.role {
            Role::Host { connections, .. } => connections.values().for_each(&mut send),
            Role::Participant { host } => {
                if let Some((_, link)) = host {
                    send(link);
                }
            }
        }
        sent
    }

    /// Next event for the owner. Returns `None` once the member is torn down
    /// and every queued event has been handed out, or when it never connected.
    /// Cancel safe.
    pub async fn next_event(&mut self) -> Option<MemberEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let endpoint_events = self.endpoint_events.as_mut()?;
            let step = tokio::select! {
                event = endpoint_events.recv() => Step::Endpoint(event),
                Some(wire) = self.wire_rx.recv() => Step::Wire(wire),
            };
            let event = match step {
                Step::Endpoint(event) => self.on_endpoint_event(event),
                Step::Wire(wire) => self.on_wire(wire),
            };
            if let Some(event) = event {
                return Some(event);
            }
        }
    }

    fn on_endpoint_event(&mut self, event: Option<EndpointEvent>) -> Option<MemberEvent> {
        match event {
            Some(EndpointEvent::Open) => {}
            Some(EndpointEvent::Error(e)) if e.kind.is_fatal() => {
                tracing::warn!(error = %e, "fatal endpoint error");
                self.tear_down();
            }
            Some(EndpointEvent::Error(e)) => {
                tracing::debug!(error = %e, "endpoint error");
            }
            Some(EndpointEvent::Disconnected) | None => {
                tracing::info!(role = self.kind.as_str(), "endpoint lost");
                self.tear_down();
            }
            Some(EndpointEvent::Connection(connection, events)) => {
                self.accept(connection, events);
            }
        }
        None
    }

    fn accept(&mut self, connection: Arc<dyn Connection>, events: ConnectionEvents) {
        if !matches!(self.role, Role::Host { .. }) {
            tracing::debug!(peer = %connection.peer(), "participant refuses inbound link");
            connection.close();
            return;
        }
        let (link_id, link) = self.spawn_link(connection, events);
        if let Role::Host { joining, .. } = &mut self.role {
            joining.insert(link_id, link);
        }
    }

    fn on_wire(&mut self, wire: WireEvent) -> Option<MemberEvent> {
        let WireEvent { link, event } = wire;
        match &mut self.role {
            Role::Host {
                connections,
                joining,
            } => match event {
                ConnectionEvent::Open => {
                    let opened = joining.remove(&link)?;
                    let peer = opened.peer.clone();
                    let first = !connections.values().any(|l| l.peer == peer);
                    connections.insert(link, opened);
                    tracing::debug!(peer = %peer, first, "link open");
                    Some(MemberEvent::PeerJoined { peer, first })
                }
                ConnectionEvent::Data(data) => {
                    if connections.contains_key(&link) {
                        self.broadcast(data);
                    }
                    None
                }
                ConnectionEvent::Close | ConnectionEvent::Error(_) => {
                    if let ConnectionEvent::Error(e) = &event {
                        tracing::debug!(error = %e, "link error");
                    }
                    joining.remove(&link);
                    let closed = connections.remove(&link)?;
                    let peer = closed.peer.clone();
                    drop(closed);
                    if connections.values().any(|l| l.peer == peer) {
                        return None;
                    }
                    tracing::debug!(peer = %peer, "peer left");
                    Some(MemberEvent::PeerLeft(peer))
                }
            },
            Role::Participant { host } => {
                if host.as_ref().map(|(id, _)| *id) != Some(link) {
                    return None;
                }
                match event {
                    ConnectionEvent::Data(data) => Some(MemberEvent::Data(data)),
                    ConnectionEvent::Open => None,
                    ConnectionEvent::Close | ConnectionEvent::Error(_) => {
                        tracing::info!("host link closed");
                        self.tear_down();
                        None
                    }
                }
            }
        }
    }

    /// Destroy the endpoint, release every link and force `Disconnected`.
    /// Idempotent.
    pub fn tear_down(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
        self.endpoint_events = None;
        match &mut self.role {
            Role::Host {
                connections,
                joining,
            } => {
                connections.clear();
                joining.clear();
            }
            Role::Participant { host } => {
                host.take();
            }
        }
        if let Ok(true) = self.status.set(ConnectionStatus::Disconnected) {
            tracing::debug!(role = self.kind.as_str(), "member torn down");
            self.pending
                .push_back(MemberEvent::Status(ConnectionStatus::Disconnected));
        }
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        self.tear_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::loopback::LoopbackNetwork;

    fn room() -> RoomId {
        RoomId::new("R1")
    }

    fn member(net: &LoopbackNetwork, kind: RoleKind) -> Member {
        Member::new(Arc::new(net.clone()), kind, RoomConfig::default())
    }

    async fn drain_until(m: &mut Member, want: impl Fn(&MemberEvent) -> bool) -> MemberEvent {
        loop {
            let event = m.next_event().await.expect("member ended");
            if want(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn host_then_participant() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.connect(&room()).await.unwrap();
        assert_eq!(host.status(), ConnectionStatus::Connected);
        assert!(host.did_connect());
        assert_eq!(host.id(), Some(&host_identity(&room())));

        let mut guest = member(&net, RoleKind::Participant);
        guest.connect(&room()).await.unwrap();
        assert!(!guest.is_host());
        assert_eq!(guest.link_count(), 1);

        let joined = drain_until(&mut host, |e| matches!(e, MemberEvent::PeerJoined { .. })).await;
        let guest_id = guest.id().unwrap().clone();
        assert_eq!(
            joined,
            MemberEvent::PeerJoined {
                peer: guest_id,
                first: true
            }
        );
    }

    #[tokio::test]
    async fn second_host_claim_fails_and_member_is_spent() {
        let net = LoopbackNetwork::new();
        let mut first = member(&net, RoleKind::Host);
        first.connect(&room()).await.unwrap();

        let mut second = member(&net, RoleKind::Host);
        let err = second.connect(&room()).await.unwrap_err();
        assert_eq!(err.transport_kind(), Some(ErrorKind::UnavailableId));
        assert_eq!(second.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            second.connect(&room()).await.unwrap_err(),
            RoomError::CannotReconnect
        );
        assert!(net.is_registered(&host_identity(&room())));
    }

    #[tokio::test]
    async fn participant_without_host_fails() {
        let net = LoopbackNetwork::new();
        let mut guest = member(&net, RoleKind::Participant);
        let err = guest.connect(&room()).await.unwrap_err();
        assert_eq!(err.transport_kind(), Some(ErrorKind::PeerUnavailable));
        assert!(!guest.did_connect());
    }

    #[tokio::test]
    async fn host_relays_to_everyone_including_sender() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.connect(&room()).await.unwrap();
        let mut a = member(&net, RoleKind::Participant);
        a.connect(&room()).await.unwrap();
        let mut b = member(&net, RoleKind::Participant);
        b.connect(&room()).await.unwrap();

        for _ in 0..2 {
            drain_until(&mut host, |e| matches!(e, MemberEvent::PeerJoined { .. })).await;
        }

        a.broadcast(b"hello".to_vec());
        let local = drain_until(&mut host, |e| matches!(e, MemberEvent::Data(_))).await;
        assert_eq!(local, MemberEvent::Data(b"hello".to_vec()));
        assert_eq!(
            drain_until(&mut a, |e| matches!(e, MemberEvent::Data(_))).await,
            MemberEvent::Data(b"hello".to_vec())
        );
        assert_eq!(
            drain_until(&mut b, |e| matches!(e, MemberEvent::Data(_))).await,
            MemberEvent::Data(b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn broadcast_before_connect_is_dropped() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.broadcast(b"early".to_vec());
        host.connect(&room()).await.unwrap();
        assert_eq!(
            host.next_event().await,
            Some(MemberEvent::Status(ConnectionStatus::Connecting))
        );
        assert_eq!(
            host.next_event().await,
            Some(MemberEvent::Status(ConnectionStatus::Connected))
        );
        host.broadcast(b"late".to_vec());
        assert_eq!(
            host.next_event().await,
            Some(MemberEvent::Data(b"late".to_vec()))
        );
    }

    #[tokio::test]
    async fn send_to_targets_one_peer() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.connect(&room()).await.unwrap();
        let mut a = member(&net, RoleKind::Participant);
        a.connect(&room()).await.unwrap();
        let a_id = a.id().unwrap().clone();
        drain_until(&mut host, |e| matches!(e, MemberEvent::PeerJoined { .. })).await;

        assert!(host.send_to(&a_id, b"catch-up"));
        assert!(!host.send_to(&PeerId::new("stranger"), b"x"));
        assert_eq!(
            drain_until(&mut a, |e| matches!(e, MemberEvent::Data(_))).await,
            MemberEvent::Data(b"catch-up".to_vec())
        );
    }

    #[tokio::test]
    async fn participant_torn_down_when_host_goes_away() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.connect(&room()).await.unwrap();
        let mut guest = member(&net, RoleKind::Participant);
        guest.connect(&room()).await.unwrap();

        host.tear_down();
        let event = drain_until(&mut guest, |e| {
            matches!(e, MemberEvent::Status(ConnectionStatus::Disconnected))
        })
        .await;
        assert_eq!(event, MemberEvent::Status(ConnectionStatus::Disconnected));
        assert_eq!(guest.next_event().await, None);
        assert!(guest.did_connect());
    }

    #[tokio::test]
    async fn host_reports_peer_left() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.connect(&room()).await.unwrap();
        let mut guest = member(&net, RoleKind::Participant);
        guest.connect(&room()).await.unwrap();
        let guest_id = guest.id().unwrap().clone();
        drain_until(&mut host, |e| matches!(e, MemberEvent::PeerJoined { .. })).await;

        drop(guest);
        assert_eq!(
            drain_until(&mut host, |e| matches!(e, MemberEvent::PeerLeft(_))).await,
            MemberEvent::PeerLeft(guest_id)
        );
        assert_eq!(host.link_count(), 0);
        assert_eq!(host.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn severed_host_tears_down() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.connect(&room()).await.unwrap();
        net.sever(&host_identity(&room()));
        drain_until(&mut host, |e| {
            matches!(e, MemberEvent::Status(ConnectionStatus::Disconnected))
        })
        .await;
        assert_eq!(host.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn tear_down_twice_is_harmless() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.connect(&room()).await.unwrap();
        host.tear_down();
        host.tear_down();
        assert!(!net.is_registered(&host_identity(&room())));
    }

    #[tokio::test]
    async fn fatal_endpoint_error_tears_down() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.connect(&room()).await.unwrap();
        let mut guest = member(&net, RoleKind::Participant);
        guest.connect(&room()).await.unwrap();
        drain_until(&mut host, |e| matches!(e, MemberEvent::PeerJoined { .. })).await;

        assert!(net.inject_error(&host_identity(&room()), ErrorKind::SocketClosed));
        drain_until(&mut host, |e| {
            matches!(e, MemberEvent::Status(ConnectionStatus::Disconnected))
        })
        .await;
        assert_eq!(host.status(), ConnectionStatus::Disconnected);
        assert_eq!(host.link_count(), 0);
        assert!(!net.is_registered(&host_identity(&room())));
        drain_until(&mut guest, |e| {
            matches!(e, MemberEvent::Status(ConnectionStatus::Disconnected))
        })
        .await;
    }

    #[tokio::test]
    async fn non_fatal_endpoint_error_is_ignored() {
        let net = LoopbackNetwork::new();
        let mut host = member(&net, RoleKind::Host);
        host.connect(&room()).await.unwrap();
        assert!(net.inject_error(&host_identity(&room()), ErrorKind::PeerUnavailable));
        // The guest's link is queued behind the error on the same channel.
        let mut guest = member(&net, RoleKind::Participant);
        guest.connect(&room()).await.unwrap();
        drain_until(&mut host, |e| matches!(e, MemberEvent::PeerJoined { .. })).await;
        assert_eq!(host.status(), ConnectionStatus::Connected);
        assert!(net.is_registered(&host_identity(&room())));
    }
}
