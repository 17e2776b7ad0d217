//! Room facade: one shared state, replicated through an elected host.
//!
//! Each room runs as a driver task that owns the member and the local state.
//! [`Room`] handles are cheap to clone and talk to the driver over a channel.
//! Dropping the last handle stops the driver and leaves the room.
//!
//! State only changes when a payload is applied: a host delivers its own
//! broadcasts to itself, participants get theirs echoed by the host.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};

use crate::config::RoomConfig;
use crate::election::join_or_host;
use crate::error::RoomError;
use crate::hints::{self, HintStore, MemoryHints};
use crate::identity::{PeerId, RoomId};
use crate::member::{Member, MemberEvent, RoleKind};
use crate::observer::{Emitter, Subscription};
use crate::protocol::Payload;
use crate::status::ConnectionStatus;
use crate::transport::Transport;
use crate::wire::{decode_payload, encode_payload};

/// Bounds of a room's shared state.
pub trait RoomState: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> RoomState for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A named state transition: `next = action(&state, &args)`.
pub type Action<S> = Arc<dyn Fn(&S, &[Value]) -> S + Send + Sync>;

/// Observable changes of a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent<S> {
    Status(ConnectionStatus),
    State(S),
    /// A terminal connect failure.
    Error(RoomError),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    /// The role taken by the latest successful connect.
    Role(RoleKind),
}

struct View<S> {
    status: ConnectionStatus,
    role: Option<RoleKind>,
    peer_id: Option<PeerId>,
    state: S,
    error: Option<RoomError>,
}

struct Shared<S> {
    view: Mutex<View<S>>,
    events: Emitter<RoomEvent<S>>,
}

enum Command<S> {
    Connect(oneshot::Sender<Result<(), RoomError>>),
    Disconnect(oneshot::Sender<()>),
    SetState(S),
    Dispatch { name: String, args: Vec<Value> },
    Broadcast(Payload),
}

/// Handle to a room.
#[derive(Clone)]
pub struct Room<S: RoomState> {
    id: RoomId,
    commands: mpsc::UnboundedSender<Command<S>>,
    shared: Arc<Shared<S>>,
    actions: Arc<HashMap<String, Action<S>>>,
}

impl<S: RoomState> Room<S> {
    pub fn builder(room: RoomId, transport: Arc<dyn Transport>, initial: S) -> RoomBuilder<S> {
        RoomBuilder {
            room,
            initial,
            transport,
            hints: Arc::new(MemoryHints::new()),
            config: RoomConfig::default(),
            actions: HashMap::new(),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Join the room, as host or participant. Calls made while a connect is
    /// in flight share its outcome; a connected room returns `Ok` at once.
    pub async fn connect(&self) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)?
    }

    /// Leave the room. Waits for an in-flight connect to settle first.
    /// Leaving a room that is not connected does nothing.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Broadcast a full state replacement. Dropped unless connected.
    pub fn set_state(&self, state: S) {
        let _ = self.commands.send(Command::SetState(state));
    }

    /// Broadcast a registered action. Returns false, and sends nothing, when
    /// `name` is not registered.
    pub fn dispatch(&self, name: &str, args: Vec<Value>) -> bool {
        if !self.actions.contains_key(name) {
            tracing::debug!(room = %self.id, action = name, "unknown action not dispatched");
            return false;
        }
        self.commands
            .send(Command::Dispatch {
                name: name.to_string(),
                args,
            })
            .is_ok()
    }

    /// Broadcast a raw payload.
    pub fn broadcast(&self, payload: Payload) {
        let _ = self.commands.send(Command::Broadcast(payload));
    }

    /// Observe room events. Handlers run on the driver task and must not block.
    pub fn on(&self, handler: impl Fn(&RoomEvent<S>) + Send + Sync + 'static) -> Subscription {
        self.shared.events.on(handler)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.view.lock().status
    }

    pub fn role(&self) -> Option<RoleKind> {
        self.shared.view.lock().role
    }

    pub fn is_host(&self) -> bool {
        self.role() == Some(RoleKind::Host)
    }

    /// This room's endpoint identity while connected.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.shared.view.lock().peer_id.clone()
    }

    pub fn state(&self) -> S {
        self.shared.view.lock().state.clone()
    }

    /// Error of the last failed connect; cleared when a new one starts.
    pub fn error(&self) -> Option<RoomError> {
        self.shared.view.lock().error.clone()
    }
}

/// Configures and starts a [`Room`].
pub struct RoomBuilder<S: RoomState> {
    room: RoomId,
    initial: S,
    transport: Arc<dyn Transport>,
    hints: Arc<dyn HintStore>,
    config: RoomConfig,
    actions: HashMap<String, Action<S>>,
}

impl<S: RoomState> RoomBuilder<S> {
    pub fn config(mut self, config: RoomConfig) -> Self {
        self.config = config;
        self
    }

    /// Store for the last-host hint. Defaults to a process-local store.
    pub fn hints(mut self, hints: Arc<dyn HintStore>) -> Self {
        self.hints = hints;
        self
    }

    pub fn action(
        mut self,
        name: impl Into<String>,
        action: impl Fn(&S, &[Value]) -> S + Send + Sync + 'static,
    ) -> Self {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    /// Start the driver on the current tokio runtime.
    pub fn spawn(self) -> Room<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            view: Mutex::new(View {
                status: ConnectionStatus::Uninitialized,
                role: None,
                peer_id: None,
                state: self.initial.clone(),
                error: None,
            }),
            events: Emitter::new(),
        });
        let actions = Arc::new(self.actions);
        let driver = Driver {
            room: self.room.clone(),
            transport: self.transport,
            hints: self.hints,
            config: self.config,
            actions: actions.clone(),
            shared: shared.clone(),
            state: self.initial,
            member: None,
            election: None,
        };
        tokio::spawn(driver.run(rx));
        Room {
            id: self.room,
            commands: tx,
            shared,
            actions,
        }
    }
}

/// A running `join_or_host` plus the callers waiting on it.
struct Election {
    task: JoinHandle<Result<Member, RoomError>>,
    connects: Vec<oneshot::Sender<Result<(), RoomError>>>,
    disconnects: Vec<oneshot::Sender<()>>,
}

enum Step<S> {
    Command(Command<S>),
    Election(Result<Result<Member, RoomError>, JoinError>),
    Member(MemberEvent),
}

struct Driver<S: RoomState> {
    room: RoomId,
    transport: Arc<dyn Transport>,
    hints: Arc<dyn HintStore>,
    config: RoomConfig,
    actions: Arc<HashMap<String, Action<S>>>,
    shared: Arc<Shared<S>>,
    state: S,
    member: Option<Member>,
    election: Option<Election>,
}

async fn settled(election: &mut Option<Election>) -> Result<Result<Member, RoomError>, JoinError> {
    match election {
        Some(election) => (&mut election.task).await,
        None => std::future::pending().await,
    }
}

async fn member_event(member: &mut Option<Member>) -> Option<MemberEvent> {
    match member {
        Some(member) => member.next_event().await,
        None => std::future::pending().await,
    }
}

impl<S: RoomState> Driver<S> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<S>>) {
        loop {
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => break,
                },
                outcome = settled(&mut self.election) => Step::Election(outcome),
                Some(event) = member_event(&mut self.member) => Step::Member(event),
            };
            match step {
                Step::Command(command) => self.on_command(command),
                Step::Election(outcome) => self.on_election(outcome),
                Step::Member(event) => self.on_member_event(event),
            }
        }
        tracing::debug!(room = %self.room, "all handles dropped, leaving");
        if let Some(election) = self.election.take() {
            election.task.abort();
        }
        self.leave();
    }

    fn on_command(&mut self, command: Command<S>) {
        match command {
            Command::Connect(reply) => {
                if let Some(election) = &mut self.election {
                    election.connects.push(reply);
                } else if self.member.is_some() {
                    let _ = reply.send(Ok(()));
                } else {
                    let first = if hints::recently_stopped_hosting(
                        self.hints.as_ref(),
                        &self.room,
                        self.config.rehost_cooldown(),
                    ) {
                        RoleKind::Participant
                    } else {
                        RoleKind::Host
                    };
                    self.start_election(first, Some(reply));
                }
            }
            Command::Disconnect(reply) => {
                if let Some(election) = &mut self.election {
                    election.disconnects.push(reply);
                } else {
                    self.leave();
                    let _ = reply.send(());
                }
            }
            Command::SetState(state) => match serde_json::to_value(&state) {
                Ok(data) => self.send_payload(&Payload::state(data)),
                Err(e) => tracing::warn!(room = %self.room, error = %e, "state not serializable"),
            },
            Command::Dispatch { name, args } => {
                if self.actions.contains_key(&name) {
                    self.send_payload(&Payload::action(name, args));
                }
            }
            Command::Broadcast(payload) => self.send_payload(&payload),
        }
    }

    fn start_election(
        &mut self,
        first: RoleKind,
        reply: Option<oneshot::Sender<Result<(), RoomError>>>,
    ) {
        tracing::debug!(room = %self.room, first = first.as_str(), "starting election");
        self.shared.view.lock().error = None;
        self.set_status(ConnectionStatus::Connecting);

        let transport = self.transport.clone();
        let room = self.room.clone();
        let config = self.config.clone();
        let task = tokio::spawn(async move { join_or_host(transport, &room, first, &config).await });
        self.election = Some(Election {
            task,
            connects: reply.into_iter().collect(),
            disconnects: Vec::new(),
        });
    }

    fn on_election(&mut self, outcome: Result<Result<Member, RoomError>, JoinError>) {
        let Some(election) = self.election.take() else {
            return;
        };
        let result = outcome.unwrap_or_else(|e| {
            tracing::warn!(room = %self.room, error = %e, "election task failed");
            Err(RoomError::Closed)
        });

        match result {
            Ok(member) => {
                let role = member.kind();
                {
                    let mut view = self.shared.view.lock();
                    view.role = Some(role);
                    view.peer_id = member.id().cloned();
                }
                tracing::info!(room = %self.room, role = role.as_str(), "connected");
                self.member = Some(member);
                self.set_status(ConnectionStatus::Connected);
                self.publish(RoomEvent::Role(role));
                for reply in election.connects {
                    let _ = reply.send(Ok(()));
                }
                if !election.disconnects.is_empty() {
                    self.leave();
                    for reply in election.disconnects {
                        let _ = reply.send(());
                    }
                }
            }
            Err(e) => {
                tracing::warn!(room = %self.room, error = %e, "connect failed");
                self.shared.view.lock().error = Some(e.clone());
                self.set_status(ConnectionStatus::Disconnected);
                self.publish(RoomEvent::Error(e.clone()));
                for reply in election.connects {
                    let _ = reply.send(Err(e.clone()));
                }
                for reply in election.disconnects {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn on_member_event(&mut self, event: MemberEvent) {
        match event {
            MemberEvent::Status(ConnectionStatus::Disconnected) => self.on_member_lost(),
            MemberEvent::Status(_) => {}
            MemberEvent::Data(bytes) => self.apply(&bytes),
            MemberEvent::PeerJoined { peer, first } => {
                self.send_catch_up(&peer);
                if first {
                    self.publish(RoomEvent::PeerJoined(peer));
                }
            }
            MemberEvent::PeerLeft(peer) => self.publish(RoomEvent::PeerLeft(peer)),
        }
    }

    /// The member died on its own: take over in the opposite role.
    fn on_member_lost(&mut self) {
        let Some(member) = self.member.take() else {
            return;
        };
        let role = member.kind();
        let did_connect = member.did_connect();
        drop(member);
        {
            let mut view = self.shared.view.lock();
            view.role = None;
            view.peer_id = None;
        }
        self.set_status(ConnectionStatus::Disconnected);
        if did_connect {
            tracing::info!(room = %self.room, was = role.as_str(), "member lost, swapping role");
            self.start_election(role.opposite(), None);
        }
    }

    fn send_catch_up(&self, peer: &PeerId) {
        let Some(member) = self.member.as_ref().filter(|m| m.is_host()) else {
            return;
        };
        let bytes = match serde_json::to_value(&self.state)
            .map_err(|e| e.to_string())
            .and_then(|data| encode_payload(&Payload::state(data)).map_err(|e| e.to_string()))
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(room = %self.room, error = %e, "cannot encode catch-up");
                return;
            }
        };
        if member.send_to(peer, &bytes) {
            tracing::debug!(room = %self.room, peer = %peer, "catch-up sent");
        }
    }

    fn send_payload(&mut self, payload: &Payload) {
        let Some(member) = self.member.as_mut() else {
            tracing::debug!(room = %self.room, "not connected, payload dropped");
            return;
        };
        match encode_payload(payload) {
            Ok(bytes) => member.broadcast(bytes),
            Err(e) => tracing::warn!(room = %self.room, error = %e, "payload not sent"),
        }
    }

    fn apply(&mut self, bytes: &[u8]) {
        let payload = match decode_payload(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(room = %self.room, error = %e, "dropping malformed payload");
                return;
            }
        };
        tracing::trace!(room = %self.room, sent_at = payload.timestamp(), "applying payload");
        match payload {
            Payload::State { data, .. } => match serde_json::from_value::<S>(data) {
                Ok(state) => self.replace_state(state),
                Err(e) => {
                    tracing::warn!(room = %self.room, error = %e, "dropping state of the wrong shape")
                }
            },
            Payload::Action { data: name, args, .. } => {
                let Some(action) = self.actions.get(&name).cloned() else {
                    tracing::debug!(room = %self.room, action = %name, "ignoring unknown action");
                    return;
                };
                let next = action(&self.state, &args);
                self.replace_state(next);
            }
        }
    }

    fn replace_state(&mut self, state: S) {
        self.state = state.clone();
        self.shared.view.lock().state = state.clone();
        self.publish(RoomEvent::State(state));
    }

    /// Tear the member down on request. Records the last-host hint when
    /// hosting.
    fn leave(&mut self) {
        let Some(mut member) = self.member.take() else {
            return;
        };
        if member.is_host() {
            hints::record_stopped_hosting(
                self.hints.as_ref(),
                &self.room,
                self.config.rehost_cooldown(),
            );
        }
        member.tear_down();
        {
            let mut view = self.shared.view.lock();
            view.role = None;
            view.peer_id = None;
        }
        tracing::info!(room = %self.room, "left room");
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut view = self.shared.view.lock();
            if view.status == status {
                return;
            }
            view.status = status;
        }
        self.publish(RoomEvent::Status(status));
    }

    fn publish(&self, event: RoomEvent<S>) {
        self.shared.events.emit(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;

    fn counter(net: &LoopbackNetwork) -> Room<i64> {
        Room::builder(RoomId::new("R1"), Arc::new(net.clone()), 0)
            .action("increment", |n: &i64, _| n + 1)
            .spawn()
    }

    #[tokio::test]
    async fn fresh_room_is_uninitialized() {
        let net = LoopbackNetwork::new();
        let room = counter(&net);
        assert_eq!(room.status(), ConnectionStatus::Uninitialized);
        assert_eq!(room.role(), None);
        assert_eq!(room.peer_id(), None);
        assert_eq!(room.state(), 0);
        assert_eq!(room.id(), &RoomId::new("R1"));
    }

    #[tokio::test]
    async fn unknown_action_is_not_dispatched() {
        let net = LoopbackNetwork::new();
        let room = counter(&net);
        assert!(!room.dispatch("decrement", vec![]));
        assert!(room.dispatch("increment", vec![]));
    }

    #[tokio::test]
    async fn lone_room_hosts_and_applies_own_actions() {
        let net = LoopbackNetwork::new();
        let room = counter(&net);
        room.connect().await.unwrap();
        assert!(room.is_host());
        assert_eq!(room.status(), ConnectionStatus::Connected);
        assert_eq!(room.peer_id(), Some(crate::identity::host_identity(room.id())));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = room.on(move |e| {
            if let RoomEvent::State(n) = e {
                let _ = tx.send(*n);
            }
        });
        room.dispatch("increment", vec![]);
        assert_eq!(rx.recv().await, Some(1));
        room.set_state(41);
        room.dispatch("increment", vec![]);
        assert_eq!(rx.recv().await, Some(41));
        assert_eq!(rx.recv().await, Some(42));
        assert_eq!(room.state(), 42);
    }

    #[tokio::test]
    async fn set_state_before_connect_is_dropped() {
        let net = LoopbackNetwork::new();
        let room = counter(&net);
        room.set_state(5);
        room.connect().await.unwrap();
        assert_eq!(room.state(), 0);
    }

    #[tokio::test]
    async fn dropping_handles_releases_host_identity() {
        let net = LoopbackNetwork::new();
        let room = counter(&net);
        room.connect().await.unwrap();
        let host = crate::identity::host_identity(room.id());
        assert!(net.is_registered(&host));
        drop(room);
        for _ in 0..100 {
            if !net.is_registered(&host) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("host identity still registered");
    }
}
