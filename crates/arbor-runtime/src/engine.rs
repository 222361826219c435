//! GHS engine - fragment formation and tree relay
//!
//! The engine owns all algorithm state of one node: the edge records, the
//! node's fragment context and the pending outbound messages. It is driven
//! by exactly one consumer, one event at a time, so no state here is ever
//! shared or locked.
//!
//! Each handler follows the Gallager-Humblet-Spira protocol. Three of them
//! (Connect, Test, Report) may decide that the event arrived too early; the
//! event is then handed back as [`Disposition::Deferred`] and the caller
//! re-enqueues it at the back of the queue.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, info, warn};

use arbor_core::{
    Activity, ConnectionId, Edge, EdgeState, Identifier, Message, NodeState, PeerId, Transition,
    Weight,
};

use crate::EngineConfig;

/// Something that happened on a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A decoded protocol message
    Message(Message),
    /// The local side dialed a server; the engine opens the handshake
    PeerDialed { lag: u64 },
    /// A client finished role negotiation
    ClientAttached,
    /// The connection is gone
    Closed,
}

/// An event tagged with the connection it arrived on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub connection: ConnectionId,
    pub event: Event,
}

impl Inbound {
    pub fn new(connection: ConnectionId, event: Event) -> Self {
        Inbound { connection, event }
    }

    pub fn message(connection: ConnectionId, message: Message) -> Self {
        Inbound::new(connection, Event::Message(message))
    }

    /// An event raised by the local process rather than a peer
    pub fn local(message: Message) -> Self {
        Inbound::message(ConnectionId::LOCAL, message)
    }
}

/// A message the engine wants written to a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub connection: ConnectionId,
    pub message: Message,
}

/// What became of an event after the engine looked at it
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum Disposition {
    Done,
    /// Too early to decide; re-enqueue at the back of the queue
    Deferred(Inbound),
}

enum Step {
    Done,
    Defer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub events_processed: u64,
    pub events_deferred: u64,
    pub messages_queued: u64,
    pub activities_relayed: u64,
    pub protocol_warnings: u64,
}

/// Point-in-time view of the engine, for logs and tests
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub peer: PeerId,
    pub state: NodeState,
    pub level: u32,
    pub fragment: Identifier,
    /// Peers across Branch edges, sorted
    pub branches: Vec<PeerId>,
    /// Peers across Rejected edges, sorted
    pub rejected: Vec<PeerId>,
    pub unclassified: usize,
    pub clients: usize,
    pub halted: bool,
    pub stats: EngineStats,
}

/// Per-node GHS state machine
pub struct Engine {
    local: PeerId,
    config: EngineConfig,
    /// One edge per handshaken server connection
    edges: BTreeMap<ConnectionId, Edge>,
    /// Locally attached clients
    clients: BTreeSet<ConnectionId>,
    state: NodeState,
    level: u32,
    fragment: Identifier,
    /// Children that still owe a Report in this Find phase
    find_count: usize,
    in_branch: Option<ConnectionId>,
    best_edge: Option<ConnectionId>,
    best_weight: Weight,
    test_edge: Option<ConnectionId>,
    /// Set once the infinite-weight report round-trip was observed here
    halted: bool,
    outgoing: VecDeque<Outbound>,
    stats: EngineStats,
}

impl Engine {
    pub fn new(local: PeerId, config: EngineConfig) -> Self {
        Engine {
            local,
            config,
            edges: BTreeMap::new(),
            clients: BTreeSet::new(),
            state: NodeState::Sleeping,
            level: 0,
            fragment: Identifier::solitary(local),
            find_count: 0,
            in_branch: None,
            best_edge: None,
            best_weight: Weight::Infinite,
            test_edge: None,
            halted: false,
            outgoing: VecDeque::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn fragment(&self) -> Identifier {
        self.fragment
    }

    pub fn find_count(&self) -> usize {
        self.find_count
    }

    pub fn in_branch(&self) -> Option<ConnectionId> {
        self.in_branch
    }

    pub fn test_edge(&self) -> Option<ConnectionId> {
        self.test_edge
    }

    pub fn best_weight(&self) -> Weight {
        self.best_weight
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn edge(&self, connection: ConnectionId) -> Option<&Edge> {
        self.edges.get(&connection)
    }

    pub fn edges(&self) -> impl Iterator<Item = (ConnectionId, &Edge)> {
        self.edges.iter().map(|(c, e)| (*c, e))
    }

    pub fn clients(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.clients.iter().copied()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let peers_in = |state: EdgeState| {
            let mut peers: Vec<PeerId> = self
                .edges
                .values()
                .filter(|e| e.state() == state)
                .map(|e| e.peer())
                .collect();
            peers.sort_unstable();
            peers
        };

        EngineSnapshot {
            peer: self.local,
            state: self.state,
            level: self.level,
            fragment: self.fragment,
            branches: peers_in(EdgeState::Branch),
            rejected: peers_in(EdgeState::Rejected),
            unclassified: self.edges.values().filter(|e| e.is_unclassified()).count(),
            clients: self.clients.len(),
            halted: self.halted,
            stats: self.stats.clone(),
        }
    }

    /// Get next outgoing message (if any)
    pub fn pop_outgoing(&mut self) -> Option<Outbound> {
        self.outgoing.pop_front()
    }

    pub fn drain_outgoing(&mut self) -> Vec<Outbound> {
        self.outgoing.drain(..).collect()
    }

    /// Process one inbound event to completion
    pub fn handle(&mut self, inbound: Inbound) -> Disposition {
        self.stats.events_processed += 1;
        let connection = inbound.connection;

        let step = match &inbound.event {
            Event::Message(message) => self.dispatch(connection, message),
            Event::PeerDialed { lag } => {
                self.open_peer(connection, *lag);
                Step::Done
            }
            Event::ClientAttached => {
                if self.clients.insert(connection) {
                    info!(%connection, "client attached");
                }
                Step::Done
            }
            Event::Closed => {
                self.detach(connection);
                Step::Done
            }
        };

        match step {
            Step::Done => Disposition::Done,
            Step::Defer => {
                self.stats.events_deferred += 1;
                debug!(%connection, event = ?inbound.event, "deferring event");
                Disposition::Deferred(inbound)
            }
        }
    }

    fn dispatch(&mut self, connection: ConnectionId, message: &Message) -> Step {
        if message.is_ghs() {
            if !self.edges.contains_key(&connection) {
                self.stats.protocol_warnings += 1;
                warn!(%connection, kind = message.kind(), "tree message on connection without an edge");
                return Step::Done;
            }
            if self.state == NodeState::Sleeping {
                self.wakeup();
            }
        }

        match message {
            Message::Hello { role } => {
                self.stats.protocol_warnings += 1;
                warn!(%connection, ?role, "role negotiation reached the engine; dropped");
                Step::Done
            }
            Message::Handshake { peer, lag } => {
                self.receive_handshake(connection, *peer, *lag);
                Step::Done
            }
            Message::HandshakeAck { peer, lag } => {
                self.insert_edge(connection, *peer, *lag);
                Step::Done
            }
            Message::WakeUp => {
                if self.state == NodeState::Sleeping {
                    info!(%connection, "wake-up requested");
                    self.wakeup();
                } else {
                    debug!(%connection, "already awake");
                }
                Step::Done
            }
            Message::Connect { level } => self.receive_connect(connection, *level),
            Message::Initiate {
                level,
                fragment,
                state,
            } => {
                self.receive_initiate(connection, *level, *fragment, *state);
                Step::Done
            }
            Message::Test { level, fragment } => self.receive_test(connection, *level, *fragment),
            Message::Accept { .. } => {
                self.receive_accept(connection);
                Step::Done
            }
            Message::Reject { .. } => {
                self.receive_reject(connection);
                Step::Done
            }
            Message::Report { weight } => self.receive_report(connection, *weight),
            Message::ChangeCore => {
                self.change_core();
                Step::Done
            }
            Message::Activity(activity) => {
                self.relay(connection, activity);
                Step::Done
            }
        }
    }

    // ------------------------------------------------------------------
    // Edge management
    // ------------------------------------------------------------------

    fn open_peer(&mut self, connection: ConnectionId, lag: u64) {
        let lag = lag.max(self.config.lag_floor);
        debug!(%connection, lag, "opening handshake");
        self.send(
            connection,
            Message::Handshake {
                peer: self.local,
                lag,
            },
        );
    }

    fn receive_handshake(&mut self, connection: ConnectionId, peer: PeerId, lag: u64) {
        let weight = lag.max(self.config.lag_floor);
        if self.insert_edge(connection, peer, weight) {
            self.send(
                connection,
                Message::HandshakeAck {
                    peer: self.local,
                    lag: weight,
                },
            );
        }
    }

    fn insert_edge(&mut self, connection: ConnectionId, peer: PeerId, lag: u64) -> bool {
        if self.edges.contains_key(&connection) {
            self.stats.protocol_warnings += 1;
            warn!(%connection, %peer, "duplicate handshake ignored");
            return false;
        }
        if peer == self.local {
            self.stats.protocol_warnings += 1;
            warn!(%connection, "handshake from ourselves ignored");
            return false;
        }
        if self.state != NodeState::Sleeping {
            warn!(%connection, %peer, "edge added after wake-up; the tree may not cover it");
        }

        info!(%connection, %peer, lag, "edge established");
        self.edges.insert(connection, Edge::new(self.local, peer, lag));
        true
    }

    fn detach(&mut self, connection: ConnectionId) {
        if self.clients.remove(&connection) {
            info!(%connection, "client detached");
        } else if let Some(edge) = self.edges.get(&connection) {
            warn!(%connection, peer = %edge.peer(), state = ?edge.state(), "server connection closed; edge record kept");
        } else {
            debug!(%connection, "connection closed before handshake");
        }
    }

    fn classify(&mut self, connection: ConnectionId, next: EdgeState) {
        let Some(edge) = self.edges.get_mut(&connection) else {
            return;
        };
        match edge.classify(next) {
            Transition::Changed => {
                debug!(%connection, peer = %edge.peer(), state = ?next, "edge classified")
            }
            Transition::Unchanged => {
                debug!(%connection, peer = %edge.peer(), state = ?next, "edge already classified")
            }
            Transition::Refused => {
                self.stats.protocol_warnings += 1;
                warn!(%connection, current = ?edge.state(), requested = ?next, "refused edge reclassification");
            }
        }
    }

    /// Minimum edge by weight among those matching `filter`
    fn min_edge(&self, filter: impl Fn(&Edge) -> bool) -> Option<ConnectionId> {
        self.edges
            .iter()
            .filter(|(_, e)| filter(*e))
            .min_by(|(_, a), (_, b)| a.cmp_weight(b))
            .map(|(c, _)| *c)
    }

    fn send(&mut self, connection: ConnectionId, message: Message) {
        self.stats.messages_queued += 1;
        self.outgoing.push_back(Outbound {
            connection,
            message,
        });
    }

    // ------------------------------------------------------------------
    // GHS protocol
    // ------------------------------------------------------------------

    /// Leave Sleeping and connect over the lightest edge. No-op when awake.
    pub fn wakeup(&mut self) {
        if self.state != NodeState::Sleeping {
            return;
        }
        let Some(lightest) = self.min_edge(|_| true) else {
            warn!("wake-up without any edge; staying asleep");
            return;
        };

        self.level = 0;
        self.state = NodeState::Found;
        self.find_count = 0;
        info!(connection = %lightest, "waking up");

        self.classify(lightest, EdgeState::Branch);
        self.send(lightest, Message::Connect { level: 0 });
    }

    fn receive_connect(&mut self, connection: ConnectionId, level: u32) -> Step {
        let Some(edge) = self.edges.get(&connection) else {
            return Step::Done;
        };
        let edge_state = edge.state();
        let identifier = edge.identifier();

        if level < self.level {
            debug!(%connection, level, own = self.level, "absorbing fragment");
            self.classify(connection, EdgeState::Branch);
            self.send(
                connection,
                Message::Initiate {
                    level: self.level,
                    fragment: self.fragment,
                    state: self.state,
                },
            );
            if self.state == NodeState::Find {
                self.find_count += 1;
            }
            Step::Done
        } else if edge_state == EdgeState::Unclassified {
            Step::Defer
        } else {
            debug!(%connection, level = self.level + 1, fragment = %identifier, "merging fragments");
            self.send(
                connection,
                Message::Initiate {
                    level: self.level + 1,
                    fragment: identifier,
                    state: NodeState::Find,
                },
            );
            Step::Done
        }
    }

    fn receive_initiate(
        &mut self,
        connection: ConnectionId,
        level: u32,
        fragment: Identifier,
        state: NodeState,
    ) {
        if level < self.level || state == NodeState::Sleeping {
            self.stats.protocol_warnings += 1;
            warn!(%connection, level, own = self.level, %state, "invalid initiate ignored");
            return;
        }

        self.level = level;
        self.fragment = fragment;
        self.state = state;
        self.in_branch = Some(connection);
        self.best_edge = None;
        self.best_weight = Weight::Infinite;
        debug!(%connection, level, %fragment, %state, "joined fragment");

        let branches: Vec<ConnectionId> = self
            .edges
            .iter()
            .filter(|(c, e)| **c != connection && e.is_branch())
            .map(|(c, _)| *c)
            .collect();

        for branch in branches {
            self.send(
                branch,
                Message::Initiate {
                    level,
                    fragment,
                    state,
                },
            );
            if state == NodeState::Find {
                self.find_count += 1;
            }
        }

        if state == NodeState::Find {
            self.test();
        }
    }

    /// Probe the lightest unclassified edge, or report if none is left
    fn test(&mut self) {
        match self.min_edge(Edge::is_unclassified) {
            Some(candidate) => {
                self.test_edge = Some(candidate);
                self.send(
                    candidate,
                    Message::Test {
                        level: self.level,
                        fragment: self.fragment,
                    },
                );
            }
            None => {
                self.test_edge = None;
                self.report();
            }
        }
    }

    fn receive_test(&mut self, connection: ConnectionId, level: u32, fragment: Identifier) -> Step {
        if level > self.level {
            return Step::Defer;
        }
        if fragment != self.fragment {
            self.send(connection, Message::Accept { sender: self.local });
            return Step::Done;
        }

        if self
            .edges
            .get(&connection)
            .is_some_and(Edge::is_unclassified)
        {
            self.classify(connection, EdgeState::Rejected);
        }
        if self.test_edge != Some(connection) {
            self.send(connection, Message::Reject { sender: self.local });
        } else {
            // Both ends probed each other; our own probe is answered too.
            self.test();
        }
        Step::Done
    }

    fn receive_accept(&mut self, connection: ConnectionId) {
        let Some(edge) = self.edges.get(&connection) else {
            return;
        };
        let weight = Weight::Finite(edge.weight());

        self.test_edge = None;
        if weight < self.best_weight {
            self.best_edge = Some(connection);
            self.best_weight = weight;
        }
        self.report();
    }

    fn receive_reject(&mut self, connection: ConnectionId) {
        if self
            .edges
            .get(&connection)
            .is_some_and(Edge::is_unclassified)
        {
            self.classify(connection, EdgeState::Rejected);
        }
        self.test();
    }

    fn report(&mut self) {
        if self.find_count != 0 || self.test_edge.is_some() {
            return;
        }
        self.state = NodeState::Found;

        let Some(in_branch) = self.in_branch else {
            self.stats.protocol_warnings += 1;
            warn!("search finished without an in-branch; nothing to report to");
            return;
        };
        debug!(connection = %in_branch, weight = %self.best_weight, "reporting");
        self.send(
            in_branch,
            Message::Report {
                weight: self.best_weight,
            },
        );
    }

    fn receive_report(&mut self, connection: ConnectionId, weight: Weight) -> Step {
        if self.in_branch != Some(connection) {
            if self.find_count == 0 {
                self.stats.protocol_warnings += 1;
                warn!(%connection, %weight, "unexpected child report");
            } else {
                self.find_count -= 1;
            }
            if weight < self.best_weight {
                self.best_weight = weight;
                self.best_edge = Some(connection);
            }
            self.report();
            return Step::Done;
        }

        if self.state == NodeState::Find {
            return Step::Defer;
        }

        if weight > self.best_weight {
            self.change_core();
        } else if weight.is_infinite() && self.best_weight.is_infinite() && !self.halted {
            self.halted = true;
            info!(level = self.level, fragment = %self.fragment, "spanning tree complete");
        }
        Step::Done
    }

    fn change_core(&mut self) {
        let Some(best) = self.best_edge else {
            self.stats.protocol_warnings += 1;
            warn!("change-core without a best edge");
            return;
        };
        let Some(edge) = self.edges.get(&best) else {
            return;
        };

        if edge.is_branch() {
            self.send(best, Message::ChangeCore);
        } else {
            debug!(connection = %best, level = self.level, "connecting over best edge");
            self.send(best, Message::Connect { level: self.level });
            self.classify(best, EdgeState::Branch);
        }
    }

    // ------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------

    /// Flood an activity to local clients and along Branch edges, never
    /// back where it came from.
    fn relay(&mut self, from: ConnectionId, activity: &Activity) {
        let known = from == ConnectionId::LOCAL
            || self.clients.contains(&from)
            || self.edges.contains_key(&from);
        if !known {
            self.stats.protocol_warnings += 1;
            warn!(connection = %from, "activity from unregistered connection dropped");
            return;
        }

        let targets: Vec<ConnectionId> = self
            .clients
            .iter()
            .copied()
            .chain(
                self.edges
                    .iter()
                    .filter(|(_, e)| e.is_branch())
                    .map(|(c, _)| *c),
            )
            .filter(|c| *c != from)
            .collect();

        debug!(connection = %from, origin = %activity.origin, targets = targets.len(), "relaying activity");
        for target in targets {
            self.send(target, Message::Activity(activity.clone()));
        }
        self.stats.activities_relayed += 1;
    }
}
