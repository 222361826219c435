//! Deterministic multi-node simulation
//!
//! One [`Engine`] per node, wired by per-direction FIFO links. A seeded
//! RNG picks, at every step, either a link to deliver the head message of
//! or a node to process its next inbox event. Deferred events go to the
//! back of the node's inbox, and a node whose inbox holds only events that
//! were deferred since its last progress is skipped until something new
//! arrives, exactly like the runtime queue.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::debug;

use arbor_core::{Activity, ConnectionId, EdgeState, Message, NodeState, PeerId};
use arbor_runtime::{Disposition, Engine, EngineConfig, EngineSnapshot, Event, Inbound};

/// Connection id of the simulated client attached to every node
pub const CLIENT_CONNECTION: ConnectionId = ConnectionId(1_000_000);

/// Simulation failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SimulationError {
    #[error("Invariant violated at node {node}: {detail}")]
    InvariantViolated { node: usize, detail: String },

    #[error("No quiescence after {0} steps")]
    StepLimit(u64),

    #[error("Stalled with {deferred} deferred events")]
    Stalled { deferred: usize },

    #[error("Message to unknown connection {connection} from node {node}")]
    Misrouted { node: usize, connection: ConnectionId },
}

/// How a run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub steps: u64,
    pub deliveries: u64,
}

struct SimNode {
    engine: Engine,
    inbox: VecDeque<Inbound>,
    deferred_streak: usize,
    /// Local connection -> node index on the other end
    peers: BTreeMap<ConnectionId, usize>,
    /// Messages written to the simulated client
    client_inbox: Vec<Message>,
    last_level: u32,
    last_edges: BTreeMap<ConnectionId, EdgeState>,
}

impl SimNode {
    fn runnable(&self) -> bool {
        self.deferred_streak < self.inbox.len()
    }

    fn push(&mut self, inbound: Inbound) {
        self.inbox.push_back(inbound);
        self.deferred_streak = 0;
    }
}

/// Seeded in-memory network of engines
pub struct Simulation {
    nodes: Vec<SimNode>,
    peer_ids: Vec<PeerId>,
    /// In-flight messages per direction `(from, to)`
    links: BTreeMap<(usize, usize), VecDeque<Message>>,
    rng: StdRng,
    steps: u64,
    deliveries: u64,
}

/// Connection id on any node toward node `index`
fn connection_to(index: usize) -> ConnectionId {
    ConnectionId::new(index as u64 + 1)
}

impl Simulation {
    /// Build one engine per node with random distinct peer ids, queue the
    /// handshakes of every link and attach a client to each node.
    pub fn new(topology: &crate::Topology, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut seen = BTreeSet::new();
        let mut peer_ids = Vec::with_capacity(topology.nodes());
        while peer_ids.len() < topology.nodes() {
            let id = PeerId::new(rng.gen());
            if seen.insert(id) {
                peer_ids.push(id);
            }
        }

        let mut nodes: Vec<SimNode> = peer_ids
            .iter()
            .map(|peer| SimNode {
                engine: Engine::new(*peer, EngineConfig::default()),
                inbox: VecDeque::new(),
                deferred_streak: 0,
                peers: BTreeMap::new(),
                client_inbox: Vec::new(),
                last_level: 0,
                last_edges: BTreeMap::new(),
            })
            .collect();

        let mut links = BTreeMap::new();
        for link in topology.links() {
            nodes[link.a].peers.insert(connection_to(link.b), link.b);
            nodes[link.b].peers.insert(connection_to(link.a), link.a);
            links.insert((link.a, link.b), VecDeque::new());
            links.insert((link.b, link.a), VecDeque::new());

            nodes[link.a].push(Inbound::new(
                connection_to(link.b),
                Event::PeerDialed { lag: link.lag },
            ));
        }
        for node in &mut nodes {
            node.push(Inbound::new(CLIENT_CONNECTION, Event::ClientAttached));
        }

        Simulation {
            nodes,
            peer_ids,
            links,
            rng,
            steps: 0,
            deliveries: 0,
        }
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peer_ids
    }

    pub fn engine(&self, node: usize) -> &Engine {
        &self.nodes[node].engine
    }

    pub fn snapshot(&self, node: usize) -> EngineSnapshot {
        self.nodes[node].engine.snapshot()
    }

    /// Messages the simulated client on `node` received
    pub fn client_messages(&self, node: usize) -> &[Message] {
        &self.nodes[node].client_inbox
    }

    /// Queue a local wake-up on `node`
    pub fn wake(&mut self, node: usize) {
        self.nodes[node].push(Inbound::local(Message::WakeUp));
    }

    /// Have the client on `node` publish an activity
    pub fn publish(&mut self, node: usize, payload: &str) {
        let activity = Activity::new(self.peer_ids[node], payload);
        self.nodes[node].push(Inbound::message(
            CLIENT_CONNECTION,
            Message::Activity(activity),
        ));
    }

    /// Index pairs marked Branch at both ends
    pub fn tree_edges(&self) -> BTreeSet<(usize, usize)> {
        self.edges_in(EdgeState::Branch)
    }

    /// Index pairs marked Rejected at both ends
    pub fn rejected_edges(&self) -> BTreeSet<(usize, usize)> {
        self.edges_in(EdgeState::Rejected)
    }

    fn edges_in(&self, state: EdgeState) -> BTreeSet<(usize, usize)> {
        let mut pairs = BTreeSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for (conn, edge) in node.engine.edges() {
                let Some(&j) = node.peers.get(&conn) else {
                    continue;
                };
                let other = self.nodes[j].engine.edge(connection_to(i));
                if i < j && edge.state() == state && other.map(|e| e.state()) == Some(state) {
                    pairs.insert((i, j));
                }
            }
        }
        pairs
    }

    /// Nodes that observed the final infinite report
    pub fn halted(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| self.nodes[*i].engine.is_halted())
            .collect()
    }

    /// True when nothing is in flight and no node can make progress
    pub fn is_quiescent(&self) -> bool {
        self.links.values().all(VecDeque::is_empty) && !self.nodes.iter().any(SimNode::runnable)
    }

    /// Events still parked in inboxes
    pub fn deferred(&self) -> usize {
        self.nodes.iter().map(|n| n.inbox.len()).sum()
    }

    /// Run one random step. Returns false when quiescent.
    pub fn step(&mut self) -> Result<bool, SimulationError> {
        let ready_links: Vec<(usize, usize)> = self
            .links
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(key, _)| *key)
            .collect();
        let ready_nodes: Vec<usize> = (0..self.nodes.len())
            .filter(|i| self.nodes[*i].runnable())
            .collect();

        let choices = ready_links.len() + ready_nodes.len();
        if choices == 0 {
            return Ok(false);
        }
        self.steps += 1;

        let pick = self.rng.gen_range(0..choices);
        if pick < ready_links.len() {
            self.deliver(ready_links[pick]);
            Ok(true)
        } else {
            self.process(ready_nodes[pick - ready_links.len()])?;
            Ok(true)
        }
    }

    /// Step until quiescent. Deferred events left behind count as a stall.
    pub fn run_until_quiescent(&mut self, max_steps: u64) -> Result<Outcome, SimulationError> {
        let start = self.steps;
        while self.step()? {
            if self.steps - start >= max_steps {
                return Err(SimulationError::StepLimit(max_steps));
            }
        }

        let deferred = self.deferred();
        if deferred > 0 {
            debug!(deferred, "simulation stalled");
            return Err(SimulationError::Stalled { deferred });
        }
        Ok(Outcome {
            steps: self.steps,
            deliveries: self.deliveries,
        })
    }

    fn deliver(&mut self, (from, to): (usize, usize)) {
        let Some(message) = self.links.get_mut(&(from, to)).and_then(VecDeque::pop_front) else {
            return;
        };
        self.deliveries += 1;
        self.nodes[to].push(Inbound::message(connection_to(from), message));
    }

    fn process(&mut self, index: usize) -> Result<(), SimulationError> {
        let node = &mut self.nodes[index];
        let Some(inbound) = node.inbox.pop_front() else {
            return Ok(());
        };

        match node.engine.handle(inbound) {
            Disposition::Done => node.deferred_streak = 0,
            Disposition::Deferred(inbound) => {
                node.inbox.push_back(inbound);
                node.deferred_streak += 1;
            }
        }

        let outgoing = node.engine.drain_outgoing();
        for out in outgoing {
            if out.connection == CLIENT_CONNECTION {
                self.nodes[index].client_inbox.push(out.message);
                continue;
            }
            let Some(&to) = self.nodes[index].peers.get(&out.connection) else {
                return Err(SimulationError::Misrouted {
                    node: index,
                    connection: out.connection,
                });
            };
            if let Some(queue) = self.links.get_mut(&(index, to)) {
                queue.push_back(out.message);
            }
        }

        self.check_invariants(index)
    }

    fn check_invariants(&mut self, index: usize) -> Result<(), SimulationError> {
        let node = &mut self.nodes[index];
        let violation = |detail: String| SimulationError::InvariantViolated {
            node: index,
            detail,
        };

        let level = node.engine.level();
        if level < node.last_level {
            return Err(violation(format!(
                "level went from {} to {}",
                node.last_level, level
            )));
        }
        node.last_level = level;

        if node.engine.state() == NodeState::Sleeping && level > 0 {
            return Err(violation("sleeping node above level 0".to_string()));
        }

        for (conn, edge) in node.engine.edges() {
            let previous = node.last_edges.insert(conn, edge.state());
            if let Some(previous) = previous {
                if previous != EdgeState::Unclassified && previous != edge.state() {
                    return Err(violation(format!(
                        "edge {} went from {:?} to {:?}",
                        conn,
                        previous,
                        edge.state()
                    )));
                }
            }
        }
        Ok(())
    }
}
