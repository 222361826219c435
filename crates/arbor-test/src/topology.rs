//! Weighted graphs for simulation

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use arbor_core::{EdgeWeight, Identifier, PeerId};

/// Undirected link between two node indices
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    pub a: usize,
    pub b: usize,
    pub lag: u64,
}

impl Link {
    /// Endpoints with the lower index first
    pub fn key(&self) -> (usize, usize) {
        (self.a.min(self.b), self.a.max(self.b))
    }
}

/// Node count plus links; node `i` is addressed by its index
#[derive(Clone, Debug, Default)]
pub struct Topology {
    nodes: usize,
    links: Vec<Link>,
}

impl Topology {
    pub fn new(nodes: usize) -> Self {
        Topology {
            nodes,
            links: Vec::new(),
        }
    }

    /// Add a link. Self-loops and repeated pairs are ignored.
    pub fn with_link(mut self, a: usize, b: usize, lag: u64) -> Self {
        self.add_link(a, b, lag);
        self
    }

    pub fn add_link(&mut self, a: usize, b: usize, lag: u64) -> bool {
        if a == b || a >= self.nodes || b >= self.nodes || self.has_link(a, b) {
            return false;
        }
        self.links.push(Link { a, b, lag });
        true
    }

    pub fn has_link(&self, a: usize, b: usize) -> bool {
        let key = (a.min(b), a.max(b));
        self.links.iter().any(|l| l.key() == key)
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// A-B=10, B-C=20, C-A=15
    pub fn triangle() -> Self {
        Topology::new(3)
            .with_link(0, 1, 10)
            .with_link(1, 2, 20)
            .with_link(2, 0, 15)
    }

    /// Path 0-1-..-(n-1) with increasing lag
    pub fn line(nodes: usize) -> Self {
        let mut topology = Topology::new(nodes);
        for i in 1..nodes {
            topology.add_link(i - 1, i, i as u64 * 10);
        }
        topology
    }

    /// Every pair linked, lags drawn from `1..=max_lag`
    pub fn complete(nodes: usize, max_lag: u64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut topology = Topology::new(nodes);
        for a in 0..nodes {
            for b in (a + 1)..nodes {
                topology.add_link(a, b, rng.gen_range(1..=max_lag));
            }
        }
        topology
    }

    /// A random spanning tree plus up to `extra` further links.
    ///
    /// Small `max_lag` values produce many equal lags, which exercises the
    /// identifier tie-break.
    pub fn random_connected(nodes: usize, extra: usize, max_lag: u64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut topology = Topology::new(nodes);

        for i in 1..nodes {
            let j = rng.gen_range(0..i);
            topology.add_link(i, j, rng.gen_range(1..=max_lag));
        }
        if nodes > 1 {
            for _ in 0..extra {
                let a = rng.gen_range(0..nodes);
                let b = rng.gen_range(0..nodes);
                topology.add_link(a, b, rng.gen_range(1..=max_lag));
            }
        }
        topology
    }

    /// Reference minimum spanning forest (Kruskal) under the same total
    /// order the engine uses, returned as sorted index pairs.
    pub fn minimum_spanning_tree(&self, peers: &[PeerId]) -> BTreeSet<(usize, usize)> {
        let mut sorted: Vec<(EdgeWeight, Link)> = self
            .links
            .iter()
            .map(|l| {
                let weight = EdgeWeight::new(l.lag, Identifier::new(peers[l.a], peers[l.b]));
                (weight, *l)
            })
            .collect();
        sorted.sort_by(|x, y| x.0.cmp(&y.0));

        let mut sets = DisjointSets::new(self.nodes);
        sorted
            .into_iter()
            .filter(|(_, l)| sets.union(l.a, l.b))
            .map(|(_, l)| l.key())
            .collect()
    }
}

struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(size: usize) -> Self {
        DisjointSets {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge the sets of `a` and `b`; false if already joined
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        self.parent[ra] = rb;
        true
    }
}
