// File: testing/integration/src/cluster/topology.rs
//
// Peer graphs wired between nodes during network setup

use rand::seq::index::sample;
use rand::Rng;
use std::collections::BTreeSet;

/// Shape of the peer graph established by `setup_network`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// i <-> i+1; lets a test split the network between two neighbours
    Chain,
    /// every node connects to `hub`
    Star { hub: usize },
    /// every node connects to `peers` distinct random others
    Sample { peers: usize },
    /// no connections
    Isolated,
}

impl Default for Topology {
    fn default() -> Self {
        Self::Chain
    }
}

impl Topology {
    /// Directed `(from, to)` connection requests for `n` nodes.
    ///
    /// Each unordered pair appears at most once; `from` is the node asked to
    /// dial.
    pub fn edges<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<(usize, usize)> {
        match self {
            Self::Chain => (0..n.saturating_sub(1)).map(|i| (i, i + 1)).collect(),
            Self::Star { hub } => (0..n)
                .filter(|i| i != hub && *hub < n)
                .map(|i| (i, *hub))
                .collect(),
            Self::Sample { peers } => {
                let mut seen = BTreeSet::new();
                let mut edges = Vec::new();
                if n < 2 {
                    return edges;
                }
                let per_node = (*peers).min(n - 1);
                for from in 0..n {
                    // sample among the n-1 other nodes, then skip over `from`
                    for pick in sample(rng, n - 1, per_node) {
                        let to = if pick >= from { pick + 1 } else { pick };
                        let key = (from.min(to), from.max(to));
                        if seen.insert(key) {
                            edges.push((from, to));
                        }
                    }
                }
                edges
            }
            Self::Isolated => Vec::new(),
        }
    }
}
