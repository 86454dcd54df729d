//! What the local name server knows about the other nodes.
//!
//! [`NodeTable`] holds the measured latency and the reported load of each
//! node. It is read on every server selection and replaced wholesale on
//! updates, so readers never wait for writers.
//!
//! [`NodeConfig`] adds the set of replica controllers and derives, for any
//! name, the controllers responsible for it. The placement is a pure
//! function of the name and the controller set, so every local name server
//! arrives at the same answer without asking anyone.

use crate::base::NodeId;
use arc_swap::ArcSwap;
use siphasher::sip::SipHasher24;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

/// Fixed key for placement hashing.
///
/// Placement must agree between nodes and across restarts, so the key is
/// a constant rather than a random secret.
const PLACEMENT_KEY: [u8; 16] = *b"gns-placement-v1";

//------------ NodeTable -----------------------------------------------------

/// A snapshot of per-node latency and load.
#[derive(Clone, Debug, Default)]
pub struct NodeTable {
    latencies: HashMap<NodeId, Duration>,
    loads: HashMap<NodeId, f64>,
}

impl NodeTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the latency to `node`, if it has been measured.
    pub fn latency(&self, node: NodeId) -> Option<Duration> {
        self.latencies.get(&node).copied()
    }

    /// Returns the last load reported by `node`, if any.
    pub fn load(&self, node: NodeId) -> Option<f64> {
        self.loads.get(&node).copied()
    }

    /// Sets the latency to `node`.
    pub fn set_latency(&mut self, node: NodeId, latency: Duration) {
        self.latencies.insert(node, latency);
    }

    /// Sets the load of `node`.
    pub fn set_load(&mut self, node: NodeId, load: f64) {
        self.loads.insert(node, load);
    }

    /// Returns the node with the smallest known latency.
    ///
    /// Ties go to the lower node id.
    pub fn closest(&self) -> Option<NodeId> {
        self.latencies
            .iter()
            .min_by(|(l_id, l_lat), (r_id, r_lat)| {
                l_lat.cmp(r_lat).then(l_id.cmp(r_id))
            })
            .map(|(id, _)| *id)
    }
}

//------------ NodeConfig ----------------------------------------------------

/// The node configuration of a local name server.
#[derive(Debug)]
pub struct NodeConfig {
    /// All replica controllers, sorted by their position on the hash ring.
    ring: Vec<(u64, NodeId)>,

    /// How many controllers are responsible for each name.
    replication: usize,

    /// Current latency and load information.
    table: ArcSwap<NodeTable>,
}

impl NodeConfig {
    /// Creates a configuration.
    ///
    /// Each name is placed on `replication` controllers out of
    /// `controllers`. A replication of zero is taken as one and one larger
    /// than the number of controllers as all of them.
    pub fn new(
        controllers: impl IntoIterator<Item = NodeId>,
        replication: usize,
        table: NodeTable,
    ) -> Self {
        let mut ring: Vec<_> = controllers
            .into_iter()
            .map(|id| (node_position(id), id))
            .collect();
        ring.sort_unstable();
        ring.dedup_by_key(|(_, id)| *id);
        let replication = replication.clamp(1, ring.len().max(1));
        Self {
            ring,
            replication,
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Returns all replica controllers in ascending id order.
    pub fn controllers(&self) -> Vec<NodeId> {
        let mut res: Vec<_> = self.ring.iter().map(|(_, id)| *id).collect();
        res.sort_unstable();
        res
    }

    /// Returns the number of controllers responsible for each name.
    pub fn replication(&self) -> usize {
        self.replication
    }

    /// Returns the controllers responsible for `name`.
    ///
    /// These are the first `replication` controllers found walking the
    /// hash ring clockwise from the name's position. The result is never
    /// empty unless no controllers are configured at all.
    pub fn controllers_for(&self, name: &str) -> Vec<NodeId> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let pos = name_position(name);
        let start = self.ring.partition_point(|(p, _)| *p < pos);
        let mut res: Vec<_> = self
            .ring
            .iter()
            .cycle()
            .skip(start)
            .take(self.replication)
            .map(|(_, id)| *id)
            .collect();
        res.sort_unstable();
        res
    }

    /// Returns the current node table snapshot.
    pub fn table(&self) -> Arc<NodeTable> {
        self.table.load_full()
    }

    /// Records a new latency measurement for `node`.
    pub fn update_latency(&self, node: NodeId, latency: Duration) {
        self.table.rcu(|table| {
            let mut table = NodeTable::clone(table);
            table.set_latency(node, latency);
            table
        });
    }

    /// Records a new load report from `node`.
    pub fn update_load(&self, node: NodeId, load: f64) {
        self.table.rcu(|table| {
            let mut table = NodeTable::clone(table);
            table.set_load(node, load);
            table
        });
    }

    /// Returns the node closest to this one.
    pub fn closest_node(&self) -> Option<NodeId> {
        self.table.load().closest()
    }
}

//------------ Placement helpers ---------------------------------------------

fn node_position(id: NodeId) -> u64 {
    let mut hasher = SipHasher24::new_with_key(&PLACEMENT_KEY);
    hasher.write_u32(id.into_u32());
    hasher.finish()
}

fn name_position(name: &str) -> u64 {
    let mut hasher = SipHasher24::new_with_key(&PLACEMENT_KEY);
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// Returns the replica that coordinates changes to `name` by default.
///
/// Every node picks the same one out of `nodes` for a given name. The
/// result only feeds diagnostics.
pub fn default_coordinator(name: &str, nodes: &[NodeId]) -> Option<NodeId> {
    nodes
        .iter()
        .map(|id| {
            let mut hasher = SipHasher24::new_with_key(&PLACEMENT_KEY);
            hasher.write(name.as_bytes());
            hasher.write_u32(id.into_u32());
            (hasher.finish(), *id)
        })
        .min()
        .map(|(_, id)| id)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    fn ids(ids: &[u32]) -> Vec<NodeId> {
        ids.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn placement_is_stable_and_sized() {
        let config =
            NodeConfig::new(ids(&[1, 2, 3, 4, 5]), 3, NodeTable::new());
        for name in ["g1", "g2", "some-longer-name", "x"] {
            let first = config.controllers_for(name);
            assert_eq!(first.len(), 3);
            assert_eq!(first, config.controllers_for(name));
            let again =
                NodeConfig::new(ids(&[5, 4, 3, 2, 1]), 3, NodeTable::new());
            assert_eq!(first, again.controllers_for(name));
        }
    }

    #[test]
    fn replication_is_clamped() {
        let config = NodeConfig::new(ids(&[7, 8]), 5, NodeTable::new());
        assert_eq!(config.replication(), 2);
        assert_eq!(config.controllers_for("g1"), ids(&[7, 8]));
        let config = NodeConfig::new(ids(&[7, 8]), 0, NodeTable::new());
        assert_eq!(config.replication(), 1);
        assert_eq!(config.controllers_for("g1").len(), 1);
        let config = NodeConfig::new(Vec::new(), 3, NodeTable::new());
        assert!(config.controllers_for("g1").is_empty());
    }

    #[test]
    fn table_updates() {
        let config = NodeConfig::new(ids(&[1, 2]), 2, NodeTable::new());
        assert_eq!(config.closest_node(), None);
        config.update_latency(NodeId::new(2), Duration::from_millis(20));
        config.update_latency(NodeId::new(1), Duration::from_millis(30));
        assert_eq!(config.closest_node(), Some(NodeId::new(2)));
        config.update_latency(NodeId::new(1), Duration::from_millis(20));
        assert_eq!(config.closest_node(), Some(NodeId::new(1)));
        config.update_load(NodeId::new(1), 0.5);
        assert_eq!(config.table().load(NodeId::new(1)), Some(0.5));
    }

    #[test]
    fn default_coordinator_is_deterministic() {
        let nodes = ids(&[3, 9, 4]);
        let first = default_coordinator("g1", &nodes);
        assert!(first.is_some());
        assert_eq!(first, default_coordinator("g1", &ids(&[9, 4, 3])));
        assert_eq!(default_coordinator("g1", &[]), None);
    }
}
