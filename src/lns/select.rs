//! Server selection policies.
//!
//! All policies are pure functions of a candidate set, a set of nodes that
//! have already been tried and must not be picked again, and the current
//! [`NodeTable`]. They return `None` when no candidate is eligible; callers
//! take that as the signal to rediscover the active set or to give up.

use super::nodes::NodeTable;
use crate::base::NodeId;
use std::collections::HashSet;
use std::fmt;

/// The load weight used unless configured otherwise.
///
/// One unit of load weighs as much as five milliseconds of latency, so load
/// only decides between replicas at comparable distance.
pub const DEFAULT_LOAD_WEIGHT: f64 = 5.0;

//------------ SelectionPolicy -----------------------------------------------

/// How to pick a replica out of an active set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SelectionPolicy {
    /// Pick the replica with the smallest latency.
    #[default]
    ClosestLatency,

    /// Pick the replica minimizing latency plus weighted load.
    LatencyPlusLoad,

    /// Walk the ordered ring of candidates from the closest node.
    Beehive,
}

impl SelectionPolicy {
    /// Picks a node from `candidates` that is not in `excluded`.
    pub fn select(
        self,
        candidates: &[NodeId],
        excluded: &HashSet<NodeId>,
        table: &NodeTable,
        load_weight: f64,
    ) -> Option<NodeId> {
        match self {
            SelectionPolicy::ClosestLatency => {
                closest_by_latency(candidates, excluded, table)
            }
            SelectionPolicy::LatencyPlusLoad => {
                latency_plus_load(candidates, excluded, table, load_weight)
            }
            SelectionPolicy::Beehive => consistent_ring_select(
                table.closest()?,
                candidates,
                excluded,
            ),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            SelectionPolicy::ClosestLatency => "closest-latency",
            SelectionPolicy::LatencyPlusLoad => "latency-plus-load",
            SelectionPolicy::Beehive => "beehive",
        })
    }
}

//------------ Policies ------------------------------------------------------

/// Picks the eligible candidate with the smallest known latency.
///
/// Candidates without a latency measurement are not considered. Ties go to
/// the lower node id.
pub fn closest_by_latency(
    candidates: &[NodeId],
    excluded: &HashSet<NodeId>,
    table: &NodeTable,
) -> Option<NodeId> {
    candidates
        .iter()
        .filter(|id| !excluded.contains(id))
        .filter_map(|id| Some((table.latency(*id)?, *id)))
        .min()
        .map(|(_, id)| id)
}

/// Picks the eligible candidate minimizing `latency + weight * load`.
///
/// Latency is taken in milliseconds. Candidates without a latency
/// measurement are not considered; a missing load counts as zero.
pub fn latency_plus_load(
    candidates: &[NodeId],
    excluded: &HashSet<NodeId>,
    table: &NodeTable,
    weight: f64,
) -> Option<NodeId> {
    let mut best: Option<(f64, NodeId)> = None;
    for id in candidates.iter().filter(|id| !excluded.contains(id)) {
        let latency = match table.latency(*id) {
            Some(latency) => latency.as_secs_f64() * 1000.,
            None => continue,
        };
        let cost = latency + weight * table.load(*id).unwrap_or(0.);
        let better = match best {
            None => true,
            Some((best_cost, best_id)) => {
                cost < best_cost || (cost == best_cost && *id < best_id)
            }
        };
        if better {
            best = Some((cost, *id));
        }
    }
    best.map(|(_, id)| id)
}

/// Picks `closest` if eligible, else the next eligible candidate above it.
///
/// Candidates are arranged on a ring in ascending id order. Starting at
/// `closest`, the first eligible candidate at or above it is returned,
/// wrapping around to the smallest one. Adding or removing a candidate
/// therefore only moves the requests that pointed at it.
pub fn consistent_ring_select(
    closest: NodeId,
    candidates: &[NodeId],
    excluded: &HashSet<NodeId>,
) -> Option<NodeId> {
    let eligible = candidates.iter().filter(|id| !excluded.contains(id));
    let mut smallest = None;
    let mut above = None;
    for id in eligible {
        if *id >= closest && above.map_or(true, |above| *id < above) {
            above = Some(*id);
        }
        if smallest.map_or(true, |smallest| *id < smallest) {
            smallest = Some(*id);
        }
    }
    above.or(smallest)
}

//============ Testing =======================================================
