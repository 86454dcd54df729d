//! Discovery of active replica sets.
//!
//! When a request finds no usable active set for its name, it asks the
//! [`DiscoveryCoordinator`] for one and waits. The coordinator runs at most
//! one discovery per name at a time. Requests arriving while a discovery
//! is running simply join its queue of waiters.
//!
//! A discovery contacts the name's replica controllers one at a time, a
//! discovery period apart, preferring the closest controller not asked
//! yet. Once every controller has been asked, a second round starts. The
//! first controller that answers with a non-empty active set ends the
//! discovery: the set goes into the cache and all waiters are woken up in
//! the order they arrived.
//!
//! If the attempt limit is reached or the maximum wait time runs out
//! first, every waiting request fails. The failure says whether no
//! controller answered at all or whether the controllers answered but had
//! no active replicas to offer.

pub use super::error::DiscoveryFailure;

use super::nodes::NodeTable;
use super::pending::Event;
use super::select::closest_by_latency;
use super::stats::STATS_TARGET;
use super::{Core, Error};
use crate::base::message::{ActiveSetRequest, ActiveSetResponse};
use crate::base::{NodeId, RequestId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

//------------ Waiter --------------------------------------------------------

/// A request waiting for an active set.
///
/// The sender fires when the active set has been installed in the cache.
/// If the discovery fails, the sender is dropped after the request itself
/// has been failed.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub request_id: RequestId,
    pub tx: oneshot::Sender<()>,
}

//------------ PendingDiscovery ----------------------------------------------

/// The state of a running discovery.
#[derive(Debug)]
struct PendingDiscovery {
    /// Distinguishes this run from earlier and later ones for the name.
    id: u64,

    /// Requests waiting for the result, oldest first.
    waiters: Vec<Waiter>,

    /// Controllers asked in the current round.
    queried: HashSet<NodeId>,

    /// Controllers asked at any point during this run.
    contacted: HashSet<NodeId>,

    /// The controller asked most recently.
    last: Option<NodeId>,

    /// Controller contacts so far.
    attempts: u32,

    started: Instant,

    /// Why the controllers that did answer were of no help.
    failure: Option<DiscoveryFailure>,
}

impl PendingDiscovery {
    fn new(id: u64, waiter: Waiter) -> Self {
        Self {
            id,
            waiters: vec![waiter],
            queried: HashSet::new(),
            contacted: HashSet::new(),
            last: None,
            attempts: 0,
            started: Instant::now(),
            failure: None,
        }
    }
}

//------------ DiscoveryCoordinator ------------------------------------------

/// Runs at most one discovery per name.
#[derive(Debug, Default)]
pub struct DiscoveryCoordinator {
    pending: DashMap<String, PendingDiscovery>,
    next_id: AtomicU64,
}

impl DiscoveryCoordinator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the number of names currently being discovered.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns whether a discovery for `name` is running.
    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    /// Returns the number of requests waiting for `name`'s active set.
    pub fn waiters(&self, name: &str) -> usize {
        self.pending.get(name).map_or(0, |pending| pending.waiters.len())
    }

    /// Returns the number of controllers contacted for `name` so far.
    pub fn attempts(&self, name: &str) -> u32 {
        self.pending.get(name).map_or(0, |pending| pending.attempts)
    }

    /// Adds `waiter` to the discovery for `name`, starting one if needed.
    ///
    /// If `repeated` is set, the waiting request has been told before that
    /// its active set was stale. A set in the middle of changing needs a
    /// moment to settle, so a discovery started for it holds off briefly
    /// before contacting the first controller.
    pub(crate) fn enqueue(
        &self,
        core: &Arc<Core>,
        name: &str,
        waiter: Waiter,
        repeated: bool,
    ) {
        let started = match self.pending.entry(name.into()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().waiters.push(waiter);
                debug!(
                    "joined discovery for {}, {} waiting",
                    name,
                    entry.get().waiters.len()
                );
                None
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                entry.insert(PendingDiscovery::new(id, waiter));
                Some(id)
            }
        };
        if let Some(id) = started {
            debug!("starting discovery {} for {}", id, name);
            tokio::spawn(run(core.clone(), name.into(), id, repeated));
        }
    }

    /// Contacts the next controller for the discovery `id` of `name`.
    ///
    /// Breaks once the discovery is over, one way or another.
    fn attempt(&self, core: &Core, name: &str, id: u64) -> ControlFlow<()> {
        let controllers = core.cache.controllers(name);
        let limit = core.discovery_limit(name);
        let table = core.nodes.table();

        let mut pending = match self.pending.get_mut(name) {
            Some(pending) if pending.id == id => pending,
            _ => return ControlFlow::Break(()),
        };
        if pending.attempts >= limit
            || pending.started.elapsed() >= core.config.max_wait()
            || controllers.is_empty()
        {
            drop(pending);
            self.exhaust(core, name, id);
            return ControlFlow::Break(());
        }

        let mut target =
            next_controller(&controllers, &pending.queried, &table);
        if target.is_none() {
            pending.queried.clear();
            target = next_controller(&controllers, &pending.queried, &table);
        }
        let target = match target {
            Some(target) => target,
            None => return ControlFlow::Continue(()),
        };
        pending.queried.insert(target);
        pending.contacted.insert(target);
        pending.last = Some(target);
        pending.attempts += 1;
        let attempt = pending.attempts;
        let waiters: Vec<_> =
            pending.waiters.iter().map(|w| w.request_id).collect();
        drop(pending);

        for request_id in waiters {
            core.registry.update(request_id, |record| {
                record.push_event(Event::QueriedController(target))
            });
        }
        debug!(
            "discovery {} for {}: attempt {}/{} asks controller {}",
            id, name, attempt, limit, target
        );
        let msg = ActiveSetRequest {
            name: name.into(),
            requesting_node: core.node_id,
        };
        if let Err(err) = core.transport.send_message(target, msg.into()) {
            warn!("discovery for {}: {}", name, err);
        }
        ControlFlow::Continue(())
    }

    /// Processes a controller's answer.
    ///
    /// A non-empty active set ends the discovery no matter who sent it.
    /// An unhelpful answer only counts if its sender was contacted by the
    /// running discovery, and it only ends the discovery early if it comes
    /// from the last controller the attempt limit allows. Answers from
    /// earlier controllers may arrive late while the last one is still
    /// working on its answer.
    pub(crate) fn handle_response(
        &self,
        core: &Core,
        msg: ActiveSetResponse,
    ) {
        let failure = match msg.active {
            Some(active) if !active.is_empty() => {
                core.cache.upsert_active_set(&msg.name, active);
                self.resolve(core, &msg.name, msg.responder);
                return;
            }
            Some(_) => DiscoveryFailure::NotReplicated,
            None => DiscoveryFailure::NoRecord,
        };

        debug!(
            "controller {} has no active replicas for {}: {}",
            msg.responder, msg.name, failure
        );
        let limit = core.discovery_limit(&msg.name);
        let exhausted = match self.pending.get_mut(&msg.name) {
            Some(mut pending)
                if pending.contacted.contains(&msg.responder) =>
            {
                pending.failure = Some(failure);
                (pending.attempts >= limit
                    && pending.last == Some(msg.responder))
                .then_some(pending.id)
            }
            Some(_) => {
                debug!(
                    "ignoring answer from controller {} not asked for {}",
                    msg.responder, msg.name
                );
                None
            }
            None => None,
        };
        if let Some(id) = exhausted {
            self.exhaust(core, &msg.name, id);
        }
    }

    /// Ends the discovery for `name` successfully.
    fn resolve(&self, core: &Core, name: &str, responder: NodeId) {
        let pending = match self.pending.remove(name) {
            Some((_, pending)) => pending,
            None => return,
        };
        debug!(
            "discovery {} for {} resolved by {} after {} attempts, \
             waking {} requests",
            pending.id,
            name,
            responder,
            pending.attempts,
            pending.waiters.len()
        );
        for waiter in pending.waiters {
            core.registry.update(waiter.request_id, |record| {
                record.push_event(Event::ActiveSetReceived)
            });
            let _ = waiter.tx.send(());
        }
    }

    /// Ends the discovery `id` for `name` and fails all its waiters.
    fn exhaust(&self, core: &Core, name: &str, id: u64) {
        let pending = match self.pending.remove_if(name, |_, p| p.id == id) {
            Some((_, pending)) => pending,
            None => return,
        };
        let failure = pending
            .failure
            .unwrap_or(DiscoveryFailure::NoControllerReachable);
        warn!(
            target: STATS_TARGET,
            "Discovery for {} exhausted after {} attempts in {}ms: {}, \
             failing {} requests",
            name,
            pending.attempts,
            pending.started.elapsed().as_millis(),
            failure,
            pending.waiters.len()
        );
        for waiter in pending.waiters {
            core.fail(
                waiter.request_id,
                Some(Event::DiscoveryFailed),
                Error::DiscoveryExhausted(failure),
            );
        }
    }
}

/// Drives discovery `id` for `name` until it ends.
async fn run(core: Arc<Core>, name: String, id: u64, repeated: bool) {
    let period = core.config.discovery_period();
    if repeated {
        sleep(period / 10).await;
    }
    while core.discovery.attempt(&core, &name, id).is_continue() {
        sleep(period).await;
    }
}

/// Picks the closest controller not asked yet.
///
/// Controllers with unknown latency are taken in id order.
fn next_controller(
    controllers: &[NodeId],
    queried: &HashSet<NodeId>,
    table: &NodeTable,
) -> Option<NodeId> {
    closest_by_latency(controllers, queried, table).or_else(|| {
        controllers.iter().find(|id| !queried.contains(id)).copied()
    })
}
