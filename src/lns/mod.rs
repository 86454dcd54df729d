//! The local name server resolution core.
//!
//! A [`LocalNameServer`] accepts lookups and mutations for names and drives
//! each of them to exactly one result. It keeps a [cache] of field values
//! and of the replicas serving each name, discovers the active replicas of
//! a name from its replica controllers when the cache doesn't know them
//! ([discovery]), picks the replica to ask using one of the [select]
//! policies, and retransmits until an answer arrives or the maximum wait
//! time has passed ([task]).
//!
//! The server is a cheap handle. Clones share the same state, and any
//! number of independent servers can exist in one process.
//!
//! # Example
//!
//! ```no_run
//! use gns::base::NodeId;
//! use gns::lns::nodes::{NodeConfig, NodeTable};
//! use gns::lns::transport::ChannelTransport;
//! use gns::lns::{Config, LocalNameServer};
//!
//! # async fn run() {
//! let controllers = [1, 2, 3].map(NodeId::new);
//! let nodes = NodeConfig::new(controllers, 3, NodeTable::new());
//! let (transport, mut outbound) = ChannelTransport::new();
//! let lns = LocalNameServer::new(
//!     NodeId::new(100), nodes, transport, Config::default()
//! );
//!
//! // Put outbound messages on the wire and feed replies back in.
//! let handle = lns.clone();
//! tokio::spawn(async move {
//!     while let Some((_dest, _msg)) = outbound.recv().await {
//!         // ... send, then eventually: handle.handle_message(reply);
//! #       let _ = &handle;
//!     }
//! });
//!
//! let addr = lns.resolve("g1", "addr").await;
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod discovery;
pub mod error;
pub mod nodes;
pub mod pending;
pub mod select;
pub mod stats;
pub mod transport;

mod lookup;
mod mutation;
mod task;

pub use self::error::{DiscoveryFailure, Error};

use self::cache::ReplicaSetCache;
use self::discovery::DiscoveryCoordinator;
use self::lookup::Lookup;
use self::mutation::Mutation;
use self::nodes::{default_coordinator, NodeConfig};
use self::pending::{
    Answer, Event, PendingRequest, PendingRequestRegistry,
};
use self::select::{SelectionPolicy, DEFAULT_LOAD_WEIGHT};
use self::stats::Stats;
use self::task::RetryTask;
use self::transport::SendMessage;
use crate::base::{
    is_routable_name, Message, MutationOp, NodeId, RequestId, ResultValue,
    Ttl,
};
use crate::utils::config::DefMinMax;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

//------------ Config ---------------------------------------------------------

/// Time between retransmissions of a request.
const RETRANSMISSION_INTERVAL: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(2),
    Duration::from_millis(10),
    Duration::from_secs(60),
);

/// Time after which a request fails.
const MAX_WAIT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(16),
    Duration::from_millis(100),
    Duration::from_secs(3600),
);

/// Time between contacts of replica controllers during discovery.
const DISCOVERY_PERIOD: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(1),
    Duration::from_millis(10),
    Duration::from_secs(60),
);

/// Explicit limit on controller contacts per discovery run.
///
/// Unset by default, in which case the limit is derived from the number
/// of controllers of the name.
const MAX_DISCOVERY_ATTEMPTS: DefMinMax<u32> = DefMinMax::new(1, 1, 64);

/// Number of invalid active set errors a request survives.
const MAX_RESTARTS: DefMinMax<u32> = DefMinMax::new(3, 0, 100);

/// Number of names kept in the cache.
const CACHE_CAPACITY: DefMinMax<u64> =
    DefMinMax::new(1_000, 1, 1_000_000_000);

/// TTL of values whose replica didn't provide one.
const DEFAULT_TTL: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(2),
    Duration::from_secs(1),
    Duration::from_secs(86_400),
);

/// Configuration of a local name server.
#[derive(Clone, Debug)]
pub struct Config {
    retransmission_interval: Duration,
    max_wait: Duration,
    discovery_period: Duration,
    max_discovery_attempts: Option<u32>,
    max_restarts: u32,
    cache_capacity: u64,
    default_ttl: Duration,
    load_weight: f64,
    selection_policy: SelectionPolicy,
}

impl Config {
    /// Creates a new config with default values.
    ///
    /// The default values are documented at the relevant set_* methods.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the time between retransmissions of a request.
    pub fn retransmission_interval(&self) -> Duration {
        self.retransmission_interval
    }

    /// Sets the time between retransmissions of a request.
    ///
    /// The value has to be at least 10 ms, at most 60 seconds and the
    /// default is 2 seconds.
    pub fn set_retransmission_interval(&mut self, value: Duration) {
        self.retransmission_interval = RETRANSMISSION_INTERVAL.limit(value)
    }

    /// Returns the time after which a request fails.
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Sets the time after which a request fails.
    ///
    /// The value has to be at least 100 ms, at most one hour and the
    /// default is 16 seconds.
    pub fn set_max_wait(&mut self, value: Duration) {
        self.max_wait = MAX_WAIT.limit(value)
    }

    /// Returns the time between controller contacts during discovery.
    pub fn discovery_period(&self) -> Duration {
        self.discovery_period
    }

    /// Sets the time between controller contacts during discovery.
    ///
    /// The value has to be at least 10 ms, at most 60 seconds and the
    /// default is one second.
    pub fn set_discovery_period(&mut self, value: Duration) {
        self.discovery_period = DISCOVERY_PERIOD.limit(value)
    }

    /// Returns the explicit limit on controller contacts, if set.
    pub fn max_discovery_attempts(&self) -> Option<u32> {
        self.max_discovery_attempts
    }

    /// Sets a fixed limit on controller contacts per discovery run.
    ///
    /// The value has to be between 1 and 64. Without a fixed limit, each
    /// controller of a name is contacted once, or twice if two full
    /// rounds fit into the maximum wait time. `None` restores that.
    pub fn set_max_discovery_attempts(&mut self, value: Option<u32>) {
        self.max_discovery_attempts =
            value.map(|value| MAX_DISCOVERY_ATTEMPTS.limit(value))
    }

    /// Returns how many invalid active set errors a request survives.
    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    /// Sets how many invalid active set errors a request survives.
    ///
    /// The value has to be at most 100 and the default is 3.
    pub fn set_max_restarts(&mut self, value: u32) {
        self.max_restarts = MAX_RESTARTS.limit(value)
    }

    /// Returns the maximum number of names in the cache.
    pub fn cache_capacity(&self) -> u64 {
        self.cache_capacity
    }

    /// Sets the maximum number of names in the cache.
    ///
    /// The value has to be at least one, at most 1,000,000,000 and the
    /// default is 1000.
    pub fn set_cache_capacity(&mut self, value: u64) {
        self.cache_capacity = CACHE_CAPACITY.limit(value)
    }

    /// Returns the TTL used for values that arrive without one.
    pub fn default_ttl(&self) -> Ttl {
        Ttl::from_secs(self.default_ttl.as_secs() as i64)
    }

    /// Sets the TTL used for values that arrive without one.
    ///
    /// The value has to be at least one second, at most one day and the
    /// default is 2 seconds. Whole seconds only.
    pub fn set_default_ttl(&mut self, value: Duration) {
        self.default_ttl = DEFAULT_TTL.limit(value)
    }

    /// Returns the weight of load against latency in milliseconds.
    pub fn load_weight(&self) -> f64 {
        self.load_weight
    }

    /// Sets the weight of load against latency in milliseconds.
    ///
    /// Negative and non-finite values are ignored. The default is 5.
    pub fn set_load_weight(&mut self, value: f64) {
        if value.is_finite() && value >= 0. {
            self.load_weight = value
        }
    }

    /// Returns the replica selection policy.
    pub fn selection_policy(&self) -> SelectionPolicy {
        self.selection_policy
    }

    /// Sets the replica selection policy.
    ///
    /// The default is [`SelectionPolicy::ClosestLatency`].
    pub fn set_selection_policy(&mut self, value: SelectionPolicy) {
        self.selection_policy = value
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retransmission_interval: RETRANSMISSION_INTERVAL.default(),
            max_wait: MAX_WAIT.default(),
            discovery_period: DISCOVERY_PERIOD.default(),
            max_discovery_attempts: None,
            max_restarts: MAX_RESTARTS.default(),
            cache_capacity: CACHE_CAPACITY.default(),
            default_ttl: DEFAULT_TTL.default(),
            load_weight: DEFAULT_LOAD_WEIGHT,
            selection_policy: SelectionPolicy::default(),
        }
    }
}

//------------ LocalNameServer ------------------------------------------------

/// A local name server.
#[derive(Clone)]
pub struct LocalNameServer {
    core: Arc<Core>,
}

impl LocalNameServer {
    /// Creates a new local name server.
    ///
    /// Must be called from within a Tokio runtime context before any
    /// request is made. Requests spawn tasks onto the runtime.
    pub fn new(
        node_id: NodeId,
        nodes: NodeConfig,
        transport: impl SendMessage,
        config: Config,
    ) -> Self {
        let nodes = Arc::new(nodes);
        Self {
            core: Arc::new(Core {
                node_id,
                cache: ReplicaSetCache::new(
                    config.cache_capacity(),
                    nodes.clone(),
                ),
                nodes,
                registry: PendingRequestRegistry::new(),
                discovery: DiscoveryCoordinator::new(),
                stats: Stats::new(config.cache_capacity()),
                transport: Arc::new(transport),
                config,
            }),
        }
    }

    /// Returns the value of `field` of `name`.
    pub async fn resolve(
        &self,
        name: &str,
        field: &str,
    ) -> Result<ResultValue, Error> {
        if !is_routable_name(name) {
            return Err(Error::Malformed("empty name"));
        }
        if field.is_empty() {
            return Err(Error::Malformed("empty field"));
        }
        self.core.stats.inc_lookup(name);
        let rx =
            RetryTask::start(self.core.clone(), Lookup::new(name, field));
        match rx.await {
            Ok(res) => res.map(|answer| {
                answer.into_value().unwrap_or_default()
            }),
            Err(_) => Err(Error::ShutDown),
        }
    }

    /// Applies a change to `name`.
    ///
    /// `old_value` is only used by [`MutationOp::CompareAndReplace`], for
    /// which it is required.
    pub async fn mutate(
        &self,
        name: &str,
        field: &str,
        op: MutationOp,
        value: ResultValue,
        old_value: Option<ResultValue>,
    ) -> Result<(), Error> {
        if !is_routable_name(name) {
            return Err(Error::Malformed("empty name"));
        }
        if op.needs_field() && field.is_empty() {
            return Err(Error::Malformed("empty field"));
        }
        if op == MutationOp::CompareAndReplace && old_value.is_none() {
            return Err(Error::Malformed("missing old value"));
        }
        self.core.stats.inc_update(name);
        let rx = RetryTask::start(
            self.core.clone(),
            Mutation::new(name, field, op, value, old_value),
        );
        match rx.await {
            Ok(res) => res.map(|_| ()),
            Err(_) => Err(Error::ShutDown),
        }
    }

    /// Creates `name` with an initial value for `field`.
    pub async fn add_name(
        &self,
        name: &str,
        field: &str,
        value: ResultValue,
    ) -> Result<(), Error> {
        self.mutate(name, field, MutationOp::AddName, value, None)
            .await
    }

    /// Deletes `name`.
    pub async fn remove_name(&self, name: &str) -> Result<(), Error> {
        self.mutate(name, "", MutationOp::RemoveName, Vec::new(), None)
            .await
    }

    /// Processes a message received from the storage tier.
    pub fn handle_message(&self, msg: Message) {
        self.core.handle_message(msg)
    }

    /// Drops everything cached.
    pub fn invalidate_cache(&self) {
        self.core.cache.invalidate_all()
    }

    /// Returns the cache.
    pub fn cache(&self) -> &ReplicaSetCache {
        &self.core.cache
    }

    /// Returns the per-name statistics.
    pub fn stats(&self) -> &Stats {
        &self.core.stats
    }

    /// Returns the node configuration.
    pub fn nodes(&self) -> &NodeConfig {
        &self.core.nodes
    }

    /// Returns the identifier of this node.
    pub fn node_id(&self) -> NodeId {
        self.core.node_id
    }

    /// Returns the number of requests waiting for a result.
    pub fn pending_requests(&self) -> usize {
        self.core.registry.len()
    }

    /// Returns the number of names with a discovery in progress.
    pub fn pending_discoveries(&self) -> usize {
        self.core.discovery.len()
    }

    /// Returns the coordinator of active set discoveries.
    pub fn discovery(&self) -> &DiscoveryCoordinator {
        &self.core.discovery
    }
}

//------------ Core -----------------------------------------------------------

/// The state shared by all tasks of a local name server.
pub(crate) struct Core {
    node_id: NodeId,
    config: Config,
    nodes: Arc<NodeConfig>,
    cache: ReplicaSetCache,
    registry: PendingRequestRegistry,
    discovery: DiscoveryCoordinator,
    stats: Stats,
    transport: Arc<dyn SendMessage>,
}

impl Core {
    fn handle_message(&self, msg: Message) {
        if msg.is_request() {
            debug!("ignoring {} sent to a local name server", msg.kind());
            return;
        }
        if let Some(id) = msg.request_id() {
            if !self.registry.exists_still(id) {
                trace!("dropping late {} for request {}", msg.kind(), id);
                return;
            }
        }
        match msg {
            Message::LookupResponse(msg) => {
                lookup::handle_response(self, msg)
            }
            Message::LookupError(msg) => lookup::handle_error(self, msg),
            Message::MutationConfirm(msg) => {
                mutation::handle_confirm(self, msg)
            }
            Message::ActiveSetResponse(msg) => {
                self.discovery.handle_response(self, msg)
            }
            Message::LookupRequest(_)
            | Message::MutationRequest(_)
            | Message::ActiveSetRequest(_) => {}
        }
    }

    /// Picks a node out of `candidates` that is not in `excluded`.
    ///
    /// If the configured policy finds nothing because latencies are
    /// unknown, the eligible candidate with the lowest id is used.
    fn select(
        &self,
        candidates: &[NodeId],
        excluded: &HashSet<NodeId>,
    ) -> Option<NodeId> {
        let table = self.nodes.table();
        self.config
            .selection_policy()
            .select(candidates, excluded, &table, self.config.load_weight())
            .or_else(|| {
                candidates
                    .iter()
                    .filter(|id| !excluded.contains(id))
                    .min()
                    .copied()
            })
    }

    /// Returns the number of controller contacts allowed for `name`.
    fn discovery_limit(&self, name: &str) -> u32 {
        if let Some(limit) = self.config.max_discovery_attempts() {
            return limit;
        }
        let controllers = self.cache.controllers(name).len().max(1) as u32;
        let round = self.config.discovery_period() * controllers;
        if round * 2 <= self.config.max_wait() {
            controllers * 2
        } else {
            controllers
        }
    }

    /// Fails request `id` with `error`, unless it already has a result.
    fn fail(&self, id: RequestId, event: Option<Event>, error: Error) {
        let mut record = match self.registry.remove(id) {
            Some(record) => record,
            None => return,
        };
        if let Some(event) = event {
            record.push_event(event);
        }
        let nodes = self
            .cache
            .lookup_active_set(record.name())
            .unwrap_or_else(|| self.cache.controllers(record.name()));
        stats::log_failure(
            &record,
            &error,
            default_coordinator(record.name(), &nodes),
        );
        record.complete(Err(error));
    }

    /// Handles a replica reporting it isn't active for a request's name.
    ///
    /// The cached active set is dropped so the request's next tick
    /// rediscovers it. A request that keeps hitting stale sets fails.
    fn invalid_active(&self, id: RequestId, responder: NodeId) {
        let state = self.registry.update(id, |record| {
            record.push_event(Event::InvalidActiveError(responder));
            (record.name().to_string(), record.restart())
        });
        let (name, restarts) = match state {
            Some(state) => state,
            None => return,
        };
        debug!(
            "request {} for {}: node {} is not an active replica",
            id, name, responder
        );
        if restarts > self.config.max_restarts() {
            self.fail(id, None, Error::InvalidActiveSet);
        } else {
            self.cache.invalidate_active_set(&name);
        }
    }

    /// Delivers a successful result for a request taken from the registry.
    fn succeed(
        &self,
        mut record: PendingRequest,
        responder: NodeId,
        answer: Answer,
    ) {
        record.push_event(Event::Response(responder));
        stats::log_success(&record, responder);
        record.complete(Ok(answer));
    }
}
