//! Per-name statistics and the statistics log lines.
//!
//! Counters are best effort. They use relaxed atomics and may be slightly
//! behind under concurrent updates. Only a bounded number of names is
//! tracked; when the bound is reached, the counters of names not asked
//! about in a while are dropped.
//!
//! Log lines describing the outcome of individual requests are emitted to
//! the `gns::stats` target so they can be routed separately from the
//! operational log.

use super::error::Error;
use super::pending::PendingRequest;
use crate::base::NodeId;
use moka::sync::Cache;
use std::fmt::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// The log target for statistics lines.
pub const STATS_TARGET: &str = "gns::stats";

//------------ Stats ---------------------------------------------------------

/// Request counters for recently seen names.
pub struct Stats {
    names: Cache<String, Arc<NameCounters>>,
}

#[derive(Debug, Default)]
struct NameCounters {
    lookups: AtomicU64,
    lookup_responses: AtomicU64,
    updates: AtomicU64,
    update_responses: AtomicU64,
}

/// A snapshot of the counters of a name.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NameStats {
    pub lookups: u64,
    pub lookup_responses: u64,
    pub updates: u64,
    pub update_responses: u64,
}

impl Stats {
    /// Creates counters for at most `capacity` names.
    pub fn new(capacity: u64) -> Self {
        Self {
            names: Cache::new(capacity),
        }
    }

    /// Returns the number of names with counters.
    pub fn len(&self) -> u64 {
        self.names.run_pending_tasks();
        self.names.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inc_lookup(&self, name: &str) {
        self.with(name, |c| c.lookups.fetch_add(1, Ordering::Relaxed));
    }

    pub fn inc_lookup_response(&self, name: &str) {
        self.with(name, |c| {
            c.lookup_responses.fetch_add(1, Ordering::Relaxed)
        });
    }

    pub fn inc_update(&self, name: &str) {
        self.with(name, |c| c.updates.fetch_add(1, Ordering::Relaxed));
    }

    pub fn inc_update_response(&self, name: &str) {
        self.with(name, |c| {
            c.update_responses.fetch_add(1, Ordering::Relaxed)
        });
    }

    /// Returns the counters of `name`, if it has been seen.
    pub fn get(&self, name: &str) -> Option<NameStats> {
        self.names.get(name).map(|c| NameStats {
            lookups: c.lookups.load(Ordering::Relaxed),
            lookup_responses: c.lookup_responses.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            update_responses: c.update_responses.load(Ordering::Relaxed),
        })
    }

    /// Renders all counters, one name per line, sorted by name.
    pub fn log_string(&self) -> String {
        let mut names: Vec<_> =
            self.names.iter().map(|(name, _)| String::clone(&name)).collect();
        names.sort_unstable();
        let mut res = String::new();
        for name in names {
            if let Some(stats) = self.get(&name) {
                let _ = writeln!(
                    res,
                    "{} lookups={} lookup-responses={} updates={} \
                     update-responses={}",
                    name,
                    stats.lookups,
                    stats.lookup_responses,
                    stats.updates,
                    stats.update_responses
                );
            }
        }
        res
    }

    fn with(&self, name: &str, op: impl FnOnce(&NameCounters) -> u64) {
        op(&self.names.get_with_by_ref(name, Default::default));
    }
}

impl fmt::Debug for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stats")
            .field("names", &self.names.entry_count())
            .finish()
    }
}

//------------ Log lines -----------------------------------------------------

/// Logs the successful completion of a request.
pub fn log_success(record: &PendingRequest, responder: NodeId) {
    info!(
        target: STATS_TARGET,
        "Success {} {} {}/{} responder={} latency={}ms events={}",
        record.id(),
        record.kind(),
        record.name(),
        record.field(),
        responder,
        record.elapsed().as_millis(),
        record.event_log(),
    );
}

/// Logs a request answered from the cache.
pub fn log_cache_hit(record: &PendingRequest) {
    debug!(
        target: STATS_TARGET,
        "CacheHit {} {} {}/{}",
        record.id(),
        record.kind(),
        record.name(),
        record.field(),
    );
}

/// Logs the failure of a request with its full history.
pub fn log_failure(
    record: &PendingRequest,
    error: &Error,
    coordinator: Option<NodeId>,
) {
    info!(
        target: STATS_TARGET,
        "Failed {} {} {}/{} error=\"{}\" coordinator={} \
         elapsed={}ms restarts={} events={}",
        record.id(),
        record.kind(),
        record.name(),
        record.field(),
        error,
        coordinator.map_or_else(|| "-".into(), |node| node.to_string()),
        record.elapsed().as_millis(),
        record.restarts(),
        record.event_log(),
    );
}

//============ Testing =======================================================
