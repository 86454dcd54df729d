//! The replica set cache.
//!
//! For every name the local name server has seen, the cache keeps the
//! field values it was last told about, the replica controllers that are
//! responsible for the name, and the active replicas currently serving it.
//! The parts go stale independently: a value can still be fresh while the
//! active set has been found to be wrong, and the other way around.
//!
//! The cache is bounded. Once it holds [`Config::cache_capacity`] names,
//! the least valuable entries are evicted. Nothing is lost by that beyond
//! the extra round trips needed to learn the name again.
//!
//! Each entry sits behind its own lock, so upserting a field of one name
//! never waits for work on another.
//!
//! [`Config::cache_capacity`]: super::Config::cache_capacity

use super::clock::{Clock, Elapsed, SystemClock};
use super::nodes::NodeConfig;
use crate::base::{Field, NodeId, ResultValue, Ttl, ValuesMap};
use moka::sync::Cache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::Duration;

//------------ ReplicaSetCache -----------------------------------------------

/// The cache of values and replica placement.
pub struct ReplicaSetCache<C: Clock = SystemClock> {
    entries: Cache<String, Arc<Mutex<CacheEntry<C::Instant>>>>,
    nodes: Arc<NodeConfig>,
    clock: C,
}

impl ReplicaSetCache {
    /// Creates a cache holding at most `capacity` names.
    pub fn new(capacity: u64, nodes: Arc<NodeConfig>) -> Self {
        Self::with_clock(capacity, nodes, SystemClock::new())
    }
}

impl<C: Clock> ReplicaSetCache<C> {
    /// Creates a cache that uses `clock` to age values.
    pub fn with_clock(
        capacity: u64,
        nodes: Arc<NodeConfig>,
        clock: C,
    ) -> Self {
        Self {
            entries: Cache::new(capacity),
            nodes,
            clock,
        }
    }

    /// Returns the value of `field` for `name` if it is cached and fresh.
    pub fn lookup_value(
        &self,
        name: &str,
        field: &str,
    ) -> Option<ResultValue> {
        let entry = self.entries.get(name)?;
        let entry = entry.lock();
        entry.fresh_value(field).cloned()
    }

    /// Returns all fresh field values of `name`.
    ///
    /// Returns `None` if no field of the name is fresh.
    pub fn lookup_values(&self, name: &str) -> Option<ValuesMap> {
        let entry = self.entries.get(name)?;
        let entry = entry.lock();
        let values: ValuesMap = entry
            .values
            .keys()
            .filter_map(|field| {
                let value = entry.fresh_value(field)?;
                Some((field.clone(), value.clone()))
            })
            .collect();
        (!values.is_empty()).then_some(values)
    }

    /// Returns the active replicas of `name` if they are known.
    ///
    /// An empty set is as good as no set at all.
    pub fn lookup_active_set(&self, name: &str) -> Option<Vec<NodeId>> {
        let entry = self.entries.get(name)?;
        let entry = entry.lock();
        entry.active.clone()
    }

    /// Returns the replica controllers responsible for `name`.
    ///
    /// If the name isn't cached, the set is derived from the placement
    /// function. It is only empty if no controllers are configured.
    pub fn controllers(&self, name: &str) -> Vec<NodeId> {
        match self.entries.get(name) {
            Some(entry) => entry.lock().controllers.clone(),
            None => self.nodes.controllers_for(name),
        }
    }

    /// Stores a field value received from a replica.
    pub fn upsert_from_response(
        &self,
        name: &str,
        field: &str,
        value: ResultValue,
        ttl: Ttl,
    ) {
        let entry = self.entry(name);
        let mut entry = entry.lock();
        entry.ttl = ttl;
        entry.values.insert(
            field.into(),
            CachedValue {
                value,
                cached_at: self.clock.now(),
            },
        );
    }

    /// Replaces the active replicas of `name`.
    ///
    /// Installing an empty set clears the active set instead.
    pub fn upsert_active_set(&self, name: &str, active: Vec<NodeId>) {
        let entry = self.entry(name);
        let mut entry = entry.lock();
        entry.active = if active.is_empty() { None } else { Some(active) };
    }

    /// Forgets the active replicas of `name`, keeping its values.
    pub fn invalidate_active_set(&self, name: &str) {
        if let Some(entry) = self.entries.get(name) {
            entry.lock().active = None;
        }
    }

    /// Forgets the cached value of a single field.
    pub fn invalidate_value(&self, name: &str, field: &str) {
        if let Some(entry) = self.entries.get(name) {
            entry.lock().values.remove(field);
        }
    }

    /// Removes everything known about `name`.
    pub fn invalidate(&self, name: &str) {
        self.entries.invalidate(name);
    }

    /// Removes all entries.
    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    /// Returns whether `name` has an entry.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns the number of cached names.
    ///
    /// The count is approximate while evictions are pending.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    /// Returns whether the cache holds no names.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the time since the value of `field` was cached.
    pub fn time_since_cached(
        &self,
        name: &str,
        field: &str,
    ) -> Option<Duration> {
        let entry = self.entries.get(name)?;
        let entry = entry.lock();
        entry.values.get(field).map(|value| value.cached_at.elapsed())
    }

    /// Returns a human readable dump of all entries, sorted by name.
    pub fn log_string(&self) -> String {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(name, entry)| (name, entry.lock().to_string()))
            .collect();
        entries.sort_unstable_by(|l, r| l.0.cmp(&r.0));
        let mut res = String::new();
        for (_, entry) in entries {
            let _ = writeln!(res, "{}", entry);
        }
        res
    }

    fn entry(&self, name: &str) -> Arc<Mutex<CacheEntry<C::Instant>>> {
        self.entries.get_with_by_ref(name, || {
            Arc::new(Mutex::new(CacheEntry::new(
                name.into(),
                self.nodes.controllers_for(name),
            )))
        })
    }
}

impl<C: Clock> fmt::Debug for ReplicaSetCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReplicaSetCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

//------------ CacheEntry ----------------------------------------------------

/// Everything cached about a single name.
#[derive(Debug)]
pub struct CacheEntry<I> {
    name: String,
    values: HashMap<Field, CachedValue<I>>,
    ttl: Ttl,
    controllers: Vec<NodeId>,

    /// Never holds an empty set.
    active: Option<Vec<NodeId>>,
}

#[derive(Debug)]
struct CachedValue<I> {
    value: ResultValue,
    cached_at: I,
}

impl<I: Elapsed> CacheEntry<I> {
    fn new(name: String, controllers: Vec<NodeId>) -> Self {
        Self {
            name,
            values: HashMap::new(),
            ttl: Ttl::DEFAULT,
            controllers,
            active: None,
        }
    }

    /// A value is usable if it is present and younger than the TTL.
    fn fresh_value(&self, field: &str) -> Option<&ResultValue> {
        let cached = self.values.get(field)?;
        if self.ttl.is_fresh(cached.cached_at.elapsed()) {
            Some(&cached.value)
        } else {
            None
        }
    }
}

impl<I: Elapsed> fmt::Display for CacheEntry<I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ttl={} controllers={:?}",
            self.name, self.ttl, self.controllers
        )?;
        match &self.active {
            Some(active) => write!(f, " active={:?}", active)?,
            None => f.write_str(" active=-")?,
        }
        let mut fields: Vec<_> = self.values.iter().collect();
        fields.sort_unstable_by(|l, r| l.0.cmp(r.0));
        for (field, cached) in fields {
            write!(
                f,
                " {}={:?} ({}s ago)",
                field,
                cached.value,
                cached.cached_at.elapsed().as_secs()
            )?;
        }
        Ok(())
    }
}

//============ Testing =======================================================
