//! Requests waiting for their result.
//!
//! Every lookup and mutation accepted by the local name server is recorded
//! in the [`PendingRequestRegistry`] until its result has been delivered.
//! Several paths race to produce that result: a replica's response, an
//! error reply, the retry task giving up at the deadline, or the discovery
//! coordinator running out of controllers. Whoever removes the record from
//! the registry first gets to deliver; everybody else finds the record
//! gone and drops what they had.

use super::error::Error;
use crate::base::{Field, NodeId, RequestId, ResultValue};
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use smallvec::SmallVec;
use std::fmt::{self, Write};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

//------------ RequestKind ---------------------------------------------------

/// The kind of a pending request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RequestKind {
    /// A field lookup.
    Lookup,

    /// A change to a field of an existing name.
    Update,

    /// The creation of a name.
    Add,

    /// The removal of a name.
    Remove,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            RequestKind::Lookup => "lookup",
            RequestKind::Update => "update",
            RequestKind::Add => "add",
            RequestKind::Remove => "remove",
        })
    }
}

//------------ Event ---------------------------------------------------------

/// Something that happened to a pending request.
///
/// The events of a request are logged when it fails so that the reason
/// can be reconstructed afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// A replica controller was sent the request.
    QueriedController(NodeId),

    /// An active replica was sent the request.
    QueriedReplica(NodeId),

    /// The result was found in the cache.
    CacheHit,

    /// The maximum wait time passed.
    Timeout,

    /// A replica reported it is not active for the name.
    InvalidActiveError(NodeId),

    /// The request had to wait for the active set to be discovered.
    DiscoveryRequested,

    /// Discovery delivered an active set.
    ActiveSetReceived,

    /// Discovery gave up.
    DiscoveryFailed,

    /// A node answered.
    Response(NodeId),

    /// The transport refused a message for a node.
    SendFailed(NodeId),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::QueriedController(node) => write!(f, "QC{}", node),
            Event::QueriedReplica(node) => write!(f, "QR{}", node),
            Event::CacheHit => f.write_str("CH"),
            Event::Timeout => f.write_str("TO"),
            Event::InvalidActiveError(node) => write!(f, "IA{}", node),
            Event::DiscoveryRequested => f.write_str("DR"),
            Event::ActiveSetReceived => f.write_str("AS"),
            Event::DiscoveryFailed => f.write_str("DF"),
            Event::Response(node) => write!(f, "RE{}", node),
            Event::SendFailed(node) => write!(f, "SF{}", node),
        }
    }
}

//------------ Answer --------------------------------------------------------

/// The successful result of a pending request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Answer {
    /// The value of a looked up field.
    Value(ResultValue),

    /// The mutation was applied.
    Confirmed,
}

impl Answer {
    /// Returns the value of a lookup answer.
    pub fn into_value(self) -> Option<ResultValue> {
        match self {
            Answer::Value(value) => Some(value),
            Answer::Confirmed => None,
        }
    }
}

/// Where the result of a request goes.
pub type Reply = oneshot::Sender<Result<Answer, Error>>;

//------------ PendingRequest ------------------------------------------------

/// The record of a request that has not been answered yet.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    name: String,
    field: Field,
    kind: RequestKind,
    reply: Option<Reply>,
    started: Instant,
    events: SmallVec<[Event; 8]>,

    /// How often the request had to wait for discovery.
    restarts: u32,
}

impl PendingRequest {
    /// Creates a new record.
    ///
    /// The identifier is assigned when the record is registered.
    pub fn new(
        name: String,
        field: Field,
        kind: RequestKind,
        reply: Reply,
    ) -> Self {
        Self {
            id: RequestId::new(0),
            name,
            field,
            kind,
            reply: Some(reply),
            started: Instant::now(),
            events: SmallVec::new(),
            restarts: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Returns when the request was accepted.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Returns how long the request has been waiting.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn push_event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Counts one more wait for discovery and returns the new count.
    pub fn restart(&mut self) -> u32 {
        self.restarts += 1;
        self.restarts
    }

    /// Renders the event history as a compact string.
    pub fn event_log(&self) -> String {
        let mut res = String::new();
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                res.push(':');
            }
            let _ = write!(res, "{}", event);
        }
        res
    }

    /// Delivers the result to the caller.
    ///
    /// Returns whether the caller was still listening.
    pub fn complete(mut self, outcome: Result<Answer, Error>) -> bool {
        match self.reply.take() {
            Some(reply) => reply.send(outcome).is_ok(),
            None => false,
        }
    }
}

//------------ PendingRequestRegistry ----------------------------------------

/// All requests that are waiting for their result.
#[derive(Debug, Default)]
pub struct PendingRequestRegistry {
    requests: DashMap<RequestId, PendingRequest>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Stores `record` under a fresh identifier and returns it.
    ///
    /// Identifiers are drawn at random until one is found that no other
    /// pending request uses.
    pub fn register(&self, mut record: PendingRequest) -> RequestId {
        loop {
            let id = RequestId::new(rand::random());
            if let Entry::Vacant(entry) = self.requests.entry(id) {
                record.id = id;
                entry.insert(record);
                return id;
            }
        }
    }

    /// Returns the record for `id` if it is still pending.
    ///
    /// The returned reference locks part of the registry. Don't hold on
    /// to it.
    pub fn get(
        &self,
        id: RequestId,
    ) -> Option<Ref<'_, RequestId, PendingRequest>> {
        self.requests.get(&id)
    }

    /// Applies `op` to the record for `id` if it is still pending.
    pub fn update<R>(
        &self,
        id: RequestId,
        op: impl FnOnce(&mut PendingRequest) -> R,
    ) -> Option<R> {
        self.requests.get_mut(&id).map(|mut record| op(&mut record))
    }

    /// Takes the record for `id` out of the registry.
    ///
    /// Of any number of concurrent calls for the same identifier, exactly
    /// one receives the record.
    pub fn remove(&self, id: RequestId) -> Option<PendingRequest> {
        self.requests.remove(&id).map(|(_, record)| record)
    }

    /// Returns whether the request `id` is still waiting for its result.
    pub fn exists_still(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    fn record(
        kind: RequestKind,
    ) -> (PendingRequest, oneshot::Receiver<Result<Answer, Error>>) {
        let (tx, rx) = oneshot::channel();
        (PendingRequest::new("g1".into(), "addr".into(), kind, tx), rx)
    }

    #[tokio::test]
    async fn register_and_remove() {
        let registry = PendingRequestRegistry::new();
        let (rec, rx) = record(RequestKind::Lookup);
        let id = registry.register(rec);
        assert!(registry.exists_still(id));
        assert_eq!(registry.get(id).map(|rec| rec.id()), Some(id));

        registry.update(id, |rec| rec.push_event(Event::CacheHit));
        let rec = registry.remove(id).unwrap();
        assert_eq!(rec.events(), &[Event::CacheHit]);
        assert!(!registry.exists_still(id));
        assert!(registry.remove(id).is_none());
        assert!(registry.update(id, |_| ()).is_none());

        assert!(rec.complete(Ok(Answer::Value(vec!["x".into()]))));
        assert_eq!(rx.await.unwrap(), Ok(Answer::Value(vec!["x".into()])));
    }

    #[test]
    fn ids_are_unique() {
        let registry = PendingRequestRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..1000 {
            let (rec, rx) = record(RequestKind::Update);
            registry.register(rec);
            receivers.push(rx);
        }
        assert_eq!(registry.len(), 1000);
    }

    #[test]
    fn concurrent_completions_deliver_once() {
        for _ in 0..50 {
            let registry = Arc::new(PendingRequestRegistry::new());
            let (rec, mut rx) = record(RequestKind::Lookup);
            let id = registry.register(rec);
            let delivered = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(3));

            let outcomes = [
                Ok(Answer::Value(vec!["cache".into()])),
                Ok(Answer::Value(vec!["network".into()])),
                Err(Error::Timeout),
            ];
            let handles: Vec<_> = outcomes
                .into_iter()
                .map(|outcome| {
                    let registry = registry.clone();
                    let delivered = delivered.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        if let Some(rec) = registry.remove(id) {
                            delivered.fetch_add(1, Ordering::SeqCst);
                            rec.complete(outcome);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(delivered.load(Ordering::SeqCst), 1);
            assert!(rx.try_recv().is_ok());
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn event_log() {
        let (mut rec, _rx) = record(RequestKind::Lookup);
        rec.push_event(Event::DiscoveryRequested);
        rec.push_event(Event::QueriedReplica(NodeId::new(7)));
        rec.push_event(Event::Timeout);
        assert_eq!(rec.event_log(), "DR:QR7:TO");
        assert_eq!(rec.restart(), 1);
        assert_eq!(rec.restarts(), 1);
    }
}
