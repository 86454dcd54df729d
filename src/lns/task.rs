//! The retry state machine shared by lookups and mutations.
//!
//! Every accepted request gets its own [`RetryTask`]. On each tick the task
//! checks whether the request is already done, whether its deadline has
//! passed, and whether the cache can answer it. Otherwise it picks a node
//! that hasn't been tried yet and sends it the request. If there is no node
//! to send to, the task waits for the discovery coordinator to find the
//! active replicas and then resumes right away.
//!
//! Responses are not received by the task. They are processed when they
//! arrive and complete the request by taking its record out of the
//! registry. The task notices at its next tick and stops.
//!
//! What differs between lookups and mutations is captured by the
//! [`Operation`] trait.

use super::discovery::Waiter;
use super::pending::{Answer, Event, PendingRequest, RequestKind};
use super::stats;
use super::{Core, Error};
use crate::base::{Message, NodeId, RequestId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{trace, warn};

//------------ Step ----------------------------------------------------------

/// What a tick decided.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Step {
    /// Wait for the next tick.
    Continue,

    /// The request has its result; stop.
    Done,

    /// There is nobody to ask; discover the active set first.
    Escalate,
}

//------------ Operation -----------------------------------------------------

/// The parts of a request that differ between lookups and mutations.
pub(crate) trait Operation: Send + 'static {
    fn kind(&self) -> RequestKind;

    fn name(&self) -> &str;

    fn field(&self) -> &str;

    /// Returns the answer if the cache has it.
    fn check_cache(&self, core: &Core) -> Option<Answer>;

    /// Returns the nodes the request may be sent to.
    ///
    /// `None` means they aren't known and have to be discovered.
    fn candidates(&self, core: &Core) -> Option<Vec<NodeId>>;

    /// Builds the request message.
    fn build_message(&self, core: &Core, id: RequestId) -> Message;

    /// Returns the event recording that `target` was sent the request.
    fn contacted(&self, target: NodeId) -> Event;
}

//------------ RetryTask -----------------------------------------------------

/// Drives one request to its result.
pub(crate) struct RetryTask<Op> {
    core: Arc<Core>,
    op: Op,
    request_id: RequestId,
    deadline: Instant,

    /// Nodes already sent the request in the current round.
    queried: HashSet<NodeId>,
}

impl<Op: Operation> RetryTask<Op> {
    /// Registers a request for `op` and starts working on it.
    ///
    /// Returns the receiver of the result.
    pub fn start(
        core: Arc<Core>,
        op: Op,
    ) -> oneshot::Receiver<Result<Answer, Error>> {
        let (tx, rx) = oneshot::channel();
        let record = PendingRequest::new(
            op.name().into(),
            op.field().into(),
            op.kind(),
            tx,
        );
        let deadline = record.started() + core.config.max_wait();
        let request_id = core.registry.register(record);
        trace!("request {}: {} {}", request_id, op.kind(), op.name());
        let task = RetryTask {
            core,
            op,
            request_id,
            deadline,
            queried: HashSet::new(),
        };
        tokio::spawn(task.run());
        rx
    }

    async fn run(mut self) {
        let interval = self.core.config.retransmission_interval();
        loop {
            match self.tick() {
                Step::Continue => {
                    let next = Instant::now() + interval;
                    sleep_until(next.min(self.deadline)).await;
                }
                Step::Done => return,
                Step::Escalate => {
                    if self.await_active_set().await == Step::Done {
                        return;
                    }
                }
            }
        }
    }

    fn tick(&mut self) -> Step {
        let core = &*self.core;
        let id = self.request_id;

        if !core.registry.exists_still(id) {
            return Step::Done;
        }
        if Instant::now() >= self.deadline {
            core.fail(id, Some(Event::Timeout), Error::Timeout);
            return Step::Done;
        }
        if let Some(answer) = self.op.check_cache(core) {
            if let Some(mut record) = core.registry.remove(id) {
                record.push_event(Event::CacheHit);
                stats::log_cache_hit(&record);
                record.complete(Ok(answer));
            }
            return Step::Done;
        }

        let candidates = match self.op.candidates(core) {
            Some(candidates) => candidates,
            None => return Step::Escalate,
        };
        let target = match core.select(&candidates, &self.queried) {
            Some(target) => target,
            None => {
                self.queried.clear();
                match core.select(&candidates, &self.queried) {
                    Some(target) => target,
                    None => return Step::Escalate,
                }
            }
        };
        self.queried.insert(target);

        let event = self.op.contacted(target);
        core.registry.update(id, |record| record.push_event(event));
        let msg = self.op.build_message(core, id);
        if let Err(err) = core.transport.send_message(target, msg) {
            warn!("request {} for {}: {}", id, self.op.name(), err);
            core.registry.update(id, |record| {
                record.push_event(Event::SendFailed(target))
            });
        }
        Step::Continue
    }

    /// Waits until discovery has found the active set.
    ///
    /// Returns [`Step::Continue`] if the task should tick again right away
    /// and [`Step::Done`] if the request already has its result.
    async fn await_active_set(&mut self) -> Step {
        let core = &self.core;
        let id = self.request_id;
        let restarts = core.registry.update(id, |record| {
            record.push_event(Event::DiscoveryRequested);
            record.restarts()
        });
        let restarts = match restarts {
            Some(restarts) => restarts,
            None => return Step::Done,
        };

        let (tx, rx) = oneshot::channel();
        core.discovery.enqueue(
            core,
            self.op.name(),
            Waiter { request_id: id, tx },
            restarts > 0,
        );
        match timeout_at(self.deadline, rx).await {
            Ok(Ok(())) => Step::Continue,
            // Discovery failed and has completed the request.
            Ok(Err(_)) => Step::Done,
            // The next tick notices the deadline.
            Err(_) => Step::Continue,
        }
    }
}
