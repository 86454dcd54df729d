//! Field lookups.

use super::pending::{Answer, Event, RequestKind};
use super::task::Operation;
use super::{Core, Error};
use crate::base::message::{LookupError, LookupRequest, LookupResponse};
use crate::base::{Field, Message, NodeId, RequestId, ResponseCode};
use tracing::{debug, trace};

//------------ Lookup --------------------------------------------------------

/// A lookup of a single field, answered by an active replica.
pub(crate) struct Lookup {
    name: String,
    field: Field,
}

impl Lookup {
    pub fn new(name: &str, field: &str) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
        }
    }
}

impl Operation for Lookup {
    fn kind(&self) -> RequestKind {
        RequestKind::Lookup
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn field(&self) -> &str {
        &self.field
    }

    fn check_cache(&self, core: &Core) -> Option<Answer> {
        core.cache
            .lookup_value(&self.name, &self.field)
            .map(Answer::Value)
    }

    fn candidates(&self, core: &Core) -> Option<Vec<NodeId>> {
        core.cache.lookup_active_set(&self.name)
    }

    fn build_message(&self, core: &Core, id: RequestId) -> Message {
        LookupRequest {
            request_id: id,
            name: self.name.clone(),
            field: self.field.clone(),
            sender: core.node_id,
        }
        .into()
    }

    fn contacted(&self, target: NodeId) -> Event {
        Event::QueriedReplica(target)
    }
}

//------------ Response processing -------------------------------------------

/// Returns whether `id` is a pending lookup.
fn is_pending_lookup(core: &Core, id: RequestId) -> bool {
    match core.registry.get(id) {
        Some(record) if record.kind() == RequestKind::Lookup => true,
        Some(_) => {
            debug!("lookup reply for non-lookup request {}", id);
            false
        }
        None => false,
    }
}

/// Processes a replica's answer to a lookup.
pub(crate) fn handle_response(core: &Core, msg: LookupResponse) {
    let record = match is_pending_lookup(core, msg.request_id)
        .then(|| core.registry.remove(msg.request_id))
        .flatten()
    {
        Some(record) => record,
        None => {
            trace!("dropping late lookup response {}", msg.request_id);
            return;
        }
    };
    let name = record.name();
    let ttl = msg.ttl.unwrap_or_else(|| core.config.default_ttl());
    core.cache.upsert_from_response(
        name,
        record.field(),
        msg.value.clone(),
        ttl,
    );
    if let Some(active) = msg.active {
        if !active.is_empty() {
            core.cache.upsert_active_set(name, active);
        }
    }
    core.stats.inc_lookup_response(name);
    core.succeed(record, msg.responder, Answer::Value(msg.value));
}

/// Processes a replica's error reply to a lookup.
pub(crate) fn handle_error(core: &Core, msg: LookupError) {
    if !is_pending_lookup(core, msg.request_id) {
        trace!("dropping late lookup error {}", msg.request_id);
        return;
    }
    if !msg.code.is_error() {
        debug!("lookup error {} without error code", msg.request_id);
        return;
    }
    let error = match msg.code {
        ResponseCode::InvalidActiveSet => {
            core.invalid_active(msg.request_id, msg.responder);
            return;
        }
        ResponseCode::RecordNotFound => Error::RecordNotFound,
        code => Error::Server(code),
    };
    core.fail(msg.request_id, Some(Event::Response(msg.responder)), error);
}
