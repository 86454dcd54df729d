//! Mutations: field updates and the creation and removal of names.
//!
//! Field updates go to the active replicas of a name. Creating and
//! removing names changes placement and is therefore handled by the
//! replica controllers. Otherwise mutations are retried exactly like
//! lookups, except that the cache can never answer them.

use super::pending::{Answer, Event, RequestKind};
use super::task::Operation;
use super::{Core, Error};
use crate::base::message::{MutationConfirm, MutationRequest};
use crate::base::{
    Field, Message, MutationOp, NodeId, RequestId, ResponseCode, ResultValue,
};
use tracing::{debug, trace};

//------------ Mutation ------------------------------------------------------

/// A change to a name's record.
pub(crate) struct Mutation {
    name: String,
    field: Field,
    op: MutationOp,
    new_value: ResultValue,
    old_value: Option<ResultValue>,
}

impl Mutation {
    pub fn new(
        name: &str,
        field: &str,
        op: MutationOp,
        new_value: ResultValue,
        old_value: Option<ResultValue>,
    ) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            op,
            new_value,
            old_value,
        }
    }
}

impl Operation for Mutation {
    fn kind(&self) -> RequestKind {
        match self.op {
            MutationOp::AddName => RequestKind::Add,
            MutationOp::RemoveName => RequestKind::Remove,
            _ => RequestKind::Update,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn field(&self) -> &str {
        &self.field
    }

    fn check_cache(&self, _core: &Core) -> Option<Answer> {
        None
    }

    fn candidates(&self, core: &Core) -> Option<Vec<NodeId>> {
        if self.op.targets_controllers() {
            let controllers = core.cache.controllers(&self.name);
            (!controllers.is_empty()).then_some(controllers)
        } else {
            core.cache.lookup_active_set(&self.name)
        }
    }

    fn build_message(&self, core: &Core, id: RequestId) -> Message {
        MutationRequest {
            request_id: id,
            name: self.name.clone(),
            field: self.field.clone(),
            op: self.op,
            new_value: self.new_value.clone(),
            old_value: self.old_value.clone(),
            sender: core.node_id,
        }
        .into()
    }

    fn contacted(&self, target: NodeId) -> Event {
        if self.op.targets_controllers() {
            Event::QueriedController(target)
        } else {
            Event::QueriedReplica(target)
        }
    }
}

//------------ Confirmation processing ---------------------------------------

/// Processes the confirmation of a mutation.
///
/// A successful mutation makes the cache catch up: a new name is served by
/// its controllers, a removed name is forgotten, and a changed field is
/// dropped so the next lookup fetches the new value.
pub(crate) fn handle_confirm(core: &Core, msg: MutationConfirm) {
    let id = msg.request_id;
    let (kind, name, field) = match core.registry.get(id) {
        Some(record) if record.kind() != RequestKind::Lookup => (
            record.kind(),
            record.name().to_string(),
            record.field().to_string(),
        ),
        Some(_) => {
            debug!("mutation confirmation for lookup request {}", id);
            return;
        }
        None => {
            trace!("dropping late mutation confirmation {}", id);
            return;
        }
    };

    if !msg.success {
        let error = match msg.code {
            ResponseCode::InvalidActiveSet => {
                core.invalid_active(id, msg.responder);
                return;
            }
            ResponseCode::RecordNotFound => Error::RecordNotFound,
            code => Error::MutationFailed(code),
        };
        core.stats.inc_update_response(&name);
        core.fail(id, Some(Event::Response(msg.responder)), error);
        return;
    }

    let record = match core.registry.remove(id) {
        Some(record) => record,
        None => return,
    };
    match kind {
        RequestKind::Add => {
            let controllers = core.cache.controllers(&name);
            core.cache.upsert_active_set(&name, controllers);
        }
        RequestKind::Remove => core.cache.invalidate(&name),
        RequestKind::Update | RequestKind::Lookup => {
            core.cache.invalidate_value(&name, &field)
        }
    }
    core.stats.inc_update_response(&name);
    core.succeed(record, msg.responder, Answer::Confirmed);
}
