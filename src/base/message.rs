//! Protocol messages.
//!
//! The local name server talks to two kinds of nodes: active replicas,
//! which answer lookups and apply field updates, and replica controllers,
//! which know the current active replica set of a name and handle the
//! creation and removal of names. The messages here are the logical
//! envelope of that conversation. How they are put on the wire is up to
//! the transport.

use super::{Field, NodeId, RequestId, ResultValue, Ttl};
use std::fmt;

//------------ ResponseCode --------------------------------------------------

/// The outcome code carried by error replies and mutation confirmations.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResponseCode {
    /// The request succeeded.
    NoError,

    /// The contacted node is not an active replica of the name (anymore).
    InvalidActiveSet,

    /// The name or field does not exist.
    RecordNotFound,

    /// Any other failure at the contacted node.
    GenericError,
}

impl ResponseCode {
    /// Returns whether the code reports a failure.
    pub fn is_error(self) -> bool {
        !matches!(self, ResponseCode::NoError)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ResponseCode::NoError => "NO_ERROR",
            ResponseCode::InvalidActiveSet => "INVALID_ACTIVE_SET",
            ResponseCode::RecordNotFound => "RECORD_NOT_FOUND",
            ResponseCode::GenericError => "GENERIC_ERROR",
        })
    }
}

//------------ MutationOp ----------------------------------------------------

/// The kind of change a mutation request asks for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MutationOp {
    /// Replace the field's value.
    Replace,

    /// Append to the field's value.
    Append,

    /// Remove the given values from the field.
    Remove,

    /// Clear the field.
    Clear,

    /// Replace the field's value only if it currently equals the old value.
    CompareAndReplace,

    /// Create the name with an initial field value.
    AddName,

    /// Delete the name and its record.
    RemoveName,
}

impl MutationOp {
    /// Returns whether the operation is handled by replica controllers.
    ///
    /// Creating and deleting names changes placement, so only the
    /// controllers can do it. Everything else goes to active replicas.
    pub fn targets_controllers(self) -> bool {
        matches!(self, MutationOp::AddName | MutationOp::RemoveName)
    }

    /// Returns whether the operation needs a field to act upon.
    pub fn needs_field(self) -> bool {
        !matches!(self, MutationOp::RemoveName)
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            MutationOp::Replace => "REPLACE",
            MutationOp::Append => "APPEND",
            MutationOp::Remove => "REMOVE",
            MutationOp::Clear => "CLEAR",
            MutationOp::CompareAndReplace => "COMPARE_AND_REPLACE",
            MutationOp::AddName => "ADD_NAME",
            MutationOp::RemoveName => "REMOVE_NAME",
        })
    }
}

//------------ Lookup messages -----------------------------------------------

/// A request for a field's value, sent to an active replica.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LookupRequest {
    /// The identifier to echo in the reply.
    pub request_id: RequestId,

    /// The name to look up.
    pub name: String,

    /// The field to look up.
    pub field: Field,

    /// The local name server sending the request.
    pub sender: NodeId,
}

/// A successful answer to a [`LookupRequest`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LookupResponse {
    /// The identifier of the request being answered.
    pub request_id: RequestId,

    /// The value of the field.
    pub value: ResultValue,

    /// How long the value may be cached, if the replica says so.
    pub ttl: Option<Ttl>,

    /// The replica that answered.
    pub responder: NodeId,

    /// The responder's view of the active replica set, if it included one.
    pub active: Option<Vec<NodeId>>,
}

/// An error answer to a [`LookupRequest`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LookupError {
    /// The identifier of the request being answered.
    pub request_id: RequestId,

    /// What went wrong.
    pub code: ResponseCode,

    /// The replica that answered.
    pub responder: NodeId,
}

//------------ Mutation messages ---------------------------------------------

/// A request to change a name's record.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MutationRequest {
    /// The identifier to echo in the confirmation.
    pub request_id: RequestId,

    /// The name to change.
    pub name: String,

    /// The field to change. Empty for operations on the whole name.
    pub field: Field,

    /// The change to apply.
    pub op: MutationOp,

    /// The new value, if the operation takes one.
    pub new_value: ResultValue,

    /// The expected current value for compare-and-replace.
    pub old_value: Option<ResultValue>,

    /// The local name server sending the request.
    pub sender: NodeId,
}

/// The answer to a [`MutationRequest`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MutationConfirm {
    /// The identifier of the request being answered.
    pub request_id: RequestId,

    /// Whether the change was applied.
    pub success: bool,

    /// Why the change was not applied.
    pub code: ResponseCode,

    /// The node that answered.
    pub responder: NodeId,
}

//------------ Active set messages -------------------------------------------

/// A request for the current active replica set of a name, sent to one of
/// its replica controllers.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ActiveSetRequest {
    /// The name whose active replicas are requested.
    pub name: String,

    /// The local name server asking.
    pub requesting_node: NodeId,
}

/// The answer to an [`ActiveSetRequest`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ActiveSetResponse {
    /// The name whose active replicas are reported.
    pub name: String,

    /// The active replicas.
    ///
    /// `None` means the controller has no record of the name. An empty set
    /// means the record exists but no replica serves it yet.
    pub active: Option<Vec<NodeId>>,

    /// The controller that answered.
    pub responder: NodeId,
}

//------------ Message -------------------------------------------------------

/// Any message exchanged between a local name server and the storage tier.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Message {
    LookupRequest(LookupRequest),
    LookupResponse(LookupResponse),
    LookupError(LookupError),
    MutationRequest(MutationRequest),
    MutationConfirm(MutationConfirm),
    ActiveSetRequest(ActiveSetRequest),
    ActiveSetResponse(ActiveSetResponse),
}

impl Message {
    /// Returns a short label for the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::LookupRequest(_) => "lookup-request",
            Message::LookupResponse(_) => "lookup-response",
            Message::LookupError(_) => "lookup-error",
            Message::MutationRequest(_) => "mutation-request",
            Message::MutationConfirm(_) => "mutation-confirm",
            Message::ActiveSetRequest(_) => "active-set-request",
            Message::ActiveSetResponse(_) => "active-set-response",
        }
    }

    /// Returns whether the message is sent to the storage tier.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::LookupRequest(_)
                | Message::MutationRequest(_)
                | Message::ActiveSetRequest(_)
        )
    }

    /// Returns the request identifier carried by the message, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Message::LookupRequest(msg) => Some(msg.request_id),
            Message::LookupResponse(msg) => Some(msg.request_id),
            Message::LookupError(msg) => Some(msg.request_id),
            Message::MutationRequest(msg) => Some(msg.request_id),
            Message::MutationConfirm(msg) => Some(msg.request_id),
            Message::ActiveSetRequest(_) | Message::ActiveSetResponse(_) => {
                None
            }
        }
    }
}

macro_rules! from_variant {
    ( $( $variant:ident ),* ) => {
        $(
            impl From<$variant> for Message {
                fn from(msg: $variant) -> Self {
                    Message::$variant(msg)
                }
            }
        )*
    }
}

from_variant!(
    LookupRequest,
    LookupResponse,
    LookupError,
    MutationRequest,
    MutationConfirm,
    ActiveSetRequest,
    ActiveSetResponse
);

//============ Testing =======================================================
