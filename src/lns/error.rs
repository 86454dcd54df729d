//! Error type of the resolution core.

#![warn(missing_docs)]

use crate::base::{NodeId, ResponseCode};
use std::error;
use std::fmt::{Display, Formatter};

//------------ Error ---------------------------------------------------------

/// The reasons a lookup or mutation can fail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The request was rejected before anything was sent.
    Malformed(&'static str),

    /// The request did not complete within the maximum wait time.
    Timeout,

    /// Replicas kept reporting that they are not active for the name, even
    /// after the active set was discovered again several times.
    InvalidActiveSet,

    /// The active replica set of the name could not be discovered.
    DiscoveryExhausted(DiscoveryFailure),

    /// The name or field does not exist.
    RecordNotFound,

    /// A replica answered with an error.
    Server(ResponseCode),

    /// A replica or controller refused to apply a mutation.
    MutationFailed(ResponseCode),

    /// The transport refused to accept a message for the given node.
    SendFailed(NodeId),

    /// The local name server went away while the request was outstanding.
    ShutDown,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::Malformed(reason) => {
                write!(f, "malformed request: {}", reason)
            }
            Error::Timeout => write!(f, "timeout waiting for a response"),
            Error::InvalidActiveSet => {
                write!(f, "no active replica accepted the request")
            }
            Error::DiscoveryExhausted(failure) => {
                write!(f, "active replica discovery failed: {}", failure)
            }
            Error::RecordNotFound => write!(f, "record not found"),
            Error::Server(code) => write!(f, "server error {}", code),
            Error::MutationFailed(code) => {
                write!(f, "mutation failed with {}", code)
            }
            Error::SendFailed(node) => {
                write!(f, "cannot send message to node {}", node)
            }
            Error::ShutDown => write!(f, "local name server shut down"),
        }
    }
}

impl error::Error for Error {}

//------------ DiscoveryFailure ----------------------------------------------

/// Why active replica discovery for a name gave up.
///
/// A name that nobody serves yet is a different situation from controllers
/// that never answer, so callers get to tell them apart.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DiscoveryFailure {
    /// None of the replica controllers answered in time.
    NoControllerReachable,

    /// The controllers have no record of the name.
    NoRecord,

    /// The controllers know the name but report no active replicas.
    NotReplicated,
}

impl Display for DiscoveryFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(match self {
            DiscoveryFailure::NoControllerReachable => {
                "no replica controller reachable"
            }
            DiscoveryFailure::NoRecord => "name unknown to controllers",
            DiscoveryFailure::NotReplicated => "name has no active replicas",
        })
    }
}
