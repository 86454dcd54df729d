//! Resolution core of a local name server for a global name service.
//!
//! A global name service maps globally unique names to records made of
//! fields. Records are stored by a replicated storage tier: for each name,
//! a small fixed set of *replica controllers* decides which *active
//! replicas* currently serve the name's data. A local name server sits in
//! front of that tier. It answers lookups and forwards mutations on behalf
//! of clients, caching both values and the placement of names so that most
//! requests either never leave the local node or go straight to a replica
//! that can answer them.
//!
//! This crate implements that local name server core:
//!
//! * [base] contains the identifiers, values, and protocol messages the
//!   core exchanges with the storage tier, and
//! * [lns] contains the resolution machinery itself: the placement cache,
//!   server selection policies, the registry of outstanding requests, the
//!   discovery of active replica sets, and the retry state machine that
//!   drives every request to exactly one result.
//!
//! The core does not own a wire format or a socket. Outbound messages are
//! handed to an implementation of [lns::transport::SendMessage] and inbound
//! messages are fed to [lns::LocalNameServer::handle_message].
//!
//! # Reference of Feature Flags
//!
//! * `serde`: Derives `Serialize` and `Deserialize` for the identifier,
//!   value, and message types so a front end can pick its own encoding.

#![allow(renamed_and_removed_lints)]
#![allow(clippy::unknown_clippy_lints)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod base;
pub mod lns;
pub mod utils;

#[cfg(test)]
mod logging;
