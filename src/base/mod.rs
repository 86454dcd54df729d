//! Basic types shared by the resolution core.
//!
//! This module contains the identifiers of nodes and requests, the record
//! value types, the time-to-live of cached values, and, in the [message]
//! sub-module, the protocol messages exchanged with replicas and replica
//! controllers.

//============ Sub-modules and Re-exports ====================================

pub mod message;

pub use self::message::{Message, MutationOp, ResponseCode};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

//------------ NodeId --------------------------------------------------------

/// The identifier of a node of the name service.
///
/// Node identifiers are totally ordered. The consistent ring selection
/// policy relies on that order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(u32);

impl NodeId {
    /// Creates a node identifier from its numeric value.
    pub const fn new(id: u32) -> Self {
        NodeId(id)
    }

    /// Returns the numeric value of the identifier.
    pub const fn into_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        NodeId(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//------------ RequestId -----------------------------------------------------

/// The identifier of a request outstanding at the local name server.
///
/// Identifiers are handed out by the pending request registry which makes
/// sure no two in-flight requests share one.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestId(u32);

impl RequestId {
    /// Creates a request identifier from its numeric value.
    pub const fn new(id: u32) -> Self {
        RequestId(id)
    }

    /// Returns the numeric value of the identifier.
    pub const fn into_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//------------ Names and values ----------------------------------------------

/// The key of a field within a name's record.
pub type Field = String;

/// The value of a field: a list of opaque values.
pub type ResultValue = Vec<String>;

/// All fields of a record known at some point.
pub type ValuesMap = HashMap<Field, ResultValue>;

/// Returns whether `name` can be routed at all.
///
/// Names are opaque to the core; the only thing it cannot work with is a
/// name that is empty or consists of white space only.
pub fn is_routable_name(name: &str) -> bool {
    !name.trim().is_empty()
}

//------------ Ttl -----------------------------------------------------------

/// The time a cached value may be served without asking a replica again.
///
/// A value of −1 means the value never expires, 0 means it must never be
/// served from the cache, and any positive value is a number of seconds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ttl(i64);

impl Ttl {
    /// A cached value that never expires.
    pub const INFINITE: Ttl = Ttl(-1);

    /// A value that must not be served from the cache.
    pub const NEVER: Ttl = Ttl(0);

    /// The TTL used when a replica does not provide one.
    ///
    /// Small on purpose: staleness must stay bounded even when servers
    /// are silent about it.
    pub const DEFAULT: Ttl = Ttl(2);

    /// Creates a TTL from a number of seconds.
    ///
    /// Any negative number is taken to mean [`Ttl::INFINITE`].
    pub const fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            Ttl::INFINITE
        } else {
            Ttl(secs)
        }
    }

    /// Returns the TTL as seconds, −1 meaning infinite.
    pub const fn as_secs(self) -> i64 {
        self.0
    }

    /// Returns whether the TTL never expires.
    pub const fn is_infinite(self) -> bool {
        self.0 < 0
    }

    /// Returns whether a value cached `age` ago may still be served.
    pub fn is_fresh(self, age: Duration) -> bool {
        match self.0 {
            secs if secs < 0 => true,
            0 => false,
            secs => age < Duration::from_secs(secs as u64),
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Ttl::DEFAULT
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_infinite() {
            f.write_str("infinite")
        } else {
            write!(f, "{}s", self.0)
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ttl_freshness() {
        let ttl = Ttl::from_secs(5);
        assert!(ttl.is_fresh(Duration::ZERO));
        assert!(ttl.is_fresh(Duration::from_millis(4999)));
        assert!(!ttl.is_fresh(Duration::from_secs(5)));
        assert!(!Ttl::NEVER.is_fresh(Duration::ZERO));
        assert!(Ttl::INFINITE.is_fresh(Duration::from_secs(u32::MAX.into())));
        assert_eq!(Ttl::from_secs(-17), Ttl::INFINITE);
    }

    #[test]
    fn routable_names() {
        assert!(is_routable_name("g1"));
        assert!(!is_routable_name(""));
        assert!(!is_routable_name("  \t"));
    }
}
