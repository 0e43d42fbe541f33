//! The protocol layers of a node.
use core::fmt;

use crate::wire;

pub mod ip;
pub mod rip;
pub mod tcp;

/// The error type for layer operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The forwarding table has no entry covering the destination.
    NoRoute,

    /// The interface that should carry the traffic is disabled.
    IfaceDown,

    /// The next hop is not a neighbor on the chosen interface.
    NoNeighbor,

    /// A capacity limit was reached (table slots, accept queue).
    Exhausted,

    /// A connection-oriented operation on a connection that is not (or no
    /// longer) established.
    NotEstablished,

    /// The connection was torn down: reset by the peer, or the
    /// retransmission limit ran out.
    ConnectionAborted,

    /// A connection with this four-tuple already exists.
    ConnectionExists,

    /// The operation is not valid for this socket kind.
    Illegal,

    /// A codec error bubbled up from the wire representation.
    Wire(wire::Error),
}

/// The result type for layer operations.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoRoute => f.write_str("no route to destination"),
            Error::IfaceDown => f.write_str("interface is down"),
            Error::NoNeighbor => f.write_str("next hop is not a neighbor"),
            Error::Exhausted => f.write_str("out of capacity"),
            Error::NotEstablished => f.write_str("connection not established"),
            Error::ConnectionAborted => f.write_str("connection aborted"),
            Error::ConnectionExists => f.write_str("connection already exists"),
            Error::Illegal => f.write_str("operation not supported on this socket"),
            Error::Wire(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<wire::Error> for Error {
    fn from(err: wire::Error) -> Error {
        Error::Wire(err)
    }
}
