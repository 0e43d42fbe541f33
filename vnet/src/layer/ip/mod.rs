//! The IP layer: forwarding table and per-node dispatch.
//!
//! The dispatcher owns the interfaces and the forwarding table. Datagrams
//! coming off a link are validated, delivered to an upper-layer handler when
//! addressed to this node, sent directly when the destination sits on a
//! connected subnet, and otherwise forwarded along the longest matching
//! prefix. Locally originated datagrams enter the very same path so that
//! self-addressed traffic and forwarding follow one set of rules.
mod endpoint;
mod route;

#[cfg(test)]
mod tests;

pub use endpoint::{IpStack, Received, DEFAULT_TTL};
pub use route::{Route, RouteSource, RouteTable};
