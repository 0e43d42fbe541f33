//! A user-space virtual internet stack.
//!
//! Nodes exchange real IPv4-shaped datagrams, but every physical link is
//! emulated by a UDP socket to a neighbor process. On top of the hop-by-hop
//! forwarding layer sits a distance-vector routing protocol and a
//! connection-oriented reliable byte-stream transport.
//!
//! ## Structure
//!
//! * [`wire`] holds the packet codecs: accessor views over raw octet buffers
//!   plus compact `Repr` structs that parse from and emit into them.
//! * [`iface`] owns one emulated link per interface and maps neighbor
//!   addresses to their link endpoints.
//! * [`layer::ip`] is the per-node dispatcher: validate, deliver locally, or
//!   forward by longest-prefix match.
//! * [`layer::rip`] runs the distance-vector router over the IP core.
//! * [`layer::tcp`] is the transport: connection table, per-connection state
//!   machine, sliding windows, retransmission and zero-window probing.
//! * [`storage`] provides the internally synchronized ring buffers the
//!   transport blocks on.
//!
//! The library never owns the process: configuration parsing, the command
//! shell and node wiring live in the companion `vnet-node` crate.
#![warn(unreachable_pub)]

#[macro_use]
mod macros;

pub mod iface;
pub mod layer;
pub mod storage;
pub mod time;
pub mod wire;
