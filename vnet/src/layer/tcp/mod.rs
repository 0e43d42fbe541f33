//! The transport layer: reliable byte streams over the IP core.
//!
//! Connections are tracked in a table keyed by the four-tuple, with a
//! listening entry answering for whatever the exact matches do not. Each
//! connection is a state machine over a pair of ring buffers, a retransmit
//! queue with an adaptive timeout, and a background manager thread driving
//! retransmission. The application surface is deliberately socket-like:
//! `listen`/`accept`, `connect`, `read`, `write`, `close`.
use core::fmt;

use crate::time::Duration;
use crate::wire::{IPV4_HEADER_LEN, TCP_HEADER_LEN};

mod endpoint;
mod io;
mod rto;
mod socket;

#[cfg(test)]
mod tests;

pub use endpoint::{FourTuple, ListenSocket, SocketHandle, SocketId, SocketInfo, TcpStack};
pub use socket::StreamSocket;

/// Largest transport payload that fits one link datagram.
pub const MSS: usize = crate::iface::MTU - IPV4_HEADER_LEN - TCP_HEADER_LEN;

/// The connection states of rfc793, plus the terminal pseudo-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynReceived => "SYN_RECEIVED",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::CloseWait => "CLOSE_WAIT",
            State::Closing => "CLOSING",
            State::LastAck => "LAST_ACK",
            State::TimeWait => "TIME_WAIT",
            State::Closed => "CLOSED",
        })
    }
}

/// Tunables of the transport, fixed per stack.
///
/// The defaults are the protocol constants; tests shrink the timers and
/// buffers to keep wall clocks reasonable.
#[derive(Debug, Clone)]
pub struct TcpParams {
    /// Capacity of the send and receive ring buffers.
    pub buffer_size: usize,

    /// Consecutive retransmissions of one segment before the connection is
    /// declared dead.
    pub max_retransmits: u32,

    /// Probes into a closed window before the connection is declared dead.
    pub max_probes: u32,

    /// Delay between zero-window probes.
    pub probe_interval: Duration,

    /// Retransmission timeout before any round-trip sample exists.
    pub rto_initial: Duration,

    /// Lower clamp of the adaptive retransmission timeout.
    pub rto_min: Duration,

    /// Upper clamp of the adaptive retransmission timeout and its backoff.
    pub rto_max: Duration,

    /// Maximum segment lifetime. A connection lingers in TIME_WAIT for
    /// twice this long.
    pub msl: Duration,

    /// Initial TTL of emitted segments.
    pub ttl: u8,
}

impl Default for TcpParams {
    fn default() -> Self {
        TcpParams {
            buffer_size: 65535,
            max_retransmits: 3,
            max_probes: 16,
            probe_interval: Duration::from_secs(1),
            rto_initial: Duration::from_secs(1),
            rto_min: Duration::from_secs(1),
            rto_max: Duration::from_secs(60),
            msl: Duration::from_secs(60),
            ttl: crate::layer::ip::DEFAULT_TTL,
        }
    }
}
