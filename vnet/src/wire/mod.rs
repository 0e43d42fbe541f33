/*! Low-level packet access and construction.

The `wire` module deals with packet *representation*. It provides two levels
of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens in the
   lowercase structures, e.g. [`ipv4`] or [`tcp_segment`].
 * Second, it provides a compact, high-level representation of header data
   that can be created from parsing and emitted into a sequence of octets.
   This happens through the `Repr` family of structs, e.g. [`Ipv4Repr`] or
   [`TcpRepr`].

[`ipv4`]: struct.ipv4.html
[`tcp_segment`]: struct.tcp_segment.html
[`Ipv4Repr`]: struct.Ipv4Repr.html
[`TcpRepr`]: struct.TcpRepr.html

In the `Repr` family, `parse()` never panics on a length-checked view and
`emit()` never panics as long as the underlying buffer is at least
`buffer_len()` octets long. When parsing untrusted input it is *necessary* to
use the `new_checked` constructors; so long as the buffer is not modified, no
accessor will then fail.
*/

mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
    pub(crate) type Rest = ::core::ops::RangeFrom<usize>;
}

pub(crate) mod checksum;
mod error;
mod ipv4;
mod rip;
mod tcp;

/// Describes how to handle checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Checksum {
    /// Checksum must be computed or checked manually.
    Manual,

    /// The checksum field is neither filled nor checked.
    Ignored,
}

pub use self::error::{Error, Result};

pub use self::ipv4::{
    ipv4 as ipv4_packet,
    Address as Ipv4Address,
    Cidr as Ipv4Cidr,
    ParseCidrError,
    Protocol as IpProtocol,
    Repr as Ipv4Repr,
    Subnet as Ipv4Subnet,
    HEADER_LEN as IPV4_HEADER_LEN};

pub use self::tcp::{
    tcp_segment,
    Flags as TcpFlags,
    Repr as TcpRepr,
    SeqNumber as TcpSeqNumber,
    HEADER_LEN as TCP_HEADER_LEN};

pub use self::rip::{
    Command as RipCommand,
    Repr as RipRepr,
    RouteAdvert,
    COST_INFINITY as RIP_INFINITY};

impl Checksum {
    /// Check if a checksum should be calculated by the library.
    pub fn manual(self) -> bool {
        match self {
            Checksum::Manual => true,
            Checksum::Ignored => false,
        }
    }
}
