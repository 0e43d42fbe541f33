use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use super::field::Field;
use super::ipv4::{Address, Subnet};
use super::{Error, Result};

/// The cost value denoting an unreachable destination.
pub const COST_INFINITY: u32 = 16;

mod field {
    use super::Field;

    pub(crate) const COMMAND: Field = 0..2;
    pub(crate) const NUM_ENTRIES: Field = 2..4;

    pub(crate) const ENTRIES: usize = 4;
    pub(crate) const ENTRY_SIZE: usize = 12;

    pub(crate) const COST: Field = 0..4;
    pub(crate) const ADDRESS: Field = 4..8;
    pub(crate) const MASK: Field = 8..12;
}

/// The command field of a routing message.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub enum Command {
    /// Ask a neighbor for its full table.
    Request,

    /// Advertise entries, either periodically, triggered, or as an answer.
    Response,
}

impl Command {
    fn from_wire(value: u16) -> Result<Command> {
        match value {
            1 => Ok(Command::Request),
            2 => Ok(Command::Response),
            _ => Err(Error::Unsupported),
        }
    }

    fn to_wire(self) -> u16 {
        match self {
            Command::Request => 1,
            Command::Response => 2,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Command::Request => "request",
            Command::Response => "response",
        })
    }
}

/// One advertised destination: a prefix and the cost of reaching it.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct RouteAdvert {
    /// Cost of the route, `0..=16` where 16 is infinity.
    pub cost: u32,

    /// The advertised destination prefix.
    pub subnet: Subnet,
}

/// A high-level representation of a routing message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Repr {
    pub command: Command,
    pub entries: Vec<RouteAdvert>,
}

impl Repr {
    /// An empty request for the full table of a neighbor.
    pub fn request() -> Repr {
        Repr { command: Command::Request, entries: Vec::new() }
    }

    /// A response advertising the given destinations.
    pub fn response(entries: Vec<RouteAdvert>) -> Repr {
        Repr { command: Command::Response, entries }
    }

    /// Parse a routing message from a byte buffer.
    ///
    /// Trailing bytes past the advertised entry count are not accepted, a
    /// mismatch between the count and the buffer is malformed either way.
    pub fn parse(data: &[u8]) -> Result<Repr> {
        if data.len() < field::ENTRIES {
            return Err(Error::Truncated);
        }

        let command = Command::from_wire(NetworkEndian::read_u16(&data[field::COMMAND]))?;
        let num_entries = NetworkEndian::read_u16(&data[field::NUM_ENTRIES]) as usize;

        if data.len() != field::ENTRIES + num_entries * field::ENTRY_SIZE {
            return Err(Error::Malformed);
        }

        let mut entries = Vec::with_capacity(num_entries);
        for chunk in data[field::ENTRIES..].chunks_exact(field::ENTRY_SIZE) {
            let cost = NetworkEndian::read_u32(&chunk[field::COST]);
            let address = NetworkEndian::read_u32(&chunk[field::ADDRESS]);
            let mask = NetworkEndian::read_u32(&chunk[field::MASK]);

            if cost > COST_INFINITY || mask > 32 {
                return Err(Error::Malformed);
            }

            entries.push(RouteAdvert {
                cost,
                subnet: Subnet::new(Address::from_network_integer(address), mask as u8),
            });
        }

        Ok(Repr { command, entries })
    }

    /// Return the length of the message that will be emitted from this
    /// high-level representation.
    pub fn buffer_len(&self) -> usize {
        field::ENTRIES + self.entries.len() * field::ENTRY_SIZE
    }

    /// Emit the message into a freshly allocated byte buffer.
    pub fn emit(&self) -> Vec<u8> {
        let mut data = vec![0; self.buffer_len()];

        NetworkEndian::write_u16(&mut data[field::COMMAND], self.command.to_wire());
        NetworkEndian::write_u16(&mut data[field::NUM_ENTRIES], self.entries.len() as u16);

        for (entry, chunk) in self.entries.iter()
            .zip(data[field::ENTRIES..].chunks_exact_mut(field::ENTRY_SIZE))
        {
            NetworkEndian::write_u32(&mut chunk[field::COST], entry.cost);
            NetworkEndian::write_u32(
                &mut chunk[field::ADDRESS],
                entry.subnet.address().to_network_integer());
            NetworkEndian::write_u32(&mut chunk[field::MASK], entry.subnet.prefix_len() as u32);
        }

        data
    }
}
