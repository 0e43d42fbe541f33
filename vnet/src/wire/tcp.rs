use core::{fmt, ops};
use byteorder::{ByteOrder, NetworkEndian};

use super::checksum;
use super::field::{Field, Rest};
use super::ipv4::{Address, Protocol};
use super::{Checksum, Error, Result};

/// Length of the fixed transport header emitted and accepted by this stack.
///
/// No options are ever produced, the data offset is always 5 words.
pub const HEADER_LEN: usize = 20;

/// A sequence number, operating on the u32 circle.
///
/// Because sequence numbers wrap around, two of them can only be compared
/// through their signed distance, never through the plain integer ordering.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, Default)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    /// The signed distance from `other` to `self` on the sequence circle.
    pub fn dist_from(self, other: SeqNumber) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Whether `self` lies strictly before `other`.
    pub fn lt(self, other: SeqNumber) -> bool {
        self.dist_from(other) < 0
    }

    /// Whether `self` lies before or at `other`.
    pub fn le(self, other: SeqNumber) -> bool {
        self.dist_from(other) <= 0
    }

    /// Whether `self` lies in the half-open window `[start, start + len)`.
    pub fn within(self, start: SeqNumber, len: usize) -> bool {
        let offset = self.dist_from(start);
        offset >= 0 && (offset as usize) < len
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs as u32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The flag byte of a transport segment.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, Default)]
pub struct Flags(pub u8);

impl Flags {
    pub const FIN: Flags = Flags(0x01);
    pub const SYN: Flags = Flags(0x02);
    pub const RST: Flags = Flags(0x04);
    pub const PSH: Flags = Flags(0x08);
    pub const ACK: Flags = Flags(0x10);

    /// Whether every flag in `other` is also set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The sequence space consumed by the control flags (SYN and FIN count
    /// for one each).
    pub fn sequence_len(self) -> usize {
        let mut len = 0;
        if self.contains(Flags::SYN) {
            len += 1;
        }
        if self.contains(Flags::FIN) {
            len += 1;
        }
        len
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &(flag, name) in &[
            (Flags::SYN, "syn"),
            (Flags::FIN, "fin"),
            (Flags::RST, "rst"),
            (Flags::PSH, "psh"),
            (Flags::ACK, "ack"),
        ] {
            if self.contains(flag) {
                write!(f, "{} ", name)?;
            }
        }
        Ok(())
    }
}

byte_wrapper! {
    /// A byte sequence representing a transport segment.
    #[derive(Debug, PartialEq, Eq)]
    pub struct tcp_segment([u8]);
}

mod field {
    use super::{Field, Rest};

    pub(crate) const SRC_PORT: Field = 0..2;
    pub(crate) const DST_PORT: Field = 2..4;
    pub(crate) const SEQ_NUM: Field = 4..8;
    pub(crate) const ACK_NUM: Field = 8..12;
    pub(crate) const DATA_OFF: usize = 12;
    pub(crate) const FLAGS: usize = 13;
    pub(crate) const WIN_SIZE: Field = 14..16;
    pub(crate) const CHECKSUM: Field = 16..18;
    pub(crate) const URGENT: Field = 18..20;
    pub(crate) const PAYLOAD: Rest = 20..;
}

impl tcp_segment {
    /// Imbue a raw octet buffer with transport segment structure.
    pub fn new_unchecked(buffer: &[u8]) -> &tcp_segment {
        Self::__from_macro_new_unchecked(buffer)
    }

    /// Imbue a mutable octet buffer with transport segment structure.
    pub fn new_unchecked_mut(buffer: &mut [u8]) -> &mut tcp_segment {
        Self::__from_macro_new_unchecked_mut(buffer)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&tcp_segment> {
        let segment = Self::new_unchecked(data);
        segment.check_len()?;
        Ok(segment)
    }

    /// View the segment as a raw byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Ensure that no accessor method will panic if called.
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < field::URGENT.end {
            Err(Error::Truncated)
        } else if (self.header_len() as usize) < HEADER_LEN {
            Err(Error::Malformed)
        } else if len < self.header_len() as usize {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.0[field::SEQ_NUM]))
    }

    /// Return the acknowledgment number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.0[field::ACK_NUM]))
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        (self.0[field::DATA_OFF] >> 4) * 4
    }

    /// Return the flag byte.
    #[inline]
    pub fn flags(&self) -> Flags {
        Flags(self.0[field::FLAGS])
    }

    /// Return the window size field.
    #[inline]
    pub fn window(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the urgent pointer field.
    #[inline]
    pub fn urgent(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::URGENT])
    }

    /// Return a view of the payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.0[self.header_len() as usize..]
    }

    /// Validate the segment checksum against the pseudo header.
    pub fn verify_checksum(&self, src_addr: Address, dst_addr: Address) -> bool {
        let pseudo = checksum::pseudo_header(
            src_addr, dst_addr, Protocol::TCP, self.0.len() as u32);
        checksum::combine(&[pseudo, checksum::data(&self.0)]) == !0
    }

    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.0[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgment number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.0[field::ACK_NUM], value.0)
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        self.0[field::DATA_OFF] = (value / 4) << 4;
    }

    /// Set the flag byte.
    #[inline]
    pub fn set_flags(&mut self, value: Flags) {
        self.0[field::FLAGS] = value.0
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::URGENT], value)
    }

    /// Return a mutable view of the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.0[field::PAYLOAD]
    }

    /// Compute and fill in the segment checksum over the pseudo header.
    pub fn fill_checksum(&mut self, src_addr: Address, dst_addr: Address) {
        self.set_checksum(0);
        let pseudo = checksum::pseudo_header(
            src_addr, dst_addr, Protocol::TCP, self.0.len() as u32);
        let sum = checksum::combine(&[pseudo, checksum::data(&self.0)]);
        self.set_checksum(!sum)
    }
}

/// A high-level representation of a transport segment header.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: SeqNumber,
    pub ack_number: SeqNumber,
    pub flags: Flags,
    pub window: u16,
}

impl Repr {
    /// Parse a transport segment and return a high-level representation.
    ///
    /// The checksum can only be verified against the enclosing datagram's
    /// addresses, which form the pseudo header.
    pub fn parse(segment: &tcp_segment, src_addr: Address, dst_addr: Address,
                 checksum: Checksum) -> Result<Repr> {
        if checksum.manual() && !segment.verify_checksum(src_addr, dst_addr) {
            return Err(Error::BadChecksum);
        }

        Ok(Repr {
            src_port: segment.src_port(),
            dst_port: segment.dst_port(),
            seq_number: segment.seq_number(),
            ack_number: segment.ack_number(),
            flags: segment.flags(),
            window: segment.window(),
        })
    }

    /// Return the length of a header that will be emitted from this
    /// high-level representation.
    pub fn buffer_len(&self) -> usize {
        HEADER_LEN
    }

    /// Emit a high-level representation into a transport segment.
    ///
    /// The segment checksum covers the payload, so it is filled over the
    /// whole buffer after the header fields.
    pub fn emit(&self, segment: &mut tcp_segment, src_addr: Address,
                dst_addr: Address, checksum: Checksum) {
        segment.set_src_port(self.src_port);
        segment.set_dst_port(self.dst_port);
        segment.set_seq_number(self.seq_number);
        segment.set_ack_number(self.ack_number);
        segment.set_header_len(HEADER_LEN as u8);
        segment.set_flags(self.flags);
        segment.set_window(self.window);
        segment.set_urgent(0);

        if checksum.manual() {
            segment.fill_checksum(src_addr, dst_addr);
        } else {
            segment.set_checksum(0);
        }
    }

    /// The sequence space consumed by this segment's control flags plus
    /// `payload_len` octets of data.
    pub fn sequence_len(&self, payload_len: usize) -> usize {
        self.flags.sequence_len() + payload_len
    }
}
