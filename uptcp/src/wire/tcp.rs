use core::{cmp, fmt, ops};
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};
use super::ip::{checksum, Address, PROTOCOL_TCP};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>. Sequence numbers
/// do not have a discontiguity when compared pairwise across a signed overflow: a number is later
/// than another if it is less than half the number space ahead of it.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    /// Signed distance from `base` to `self`.
    pub fn since(self, base: SeqNumber) -> i32 {
        self.0.wrapping_sub(base.0) as i32
    }

    /// The earlier of two sequence numbers.
    pub fn min(self, other: SeqNumber) -> SeqNumber {
        if self.since(other) <= 0 { self } else { other }
    }

    /// The later of two sequence numbers.
    pub fn max(self, other: SeqNumber) -> SeqNumber {
        if self.since(other) >= 0 { self } else { other }
    }

    /// Whether `low <= self <= high` in sequence space.
    pub fn between(self, low: SeqNumber, high: SeqNumber) -> bool {
        high.0.wrapping_sub(low.0) >= self.0.wrapping_sub(low.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl ops::Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl ops::AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        Some(self.since(*other).cmp(&0))
    }
}

/// A set of tcp flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u16);

/// A read/write wrapper around a Transmission Control Protocol packet buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct Packet<T> {
    buffer: T,
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::Field;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM:  Field = 4..8;
    pub const ACK_NUM:  Field = 8..12;
    pub const FLAGS:    Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT:   Field = 18..20;

    pub fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
    pub const FLG_URG: u16 = 0x020;
    pub const FLG_ECE: u16 = 0x040;
    pub const FLG_CWR: u16 = 0x080;

    pub const OPT_END: u8 = 0x00;
    pub const OPT_NOP: u8 = 0x01;
    pub const OPT_MSS: u8 = 0x02;
    pub const OPT_WS:  u8 = 0x03;
    pub const OPT_SACKPERM: u8 = 0x04;
    pub const OPT_SACKRNG:  u8 = 0x05;
    pub const OPT_TS:  u8 = 0x08;
}

/// Length of the fixed header.
pub const HEADER_LEN: usize = field::URGENT.end;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP packet structure.
    pub fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no header accessor method will panic if called.
    /// Returns `Err(Error::Truncated)` if the buffer is too short.
    /// Returns `Err(Error::Malformed)` if the header length field has a value smaller
    /// than the minimal header length.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < field::URGENT.end {
            Err(Error::Truncated)
        } else {
            let header_len = self.header_len() as usize;
            if len < header_len {
                Err(Error::Truncated)
            } else if header_len < field::URGENT.end {
                Err(Error::Malformed)
            } else {
                Ok(())
            }
        }
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::ACK_NUM]))
    }

    /// Read all flags at once.
    pub fn flags(&self) -> Flags {
        Flags(NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS]) & 0x1ff)
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let raw = NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS]);
        ((raw >> 12) * 4) as u8
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    /// Return a pointer to the options.
    #[inline]
    pub fn options(&self) -> &[u8] {
        &self.buffer.as_ref()[field::OPTIONS(self.header_len())]
    }

    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.header_len() as usize..]
    }

    /// Validate the packet checksum.
    pub fn verify_checksum(&self, src_addr: Address, dst_addr: Address) -> bool {
        let data = self.buffer.as_ref();
        checksum::combine(&[
            checksum::pseudo_header(&src_addr, &dst_addr, PROTOCOL_TCP, data.len() as u32),
            checksum::data(data)
        ]) == !0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::ACK_NUM], value.0)
    }

    /// Set all flags at once, keeping the header length.
    #[inline]
    pub fn set_flags(&mut self, value: Flags) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        let raw = (raw & !0x0fff) | (value.0 & 0x0fff);
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        let raw = (raw & !0xf000) | ((value as u16) / 4) << 12;
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::URGENT], value)
    }

    /// Return a mutable pointer to the options.
    #[inline]
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        &mut self.buffer.as_mut()[field::OPTIONS(header_len)]
    }

    /// Return a mutable pointer to the payload data.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        &mut self.buffer.as_mut()[header_len..]
    }

    /// Compute and fill in the header checksum.
    pub fn fill_checksum(&mut self, src_addr: Address, dst_addr: Address) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            !checksum::combine(&[
                checksum::pseudo_header(&src_addr, &dst_addr, PROTOCOL_TCP, data.len() as u32),
                checksum::data(data)
            ])
        };
        self.set_checksum(checksum)
    }
}

impl Flags {
    pub const FIN: Flags = Flags(field::FLG_FIN);
    pub const SYN: Flags = Flags(field::FLG_SYN);
    pub const RST: Flags = Flags(field::FLG_RST);
    pub const PSH: Flags = Flags(field::FLG_PSH);
    pub const ACK: Flags = Flags(field::FLG_ACK);
    pub const URG: Flags = Flags(field::FLG_URG);
    pub const ECE: Flags = Flags(field::FLG_ECE);
    pub const CWR: Flags = Flags(field::FLG_CWR);

    /// Return the FIN flag.
    #[inline]
    pub fn fin(&self) -> bool {
        self.0 & field::FLG_FIN != 0
    }

    /// Return the SYN flag.
    #[inline]
    pub fn syn(&self) -> bool {
        self.0 & field::FLG_SYN != 0
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(&self) -> bool {
        self.0 & field::FLG_RST != 0
    }

    /// Return the PSH flag.
    #[inline]
    pub fn psh(&self) -> bool {
        self.0 & field::FLG_PSH != 0
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(&self) -> bool {
        self.0 & field::FLG_ACK != 0
    }

    /// Return the CWR flag.
    #[inline]
    pub fn cwr(&self) -> bool {
        self.0 & field::FLG_CWR != 0
    }

    /// Set the ACK flag.
    #[inline]
    pub fn set_ack(&mut self, value: bool) {
        let flag = if value { field::FLG_ACK } else { 0 };
        let without = self.0 & !field::FLG_ACK;
        self.0 = without | flag;
    }

    /// Return the length of a control flag, in terms of sequence space.
    pub fn sequence_len(self) -> u32 {
        (if self.syn() { 1 } else { 0 })
        + (if self.fin() { 1 }  else { 0 })
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
        let names = [
            (field::FLG_SYN, "syn"), (field::FLG_FIN, "fin"), (field::FLG_RST, "rst"),
            (field::FLG_PSH, "psh"), (field::FLG_ACK, "ack"), (field::FLG_URG, "urg"),
            (field::FLG_ECE, "ece"), (field::FLG_CWR, "cwr"),
        ];
        let mut first = true;
        for &(bit, name) in names.iter() {
            if self.0 & bit != 0 {
                if !first { write!(f, "|")? }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A representation of a single TCP option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    Timestamp { value: u32, echo: u32 },
    Unknown { kind: u8, data: &'a [u8] }
}

impl<'a> TcpOption<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.get(0).ok_or(Error::Truncated)? {
            field::OPT_END => {
                length = 1;
                option = TcpOption::EndOfList;
            }
            field::OPT_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error::Truncated)? as usize;
                if length < 2 {
                    return Err(Error::Malformed);
                }
                let data = buffer.get(2..length).ok_or(Error::Truncated)?;
                match (kind, length) {
                    (field::OPT_MSS, 4) =>
                        option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data)),
                    (field::OPT_MSS, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_WS, 3) =>
                        option = TcpOption::WindowScale(data[0]),
                    (field::OPT_WS, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_SACKPERM, 2) =>
                        option = TcpOption::SackPermitted,
                    (field::OPT_SACKPERM, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_TS, 10) =>
                        option = TcpOption::Timestamp {
                            value: NetworkEndian::read_u32(&data[0..4]),
                            echo: NetworkEndian::read_u32(&data[4..8]),
                        },
                    (field::OPT_TS, _) =>
                        return Err(Error::Malformed),
                    // Selective acknowledgements are never acted upon.
                    (_, _) =>
                        option = TcpOption::Unknown { kind, data }
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::Timestamp { .. } => 10,
            TcpOption::Unknown { data, .. } => 2 + data.len()
        }
    }

    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length = self.buffer_len();
        match *self {
            TcpOption::EndOfList => {
                // There may be padding space which also should be initialized.
                for p in buffer.iter_mut() {
                    *p = field::OPT_END;
                }
                let len = buffer.len();
                return &mut buffer[len..];
            }
            TcpOption::NoOperation => {
                buffer[0] = field::OPT_NOP;
            }
            TcpOption::MaxSegmentSize(value) => {
                buffer[0] = field::OPT_MSS;
                NetworkEndian::write_u16(&mut buffer[2..4], value)
            }
            TcpOption::WindowScale(value) => {
                buffer[0] = field::OPT_WS;
                buffer[2] = value;
            }
            TcpOption::SackPermitted => {
                buffer[0] = field::OPT_SACKPERM;
            }
            TcpOption::Timestamp { value, echo } => {
                buffer[0] = field::OPT_TS;
                NetworkEndian::write_u32(&mut buffer[2..6], value);
                NetworkEndian::write_u32(&mut buffer[6..10], echo);
            }
            TcpOption::Unknown { kind, data: provided } => {
                buffer[0] = kind;
                buffer[2..length].copy_from_slice(provided)
            }
        }
        if length > 1 {
            buffer[1] = length as u8;
        }
        &mut buffer[length..]
    }
}

/// A high-level representation of a Transmission Control Protocol packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_port:     u16,
    pub dst_port:     u16,
    pub flags:        Flags,
    pub seq_number:   SeqNumber,
    pub ack_number:   Option<SeqNumber>,
    pub window_len:   u16,
    pub window_scale: Option<u8>,
    pub max_seg_size: Option<u16>,
    pub sack_permitted: bool,
    /// Timestamp value and echo reply.
    pub timestamp:    Option<(u32, u32)>,
    pub payload_len:  usize,
}

/// Abstraction for checksum behaviour.
///
/// The checksum requires calculating a pseudo header for the upper layer protocol consisting of
/// src and dst address.
#[derive(Debug, Clone, Copy)]
pub enum Checksum {
    /// Always fill the checksum and check if it exists.
    Manual {
        src_addr: Address,
        dst_addr: Address,
    },

    /// Never inspect the checksum.
    ///
    /// This assumes that some layer below has already performed the necessary checks.
    Ignored,
}

impl Repr {
    /// Parse a Transmission Control Protocol packet and return a high-level representation.
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>, checksum: Checksum) -> Result<Repr> {
        packet.check_len()?;
        // Source and destination ports must be present.
        if packet.src_port() == 0 { return Err(Error::Malformed) }
        if packet.dst_port() == 0 { return Err(Error::Malformed) }

        // Valid checksum may be expected.
        if let Checksum::Manual { src_addr, dst_addr } = checksum {
            if !packet.verify_checksum(src_addr, dst_addr) {
                return Err(Error::Checksum)
            }
        }

        let flags = packet.flags();
        let ack_number = if flags.ack() {
            Some(packet.ack_number())
        } else {
            None
        };

        let mut max_seg_size = None;
        let mut window_scale = None;
        let mut sack_permitted = false;
        let mut timestamp = None;
        let mut options = packet.options();
        while !options.is_empty() {
            let (next_options, option) = TcpOption::parse(options)?;
            match option {
                TcpOption::EndOfList => break,
                TcpOption::NoOperation => (),
                TcpOption::MaxSegmentSize(value) =>
                    max_seg_size = Some(value),
                TcpOption::WindowScale(value) => {
                    // RFC 1323: use 14 if a larger shift count is received.
                    window_scale = if value > 14 {
                        net_debug!("parsed window scaling factor {} >14, setting to 14", value);
                        Some(14)
                    } else {
                        Some(value)
                    };
                },
                TcpOption::SackPermitted =>
                    sack_permitted = true,
                TcpOption::Timestamp { value, echo } =>
                    timestamp = Some((value, echo)),
                TcpOption::Unknown { .. } => (),
            }
            options = next_options;
        }

        Ok(Repr {
            src_port:     packet.src_port(),
            dst_port:     packet.dst_port(),
            flags,
            seq_number:   packet.seq_number(),
            ack_number,
            window_len:   packet.window_len(),
            window_scale,
            max_seg_size,
            sack_permitted,
            timestamp,
            payload_len:  packet.payload().len(),
        })
    }

    /// Return the length of the options that will be emitted.
    ///
    /// Every option is padded with leading no-ops to a 4 octet boundary.
    pub fn options_len(&self) -> usize {
        let mut length = 0;
        if self.max_seg_size.is_some() {
            length += 4
        }
        if self.timestamp.is_some() {
            length += 12
        }
        if self.window_scale.is_some() {
            length += 4
        }
        if self.sack_permitted {
            length += 4;
        }
        length
    }

    /// Return the length of a header that will be emitted from this high-level representation.
    ///
    /// The TCP header length is a multiple of 4.
    pub fn header_len(&self) -> usize {
        HEADER_LEN + self.options_len()
    }

    /// Return the length of a packet that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + self.payload_len
    }

    /// Emit a high-level representation into a Transmission Control Protocol packet.
    ///
    /// Options are laid out as MSS, timestamp, window scale, each aligned with no-ops. The
    /// payload is left untouched and the checksum is not filled.
    pub fn emit<T>(&self, packet: &mut Packet<T>)
        where T: AsRef<[u8]> + AsMut<[u8]>
    {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_window_len(self.window_len);
        packet.set_header_len(self.header_len() as u8);
        let mut flags = self.flags;
        flags.set_ack(self.ack_number.is_some());
        packet.set_flags(flags);
        packet.set_checksum(0);
        {
            let mut options = packet.options_mut();
            if let Some(value) = self.max_seg_size {
                options = TcpOption::MaxSegmentSize(value).emit(options);
            }
            if let Some((value, echo)) = self.timestamp {
                options = TcpOption::NoOperation.emit(options);
                options = TcpOption::NoOperation.emit(options);
                options = TcpOption::Timestamp { value, echo }.emit(options);
            }
            if let Some(value) = self.window_scale {
                options = TcpOption::NoOperation.emit(options);
                options = TcpOption::WindowScale(value).emit(options);
            }
            if self.sack_permitted {
                options = TcpOption::NoOperation.emit(options);
                options = TcpOption::NoOperation.emit(options);
                options = TcpOption::SackPermitted.emit(options);
            }
            if !options.is_empty() {
                TcpOption::EndOfList.emit(options);
            }
        }
        packet.set_urgent_at(0);
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn sequence_len(&self) -> u32 {
        self.payload_len as u32 + self.flags.sequence_len()
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TCP src={} dst={} [{}] seq={}",
               self.src_port, self.dst_port, self.flags, self.seq_number)?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={}", ack_number)?;
        }
        write!(f, " win={}", self.window_len)?;
        if let Some(value) = self.max_seg_size {
            write!(f, " mss={}", value)?;
        }
        if let Some(value) = self.window_scale {
            write!(f, " ws={}", value)?;
        }
        if let Some((value, echo)) = self.timestamp {
            write!(f, " ts={}/{}", value, echo)?;
        }
        write!(f, " len={}", self.payload_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC_ADDR: Address = Address([192, 168, 1, 1]);
    const DST_ADDR: Address = Address([192, 168, 1, 2]);

    static SYN_BYTES: [u8; 44] =
        [0x12, 0x34, 0x00, 0x50, 0x00, 0x00, 0x03, 0xe8,
         0x00, 0x00, 0x00, 0x00, 0xa0, 0x02, 0x39, 0x08,
         0x00, 0x00, 0x00, 0x00,
         0x02, 0x04, 0x05, 0xb4,
         0x01, 0x01, 0x08, 0x0a, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, 0x00,
         0x01, 0x03, 0x03, 0x07,
         0xaa, 0xbb, 0xcc, 0xdd];

    fn syn_repr() -> Repr {
        Repr {
            src_port: 0x1234,
            dst_port: 80,
            flags: Flags::SYN,
            seq_number: SeqNumber(1000),
            ack_number: None,
            window_len: 14600,
            window_scale: Some(7),
            max_seg_size: Some(1460),
            sack_permitted: false,
            timestamp: Some((42, 0)),
            payload_len: 4,
        }
    }

    #[test]
    fn seq_compare() {
        assert!(SeqNumber(1) > SeqNumber(0));
        assert!(SeqNumber(0) > SeqNumber(u32::max_value()));
        assert_eq!(SeqNumber(5).since(SeqNumber(u32::max_value() - 4)), 10);
        assert_eq!(SeqNumber(3).min(SeqNumber(u32::max_value())), SeqNumber(u32::max_value()));
        assert_eq!(SeqNumber(3).max(SeqNumber(u32::max_value())), SeqNumber(3));
        assert!(SeqNumber(1).between(SeqNumber(u32::max_value()), SeqNumber(2)));
        assert!(!SeqNumber(3).between(SeqNumber(u32::max_value()), SeqNumber(2)));
    }

    #[test]
    fn emit_syn() {
        let repr = syn_repr();
        assert_eq!(repr.header_len(), 40);
        let mut bytes = [0u8; 44];
        bytes[40..].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        assert_eq!(&bytes[..], &SYN_BYTES[..]);
    }

    #[test]
    fn parse_with_checksum() {
        let mut bytes = SYN_BYTES;
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.fill_checksum(SRC_ADDR, DST_ADDR);

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        let checksum = Checksum::Manual { src_addr: SRC_ADDR, dst_addr: DST_ADDR };
        assert_eq!(Repr::parse(&packet, checksum), Ok(syn_repr()));
        assert_eq!(packet.payload(), &[0xaa, 0xbb, 0xcc, 0xdd]);

        let swapped = Checksum::Manual { src_addr: DST_ADDR, dst_addr: Address([10, 0, 0, 1]) };
        assert_eq!(Repr::parse(&packet, swapped), Err(Error::Checksum));
    }

    #[test]
    fn ack_options() {
        let repr = Repr {
            flags: Flags::PSH | Flags::ACK,
            ack_number: Some(SeqNumber(7)),
            window_scale: None,
            max_seg_size: None,
            payload_len: 0,
            ..syn_repr()
        };
        assert_eq!(repr.options_len(), 12);
        let mut bytes = [0u8; 32];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        assert_eq!(packet.flags(), Flags::PSH | Flags::ACK);
        assert_eq!(&packet.options()[..4], &[0x01, 0x01, 0x08, 0x0a]);
        assert_eq!(Repr::parse(&packet, Checksum::Ignored), Ok(repr));
    }

    #[test]
    fn truncated() {
        let packet = Packet::new_unchecked(&SYN_BYTES[..23]);
        assert_eq!(packet.check_len(), Err(Error::Truncated));
        let mut bad = SYN_BYTES;
        bad[21] = 3;
        let packet = Packet::new_unchecked(&bad[..]);
        assert_eq!(Repr::parse(&packet, Checksum::Ignored), Err(Error::Malformed));
    }
}
