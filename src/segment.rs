//! TCP segment headers: wire encoding, decoding, and option handling.
//!
//! The fixed header is the bit-exact RFC 793 layout; the variable options
//! area carries the subset of options this stack speaks: maximum segment
//! size (kind 2), window scale (kind 3), SACK-permitted (kind 4), SACK
//! blocks (kind 5, emission only), and timestamps (kind 8). Multi-byte
//! options are aligned to 4-byte boundaries with NOPs, and the whole area is
//! padded out to a multiple of 4 so the data offset field stays honest.
//!
//! The checksum is the usual Internet checksum over the pseudo-header and
//! the complete segment; it is verified on every decode.

use crate::errors::SegmentError;
use crate::message::Message;
use crate::seq::Seq;
use std::net::IpAddr;

/// Length of the fixed TCP header.
pub const HEADER_LENGTH: usize = 20;

/// The options area may not exceed 44 bytes (a data offset of 15 words).
pub const MAX_OPTIONS_LENGTH: usize = 44;

/// At most four SACK blocks fit alongside the other options.
pub const MAX_SACK_BLOCKS: usize = 4;

const OPTION_END: u8 = 0;
const OPTION_NOP: u8 = 1;
const OPTION_MAX_SEGMENT_SIZE: u8 = 2;
const OPTION_WINDOW_SHIFT: u8 = 3;
const OPTION_SACK_PERMITTED: u8 = 4;
const OPTION_SACK: u8 = 5;
const OPTION_TIMESTAMP: u8 = 8;

bitflags::bitflags! {
    /// The control bits of a segment, in wire order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Control: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

bitflags::bitflags! {
    /// Which negotiable options a segment carries (or a connection agreed on).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegmentOptions: u8 {
        const WINDOW_SCALE = 0x01;
        const TIMESTAMPS = 0x02;
        const SACK_PERMITTED = 0x04;
    }
}

bitflags::bitflags! {
    /// What the reception path should do with an incoming segment after the
    /// endpoint has processed it. The empty set means "keep": the payload
    /// now belongs to a queue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegmentAction: u8 {
        const DROP = 0x01;
        const RESET = 0x02;
        const ACKNOWLEDGE = 0x04;
        const IMMEDIATE_ACKNOWLEDGE = 0x08;
        const DELETED_ENDPOINT = 0x10;
    }
}

/// A single SACK block. Emitted only; inbound blocks are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SackBlock {
    pub left_edge: Seq,
    pub right_edge: Seq,
}

/// A decoded (or to-be-encoded) segment header, with options unpacked into
/// their own fields.
#[derive(Debug, Clone)]
pub struct SegmentHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: Seq,
    pub acknowledge: Seq,
    pub advertised_window: u16,
    pub urgent_offset: u16,
    pub control: Control,

    pub max_segment_size: u16,
    pub window_shift: u8,
    pub timestamp_value: u32,
    pub timestamp_reply: u32,
    pub sacks: [SackBlock; MAX_SACK_BLOCKS],
    pub sack_count: usize,
    pub options: SegmentOptions,
}

impl SegmentHeader {
    pub fn new(control: Control) -> Self {
        Self {
            source_port: 0,
            destination_port: 0,
            sequence: Seq::ZERO,
            acknowledge: Seq::ZERO,
            advertised_window: 0,
            urgent_offset: 0,
            control,
            max_segment_size: 0,
            window_shift: 0,
            timestamp_value: 0,
            timestamp_reply: 0,
            sacks: [SackBlock::default(); MAX_SACK_BLOCKS],
            sack_count: 0,
            options: SegmentOptions::empty(),
        }
    }

    /// True when ACK is the only significant control bit. Such segments are
    /// candidates for the header-prediction fast path.
    pub fn acknowledge_only(&self) -> bool {
        self.control
            & (Control::SYN | Control::FIN | Control::RST | Control::URG | Control::ACK)
            == Control::ACK
    }

    /// The peer's advertised window, widened by the negotiated shift.
    pub fn advertised_window(&self, window_shift: u8) -> u32 {
        (self.advertised_window as u32) << window_shift
    }

    /// Sets the window field from a byte count, narrowing by the shift and
    /// clamping to the 16-bit field.
    pub fn set_advertised_window(&mut self, available: usize, window_shift: u8) {
        let scaled = available >> window_shift;
        self.advertised_window = scaled.min(crate::MAX_WINDOW as usize) as u16;
    }

    /// The encoded length of the options this header would emit, including
    /// alignment NOPs and final padding.
    pub fn options_length(&self) -> usize {
        let mut length = 0;
        if self.max_segment_size > 0 {
            length += 4;
        }
        if self.options.contains(SegmentOptions::TIMESTAMPS) {
            length += 12;
        }
        if self.options.contains(SegmentOptions::WINDOW_SCALE) {
            length += 4;
        }
        if self.options.contains(SegmentOptions::SACK_PERMITTED) {
            length += 2;
        }
        if self.sack_count > 0 {
            let room = (MAX_OPTIONS_LENGTH - length).saturating_sub(4) / 8;
            let count = self.sack_count.min(room).min(MAX_SACK_BLOCKS);
            if count > 0 {
                length += 4 + count * 8;
            }
        }
        (length + 3) & !3
    }

    fn write_options(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let room = |out: &Vec<u8>| MAX_OPTIONS_LENGTH - (out.len() - start);

        if self.max_segment_size > 0 && room(out) >= 4 {
            out.push(OPTION_MAX_SEGMENT_SIZE);
            out.push(4);
            out.extend_from_slice(&self.max_segment_size.to_be_bytes());
        }
        if self.options.contains(SegmentOptions::TIMESTAMPS) && room(out) >= 12 {
            // two NOPs align the timestamps to a 4-byte boundary
            out.push(OPTION_NOP);
            out.push(OPTION_NOP);
            out.push(OPTION_TIMESTAMP);
            out.push(10);
            out.extend_from_slice(&self.timestamp_value.to_be_bytes());
            out.extend_from_slice(&self.timestamp_reply.to_be_bytes());
        }
        if self.options.contains(SegmentOptions::WINDOW_SCALE) && room(out) >= 4 {
            out.push(OPTION_NOP);
            out.push(OPTION_WINDOW_SHIFT);
            out.push(3);
            out.push(self.window_shift);
        }
        if self.options.contains(SegmentOptions::SACK_PERMITTED) && room(out) >= 2 {
            out.push(OPTION_SACK_PERMITTED);
            out.push(2);
        }
        if self.sack_count > 0 {
            let count = self
                .sack_count
                .min(MAX_SACK_BLOCKS)
                .min(room(out).saturating_sub(4) / 8);
            if count > 0 {
                out.push(OPTION_NOP);
                out.push(OPTION_NOP);
                out.push(OPTION_SACK);
                out.push(2 + count as u8 * 8);
                for sack in &self.sacks[..count] {
                    out.extend_from_slice(&sack.left_edge.number().to_be_bytes());
                    out.extend_from_slice(&sack.right_edge.number().to_be_bytes());
                }
            }
        }

        if (out.len() - start) % 4 != 0 {
            out.push(OPTION_END);
            while (out.len() - start) % 4 != 0 {
                out.push(0);
            }
        }
    }

    /// Prepends this header (with options and a valid checksum) to
    /// `segment`, which on entry holds the payload only.
    pub fn write_to(&self, segment: &mut Message, source: IpAddr, destination: IpAddr) {
        let mut header = Vec::with_capacity(HEADER_LENGTH + MAX_OPTIONS_LENGTH);
        header.extend_from_slice(&self.source_port.to_be_bytes());
        header.extend_from_slice(&self.destination_port.to_be_bytes());
        header.extend_from_slice(&self.sequence.number().to_be_bytes());
        let acknowledge = if self.control.contains(Control::ACK) {
            self.acknowledge.number()
        } else {
            0
        };
        header.extend_from_slice(&acknowledge.to_be_bytes());
        header.push(0); // data offset, patched below
        header.push(self.control.bits());
        header.extend_from_slice(&self.advertised_window.to_be_bytes());
        header.extend_from_slice(&[0, 0]); // checksum, patched below
        header.extend_from_slice(&self.urgent_offset.to_be_bytes());

        self.write_options(&mut header);
        debug_assert!(header.len() % 4 == 0);
        debug_assert!(header.len() <= HEADER_LENGTH + MAX_OPTIONS_LENGTH);
        header[12] = ((header.len() >> 2) as u8) << 4;

        let mut checksum = Checksum::new();
        add_pseudo_header(
            &mut checksum,
            source,
            destination,
            header.len() + segment.len(),
        );
        checksum.accumulate(header.iter().copied());
        checksum.accumulate(segment.iter());
        let value = checksum.finish();
        header[16..18].copy_from_slice(&value.to_be_bytes());

        segment.header(header);
    }

    /// Decodes and strips the header at the front of `segment`, leaving only
    /// the payload behind. The checksum must verify against the
    /// pseudo-header formed from `source` and `destination`.
    pub fn parse(
        segment: &mut Message,
        source: IpAddr,
        destination: IpAddr,
    ) -> Result<SegmentHeader, SegmentError> {
        if segment.len() < HEADER_LENGTH {
            return Err(SegmentError::HeaderTooShort);
        }

        let head: Vec<u8> = segment
            .iter()
            .take(HEADER_LENGTH + MAX_OPTIONS_LENGTH)
            .collect();
        let header_length = ((head[12] >> 4) as usize) << 2;
        if header_length < HEADER_LENGTH || header_length > segment.len() {
            return Err(SegmentError::BadDataOffset);
        }

        let expected = u16::from_be_bytes([head[16], head[17]]);
        let mut checksum = Checksum::new();
        add_pseudo_header(&mut checksum, source, destination, segment.len());
        checksum.accumulate(
            head[..header_length]
                .iter()
                .enumerate()
                .map(|(i, &byte)| if i == 16 || i == 17 { 0 } else { byte }),
        );
        checksum.accumulate(segment.iter().skip(header_length));
        let actual = checksum.finish();
        if actual != expected {
            return Err(SegmentError::InvalidChecksum { expected, actual });
        }

        let mut header = SegmentHeader::new(Control::from_bits_truncate(head[13]));
        header.source_port = u16::from_be_bytes([head[0], head[1]]);
        header.destination_port = u16::from_be_bytes([head[2], head[3]]);
        header.sequence = Seq::new(u32::from_be_bytes([head[4], head[5], head[6], head[7]]));
        header.acknowledge = Seq::new(u32::from_be_bytes([head[8], head[9], head[10], head[11]]));
        header.advertised_window = u16::from_be_bytes([head[14], head[15]]);
        header.urgent_offset = u16::from_be_bytes([head[18], head[19]]);
        header.parse_options(&head[HEADER_LENGTH..header_length]);

        segment.remove_front(header_length);
        Ok(header)
    }

    fn parse_options(&mut self, options: &[u8]) {
        let mut i = 0;
        while i < options.len() {
            let kind = options[i];
            if kind == OPTION_END || kind == OPTION_NOP {
                i += 1;
                continue;
            }
            if i + 1 >= options.len() {
                break;
            }
            let length = options[i + 1] as usize;
            if length == 0 || i + length > options.len() {
                // malformed length ends option processing
                break;
            }
            match kind {
                OPTION_MAX_SEGMENT_SIZE if length == 4 => {
                    self.max_segment_size =
                        u16::from_be_bytes([options[i + 2], options[i + 3]]);
                }
                OPTION_WINDOW_SHIFT if length == 3 => {
                    self.options |= SegmentOptions::WINDOW_SCALE;
                    self.window_shift = options[i + 2];
                }
                OPTION_TIMESTAMP if length == 10 => {
                    self.options |= SegmentOptions::TIMESTAMPS;
                    self.timestamp_value = u32::from_be_bytes([
                        options[i + 2],
                        options[i + 3],
                        options[i + 4],
                        options[i + 5],
                    ]);
                    self.timestamp_reply = u32::from_be_bytes([
                        options[i + 6],
                        options[i + 7],
                        options[i + 8],
                        options[i + 9],
                    ]);
                }
                OPTION_SACK_PERMITTED if length == 2 => {
                    self.options |= SegmentOptions::SACK_PERMITTED;
                }
                _ => {
                    // unknown kinds (and inbound SACK blocks) are skipped
                }
            }
            i += length;
        }
    }
}

/// A running Internet checksum accumulator.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Checksum(u16);

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.0.overflowing_add(value);
        self.0 = sum + carry as u16;
    }

    pub fn add_u8(&mut self, high: u8, low: u8) {
        self.add_u16(u16::from_be_bytes([high, low]));
    }

    pub fn add_u32(&mut self, value: u32) {
        let bytes = value.to_be_bytes();
        self.add_u8(bytes[0], bytes[1]);
        self.add_u8(bytes[2], bytes[3]);
    }

    /// Folds a byte stream into the sum, zero-padding a trailing odd byte.
    pub fn accumulate(&mut self, mut bytes: impl Iterator<Item = u8>) {
        while let Some(high) = bytes.next() {
            self.add_u8(high, bytes.next().unwrap_or(0));
        }
    }

    /// The one's complement of the accumulated sum. A sum of `0xffff` is
    /// returned as-is so that a transmitted checksum is never zero.
    pub fn finish(self) -> u16 {
        match self.0 {
            0xffff => 0xffff,
            sum => !sum,
        }
    }
}

fn add_pseudo_header(
    checksum: &mut Checksum,
    source: IpAddr,
    destination: IpAddr,
    tcp_length: usize,
) {
    match (source, destination) {
        (IpAddr::V4(source), IpAddr::V4(destination)) => {
            checksum.add_u32(u32::from(source));
            checksum.add_u32(u32::from(destination));
            checksum.add_u8(0, crate::PROTOCOL_NUMBER);
            checksum.add_u16(tcp_length as u16);
        }
        (IpAddr::V6(source), IpAddr::V6(destination)) => {
            for segment in source.segments() {
                checksum.add_u16(segment);
            }
            for segment in destination.segments() {
                checksum.add_u16(segment);
            }
            checksum.add_u32(tcp_length as u32);
            checksum.add_u16(0);
            checksum.add_u8(0, crate::PROTOCOL_NUMBER);
        }
        _ => debug_assert!(false, "segment with mixed address families"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1));
    const DESTINATION: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    #[test]
    fn round_trip_with_options() {
        let mut header = SegmentHeader::new(Control::SYN | Control::ACK);
        header.source_port = 0xcafe;
        header.destination_port = 0xbabe;
        header.sequence = Seq::new(123_456_789);
        header.acknowledge = Seq::new(987_654_321);
        header.advertised_window = 8192;
        header.max_segment_size = 1460;
        header.window_shift = 6;
        header.timestamp_value = 77;
        header.timestamp_reply = 33;
        header.options =
            SegmentOptions::WINDOW_SCALE | SegmentOptions::TIMESTAMPS | SegmentOptions::SACK_PERMITTED;

        let mut segment = Message::new(b"some payload");
        header.write_to(&mut segment, SOURCE, DESTINATION);
        // MSS(4) + NOP NOP TS(10) + NOP WS(3) + SACK-permitted(2) = 22,
        // padded to 24
        assert_eq!(segment.len(), HEADER_LENGTH + 24 + 12);

        let parsed = SegmentHeader::parse(&mut segment, SOURCE, DESTINATION).unwrap();
        assert_eq!(parsed.source_port, 0xcafe);
        assert_eq!(parsed.destination_port, 0xbabe);
        assert_eq!(parsed.sequence, Seq::new(123_456_789));
        assert_eq!(parsed.acknowledge, Seq::new(987_654_321));
        assert_eq!(parsed.control, Control::SYN | Control::ACK);
        assert_eq!(parsed.advertised_window, 8192);
        assert_eq!(parsed.max_segment_size, 1460);
        assert_eq!(parsed.window_shift, 6);
        assert_eq!(parsed.timestamp_value, 77);
        assert_eq!(parsed.timestamp_reply, 33);
        assert_eq!(parsed.options, header.options);
        assert_eq!(segment.to_vec(), b"some payload");
    }

    #[test]
    fn parses_packet_from_etherparse() -> anyhow::Result<()> {
        let payload = b"Hello, world!";
        let mut expected = etherparse::TcpHeader::new(0xcafe, 0xbabe, 123_456_789, 1024);
        expected.acknowledgment_number = 10;
        expected.ack = true;
        expected.psh = true;
        let ip_header = etherparse::Ipv4Header::new(
            payload.len() as u16,
            30,
            crate::PROTOCOL_NUMBER,
            [192, 168, 0, 1],
            [10, 0, 0, 7],
        );
        expected.checksum = expected.calc_checksum_ipv4(&ip_header, payload)?;
        let mut serial = Vec::new();
        expected.write(&mut serial)?;
        serial.extend_from_slice(payload);

        let mut segment = Message::new(serial);
        let actual = SegmentHeader::parse(&mut segment, SOURCE, DESTINATION)?;
        assert_eq!(actual.source_port, 0xcafe);
        assert_eq!(actual.destination_port, 0xbabe);
        assert_eq!(actual.sequence, Seq::new(123_456_789));
        assert_eq!(actual.acknowledge, Seq::new(10));
        assert_eq!(actual.control, Control::ACK | Control::PSH);
        assert_eq!(actual.advertised_window, 1024);
        assert_eq!(segment.to_vec(), payload);
        Ok(())
    }

    #[test]
    fn encoding_satisfies_etherparse() -> anyhow::Result<()> {
        let mut header = SegmentHeader::new(Control::SYN);
        header.source_port = 4000;
        header.destination_port = 80;
        header.sequence = Seq::new(42);
        header.advertised_window = 4096;
        header.max_segment_size = 536;
        header.window_shift = 2;
        header.options = SegmentOptions::WINDOW_SCALE;

        let mut segment = Message::empty();
        header.write_to(&mut segment, SOURCE, DESTINATION);
        let bytes = segment.to_vec();

        let slice = etherparse::TcpHeaderSlice::from_slice(&bytes)?;
        assert_eq!(slice.source_port(), 4000);
        assert_eq!(slice.destination_port(), 80);
        assert_eq!(slice.sequence_number(), 42);
        assert!(slice.syn());
        assert!(!slice.ack());

        let options: Vec<_> = slice.options_iterator().filter_map(Result::ok).collect();
        assert!(options.contains(&etherparse::TcpOptionElement::MaximumSegmentSize(536)));
        assert!(options.contains(&etherparse::TcpOptionElement::WindowScale(2)));
        Ok(())
    }

    #[test]
    fn malformed_option_length_stops_parsing() {
        let mut header = SegmentHeader::new(Control::empty());
        header.parse_options(&[
            OPTION_NOP,
            OPTION_MAX_SEGMENT_SIZE,
            4,
            0x05,
            0xb4,
            77, // unknown kind
            0,  // zero length: stop here
            OPTION_WINDOW_SHIFT,
            3,
            7,
        ]);
        assert_eq!(header.max_segment_size, 1460);
        assert!(!header.options.contains(SegmentOptions::WINDOW_SCALE));
    }

    #[test]
    fn unknown_options_are_skipped_by_length() {
        let mut header = SegmentHeader::new(Control::empty());
        header.parse_options(&[
            30, 4, 0xde, 0xad, // unknown kind 30, length 4
            OPTION_WINDOW_SHIFT,
            3,
            7,
        ]);
        assert!(header.options.contains(SegmentOptions::WINDOW_SCALE));
        assert_eq!(header.window_shift, 7);
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut header = SegmentHeader::new(Control::ACK);
        header.sequence = Seq::new(1);
        let mut segment = Message::new(b"payload");
        header.write_to(&mut segment, SOURCE, DESTINATION);

        let mut bytes = segment.to_vec();
        bytes[HEADER_LENGTH + 2] ^= 0x40;
        let mut corrupted = Message::new(bytes);
        assert!(matches!(
            SegmentHeader::parse(&mut corrupted, SOURCE, DESTINATION),
            Err(SegmentError::InvalidChecksum { .. })
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let mut short = Message::new(b"too short");
        assert!(matches!(
            SegmentHeader::parse(&mut short, SOURCE, DESTINATION),
            Err(SegmentError::HeaderTooShort)
        ));

        // data offset pointing past the end of the segment
        let header = SegmentHeader::new(Control::ACK);
        let mut segment = Message::empty();
        header.write_to(&mut segment, SOURCE, DESTINATION);
        let mut bytes = segment.to_vec();
        bytes[12] = 0xf0;
        let mut bad = Message::new(bytes);
        assert!(matches!(
            SegmentHeader::parse(&mut bad, SOURCE, DESTINATION),
            Err(SegmentError::BadDataOffset)
        ));
    }
}
