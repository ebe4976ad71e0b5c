//! TCP segment header codec and the internet checksum.

use crate::error::ParseError;
use crate::ip::{Ip4Packet, PROTO_TCP};

/// TCP segment header.
///
/// ```text
///     offset 0:  srcPort (u16)      offset 2:  destPort (u16)
///     offset 4:  seqNumber (u32)    offset 8:  ackNumber (u32)
///     offset 12: flags (u16)  bits: [12..16] = headerWords,
///                                   [4] = ACK, [1] = SYN
///     offset 14: window (u16)
///     offset 16: checksum (u16)     offset 18: urgent (u16)
/// ```
///
/// All fields are big-endian on the wire. Only the SYN and ACK control
/// bits are interpreted; emitted segments never carry options, so the
/// header-words field of an outgoing header is always 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    seq_number: u32,
    ack_number: u32,
    /// Header-words nibble plus control bits, as found on the wire.
    flags: u16,
    window: u16,
    checksum: u16,
    urgent_pointer: u16,
}

impl TcpHeader {
    /// Length of a TCP header without options, in bytes.
    pub const LEN: usize = 20;

    /// Minimum value of the header-words field.
    pub const MIN_HEADER_WORDS: u16 = 5;

    const SYN_FLAG: u16 = 1 << 1;
    const ACK_FLAG: u16 = 1 << 4;

    /// Creates a header with the given ports, sequence number, and
    /// window, no control bits, and a header-words field of 5.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            ack_number: 0,
            flags: Self::MIN_HEADER_WORDS << 12,
            window,
            checksum: 0,
            urgent_pointer: 0,
        }
    }

    /// Returns the `source port` field.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Returns the `destination port` field.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Returns the `sequence number` field.
    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Returns the `acknowledgment number` field.
    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// Sets the `acknowledgment number` field.
    pub fn set_ack_number(&mut self, ack: u32) {
        self.ack_number = ack;
    }

    /// Returns the header-words field (number of 32-bit words occupied by
    /// the header, including options).
    pub fn header_words(&self) -> u16 {
        self.flags >> 12
    }

    /// Returns `true` if the SYN control bit is set.
    pub fn syn(&self) -> bool {
        self.flags & Self::SYN_FLAG != 0
    }

    /// Sets the SYN control bit.
    pub fn set_syn(&mut self) {
        self.flags |= Self::SYN_FLAG;
    }

    /// Returns `true` if the ACK control bit is set.
    pub fn ack(&self) -> bool {
        self.flags & Self::ACK_FLAG != 0
    }

    /// Sets the ACK control bit.
    pub fn set_ack(&mut self) {
        self.flags |= Self::ACK_FLAG;
    }

    /// Returns the `window` field.
    pub fn window(&self) -> u16 {
        self.window
    }

    /// Returns the `checksum` field.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Returns the `urgent pointer` field.
    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }

    /// Computes and stores the checksum over the pseudo-header, this
    /// header, and `payload`.
    pub fn set_checksum(&mut self, src_ip: u32, dst_ip: u32, payload: &[u8]) {
        self.checksum = self.compute_checksum(src_ip, dst_ip, payload);
    }

    /// Returns the checksum of the segment this header would start.
    ///
    /// The checksum field itself counts as zero, per the usual internet
    /// checksum rules.
    pub fn compute_checksum(&self, src_ip: u32, dst_ip: u32, payload: &[u8]) -> u16 {
        let mut raw = self.to_be_bytes();
        raw[16] = 0x00;
        raw[17] = 0x00;

        let mut csum = Checksum::new();
        csum.update(&pseudo_header(
            src_ip,
            dst_ip,
            (Self::LEN + payload.len()) as u16,
        ));
        csum.update(&raw);
        csum.update(payload);
        csum.finalize()
    }

    /// Returns the memory representation of the header as a byte array in
    /// big-endian (network) byte order.
    pub fn to_be_bytes(&self) -> [u8; Self::LEN] {
        let mut raw = [0u8; Self::LEN];

        raw[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        raw[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        raw[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        raw[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        raw[12..14].copy_from_slice(&self.flags.to_be_bytes());
        raw[14..16].copy_from_slice(&self.window.to_be_bytes());
        raw[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        raw[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        raw
    }
}

impl TryFrom<&[u8]> for TcpHeader {
    type Error = ParseError;

    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        if raw.len() < Self::LEN {
            return Err(ParseError::Truncated {
                provided: raw.len(),
                min: Self::LEN,
            });
        }

        Ok(Self {
            src_port: u16::from_be_bytes([raw[0], raw[1]]),
            dst_port: u16::from_be_bytes([raw[2], raw[3]]),
            seq_number: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ack_number: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: u16::from_be_bytes([raw[12], raw[13]]),
            window: u16::from_be_bytes([raw[14], raw[15]]),
            checksum: u16::from_be_bytes([raw[16], raw[17]]),
            urgent_pointer: u16::from_be_bytes([raw[18], raw[19]]),
        })
    }
}

/// A parsed inbound TCP segment.
#[derive(Debug, Clone)]
pub struct TcpPacket {
    /// The segment header.
    pub header: TcpHeader,
    payload: Vec<u8>,
}

impl TcpPacket {
    /// Parses a TCP segment out of an IP packet's payload.
    ///
    /// # Errors
    ///
    /// Rejects payloads shorter than a minimal header, header-words
    /// fields below 5 or claiming more header than the payload carries,
    /// and segments whose nonzero checksum does not verify against the
    /// pseudo-header.
    pub fn parse(packet: &Ip4Packet) -> Result<Self, ParseError> {
        let ip_payload = &packet.payload[..];
        let header = TcpHeader::try_from(ip_payload)?;

        let words = header.header_words();
        if words < TcpHeader::MIN_HEADER_WORDS || words as usize * 4 > ip_payload.len() {
            return Err(ParseError::InvalidHeaderWords { provided: words });
        }

        if header.checksum() != 0 {
            let mut csum = Checksum::new();
            csum.update(&pseudo_header(
                packet.src,
                packet.dst,
                ip_payload.len() as u16,
            ));
            csum.update(ip_payload);

            // A valid segment sums to all-ones; the folded result is then
            // 0 or, when the data itself sums to zero, 0xFFFF.
            let result = csum.finalize();
            if result != 0 && result != 0xFFFF {
                return Err(ParseError::InvalidChecksum);
            }
        }

        Ok(Self {
            header,
            payload: ip_payload[words as usize * 4..].to_vec(),
        })
    }

    /// Returns the segment payload, past the header and any options.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Returns the 12-byte pseudo-header the TCP checksum is computed over.
///
/// ```text
///     src(4) dst(4) zero(1) proto(1)=6 len(2)
/// ```
pub fn pseudo_header(src_ip: u32, dst_ip: u32, tcp_len: u16) -> [u8; 12] {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip.to_be_bytes());
    pseudo[4..8].copy_from_slice(&dst_ip.to_be_bytes());
    pseudo[8] = 0;
    pseudo[9] = PROTO_TCP;
    pseudo[10..12].copy_from_slice(&tcp_len.to_be_bytes());
    pseudo
}

/// Incremental 16-bit ones'-complement sum.
#[derive(Debug, Default)]
pub struct Checksum {
    sum: u32,
    /// High byte of a word split across two `update` calls.
    pending: Option<u8>,
}

impl Checksum {
    /// Creates an empty sum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `data` into the sum, treating the bytes as a stream of
    /// big-endian 16-bit words continued from the previous call.
    pub fn update(&mut self, mut data: &[u8]) {
        if let Some(high) = self.pending.take() {
            match data.split_first() {
                Some((&low, rest)) => {
                    self.add_word(u16::from_be_bytes([high, low]));
                    data = rest;
                }
                None => {
                    self.pending = Some(high);
                    return;
                }
            }
        }

        let mut chunks = data.chunks_exact(2);
        for chunk in &mut chunks {
            self.add_word(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        self.pending = chunks.remainder().first().copied();
    }

    /// Returns the ones'-complement of the folded sum. A trailing odd
    /// byte is padded on the right with zeros.
    pub fn finalize(mut self) -> u16 {
        if let Some(high) = self.pending.take() {
            self.add_word(u16::from_be_bytes([high, 0x00]));
        }

        while self.sum > 0xFFFF {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }

        !(self.sum as u16)
    }

    fn add_word(&mut self, word: u16) {
        self.sum += word as u32;

        // Carry folding keeps the running sum within 16 bits.
        if self.sum > 0xFFFF {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn packet(src: u32, dst: u32, payload: &[u8]) -> Ip4Packet {
        Ip4Packet {
            src,
            dst,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn header_defaults_to_five_words_and_no_flags() {
        let header = TcpHeader::new(32768, 9000, 12345, 512);

        assert_eq!(header.header_words(), 5);
        assert!(!header.syn());
        assert!(!header.ack());
        assert_eq!(header.seq_number(), 12345);
        assert_eq!(header.window(), 512);
        assert_eq!(header.checksum(), 0);
        assert_eq!(header.urgent_pointer(), 0);
    }

    #[test]
    fn header_flag_bits_are_isolated() {
        let mut header = TcpHeader::new(1, 2, 0, 0);

        header.set_syn();
        assert!(header.syn());
        assert!(!header.ack());
        assert_eq!(header.header_words(), 5);

        header.set_ack();
        assert!(header.syn());
        assert!(header.ack());
        assert_eq!(header.header_words(), 5);

        let raw = header.to_be_bytes();
        // SYN is bit 1 and ACK bit 4 of the low flags byte.
        assert_eq!(raw[13], 0b0001_0010);
        assert_eq!(raw[12] >> 4, 5);
    }

    #[test]
    fn header_round_trip() {
        let mut header = TcpHeader::new(40982, 443, 3_166_393_512, 64240);
        header.set_syn();
        header.set_ack();
        header.set_ack_number(77);

        let raw = header.to_be_bytes();
        let parsed = TcpHeader::try_from(&raw[..]).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_known_checksum() {
        // 10.0.0.1 -> 10.0.0.2, ports 1 -> 2, seq 0, SYN, empty payload.
        //
        // Pseudo-header words: 0x0A00 0x0001 0x0A00 0x0002 0x0006 0x0014.
        // Header words: 0x0001 0x0002 0x5002. Sum = 0x6422.
        let mut header = TcpHeader::new(1, 2, 0, 0);
        header.set_syn();

        assert_eq!(
            header.compute_checksum(0x0a00_0001, 0x0a00_0002, &[]),
            !0x6422u16
        );
    }

    #[test]
    fn parse_accepts_a_well_formed_segment() {
        let mut header = TcpHeader::new(1000, 2000, 5, 100);
        header.set_ack();
        header.set_ack_number(6);
        header.set_checksum(0x7f00_0001, 0x7f00_0002, b"payload");

        let mut ip_payload = header.to_be_bytes().to_vec();
        ip_payload.extend_from_slice(b"payload");

        let parsed = TcpPacket::parse(&packet(0x7f00_0001, 0x7f00_0002, &ip_payload)).unwrap();
        assert_eq!(parsed.header, header);
        assert_eq!(parsed.payload(), b"payload");
    }

    #[test]
    fn parse_rejects_corrupted_segments() {
        let mut header = TcpHeader::new(1000, 2000, 5, 100);
        header.set_checksum(0x7f00_0001, 0x7f00_0002, b"payload");

        let mut ip_payload = header.to_be_bytes().to_vec();
        ip_payload.extend_from_slice(b"payload");
        ip_payload[22] ^= 0xFF;

        assert_eq!(
            TcpPacket::parse(&packet(0x7f00_0001, 0x7f00_0002, &ip_payload)).unwrap_err(),
            ParseError::InvalidChecksum
        );
    }

    #[test]
    fn parse_skips_verification_for_zero_checksum() {
        let header = TcpHeader::new(1000, 2000, 5, 100);

        let mut ip_payload = header.to_be_bytes().to_vec();
        ip_payload.extend_from_slice(b"unchecked");

        assert!(TcpPacket::parse(&packet(1, 2, &ip_payload)).is_ok());
    }

    #[test]
    fn parse_rejects_truncated_segments() {
        assert_eq!(
            TcpPacket::parse(&packet(1, 2, &[0u8; 19])).unwrap_err(),
            ParseError::Truncated {
                provided: 19,
                min: TcpHeader::LEN,
            }
        );
    }

    #[test]
    fn parse_rejects_bad_header_words() {
        // Header-words of 4 (below the minimum).
        let mut raw = TcpHeader::new(1, 2, 0, 0).to_be_bytes();
        raw[12] = 0x40;
        assert_eq!(
            TcpPacket::parse(&packet(1, 2, &raw)).unwrap_err(),
            ParseError::InvalidHeaderWords { provided: 4 }
        );

        // Header-words of 8 with only 20 bytes present.
        let mut raw = TcpHeader::new(1, 2, 0, 0).to_be_bytes();
        raw[12] = 0x80;
        assert_eq!(
            TcpPacket::parse(&packet(1, 2, &raw)).unwrap_err(),
            ParseError::InvalidHeaderWords { provided: 8 }
        );
    }

    #[test]
    fn parse_strips_options_from_the_payload() {
        // Header-words of 6: four bytes of options before the payload.
        let mut raw = TcpHeader::new(1, 2, 0, 0).to_be_bytes().to_vec();
        raw[12] = 0x60;
        raw.extend_from_slice(&[0x01, 0x01, 0x01, 0x01]);
        raw.extend_from_slice(b"data");

        let parsed = TcpPacket::parse(&packet(1, 2, &raw)).unwrap();
        assert_eq!(parsed.payload(), b"data");
    }

    #[test]
    fn checksum_handles_odd_and_split_updates() {
        // The same bytes must sum identically however they are sliced.
        let bytes = b"an odd number of bytes!";

        let mut whole = Checksum::new();
        whole.update(bytes);

        let mut split = Checksum::new();
        split.update(&bytes[..7]);
        split.update(&bytes[7..8]);
        split.update(&bytes[8..]);

        assert_eq!(whole.finalize(), split.finalize());
    }

    proptest! {
        #[test]
        fn header_parsing_round_trips(raw in prop::collection::vec(any::<u8>(), TcpHeader::LEN..64)) {
            let header = TcpHeader::try_from(&raw[..]).unwrap();
            prop_assert_eq!(header.to_be_bytes().to_vec(), raw[..TcpHeader::LEN].to_vec());
        }

        #[test]
        fn emitted_segments_always_verify(
            src in any::<u32>(),
            dst in any::<u32>(),
            seq in any::<u32>(),
            payload in prop::collection::vec(any::<u8>(), 0..128),
        ) {
            let mut header = TcpHeader::new(32768, 9000, seq, 1024);
            header.set_ack();
            header.set_checksum(src, dst, &payload);

            let mut ip_payload = header.to_be_bytes().to_vec();
            ip_payload.extend_from_slice(&payload);

            prop_assert!(TcpPacket::parse(&packet(src, dst, &ip_payload)).is_ok());
        }
    }
}
