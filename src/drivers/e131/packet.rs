//! ANSI E1.31-2016 data packet.

use std::ops::RangeInclusive;

/// Size of a data packet carrying a full universe.
pub const PACKET_LEN: usize = 638;

/// Number of DMX slots in a universe.
pub const SLOT_COUNT: u16 = 512;

const ACN_PACKET_IDENTIFIER: [u8; 12] = *b"ASC-E1.17\0\0\0";
const VECTOR_ROOT_E131_DATA: u32 = 0x0000_0004;
const VECTOR_E131_DATA_PACKET: u32 = 0x0000_0002;
const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;
const DMP_ADDRESS_TYPE: u8 = 0xA1;

const ROOT_FLAGS_OFFSET: usize = 16;
const CID_OFFSET: usize = 22;
const FRAMING_FLAGS_OFFSET: usize = 38;
const SOURCE_NAME_OFFSET: usize = 44;
const SOURCE_NAME_LEN: usize = 64;
const PRIORITY_OFFSET: usize = 108;
const SEQUENCE_OFFSET: usize = 111;
const UNIVERSE_OFFSET: usize = 113;
const DMP_FLAGS_OFFSET: usize = 115;
const START_CODE_OFFSET: usize = 125;

/// One universe worth of DMX data, kept ready to send.
///
/// Slot `n` (1-based) lives at byte `125 + n`; byte 125 is the start code.
#[derive(Clone)]
pub struct DataPacket {
    buf: [u8; PACKET_LEN],
}

impl DataPacket {
    pub fn new(cid: [u8; 16], source_name: &str, universe: u16, priority: u8) -> Self {
        let mut buf = [0u8; PACKET_LEN];

        // Root layer
        buf[0..2].copy_from_slice(&0x0010u16.to_be_bytes());
        buf[2..4].copy_from_slice(&0u16.to_be_bytes());
        buf[4..16].copy_from_slice(&ACN_PACKET_IDENTIFIER);
        buf[16..18].copy_from_slice(&flags_and_length(ROOT_FLAGS_OFFSET));
        buf[18..22].copy_from_slice(&VECTOR_ROOT_E131_DATA.to_be_bytes());
        buf[CID_OFFSET..CID_OFFSET + 16].copy_from_slice(&cid);

        // Framing layer
        buf[38..40].copy_from_slice(&flags_and_length(FRAMING_FLAGS_OFFSET));
        buf[40..44].copy_from_slice(&VECTOR_E131_DATA_PACKET.to_be_bytes());
        let name = truncate_utf8(source_name, SOURCE_NAME_LEN - 1);
        buf[SOURCE_NAME_OFFSET..SOURCE_NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
        buf[PRIORITY_OFFSET] = priority;
        // Sync address, sequence and options stay zero.
        buf[UNIVERSE_OFFSET..UNIVERSE_OFFSET + 2].copy_from_slice(&universe.to_be_bytes());

        // DMP layer
        buf[115..117].copy_from_slice(&flags_and_length(DMP_FLAGS_OFFSET));
        buf[117] = VECTOR_DMP_SET_PROPERTY;
        buf[118] = DMP_ADDRESS_TYPE;
        buf[119..121].copy_from_slice(&0u16.to_be_bytes());
        buf[121..123].copy_from_slice(&1u16.to_be_bytes());
        buf[123..125].copy_from_slice(&(SLOT_COUNT + 1).to_be_bytes());
        buf[START_CODE_OFFSET] = 0;

        Self { buf }
    }

    pub fn universe(&self) -> u16 {
        u16::from_be_bytes([self.buf[UNIVERSE_OFFSET], self.buf[UNIVERSE_OFFSET + 1]])
    }

    pub fn sequence(&self) -> u8 {
        self.buf[SEQUENCE_OFFSET]
    }

    /// Moves to the next sequence number, wrapping after 255.
    pub fn advance_sequence(&mut self) {
        self.buf[SEQUENCE_OFFSET] = self.buf[SEQUENCE_OFFSET].wrapping_add(1);
    }

    /// Sets a 1-based slot. Returns `false` outside `1..=512`.
    pub fn set_channel(&mut self, channel: u32, value: u8) -> bool {
        match slot_offset(channel) {
            Some(offset) => {
                self.buf[offset] = value;
                true
            }
            None => false,
        }
    }

    pub fn channel(&self, channel: u32) -> Option<u8> {
        slot_offset(channel).map(|offset| self.buf[offset])
    }

    /// Zeroes the given 1-based slots.
    pub fn clear_channels(&mut self, channels: RangeInclusive<u32>) {
        for channel in channels {
            self.set_channel(channel, 0);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

fn slot_offset(channel: u32) -> Option<usize> {
    (1..=u32::from(SLOT_COUNT))
        .contains(&channel)
        .then(|| START_CODE_OFFSET + channel as usize)
}

/// PDU flags (0x7) plus the length from `offset` to the end of the packet.
fn flags_and_length(offset: usize) -> [u8; 2] {
    (0x7000 | (PACKET_LEN - offset) as u16).to_be_bytes()
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CID: [u8; 16] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        0x10,
    ];

    #[test]
    fn header_matches_standard_layout() {
        let packet = DataPacket::new(CID, "rgbd", 7, 100);
        let bytes = packet.as_bytes();

        assert_eq!(bytes.len(), 638);
        assert_eq!(bytes[0..4], [0x00, 0x10, 0x00, 0x00]);
        assert_eq!(&bytes[4..16], b"ASC-E1.17\0\0\0");
        assert_eq!(bytes[16..18], [0x72, 0x6E]);
        assert_eq!(bytes[18..22], [0, 0, 0, 4]);
        assert_eq!(bytes[22..38], CID);

        assert_eq!(bytes[38..40], [0x72, 0x58]);
        assert_eq!(bytes[40..44], [0, 0, 0, 2]);
        assert_eq!(&bytes[44..49], b"rgbd\0");
        assert_eq!(bytes[108], 100);
        assert_eq!(bytes[109..111], [0, 0]);
        assert_eq!(bytes[111], 0);
        assert_eq!(bytes[112], 0);
        assert_eq!(bytes[113..115], [0, 7]);

        assert_eq!(bytes[115..117], [0x72, 0x0B]);
        assert_eq!(bytes[117..119], [0x02, 0xA1]);
        assert_eq!(bytes[119..125], [0x00, 0x00, 0x00, 0x01, 0x02, 0x01]);
        assert_eq!(bytes[125], 0);
        assert!(bytes[126..].iter().all(|b| *b == 0));
        assert_eq!(packet.universe(), 7);
    }

    #[test]
    fn channels_are_one_based() {
        let mut packet = DataPacket::new(CID, "rgbd", 1, 100);

        assert!(packet.set_channel(1, 0xAA));
        assert!(packet.set_channel(512, 0xBB));
        assert!(!packet.set_channel(0, 0xCC));
        assert!(!packet.set_channel(513, 0xCC));

        assert_eq!(packet.as_bytes()[126], 0xAA);
        assert_eq!(packet.as_bytes()[637], 0xBB);
        assert_eq!(packet.as_bytes()[125], 0);
        assert_eq!(packet.channel(512), Some(0xBB));

        packet.clear_channels(1..=511);
        assert_eq!(packet.channel(1), Some(0));
        assert_eq!(packet.channel(512), Some(0xBB));
    }

    #[test]
    fn sequence_wraps() {
        let mut packet = DataPacket::new(CID, "rgbd", 1, 100);
        for _ in 0..255 {
            packet.advance_sequence();
        }
        assert_eq!(packet.sequence(), 255);
        packet.advance_sequence();
        assert_eq!(packet.sequence(), 0);
    }

    #[test]
    fn long_source_name_keeps_terminator() {
        let name = "é".repeat(40);
        let packet = DataPacket::new(CID, &name, 1, 100);
        let field = &packet.as_bytes()[44..108];

        assert_eq!(field[63], 0);
        assert_eq!(field[62], 0);
        assert!(std::str::from_utf8(&field[..62]).is_ok());
    }
}
