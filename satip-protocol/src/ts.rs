//! MPEG-TS packet helpers.
//!
//! Only the header fields the client needs are decoded here: pid, payload
//! unit start, continuity counter, adaptation field presence and the
//! discontinuity indicator.

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte (0x47).
pub const SYNC_BYTE: u8 = 0x47;

/// Header size in bytes.
pub const TS_HEADER_SIZE: usize = 4;

/// Largest payload a packet can carry (no adaptation field).
pub const TS_MAX_PAYLOAD: usize = TS_PACKET_SIZE - TS_HEADER_SIZE;

/// Largest valid pid value.
pub const MAX_PID: u16 = 0x1FFF;

const PAYLOAD_FLAG: u8 = 0x10;
const ADAPTATION_FLAG: u8 = 0x20;

/// Parsed TS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    /// Transport error indicator.
    pub transport_error: bool,
    /// Payload unit start indicator.
    pub payload_unit_start: bool,
    /// Packet Identifier (13 bits).
    pub pid: u16,
    /// Adaptation field control (2 bits).
    pub adaptation_field_control: u8,
    /// Continuity counter (4 bits).
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Parse the 4-byte header. Returns `None` if the slice is short or not sync aligned.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < TS_HEADER_SIZE || packet[0] != SYNC_BYTE {
            return None;
        }
        Some(Self {
            transport_error: packet[1] & 0x80 != 0,
            payload_unit_start: packet[1] & 0x40 != 0,
            pid: pid(packet),
            adaptation_field_control: (packet[3] >> 4) & 0x03,
            continuity_counter: packet[3] & 0x0F,
        })
    }

    /// Check if packet has adaptation field.
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    /// Check if packet has payload.
    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }
}

/// Packet identifier of a packet starting with a TS header.
#[inline]
pub fn pid(packet: &[u8]) -> u16 {
    (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16
}

/// Payload unit start indicator.
#[inline]
pub fn payload_unit_start(packet: &[u8]) -> bool {
    packet[1] & 0x40 != 0
}

/// Continuity counter.
#[inline]
pub fn continuity_counter(packet: &[u8]) -> u8 {
    packet[3] & 0x0F
}

/// Number of payload bytes at the end of the packet.
///
/// Returns 0 when the payload flag is clear or the adaptation field length
/// exceeds 183 (corrupted packet).
pub fn payload_size(packet: &[u8]) -> usize {
    if packet[3] & PAYLOAD_FLAG == 0 {
        return 0;
    }
    if packet[3] & ADAPTATION_FLAG != 0 {
        let adaptation_len = packet[4] as usize;
        if adaptation_len > TS_MAX_PAYLOAD - 1 {
            return 0;
        }
        return TS_MAX_PAYLOAD - 1 - adaptation_len;
    }
    TS_MAX_PAYLOAD
}

/// True when a present, non-empty adaptation field sets the discontinuity indicator.
pub fn has_discontinuity(packet: &[u8]) -> bool {
    packet[3] & ADAPTATION_FLAG != 0 && packet[4] > 0 && packet[5] & 0x80 != 0
}

/// Position of the first sync byte in `buf`.
pub fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == SYNC_BYTE)
}
