//! Software section filter for one pid.
//!
//! TS payloads are appended to a bounded feed buffer, complete sections are
//! carved out of it by their declared length and compared against an
//! 18-byte value/mask/mode filter. Matches are queued for delivery.
//!
//! Filter bytes map 1:1 onto section bytes, so byte 0 is the table id and
//! bytes 1-2 (section length) are normally masked out.

use std::collections::VecDeque;

use bytes::Bytes;

use satip_protocol::ts::{self, SYNC_BYTE, TS_PACKET_SIZE};

/// Filter length in bytes.
pub const FILTER_SIZE: usize = 18;

/// Largest section accepted.
pub const MAX_SECTION_SIZE: usize = 4096;

/// Feed buffer: one maximal section plus one TS payload.
pub const FEED_BUFFER_SIZE: usize = MAX_SECTION_SIZE + TS_PACKET_SIZE;

/// Matched sections held per filter before new matches are dropped.
pub const MAX_QUEUED_SECTIONS: usize = 64;

const STUFFING_TABLE_ID: u8 = 0xFF;

/// Immutable description of one filter.
///
/// `mode` uses the Linux demux convention: a clear bit requires the masked
/// section bit to equal `value`, a set bit requires at least one such bit
/// to differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionFilterParams {
    pub pid: u16,
    pub value: [u8; FILTER_SIZE],
    pub mask: [u8; FILTER_SIZE],
    pub mode: [u8; FILTER_SIZE],
}

impl SectionFilterParams {
    /// Positive match on the table id only.
    pub fn new(pid: u16, tid: u8, mask: u8) -> Self {
        let mut value = [0u8; FILTER_SIZE];
        let mut filter_mask = [0u8; FILTER_SIZE];
        value[0] = tid;
        filter_mask[0] = mask;
        Self {
            pid,
            value,
            mask: filter_mask,
            mode: [0u8; FILTER_SIZE],
        }
    }

    pub fn tid(&self) -> u8 {
        self.value[0]
    }

    pub fn table_mask(&self) -> u8 {
        self.mask[0]
    }
}

/// Reassembles sections of one pid and queues the matching ones.
#[derive(Debug)]
pub struct SectionFilterEngine {
    params: SectionFilterParams,
    mask_and_mode: [u8; FILTER_SIZE],
    mask_and_not_mode: [u8; FILTER_SIZE],
    check_not_equal: bool,

    feed: Box<[u8]>,
    write_pos: usize,
    read_pos: usize,
    section_len: usize,
    continuity: u8,
    pusi_seen: bool,

    queue: VecDeque<Bytes>,
    queue_limit: usize,
    dropped: u64,
}

impl SectionFilterEngine {
    pub fn new(params: SectionFilterParams) -> Self {
        Self::with_queue_limit(params, MAX_QUEUED_SECTIONS)
    }

    pub fn with_queue_limit(params: SectionFilterParams, queue_limit: usize) -> Self {
        let mut mask_and_mode = [0u8; FILTER_SIZE];
        let mut mask_and_not_mode = [0u8; FILTER_SIZE];
        for i in 0..FILTER_SIZE {
            let positive = !params.mode[i];
            mask_and_mode[i] = params.mask[i] & positive;
            mask_and_not_mode[i] = params.mask[i] & !positive;
        }
        let check_not_equal = mask_and_not_mode.iter().any(|&b| b != 0);

        Self {
            params,
            mask_and_mode,
            mask_and_not_mode,
            check_not_equal,
            feed: vec![0u8; FEED_BUFFER_SIZE].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0,
            section_len: 0,
            continuity: 0,
            pusi_seen: false,
            queue: VecDeque::new(),
            queue_limit: queue_limit.max(1),
            dropped: 0,
        }
    }

    pub fn params(&self) -> &SectionFilterParams {
        &self.params
    }

    pub fn pid(&self) -> u16 {
        self.params.pid
    }

    /// No partial section is buffered.
    pub fn is_idle(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// A section start has been seen since the last reset.
    pub fn is_synced(&self) -> bool {
        self.pusi_seen
    }

    /// Matched sections waiting for delivery.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.queue.front()
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.queue.pop_front()
    }

    /// Discard every queued section.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Matches dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Feed one TS packet. Packets of other pids are ignored.
    pub fn process(&mut self, packet: &[u8]) {
        if packet.len() < TS_PACKET_SIZE || packet[0] != SYNC_BYTE || ts::pid(packet) != self.params.pid
        {
            return;
        }
        let count = ts::payload_size(packet);
        if count == 0 {
            return;
        }
        let start = TS_PACKET_SIZE - count;

        let cc = ts::continuity_counter(packet);
        let cc_ok = (self.continuity + 1) & 0x0F == cc;
        self.continuity = cc;
        if !cc_ok || ts::has_discontinuity(packet) {
            self.pusi_seen = false;
            self.new_section();
        }

        if ts::payload_unit_start(packet) {
            let pointer = packet[start] as usize;
            if count > 1 && pointer < count {
                let before = &packet[start + 1..start + 1 + pointer];
                let after = &packet[start + 1 + pointer..];
                self.copy_dump(before);
                self.pusi_seen = true;
                self.new_section();
                self.copy_dump(after);
            }
        } else if self.pusi_seen {
            self.copy_dump(&packet[start..]);
        }
    }

    /// Apply the value/mask/mode comparison to a complete section.
    pub fn matches(&self, section: &[u8]) -> bool {
        let mut not_equal = 0u8;
        for i in 0..FILTER_SIZE {
            let xor = self.params.value[i] ^ section.get(i).copied().unwrap_or(0);
            if self.mask_and_mode[i] & xor != 0 {
                return false;
            }
            not_equal |= self.mask_and_not_mode[i] & xor;
        }
        !self.check_not_equal || not_equal != 0
    }

    fn new_section(&mut self) {
        self.write_pos = 0;
        self.read_pos = 0;
        self.section_len = 0;
    }

    fn copy_dump(&mut self, data: &[u8]) {
        let len = data.len().min(FEED_BUFFER_SIZE - self.write_pos);
        if len == 0 {
            return;
        }
        self.feed[self.write_pos..self.write_pos + len].copy_from_slice(&data[..len]);
        self.write_pos += len;

        while self.read_pos + 2 < self.write_pos {
            if self.feed[self.read_pos] == STUFFING_TABLE_ID {
                self.read_pos = self.write_pos;
                break;
            }
            let length_field = (((self.feed[self.read_pos + 1] & 0x0F) as usize) << 8)
                | self.feed[self.read_pos + 2] as usize;
            if length_field == 0 {
                break;
            }
            let section_len = 3 + length_field;
            if section_len > MAX_SECTION_SIZE || self.read_pos + section_len > self.write_pos {
                break;
            }
            self.section_len = section_len;
            if self.pusi_seen {
                self.feed_section();
            }
            self.read_pos += section_len;
            self.section_len = 0;
        }
    }

    fn feed_section(&mut self) {
        let section = &self.feed[self.read_pos..self.read_pos + self.section_len];
        if !self.matches(section) {
            return;
        }
        if self.queue.len() >= self.queue_limit {
            self.dropped += 1;
            return;
        }
        self.queue.push_back(Bytes::copy_from_slice(section));
    }
}
