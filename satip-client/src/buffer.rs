//! Bounded ring buffer for TS data.
//!
//! Single owner with explicit read/write cursors; shared users wrap it in a
//! mutex. Writes never block: bytes that do not fit are dropped and counted.

pub use satip_protocol::TS_PACKET_SIZE;

/// Fixed-capacity byte ring.
#[derive(Debug)]
pub struct TsRingBuffer {
    buffer: Box<[u8]>,
    read_pos: usize,
    len: usize,
    overflowed: u64,
}

impl TsRingBuffer {
    /// Create a ring holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity.max(TS_PACKET_SIZE)].into_boxed_slice(),
            read_pos: 0,
            len: 0,
            overflowed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes available for reading.
    pub fn available(&self) -> usize {
        self.len
    }

    /// Bytes that can be written without overflow.
    pub fn free_space(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes dropped by [`write`](Self::write) since creation or [`clear`](Self::clear).
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    /// Append as much of `data` as fits. Returns the number of bytes stored.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.free_space());
        self.overflowed += (data.len() - to_write) as u64;
        if to_write == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let write_pos = (self.read_pos + self.len) % capacity;
        let first_chunk = to_write.min(capacity - write_pos);
        self.buffer[write_pos..write_pos + first_chunk].copy_from_slice(&data[..first_chunk]);
        if first_chunk < to_write {
            let second_chunk = to_write - first_chunk;
            self.buffer[..second_chunk].copy_from_slice(&data[first_chunk..to_write]);
        }

        self.len += to_write;
        to_write
    }

    /// Byte at `offset` from the read position.
    pub fn peek(&self, offset: usize) -> Option<u8> {
        if offset >= self.len {
            return None;
        }
        Some(self.buffer[(self.read_pos + offset) % self.capacity()])
    }

    /// Copy up to `dest.len()` bytes without consuming them. Returns the count copied.
    pub fn read_into(&self, dest: &mut [u8]) -> usize {
        let to_read = dest.len().min(self.len);
        if to_read == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first_chunk = to_read.min(capacity - self.read_pos);
        dest[..first_chunk].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + first_chunk]);
        if first_chunk < to_read {
            let second_chunk = to_read - first_chunk;
            dest[first_chunk..to_read].copy_from_slice(&self.buffer[..second_chunk]);
        }
        to_read
    }

    /// Drop `count` bytes from the read position.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.len);
        self.read_pos = (self.read_pos + count) % self.capacity();
        self.len -= count;
        if self.len == 0 {
            self.read_pos = 0;
        }
    }

    /// Skip to the next sync byte. Returns the number of bytes skipped.
    pub fn skip_to_sync(&mut self) -> usize {
        let skipped = (0..self.len)
            .find(|&i| self.peek(i) == Some(satip_protocol::SYNC_BYTE))
            .unwrap_or(self.len);
        self.consume(skipped);
        skipped
    }

    /// Take one TS packet if the read position is sync aligned.
    ///
    /// Call [`skip_to_sync`](Self::skip_to_sync) first to resynchronize.
    pub fn read_packet(&mut self) -> Option<[u8; TS_PACKET_SIZE]> {
        if self.len < TS_PACKET_SIZE || self.peek(0) != Some(satip_protocol::SYNC_BYTE) {
            return None;
        }
        let mut packet = [0u8; TS_PACKET_SIZE];
        self.read_into(&mut packet);
        self.consume(TS_PACKET_SIZE);
        Some(packet)
    }

    /// Discard all data and reset the overflow counter.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.len = 0;
        self.overflowed = 0;
    }
}
