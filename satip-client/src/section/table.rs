//! Well-known DVB SI tables that operators may disable.

/// One pid/tid/mask combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownFilter {
    pub description: &'static str,
    pub tag: &'static str,
    pub pid: u16,
    pub tid: u8,
    pub mask: u8,
}

pub const KNOWN_FILTERS: [KnownFilter; 7] = [
    KnownFilter { description: "PAT (0x00)", tag: "PAT", pid: 0x00, tid: 0x00, mask: 0xFF },
    KnownFilter { description: "NIT (0x40)", tag: "NIT", pid: 0x10, tid: 0x40, mask: 0xFF },
    KnownFilter { description: "SDT (0x42)", tag: "SDT", pid: 0x11, tid: 0x42, mask: 0xFF },
    KnownFilter { description: "EIT (0x4E/4F)", tag: "EIT", pid: 0x12, tid: 0x4E, mask: 0xFE },
    KnownFilter { description: "EIT (0x5X)", tag: "EIT", pid: 0x12, tid: 0x50, mask: 0xF0 },
    KnownFilter { description: "EIT (0x6X)", tag: "EIT", pid: 0x12, tid: 0x60, mask: 0xF0 },
    KnownFilter { description: "TDT (0x70)", tag: "TDT", pid: 0x14, tid: 0x70, mask: 0xFF },
];

/// Index of the table entry equal to the triple.
pub fn find(pid: u16, tid: u8, mask: u8) -> Option<usize> {
    KNOWN_FILTERS
        .iter()
        .position(|f| f.pid == pid && f.tid == tid && f.mask == mask)
}

/// Short tag for a pid/tid pair, `"---"` when unknown.
pub fn tag(pid: u16, tid: u8) -> &'static str {
    KNOWN_FILTERS
        .iter()
        .find(|f| f.pid == pid && f.tid == tid & f.mask)
        .map_or("---", |f| f.tag)
}
