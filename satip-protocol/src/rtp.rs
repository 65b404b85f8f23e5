//! RTP depacketizer for TS-over-RTP media datagrams.
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! |                             SSRC                              |
//! |                       CSRC list (CC x 4)                      |
//! |   extension id (16)           |    extension length (16)      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  188-byte TS packets ...                      |
//! ```

use std::time::{Duration, Instant};

use log::{debug, error};

use crate::error::ProtocolError;
use crate::ts::{SYNC_BYTE, TS_PACKET_SIZE};

/// Fixed part of the RTP header.
pub const RTP_HEADER_SIZE: usize = 12;

/// Default interval between sequence error reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(300);

const RTP_VERSION: u8 = 2;

/// Decoded RTP header fields needed for depacketizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub extension: bool,
    pub csrc_count: u8,
    pub sequence: u16,
    /// Total header length including CSRC list and extension.
    pub header_len: usize,
}

impl RtpHeader {
    /// Parse and validate the header of `datagram`.
    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < RTP_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: RTP_HEADER_SIZE,
                actual: datagram.len(),
            });
        }
        let version = (datagram[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(ProtocolError::InvalidRtpVersion(version));
        }
        let extension = datagram[0] & 0x10 != 0;
        let csrc_count = datagram[0] & 0x0F;
        let sequence = u16::from_be_bytes([datagram[2], datagram[3]]);

        let mut header_len = (3 + csrc_count as usize) * 4;
        if extension {
            if datagram.len() < header_len + 4 {
                return Err(ProtocolError::Truncated {
                    expected: header_len + 4,
                    actual: datagram.len(),
                });
            }
            let ext_len =
                u16::from_be_bytes([datagram[header_len + 2], datagram[header_len + 3]]) as usize;
            header_len += (ext_len + 1) * 4;
        }
        if datagram.len() < header_len {
            return Err(ProtocolError::Truncated {
                expected: header_len,
                actual: datagram.len(),
            });
        }

        Ok(Self {
            version,
            extension,
            csrc_count,
            sequence,
            header_len,
        })
    }
}

/// Strips RTP headers and tracks sequence continuity for one media stream.
#[derive(Debug)]
pub struct RtpDepacketizer {
    last_sequence: Option<u16>,
    error_count: u64,
    unreported: u64,
    last_report: Instant,
    report_interval: Duration,
    label: String,
}

impl RtpDepacketizer {
    /// Create a depacketizer; `label` prefixes its log lines.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_report_interval(label, DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_report_interval(label: impl Into<String>, report_interval: Duration) -> Self {
        Self {
            last_sequence: None,
            error_count: 0,
            unreported: 0,
            last_report: Instant::now(),
            report_interval,
            label: label.into(),
        }
    }

    /// Forget sequence state and counters (new session).
    pub fn reset(&mut self) {
        self.last_sequence = None;
        self.error_count = 0;
        self.unreported = 0;
        self.last_report = Instant::now();
    }

    /// Sequence gaps seen since the last reset.
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn last_sequence(&self) -> Option<u16> {
        self.last_sequence
    }

    /// Return the TS payload of `datagram`, or `None` if it must be dropped.
    ///
    /// A datagram starting with the sync byte is passed through as raw TS.
    pub fn depacketize<'a>(&mut self, datagram: &'a [u8]) -> Option<&'a [u8]> {
        if datagram.is_empty() {
            return None;
        }
        if datagram[0] == SYNC_BYTE {
            return Some(datagram);
        }

        let header = match RtpHeader::parse(datagram) {
            Ok(header) => header,
            Err(e) => {
                debug!("[{}] dropping datagram: {}", self.label, e);
                return None;
            }
        };
        let payload = &datagram[header.header_len..];
        if payload.is_empty() {
            return None;
        }
        if payload.len() % TS_PACKET_SIZE != 0 {
            debug!(
                "[{}] dropping datagram: {}",
                self.label,
                ProtocolError::UnalignedPayload(payload.len())
            );
            return None;
        }
        if payload[0] != SYNC_BYTE {
            debug!(
                "[{}] dropping datagram: {}",
                self.label,
                ProtocolError::BadSyncByte(payload[0])
            );
            return None;
        }

        self.track_sequence(header.sequence);
        Some(payload)
    }

    fn track_sequence(&mut self, sequence: u16) {
        if let Some(last) = self.last_sequence {
            if last.wrapping_add(1) != sequence {
                self.error_count += 1;
                self.unreported += 1;
                if self.last_report.elapsed() >= self.report_interval {
                    error!(
                        "[{}] detected {} RTP packet error(s) in the last {}s",
                        self.label,
                        self.unreported,
                        self.report_interval.as_secs()
                    );
                    self.unreported = 0;
                    self.last_report = Instant::now();
                }
            }
        }
        self.last_sequence = Some(sequence);
    }
}
