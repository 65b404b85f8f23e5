//! RTCP compound packet scanner for the SAT>IP vendor application record.
//!
//! ```text
//! +---+-+---------+--------+-----------------+
//! |V=2|P| subtype | PT=204 |  length (words) |
//! +---+-+---------+--------+-----------------+
//! |                  SSRC                    |
//! +------------------------------------------+
//! |             name "SES1"                  |
//! +--------------------+---------------------+
//! |  identifier (16)   |  string length (16) |
//! +--------------------+---------------------+
//! |  ver=1.0;src=1;tuner=...;pids=...        |
//! +------------------------------------------+
//! ```

use crate::reception::{parse_reception_params, ReceptionStatus};

/// Application-defined payload type.
pub const RTCP_PT_APP: u8 = 204;

/// Name tag of the vendor record.
pub const SES1_NAME: &[u8; 4] = b"SES1";

const RTCP_HEADER_SIZE: usize = 4;
const RTCP_VERSION: u8 = 2;
const APP_STRING_OFFSET: usize = 16;

/// Extracts vendor application payloads from RTCP datagrams.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcpSignalParser;

impl RtcpSignalParser {
    /// Return the parameter string of the first vendor record in `datagram`.
    pub fn application_payload(datagram: &[u8]) -> Option<&[u8]> {
        let mut offset = 0;
        while datagram.len() - offset >= RTCP_HEADER_SIZE {
            let record = &datagram[offset..];
            let words = u16::from_be_bytes([record[2], record[3]]) as usize;
            let record_len = (words + 1) * 4;
            if record_len > record.len() {
                break;
            }
            if record[0] >> 6 == RTCP_VERSION && record[1] == RTCP_PT_APP {
                if let Some(payload) = Self::vendor_string(&record[..record_len]) {
                    return Some(payload);
                }
            }
            offset += record_len;
        }
        None
    }

    /// Decode the reception status carried by `datagram`, if any.
    pub fn parse(datagram: &[u8]) -> Option<ReceptionStatus> {
        let payload = Self::application_payload(datagram)?;
        let params = std::str::from_utf8(payload).ok()?;
        parse_reception_params(params)
    }

    fn vendor_string(record: &[u8]) -> Option<&[u8]> {
        if record.len() < APP_STRING_OFFSET || &record[8..12] != SES1_NAME {
            return None;
        }
        let string_len = u16::from_be_bytes([record[14], record[15]]) as usize;
        record.get(APP_STRING_OFFSET..APP_STRING_OFFSET + string_len)
    }
}
