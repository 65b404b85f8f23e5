//! Error types for the SAT>IP wire formats.

use thiserror::Error;

/// Errors raised while decoding media or control-channel data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Datagram shorter than the header it claims to carry.
    #[error("Truncated packet: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// RTP version field is not 2.
    #[error("Unsupported RTP version: {0}")]
    InvalidRtpVersion(u8),

    /// RTP payload is not a whole number of TS packets.
    #[error("Payload length {0} is not a multiple of the TS packet size")]
    UnalignedPayload(usize),

    /// First payload byte is not the TS sync byte.
    #[error("Bad TS sync byte: 0x{0:02X}")]
    BadSyncByte(u8),

    /// RTSP status line could not be parsed.
    #[error("Malformed status line: {0}")]
    MalformedStatusLine(String),

    /// RTSP header line could not be parsed.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// RTSP response header block grew past the accepted size.
    #[error("Response header too large: {0} bytes (max: {1})")]
    HeaderTooLarge(usize, usize),

    /// Response body length header is not a number.
    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    /// Response body length above the accepted size.
    #[error("Response body too large: {0} bytes (max: {1})")]
    BodyTooLarge(usize, usize),
}
