//! Wire formats for the SAT>IP tuner client.
//!
//! This crate is free of I/O. It turns datagrams and byte streams received
//! from a SAT>IP server into typed values and back:
//!
//! - [`rtp`]: strips RTP headers from TS media datagrams and tracks sequence loss
//! - [`rtcp`]: finds the `SES1` vendor record in RTCP compound packets
//! - [`reception`]: decodes the `tuner=` signal fields of a parameter string
//! - [`rtsp`]: encodes control requests and incrementally decodes responses
//! - [`ts`]: MPEG-TS header helpers shared by the demultiplexer
//!
//! # Example
//!
//! ```rust
//! use satip_protocol::{RtpDepacketizer, RtcpSignalParser};
//!
//! let mut rtp = RtpDepacketizer::new("device 0");
//! let mut datagram = vec![0x80, 33, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0];
//! let mut packet = [0xFFu8; 188];
//! packet[0] = 0x47;
//! datagram.extend_from_slice(&packet);
//! assert_eq!(rtp.depacketize(&datagram).map(<[u8]>::len), Some(188));
//!
//! assert!(RtcpSignalParser::parse(&[0x80, 201, 0, 1, 0, 0, 0, 0]).is_none());
//! ```

pub mod error;
pub mod reception;
pub mod rtcp;
pub mod rtp;
pub mod rtsp;
pub mod ts;
pub mod types;

pub use error::ProtocolError;
pub use reception::{parse_reception_params, ReceptionStatus};
pub use rtcp::RtcpSignalParser;
pub use rtp::{RtpDepacketizer, RtpHeader};
pub use rtsp::{
    base_url, decode_response, unescape, ErrorHint, RtspMethod, RtspRequest, RtspResponse,
    SessionHeader, Transport,
};
pub use ts::{SYNC_BYTE, TS_PACKET_SIZE};
pub use types::{parse_model, DeliverySystem, ServerQuirks};
