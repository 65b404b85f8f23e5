//! Tuner session handling.
//!
//! This module provides:
//! - [`TunerController`]: session state machine and media reception of one tuner
//! - [`RtspControlClient`]: request/response exchanges on the control connection
//! - [`RtpSocketPair`]: even RTP port plus the following RTCP port
//! - [`session`]: pid bookkeeping and queued state requests

pub mod controller;
mod data_pump;
pub mod rtsp;
pub mod session;
pub mod socket;

pub use controller::{TunerController, TunerError};
pub use rtsp::{RtspControlClient, RtspError, SetupReply};
pub use session::{PidType, TunerState};
pub use socket::RtpSocketPair;
