//! SAT>IP tuner client.
//!
//! This crate provides:
//! - [`tuner`]: RTSP session control and RTP/RTCP reception for one tuner
//! - [`section`]: TS section filtering with per-filter delivery channels
//! - [`device`]: glue tying a tuner, its TS ring and its section filters together
//! - [`server`]: upstream server bookkeeping
//! - [`config`] / [`logging`]: configuration file and log setup for the binary

pub mod buffer;
pub mod config;
pub mod context;
pub mod device;
pub mod logging;
pub mod metrics;
pub mod section;
pub mod server;
pub mod sink;
pub mod tuner;

pub use config::ClientConfig;
pub use context::SatipContext;
pub use device::{DeviceError, InformationPage, TunerDevice};
pub use sink::DeviceSink;
