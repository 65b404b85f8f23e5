//! TS section demultiplexing.
//!
//! - [`SectionFilterEngine`]: reassembles and matches the sections of one pid
//! - [`SectionFilterHandler`]: owns up to 32 filters of a tuner and their pump
//! - [`table`]: well-known SI tables that can be disabled by configuration

pub mod filter;
pub mod handler;
pub mod table;

pub use filter::{SectionFilterEngine, SectionFilterParams};
pub use handler::{FilterError, FilterHandle, SectionFilterHandler, SectionReceiver, MAX_FILTERS};
