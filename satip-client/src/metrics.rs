//! Throughput metering.
//!
//! [`Meter`] is a plain value embedded in the components that move data:
//! the tuner (received TS bytes), each section filter (delivered sections)
//! and the device (overflowed bytes). Readers call [`Meter::take`] to get the
//! counts for the elapsed window and start a new one.

use std::fmt;
use std::time::{Duration, Instant};

/// Byte and call counter over a time window.
#[derive(Debug, Clone)]
pub struct Meter {
    bytes: u64,
    calls: u64,
    since: Instant,
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

impl Meter {
    pub fn new() -> Self {
        Self {
            bytes: 0,
            calls: 0,
            since: Instant::now(),
        }
    }

    pub fn add(&mut self, bytes: usize, calls: u64) {
        self.bytes += bytes as u64;
        self.calls += calls;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Counts since the window started, without resetting.
    pub fn peek(&self) -> MeterReading {
        MeterReading {
            bytes: self.bytes,
            calls: self.calls,
            elapsed: self.since.elapsed(),
        }
    }

    /// Counts for the finished window; a new window starts now.
    pub fn take(&mut self) -> MeterReading {
        let reading = self.peek();
        self.bytes = 0;
        self.calls = 0;
        self.since = Instant::now();
        reading
    }
}

/// Snapshot of one [`Meter`] window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterReading {
    pub bytes: u64,
    pub calls: u64,
    pub elapsed: Duration,
}

impl MeterReading {
    pub fn kbit_per_sec(&self) -> u64 {
        let millis = self.elapsed.as_millis() as u64;
        if millis == 0 {
            return 0;
        }
        self.bytes * 8 / millis
    }
}

impl fmt::Display for MeterReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4} ({:>5} kbit/s)", self.calls, self.kbit_per_sec())
    }
}
