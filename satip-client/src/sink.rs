//! Interface between the tuner data path and the host device.

/// Receives the TS data of one tuner.
///
/// Implementations must not block: `write_data` is called from the tuner's
/// receive path.
pub trait DeviceSink: Send + Sync {
    /// Push TS bytes; data that does not fit is the sink's to drop and count.
    fn write_data(&self, data: &[u8]);

    /// Bytes the sink can accept right now.
    fn check_data(&self) -> usize;

    /// True when nobody consumes the stream; a locked tuner is released
    /// after two consecutive idle checks.
    fn is_idle(&self) -> bool {
        false
    }
}
