//! Section filter handler for one tuner.
//!
//! Raw TS data written by the tuner path lands in a bounded ring. A pump task
//! takes packets out of the ring, feeds them to every open filter and hands
//! matched sections to the filters' delivery channels. Delivery is
//! best-effort: a consumer that does not keep up only delays its own filter.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use satip_protocol::ts::MAX_PID;

use crate::buffer::TsRingBuffer;
use crate::config::SectionFilterConfig;
use crate::metrics::Meter;
use crate::section::filter::{SectionFilterEngine, SectionFilterParams};
use crate::section::table::{self, KNOWN_FILTERS};

/// Filter slots per tuner.
pub const MAX_FILTERS: usize = 32;

/// Packets processed between two delivery rounds.
const PACKETS_PER_ROUND: usize = 32;

/// Wait for new input when nothing is pending.
const IDLE_WAIT: Duration = Duration::from_millis(100);

const OVERFLOW_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Longest time new input is held back for a delivery that makes no progress.
const MAX_DELIVERY_STALL: Duration = Duration::from_millis(200);

/// Errors returned by [`SectionFilterHandler::open`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The pid/tid/mask triple is disabled by configuration.
    #[error("Filter {description} (pid 0x{pid:04X} tid 0x{tid:02X} mask 0x{mask:02X}) is blacklisted")]
    Blacklisted {
        description: &'static str,
        pid: u16,
        tid: u8,
        mask: u8,
    },

    /// All filter slots are in use.
    #[error("No free section filter slot")]
    NoFreeSlot,

    /// Pid outside the 13-bit range.
    #[error("Invalid pid: 0x{0:04X}")]
    InvalidPid(u16),
}

/// Caller-visible identifier of one open filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterHandle(u32);

impl fmt::Display for FilterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read side of an open filter; matched sections arrive in FIFO order.
#[derive(Debug)]
pub struct SectionReceiver {
    handle: FilterHandle,
    rx: mpsc::Receiver<Bytes>,
}

impl SectionReceiver {
    pub fn handle(&self) -> FilterHandle {
        self.handle
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

struct FilterSlot {
    handle: FilterHandle,
    engine: SectionFilterEngine,
    tx: mpsc::Sender<Bytes>,
    meter: Meter,
}

/// Outcome of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Delivery {
    sent: usize,
    pending: bool,
}

impl FilterSlot {
    /// Push queued sections into the channel.
    fn deliver(&mut self) -> Delivery {
        let mut sent = 0;
        while let Some(section) = self.engine.front() {
            match self.tx.try_send(section.clone()) {
                Ok(()) => {
                    self.meter.add(section.len(), 1);
                    self.engine.pop();
                    sent += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    return Delivery { sent, pending: true }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.engine.clear_queue();
                    break;
                }
            }
        }
        Delivery { sent, pending: false }
    }
}

struct HandlerInner {
    device_index: usize,
    ring: Mutex<TsRingBuffer>,
    slots: Mutex<Vec<Option<FilterSlot>>>,
    input: Notify,
    disabled: Vec<usize>,
    delivery_capacity: usize,
    next_handle: AtomicU32,
    resync_bytes: AtomicU64,
    last_overflow_report: Mutex<Option<Instant>>,
}

impl HandlerInner {
    /// One delivery pass over all filters.
    fn deliver(&self) -> Delivery {
        let mut slots = self.slots.lock();
        let mut total = Delivery::default();
        for slot in slots.iter_mut().flatten() {
            let delivery = slot.deliver();
            total.sent += delivery.sent;
            total.pending |= delivery.pending;
        }
        total
    }

    /// Take up to `max` packets from the ring and feed them to the filters.
    fn process(&self, max: usize) -> usize {
        let mut processed = 0;
        while processed < max {
            let packet = {
                let mut ring = self.ring.lock();
                let skipped = match ring.peek(0) {
                    Some(satip_protocol::SYNC_BYTE) | None => 0,
                    Some(_) => ring.skip_to_sync(),
                };
                if skipped > 0 {
                    self.resync_bytes.fetch_add(skipped as u64, Ordering::Relaxed);
                    debug!(
                        "[device {}] section pump skipped {} bytes to resync",
                        self.device_index, skipped
                    );
                }
                match ring.read_packet() {
                    Some(packet) => packet,
                    None => break,
                }
            };

            let mut slots = self.slots.lock();
            for slot in slots.iter_mut().flatten() {
                slot.engine.process(&packet);
            }
            processed += 1;
        }
        processed
    }

    fn report_overflow(&self, dropped: usize) {
        let mut last = self.last_overflow_report.lock();
        if last.map_or(true, |t| t.elapsed() >= OVERFLOW_REPORT_INTERVAL) {
            warn!(
                "[device {}] section buffer overflow, dropped {} bytes",
                self.device_index, dropped
            );
            *last = Some(Instant::now());
        }
    }
}

/// Owner of the filter slots and the pump of one tuner.
pub struct SectionFilterHandler {
    inner: Arc<HandlerInner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl SectionFilterHandler {
    /// Create the handler and start its pump. Must be called inside a tokio runtime.
    pub fn new(device_index: usize, config: &SectionFilterConfig) -> Self {
        let disabled: Vec<usize> = config
            .disabled_filters
            .iter()
            .copied()
            .filter(|&i| i < KNOWN_FILTERS.len())
            .collect();
        for &i in &disabled {
            info!(
                "[device {}] section filter {} disabled",
                device_index, KNOWN_FILTERS[i].description
            );
        }

        let inner = Arc::new(HandlerInner {
            device_index,
            ring: Mutex::new(TsRingBuffer::new(config.buffer_size)),
            slots: Mutex::new((0..MAX_FILTERS).map(|_| None).collect()),
            input: Notify::new(),
            disabled,
            delivery_capacity: config.delivery_capacity.max(1),
            next_handle: AtomicU32::new(1),
            resync_bytes: AtomicU64::new(0),
            last_overflow_report: Mutex::new(None),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(
            Arc::clone(&inner),
            cancel.clone(),
            config.send_retry(),
        ));

        Self {
            inner,
            cancel,
            task: Mutex::new(Some(task)),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    /// Open a filter for sections of `pid` whose table id matches `tid` under `mask`.
    pub fn open(&self, pid: u16, tid: u8, mask: u8) -> Result<SectionReceiver, FilterError> {
        if pid > MAX_PID {
            return Err(FilterError::InvalidPid(pid));
        }
        if let Some(index) = table::find(pid, tid, mask) {
            if self.inner.disabled.contains(&index) {
                let known = &KNOWN_FILTERS[index];
                debug!(
                    "[device {}] refusing blacklisted filter {}",
                    self.inner.device_index, known.description
                );
                return Err(FilterError::Blacklisted {
                    description: known.description,
                    pid,
                    tid,
                    mask,
                });
            }
        }

        let mut slots = self.inner.slots.lock();
        let free = slots
            .iter()
            .position(Option::is_none)
            .ok_or(FilterError::NoFreeSlot)?;

        let (tx, rx) = mpsc::channel(self.inner.delivery_capacity);
        let handle = FilterHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        slots[free] = Some(FilterSlot {
            handle,
            engine: SectionFilterEngine::new(SectionFilterParams::new(pid, tid, mask)),
            tx,
            meter: Meter::new(),
        });
        debug!(
            "[device {}] opened section filter {} in slot {}: pid 0x{:04X} tid 0x{:02X} mask 0x{:02X}",
            self.inner.device_index, handle, free, pid, tid, mask
        );

        Ok(SectionReceiver { handle, rx })
    }

    /// Close the filter. Returns false if the handle is unknown.
    pub fn close(&self, handle: FilterHandle) -> bool {
        let mut slots = self.inner.slots.lock();
        for slot in slots.iter_mut() {
            if slot.as_ref().map_or(false, |s| s.handle == handle) {
                *slot = None;
                debug!(
                    "[device {}] closed section filter {}",
                    self.inner.device_index, handle
                );
                return true;
            }
        }
        false
    }

    /// Append raw TS data for the pump. Returns the number of bytes stored.
    pub fn write(&self, data: &[u8]) -> usize {
        let written = self.inner.ring.lock().write(data);
        if written < data.len() {
            self.inner.report_overflow(data.len() - written);
        }
        if written > 0 {
            self.inner.input.notify_one();
        }
        written
    }

    pub fn get_pid(&self, handle: FilterHandle) -> Option<u16> {
        self.with_slot(handle, |slot| slot.engine.pid())
    }

    /// True if any open filter listens on `pid`.
    pub fn exists(&self, pid: u16) -> bool {
        self.inner
            .slots
            .lock()
            .iter()
            .flatten()
            .any(|slot| slot.engine.pid() == pid)
    }

    /// True if the filter has no partial section buffered.
    pub fn is_idle(&self, handle: FilterHandle) -> Option<bool> {
        self.with_slot(handle, |slot| slot.engine.is_idle())
    }

    /// Sections dropped because the filter's queue was full.
    pub fn dropped(&self, handle: FilterHandle) -> Option<u64> {
        self.with_slot(handle, |slot| slot.engine.dropped())
    }

    pub fn filter_count(&self) -> usize {
        self.inner.slots.lock().iter().flatten().count()
    }

    /// Bytes dropped because the ring was full.
    pub fn overflow_count(&self) -> u64 {
        self.inner.ring.lock().overflowed()
    }

    /// Bytes skipped while resynchronizing on the sync byte.
    pub fn resync_count(&self) -> u64 {
        self.inner.resync_bytes.load(Ordering::Relaxed)
    }

    /// One line per open filter (at most ten) with section statistics.
    pub fn information(&self) -> String {
        let mut out = String::new();
        let mut slots = self.inner.slots.lock();
        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(slot) = slot.as_mut() else { continue };
            let params = slot.engine.params();
            let _ = writeln!(
                out,
                "#{:<2} Handle: {:<4} Pid: 0x{:04X} ({}) Tid: 0x{:02X} Mask: 0x{:02X} Sections: {} Dropped: {}",
                index,
                slot.handle,
                params.pid,
                table::tag(params.pid, params.tid()),
                params.tid(),
                params.table_mask(),
                slot.meter.take(),
                slot.engine.dropped()
            );
            if out.lines().count() >= 10 {
                break;
            }
        }
        if out.is_empty() {
            out.push_str("no active filters\n");
        }
        out
    }

    /// Stop the pump, waiting up to the configured grace period.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.shutdown_grace, &mut task)
                .await
                .is_err()
            {
                warn!(
                    "[device {}] section pump did not stop in time, aborting",
                    self.inner.device_index
                );
                task.abort();
            }
        }
    }

    fn with_slot<T>(&self, handle: FilterHandle, f: impl FnOnce(&FilterSlot) -> T) -> Option<T> {
        self.inner
            .slots
            .lock()
            .iter()
            .flatten()
            .find(|slot| slot.handle == handle)
            .map(f)
    }
}

impl Drop for SectionFilterHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump(inner: Arc<HandlerInner>, cancel: CancellationToken, send_retry: Duration) {
    debug!("[device {}] section pump started", inner.device_index);
    let mut last_progress = Instant::now();
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut delivery = inner.deliver();
        if delivery.pending {
            tokio::task::yield_now().await;
            let retry = inner.deliver();
            delivery.sent += retry.sent;
            delivery.pending = retry.pending;
        }
        if delivery.sent > 0 || !delivery.pending {
            last_progress = Instant::now();
        }
        let pending = delivery.pending;

        // Pending sections go out before new input, unless their consumer stalled.
        if pending && last_progress.elapsed() < MAX_DELIVERY_STALL {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(send_retry) => {}
            }
            continue;
        }

        let processed = inner.process(PACKETS_PER_ROUND);
        trace!(
            "[device {}] section pump processed {} packets",
            inner.device_index,
            processed
        );
        if processed == 0 {
            let wait = if pending { send_retry } else { IDLE_WAIT };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.input.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        } else {
            tokio::task::yield_now().await;
        }
    }
    debug!("[device {}] section pump stopped", inner.device_index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::filter::tests::{packetize, section};

    fn handler_with(disabled: Vec<usize>, buffer_size: usize) -> SectionFilterHandler {
        let config = SectionFilterConfig {
            buffer_size,
            disabled_filters: disabled,
            ..Default::default()
        };
        SectionFilterHandler::new(0, &config)
    }

    fn handler() -> SectionFilterHandler {
        handler_with(Vec::new(), 188 * 1000)
    }

    async fn recv(rx: &mut SectionReceiver) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_end_to_end_sdt() {
        let handler = handler();
        let mut rx = handler.open(0x11, 0x42, 0xFF).unwrap();
        let sec = section(0x42, 40);
        for pkt in packetize(0x11, &sec, 1) {
            handler.write(&pkt);
        }

        let received = recv(&mut rx).await.unwrap();
        assert_eq!(received.len(), 40);
        assert_eq!(&received[..], &sec[..]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_none());
        assert_eq!(handler.is_idle(rx.handle()), Some(true));
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_fan_out_to_same_triple() {
        let handler = handler();
        let mut first = handler.open(0x00, 0x00, 0xFF).unwrap();
        let mut second = handler.open(0x00, 0x00, 0xFF).unwrap();
        assert_ne!(first.handle(), second.handle());

        for pkt in packetize(0x00, &section(0x00, 16), 1) {
            handler.write(&pkt);
        }
        assert_eq!(recv(&mut first).await.unwrap().len(), 16);
        assert_eq!(recv(&mut second).await.unwrap().len(), 16);
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_resync_on_garbage() {
        let handler = handler();
        let mut rx = handler.open(0x11, 0x42, 0xFF).unwrap();
        handler.write(&[0x00, 0x01, 0x02, 0x03]);
        for pkt in packetize(0x11, &section(0x42, 40), 1) {
            handler.write(&pkt);
        }
        assert_eq!(recv(&mut rx).await.unwrap().len(), 40);
        assert_eq!(handler.resync_count(), 4);
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_blacklisted_filter() {
        let handler = handler_with(vec![6], 188 * 100);
        assert!(matches!(
            handler.open(0x14, 0x70, 0xFF),
            Err(FilterError::Blacklisted { pid: 0x14, .. })
        ));
        assert!(handler.open(0x14, 0x73, 0xFF).is_ok());
        assert!(handler.open(0x00, 0x00, 0xFF).is_ok());
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_slot_exhaustion() {
        let handler = handler();
        let mut receivers = Vec::new();
        for _ in 0..MAX_FILTERS {
            receivers.push(handler.open(0x12, 0x4E, 0xFE).unwrap());
        }
        assert_eq!(handler.open(0x12, 0x4E, 0xFE).unwrap_err(), FilterError::NoFreeSlot);

        let handle = receivers[5].handle();
        assert!(handler.close(handle));
        assert!(!handler.close(handle));
        assert!(handler.open(0x10, 0x40, 0xFF).is_ok());
        assert_eq!(handler.filter_count(), MAX_FILTERS);
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_lookup() {
        let handler = handler();
        let rx = handler.open(0x12, 0x50, 0xF0).unwrap();
        assert_eq!(handler.get_pid(rx.handle()), Some(0x12));
        assert!(handler.exists(0x12));
        assert!(!handler.exists(0x11));
        assert!(handler.information().contains("Pid: 0x0012 (EIT)"));
        assert!(matches!(
            handler.open(0x2000, 0, 0),
            Err(FilterError::InvalidPid(0x2000))
        ));

        handler.close(rx.handle());
        assert_eq!(handler.get_pid(rx.handle()), None);
        assert_eq!(handler.information(), "no active filters\n");
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_is_reported() {
        let handler = handler_with(Vec::new(), 188 * 2);
        let data = vec![0x47u8; 188 * 10];
        let written = handler.write(&data);
        assert!(written <= 188 * 2);
        assert!(handler.overflow_count() >= (188 * 8) as u64);
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_consumer_loses_nothing() {
        let config = SectionFilterConfig {
            delivery_capacity: 1,
            ..Default::default()
        };
        let handler = SectionFilterHandler::new(0, &config);
        let mut rx = handler.open(0x12, 0x4E, 0xFF).unwrap();

        let count = crate::section::filter::MAX_QUEUED_SECTIONS + 36;
        let mut eit = Vec::new();
        for _ in 0..count {
            eit.extend(section(0x4E, 100));
        }
        for pkt in packetize(0x12, &eit, 1) {
            handler.write(&pkt);
        }

        for _ in 0..count {
            assert_eq!(recv(&mut rx).await.unwrap().len(), 100);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(handler.dropped(rx.handle()), Some(0));
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_block_others() {
        let config = SectionFilterConfig {
            delivery_capacity: 1,
            ..Default::default()
        };
        let handler = SectionFilterHandler::new(0, &config);
        let _stalled = handler.open(0x12, 0x4E, 0xFF).unwrap();
        let mut active = handler.open(0x11, 0x42, 0xFF).unwrap();

        let mut eit = Vec::new();
        for _ in 0..8 {
            eit.extend(section(0x4E, 100));
        }
        for pkt in packetize(0x12, &eit, 1) {
            handler.write(&pkt);
        }
        for pkt in packetize(0x11, &section(0x42, 40), 1) {
            handler.write(&pkt);
        }

        assert_eq!(recv(&mut active).await.unwrap().len(), 40);
        handler.shutdown().await;
    }
}
