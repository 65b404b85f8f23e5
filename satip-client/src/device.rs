//! Host device glue.
//!
//! A [`TunerDevice`] wires one tuner controller, one section filter handler
//! and a bounded TS ring together. It is the tuner's [`DeviceSink`]: received
//! TS data goes to the ring (while the DVR is open) and to the section
//! handler.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::buffer::{TsRingBuffer, TS_PACKET_SIZE};
use crate::context::SatipContext;
use crate::metrics::Meter;
use crate::section::{FilterError, FilterHandle, SectionFilterHandler, SectionReceiver};
use crate::server::supports_params;
use crate::sink::DeviceSink;
use crate::tuner::{PidType, TunerController, TunerError};

/// Packets handed out by one [`TunerDevice::read_ts`] call at most.
const MAX_PACKETS_PER_READ: usize = 348;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No server can tune {0}")]
    NoServer(String),

    #[error(transparent)]
    Tuner(#[from] TunerError),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Pages of [`TunerDevice::information`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformationPage {
    General,
    Pids,
    Filters,
    Bits,
}

impl fmt::Display for InformationPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InformationPage::General => "General",
            InformationPage::Pids => "Pids",
            InformationPage::Filters => "Filters",
            InformationPage::Bits => "Bits",
        };
        f.write_str(name)
    }
}

struct DeviceSinkImpl {
    index: usize,
    ring: Mutex<TsRingBuffer>,
    sections: SectionFilterHandler,
    dvr_open: AtomicBool,
    overflow: Mutex<Meter>,
    resync_bytes: AtomicU64,
    data_ready: Notify,
}

impl DeviceSink for DeviceSinkImpl {
    fn write_data(&self, data: &[u8]) {
        if self.dvr_open.load(Ordering::Acquire) {
            let written = self.ring.lock().write(data);
            if written < data.len() {
                self.overflow.lock().add(data.len() - written, 1);
            }
            if written > 0 {
                self.data_ready.notify_one();
            }
        }
        self.sections.write(data);
    }

    fn check_data(&self) -> usize {
        self.ring.lock().free_space()
    }

    fn is_idle(&self) -> bool {
        !self.dvr_open.load(Ordering::Acquire) && self.sections.filter_count() == 0
    }
}

/// One tuner as seen by the host.
pub struct TunerDevice {
    index: usize,
    context: Arc<SatipContext>,
    sink: Arc<DeviceSinkImpl>,
    tuner: TunerController,
}

impl TunerDevice {
    pub async fn new(index: usize, context: Arc<SatipContext>) -> Result<Self, DeviceError> {
        let config = context.config();
        let sink = Arc::new(DeviceSinkImpl {
            index,
            ring: Mutex::new(TsRingBuffer::new(config.tuner.ts_buffer_size)),
            sections: SectionFilterHandler::new(index, &config.section_filter),
            dvr_open: AtomicBool::new(false),
            overflow: Mutex::new(Meter::new()),
            resync_bytes: AtomicU64::new(0),
            data_ready: Notify::new(),
        });
        let tuner =
            TunerController::start(index, Arc::clone(&context), sink.clone() as Arc<dyn DeviceSink>)
                .await?;
        info!("[device {}] created", index);
        Ok(Self {
            index,
            context,
            sink,
            tuner,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tuner(&self) -> &TunerController {
        &self.tuner
    }

    /// Tune to `params` on the first suitable server.
    pub fn set_channel(&self, params: &str) -> Result<(), DeviceError> {
        let server = self
            .context
            .servers()
            .get_server(&supports_params(params))
            .ok_or_else(|| DeviceError::NoServer(params.to_string()))?;
        debug!("[device {}] channel {} on {}", self.index, params, server);
        self.tuner.set_source(Some(server), params, self.index as i32);
        Ok(())
    }

    /// Release the tuner.
    pub fn release(&self) {
        self.tuner.set_source(None, "", self.index as i32);
    }

    pub fn set_pid(&self, pid: u16, kind: PidType, on: bool) -> bool {
        self.tuner.set_pid(pid, kind, on)
    }

    /// Open a section filter and request its pid from the server.
    pub fn open_filter(&self, pid: u16, tid: u8, mask: u8) -> Result<SectionReceiver, DeviceError> {
        let receiver = self.sink.sections.open(pid, tid, mask)?;
        self.tuner.set_pid(pid, PidType::Section, true);
        Ok(receiver)
    }

    /// Close a section filter; its pid is dropped once no filter uses it.
    pub fn close_filter(&self, handle: FilterHandle) -> bool {
        let pid = self.sink.sections.get_pid(handle);
        if !self.sink.sections.close(handle) {
            return false;
        }
        if let Some(pid) = pid {
            if !self.sink.sections.exists(pid) {
                self.tuner.set_pid(pid, PidType::Section, false);
            }
        }
        true
    }

    pub fn open_dvr(&self) -> bool {
        self.sink.ring.lock().clear();
        self.sink.dvr_open.store(true, Ordering::Release);
        debug!("[device {}] DVR opened", self.index);
        true
    }

    pub fn close_dvr(&self) {
        self.sink.dvr_open.store(false, Ordering::Release);
        self.sink.ring.lock().clear();
        self.sink.data_ready.notify_one();
        debug!("[device {}] DVR closed", self.index);
    }

    pub fn is_dvr_open(&self) -> bool {
        self.sink.dvr_open.load(Ordering::Acquire)
    }

    /// Append whole, sync-aligned TS packets to `out`, waiting up to
    /// `timeout` for data. Returns the number of bytes appended.
    pub async fn read_ts(&self, out: &mut Vec<u8>, timeout: Duration) -> usize {
        let appended = self.take_packets(out);
        if appended > 0 || !self.is_dvr_open() {
            return appended;
        }
        if tokio::time::timeout(timeout, self.sink.data_ready.notified())
            .await
            .is_err()
        {
            return 0;
        }
        self.take_packets(out)
    }

    fn take_packets(&self, out: &mut Vec<u8>) -> usize {
        let mut ring = self.sink.ring.lock();
        let mut appended = 0;
        while appended < MAX_PACKETS_PER_READ * TS_PACKET_SIZE {
            let skipped = ring.skip_to_sync();
            if skipped > 0 {
                self.sink.resync_bytes.fetch_add(skipped as u64, Ordering::Relaxed);
                warn!(
                    "[device {}] TS sync lost, skipped {} bytes",
                    self.sink.index, skipped
                );
            }
            match ring.read_packet() {
                Some(packet) => {
                    out.extend_from_slice(&packet);
                    appended += TS_PACKET_SIZE;
                }
                None => break,
            }
        }
        appended
    }

    pub fn information(&self, page: InformationPage) -> String {
        match page {
            InformationPage::General => format!(
                "Device: {}\nStatus: {} ({})\nStream: {}\n",
                self.index,
                self.tuner.state(),
                self.tuner.get_signal_status(),
                self.tuner.get_information()
            ),
            InformationPage::Pids => {
                let pids = self.tuner.pids();
                format!("Pids: {}\n", if pids.is_empty() { "none".to_string() } else { pids })
            }
            InformationPage::Filters => self.sink.sections.information(),
            InformationPage::Bits => format!(
                "Tuner: {}\nOverflow: {}\nRTP errors: {}\nTS resync bytes: {}\nSection overflow bytes: {}\n",
                self.tuner.get_tuner_statistic(),
                self.sink.overflow.lock().take(),
                self.tuner.rtp_errors(),
                self.sink.resync_bytes.load(Ordering::Relaxed),
                self.sink.sections.overflow_count()
            ),
        }
    }

    /// Stop the tuner (final TEARDOWN) and the section pump.
    pub async fn shutdown(&self) {
        self.tuner.shutdown().await;
        self.sink.sections.shutdown().await;
        info!("[device {}] stopped", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::section::filter::tests::{packetize, section};
    use crate::server::{SatipServer, StaticServerDirectory};
    use satip_protocol::ServerQuirks;

    async fn device(servers: Vec<SatipServer>) -> TunerDevice {
        let mut config = ClientConfig::default();
        config.tuner.ts_buffer_size = TS_PACKET_SIZE * 4;
        let context = SatipContext::new(config, Arc::new(StaticServerDirectory::new(servers)));
        TunerDevice::new(0, context).await.unwrap()
    }

    fn packet(fill: u8) -> [u8; TS_PACKET_SIZE] {
        let mut packet = [fill; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet
    }

    #[tokio::test]
    async fn test_dvr_ring_and_overflow() {
        let device = device(Vec::new()).await;
        let mut out = Vec::new();

        device.sink.write_data(&packet(1));
        assert_eq!(device.read_ts(&mut out, Duration::from_millis(10)).await, 0);

        assert!(device.open_dvr());
        for fill in 0..5u8 {
            device.sink.write_data(&packet(fill));
        }
        assert_eq!(device.sink.check_data(), 0);

        let read = device.read_ts(&mut out, Duration::from_millis(10)).await;
        assert_eq!(read, TS_PACKET_SIZE * 4);
        assert_eq!(out[1], 0);
        assert_eq!(out[TS_PACKET_SIZE * 3 + 1], 3);
        assert!(device.information(InformationPage::Bits).contains("Overflow:    1 ("));

        device.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_ts_resyncs() {
        let device = device(Vec::new()).await;
        device.open_dvr();
        let mut data = vec![0x00, 0x01, 0x02];
        data.extend_from_slice(&packet(7));
        device.sink.write_data(&data);

        let mut out = Vec::new();
        assert_eq!(
            device.read_ts(&mut out, Duration::from_millis(10)).await,
            TS_PACKET_SIZE
        );
        assert_eq!(out[0], 0x47);
        assert_eq!(device.sink.resync_bytes.load(Ordering::Relaxed), 3);
        device.shutdown().await;
    }

    #[tokio::test]
    async fn test_filters_drive_pids_and_idle() {
        let device = device(Vec::new()).await;
        assert!(device.sink.is_idle());

        let mut first = device.open_filter(0x11, 0x42, 0xFF).unwrap();
        let second = device.open_filter(0x11, 0x46, 0xFF).unwrap();
        assert!(!device.sink.is_idle());
        assert_eq!(device.tuner().pids(), "17");

        assert!(device.close_filter(second.handle()));
        assert_eq!(device.tuner().pids(), "17");

        for packet in packetize(0x11, &section(0x42, 40), 0) {
            device.sink.write_data(&packet);
        }
        let delivered = tokio::time::timeout(Duration::from_secs(2), first.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.len(), 40);

        assert!(device.close_filter(first.handle()));
        assert_eq!(device.tuner().pids(), "");
        assert!(!device.close_filter(first.handle()));
        assert!(device.sink.is_idle());
        device.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_channel_requires_server() {
        let device = device(vec![SatipServer::new(
            "127.0.0.1",
            554,
            "DVBT2-1",
            "",
            ServerQuirks::default(),
        )])
        .await;
        assert!(matches!(
            device.set_channel("src=1&freq=11494&msys=dvbs2"),
            Err(DeviceError::NoServer(_))
        ));
        assert_eq!(
            device.information(InformationPage::General).lines().nth(2),
            Some("Stream: connection failed")
        );
        device.shutdown().await;
    }
}
