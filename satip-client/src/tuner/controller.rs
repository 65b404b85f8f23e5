//! Tuner session controller.
//!
//! A [`TunerController`] owns the RTP/RTCP sockets and the control connection
//! of one tuner. Its loop waits on the sockets with a bounded timeout and runs
//! one step of the session state machine after every wakeup:
//!
//! ```text
//! Idle --Set--> Set --connect ok--> Tuned --lock--> Locked
//!                 \--connect failed--> Idle (retried after the reconnect timeout)
//! Locked --pid update / keep-alive failed, no data--> Set
//! any --Released--> teardown --> Idle
//! ```
//!
//! Public operations never wait on the network: they stage their intent in
//! the shared [`TunerSession`] and wake the loop.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use satip_protocol::rtsp::base_url;
use satip_protocol::ts::MAX_PID;
use satip_protocol::{
    parse_reception_params, unescape, ReceptionStatus, RtcpSignalParser, RtpDepacketizer,
};

use crate::config::{DeliveryMode, TunerConfig};
use crate::context::SatipContext;
use crate::metrics::Meter;
use crate::server::{ServerDirectory, ServerRef};
use crate::sink::DeviceSink;
use crate::tuner::data_pump;
use crate::tuner::rtsp::{RtspControlClient, SetupReply};
use crate::tuner::session::{PidType, RequestOrigin, TunerSession, TunerState};
use crate::tuner::socket::RtpSocketPair;

/// Largest RTP datagram read at once.
pub const RTP_BUFFER_SIZE: usize = 4096;

const RTCP_BUFFER_SIZE: usize = 2048;

/// Signal values reported for servers with the force-lock quirk.
const FORCED_SIGNAL_STRENGTH: i32 = 88;
const FORCED_SIGNAL_QUALITY: i32 = 100;

/// Consecutive idle checks before a locked tuner is released.
const IDLE_CHECKS_BEFORE_RELEASE: u32 = 2;

#[derive(Error, Debug)]
pub enum TunerError {
    #[error("Failed to bind RTP/RTCP sockets: {0}")]
    Bind(#[from] io::Error),
}

/// Receive path state shared with the data pump.
pub(crate) struct DataPath {
    rtp: RtpDepacketizer,
    meter: Meter,
    last_data: Instant,
}

pub(crate) struct TunerShared {
    pub(crate) index: usize,
    pub(crate) session: Mutex<TunerSession>,
    pub(crate) data: Mutex<DataPath>,
    pub(crate) wake: Notify,
    pub(crate) sink: Arc<dyn DeviceSink>,
}

impl TunerShared {
    /// Depacketize one RTP datagram and hand the TS payload to the sink.
    pub(crate) fn receive(&self, datagram: &[u8]) -> usize {
        let payload = {
            let mut data = self.data.lock();
            data.last_data = Instant::now();
            let payload = data.rtp.depacketize(datagram);
            if let Some(payload) = payload {
                data.meter.add(payload.len(), 1);
            }
            payload
        };
        match payload {
            Some(payload) => {
                self.sink.write_data(payload);
                payload.len()
            }
            None => 0,
        }
    }

    fn touch(&self) {
        self.data.lock().last_data = Instant::now();
    }

    fn since_data(&self) -> Duration {
        self.data.lock().last_data.elapsed()
    }

    fn request(&self, state: TunerState, origin: RequestOrigin) -> bool {
        let accepted = self.session.lock().request(state, origin);
        if accepted {
            self.wake.notify_one();
        } else {
            trace!("[device {}] state request {} refused", self.index, state);
        }
        accepted
    }
}

/// Controller of one tuner session.
pub struct TunerController {
    shared: Arc<TunerShared>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    rtp_port: u16,
    rtcp_port: u16,
    shutdown_grace: Duration,
}

impl TunerController {
    /// Bind the media sockets and start the controller loop.
    pub async fn start(
        index: usize,
        context: Arc<SatipContext>,
        sink: Arc<dyn DeviceSink>,
    ) -> Result<Self, TunerError> {
        let config = context.config().tuner.clone();
        let sockets = RtpSocketPair::bind(config.rtp_port_start, config.rtp_port_stop).await?;
        let rtp_port = sockets.rtp_port();
        let rtcp_port = sockets.rtcp_port();

        let shared = Arc::new(TunerShared {
            index,
            session: Mutex::new(TunerSession::default()),
            data: Mutex::new(DataPath {
                rtp: RtpDepacketizer::with_report_interval(
                    format!("device {}", index),
                    config.rtp_report_interval(),
                ),
                meter: Meter::new(),
                last_data: Instant::now(),
            }),
            wake: Notify::new(),
            sink,
        });

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let rtp = Arc::new(sockets.rtp);
        let push_rtp = match config.delivery {
            DeliveryMode::Push => Some(rtp),
            DeliveryMode::Pull => {
                tasks.push(tokio::spawn(data_pump::run(
                    Arc::clone(&shared),
                    rtp,
                    cancel.clone(),
                )));
                None
            }
        };

        info!(
            "[device {}] tuner started on RTP/RTCP ports {}-{} ({:?} delivery)",
            index, rtp_port, rtcp_port, config.delivery
        );

        let shutdown_grace = config.shutdown_grace();
        let worker = ControllerLoop {
            shared: Arc::clone(&shared),
            rtsp: RtspControlClient::new(index, config.rtsp_timeout(), config.user_agent.clone()),
            servers: Arc::clone(context.servers()),
            rtp: push_rtp,
            rtcp: sockets.rtcp,
            rtp_port,
            rtcp_port,
            cancel: cancel.clone(),
            keep_alive_interval: config.min_keep_alive(),
            last_keep_alive: Instant::now(),
            last_status_update: None,
            last_pid_update: None,
            tuning_started: Instant::now(),
            last_idle_check: Instant::now(),
            idle_hits: 0,
            retry_at: None,
            config,
        };
        tasks.insert(0, tokio::spawn(worker.run()));

        Ok(Self {
            shared,
            cancel,
            tasks: Mutex::new(tasks),
            rtp_port,
            rtcp_port,
            shutdown_grace,
        })
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    pub fn rtcp_port(&self) -> u16 {
        self.rtcp_port
    }

    pub fn state(&self) -> TunerState {
        self.shared.session.lock().state
    }

    /// (Re)connect to the current source.
    pub fn open(&self) -> bool {
        debug!("[device {}] open", self.shared.index);
        self.shared.request(TunerState::Set, RequestOrigin::External)
    }

    /// Tear the session down.
    pub fn close(&self) -> bool {
        debug!("[device {}] close", self.shared.index);
        self.shared.request(TunerState::Released, RequestOrigin::External)
    }

    /// Tune to `params` on `server`, or release the tuner when `server` is `None`.
    pub fn set_source(&self, server: Option<ServerRef>, params: &str, frontend_index: i32) -> bool {
        let mut session = self.shared.session.lock();
        let accepted = match server {
            Some(server) => {
                let mut params = unescape(params);
                if server.quirks().force_pilot
                    && params.contains("msys=dvbs2")
                    && !params.contains("plts=")
                {
                    params.push_str("&plts=on");
                }
                info!(
                    "[device {}] source {}:{} params {}",
                    self.shared.index,
                    server.address(),
                    server.port(),
                    params
                );
                session.next_server = Some(server);
                session.params = params;
                session.frontend_index = frontend_index;
                session.request(TunerState::Set, RequestOrigin::External)
            }
            None => {
                session.next_server = None;
                session.params.clear();
                session.request(TunerState::Released, RequestOrigin::External)
            }
        };
        drop(session);
        self.shared.wake.notify_one();
        accepted
    }

    /// Add or remove `pid`; sent to the server by the next pid update.
    pub fn set_pid(&self, pid: u16, kind: PidType, on: bool) -> bool {
        if pid > MAX_PID {
            return false;
        }
        trace!(
            "[device {}] {} pid {} ({})",
            self.shared.index,
            if on { "add" } else { "remove" },
            pid,
            kind
        );
        self.shared.session.lock().pids.set(pid, on);
        self.shared.wake.notify_one();
        true
    }

    /// Requested pids as a comma separated list.
    pub fn pids(&self) -> String {
        self.shared.session.lock().pids.pids().to_csv()
    }

    /// 0-100, or -1 when unknown.
    pub fn signal_strength(&self) -> i32 {
        self.shared.session.lock().reception.signal_strength
    }

    /// 0-100, or -1 when unknown.
    pub fn signal_quality(&self) -> i32 {
        self.shared.session.lock().reception.signal_quality
    }

    pub fn has_lock(&self) -> bool {
        self.shared.session.lock().has_lock()
    }

    pub fn frontend_id(&self) -> i32 {
        self.shared.session.lock().reception.frontend_id
    }

    pub fn get_signal_status(&self) -> String {
        let session = self.shared.session.lock();
        format!(
            "lock={} strength={} quality={} frontend={}",
            session.has_lock(),
            session.reception.signal_strength,
            session.reception.signal_quality,
            session.reception.frontend_id
        )
    }

    pub fn get_information(&self) -> String {
        let session = self.shared.session.lock();
        match &session.current_server {
            Some(server) if session.state >= TunerState::Tuned => format!(
                "{}?{} ({}) [stream={}]",
                base_url(server.address(), server.port()),
                session.params,
                session.mode,
                session.stream_id
            ),
            _ => "connection failed".to_string(),
        }
    }

    /// Received TS bytes since the last call.
    pub fn get_tuner_statistic(&self) -> String {
        self.shared.data.lock().meter.take().to_string()
    }

    /// RTP sequence gaps of the current session.
    pub fn rtp_errors(&self) -> u64 {
        self.shared.data.lock().rtp.error_count()
    }

    /// Stop the loop (sending a final TEARDOWN) and the data pump.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(self.shutdown_grace, &mut task)
                .await
                .is_err()
            {
                warn!(
                    "[device {}] tuner task did not stop in time, aborting",
                    self.shared.index
                );
                task.abort();
            }
        }
    }
}

impl Drop for TunerController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ControllerLoop {
    shared: Arc<TunerShared>,
    config: TunerConfig,
    rtsp: RtspControlClient,
    servers: Arc<dyn ServerDirectory>,
    /// Read by the loop in push delivery only.
    rtp: Option<Arc<UdpSocket>>,
    rtcp: UdpSocket,
    rtp_port: u16,
    rtcp_port: u16,
    cancel: CancellationToken,
    keep_alive_interval: Duration,
    last_keep_alive: Instant,
    last_status_update: Option<Instant>,
    last_pid_update: Option<Instant>,
    tuning_started: Instant,
    last_idle_check: Instant,
    idle_hits: u32,
    retry_at: Option<Instant>,
}

impl ControllerLoop {
    async fn run(mut self) {
        let index = self.shared.index;
        debug!("[device {}] controller loop started", index);
        let shared = Arc::clone(&self.shared);
        let mut rtp_buf = vec![0u8; RTP_BUFFER_SIZE];
        let mut rtcp_buf = vec![0u8; RTCP_BUFFER_SIZE];

        loop {
            let rtp = self.rtp.clone();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = shared.wake.notified() => {}
                result = recv_rtp(rtp.as_deref(), &mut rtp_buf) => match result {
                    Ok(len) => self.on_rtp(rtp.as_deref(), &mut rtp_buf, len),
                    Err(e) => debug!("[device {}] RTP receive failed: {}", index, e),
                },
                result = self.rtcp.recv(&mut rtcp_buf) => match result {
                    Ok(len) => self.on_rtcp(&rtcp_buf[..len]),
                    Err(e) => debug!("[device {}] RTCP receive failed: {}", index, e),
                },
                _ = tokio::time::sleep(self.config.sleep()) => {}
            }
            self.step().await;
        }

        self.disconnect().await;
        debug!("[device {}] controller loop stopped", index);
    }

    fn on_rtp(&self, socket: Option<&UdpSocket>, buf: &mut [u8], len: usize) {
        self.shared.receive(&buf[..len]);
        let Some(socket) = socket else { return };
        for _ in 1..self.config.rtp_read_batch {
            match socket.try_recv(buf) {
                Ok(len) => {
                    self.shared.receive(&buf[..len]);
                }
                Err(_) => break,
            }
        }
    }

    fn on_rtcp(&self, datagram: &[u8]) {
        self.shared.touch();
        if let Some(status) = RtcpSignalParser::parse(datagram) {
            self.apply_reception(Some(status));
        }
    }

    fn request(&self, state: TunerState) -> bool {
        self.shared.request(state, RequestOrigin::Internal)
    }

    /// Take the next requested state and run its action.
    async fn step(&mut self) {
        let index = self.shared.index;
        if self.retry_at.map_or(false, |at| Instant::now() >= at) {
            self.retry_at = None;
            debug!("[device {}] retrying connect", index);
            self.request(TunerState::Set);
        }

        let state = {
            let mut session = self.shared.session.lock();
            if let Some(next) = session.requests.next() {
                if next != session.state {
                    debug!("[device {}] {} -> {}", index, session.state, next);
                }
                session.state = next;
            }
            session.state
        };

        match state {
            TunerState::Idle => {}
            TunerState::Released => {
                self.retry_at = None;
                self.disconnect().await;
                self.request(TunerState::Idle);
            }
            TunerState::Set => {
                if self.connect().await {
                    self.tuning_started = Instant::now();
                    self.request(TunerState::Tuned);
                    self.update_pids(true).await;
                } else {
                    self.disconnect().await;
                    self.request(TunerState::Idle);
                    if self.shared.session.lock().next_server.is_some() {
                        self.retry_at = Some(Instant::now() + self.config.reconnect_timeout());
                    }
                }
            }
            TunerState::Tuned => {
                self.shared.touch();
                self.read_reception_status().await;
                if self.shared.session.lock().reception.has_lock {
                    info!("[device {}] signal locked", index);
                    self.request(TunerState::Locked);
                } else if self.tuning_started.elapsed() >= self.config.tuning_timeout() {
                    warn!(
                        "[device {}] no lock within {:?}, retuning",
                        index,
                        self.config.tuning_timeout()
                    );
                    self.request(TunerState::Set);
                }
            }
            TunerState::Locked => {
                if !self.update_pids(false).await {
                    error!("[device {}] pid update failed, retuning", index);
                    self.request(TunerState::Set);
                    return;
                }
                if !self.keep_alive().await {
                    error!("[device {}] keep-alive failed, retuning", index);
                    self.request(TunerState::Set);
                    return;
                }
                let silence = self.shared.since_data();
                if silence >= self.config.reconnect_timeout() {
                    error!(
                        "[device {}] no data for {} ms, retuning",
                        index,
                        silence.as_millis()
                    );
                    self.request(TunerState::Set);
                    return;
                }
                self.read_reception_status().await;
                self.check_idle();
            }
        }
    }

    async fn connect(&mut self) -> bool {
        let index = self.shared.index;
        let (next, current, params, mut stream_id) = {
            let session = self.shared.session.lock();
            (
                session.next_server.clone(),
                session.current_server.clone(),
                session.params.clone(),
                session.stream_id,
            )
        };
        let Some(server) = next else {
            warn!("[device {}] no server to connect to", index);
            return false;
        };
        if let Some(current) = &current {
            if !Arc::ptr_eq(current, &server) {
                info!("[device {}] switching server to {}", index, server);
                self.disconnect().await;
                stream_id = -1;
            }
        }

        let base = base_url(server.address(), server.port());
        if stream_id >= 0 {
            let uri = format!("{}stream={}?{}", base, stream_id, params);
            if self.rtsp.play(&uri).await.is_ok() {
                self.last_keep_alive = Instant::now();
                self.reset_timers();
                return true;
            }
        } else if self.rtsp.options(&base).await.is_ok() {
            let uri = format!("{}?{}", base, params);
            if let Ok(reply) = self.rtsp.setup(&uri, self.rtp_port, self.rtcp_port).await {
                self.attach(server, reply);
                return true;
            }
        }

        self.rtsp.reset();
        self.shared.session.lock().stream_id = -1;
        error!("[device {}] connect to {} failed", index, base);
        false
    }

    fn attach(&mut self, server: ServerRef, reply: SetupReply) {
        let index = self.shared.index;
        if let Some(session) = &reply.session {
            let timeout = Duration::from_secs(session.timeout_secs.map_or(0, u64::from));
            self.keep_alive_interval = timeout.max(self.config.min_keep_alive());
            if server.quirks().session_id && session.token.starts_with('0') {
                self.rtsp.set_session(session.token.trim_start_matches('0'));
            }
        }
        let stream_id = reply.stream_id.unwrap_or(-1);
        if stream_id < 0 {
            warn!("[device {}] SETUP reply carried no stream id", index);
        }
        self.last_keep_alive = Instant::now();
        self.reset_timers();
        self.servers.use_server(&server, true);

        info!(
            "[device {}] session {} stream {} on {} ({}), keep-alive {:?}",
            index,
            self.rtsp.session().unwrap_or("-"),
            stream_id,
            server,
            self.rtsp.active_mode(),
            self.keep_alive_interval
        );
        let mut session = self.shared.session.lock();
        session.stream_id = stream_id;
        session.mode = self.rtsp.active_mode();
        session.current_server = Some(server);
    }

    fn reset_timers(&mut self) {
        self.last_status_update = None;
        self.last_idle_check = Instant::now();
        self.idle_hits = 0;
        self.shared.touch();
    }

    async fn disconnect(&mut self) {
        let (server, stream_id) = {
            let session = self.shared.session.lock();
            (session.current_server.clone(), session.stream_id)
        };
        if let Some(server) = &server {
            if stream_id >= 0 {
                let uri = format!("{}stream={}", base_url(server.address(), server.port()), stream_id);
                if self.rtsp.teardown(&uri).await.is_ok() {
                    debug!("[device {}] stream {} torn down", self.shared.index, stream_id);
                }
            }
        }
        self.rtsp.reset();

        let detached = {
            let mut session = self.shared.session.lock();
            session.stream_id = -1;
            session.mode = "Unicast";
            session.reception = ReceptionStatus::default();
            session.pids.clear_pending();
            session.current_server.take()
        };
        if let Some(server) = detached {
            self.servers.use_server(&server, false);
        }
        self.keep_alive_interval = self.config.min_keep_alive();
        self.last_status_update = None;
        self.shared.data.lock().rtp.reset();
    }

    /// Send pending pid changes. Returns false if the server refused them.
    async fn update_pids(&mut self, force: bool) -> bool {
        let cache_expired = self
            .last_pid_update
            .map_or(true, |at| at.elapsed() >= self.config.pid_update());
        let (uri, sent) = {
            let session = self.shared.session.lock();
            let Some(server) = &session.current_server else {
                return true;
            };
            if !session.has_stream() {
                return true;
            }
            let due = (force && !session.pids.pids().is_empty())
                || (cache_expired && session.pids.has_changes());
            if !due {
                return true;
            }
            let query = session.pids.play_query(force, server.quirks().play_pids);
            (
                format!(
                    "{}stream={}{}",
                    base_url(server.address(), server.port()),
                    session.stream_id,
                    query
                ),
                session.pids.pending(),
            )
        };

        self.last_pid_update = Some(Instant::now());
        if self.rtsp.play(&uri).await.is_err() {
            return false;
        }
        self.shared.session.lock().pids.commit(&sent);
        true
    }

    /// OPTIONS when the keep-alive interval elapsed.
    async fn keep_alive(&mut self) -> bool {
        if self.last_keep_alive.elapsed() < self.keep_alive_interval {
            return true;
        }
        self.last_keep_alive = Instant::now();
        let base = {
            let session = self.shared.session.lock();
            match &session.current_server {
                Some(server) => base_url(server.address(), server.port()),
                None => return true,
            }
        };
        self.rtsp.options(&base).await.is_ok()
    }

    /// DESCRIBE the stream, at most once per status update interval.
    async fn read_reception_status(&mut self) {
        if self
            .last_status_update
            .map_or(false, |at| at.elapsed() < self.config.status_update())
        {
            return;
        }
        let uri = {
            let session = self.shared.session.lock();
            match &session.current_server {
                Some(server) if session.has_stream() => format!(
                    "{}stream={}",
                    base_url(server.address(), server.port()),
                    session.stream_id
                ),
                _ => return,
            }
        };
        self.last_status_update = Some(Instant::now());

        let status = match self.rtsp.describe(&uri).await {
            Ok(body) => parse_reception_params(&String::from_utf8_lossy(&body)),
            Err(_) => None,
        };
        self.apply_reception(status);
    }

    fn apply_reception(&self, status: Option<ReceptionStatus>) {
        let mut session = self.shared.session.lock();
        if let Some(status) = status {
            session.reception = status;
        }
        let force_lock = session
            .current_server
            .as_ref()
            .map_or(false, |server| server.quirks().force_lock);
        if force_lock {
            session.reception.has_lock = true;
            session.reception.signal_strength = FORCED_SIGNAL_STRENGTH;
            session.reception.signal_quality = FORCED_SIGNAL_QUALITY;
        }
        let received = status.is_some();
        drop(session);
        if received {
            self.shared.touch();
        }
    }

    fn check_idle(&mut self) {
        if self.last_idle_check.elapsed() < self.config.idle_check() {
            return;
        }
        self.last_idle_check = Instant::now();
        if !self.shared.sink.is_idle() {
            self.idle_hits = 0;
            return;
        }
        self.idle_hits += 1;
        if self.idle_hits >= IDLE_CHECKS_BEFORE_RELEASE {
            info!("[device {}] no consumers, releasing tuner", self.shared.index);
            self.idle_hits = 0;
            self.request(TunerState::Released);
        }
    }
}

async fn recv_rtp(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<usize> {
    match socket {
        Some(socket) => socket.recv(buf).await,
        None => std::future::pending().await,
    }
}
