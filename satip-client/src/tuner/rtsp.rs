//! RTSP control client of one tuner.
//!
//! Each call performs one request/response exchange over a persistent TCP
//! connection, bounded by the configured timeout. Any I/O failure drops the
//! connection; the next call reconnects.

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, error, trace, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use satip_protocol::rtsp::{uri_authority, STATUS_FORBIDDEN, STATUS_OK};
use satip_protocol::{
    decode_response, ErrorHint, ProtocolError, RtspMethod, RtspRequest, RtspResponse,
    SessionHeader, Transport,
};

/// Failure of one control exchange.
#[derive(Error, Debug)]
pub enum RtspError {
    #[error("Invalid RTSP URI: {0}")]
    InvalidUri(String),

    #[error("Failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("{method} {uri} timed out")]
    Timeout { method: RtspMethod, uri: String },

    #[error("{method} {uri}: {source}")]
    Io {
        method: RtspMethod,
        uri: String,
        #[source]
        source: io::Error,
    },

    #[error("{method} {uri}: connection closed by server")]
    Closed { method: RtspMethod, uri: String },

    #[error("{method} {uri}: {source}")]
    Protocol {
        method: RtspMethod,
        uri: String,
        #[source]
        source: ProtocolError,
    },

    #[error("{method} {uri} failed: {status} {reason}")]
    Status {
        method: RtspMethod,
        uri: String,
        status: u16,
        reason: String,
        hint: Option<ErrorHint>,
    },
}

/// Values learned from a SETUP reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupReply {
    pub session: Option<SessionHeader>,
    pub stream_id: Option<i32>,
    pub transport: Option<Transport>,
}

struct Connection {
    host: String,
    port: u16,
    stream: TcpStream,
    buf: BytesMut,
}

/// Session-control client.
pub struct RtspControlClient {
    device_index: usize,
    timeout: Duration,
    user_agent: String,
    connection: Option<Connection>,
    cseq: u32,
    session: Option<String>,
    transport: Option<Transport>,
}

impl RtspControlClient {
    pub fn new(device_index: usize, timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            device_index,
            timeout,
            user_agent: user_agent.into(),
            connection: None,
            cseq: 1,
            session: None,
            transport: None,
        }
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Sequence number of the next request.
    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// `Unicast` or `Multicast` as negotiated by the last SETUP.
    pub fn active_mode(&self) -> &'static str {
        self.transport.as_ref().map_or("Unicast", Transport::mode)
    }

    /// Send `token` as the session id on every following request.
    pub fn set_session(&mut self, token: &str) {
        debug!("[device {}] forcing session id {}", self.device_index, token);
        self.session = Some(token.to_string());
    }

    pub async fn options(&mut self, uri: &str) -> Result<(), RtspError> {
        self.request(RtspMethod::Options, uri, |_| {}).await?;
        Ok(())
    }

    pub async fn setup(
        &mut self,
        uri: &str,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<SetupReply, RtspError> {
        let transport = Transport::unicast_request(rtp_port, rtcp_port);
        let resp = self
            .request(RtspMethod::Setup, uri, |req| req.transport = Some(transport))
            .await?;

        let reply = SetupReply {
            session: resp.session(),
            stream_id: resp.stream_id(),
            transport: resp.transport(),
        };
        if let Some(session) = &reply.session {
            self.session = Some(session.token.clone());
        }
        if let Some(Transport::Multicast { .. }) = &reply.transport {
            warn!(
                "[device {}] server answered with multicast transport, only unicast is received",
                self.device_index
            );
        }
        self.transport = reply.transport.clone();
        Ok(reply)
    }

    /// DESCRIBE `uri` and return the SDP body.
    pub async fn describe(&mut self, uri: &str) -> Result<Bytes, RtspError> {
        let resp = self
            .request(RtspMethod::Describe, uri, |req| {
                req.accept = Some("application/sdp".to_string())
            })
            .await?;
        Ok(resp.body)
    }

    pub async fn play(&mut self, uri: &str) -> Result<(), RtspError> {
        self.request(RtspMethod::Play, uri, |_| {}).await?;
        Ok(())
    }

    /// TEARDOWN `uri`; the session and sequence counter are reset either way.
    pub async fn teardown(&mut self, uri: &str) -> Result<(), RtspError> {
        let result = self.request(RtspMethod::Teardown, uri, |_| {}).await;
        self.cseq = 1;
        self.session = None;
        result.map(|_| ())
    }

    /// Drop the connection and all session state.
    pub fn reset(&mut self) {
        self.connection = None;
        self.cseq = 1;
        self.session = None;
        self.transport = None;
    }

    async fn request(
        &mut self,
        method: RtspMethod,
        uri: &str,
        customize: impl FnOnce(&mut RtspRequest),
    ) -> Result<RtspResponse, RtspError> {
        let mut req = RtspRequest::new(method, uri, self.cseq);
        self.cseq += 1;
        req.session = self.session.clone();
        req.user_agent = Some(self.user_agent.clone());
        customize(&mut req);

        debug!("[device {}] {} {}", self.device_index, method, uri);
        let resp = match tokio::time::timeout(self.timeout, self.exchange(&req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                self.connection = None;
                error!("[device {}] {}", self.device_index, e);
                return Err(e);
            }
            Err(_) => {
                self.connection = None;
                let e = RtspError::Timeout {
                    method,
                    uri: uri.to_string(),
                };
                error!("[device {}] {}", self.device_index, e);
                return Err(e);
            }
        };
        self.validate(method, uri, resp)
    }

    fn validate(
        &self,
        method: RtspMethod,
        uri: &str,
        resp: RtspResponse,
    ) -> Result<RtspResponse, RtspError> {
        let hint = resp.error_hint();
        match resp.status {
            STATUS_OK => Ok(resp),
            STATUS_FORBIDDEN if matches!(hint, Some(ErrorHint::OutOfRange(_))) => {
                if let Some(hint) = &hint {
                    warn!("[device {}] {} {}: {}", self.device_index, method, uri, hint);
                }
                Ok(resp)
            }
            _ => {
                if let Some(hint) = &hint {
                    error!("[device {}] {} {}: {}", self.device_index, method, uri, hint);
                }
                let e = RtspError::Status {
                    method,
                    uri: uri.to_string(),
                    status: resp.status,
                    reason: resp.reason,
                    hint,
                };
                error!("[device {}] {}", self.device_index, e);
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, req: &RtspRequest) -> Result<RtspResponse, RtspError> {
        let (host, port) =
            uri_authority(&req.uri).ok_or_else(|| RtspError::InvalidUri(req.uri.clone()))?;
        let io_error = |source| RtspError::Io {
            method: req.method,
            uri: req.uri.clone(),
            source,
        };

        if self
            .connection
            .as_ref()
            .map_or(false, |c| c.host != host || c.port != port)
        {
            self.connection = None;
        }
        if self.connection.is_none() {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|source| RtspError::Connect {
                    host: host.clone(),
                    port,
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            debug!("[device {}] connected to {}:{}", self.device_index, host, port);
            self.connection = Some(Connection {
                host,
                port,
                stream,
                buf: BytesMut::with_capacity(4096),
            });
        }
        let Some(conn) = self.connection.as_mut() else {
            return Err(RtspError::InvalidUri(req.uri.clone()));
        };

        conn.stream.write_all(&req.encode()).await.map_err(io_error)?;

        loop {
            let decoded = decode_response(&conn.buf).map_err(|source| RtspError::Protocol {
                method: req.method,
                uri: req.uri.clone(),
                source,
            })?;
            if let Some((resp, used)) = decoded {
                conn.buf.advance(used);
                match resp.cseq() {
                    Some(cseq) if cseq != req.cseq => {
                        trace!(
                            "[device {}] skipping stale reply CSeq {} (want {})",
                            self.device_index,
                            cseq,
                            req.cseq
                        );
                        continue;
                    }
                    _ => return Ok(resp),
                }
            }

            let n = conn.stream.read_buf(&mut conn.buf).await.map_err(io_error)?;
            if n == 0 {
                return Err(RtspError::Closed {
                    method: req.method,
                    uri: req.uri.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Scripted server reply; the CSeq header is filled in from the request.
    pub(crate) struct Reply {
        pub status: &'static str,
        pub headers: Vec<String>,
        pub body: String,
    }

    impl Reply {
        pub(crate) fn ok() -> Self {
            Self {
                status: "200 OK",
                headers: Vec::new(),
                body: String::new(),
            }
        }

        pub(crate) fn status(status: &'static str) -> Self {
            Self {
                status,
                ..Self::ok()
            }
        }

        pub(crate) fn header(mut self, header: impl Into<String>) -> Self {
            self.headers.push(header.into());
            self
        }

        pub(crate) fn body(mut self, body: impl Into<String>) -> Self {
            self.body = body.into();
            self
        }
    }

    /// Serve one connection, answering each request with a function of the request.
    pub(crate) async fn fake_server<F>(
        mut answer: F,
    ) -> (u16, mpsc::UnboundedReceiver<String>)
    where
        F: FnMut(&str) -> Option<Reply> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let request = String::from_utf8_lossy(&buf[..end + 4]).into_owned();
                        buf.drain(..end + 4);
                        let cseq = request
                            .lines()
                            .find_map(|l| l.strip_prefix("CSeq: "))
                            .unwrap_or("0")
                            .to_string();
                        let _ = tx.send(request.clone());
                        let Some(reply) = answer(&request) else { continue };
                        let mut text = format!("RTSP/1.0 {}\r\nCSeq: {}\r\n", reply.status, cseq);
                        for header in &reply.headers {
                            text.push_str(header);
                            text.push_str("\r\n");
                        }
                        if !reply.body.is_empty() {
                            text.push_str(&format!("Content-Length: {}\r\n", reply.body.len()));
                        }
                        text.push_str("\r\n");
                        text.push_str(&reply.body);
                        if socket.write_all(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        (port, rx)
    }

    fn client() -> RtspControlClient {
        RtspControlClient::new(0, Duration::from_millis(500), "satip-client/test")
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (port, mut requests) = fake_server(|req| {
            Some(if req.starts_with("SETUP") {
                Reply::ok()
                    .header("Session: 0012AB;timeout=60")
                    .header("com.ses.streamID: 3")
                    .header("Transport: RTP/AVP;unicast;client_port=40000-40001")
            } else if req.starts_with("DESCRIBE") {
                Reply::ok().body("v=0\r\na=fmtp:33 ver=1.0;src=1;tuner=1,200,1,15;pids=0\r\n")
            } else {
                Reply::ok()
            })
        })
        .await;
        let base = format!("rtsp://127.0.0.1:{}/", port);
        let mut rtsp = client();

        rtsp.options(&base).await.unwrap();
        let reply = rtsp
            .setup(&format!("{}?src=1&freq=11494", base), 40000, 40001)
            .await
            .unwrap();
        assert_eq!(reply.stream_id, Some(3));
        assert_eq!(
            reply.session,
            Some(SessionHeader {
                token: "0012AB".to_string(),
                timeout_secs: Some(60)
            })
        );
        assert_eq!(rtsp.session(), Some("0012AB"));
        assert_eq!(rtsp.active_mode(), "Unicast");

        let body = rtsp.describe(&format!("{}stream=3", base)).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("tuner=1,200,1,15"));
        rtsp.play(&format!("{}stream=3?pids=0,16", base)).await.unwrap();
        assert_eq!(rtsp.cseq(), 5);

        rtsp.teardown(&format!("{}stream=3", base)).await.unwrap();
        assert_eq!(rtsp.cseq(), 1);
        assert_eq!(rtsp.session(), None);

        let options = requests.recv().await.unwrap();
        assert!(options.starts_with(&format!("OPTIONS {} RTSP/1.0\r\nCSeq: 1\r\n", base)));
        assert!(!options.contains("Session:"));

        let setup = requests.recv().await.unwrap();
        assert!(setup.contains("CSeq: 2\r\n"));
        assert!(setup.contains("Transport: RTP/AVP;unicast;client_port=40000-40001\r\n"));
        assert!(setup.contains("User-Agent: satip-client/test\r\n"));

        let describe = requests.recv().await.unwrap();
        assert!(describe.contains("Session: 0012AB\r\n"));
        assert!(describe.contains("Accept: application/sdp\r\n"));

        let play = requests.recv().await.unwrap();
        assert!(play.starts_with(&format!("PLAY {}stream=3?pids=0,16 RTSP/1.0", base)));

        let teardown = requests.recv().await.unwrap();
        assert!(teardown.contains("CSeq: 5\r\n"));
    }

    #[tokio::test]
    async fn test_forced_session() {
        let (port, mut requests) = fake_server(|_| Some(Reply::ok())).await;
        let mut rtsp = client();
        rtsp.set_session("12AB");
        rtsp.play(&format!("rtsp://127.0.0.1:{}/stream=1", port))
            .await
            .unwrap();
        assert!(requests.recv().await.unwrap().contains("Session: 12AB\r\n"));
    }

    #[tokio::test]
    async fn test_error_status() {
        let (port, _requests) = fake_server(|req| {
            Some(if req.starts_with("PLAY") {
                Reply::status("403 Forbidden").body("Out-of-Range: freq\r\n")
            } else if req.starts_with("SETUP") {
                Reply::status("503 Service Unavailable").body("No-More: frontends\r\n")
            } else {
                Reply::status("404 Not Found")
            })
        })
        .await;
        let base = format!("rtsp://127.0.0.1:{}/", port);
        let mut rtsp = client();

        rtsp.play(&format!("{}stream=1?freq=99999", base)).await.unwrap();

        match rtsp.setup(&base, 1000, 1001).await {
            Err(RtspError::Status { status, hint, .. }) => {
                assert_eq!(status, 503);
                assert_eq!(hint, Some(ErrorHint::NoMore("frontends".to_string())));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(matches!(
            rtsp.options(&base).await,
            Err(RtspError::Status { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_drops_connection() {
        let (port, _requests) = fake_server(|_| None).await;
        let mut rtsp = RtspControlClient::new(0, Duration::from_millis(100), "test");
        let result = rtsp
            .options(&format!("rtsp://127.0.0.1:{}/", port))
            .await;
        assert!(matches!(result, Err(RtspError::Timeout { .. })));
        assert!(rtsp.connection.is_none());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut rtsp = client();
        let result = rtsp.options(&format!("rtsp://127.0.0.1:{}/", port)).await;
        assert!(matches!(result, Err(RtspError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        let mut rtsp = client();
        assert!(matches!(
            rtsp.options("http://example/").await,
            Err(RtspError::InvalidUri(_))
        ));
    }
}
