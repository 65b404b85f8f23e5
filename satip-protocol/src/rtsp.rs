//! RTSP message encoding and decoding.
//!
//! Requests are written in full by [`RtspRequest::encode`]. Responses are
//! decoded incrementally by [`decode_response`], which returns `Ok(None)`
//! until the header block and the `Content-Length` body are buffered.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Default RTSP port.
pub const RTSP_DEFAULT_PORT: u16 = 554;

/// Largest accepted response header block.
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Largest response body accepted (SDP or OPTIONS replies are far smaller).
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Canonical success status.
pub const STATUS_OK: u16 = 200;

/// Status returned together with an `Out-of-Range:` hint.
pub const STATUS_FORBIDDEN: u16 = 403;

/// Header carrying the server assigned stream id.
pub const STREAM_ID_HEADER: &str = "com.ses.streamID";

/// Session-control verbs used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspMethod {
    Options,
    Setup,
    Describe,
    Play,
    Teardown,
}

impl RtspMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspMethod::Options => "OPTIONS",
            RtspMethod::Setup => "SETUP",
            RtspMethod::Describe => "DESCRIBE",
            RtspMethod::Play => "PLAY",
            RtspMethod::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for RtspMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspRequest {
    pub method: RtspMethod,
    pub uri: String,
    pub cseq: u32,
    pub session: Option<String>,
    pub transport: Option<String>,
    pub accept: Option<String>,
    pub user_agent: Option<String>,
}

impl RtspRequest {
    pub fn new(method: RtspMethod, uri: impl Into<String>, cseq: u32) -> Self {
        Self {
            method,
            uri: uri.into(),
            cseq,
            session: None,
            transport: None,
            accept: None,
            user_agent: None,
        }
    }

    /// Serialize the request, terminated by an empty line.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        put_line(&mut buf, &format!("{} {} RTSP/1.0", self.method, self.uri));
        put_line(&mut buf, &format!("CSeq: {}", self.cseq));
        if let Some(session) = &self.session {
            put_line(&mut buf, &format!("Session: {}", session));
        }
        if let Some(transport) = &self.transport {
            put_line(&mut buf, &format!("Transport: {}", transport));
        }
        if let Some(accept) = &self.accept {
            put_line(&mut buf, &format!("Accept: {}", accept));
        }
        if let Some(agent) = &self.user_agent {
            put_line(&mut buf, &format!("User-Agent: {}", agent));
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_slice(b"\r\n");
}

/// One decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RtspResponse {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    pub fn session(&self) -> Option<SessionHeader> {
        self.header("Session").and_then(SessionHeader::parse)
    }

    pub fn stream_id(&self) -> Option<i32> {
        self.header(STREAM_ID_HEADER)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn transport(&self) -> Option<Transport> {
        self.header("Transport").and_then(Transport::parse)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Error hint carried by the body, if any.
    pub fn error_hint(&self) -> Option<ErrorHint> {
        ErrorHint::parse(&self.body)
    }
}

/// Decode one response from the front of `buf`.
///
/// Returns the response and the number of bytes it occupied.
pub fn decode_response(buf: &[u8]) -> Result<Option<(RtspResponse, usize)>, ProtocolError> {
    let header_end = match find_subslice(buf, b"\r\n\r\n") {
        Some(pos) => pos,
        None if buf.len() > MAX_HEADER_SIZE => {
            return Err(ProtocolError::HeaderTooLarge(buf.len(), MAX_HEADER_SIZE))
        }
        None => return Ok(None),
    };
    if header_end > MAX_HEADER_SIZE {
        return Err(ProtocolError::HeaderTooLarge(header_end, MAX_HEADER_SIZE));
    }

    let head = String::from_utf8_lossy(&buf[..header_end]);
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let (status, reason) = parse_status_line(status_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;
        headers.push((key.trim().to_string(), value.trim().to_string()));
    }

    let content_length = match headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
    {
        Some((_, value)) => value
            .parse::<usize>()
            .map_err(|_| ProtocolError::InvalidContentLength(value.clone()))?,
        None => 0,
    };
    if content_length > MAX_BODY_SIZE {
        return Err(ProtocolError::BodyTooLarge(content_length, MAX_BODY_SIZE));
    }

    let body_start = header_end + 4;
    let total = body_start
        .checked_add(content_length)
        .ok_or_else(|| ProtocolError::InvalidContentLength(content_length.to_string()))?;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some((
        RtspResponse {
            status,
            reason,
            headers,
            body: Bytes::copy_from_slice(&buf[body_start..total]),
        },
        total,
    )))
}

fn parse_status_line(line: &str) -> Result<(u16, String), ProtocolError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("RTSP/") {
        return Err(ProtocolError::MalformedStatusLine(line.to_string()));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ProtocolError::MalformedStatusLine(line.to_string()))?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok((status, reason))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `Session: <token>[;timeout=<seconds>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub token: String,
    pub timeout_secs: Option<u32>,
}

impl SessionHeader {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';');
        let token = parts.next()?.trim();
        if token.is_empty() {
            return None;
        }
        let timeout_secs = parts.find_map(|p| {
            let (key, v) = p.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("timeout") {
                v.trim().parse().ok()
            } else {
                None
            }
        });
        Some(Self {
            token: token.to_string(),
            timeout_secs,
        })
    }
}

/// Transport negotiated by SETUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Unicast {
        client_port: Option<(u16, u16)>,
    },
    Multicast {
        destination: Option<String>,
        port: Option<(u16, u16)>,
        ttl: Option<u8>,
        source: Option<String>,
    },
}

impl Transport {
    /// Transport header value requesting unicast delivery to the given ports.
    pub fn unicast_request(rtp_port: u16, rtcp_port: u16) -> String {
        format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtcp_port)
    }

    pub fn parse(value: &str) -> Option<Self> {
        if !value.trim_start().starts_with("RTP/AVP") {
            return None;
        }
        let mut multicast = false;
        let mut client_port = None;
        let mut destination = None;
        let mut port = None;
        let mut ttl = None;
        let mut source = None;

        for part in value.split(';').map(str::trim) {
            match part.split_once('=') {
                None if part.eq_ignore_ascii_case("multicast") => multicast = true,
                Some(("client_port", v)) => client_port = parse_port_pair(v),
                Some(("destination", v)) => destination = Some(v.to_string()),
                Some(("port", v)) => port = parse_port_pair(v),
                Some(("ttl", v)) => ttl = v.parse().ok(),
                Some(("source", v)) => source = Some(v.to_string()),
                _ => {}
            }
        }

        Some(if multicast {
            Transport::Multicast {
                destination,
                port,
                ttl,
                source,
            }
        } else {
            Transport::Unicast { client_port }
        })
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Transport::Unicast { .. } => "Unicast",
            Transport::Multicast { .. } => "Multicast",
        }
    }
}

fn parse_port_pair(value: &str) -> Option<(u16, u16)> {
    let (a, b) = value.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// Error explanation carried in the body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorHint {
    /// `No-More:` no free tuner/stream on the server.
    NoMore(String),
    /// `Out-of-Range:` parameter outside the tuner's capabilities.
    OutOfRange(String),
    /// `Check-Syntax:` query parameter rejected.
    CheckSyntax(String),
}

impl ErrorHint {
    pub fn parse(body: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(body);
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim().to_string();
                match key.trim() {
                    "No-More" => return Some(ErrorHint::NoMore(value)),
                    "Out-of-Range" => return Some(ErrorHint::OutOfRange(value)),
                    "Check-Syntax" => return Some(ErrorHint::CheckSyntax(value)),
                    _ => {}
                }
            }
        }
        None
    }
}

impl fmt::Display for ErrorHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorHint::NoMore(v) => write!(f, "No-More: {}", v),
            ErrorHint::OutOfRange(v) => write!(f, "Out-of-Range: {}", v),
            ErrorHint::CheckSyntax(v) => write!(f, "Check-Syntax: {}", v),
        }
    }
}

/// Percent-decode `input`; malformed escapes are kept literally.
pub fn unescape(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(value) = hex {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `rtsp://host/` or `rtsp://host:port/` for non-default ports.
pub fn base_url(address: &str, port: u16) -> String {
    if port == RTSP_DEFAULT_PORT {
        format!("rtsp://{}/", address)
    } else {
        format!("rtsp://{}:{}/", address, port)
    }
}

/// Split the authority of an `rtsp://` URI into host and port.
pub fn uri_authority(uri: &str) -> Option<(String, u16)> {
    let rest = uri.strip_prefix("rtsp://")?;
    let authority = rest.split(|c| c == '/' || c == '?').next()?;
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), RTSP_DEFAULT_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_setup() {
        let mut req = RtspRequest::new(RtspMethod::Setup, "rtsp://10.0.0.1/?src=1&freq=11494", 2);
        req.transport = Some(Transport::unicast_request(5000, 5001));
        req.user_agent = Some("satip-client".to_string());
        let encoded = req.encode();
        assert_eq!(
            &encoded[..],
            b"SETUP rtsp://10.0.0.1/?src=1&freq=11494 RTSP/1.0\r\n\
CSeq: 2\r\n\
Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\
User-Agent: satip-client\r\n\r\n"
        );
    }

    #[test]
    fn test_decode_setup_reply() {
        let raw = b"RTSP/1.0 200 OK\r\n\
CSeq: 2\r\n\
Session: 0123456;timeout=60\r\n\
com.ses.streamID: 7\r\n\
Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n";
        let (resp, used) = decode_response(raw).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(resp.status, 200);
        assert_eq!(resp.cseq(), Some(2));
        assert_eq!(
            resp.session(),
            Some(SessionHeader {
                token: "0123456".to_string(),
                timeout_secs: Some(60)
            })
        );
        assert_eq!(resp.stream_id(), Some(7));
        assert_eq!(
            resp.transport(),
            Some(Transport::Unicast {
                client_port: Some((5000, 5001))
            })
        );
    }

    #[test]
    fn test_decode_incremental_body() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nContent-Length: 10\r\n\r\nv=0\r\nabcde";
        assert_eq!(decode_response(&raw[..20]).unwrap(), None);
        assert_eq!(decode_response(&raw[..raw.len() - 1]).unwrap(), None);
        let (resp, used) = decode_response(raw).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(&resp.body[..], b"v=0\r\nabcde");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_response(b"HTTP/1.1 200 OK\r\n\r\n"),
            Err(ProtocolError::MalformedStatusLine(_))
        ));
        assert!(matches!(
            decode_response(b"RTSP/1.0 200 OK\r\nbroken\r\n\r\n"),
            Err(ProtocolError::MalformedHeader(_))
        ));
        assert!(matches!(
            decode_response(&vec![b'a'; MAX_HEADER_SIZE + 1]),
            Err(ProtocolError::HeaderTooLarge(..))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_body() {
        assert!(matches!(
            decode_response(
                b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 18446744073709551615\r\n\r\n"
            ),
            Err(ProtocolError::BodyTooLarge(..) | ProtocolError::InvalidContentLength(_))
        ));
        let raw = format!(
            "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_SIZE + 1
        );
        assert!(matches!(
            decode_response(raw.as_bytes()),
            Err(ProtocolError::BodyTooLarge(..))
        ));

        let raw = format!(
            "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_SIZE
        );
        assert_eq!(decode_response(raw.as_bytes()).unwrap(), None);
    }

    #[test]
    fn test_session_without_timeout() {
        let session = SessionHeader::parse("ABCDEF").unwrap();
        assert_eq!(session.token, "ABCDEF");
        assert_eq!(session.timeout_secs, None);
        assert!(SessionHeader::parse("").is_none());
    }

    #[test]
    fn test_multicast_transport() {
        let transport =
            Transport::parse("RTP/AVP;multicast;destination=239.0.0.1;port=5004-5005;ttl=5")
                .unwrap();
        assert_eq!(
            transport,
            Transport::Multicast {
                destination: Some("239.0.0.1".to_string()),
                port: Some((5004, 5005)),
                ttl: Some(5),
                source: None,
            }
        );
        assert_eq!(transport.mode(), "Multicast");
    }

    #[test]
    fn test_error_hints() {
        assert_eq!(
            ErrorHint::parse(b"Out-of-Range: freq\r\n"),
            Some(ErrorHint::OutOfRange("freq".to_string()))
        );
        assert_eq!(
            ErrorHint::parse(b"No-More: frontends"),
            Some(ErrorHint::NoMore("frontends".to_string()))
        );
        assert_eq!(ErrorHint::parse(b"v=0"), None);
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("src=1%26freq=11494"), "src=1&freq=11494");
        assert_eq!(unescape("100%"), "100%");
        assert_eq!(unescape("%zz"), "%zz");
    }

    #[test]
    fn test_base_url_and_authority() {
        assert_eq!(base_url("10.0.0.1", 554), "rtsp://10.0.0.1/");
        assert_eq!(base_url("10.0.0.1", 8554), "rtsp://10.0.0.1:8554/");
        assert_eq!(
            uri_authority("rtsp://10.0.0.1:8554/stream=1?pids=0"),
            Some(("10.0.0.1".to_string(), 8554))
        );
        assert_eq!(
            uri_authority("rtsp://10.0.0.1/?src=1"),
            Some(("10.0.0.1".to_string(), 554))
        );
        assert_eq!(uri_authority("http://x/"), None);
    }
}
