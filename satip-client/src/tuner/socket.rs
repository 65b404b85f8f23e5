//! RTP/RTCP port pair allocation.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use log::{debug, trace};
use tokio::net::UdpSocket;

/// Bind attempts before giving up.
const MAX_BIND_ATTEMPTS: u16 = 100;

/// UDP sockets on an even RTP port and the following RTCP port.
#[derive(Debug)]
pub struct RtpSocketPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
}

impl RtpSocketPair {
    /// Bind a pair inside `start..=stop` stepping by two, or on ephemeral
    /// ports when no range is configured.
    pub async fn bind(start: Option<u16>, stop: Option<u16>) -> io::Result<Self> {
        let stop = stop.map_or(u32::from(u16::MAX), u32::from);
        let first = start.map(|start| u32::from(start) + u32::from(start & 1));
        if let Some(first) = first {
            if first + 1 > stop {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("RTP port range {}-{} holds no even port pair", first, stop),
                ));
            }
        }

        let mut last_error = None;
        for attempt in 0..MAX_BIND_ATTEMPTS {
            let rtp_port = match first {
                Some(first) => {
                    let port = first + 2 * u32::from(attempt);
                    if port + 1 > stop {
                        break;
                    }
                    port as u16
                }
                None => 0,
            };

            match Self::try_bind(rtp_port).await {
                Ok(Some(pair)) => {
                    debug!(
                        "bound RTP/RTCP ports {}-{}",
                        pair.rtp_port(),
                        pair.rtcp_port()
                    );
                    return Ok(pair);
                }
                Ok(None) => {}
                Err(e) => {
                    trace!("port {} unavailable: {}", rtp_port, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrInUse, "no free RTP/RTCP port pair")
        }))
    }

    /// Returns `None` when an ephemeral RTP port turned out odd.
    async fn try_bind(rtp_port: u16) -> io::Result<Option<Self>> {
        let rtp = UdpSocket::bind(any(rtp_port)).await?;
        let port = rtp.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX {
            return Ok(None);
        }
        let rtcp = UdpSocket::bind(any(port + 1)).await?;
        Ok(Some(Self { rtp, rtcp }))
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp.local_addr().map_or(0, |a| a.port())
    }

    pub fn rtcp_port(&self) -> u16 {
        self.rtcp.local_addr().map_or(0, |a| a.port())
    }
}

fn any(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_pair() {
        let pair = RtpSocketPair::bind(None, None).await.unwrap();
        assert_eq!(pair.rtp_port() % 2, 0);
        assert_eq!(pair.rtcp_port(), pair.rtp_port() + 1);
    }

    #[tokio::test]
    async fn test_range_skips_used_ports() {
        let first = RtpSocketPair::bind(None, None).await.unwrap();
        let start = first.rtp_port();

        let second = RtpSocketPair::bind(Some(start), Some(start.saturating_add(201)))
            .await
            .unwrap();
        assert_ne!(second.rtp_port(), start);
        assert_eq!(second.rtp_port() % 2, 0);
        assert!(second.rtp_port() > start);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let first = RtpSocketPair::bind(None, None).await.unwrap();
        let start = first.rtp_port();
        assert!(RtpSocketPair::bind(Some(start), Some(start + 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_range_without_even_pair() {
        let err = RtpSocketPair::bind(Some(u16::MAX), None).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = RtpSocketPair::bind(Some(40001), Some(40002)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
