//! # transport
//!
//! Datagram and stream transports to the DMT server.
//!
//! The protocol engine is parameterized over this tagged variant; both
//! flavors expose open/close/read/write plus address rotation between the
//! two configured server endpoints. Every blocking call is bounded by a
//! timeout so nothing can wedge the engine past its configured ceiling.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::props::{
    PropertyStore, PROP_COMM_HOST, PROP_COMM_HOST_B, PROP_COMM_PORT, PROP_COMM_PORT_B,
};

pub const NETWORK_OPEN_TIMEOUT: Duration = Duration::from_secs(150);
pub const NETWORK_RECEIVE_TIMEOUT: Duration = Duration::from_secs(150);
pub const BLOCK_RECEIVING_TIMEOUT: Duration = Duration::from_secs(15);

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not open")]
    NotOpen,
    #[error("no server host configured")]
    NoHost,
    #[error("dns resolution failed for {0}")]
    Dns(String),
    #[error("connect timed out")]
    OpenTimeout,
    #[error("server read timed out")]
    ReadTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Link-level failures advance the connectivity supervisor; the rest
    /// stay within the session (server silent, protocol trouble).
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            Self::Dns(_) | Self::OpenTimeout | Self::Io(_) | Self::NoHost
        )
    }
}

// ── Server endpoints ──────────────────────────────────────────────────────────

/// The two preconfigured server URLs. `url_id` selects which one resolves;
/// rotation flips it on repeated session failure.
pub struct ServerUrls {
    pub url_id: u32,
    resolved: Option<SocketAddr>,
}

impl ServerUrls {
    pub fn new() -> Self {
        Self {
            url_id: 0,
            resolved: None,
        }
    }

    /// Drop the cached address so the next open re-resolves.
    pub fn reset(&mut self, url_id: u32) {
        self.url_id = url_id;
        self.resolved = None;
    }

    #[cfg(test)]
    pub fn resolved_for_tests(&mut self, addr: SocketAddr) {
        self.resolved = Some(addr);
    }

    pub async fn resolve(&mut self, props: &PropertyStore) -> Result<SocketAddr, TransportError> {
        if let Some(addr) = self.resolved {
            return Ok(addr);
        }
        let (host_key, port_key) = if self.url_id == 0 {
            (PROP_COMM_HOST, PROP_COMM_PORT)
        } else {
            (PROP_COMM_HOST_B, PROP_COMM_PORT_B)
        };
        let mut host = props.get_string(host_key, "");
        let mut port = props.get_u32(port_key, 0) as u16;
        if host.is_empty() {
            // Secondary endpoint not provisioned: fall back to the primary.
            host = props.get_string(PROP_COMM_HOST, "");
            port = props.get_u32(PROP_COMM_PORT, 0) as u16;
        }
        if host.is_empty() {
            return Err(TransportError::NoHost);
        }
        let target = format!("{host}:{port}");
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|_| TransportError::Dns(target.clone()))?
            .next()
            .ok_or(TransportError::Dns(target.clone()))?;
        debug!("server url {} resolved to {addr}", self.url_id);
        self.resolved = Some(addr);
        Ok(addr)
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

pub enum Transport {
    Udp(Option<UdpSocket>),
    Tcp(Option<TcpStream>),
}

impl Transport {
    pub fn udp() -> Self {
        Self::Udp(None)
    }

    pub fn tcp() -> Self {
        Self::Tcp(None)
    }

    pub fn is_open(&self) -> bool {
        match self {
            Self::Udp(s) => s.is_some(),
            Self::Tcp(s) => s.is_some(),
        }
    }

    pub fn is_duplex(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }

    pub async fn open(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        match self {
            Self::Udp(slot) => {
                let sock = UdpSocket::bind("0.0.0.0:0").await?;
                sock.connect(addr).await?;
                *slot = Some(sock);
                Ok(())
            }
            Self::Tcp(slot) => {
                let stream = timeout(NETWORK_OPEN_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .map_err(|_| TransportError::OpenTimeout)??;
                stream.set_nodelay(true).ok();
                info!("TCP session open to {addr}");
                *slot = Some(stream);
                Ok(())
            }
        }
    }

    pub async fn close(&mut self) {
        match self {
            Self::Udp(slot) => *slot = None,
            Self::Tcp(slot) => {
                if let Some(mut s) = slot.take() {
                    let _ = s.shutdown().await;
                }
            }
        }
    }

    /// Read once with the given ceiling. UDP reads one datagram; TCP reads
    /// whatever the stream yields.
    pub async fn read(
        &mut self,
        buf: &mut [u8],
        ceiling: Duration,
    ) -> Result<usize, TransportError> {
        match self {
            Self::Udp(Some(sock)) => match timeout(ceiling, sock.recv(buf)).await {
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(TransportError::ReadTimeout),
            },
            Self::Tcp(Some(stream)) => match timeout(ceiling, stream.read(buf)).await {
                Ok(Ok(0)) => Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed connection",
                ))),
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(TransportError::ReadTimeout),
            },
            _ => Err(TransportError::NotOpen),
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self {
            Self::Udp(Some(sock)) => {
                let n = sock.send(data).await?;
                if n != data.len() {
                    warn!("short UDP send: {n}/{}", data.len());
                }
                Ok(())
            }
            Self::Tcp(Some(stream)) => Ok(stream.write_all(data).await?),
            _ => Err(TransportError::NotOpen),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn udp_round_trip_through_local_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();

        let mut t = Transport::udp();
        assert!(!t.is_open());
        t.open(addr).await.unwrap();
        assert!(t.is_open());
        t.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        peer.send_to(b"pong", from).await.unwrap();

        let n = t.read(&mut buf, Duration::from_secs(2)).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        t.close().await;
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn read_on_closed_transport_is_not_open() {
        let mut t = Transport::tcp();
        let mut buf = [0u8; 4];
        assert!(matches!(
            t.read(&mut buf, Duration::from_millis(10)).await,
            Err(TransportError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn udp_read_timeout_is_a_server_error() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut t = Transport::udp();
        t.open(peer.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 4];
        let err = t.read(&mut buf, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TransportError::ReadTimeout));
        assert!(!err.is_link_error());
    }

    #[tokio::test]
    async fn secondary_url_falls_back_to_primary() {
        let props = PropertyStore::new(Path::new("/tmp"));
        props.set_string(PROP_COMM_HOST, "127.0.0.1");
        props.set_u32(PROP_COMM_PORT, 9999);
        let mut urls = ServerUrls::new();
        urls.reset(1);
        let addr = urls.resolve(&props).await.unwrap();
        assert_eq!(addr.port(), 9999);
    }

    #[tokio::test]
    async fn missing_host_is_a_link_error() {
        let props = PropertyStore::new(Path::new("/tmp"));
        let mut urls = ServerUrls::new();
        let err = urls.resolve(&props).await.unwrap_err();
        assert!(err.is_link_error());
    }
}
