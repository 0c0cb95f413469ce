//! RFCOMM Connection Module
//!
//! The OS owns pairing and radio management. This module only describes the
//! endpoint to reach and opens a duplex byte stream to it through an
//! injected [`RfcommConnector`].

use crate::domain::models::format_address;
use crate::infrastructure::bluetooth::protocol::RFCOMM_CHANNEL;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

/// Duplex byte stream to the headset
pub trait RfcommStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RfcommStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn RfcommStream>;

/// Where to reach a headset's serial service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfcommEndpoint {
    pub address: u64,
    pub channel: u8,
}

impl RfcommEndpoint {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            channel: RFCOMM_CHANNEL,
        }
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }
}

impl std::fmt::Display for RfcommEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ch {}", format_address(self.address), self.channel)
    }
}

/// Opens the stream for an endpoint
#[async_trait]
pub trait RfcommConnector: Send + Sync {
    async fn open(&self, endpoint: &RfcommEndpoint) -> io::Result<BoxedStream>;
}

/// Opens an RFCOMM TTY that the OS has already bound to the headset
/// (`rfcomm bind /dev/rfcomm0 <address> 8`)
#[derive(Debug, Clone)]
pub struct TtyConnector {
    path: PathBuf,
}

impl TtyConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RfcommConnector for TtyConnector {
    async fn open(&self, endpoint: &RfcommEndpoint) -> io::Result<BoxedStream> {
        info!("Opening {} for {}", self.path.display(), endpoint);
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        Ok(Box::new(file))
    }
}

/// Connects to a TCP bridge that forwards the headset's serial channel
#[derive(Debug, Clone)]
pub struct TcpBridgeConnector {
    addr: String,
}

impl TcpBridgeConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl RfcommConnector for TcpBridgeConnector {
    async fn open(&self, endpoint: &RfcommEndpoint) -> io::Result<BoxedStream> {
        info!("Connecting to bridge {} for {}", self.addr, endpoint);
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_endpoint_defaults_to_headset_channel() {
        let endpoint = RfcommEndpoint::new(0x04_52_C7_AA_BB_CC);
        assert_eq!(endpoint.channel, 8);
        assert_eq!(endpoint.to_string(), "04:52:C7:AA:BB:CC ch 8");
        assert_eq!(endpoint.with_channel(3).channel, 3);
    }

    #[tokio::test]
    async fn test_tcp_bridge_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&[0x00, 0x01, 0x03, 0x00]).await.unwrap();
            buf
        });

        let connector = TcpBridgeConnector::new(addr.to_string());
        let mut stream = connector
            .open(&RfcommEndpoint::new(1))
            .await
            .unwrap();
        stream.write_all(&[0x00, 0x01, 0x01, 0x00]).await.unwrap();

        let mut ack = [0u8; 4];
        stream.read_exact(&mut ack).await.unwrap();

        assert_eq!(server.await.unwrap(), [0x00, 0x01, 0x01, 0x00]);
        assert_eq!(ack, [0x00, 0x01, 0x03, 0x00]);
    }

    #[tokio::test]
    async fn test_tty_connector_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let connector = TtyConnector::new(dir.path().join("rfcomm-missing"));
        assert!(connector.open(&RfcommEndpoint::new(1)).await.is_err());
    }
}
