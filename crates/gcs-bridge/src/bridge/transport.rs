//! Connection establishment to the host.
//!
//! The control channel and every per-process stdio relay are opened by port
//! through a [`Transport`]. The production transport is [`VsockTransport`];
//! tests substitute in-memory or always-failing transports.

use std::future::Future;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::vsock::{HOST_CID, VsockStream};

/// Bidirectional byte stream to the host.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens connections to the host by port.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, port: u32) -> Result<Box<dyn Connection>, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed connecting to host port {port}: {source}")]
    Connect {
        port: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed connecting to host port {port} twice: {source}")]
    ConnectRetry {
        port: u32,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub fn port(&self) -> u32 {
        match self {
            Self::Connect { port, .. } | Self::ConnectRetry { port, .. } => *port,
        }
    }
}

/// Dial `port`, retrying exactly once if the first attempt timed out.
///
/// Host-side listener setup can race the guest's connect, and that race only
/// ever surfaces as `ETIMEDOUT`. Any other error, or a second timeout, is
/// returned immediately.
pub async fn dial_with_retry<C, F, Fut>(port: u32, mut connect: F) -> Result<C, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = io::Result<C>>,
{
    match connect(port).await {
        Ok(conn) => Ok(conn),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            tracing::debug!(port, error = %e, "Dial timed out, retrying once");
            connect(port)
                .await
                .map_err(|source| TransportError::ConnectRetry { port, source })
        }
        Err(source) => Err(TransportError::Connect { port, source }),
    }
}

/// Transport over AF_VSOCK to the host CID.
#[derive(Debug, Clone)]
pub struct VsockTransport {
    cid: u32,
}

impl Default for VsockTransport {
    fn default() -> Self {
        Self { cid: HOST_CID }
    }
}

impl VsockTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for VsockTransport {
    async fn dial(&self, port: u32) -> Result<Box<dyn Connection>, TransportError> {
        tracing::info!(cid = self.cid, port, "vsock dial");
        let cid = self.cid;
        let stream = dial_with_retry(port, |port| VsockStream::connect(cid, port)).await?;
        tracing::info!(cid = self.cid, port, "vsock connected");
        Ok(Box::new(stream))
    }
}
