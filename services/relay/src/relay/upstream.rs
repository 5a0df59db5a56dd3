//! Upstream connection to the real server.
//!
//! The relay owns exactly one upstream connection for its whole lifetime.
//! It is established once at startup and never re-established: losing it
//! ends the relay.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use super::message::{Inbound, MessageStream};
use crate::error::RelayError;

/// Default connect timeout for the upstream connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent outbound connection to the upstream server.
#[derive(Debug)]
pub struct UpstreamConnection {
    /// Host as given by the operator.
    host: String,
    /// Resolved IPv4 endpoint.
    remote_addr: SocketAddr,
    /// Open stream.
    stream: MessageStream<TcpStream>,
}

impl UpstreamConnection {
    /// Resolve `host:port` to an IPv4 endpoint and connect to it.
    ///
    /// A single attempt is made; there is no retry.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let remote_addr = resolve_ipv4(host, port).await?;
        debug!(host = %host, remote_addr = %remote_addr, "Connecting to upstream");

        let stream = match timeout(connect_timeout, TcpStream::connect(remote_addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
        .map_err(|source| RelayError::Connect {
            addr: remote_addr,
            source,
        })?;

        info!(host = %host, remote_addr = %remote_addr, "Connected to upstream");

        Ok(Self {
            host: host.to_string(),
            remote_addr,
            stream: MessageStream::new(stream),
        })
    }

    /// Host as given at connect time.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolved remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local address of the connection. Stable for the relay lifetime.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.get_ref().local_addr()
    }

    /// Read one complete message from the server.
    pub async fn read_message(&mut self) -> io::Result<Inbound> {
        self.stream.read_message().await
    }

    /// Write a message to the server verbatim.
    pub async fn write_message(&mut self, payload: &[u8]) -> io::Result<()> {
        self.stream.write_message(payload).await
    }

    pub(crate) fn stream_mut(&mut self) -> &mut MessageStream<TcpStream> {
        &mut self.stream
    }
}

/// Resolve `host:port`, keeping the first IPv4 candidate.
async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr, RelayError> {
    let target = format!("{host}:{port}");

    let mut candidates = lookup_host((host, port))
        .await
        .map_err(|e| RelayError::Resolution {
            target: target.clone(),
            reason: e.to_string(),
        })?;

    candidates
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| RelayError::Resolution {
            target,
            reason: "no IPv4 address".to_string(),
        })
}
