//! Downstream listener.
//!
//! Binds the proxy port and hands out one [`DownstreamSession`] per accept.
//! The listener keeps no client state between accepts.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, info};

use super::session::DownstreamSession;
use crate::error::{BindStep, RelayError};

/// Default pending-connection backlog. Clients beyond the active one queue here.
pub const DEFAULT_BACKLOG: u32 = 16;

/// Configuration for the downstream listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddrV4,
    /// Listen backlog.
    pub backlog: u32,
}

impl ListenerConfig {
    /// Listen on all IPv4 interfaces at `port`.
    pub fn new(port: u16) -> Self {
        Self::with_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    /// Listen on a specific IPv4 address.
    pub fn with_addr(bind_addr: SocketAddrV4) -> Self {
        Self {
            bind_addr,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Bound, listening socket for downstream clients.
#[derive(Debug)]
pub struct DownstreamListener {
    listener: TcpListener,
    /// Number of sessions handed out so far.
    accepted: u64,
}

impl DownstreamListener {
    /// Bind and listen with `SO_REUSEADDR` set.
    pub fn bind(config: &ListenerConfig) -> Result<Self, RelayError> {
        let addr = SocketAddr::V4(config.bind_addr);
        let fail =
            move |step: BindStep| move |source: io::Error| RelayError::Bind { step, addr, source };

        let socket = TcpSocket::new_v4().map_err(fail(BindStep::Socket))?;
        socket
            .set_reuseaddr(true)
            .map_err(fail(BindStep::SetSockOpt))?;
        socket.bind(addr).map_err(fail(BindStep::Bind))?;
        let listener = socket.listen(config.backlog).map_err(fail(BindStep::Listen))?;

        info!(
            bind_addr = %listener.local_addr().unwrap_or(addr),
            backlog = config.backlog,
            "Listener bound"
        );

        Ok(Self {
            listener,
            accepted: 0,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for the next client. No timeout.
    ///
    /// Cancel safe: a dropped accept future loses no pending connection.
    pub async fn accept(&mut self) -> Result<DownstreamSession, RelayError> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| RelayError::io("accept", e))?;

        self.accepted += 1;
        debug!(peer_addr = %peer_addr, session = self.accepted, "Accepted client");

        Ok(DownstreamSession::new(stream, peer_addr, self.accepted))
    }
}
