//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Step of listener setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStep {
    Socket,
    SetSockOpt,
    Bind,
    Listen,
}

impl std::fmt::Display for BindStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BindStep::Socket => "socket",
            BindStep::SetSockOpt => "setsockopt",
            BindStep::Bind => "bind",
            BindStep::Listen => "listen",
        };
        f.write_str(name)
    }
}

/// Relay errors. Every variant is fatal to the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Upstream address lookup failed or produced no IPv4 endpoint.
    #[error("getaddrinfo {target}: {reason}")]
    Resolution { target: String, reason: String },

    /// Listener setup failed.
    #[error("{step} {addr}: {source}")]
    Bind {
        step: BindStep,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Outbound connect to the upstream server failed.
    #[error("connect {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Transport failure while accepting, reading or writing.
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The upstream server closed its side of the connection.
    #[error("connection to server is ended")]
    UpstreamClosed,
}

impl RelayError {
    /// Wrap a transport error with the operation that raised it.
    pub fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Resolution { .. } => "resolution_failed",
            RelayError::Bind { .. } => "bind_failed",
            RelayError::Connect { .. } => "connect_failed",
            RelayError::Io { .. } => "io_error",
            RelayError::UpstreamClosed => "upstream_closed",
        }
    }
}
