//! Downstream client session.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

use super::message::{Inbound, MessageStream};

/// One accepted client connection. Closed when dropped.
#[derive(Debug)]
pub struct DownstreamSession {
    peer_addr: SocketAddr,
    /// 1-based accept sequence number.
    seq: u64,
    stream: MessageStream<TcpStream>,
}

impl DownstreamSession {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr, seq: u64) -> Self {
        Self {
            peer_addr,
            seq,
            stream: MessageStream::new(stream),
        }
    }

    /// Address of the connected client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Accept sequence number of this session.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Read one complete message from the client.
    pub async fn read_message(&mut self) -> io::Result<Inbound> {
        self.stream.read_message().await
    }

    /// Write a message to the client verbatim.
    pub async fn write_message(&mut self, payload: &[u8]) -> io::Result<()> {
        self.stream.write_message(payload).await
    }

    pub(crate) fn stream_mut(&mut self) -> &mut MessageStream<TcpStream> {
        &mut self.stream
    }
}
