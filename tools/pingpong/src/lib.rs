//! Ping/pong demo peers.
//!
//! A trivial request/response pair for exercising the relay by hand:
//! the server answers every message with `Pong`, the client sends `Ping`
//! and prints what comes back.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tcptap_relay::{display_text, Inbound, MessageStream};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

/// Request sent by the client.
pub const PING: &[u8] = b"Ping";

/// Reply sent by the server.
pub const PONG: &[u8] = b"Pong";

/// Serve clients one after another, forever.
pub async fn serve(listener: TcpListener) -> Result<()> {
    info!(bind_addr = %listener.local_addr()?, "Listening to connections");

    loop {
        let (stream, peer_addr) = listener.accept().await.context("accept")?;
        info!(peer_addr = %peer_addr, "Got connection");

        let answered = answer_client(stream).await?;
        info!(peer_addr = %peer_addr, answered, "Client disconnected");
    }
}

/// Answer every message from one client with [`PONG`] until it closes.
///
/// Returns the number of messages answered.
pub async fn answer_client(stream: TcpStream) -> Result<u64> {
    let mut stream = MessageStream::new(stream);
    let mut answered = 0;

    loop {
        match stream.read_message().await.context("recv")? {
            Inbound::Message(payload) => {
                info!(message = %display_text(&payload), "Received");
                stream.write_message(PONG).await.context("send")?;
                answered += 1;
            }
            Inbound::Closed => return Ok(answered),
        }
    }
}

/// Send [`PING`] `count` times (0 = forever), waiting `interval` between
/// rounds. Returns the replies.
pub async fn ping(addr: SocketAddr, count: u64, interval: Duration) -> Result<Vec<Vec<u8>>> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    let mut stream = MessageStream::new(stream);
    info!(addr = %addr, "Connected");

    let mut replies = Vec::new();
    let mut sent = 0u64;
    while count == 0 || sent < count {
        stream.write_message(PING).await.context("send")?;
        sent += 1;

        match stream.read_message().await.context("recv")? {
            Inbound::Message(reply) => {
                info!(reply = %display_text(&reply), round = sent, "Received");
                if count != 0 {
                    replies.push(reply);
                }
            }
            Inbound::Closed => bail!("server closed the connection after {sent} pings"),
        }

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    Ok(replies)
}
