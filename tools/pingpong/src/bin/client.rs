//! Demo downstream client: sends `Ping` through the relay.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcptap_relay::DEFAULT_LISTEN_PORT;

/// Ping/pong demo client.
#[derive(Debug, Parser)]
#[command(name = "pingpong-client")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay (or server) address.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    addr: IpAddr,

    /// Relay (or server) port.
    #[arg(long, default_value_t = DEFAULT_LISTEN_PORT)]
    port: u16,

    /// Number of pings to send (0 = until interrupted).
    #[arg(long, default_value_t = 5)]
    count: u64,

    /// Delay between pings in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    let addr = SocketAddr::new(args.addr, args.port);
    let replies = tcptap_pingpong::ping(addr, args.count, Duration::from_millis(args.interval_ms)).await?;
    info!(replies = replies.len(), "Done");

    Ok(())
}
