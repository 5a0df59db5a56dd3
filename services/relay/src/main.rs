//! tcptap
//!
//! Intercepting TCP relay for one client at a time.
//!
//! This binary:
//! - Connects once to the real server given on the command line
//! - Listens for clients on the relay port
//! - Forwards every message verbatim in both directions
//! - Logs each transfer to the console or an append-only file

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcptap_relay::{Config, ConsoleSink, FileSink, Relay, SinkKind, TransferSink};

/// Intercepting TCP relay.
#[derive(Debug, Parser)]
#[command(name = "tcptap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address of the real server (host name or IPv4 address).
    server_address: String,
}

#[tokio::main]
async fn main() {
    // Wrong arguments are a usage notice, not a failure.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(0);
        }
    };

    if let Err(e) = run(cli).await {
        eprintln!("tcptap: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env(&cli.server_address)?;

    // Initialize tracing (prefer RUST_LOG, fallback to TCPTAP_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    info!("Starting tcptap relay");
    info!(
        upstream_host = %config.relay.upstream_host,
        upstream_port = config.relay.upstream_port,
        listen_addr = %config.relay.listener.bind_addr,
        sink = ?config.sink,
        interim_policy = ?config.relay.interim_policy,
        "Configuration loaded"
    );

    let sink: Box<dyn TransferSink> = match config.sink {
        SinkKind::Console => Box::new(ConsoleSink::new()),
        SinkKind::File => {
            let sink = FileSink::open(&config.log_file)
                .map_err(|e| anyhow!("open {}: {e}", config.log_file.display()))?;
            Box::new(sink)
        }
    };

    let relay = match Relay::start(config.relay.clone(), sink).await {
        Ok(relay) => relay,
        Err(e) => {
            error!(reason = e.reason_code(), error = %e, "Relay startup failed");
            return Err(e.into());
        }
    };

    tokio::select! {
        Err(e) = relay.run() => return Err(e.into()),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}
