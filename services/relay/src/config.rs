//! Relay configuration.
//!
//! The upstream host comes from the command line; everything else has a
//! compiled-in default that can be overridden from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::relay::{InterimPolicy, RelayConfig, DEFAULT_MAX_PENDING};

/// Port of the real server.
pub const DEFAULT_UPSTREAM_PORT: u16 = 1024;

/// Port the relay listens on for clients.
pub const DEFAULT_LISTEN_PORT: u16 = 1025;

/// Transfer log file used by the file sink.
pub const DEFAULT_LOG_FILE: &str = "log.txt";

/// Which transfer sink the binary installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkKind {
    /// `[relay]: ...` lines on stdout.
    Console,
    /// Timestamped lines appended to a file.
    #[default]
    File,
}

impl FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(Self::Console),
            "file" => Ok(Self::File),
            other => bail!("unknown log sink '{other}' (expected console or file)"),
        }
    }
}

/// Relay binary configuration (CLI + env).
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay engine settings.
    pub relay: RelayConfig,

    /// Transfer sink selection.
    pub sink: SinkKind,

    /// Transfer log path for the file sink.
    pub log_file: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env(upstream_host: &str) -> Result<Self> {
        Self::from_lookup(upstream_host, |key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` to read variables.
    pub fn from_lookup<F>(upstream_host: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let upstream_port: u16 = lookup("TCPTAP_UPSTREAM_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("TCPTAP_UPSTREAM_PORT must be a port number.")?
            .unwrap_or(DEFAULT_UPSTREAM_PORT);

        let listen_port: u16 = lookup("TCPTAP_LISTEN_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("TCPTAP_LISTEN_PORT must be a port number.")?
            .unwrap_or(DEFAULT_LISTEN_PORT);

        let connect_timeout_ms: u64 = lookup("TCPTAP_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("TCPTAP_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(5000);

        let interim_policy: InterimPolicy = lookup("TCPTAP_INTERIM_POLICY")
            .map(|v| v.parse::<InterimPolicy>().map_err(anyhow::Error::msg))
            .transpose()
            .context("TCPTAP_INTERIM_POLICY must be buffer or drop.")?
            .unwrap_or_default();

        let max_pending: usize = lookup("TCPTAP_MAX_PENDING")
            .map(|v| v.parse())
            .transpose()
            .context("TCPTAP_MAX_PENDING must be an integer.")?
            .unwrap_or(DEFAULT_MAX_PENDING)
            .clamp(1, 4096);

        let sink: SinkKind = lookup("TCPTAP_LOG_SINK")
            .map(|v| v.parse::<SinkKind>())
            .transpose()?
            .unwrap_or_default();

        let log_file = lookup("TCPTAP_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));

        let log_level = lookup("TCPTAP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let mut relay = RelayConfig::new(upstream_host, upstream_port, listen_port);
        relay.connect_timeout = Duration::from_millis(connect_timeout_ms.max(100));
        relay.interim_policy = interim_policy;
        relay.max_pending = max_pending;

        Ok(Self {
            relay,
            sink,
            log_file,
            log_level,
        })
    }
}
