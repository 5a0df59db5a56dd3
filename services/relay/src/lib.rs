//! tcptap relay
//!
//! Single-client intercepting TCP relay. Forwards raw bytes between one
//! downstream client and one persistent upstream server, reporting every
//! transfer to a pluggable [`TransferSink`].

pub mod config;
pub mod error;
pub mod relay;
pub mod sink;

pub use config::{Config, SinkKind, DEFAULT_LISTEN_PORT, DEFAULT_LOG_FILE, DEFAULT_UPSTREAM_PORT};
pub use error::{BindStep, RelayError};
pub use relay::{
    display_text, DownstreamListener, DownstreamSession, Inbound, InterimPolicy, ListenerConfig,
    MessageStream, Relay, RelayConfig, RelayState, RelayStats, UpstreamConnection, BUFFER_SIZE,
};
pub use sink::{ConsoleSink, FileSink, TransferSink};
