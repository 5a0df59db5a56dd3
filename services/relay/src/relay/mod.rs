//! Single-client intercepting relay.
//!
//! This module provides:
//! - The persistent upstream connection
//! - The downstream listener and per-client sessions
//! - Short-read message assembly
//! - The relay state machine that forwards and logs every message
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session <-> Relay loop <-> Upstream -> Server
//!                                       |
//!                                 Transfer sink
//! ```
//!
//! One client is served at a time. A client disconnect sends the relay back
//! to waiting for the next client; an upstream disconnect ends the relay.
//!
//! ## Usage
//!
//! ```ignore
//! use tcptap_relay::{ConsoleSink, Relay, RelayConfig};
//!
//! let config = RelayConfig::new("127.0.0.1", 1024, 1025);
//! let relay = Relay::start(config, Box::new(ConsoleSink::new())).await?;
//! relay.run().await?;
//! ```

mod listener;
mod message;
mod session;
mod upstream;

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

pub use listener::{DownstreamListener, ListenerConfig, DEFAULT_BACKLOG};
pub use message::{
    complete_message, display_text, read_message, Inbound, MessageStream, BUFFER_SIZE,
};
pub use session::DownstreamSession;
pub use upstream::{UpstreamConnection, DEFAULT_CONNECT_TIMEOUT};

use crate::error::RelayError;
use crate::sink::TransferSink;

/// Default cap on upstream messages held while no client is attached.
pub const DEFAULT_MAX_PENDING: usize = 64;

/// Relay state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No client attached; waiting on the listener.
    AwaitingClient,
    /// A client is attached and both sides are monitored.
    Serving,
    /// The client closed; the session is about to be released.
    ClientDisconnected,
    /// The upstream server closed. Terminal.
    ServerDisconnected,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::AwaitingClient => "awaiting_client",
            RelayState::Serving => "serving",
            RelayState::ClientDisconnected => "client_disconnected",
            RelayState::ServerDisconnected => "server_disconnected",
        };
        f.write_str(name)
    }
}

/// What to do with upstream messages that arrive while no client is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterimPolicy {
    /// Queue them and deliver to the next client on attach.
    #[default]
    Buffer,
    /// Log and discard them.
    Drop,
}

impl FromStr for InterimPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buffer" => Ok(Self::Buffer),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown interim policy '{other}' (expected buffer or drop)")),
        }
    }
}

/// Configuration for a relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream server host (name or IPv4 literal).
    pub upstream_host: String,
    /// Upstream server port.
    pub upstream_port: u16,
    /// Downstream listener.
    pub listener: ListenerConfig,
    /// Upstream connect timeout.
    pub connect_timeout: Duration,
    /// Handling of upstream data while no client is attached.
    pub interim_policy: InterimPolicy,
    /// Maximum upstream messages held for the next client.
    pub max_pending: usize,
}

impl RelayConfig {
    /// Create a relay configuration listening on all interfaces.
    pub fn new(upstream_host: impl Into<String>, upstream_port: u16, listen_port: u16) -> Self {
        Self {
            upstream_host: upstream_host.into(),
            upstream_port,
            listener: ListenerConfig::new(listen_port),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            interim_policy: InterimPolicy::default(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// Relay counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Clients accepted.
    pub sessions_accepted: AtomicU64,
    /// Client sessions that ended with a clean close.
    pub sessions_closed: AtomicU64,
    /// Messages forwarded client -> server.
    pub messages_to_server: AtomicU64,
    /// Bytes forwarded client -> server.
    pub bytes_to_server: AtomicU64,
    /// Messages forwarded server -> client.
    pub messages_to_client: AtomicU64,
    /// Bytes forwarded server -> client.
    pub bytes_to_client: AtomicU64,
    /// Upstream messages received with no client attached and held.
    pub interim_held: AtomicU64,
    /// Upstream messages received with no client attached and discarded.
    pub interim_dropped: AtomicU64,
}

impl RelayStats {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Readiness event observed by one step of the loop.
enum Event {
    Accepted(DownstreamSession),
    Client(Inbound),
    Server(Inbound),
}

/// The relay: one listener, one upstream, at most one client.
pub struct Relay {
    listener: DownstreamListener,
    upstream: UpstreamConnection,
    /// The active client, if any.
    session: Option<DownstreamSession>,
    session_span: Span,
    sink: Box<dyn TransferSink>,
    state: watch::Sender<RelayState>,
    interim_policy: InterimPolicy,
    max_pending: usize,
    /// Upstream messages waiting for the next client.
    pending: VecDeque<Vec<u8>>,
    stats: Arc<RelayStats>,
    /// Check the upstream before the client on the next serve step.
    upstream_turn: bool,
}

impl Relay {
    /// Connect upstream, then bind the listener.
    ///
    /// Either failure is returned before any client is accepted.
    pub async fn start(config: RelayConfig, sink: Box<dyn TransferSink>) -> Result<Self, RelayError> {
        let upstream = UpstreamConnection::connect(
            &config.upstream_host,
            config.upstream_port,
            config.connect_timeout,
        )
        .await?;
        let listener = DownstreamListener::bind(&config.listener)?;

        Ok(Self::new(upstream, listener, sink, &config))
    }

    /// Assemble a relay from an established upstream and a bound listener.
    pub fn new(
        upstream: UpstreamConnection,
        listener: DownstreamListener,
        sink: Box<dyn TransferSink>,
        config: &RelayConfig,
    ) -> Self {
        let (state, _) = watch::channel(RelayState::AwaitingClient);

        Self {
            listener,
            upstream,
            session: None,
            session_span: Span::none(),
            sink,
            state,
            interim_policy: config.interim_policy,
            max_pending: config.max_pending.max(1),
            pending: VecDeque::new(),
            stats: Arc::new(RelayStats::default()),
            upstream_turn: false,
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The upstream connection.
    pub fn upstream(&self) -> &UpstreamConnection {
        &self.upstream
    }

    /// Shared counters; stays readable after `run` consumes the relay.
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Current state.
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// Run until the upstream closes or a transport error occurs.
    ///
    /// Only returns on a fatal event.
    pub async fn run(mut self) -> Result<Infallible, RelayError> {
        info!(
            upstream_host = %self.upstream.host(),
            upstream = %self.upstream.remote_addr(),
            listen_addr = ?self.listener.local_addr().ok(),
            "Relay started"
        );

        let err = loop {
            let step = match self.state() {
                RelayState::AwaitingClient => self.await_client().await,
                RelayState::Serving => {
                    let span = self.session_span.clone();
                    self.serve().instrument(span).await
                }
                RelayState::ClientDisconnected => {
                    self.release_session();
                    Ok(())
                }
                RelayState::ServerDisconnected => Err(RelayError::UpstreamClosed),
            };

            if let Err(e) = step {
                break e;
            }
        };

        error!(reason = err.reason_code(), error = %err, "Relay stopped");
        self.log_stats();
        Err(err)
    }

    /// Wait for a client while still watching the upstream.
    async fn await_client(&mut self) -> Result<(), RelayError> {
        let upstream = self.upstream.stream_mut();
        let event = tokio::select! {
            biased;
            accepted = self.listener.accept() => Event::Accepted(accepted?),
            first = upstream.read_first() => {
                Event::Server(finish_read(upstream, first, "recv from server").await?)
            }
        };

        self.handle(event).await
    }

    /// One readiness check over both sides.
    ///
    /// The client is checked first, except right after a client message was
    /// forwarded: then the server goes first, so a client that keeps the
    /// socket readable cannot starve the upstream.
    async fn serve(&mut self) -> Result<(), RelayError> {
        let Some(session) = self.session.as_mut() else {
            self.transition(RelayState::AwaitingClient);
            return Ok(());
        };
        let client = session.stream_mut();
        let upstream = self.upstream.stream_mut();

        let event = if self.upstream_turn {
            tokio::select! {
                biased;
                first = upstream.read_first() => {
                    Event::Server(finish_read(upstream, first, "recv from server").await?)
                }
                first = client.read_first() => {
                    Event::Client(finish_read(client, first, "recv from client").await?)
                }
            }
        } else {
            tokio::select! {
                biased;
                first = client.read_first() => {
                    Event::Client(finish_read(client, first, "recv from client").await?)
                }
                first = upstream.read_first() => {
                    Event::Server(finish_read(upstream, first, "recv from server").await?)
                }
            }
        };

        self.upstream_turn = matches!(event, Event::Client(Inbound::Message(_)));
        self.handle(event).await
    }

    async fn handle(&mut self, event: Event) -> Result<(), RelayError> {
        match event {
            Event::Accepted(session) => self.attach(session).await,
            Event::Client(Inbound::Message(payload)) => self.client_to_server(&payload).await,
            Event::Client(Inbound::Closed) => {
                self.transition(RelayState::ClientDisconnected);
                Ok(())
            }
            Event::Server(Inbound::Message(payload)) => self.server_to_client(payload).await,
            Event::Server(Inbound::Closed) => {
                self.sink.log("connection to server is ended");
                warn!(upstream = %self.upstream.remote_addr(), "Upstream closed the connection");
                self.transition(RelayState::ServerDisconnected);
                Ok(())
            }
        }
    }

    async fn attach(&mut self, session: DownstreamSession) -> Result<(), RelayError> {
        let peer_addr = session.peer_addr();
        self.session_span = info_span!("session", seq = session.seq(), peer = %peer_addr);
        self.session = Some(session);
        RelayStats::bump(&self.stats.sessions_accepted, 1);

        self.sink.log(&format!("client connected: {peer_addr}"));
        self.session_span.in_scope(|| info!("Client attached"));
        self.transition(RelayState::Serving);

        let span = self.session_span.clone();
        self.flush_pending().instrument(span).await
    }

    /// Deliver held upstream messages to the freshly attached client.
    async fn flush_pending(&mut self) -> Result<(), RelayError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        debug!(held = self.pending.len(), "Delivering held upstream messages");
        while let Some(payload) = self.pending.pop_front() {
            session
                .write_message(&payload)
                .await
                .map_err(|e| RelayError::io("send to client", e))?;
            RelayStats::bump(&self.stats.messages_to_client, 1);
            RelayStats::bump(&self.stats.bytes_to_client, payload.len() as u64);
            self.sink
                .log(&format!("forwarded to client: {}", display_text(&payload)));
        }
        Ok(())
    }

    async fn client_to_server(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        let text = display_text(payload);
        self.sink.log(&format!("received from client: {text}"));

        self.upstream
            .write_message(payload)
            .await
            .map_err(|e| RelayError::io("send to server", e))?;

        RelayStats::bump(&self.stats.messages_to_server, 1);
        RelayStats::bump(&self.stats.bytes_to_server, payload.len() as u64);
        self.sink.log(&format!("forwarded to server: {text}"));
        debug!(bytes = payload.len(), "Forwarded client message");
        Ok(())
    }

    async fn server_to_client(&mut self, payload: Vec<u8>) -> Result<(), RelayError> {
        let text = display_text(&payload).into_owned();
        self.sink.log(&format!("received from server: {text}"));

        let Some(session) = self.session.as_mut() else {
            self.hold_interim(payload, &text);
            return Ok(());
        };

        session
            .write_message(&payload)
            .await
            .map_err(|e| RelayError::io("send to client", e))?;

        RelayStats::bump(&self.stats.messages_to_client, 1);
        RelayStats::bump(&self.stats.bytes_to_client, payload.len() as u64);
        self.sink.log(&format!("forwarded to client: {text}"));
        debug!(bytes = payload.len(), "Forwarded server message");
        Ok(())
    }

    /// Apply the interim policy to an upstream message with no client attached.
    fn hold_interim(&mut self, payload: Vec<u8>, text: &str) {
        match self.interim_policy {
            InterimPolicy::Drop => {
                RelayStats::bump(&self.stats.interim_dropped, 1);
                self.sink.log(&format!("dropped, no client attached: {text}"));
                debug!(bytes = payload.len(), "Dropped upstream message, no client");
            }
            InterimPolicy::Buffer => {
                if self.pending.len() >= self.max_pending {
                    if let Some(oldest) = self.pending.pop_front() {
                        RelayStats::bump(&self.stats.interim_dropped, 1);
                        self.sink.log(&format!(
                            "dropped, pending queue full: {}",
                            display_text(&oldest)
                        ));
                        warn!(max_pending = self.max_pending, "Pending queue full, dropped oldest");
                    }
                }
                RelayStats::bump(&self.stats.interim_held, 1);
                self.sink.log(&format!("held for next client: {text}"));
                self.pending.push_back(payload);
            }
        }
    }

    fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.sink.log("client disconnected");
            self.session_span.in_scope(|| {
                info!(peer_addr = %session.peer_addr(), "Client disconnected");
            });
            RelayStats::bump(&self.stats.sessions_closed, 1);
            self.log_stats();
        }
        self.session_span = Span::none();
        self.upstream_turn = false;
        self.transition(RelayState::AwaitingClient);
    }

    fn transition(&self, next: RelayState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "State change");
        }
    }

    fn log_stats(&self) {
        let stats = &self.stats;
        info!(
            sessions_accepted = RelayStats::get(&stats.sessions_accepted),
            sessions_closed = RelayStats::get(&stats.sessions_closed),
            messages_to_server = RelayStats::get(&stats.messages_to_server),
            bytes_to_server = RelayStats::get(&stats.bytes_to_server),
            messages_to_client = RelayStats::get(&stats.messages_to_client),
            bytes_to_client = RelayStats::get(&stats.bytes_to_client),
            interim_held = RelayStats::get(&stats.interim_held),
            interim_dropped = RelayStats::get(&stats.interim_dropped),
            "Relay stats"
        );
    }
}

/// Complete a message whose first read already resolved.
async fn finish_read(
    stream: &mut MessageStream<TcpStream>,
    first: io::Result<usize>,
    op: &'static str,
) -> Result<Inbound, RelayError> {
    let first = first.map_err(|e| RelayError::io(op, e))?;
    stream.finish(first).await.map_err(|e| RelayError::io(op, e))
}
