//! Message assembly over raw byte streams.
//!
//! The relay performs no framing. A message is whatever arrives in a run of
//! reads that ends with a short read: reads of up to [`BUFFER_SIZE`] bytes
//! are appended to an accumulator until one returns fewer bytes than the
//! buffer holds.
//!
//! Known limitation: a message whose length is an exact multiple of
//! [`BUFFER_SIZE`] waits for the next read to complete, so it may be merged
//! with whatever the peer sends next. Two small writes that land in the
//! same read are likewise logged as one message. The bytes forwarded are
//! unaffected; only the logged boundaries are.

use std::borrow::Cow;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read buffer capacity for a single read call.
pub const BUFFER_SIZE: usize = 512;

/// Outcome of reading one message from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete, non-empty message.
    Message(Vec<u8>),
    /// The peer closed its write side before sending anything further.
    Closed,
}

/// Read one message from `reader` using `buf` as the read buffer.
pub async fn read_message<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<Inbound>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read(buf).await?;
    complete_message(reader, buf, first).await
}

/// Finish a message whose first read of `first` bytes already landed in `buf`.
///
/// Keeps reading while the previous read filled the whole buffer.
pub async fn complete_message<R>(reader: &mut R, buf: &mut [u8], first: usize) -> io::Result<Inbound>
where
    R: AsyncRead + Unpin,
{
    debug_assert!(!buf.is_empty());

    if first == 0 {
        return Ok(Inbound::Closed);
    }

    let mut message = buf[..first].to_vec();
    let mut last = first;
    while last == buf.len() {
        last = reader.read(buf).await?;
        message.extend_from_slice(&buf[..last]);
    }

    Ok(Inbound::Message(message))
}

/// Render a payload for the transfer log.
pub fn display_text(payload: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(payload)
}

/// A byte stream with the read/write shape shared by both relay sides.
#[derive(Debug)]
pub struct MessageStream<S> {
    stream: S,
    buf: Box<[u8]>,
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream with a [`BUFFER_SIZE`] read buffer.
    pub fn new(stream: S) -> Self {
        Self::with_capacity(stream, BUFFER_SIZE)
    }

    /// Wrap a stream with a custom read buffer size.
    pub fn with_capacity(stream: S, capacity: usize) -> Self {
        Self {
            stream,
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
        }
    }

    /// Wait for the first read of the next message.
    ///
    /// This is cancel safe: if the future is dropped before completing, no
    /// bytes have been consumed from the stream.
    pub async fn read_first(&mut self) -> io::Result<usize> {
        self.stream.read(&mut self.buf).await
    }

    /// Complete a message started by [`MessageStream::read_first`].
    pub async fn finish(&mut self, first: usize) -> io::Result<Inbound> {
        complete_message(&mut self.stream, &mut self.buf, first).await
    }

    /// Read one complete message.
    pub async fn read_message(&mut self) -> io::Result<Inbound> {
        let first = self.read_first().await?;
        self.finish(first).await
    }

    /// Write a message verbatim.
    pub async fn write_message(&mut self, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(payload).await?;
        self.stream.flush().await
    }

    /// Access the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}
