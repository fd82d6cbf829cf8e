//! One direction of a relay: source -> rendezvous queue -> destination.
//!
//! A pump reads chunks from its source and hands each one to its writer over a
//! queue of capacity one, so at most one chunk is ever in flight and the source is
//! never read faster than the destination drains. When the source ends (or either
//! side fails) the destination is half-closed: a raw stream gets its write half shut
//! down, a framed link gets a single `EndOfStream`.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::rtun::{
    telemetry,
    tunnel::protocol::{self, FramedWriter, Message, ProtocolError},
};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("read: {0}")]
    Read(#[source] std::io::Error),
    #[error("write: {0}")]
    Write(#[source] std::io::Error),
    #[error("link: {0}")]
    Link(#[from] ProtocolError),
    #[error("link closed before end of stream")]
    LinkClosed,
    #[error("pump task: {0}")]
    Task(String),
}

impl PumpError {
    /// True when the failure happened on a framed link, which is then unusable.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, PumpError::Link(_) | PumpError::LinkClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> service
    Ingress,
    /// service -> client
    Egress,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, or `None` on orderly end of input.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, PumpError>;

    /// Whether the source must be read to its end even after the destination failed.
    ///
    /// Framed links carry one stream after another, so abandoning one mid-stream would
    /// leave the next reader out of frame alignment.
    fn drains_on_error(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), PumpError>;

    /// Closes the write direction only.
    async fn close_write(&mut self) -> Result<(), PumpError>;
}

/// Unframed byte stream read in bounded chunks.
pub struct RawSource<R> {
    r: R,
    buf: Vec<u8>,
}

impl<R> RawSource<R> {
    /// Chunks never exceed `MAX_DATA_PAYLOAD`, whatever `chunk_size` asks for, so every
    /// chunk fits in one `Data` frame the peer accepts.
    pub fn new(r: R, chunk_size: usize) -> Self {
        Self {
            r,
            buf: vec![0u8; chunk_size.clamp(1, protocol::MAX_DATA_PAYLOAD as usize)],
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ChunkSource for RawSource<R> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, PumpError> {
        loop {
            match self.r.read(&mut self.buf).await {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(Bytes::copy_from_slice(&self.buf[..n]))),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(PumpError::Read(err)),
            }
        }
    }
}

/// Unframed byte stream; closing shuts down its write half.
pub struct RawSink<W> {
    w: W,
}

impl<W> RawSink<W> {
    pub fn new(w: W) -> Self {
        Self { w }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkSink for RawSink<W> {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), PumpError> {
        self.w.write_all(&chunk).await.map_err(PumpError::Write)?;
        self.w.flush().await.map_err(PumpError::Write)
    }

    async fn close_write(&mut self) -> Result<(), PumpError> {
        self.w.shutdown().await.map_err(PumpError::Write)
    }
}

/// Read side of a framed link: yields `Data` payloads until `EndOfStream`.
pub struct FramedSource<R> {
    r: R,
}

impl<R> FramedSource<R> {
    pub fn new(r: R) -> Self {
        Self { r }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ChunkSource for FramedSource<R> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, PumpError> {
        loop {
            match protocol::read_message(&mut self.r).await {
                Ok(Message::Data(payload)) => return Ok(Some(payload)),
                // Reserved for liveness checks; carries nothing for the relay.
                Ok(Message::HeartBeat) => continue,
                Ok(Message::EndOfStream) => return Ok(None),
                Err(err) if err.is_closed() => return Err(PumpError::LinkClosed),
                Err(err) => return Err(PumpError::Link(err)),
            }
        }
    }

    fn drains_on_error(&self) -> bool {
        true
    }
}

/// Write side of a framed link: wraps chunks as `Data`, closes with `EndOfStream`.
///
/// Built on a clone of the link's `FramedWriter`, so anything else writing to the same
/// link goes through the same lock.
pub struct FramedSink<W> {
    w: FramedWriter<W>,
}

impl<W> FramedSink<W> {
    pub fn new(w: FramedWriter<W>) -> Self {
        Self { w }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkSink for FramedSink<W> {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), PumpError> {
        self.w.send(&Message::Data(chunk)).await?;
        Ok(())
    }

    async fn close_write(&mut self) -> Result<(), PumpError> {
        self.w.send(&Message::EndOfStream).await?;
        Ok(())
    }
}

/// A source whose first result was taken before its pump started, for example while
/// waiting for the other end of the round to show up. That result is replayed first.
pub struct Primed<S> {
    first: Option<Result<Option<Bytes>, PumpError>>,
    inner: S,
}

impl<S> Primed<S> {
    pub fn new(inner: S) -> Self {
        Self { first: None, inner }
    }

    pub fn with_first(inner: S, first: Result<Option<Bytes>, PumpError>) -> Self {
        Self {
            first: Some(first),
            inner,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: ChunkSource> ChunkSource for Primed<S> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, PumpError> {
        match self.first.take() {
            Some(first) => first,
            None => self.inner.next_chunk().await,
        }
    }

    fn drains_on_error(&self) -> bool {
        self.inner.drains_on_error()
    }
}

/// Result of one finished direction. The source is handed back so the read side of a
/// healthy framed link can be reused by the next session; its write side is shared
/// through `FramedWriter` and never leaves the link.
pub struct PumpOutcome<S> {
    pub source: S,
    /// Bytes accepted by the destination.
    pub bytes: u64,
    pub source_error: Option<PumpError>,
    pub sink_error: Option<PumpError>,
}

impl<S> PumpOutcome<S> {
    pub fn is_clean(&self) -> bool {
        self.source_error.is_none() && self.sink_error.is_none()
    }

    /// First error observed, source side first.
    pub fn error(&self) -> Option<&PumpError> {
        self.source_error.as_ref().or(self.sink_error.as_ref())
    }

    pub fn link_failed(&self) -> bool {
        self.source_error.as_ref().is_some_and(PumpError::is_link_failure)
            || self.sink_error.as_ref().is_some_and(PumpError::is_link_failure)
    }
}

pub struct Pump<S, K> {
    direction: Direction,
    source: S,
    sink: K,
}

impl<S, K> Pump<S, K>
where
    S: ChunkSource,
    K: ChunkSink,
{
    pub fn new(direction: Direction, source: S, sink: K) -> Self {
        Self {
            direction,
            source,
            sink,
        }
    }

    pub async fn run(self) -> PumpOutcome<S> {
        let Pump {
            direction,
            mut source,
            mut sink,
        } = self;

        let drain = source.drains_on_error();
        let (tx, mut rx) = mpsc::channel::<Bytes>(1);

        let reader = {
            let source = &mut source;
            async move {
                loop {
                    let next = tokio::select! {
                        biased;
                        // Raw reads are cancel-safe, so a dead writer can stop them early.
                        _ = tx.closed(), if !drain => return None,
                        next = source.next_chunk() => next,
                    };
                    match next {
                        Ok(Some(chunk)) => {
                            if tx.send(chunk).await.is_err() {
                                return None;
                            }
                        }
                        Ok(None) => return None,
                        Err(err) => return Some(err),
                    }
                }
            }
        };

        let writer = {
            let sink = &mut sink;
            async move {
                let mut bytes = 0u64;
                let mut failed: Option<PumpError> = None;
                while let Some(chunk) = rx.recv().await {
                    if failed.is_some() {
                        // Draining: keep the framed source moving, drop the payload.
                        continue;
                    }
                    let n = chunk.len() as u64;
                    match sink.write_chunk(chunk).await {
                        Ok(()) => bytes += n,
                        Err(err) => {
                            failed = Some(err);
                            if !drain {
                                break;
                            }
                        }
                    }
                }
                drop(rx);

                // Half-close happens even after a failure so the peer direction is not
                // left waiting for an end that never comes.
                let closed = sink.close_write().await;
                if failed.is_none() {
                    failed = closed.err();
                }
                (bytes, failed)
            }
        };

        let (source_error, (bytes, sink_error)) = tokio::join!(reader, writer);

        let counter = match direction {
            Direction::Ingress => telemetry::BYTES_INGRESS_TOTAL,
            Direction::Egress => telemetry::BYTES_EGRESS_TOTAL,
        };
        metrics::counter!(counter).increment(bytes);
        tracing::trace!(direction = %direction, bytes, "pump: finished");

        PumpOutcome {
            source,
            bytes,
            source_error,
            sink_error,
        }
    }
}
