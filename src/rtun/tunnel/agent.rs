use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::sync::watch;

use crate::rtun::{
    telemetry::{self, AgentStatus},
    tunnel::{
        protocol::FramedWriter,
        pump::{
            ChunkSource, Direction, FramedSink, FramedSource, Primed, Pump, PumpError, RawSink,
            RawSource,
        },
        session::Session,
        transport::{
            BoxedStream, DialOptions, StreamReader, StreamWriter, Transport, transport_by_name,
        },
    },
};

/// Bytes held back from a service that speaks before the round has opened.
const GREETING_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub service_addr: String,
    pub tunnel_addr: String,
    /// Local address the tunnel connection originates from.
    pub bind_addr: Option<SocketAddr>,
    pub transport: String,
    pub chunk_size: usize,
    pub dial_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

/// Exponential wait between failed dial attempts. A zero initial delay never waits.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// The agent's end of the tunnel link, kept across rounds while it stays aligned.
struct TunnelLink {
    source: FramedSource<StreamReader>,
    writer: FramedWriter<StreamWriter>,
}

impl TunnelLink {
    fn new(stream: BoxedStream) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            source: FramedSource::new(r),
            writer: FramedWriter::new(w),
        }
    }
}

struct ServiceConn {
    reader: RawSource<StreamReader>,
    writer: StreamWriter,
}

impl ServiceConn {
    fn new(stream: BoxedStream, chunk_size: usize) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: RawSource::new(r, chunk_size),
            writer: w,
        }
    }
}

/// What ended one wait of an idle round.
enum Idle {
    Opened(Result<Option<Bytes>, PumpError>),
    Service(Result<Option<Bytes>, PumpError>),
    Redialed(BoxedStream),
}

pub struct Agent {
    opts: AgentOptions,
    transport: Arc<dyn Transport>,
    status: watch::Sender<AgentStatus>,
}

impl Agent {
    pub fn new(opts: AgentOptions) -> anyhow::Result<Self> {
        let transport = transport_by_name(&opts.transport)?;
        Ok(Self::with_transport(opts, transport))
    }

    pub fn with_transport(opts: AgentOptions, transport: Arc<dyn Transport>) -> Self {
        let (status, _) = watch::channel(AgentStatus {
            service_addr: opts.service_addr.clone(),
            tunnel_addr: opts.tunnel_addr.clone(),
            ..Default::default()
        });
        Self {
            opts,
            transport,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    /// Dials both endpoints, then relays one round after another until shutdown.
    ///
    /// Only the first pair of dials is fatal. Every later round redials whatever it
    /// lost and keeps retrying.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let service = self.dial_service().await.context("agent: service")?;
        let tunnel = self.dial_tunnel().await.context("agent: tunnel")?;
        tracing::info!(
            service = %self.opts.service_addr,
            tunnel = %self.opts.tunnel_addr,
            transport = %self.transport.name(),
            "agent: connected"
        );
        self.status.send_modify(|s| s.connected = true);

        let mut backoff = Backoff::new(self.opts.reconnect_initial, self.opts.reconnect_max);
        let mut service = Some(service);
        let mut link = Some(TunnelLink::new(tunnel));

        loop {
            let round = self.round(service.take(), link.take(), &mut backoff);
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                kept = round => link = kept,
            }
        }

        self.status.send_modify(|s| s.connected = false);
        tracing::info!("agent: stopped");
        Ok(())
    }

    /// One relay round. Returns the tunnel link when it is still usable.
    async fn round(
        &self,
        service: Option<BoxedStream>,
        link: Option<TunnelLink>,
        backoff: &mut Backoff,
    ) -> Option<TunnelLink> {
        let (service, link) = self.connect(service, link, backoff).await;
        let TunnelLink { mut source, writer } = link;

        let (first, service, greeting) = self.await_open(service, &mut source, backoff).await;
        let first = match first {
            Ok(first) => first,
            Err(err) => {
                tracing::warn!(err = %err, "agent: tunnel link lost while idle; redialing");
                self.status.send_modify(|s| s.connected = false);
                return None;
            }
        };

        let id = telemetry::new_session_id();
        metrics::counter!(telemetry::AGENT_ROUNDS_TOTAL).increment(1);
        self.status.send_modify(|s| {
            s.rounds += 1;
            s.connected = true;
        });
        tracing::debug!(session = %id, "agent: round started");

        let egress_source = if greeting.is_empty() {
            Primed::new(service.reader)
        } else {
            Primed::with_first(service.reader, Ok(Some(greeting.freeze())))
        };
        let report = Session::new(
            id.clone(),
            Pump::new(
                Direction::Ingress,
                Primed::with_first(source, Ok(first)),
                RawSink::new(service.writer),
            ),
            Pump::new(
                Direction::Egress,
                egress_source,
                FramedSink::new(writer.clone()),
            ),
        )
        .run()
        .await;

        let (bytes_in, bytes_out) = report.bytes();
        if report.is_clean() {
            tracing::info!(session = %id, bytes_in, bytes_out, "agent: round finished");
        } else if let Some(err) = report.first_error() {
            tracing::info!(session = %id, bytes_in, bytes_out, err = %err, "agent: round failed");
        }

        match (report.ingress, report.egress) {
            (Ok(i), Ok(e)) if !i.link_failed() && !e.link_failed() => Some(TunnelLink {
                source: i.source.into_inner(),
                writer,
            }),
            _ => {
                tracing::warn!(session = %id, "agent: tunnel link lost; redialing");
                self.status.send_modify(|s| s.connected = false);
                None
            }
        }
    }

    /// Waits for the tunnel's first frame, which means a client is there.
    ///
    /// Nothing goes on the link before that. The service is read meanwhile: what it
    /// sends is held for the round, and a service connection that closes is replaced,
    /// since its end of stream belongs to no client.
    async fn await_open(
        &self,
        service: BoxedStream,
        source: &mut FramedSource<StreamReader>,
        backoff: &mut Backoff,
    ) -> (Result<Option<Bytes>, PumpError>, ServiceConn, BytesMut) {
        let mut service = Some(ServiceConn::new(service, self.opts.chunk_size));
        let mut greeting = BytesMut::new();

        let first = {
            // Framed reads are not cancel-safe, so this one future lives across the waits.
            let opening = source.next_chunk();
            tokio::pin!(opening);
            loop {
                let idle = match service.as_mut() {
                    Some(conn) if greeting.len() < GREETING_LIMIT => tokio::select! {
                        opened = &mut opening => Idle::Opened(opened),
                        next = conn.reader.next_chunk() => Idle::Service(next),
                    },
                    Some(_) => Idle::Opened((&mut opening).await),
                    None => tokio::select! {
                        opened = &mut opening => Idle::Opened(opened),
                        s = self.reopen_service(backoff) => Idle::Redialed(s),
                    },
                };
                match idle {
                    Idle::Opened(opened) => break opened,
                    Idle::Service(Ok(Some(chunk))) => greeting.extend_from_slice(&chunk),
                    Idle::Service(res) => {
                        let err = res.err().map(|e| e.to_string()).unwrap_or_default();
                        tracing::debug!(
                            service = %self.opts.service_addr,
                            err = %err,
                            "agent: service closed while idle; redialing"
                        );
                        service = None;
                        greeting.clear();
                    }
                    Idle::Redialed(s) => {
                        service = Some(ServiceConn::new(s, self.opts.chunk_size));
                    }
                }
            }
        };

        let service = match service {
            Some(conn) => conn,
            None => ServiceConn::new(self.redial_service(backoff).await, self.opts.chunk_size),
        };
        backoff.reset();
        (first, service, greeting)
    }

    /// Replaces a service connection lost while idle, pausing first so a service
    /// that drops every idle connection is not redialed in a tight loop.
    async fn reopen_service(&self, backoff: &mut Backoff) -> BoxedStream {
        let wait = backoff.next_delay();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.redial_service(backoff).await
    }

    async fn redial_service(&self, backoff: &mut Backoff) -> BoxedStream {
        loop {
            match self.dial_service().await {
                Ok(s) => return s,
                Err(err) => tracing::warn!(err = %format!("{err:#}"), "agent: service dial failed"),
            }
            let wait = backoff.next_delay();
            if !wait.is_zero() {
                tracing::debug!(wait = ?wait, "agent: waiting before redial");
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Redials whatever is missing until both endpoints are up.
    async fn connect(
        &self,
        mut service: Option<BoxedStream>,
        mut link: Option<TunnelLink>,
        backoff: &mut Backoff,
    ) -> (BoxedStream, TunnelLink) {
        loop {
            if service.is_none() {
                match self.dial_service().await {
                    Ok(s) => service = Some(s),
                    Err(err) => tracing::warn!(err = %format!("{err:#}"), "agent: service dial failed"),
                }
            }
            if service.is_some() && link.is_none() {
                match self.dial_tunnel().await {
                    Ok(t) => {
                        metrics::counter!(telemetry::AGENT_RECONNECTS_TOTAL).increment(1);
                        self.status.send_modify(|s| {
                            s.reconnects += 1;
                            s.connected = true;
                        });
                        tracing::info!(tunnel = %self.opts.tunnel_addr, "agent: tunnel reconnected");
                        link = Some(TunnelLink::new(t));
                    }
                    Err(err) => tracing::warn!(err = %format!("{err:#}"), "agent: tunnel dial failed"),
                }
            }

            match (service.take(), link.take()) {
                (Some(s), Some(l)) => {
                    backoff.reset();
                    return (s, l);
                }
                (s, l) => {
                    service = s;
                    link = l;
                }
            }

            let wait = backoff.next_delay();
            if !wait.is_zero() {
                tracing::debug!(wait = ?wait, "agent: waiting before redial");
                tokio::time::sleep(wait).await;
            }
        }
    }

    async fn dial_service(&self) -> anyhow::Result<BoxedStream> {
        self.dial(&self.opts.service_addr, DialOptions::default())
            .await
    }

    async fn dial_tunnel(&self) -> anyhow::Result<BoxedStream> {
        self.dial(
            &self.opts.tunnel_addr,
            DialOptions {
                bind_addr: self.opts.bind_addr,
            },
        )
        .await
    }

    async fn dial(&self, addr: &str, opts: DialOptions) -> anyhow::Result<BoxedStream> {
        match tokio::time::timeout(self.opts.dial_timeout, self.transport.dial(addr, opts)).await {
            Ok(res) => res.with_context(|| format!("dial {addr}")),
            Err(_) => anyhow::bail!("dial {addr}: timed out after {:?}", self.opts.dial_timeout),
        }
    }
}
