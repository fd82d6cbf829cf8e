use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, watch};

use crate::rtun::{
    net::AgentMatcher,
    telemetry::{self, ServerStatus},
    tunnel::{
        protocol::{FramedWriter, Message},
        pump::{
            ChunkSource, Direction, FramedSink, FramedSource, Primed, Pump, RawSink, RawSource,
        },
        session::Session,
        transport::{
            BoxedStream, StreamReader, StreamWriter, TransportListener, transport_by_name,
        },
    },
};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Bytes read ahead from a client that is still waiting for the agent.
const PENDING_READ_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    /// Source address that identifies the agent (`ip` or `host:port`).
    pub agent_addr: String,
    pub transport: String,
    pub chunk_size: usize,
}

/// The public endpoint: one agent link, one client at a time.
pub struct Server {
    opts: ServerOptions,
    agent: AgentMatcher,
    listener: Box<dyn TransportListener>,
    status: watch::Sender<ServerStatus>,
}

impl Server {
    /// Resolves the agent address and binds the listener. Both failures are fatal.
    pub async fn bind(opts: ServerOptions) -> anyhow::Result<Self> {
        let agent = AgentMatcher::resolve(&opts.agent_addr)
            .await
            .context("tunnel: agent address")?;
        let tr = transport_by_name(&opts.transport)?;
        let listener = tr.listen(&opts.listen_addr).await?;

        let listen_addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| opts.listen_addr.clone());
        tracing::info!(
            addr = %listen_addr,
            transport = %tr.name(),
            agent = %agent,
            "tunnel: listening"
        );

        let (status, _) = watch::channel(ServerStatus {
            listen_addr,
            state: "waiting_for_agent",
            client_slot: "free",
            ..Default::default()
        });

        Ok(Self {
            opts,
            agent,
            listener,
            status,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn status(&self) -> watch::Receiver<ServerStatus> {
        self.status.subscribe()
    }

    /// Accept loop. It alone owns the binding state; session tasks only report back
    /// over the event channel.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel::<SessionEnded>(16);
        let mut st = State::new(self.opts.chunk_size, events_tx);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(ev) = events_rx.recv() => st.on_session_ended(ev),
                acc = self.listener.accept() => match acc {
                    Ok((stream, peer)) => {
                        if self.agent.matches(peer) {
                            st.on_agent(stream, peer);
                        } else {
                            st.on_client(stream, peer);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(err = %err, "tunnel: accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }

            self.status.send_modify(|s| st.fill_status(s));
        }

        tracing::info!("tunnel: stopped");
        Ok(())
    }
}

/// Framed connection to the bound agent. Lent to one session at a time and handed
/// back when that session leaves it frame-aligned.
struct AgentLink {
    peer: SocketAddr,
    generation: u64,
    source: FramedSource<StreamReader>,
    writer: FramedWriter<StreamWriter>,
}

impl AgentLink {
    fn new(stream: BoxedStream, peer: SocketAddr, generation: u64) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            peer,
            generation,
            source: FramedSource::new(r),
            writer: FramedWriter::new(w),
        }
    }
}

enum Binding {
    WaitingForAgent,
    AgentBound {
        peer: SocketAddr,
        generation: u64,
        /// `None` while a session holds it.
        link: Option<AgentLink>,
    },
}

enum ClientSlot {
    Free,
    /// Accepted, waiting for the agent link to arrive through `gate`.
    Pending {
        peer: SocketAddr,
        session: String,
        gate: oneshot::Sender<AgentLink>,
    },
    Active {
        peer: SocketAddr,
        session: String,
    },
}

struct SessionEnded {
    session: String,
    /// Bind generation of the link the session ran on, if it got one.
    generation: Option<u64>,
    /// The link, when it is still usable.
    link: Option<AgentLink>,
}

struct State {
    binding: Binding,
    slot: ClientSlot,
    next_generation: u64,
    chunk_size: usize,
    events: mpsc::Sender<SessionEnded>,
    sessions_completed: u64,
    clients_rejected: u64,
    agent_binds: u64,
}

impl State {
    fn new(chunk_size: usize, events: mpsc::Sender<SessionEnded>) -> Self {
        Self {
            binding: Binding::WaitingForAgent,
            slot: ClientSlot::Free,
            next_generation: 1,
            chunk_size,
            events,
            sessions_completed: 0,
            clients_rejected: 0,
            agent_binds: 0,
        }
    }

    fn on_agent(&mut self, stream: BoxedStream, peer: SocketAddr) {
        match &self.binding {
            Binding::WaitingForAgent => {}
            Binding::AgentBound { link: Some(_), peer: old, .. } => {
                tracing::info!(agent = %peer, previous = %old, "tunnel: agent reconnected; replacing idle link");
            }
            Binding::AgentBound { link: None, .. } => {
                tracing::warn!(agent = %peer, "tunnel: agent connection while a session holds the link; rejecting");
                return;
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.agent_binds += 1;
        metrics::counter!(telemetry::AGENT_BINDS_TOTAL).increment(1);
        tracing::info!(agent = %peer, generation, "tunnel: agent bound");

        self.binding = Binding::AgentBound {
            peer,
            generation,
            link: Some(AgentLink::new(stream, peer, generation)),
        };
        self.dispatch();
    }

    fn on_client(&mut self, stream: BoxedStream, peer: SocketAddr) {
        if let ClientSlot::Pending { peer: holder, .. } | ClientSlot::Active { peer: holder, .. } =
            &self.slot
        {
            self.clients_rejected += 1;
            metrics::counter!(telemetry::CLIENTS_REJECTED_TOTAL).increment(1);
            tracing::info!(client = %peer, holder = %holder, "tunnel: client slot busy; rejecting");
            // Dropping the stream closes it before any byte is exchanged.
            drop(stream);
            return;
        }

        let session = telemetry::new_session_id();
        let (gate, gate_rx) = oneshot::channel();
        tokio::spawn(run_client_session(
            session.clone(),
            stream,
            peer,
            gate_rx,
            self.chunk_size,
            self.events.clone(),
        ));

        if matches!(self.binding, Binding::WaitingForAgent) {
            tracing::info!(session = %session, client = %peer, "tunnel: client waiting for agent");
        }
        self.slot = ClientSlot::Pending {
            peer,
            session,
            gate,
        };
        self.dispatch();
    }

    fn on_session_ended(&mut self, ev: SessionEnded) {
        if let ClientSlot::Pending { session, .. } | ClientSlot::Active { session, .. } = &self.slot {
            if *session == ev.session {
                self.slot = ClientSlot::Free;
            }
        }
        if ev.generation.is_some() {
            self.sessions_completed += 1;
        }

        match ev.link {
            Some(returned) => {
                if let Binding::AgentBound {
                    generation, link, ..
                } = &mut self.binding
                {
                    if *generation == returned.generation && link.is_none() {
                        *link = Some(returned);
                    }
                }
                // Anything else is a link from an older binding; dropping it closes it.
            }
            None => {
                let lost = match (&self.binding, ev.generation) {
                    (Binding::AgentBound { generation, peer, .. }, Some(g)) if *generation == g => {
                        Some(*peer)
                    }
                    _ => None,
                };
                if let Some(peer) = lost {
                    tracing::warn!(agent = %peer, "tunnel: agent link lost; waiting for agent");
                    self.binding = Binding::WaitingForAgent;
                }
            }
        }
        self.dispatch();
    }

    /// Opens the gate for a pending client once an idle link is available.
    fn dispatch(&mut self) {
        let Binding::AgentBound { link, .. } = &mut self.binding else {
            return;
        };
        if link.is_none() || !matches!(self.slot, ClientSlot::Pending { .. }) {
            return;
        }
        let (Some(l), ClientSlot::Pending { peer, session, gate }) =
            (link.take(), std::mem::replace(&mut self.slot, ClientSlot::Free))
        else {
            return;
        };
        match gate.send(l) {
            Ok(()) => self.slot = ClientSlot::Active { peer, session },
            Err(l) => {
                tracing::debug!(session = %session, client = %peer, "tunnel: session task gone before start");
                *link = Some(l);
            }
        }
    }

    fn fill_status(&self, s: &mut ServerStatus) {
        match &self.binding {
            Binding::WaitingForAgent => {
                s.state = "waiting_for_agent";
                s.agent = None;
            }
            Binding::AgentBound { peer, .. } => {
                s.state = "agent_bound";
                s.agent = Some(peer.to_string());
            }
        }
        match &self.slot {
            ClientSlot::Free => {
                s.client_slot = "free";
                s.client = None;
            }
            ClientSlot::Pending { peer, .. } => {
                s.client_slot = "pending";
                s.client = Some(peer.to_string());
            }
            ClientSlot::Active { peer, .. } => {
                s.client_slot = "active";
                s.client = Some(peer.to_string());
            }
        }
        s.sessions_completed = self.sessions_completed;
        s.clients_rejected = self.clients_rejected;
        s.agent_binds = self.agent_binds;
    }
}

async fn run_client_session(
    id: String,
    client: BoxedStream,
    peer: SocketAddr,
    mut gate: oneshot::Receiver<AgentLink>,
    chunk_size: usize,
    events: mpsc::Sender<SessionEnded>,
) {
    let (cr, cw) = tokio::io::split(client);
    let mut reader = RawSource::new(cr, chunk_size);

    // While waiting for the link, keep reading the client so one that goes away
    // hands its slot back. What it sends meanwhile is replayed once the link arrives.
    let mut early = BytesMut::new();
    let mut half_closed = false;
    let link = loop {
        tokio::select! {
            link = &mut gate => match link {
                Ok(link) => break link,
                Err(_) => {
                    tracing::debug!(session = %id, client = %peer, "tunnel: client released without an agent");
                    let _ = events
                        .send(SessionEnded {
                            session: id,
                            generation: None,
                            link: None,
                        })
                        .await;
                    return;
                }
            },
            next = reader.next_chunk(), if !half_closed && early.len() < PENDING_READ_LIMIT => match next {
                Ok(Some(chunk)) => early.extend_from_slice(&chunk),
                Ok(None) if !early.is_empty() => half_closed = true,
                // Gone without a request: nothing to relay.
                Ok(None) | Err(_) => {
                    tracing::info!(session = %id, client = %peer, "tunnel: client left before the agent arrived");
                    let _ = events
                        .send(SessionEnded {
                            session: id,
                            generation: None,
                            link: None,
                        })
                        .await;
                    return;
                }
            },
        }
    };

    let AgentLink {
        peer: agent,
        generation,
        source,
        writer,
    } = link;
    tracing::info!(session = %id, client = %peer, agent = %agent, "tunnel: session started");

    // An empty `Data` frame opens the round on the agent even if the client waits for
    // the service to speak first.
    if let Err(err) = writer.send(&Message::Data(Bytes::new())).await {
        tracing::warn!(session = %id, agent = %agent, err = %err, "tunnel: agent link failed at session start");
        let _ = events
            .send(SessionEnded {
                session: id,
                generation: Some(generation),
                link: None,
            })
            .await;
        return;
    }

    let ingress_source = if early.is_empty() {
        Primed::new(reader)
    } else {
        Primed::with_first(reader, Ok(Some(early.freeze())))
    };
    let report = Session::new(
        id.clone(),
        Pump::new(
            Direction::Ingress,
            ingress_source,
            FramedSink::new(writer.clone()),
        ),
        Pump::new(Direction::Egress, source, RawSink::new(cw)),
    )
    .run()
    .await;

    let (bytes_in, bytes_out) = report.bytes();
    match report.first_error() {
        None => tracing::info!(session = %id, client = %peer, bytes_in, bytes_out, "tunnel: session finished"),
        Some(err) => tracing::info!(
            session = %id,
            client = %peer,
            bytes_in,
            bytes_out,
            err = %err,
            "tunnel: session finished with error"
        ),
    }

    // The link survives only if neither direction broke it.
    let link = match (report.ingress, report.egress) {
        (Ok(i), Ok(e)) if !i.link_failed() && !e.link_failed() => Some(AgentLink {
            peer: agent,
            generation,
            source: e.source,
            writer,
        }),
        _ => None,
    };

    let _ = events
        .send(SessionEnded {
            session: id,
            generation: Some(generation),
            link,
        })
        .await;
}
