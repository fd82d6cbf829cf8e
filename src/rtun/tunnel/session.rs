use tokio::task::JoinHandle;

use crate::rtun::{
    telemetry,
    tunnel::pump::{ChunkSink, ChunkSource, Pump, PumpError, PumpOutcome},
};

/// Outcome of one direction as seen by the session. `Err` only when the pump task
/// itself died (panic or abort); the endpoints are lost in that case.
pub type DirectionResult<S> = Result<PumpOutcome<S>, PumpError>;

/// One full-duplex relay: an ingress pump (client -> service) and an egress pump
/// (service -> client), each on its own task.
pub struct Session<IS, IK, ES, EK> {
    id: String,
    ingress: Pump<IS, IK>,
    egress: Pump<ES, EK>,
}

pub struct SessionReport<IS, ES> {
    pub id: String,
    pub ingress: DirectionResult<IS>,
    pub egress: DirectionResult<ES>,
}

impl<IS, ES> SessionReport<IS, ES> {
    pub fn is_clean(&self) -> bool {
        matches!(&self.ingress, Ok(o) if o.is_clean()) && matches!(&self.egress, Ok(o) if o.is_clean())
    }

    pub fn bytes(&self) -> (u64, u64) {
        let i = self.ingress.as_ref().map(|o| o.bytes).unwrap_or(0);
        let e = self.egress.as_ref().map(|o| o.bytes).unwrap_or(0);
        (i, e)
    }

    /// First error in either direction, ingress first.
    pub fn first_error(&self) -> Option<&PumpError> {
        fn err<S>(r: &DirectionResult<S>) -> Option<&PumpError> {
            match r {
                Ok(o) => o.error(),
                Err(e) => Some(e),
            }
        }
        err(&self.ingress).or_else(|| err(&self.egress))
    }
}

impl<IS, IK, ES, EK> Session<IS, IK, ES, EK>
where
    IS: ChunkSource + 'static,
    IK: ChunkSink + 'static,
    ES: ChunkSource + 'static,
    EK: ChunkSink + 'static,
{
    pub fn new(id: impl Into<String>, ingress: Pump<IS, IK>, egress: Pump<ES, EK>) -> Self {
        Self {
            id: id.into(),
            ingress,
            egress,
        }
    }

    /// Runs both directions and returns only after both tasks have finished.
    ///
    /// Directions end independently. The one exception is a dead framed link: once a
    /// direction reports the link failed, the other direction can never complete its
    /// half-close over it, so its task is aborted (and still joined) instead of
    /// waiting on a peer that may stay silent forever.
    pub async fn run(self) -> SessionReport<IS, ES> {
        let Session {
            id,
            ingress,
            egress,
        } = self;

        metrics::counter!(telemetry::SESSIONS_TOTAL).increment(1);
        metrics::gauge!(telemetry::ACTIVE_SESSIONS).increment(1.0);
        tracing::debug!(session = %id, "session: started");

        let mut ingress = tokio::spawn(ingress.run());
        let mut egress = tokio::spawn(egress.run());

        let (ingress, egress) = tokio::select! {
            i = &mut ingress => {
                let i = flatten(i);
                let e = join_peer(egress, link_lost(&i)).await;
                (i, e)
            }
            e = &mut egress => {
                let e = flatten(e);
                let i = join_peer(ingress, link_lost(&e)).await;
                (i, e)
            }
        };

        metrics::gauge!(telemetry::ACTIVE_SESSIONS).decrement(1.0);

        let report = SessionReport {
            id,
            ingress,
            egress,
        };
        let (bytes_in, bytes_out) = report.bytes();
        match report.first_error() {
            None => tracing::debug!(session = %report.id, bytes_in, bytes_out, "session: finished"),
            Some(err) => {
                tracing::debug!(session = %report.id, bytes_in, bytes_out, err = %err, "session: finished with error")
            }
        }
        report
    }
}

fn flatten<S>(r: Result<PumpOutcome<S>, tokio::task::JoinError>) -> DirectionResult<S> {
    r.map_err(|err| PumpError::Task(err.to_string()))
}

fn link_lost<S>(r: &DirectionResult<S>) -> bool {
    match r {
        Ok(o) => o.link_failed(),
        Err(_) => true,
    }
}

async fn join_peer<S>(handle: JoinHandle<PumpOutcome<S>>, abort: bool) -> DirectionResult<S> {
    if abort {
        handle.abort();
    }
    flatten(handle.await)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::rtun::tunnel::{
        protocol::{FramedWriter, Message},
        pump::{Direction, FramedSink, FramedSource, RawSink, RawSource},
    };

    #[tokio::test]
    async fn half_close_propagates_and_egress_keeps_working() {
        // client <-> [ingress/egress] <-> service, both raw.
        let (mut client, client_relay) = tokio::io::duplex(1024);
        let (service_relay, mut service) = tokio::io::duplex(1024);
        let (cr, cw) = tokio::io::split(client_relay);
        let (sr, sw) = tokio::io::split(service_relay);

        let session = Session::new(
            "t1",
            Pump::new(Direction::Ingress, RawSource::new(cr, 8), RawSink::new(sw)),
            Pump::new(Direction::Egress, RawSource::new(sr, 8), RawSink::new(cw)),
        );
        let task = tokio::spawn(session.run());

        client.write_all(b"request bytes").await.unwrap();
        client.shutdown().await.unwrap();

        // The service sees exactly B, then end-of-input.
        let mut got = Vec::new();
        service.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"request bytes");

        // Egress still flows after ingress finished.
        service.write_all(b"late reply").await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"late reply");

        assert!(!task.is_finished());
        service.shutdown().await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let report = task.await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.bytes(), (13, 10));
    }

    #[tokio::test]
    async fn framed_link_round_trip_through_two_sessions() {
        // client <-> tunnel-side session <-> link <-> agent-side session <-> service
        let (mut client, client_relay) = tokio::io::duplex(1024);
        let (link_a, link_b) = tokio::io::duplex(1024);
        let (service_relay, mut service) = tokio::io::duplex(1024);

        let (cr, cw) = tokio::io::split(client_relay);
        let (lar, law) = tokio::io::split(link_a);
        let (lbr, lbw) = tokio::io::split(link_b);
        let (sr, sw) = tokio::io::split(service_relay);

        let tunnel_side = Session::new(
            "tunnel",
            Pump::new(
                Direction::Ingress,
                RawSource::new(cr, 4),
                FramedSink::new(FramedWriter::new(law)),
            ),
            Pump::new(Direction::Egress, FramedSource::new(lar), RawSink::new(cw)),
        );
        let agent_side = Session::new(
            "agent",
            Pump::new(Direction::Ingress, FramedSource::new(lbr), RawSink::new(sw)),
            Pump::new(
                Direction::Egress,
                RawSource::new(sr, 4),
                FramedSink::new(FramedWriter::new(lbw)),
            ),
        );
        let t = tokio::spawn(tunnel_side.run());
        let a = tokio::spawn(agent_side.run());

        // Echo service.
        let echo = tokio::spawn(async move {
            let mut buf = Vec::new();
            service.read_to_end(&mut buf).await.unwrap();
            service.write_all(&buf).await.unwrap();
            service.shutdown().await.unwrap();
        });

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        echo.await.unwrap();
        let t = t.await.unwrap();
        let a = a.await.unwrap();
        assert!(t.is_clean());
        assert!(a.is_clean());
    }

    #[tokio::test]
    async fn dead_link_tears_down_an_idle_client_direction() {
        let (_client, client_relay) = tokio::io::duplex(1024);
        let (link_a, link_b) = tokio::io::duplex(1024);
        let (cr, cw) = tokio::io::split(client_relay);
        let (lar, law) = tokio::io::split(link_a);

        let session = Session::new(
            "t2",
            Pump::new(
                Direction::Ingress,
                RawSource::new(cr, 8),
                FramedSink::new(FramedWriter::new(law)),
            ),
            Pump::new(Direction::Egress, FramedSource::new(lar), RawSink::new(cw)),
        );
        let task = tokio::spawn(session.run());

        let (lbr, lbw) = tokio::io::split(link_b);
        let w = FramedWriter::new(lbw);
        w.send(&Message::Data(Bytes::from_static(b"bye"))).await.unwrap();
        drop(w);
        drop(lbr);

        // The client never writes or closes; the session must still end.
        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session finished")
            .unwrap();
        assert!(matches!(report.egress, Ok(ref o) if o.link_failed()));
        assert!(matches!(report.ingress, Err(PumpError::Task(_))));
    }
}
