//! Periodic measurement frames and the pieces both roles share.

use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::emitter::Emitter;
use crate::error::{PerfError, Result};
use crate::meter::{Meter, Outcome, Record, Session};
use crate::params;
use crate::spec::{AppInfo, ConnectionInfo, Measurement, Origin};

/// The ndt7 measurement describing `record` from `session`'s point of view.
pub fn measurement(session: &Session, record: &Record) -> Measurement {
    Measurement {
        app_info: Some(AppInfo {
            elapsed_time: record.elapsed.as_micros() as i64,
            num_bytes: record.bytes as i64,
        }),
        origin: Some(session.origin),
        test: Some(session.direction),
        ..Default::default()
    }
}

/// Text frame carrying `m`.
pub fn frame(m: &Measurement) -> Result<Message> {
    Ok(Message::text(serde_json::to_string(m)?))
}

fn connection_info(session: &Session) -> Option<ConnectionInfo> {
    let (peer, local) = (session.peer?, session.local?);
    Some(match session.origin {
        Origin::Server => ConnectionInfo {
            client: peer.to_string(),
            server: local.to_string(),
            uuid: None,
        },
        Origin::Client => ConnectionInfo {
            client: local.to_string(),
            server: peer.to_string(),
            uuid: None,
        },
    })
}

/// Start the reporter task.
///
/// Every [`params::UPDATE_INTERVAL`] it snapshots `meter`, hands the record
/// to `emitter` and queues a measurement frame for whichever loop owns the
/// write half. The queue is bounded and a full queue drops the tick, so the
/// reporter never waits on the data path. The first frame carries
/// [`ConnectionInfo`] when the addresses are known. The task ends once `stop`
/// is cancelled, which also closes the queue.
pub fn spawn(
    meter: Meter,
    session: Arc<Session>,
    emitter: Arc<dyn Emitter>,
    stop: CancellationToken,
) -> (JoinHandle<()>, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(params::REPORT_QUEUE);
    let handle = tokio::spawn(async move {
        let mut ticker = interval_at(
            tokio::time::Instant::now() + params::UPDATE_INTERVAL,
            params::UPDATE_INTERVAL,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut conn_info = connection_info(&session);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let record = meter.snapshot();
            emitter.on_measurement(&session, &record);

            let mut m = measurement(&session, &record);
            m.connection_info = conn_info.take();
            match frame(&m) {
                Ok(msg) => {
                    if tx.try_send(msg).is_err() {
                        debug!(session = %session, "measurement queue full, tick dropped");
                    }
                }
                Err(e) => warn!(error = %e, "cannot encode measurement"),
            }
        }
    });
    (handle, rx)
}

/// Forward queued frames to the write half until the queue closes. A peer
/// that already went away is not an error here; the read half reports it.
pub async fn forward<K>(sink: &mut K, frames: &mut mpsc::Receiver<Message>) -> Result<()>
where
    K: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = sink.send(frame).await {
            let e = PerfError::from(e);
            return if e.is_closed() { Ok(()) } else { Err(e) };
        }
    }
    Ok(())
}

/// Parse a measurement frame from the peer and surface it.
pub fn peer_measurement(
    text: &str,
    session: &Session,
    emitter: &dyn Emitter,
) -> Result<Measurement> {
    let m: Measurement = serde_json::from_str(text)?;
    emitter.on_peer_measurement(session, &m);
    Ok(m)
}

/// Report the end of a session and build its outcome.
pub fn finish(
    session: &Session,
    meter: &Meter,
    emitter: &dyn Emitter,
    result: Result<Option<Measurement>>,
) -> Result<Outcome> {
    let local = meter.snapshot();
    match result {
        Ok(peer) => {
            emitter.on_complete(session, &local);
            Ok(Outcome { local, peer })
        }
        Err(e) => {
            emitter.on_error(session, &e.to_string(), &local);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use crate::emitter::tests::{Event, Recorder};
    use crate::spec::Direction;

    #[test]
    fn measurement_carries_app_info() {
        let session = Session::new(Direction::Upload, Transport::Ndt7, Origin::Client);
        let record = Record {
            elapsed: std::time::Duration::from_millis(250),
            bytes: 4096,
        };
        let m = measurement(&session, &record);
        let app = m.app_info.unwrap();
        assert_eq!(app.elapsed_time, 250_000);
        assert_eq!(app.num_bytes, 4096);
        assert_eq!(m.origin, Some(Origin::Client));
        assert_eq!(m.test, Some(Direction::Upload));
    }

    #[test]
    fn server_connection_info_orders_addresses() {
        let mut session = Session::new(Direction::Download, Transport::Ndt7, Origin::Server);
        assert!(connection_info(&session).is_none());
        session.peer = Some("10.0.0.1:5000".parse().unwrap());
        session.local = Some("10.0.0.2:4567".parse().unwrap());
        let info = connection_info(&session).unwrap();
        assert_eq!(info.client, "10.0.0.1:5000");
        assert_eq!(info.server, "10.0.0.2:4567");
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_ticks_at_fixed_interval() {
        let recorder = Arc::new(Recorder::default());
        let meter = Meter::start();
        let stop = CancellationToken::new();
        let mut session = Session::new(Direction::Download, Transport::Ndt7, Origin::Server);
        session.peer = Some("127.0.0.1:1".parse().unwrap());
        session.local = Some("127.0.0.1:2".parse().unwrap());
        let (handle, mut frames) = spawn(
            meter.clone(),
            Arc::new(session),
            recorder.clone(),
            stop.clone(),
        );

        let mut seen = Vec::new();
        for i in 1..=4u64 {
            meter.add(1000);
            let Some(Message::Text(text)) = frames.recv().await else {
                panic!("expected a text frame");
            };
            let m: Measurement = serde_json::from_str(&text).unwrap();
            assert_eq!(m.connection_info.is_some(), i == 1);
            seen.push(m.app_info.unwrap());
        }
        stop.cancel();
        handle.await.unwrap();
        assert!(frames.recv().await.is_none());

        for pair in seen.windows(2) {
            assert!(pair[1].num_bytes >= pair[0].num_bytes);
            let gap = pair[1].elapsed_time - pair[0].elapsed_time;
            assert_eq!(gap, params::UPDATE_INTERVAL.as_micros() as i64);
        }
        let local: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Measurement(_)))
            .collect();
        assert_eq!(local.len(), 4);
    }

    #[test]
    fn finish_reports_error_with_partial_record() {
        let recorder = Recorder::default();
        let session = Session::new(Direction::Download, Transport::Ndt7, Origin::Client);
        let meter = Meter::start();
        meter.add(77);

        let err = finish(&session, &meter, &recorder, Err(PerfError::Cancelled)).unwrap_err();
        assert!(matches!(err, PerfError::Cancelled));
        assert!(matches!(recorder.events()[..], [Event::Error(r)] if r.bytes == 77));
    }
}
