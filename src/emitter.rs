//! Sinks for session events.
//!
//! The core never logs measurements itself; it calls an [`Emitter`] handed in
//! by the caller. Two implementations are provided:
//! - [`TracingEmitter`]: structured `tracing` events.
//! - [`JsonEmitter`]: one JSON object per line, suitable for machine consumption.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Transport;
use crate::meter::{Record, Session};
use crate::spec::{Direction, Measurement};

#[derive(Serialize)]
#[serde(tag = "type")]
enum Event<'a> {
    Starting {
        session: &'a Session,
    },
    Measurement {
        session: &'a Session,
        record: &'a Record,
    },
    PeerMeasurement {
        session: &'a Session,
        measurement: &'a Measurement,
    },
    Rejected {
        transport: Transport,
        direction: Direction,
        input: &'a str,
    },
    Error {
        session: &'a Session,
        error: &'a str,
        record: &'a Record,
    },
    Complete {
        session: &'a Session,
        record: &'a Record,
    },
}

/// Callbacks for the lifecycle of a transfer session.
///
/// Implementations are shared between the tasks of a session and must not
/// block.
pub trait Emitter: Send + Sync {
    /// A session passed validation and is about to move bytes.
    fn on_starting(&self, session: &Session);
    /// Periodic local progress.
    fn on_measurement(&self, session: &Session, record: &Record);
    /// A measurement frame arrived from the ndt7 peer.
    fn on_peer_measurement(&self, session: &Session, m: &Measurement);
    /// A request was refused before any session started.
    fn on_rejected(&self, transport: Transport, direction: Direction, input: &str);
    /// The session failed; `last` holds what was counted until then.
    fn on_error(&self, session: &Session, err: &str, last: &Record);
    /// The session finished.
    fn on_complete(&self, session: &Session, record: &Record);
}

/// Emits events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl Emitter for TracingEmitter {
    fn on_starting(&self, s: &Session) {
        info!(
            transport = %s.transport,
            direction = %s.direction,
            origin = %s.origin,
            bytes = ?s.bytes,
            peer = ?s.peer,
            proto = ?s.proto,
            alpn = ?s.alpn,
            "session starting"
        );
    }

    fn on_measurement(&self, s: &Session, r: &Record) {
        info!(
            transport = %s.transport,
            direction = %s.direction,
            bytes = r.bytes,
            elapsed_ms = r.elapsed.as_millis() as u64,
            mbps = r.bits_per_second() / 1e6,
            "progress"
        );
    }

    fn on_peer_measurement(&self, s: &Session, m: &Measurement) {
        info!(
            transport = %s.transport,
            direction = %s.direction,
            peer_origin = ?m.origin,
            peer_bytes = ?m.num_bytes(),
            peer_elapsed_us = ?m.app_info.as_ref().map(|a| a.elapsed_time),
            "peer measurement"
        );
    }

    fn on_rejected(&self, transport: Transport, direction: Direction, input: &str) {
        warn!(%transport, %direction, input, "rejected invalid transfer size");
    }

    fn on_error(&self, s: &Session, err: &str, last: &Record) {
        warn!(
            transport = %s.transport,
            direction = %s.direction,
            origin = %s.origin,
            requested = ?s.bytes,
            bytes = last.bytes,
            elapsed_ms = last.elapsed.as_millis() as u64,
            error = err,
            "session failed"
        );
    }

    fn on_complete(&self, s: &Session, r: &Record) {
        info!(
            transport = %s.transport,
            direction = %s.direction,
            origin = %s.origin,
            proto = ?s.proto,
            bytes = r.bytes,
            elapsed_ms = r.elapsed.as_millis() as u64,
            mbps = r.bits_per_second() / 1e6,
            "session complete"
        );
    }
}

/// Emits one JSON object per line for each event.
pub struct JsonEmitter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonEmitter<W> {
    /// Create a new JSON emitter writing to `out`.
    pub fn new(out: W) -> Self {
        JsonEmitter {
            out: Mutex::new(out),
        }
    }

    /// Give back the writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: &Event) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "cannot serialize event");
                return;
            }
        };
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(out, "{}", json).and_then(|()| out.flush()) {
            warn!(error = %e, "cannot write event");
        }
    }
}

impl<W: Write + Send> Emitter for JsonEmitter<W> {
    fn on_starting(&self, session: &Session) {
        self.emit(&Event::Starting { session })
    }

    fn on_measurement(&self, session: &Session, record: &Record) {
        self.emit(&Event::Measurement { session, record })
    }

    fn on_peer_measurement(&self, session: &Session, measurement: &Measurement) {
        self.emit(&Event::PeerMeasurement {
            session,
            measurement,
        })
    }

    fn on_rejected(&self, transport: Transport, direction: Direction, input: &str) {
        self.emit(&Event::Rejected {
            transport,
            direction,
            input,
        })
    }

    fn on_error(&self, session: &Session, error: &str, record: &Record) {
        self.emit(&Event::Error {
            session,
            error,
            record,
        })
    }

    fn on_complete(&self, session: &Session, record: &Record) {
        self.emit(&Event::Complete { session, record })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::spec::Origin;

    /// What a [`Recorder`] saw, in order.
    #[derive(Debug, Clone)]
    pub(crate) enum Event {
        Starting,
        Measurement(Record),
        Peer(Measurement),
        Rejected(String),
        Error(Record),
        Complete(Record),
    }

    /// Emitter that keeps every event for later inspection.
    #[derive(Default)]
    pub(crate) struct Recorder(Mutex<Vec<Event>>);

    impl Recorder {
        pub(crate) fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }

        fn push(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Emitter for Recorder {
        fn on_starting(&self, _: &Session) {
            self.push(Event::Starting);
        }
        fn on_measurement(&self, _: &Session, record: &Record) {
            self.push(Event::Measurement(*record));
        }
        fn on_peer_measurement(&self, _: &Session, m: &Measurement) {
            self.push(Event::Peer(m.clone()));
        }
        fn on_rejected(&self, _: Transport, _: Direction, input: &str) {
            self.push(Event::Rejected(input.to_owned()));
        }
        fn on_error(&self, _: &Session, _: &str, last: &Record) {
            self.push(Event::Error(*last));
        }
        fn on_complete(&self, _: &Session, record: &Record) {
            self.push(Event::Complete(*record));
        }
    }

    #[test]
    fn json_emitter_writes_one_object_per_line() {
        let emitter = JsonEmitter::new(Vec::new());
        let mut session = Session::new(Direction::Upload, Transport::H2c, Origin::Server);
        session.bytes = Some(10);

        emitter.on_starting(&session);
        emitter.on_complete(
            &session,
            &Record {
                elapsed: Duration::from_millis(1),
                bytes: 10,
            },
        );
        emitter.on_rejected(Transport::Http1, Direction::Download, "-1");

        let out = String::from_utf8(emitter.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "Starting");
        assert_eq!(lines[0]["session"]["transport"], "h2c");
        assert_eq!(lines[0]["session"]["direction"], "upload");
        assert_eq!(lines[1]["type"], "Complete");
        assert_eq!(lines[1]["record"]["bytes"], 10);
        assert_eq!(lines[2]["input"], "-1");
    }

    #[test]
    fn json_emitter_omits_unknown_session_fields() {
        let emitter = JsonEmitter::new(Vec::new());
        emitter.on_starting(&Session::new(Direction::Download, Transport::Ndt7, Origin::Client));

        let out = String::from_utf8(emitter.into_inner()).unwrap();
        assert!(!out.contains("peer"));
        assert!(!out.contains("alpn"));
    }
}
