//! Byte counting and measurement snapshots.
//!
//! A [`Meter`] is the single shared counter of a session: the task moving
//! bytes adds to it, reporters read snapshots from it. [`Metered`] decorates
//! a chunk stream with a meter and reports progress, failure and completion
//! through an [`Emitter`] without touching the data.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use serde::ser::SerializeStruct;
use tokio::time::Instant;

use crate::config::Transport;
use crate::emitter::Emitter;
use crate::params;
use crate::spec::{Direction, Measurement, Origin};

/// Immutable snapshot of a session's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Record {
    /// Time since the session started.
    pub elapsed: Duration,
    /// Payload bytes moved so far.
    pub bytes: u64,
}

impl Record {
    /// Average throughput since the start of the session.
    pub fn bits_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 * 8.0 / secs
        } else {
            0.0
        }
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Record", 3)?;
        s.serialize_field("elapsed_us", &(self.elapsed.as_micros() as u64))?;
        s.serialize_field("bytes", &self.bytes)?;
        s.serialize_field("bits_per_second", &self.bits_per_second())?;
        s.end()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {:.1} ms ({:.1} Mbit/s)",
            self.bytes,
            self.elapsed.as_secs_f64() * 1000.0,
            self.bits_per_second() / 1e6
        )
    }
}

/// Shared byte counter anchored at the session start.
///
/// Cloning shares the counter. Only the data path writes; anyone may read.
#[derive(Debug, Clone)]
pub struct Meter {
    bytes: Arc<AtomicU64>,
    start: Instant,
}

impl Meter {
    /// Start counting from now.
    pub fn start() -> Self {
        Meter {
            bytes: Arc::new(AtomicU64::new(0)),
            start: Instant::now(),
        }
    }

    /// Count `n` more bytes.
    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Bytes counted so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Current record. Successive snapshots never go backwards.
    pub fn snapshot(&self) -> Record {
        Record {
            elapsed: self.start.elapsed(),
            bytes: self.bytes(),
        }
    }
}

/// Who is transferring what, over which transport. One per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Which way payload flows.
    pub direction: Direction,
    /// Transport stack.
    pub transport: Transport,
    /// Which side this process plays.
    pub origin: Origin,
    /// Requested byte count, when the session is byte-bounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Remote address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<SocketAddr>,
    /// Local address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<SocketAddr>,
    /// HTTP version in use, e.g. `HTTP/2.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    /// Negotiated ALPN identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpn: Option<String>,
}

impl Session {
    /// A session with no connection metadata yet.
    pub fn new(direction: Direction, transport: Transport, origin: Origin) -> Self {
        Session {
            direction,
            transport,
            origin,
            bytes: None,
            peer: None,
            local: None,
            proto: None,
            alpn: None,
        }
    }

    /// Whether this side sends the payload.
    pub fn is_sender(&self) -> bool {
        self.direction.sender() == self.origin
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.transport, self.direction, self.origin)
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Final local record.
    pub local: Record,
    /// Last measurement the peer reported, for ndt7 sessions.
    pub peer: Option<Measurement>,
}

/// Stream decorator that counts every chunk into a [`Meter`].
///
/// Progress is reported every [`params::UPDATE_INTERVAL`]. The end of the
/// inner stream reports completion, an inner error reports failure with the
/// bytes counted so far, and dropping the decorator before either reports the
/// session as aborted unless the requested byte count was already reached.
///
/// Bytes are counted when a chunk is handed to the consumer, not when the
/// consumer has written it out. A response body whose last chunk is accepted
/// by hyper and then fails on the socket is still reported complete; hyper
/// stops polling at Content-Length and offers no write acknowledgement.
pub struct Metered<S> {
    inner: S,
    meter: Meter,
    session: Arc<Session>,
    emitter: Arc<dyn Emitter>,
    last_update: Instant,
    final_event: bool,
    done: bool,
}

impl<S> Metered<S> {
    /// Decorate `inner`, counting into `meter`.
    pub fn new(inner: S, meter: Meter, session: Arc<Session>, emitter: Arc<dyn Emitter>) -> Self {
        Metered {
            inner,
            last_update: Instant::now(),
            meter,
            session,
            emitter,
            final_event: true,
            done: false,
        }
    }

    /// Like [`Metered::new`] but only reports progress. The owner reports how
    /// the session ended, e.g. once the peer's response has been checked.
    pub fn progress_only(
        inner: S,
        meter: Meter,
        session: Arc<Session>,
        emitter: Arc<dyn Emitter>,
    ) -> Self {
        let mut metered = Metered::new(inner, meter, session, emitter);
        metered.final_event = false;
        metered
    }

    /// The meter this decorator counts into.
    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    fn finish(&mut self, error: Option<&str>) {
        if self.done {
            return;
        }
        self.done = true;
        if !self.final_event {
            return;
        }
        let record = self.meter.snapshot();
        match error {
            Some(error) => self.emitter.on_error(&self.session, error, &record),
            None => self.emitter.on_complete(&self.session, &record),
        }
    }
}

impl<S> Stream for Metered<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                this.meter.add(chunk.len() as u64);
                if this.last_update.elapsed() >= params::UPDATE_INTERVAL {
                    this.last_update = Instant::now();
                    this.emitter
                        .on_measurement(&this.session, &this.meter.snapshot());
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                this.finish(Some(&e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.finish(None);
                Poll::Ready(None)
            }
        }
    }
}

impl<S> Drop for Metered<S> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        match self.session.bytes {
            Some(expected) if self.meter.bytes() == expected => self.finish(None),
            _ => self.finish(Some("transfer aborted")),
        }
    }
}
