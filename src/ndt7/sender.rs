//! The sending role: data pump plus counter-flow reader.
//!
//! The pump owns the write half and alternates between queued measurement
//! frames and binary payload frames, so a text frame only ever lands between
//! two binary frames. Binary frames start at
//! [`params::INITIAL_MESSAGE_SIZE`] and double while they are no more than
//! 1/[`params::SCALING_FRACTION`] of what was already sent, up to
//! [`params::MAX_MESSAGE_SIZE`].

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::emitter::Emitter;
use crate::error::{PerfError, Result};
use crate::meter::{Meter, Outcome, Session};
use crate::ndt7::{Limits, report};
use crate::params;
use crate::source::FillSource;
use crate::spec::Measurement;

/// Run the sending side of a session on an established WebSocket.
///
/// Sends until `limits` is reached, then sends a final measurement frame with
/// the exact byte count and closes. The peer closing first ends the session
/// normally; cancellation abandons the in-flight write and fails it.
pub async fn run<S>(
    ws: WebSocketStream<S>,
    session: Session,
    limits: Limits,
    emitter: Arc<dyn Emitter>,
    cancel: CancellationToken,
) -> Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = Arc::new(session);
    emitter.on_starting(&session);

    let meter = Meter::start();
    let (mut sink, mut stream) = ws.split();
    let stop = cancel.child_token();
    let (reporter, mut frames) = report::spawn(
        meter.clone(),
        session.clone(),
        emitter.clone(),
        stop.clone(),
    );

    let reading = read_counterflow(&mut stream, &session, emitter.as_ref());
    tokio::pin!(reading);

    // Ok(None): limit reached. Ok(Some(_)): the peer closed first.
    let (result, read_done) = tokio::select! {
        _ = cancel.cancelled() => (Err(PerfError::Cancelled), false),
        pumped = pump(&mut sink, &mut frames, &meter, &limits) => (pumped.map(|()| None), false),
        read = &mut reading => (read.map(Some), true),
    };
    stop.cancel();
    let _ = reporter.await;

    let result = match result {
        Ok(None) => conclude(&mut sink, &session, &meter, &mut reading).await,
        // the peer left mid-write; let the reader say how
        Err(e) if e.is_closed() && !read_done => {
            match timeout(params::IO_TIMEOUT, &mut reading).await {
                Ok(read) => read,
                Err(_) => Err(e),
            }
        }
        other => other.map(Option::flatten),
    };
    report::finish(&session, &meter, emitter.as_ref(), result)
}

async fn conclude<S, R>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    session: &Session,
    meter: &Meter,
    reading: &mut std::pin::Pin<&mut R>,
) -> Result<Option<Measurement>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Future<Output = Result<Option<Measurement>>>,
{
    let last = report::measurement(session, &meter.snapshot());
    timeout(params::IO_TIMEOUT, sink.send(report::frame(&last)?))
        .await
        .map_err(|_| PerfError::Timeout)??;
    let _ = sink.close().await;
    match timeout(params::IO_TIMEOUT, reading.as_mut()).await {
        Ok(read) => read,
        // the bytes are out; a peer slow to close is not our failure
        Err(_) => Ok(None),
    }
}

async fn pump<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    frames: &mut mpsc::Receiver<Message>,
    meter: &Meter,
    limits: &Limits,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + limits.duration;
    let mut source = FillSource::new();
    let mut msg_size = params::INITIAL_MESSAGE_SIZE;

    loop {
        while let Ok(frame) = frames.try_recv() {
            write(sink, frame).await?;
        }
        if Instant::now() >= deadline {
            return Ok(());
        }
        let len = match limits.bytes {
            Some(max) => {
                let left = max.saturating_sub(meter.bytes());
                if left == 0 {
                    return Ok(());
                }
                msg_size.min(usize::try_from(left).unwrap_or(usize::MAX))
            }
            None => msg_size,
        };
        let chunk = source.chunk(len);
        write(sink, Message::Binary(chunk)).await?;
        meter.add(len as u64);

        if msg_size < params::MAX_MESSAGE_SIZE
            && msg_size as u64 <= meter.bytes() / params::SCALING_FRACTION as u64
        {
            msg_size *= 2;
        }
    }
}

async fn write<S>(sink: &mut SplitSink<WebSocketStream<S>, Message>, msg: Message) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(params::IO_TIMEOUT, sink.send(msg))
        .await
        .map_err(|_| PerfError::Timeout)?
        .map_err(PerfError::from)
}

// Reads the receiver's measurements. The receiver only ever sends text.
async fn read_counterflow<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    session: &Session,
    emitter: &dyn Emitter,
) -> Result<Option<Measurement>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut last = None;
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => last = Some(report::peer_measurement(&text, session, emitter)?),
            Message::Binary(_) => {
                return Err(PerfError::Protocol(format!(
                    "binary message from the receiving side of a {} test",
                    session.direction
                )));
            }
            Message::Close(_) => break,
            _ => {} // Ping/Pong handled by tokio-tungstenite
        }
    }
    Ok(last)
}
