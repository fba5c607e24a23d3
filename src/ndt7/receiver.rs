//! The receiving role.
//!
//! Counts binary payload (the payload itself is discarded), surfaces the
//! sender's measurement frames, and sends its own measurements back on the
//! same connection until the sender closes or the time limit expires.

use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::emitter::Emitter;
use crate::error::{PerfError, Result};
use crate::meter::{Meter, Outcome, Session};
use crate::ndt7::{Limits, report};
use crate::spec::Measurement;

/// Run the receiving side of a session on an established WebSocket.
///
/// Returns when the sender closes the connection or `limits.duration`
/// elapses; the expiry is a normal completion. The outcome holds the last
/// measurement the sender reported, whose byte count should match
/// `outcome.local.bytes` when the sender finished cleanly.
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

    let mut last = None;
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(PerfError::Cancelled),
        received = timeout(
            limits.duration,
            receive(&mut stream, &meter, &session, emitter.as_ref(), &mut last),
        ) => received.unwrap_or(Ok(())),
        Err(e) = report::forward(&mut sink, &mut frames) => Err(e),
    };
    stop.cancel();
    let _ = reporter.await;
    if !matches!(result, Err(PerfError::Cancelled)) {
        let _ = sink.close().await;
    }

    report::finish(&session, &meter, emitter.as_ref(), result.map(|()| last))
}

async fn receive<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    meter: &Meter,
    session: &Session,
    emitter: &dyn Emitter,
    last: &mut Option<Measurement>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Binary(data) => meter.add(data.len() as u64),
            Message::Text(text) => *last = Some(report::peer_measurement(&text, session, emitter)?),
            Message::Close(_) => break,
            _ => {} // Ping/Pong handled automatically by tokio-tungstenite
        }
    }
    Ok(())
}
