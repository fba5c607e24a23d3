//! Filler bytes and exact-length streams.
//!
//! [`FillSource`] is an endless stream of zero-filled chunks backed by one
//! static buffer, so handing out a chunk never allocates. [`Bounded`] cuts any
//! chunk stream (the filler, or an inbound request body) at exactly `limit`
//! bytes and reports a stream that ends early as an error. [`Cancellable`]
//! fails a stream when the server shuts down, so a shutdown is never mistaken
//! for a short body.

use std::convert::Infallible;
use std::error::Error;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::Stream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::params::CHUNK_SIZE;

static ZEROS: [u8; CHUNK_SIZE] = [0u8; CHUNK_SIZE];

/// Endless source of filler bytes. Each session creates its own.
#[derive(Debug, Default)]
pub struct FillSource {
    produced: u64,
}

impl FillSource {
    /// A fresh source at offset zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `len` filler bytes, `len` clamped to [`CHUNK_SIZE`].
    pub fn chunk(&mut self, len: usize) -> Bytes {
        let len = len.min(CHUNK_SIZE);
        self.produced += len as u64;
        Bytes::from_static(&ZEROS[..len])
    }

    /// Bytes handed out so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }
}

impl Stream for FillSource {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(Some(Ok(self.get_mut().chunk(CHUNK_SIZE))))
    }
}

/// Yields exactly `limit` bytes of the inner stream, then ends.
///
/// Chunks crossing the limit are truncated and the rest of the inner stream is
/// never polled. If the inner stream ends before the limit, the adapter yields
/// one [`io::ErrorKind::UnexpectedEof`] error and then ends.
#[derive(Debug)]
pub struct Bounded<S> {
    inner: S,
    limit: u64,
    remaining: u64,
}

impl<S> Bounded<S> {
    /// Wrap `inner`, bounding it at `limit` bytes.
    pub fn new(inner: S, limit: u64) -> Self {
        Bounded {
            inner,
            limit,
            remaining: limit,
        }
    }

    /// Bytes still owed before the stream completes.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<S, E> Stream for Bounded<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn Error + Send + Sync>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.remaining == 0 {
            return Poll::Ready(None);
        }
        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(mut chunk)) => {
                if chunk.len() as u64 > this.remaining {
                    chunk.truncate(this.remaining as usize);
                }
                this.remaining -= chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(io::Error::other(e)))),
            None => {
                let got = this.limit - this.remaining;
                this.remaining = 0;
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {got} of {} bytes", this.limit),
                ))))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, None)
    }
}

/// Error message of a stream cut by [`Cancellable`].
pub const SHUTDOWN: &str = "server shutting down";

/// Passes the inner stream through until `cancel` fires, then yields one
/// [`io::ErrorKind::Interrupted`] error and ends.
pub struct Cancellable<S> {
    inner: S,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    fired: bool,
}

impl<S> Cancellable<S> {
    /// Wrap `inner`, failing it once `cancel` fires.
    pub fn new(inner: S, cancel: CancellationToken) -> Self {
        Cancellable {
            inner,
            cancelled: Box::pin(cancel.cancelled_owned()),
            fired: false,
        }
    }
}

impl<S, E> Stream for Cancellable<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn Error + Send + Sync>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.fired {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.fired = true;
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                SHUTDOWN,
            ))));
        }
        Pin::new(&mut this.inner)
            .poll_next(cx)
            .map(|item| item.map(|chunk| chunk.map_err(io::Error::other)))
    }
}
