//! Listening socket and per-connection task spawning shared by the HTTP and
//! ndt7 servers.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// An accepted connection, cleartext or TLS.
pub enum Conn {
    /// Cleartext TCP.
    Plain(TcpStream),
    /// TLS over TCP, handshake completed.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Conn {
    /// ALPN identifier agreed during the handshake.
    pub fn alpn(&self) -> Option<String> {
        match self {
            Conn::Plain(_) => None,
            Conn::Tls(s) => s
                .get_ref()
                .1
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Conn::Plain(s) => s.is_write_vectored(),
            Conn::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Addresses and negotiated protocol of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    /// Remote address.
    pub peer: SocketAddr,
    /// Local address.
    pub local: Option<SocketAddr>,
    /// Negotiated ALPN identifier, TLS only.
    pub alpn: Option<String>,
}

/// Bound TCP listener with optional TLS.
pub struct Listener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    /// Bind `addr`. With `tls`, every connection is TLS-handshaken before use.
    pub async fn bind(addr: SocketAddr, tls: Option<TlsAcceptor>) -> Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        Ok(Listener { tcp, tls })
    }

    /// Address actually bound, useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Whether connections are TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accept connections until `cancel` fires, running `handle` on each in
    /// its own task. A failing connection never affects the others.
    pub async fn serve<F, Fut>(self, cancel: CancellationToken, handle: F) -> Result<()>
    where
        F: Fn(Conn, ConnInfo, CancellationToken) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let addr = self.tcp.local_addr()?;
        info!(%addr, tls = self.tls.is_some(), "serving");
        loop {
            let (tcp, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.tcp.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                },
            };
            let _ = tcp.set_nodelay(true);
            let local = tcp.local_addr().ok();
            let tls = self.tls.clone();
            let handle = handle.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                debug!(%peer, "connection");
                let conn = match tls {
                    None => Conn::Plain(tcp),
                    Some(acceptor) => {
                        let accepted = tokio::select! {
                            _ = cancel.cancelled() => return,
                            accepted = acceptor.accept(tcp) => accepted,
                        };
                        match accepted {
                            Ok(s) => Conn::Tls(Box::new(s)),
                            Err(e) => {
                                warn!(%peer, error = %e, "TLS handshake error");
                                return;
                            }
                        }
                    }
                };
                let info = ConnInfo {
                    peer,
                    local,
                    alpn: conn.alpn(),
                };
                handle(conn, info, cancel).await;
            });
        }
        info!(%addr, "stopped accepting connections");
        Ok(())
    }
}
