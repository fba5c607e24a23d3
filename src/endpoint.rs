//! HTTP transfer endpoint.
//!
//! `GET /{size}` streams exactly `size` filler bytes; `PUT /{size}` consumes
//! exactly `size` bytes of the request body and answers 204. `HEAD /{size}`
//! answers with the download headers and starts no session. The handlers know
//! nothing about the transport: HTTP/1.1, HTTP/2 over TLS and h2c differ only
//! in how [`HttpServer`] sets up each connection.
//!
//! A transfer cut by server shutdown fails its session; an interrupted upload
//! answers 503 rather than blaming the client.

use std::io;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::StreamExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::debug;

use crate::config::{AlpnPolicy, H2Tuning, ServerConfig, Transport};
use crate::emitter::Emitter;
use crate::error::{PerfError, Result};
use crate::meter::{Meter, Metered, Session};
use crate::server::{ConnInfo, Listener};
use crate::source::{Bounded, Cancellable, FillSource};
use crate::spec::{Direction, Origin};
use crate::tls;

/// Shared by every request of one server.
#[derive(Clone)]
pub struct EndpointState {
    transport: Transport,
    emitter: Arc<dyn Emitter>,
    cancel: CancellationToken,
}

impl EndpointState {
    /// State for handlers serving `transport`.
    pub fn new(
        transport: Transport,
        emitter: Arc<dyn Emitter>,
        cancel: CancellationToken,
    ) -> Self {
        EndpointState {
            transport,
            emitter,
            cancel,
        }
    }

    fn session(&self, direction: Direction, size: u64, request: &Request) -> Arc<Session> {
        let mut session = Session::new(direction, self.transport, Origin::Server);
        session.bytes = Some(size);
        session.proto = Some(format!("{:?}", request.version()));
        if let Some(info) = request.extensions().get::<ConnInfo>() {
            session.peer = Some(info.peer);
            session.local = info.local;
            session.alpn = info.alpn.clone();
        }
        Arc::new(session)
    }

    fn parse_size(&self, direction: Direction, raw: &str) -> Option<u64> {
        match parse_size(raw) {
            Ok(size) => Some(size),
            Err(_) => {
                self.emitter.on_rejected(self.transport, direction, raw);
                None
            }
        }
    }
}

/// Parse a decimal, non-negative byte count.
pub fn parse_size(raw: &str) -> Result<u64> {
    raw.parse::<i64>()
        .ok()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| PerfError::InvalidSize(raw.to_owned()))
}

/// Routes for the transfer endpoint.
pub fn router(state: EndpointState) -> Router {
    Router::new()
        .route("/{size}", get(download).head(describe).put(upload))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

fn octets(size: u64) -> [(HeaderName, HeaderValue); 2] {
    [
        (header::CONTENT_LENGTH, HeaderValue::from(size)),
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        ),
    ]
}

/// `HEAD /{size}`: the headers a download would carry, without a transfer.
async fn describe(State(state): State<EndpointState>, Path(raw): Path<String>) -> Response {
    match state.parse_size(Direction::Download, &raw) {
        Some(size) => (StatusCode::OK, octets(size)).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// `GET /{size}`: stream the requested number of filler bytes.
async fn download(
    State(state): State<EndpointState>,
    Path(raw): Path<String>,
    request: Request,
) -> Response {
    let Some(size) = state.parse_size(Direction::Download, &raw) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let session = state.session(Direction::Download, size, &request);
    state.emitter.on_starting(&session);

    let source = Cancellable::new(FillSource::new(), state.cancel.clone());
    let body = Metered::new(
        Bounded::new(source, size),
        Meter::start(),
        session,
        state.emitter.clone(),
    );
    (StatusCode::OK, octets(size), Body::from_stream(body)).into_response()
}

/// `PUT /{size}`: consume and discard exactly `size` bytes of the body.
async fn upload(
    State(state): State<EndpointState>,
    Path(raw): Path<String>,
    request: Request,
) -> StatusCode {
    let Some(size) = state.parse_size(Direction::Upload, &raw) else {
        return StatusCode::BAD_REQUEST;
    };
    let session = state.session(Direction::Upload, size, &request);
    state.emitter.on_starting(&session);

    let inbound = Cancellable::new(request.into_body().into_data_stream(), state.cancel.clone());
    let mut body = Metered::new(
        Bounded::new(inbound, size),
        Meter::start(),
        session,
        state.emitter.clone(),
    );
    while let Some(chunk) = body.next().await {
        if let Err(e) = chunk {
            if state.cancel.is_cancelled() {
                return StatusCode::SERVICE_UNAVAILABLE;
            }
            // a body shorter than announced is the client's fault
            return if e.kind() == io::ErrorKind::UnexpectedEof {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
        }
    }
    StatusCode::NO_CONTENT
}

/// HTTP/1.1, HTTP/2-over-TLS or h2c transfer server.
pub struct HttpServer {
    listener: Listener,
    builder: Builder<TokioExecutor>,
    transport: Transport,
    emitter: Arc<dyn Emitter>,
}

fn connection_builder(transport: Transport, h2: &H2Tuning) -> Builder<TokioExecutor> {
    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http2()
        .initial_stream_window_size(h2.stream_window)
        .initial_connection_window_size(h2.connection_window)
        .max_frame_size(h2.max_frame_size);
    match transport {
        Transport::Http1 => builder.http1_only(),
        _ => builder,
    }
}

impl HttpServer {
    /// Validate `config`, load TLS material and bind the listening socket.
    pub async fn bind(config: &ServerConfig, emitter: Arc<dyn Emitter>) -> Result<Self> {
        config.validate()?;
        if !config.transport.is_http() {
            return Err(PerfError::Config(format!(
                "{} is not an HTTP transport",
                config.transport
            )));
        }
        let alpn = match config.transport {
            Transport::Http2 => config.alpn,
            _ => AlpnPolicy::Http1Only,
        };
        let acceptor = config
            .tls
            .as_ref()
            .map(|files| tls::acceptor(files, alpn.protocols()))
            .transpose()?;
        Ok(HttpServer {
            listener: Listener::bind(config.addr, acceptor).await?,
            builder: connection_builder(config.transport, &config.h2),
            transport: config.transport,
            emitter,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `cancel` fires. Cancellation also aborts in-flight
    /// transfers and closes their connections.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let app = router(EndpointState::new(self.transport, self.emitter, cancel.clone()));
        let builder = self.builder;

        self.listener
            .serve(cancel, move |conn, info, cancel| {
                let app = app.clone();
                let builder = builder.clone();
                async move {
                    let peer = info.peer;
                    let service =
                        hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
                            req.extensions_mut().insert(info.clone());
                            let mut app = app.clone();
                            async move { app.call(req).await }
                        });
                    tokio::select! {
                        served = builder.serve_connection(TokioIo::new(conn), service) => {
                            if let Err(e) = served {
                                debug!(%peer, error = %e, "connection error");
                            }
                        }
                        _ = cancel.cancelled() => debug!(%peer, "connection closed on shutdown"),
                    }
                }
            })
            .await
    }
}
