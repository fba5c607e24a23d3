//! ndt7 server: WebSocket handshake and role dispatch.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{AlpnPolicy, Ndt7Options, ServerConfig, Transport};
use crate::emitter::Emitter;
use crate::error::{PerfError, Result};
use crate::meter::{Outcome, Session};
use crate::ndt7::{Limits, receiver, sender};
use crate::params;
use crate::server::{Conn, ConnInfo, Listener};
use crate::spec::{Direction, Origin};
use crate::tls;

/// Serves `/ndt/v7/download` and `/ndt/v7/upload`.
pub struct Ndt7Server {
    listener: Listener,
    options: Ndt7Options,
    emitter: Arc<dyn Emitter>,
}

impl Ndt7Server {
    /// Validate `config`, load TLS material if any and bind.
    pub async fn bind(config: &ServerConfig, emitter: Arc<dyn Emitter>) -> Result<Self> {
        config.validate()?;
        if config.transport != Transport::Ndt7 {
            return Err(PerfError::Config(format!(
                "{} is not served by the ndt7 server",
                config.transport
            )));
        }
        // WebSocket upgrades only exist in HTTP/1.1
        let acceptor = config
            .tls
            .as_ref()
            .map(|files| tls::acceptor(files, AlpnPolicy::Http1Only.protocols()))
            .transpose()?;
        Ok(Ndt7Server {
            listener: Listener::bind(config.addr, acceptor).await?,
            options: config.ndt7,
            emitter,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `cancel` fires; running sessions are cancelled with it.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let options = self.options;
        let emitter = self.emitter;
        self.listener
            .serve(cancel, move |conn, info, cancel| {
                let emitter = emitter.clone();
                async move {
                    let peer = info.peer;
                    if let Err(e) = serve_session(conn, info, options, emitter, cancel).await {
                        debug!(%peer, error = %e, "ndt7 session ended with error");
                    }
                }
            })
            .await
    }
}

type Handshake<T> = std::result::Result<T, ErrorResponse>;

/// Map a handshake request onto a test direction. Rejections carry the
/// response the client gets instead of the upgrade.
fn check_request(req: &Request) -> Handshake<Direction> {
    let direction = match req.uri().path() {
        params::DOWNLOAD_URL_PATH => Direction::Download,
        params::UPLOAD_URL_PATH => Direction::Upload,
        _ => return Err(reject(StatusCode::NOT_FOUND)),
    };
    let offered = req
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == params::SEC_WEBSOCKET_PROTOCOL);
    if !offered {
        return Err(reject(StatusCode::BAD_REQUEST));
    }
    Ok(direction)
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut resp = ErrorResponse::new(None);
    *resp.status_mut() = status;
    resp
}

async fn serve_session(
    conn: Conn,
    info: ConnInfo,
    options: Ndt7Options,
    emitter: Arc<dyn Emitter>,
    cancel: CancellationToken,
) -> Result<Outcome> {
    let mut direction = None;
    let callback = |req: &Request, mut resp: Response| -> Handshake<Response> {
        let d = check_request(req).inspect_err(|e| {
            debug!(path = req.uri().path(), status = %e.status(), "ndt7 handshake rejected");
        })?;
        resp.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(params::SEC_WEBSOCKET_PROTOCOL),
        );
        direction = Some(d);
        Ok(resp)
    };
    let ws = tokio::select! {
        _ = cancel.cancelled() => return Err(PerfError::Cancelled),
        ws = timeout(params::IO_TIMEOUT, accept_hdr_async(conn, callback)) => {
            ws.map_err(|_| PerfError::Timeout)??
        }
    };
    let direction =
        direction.ok_or_else(|| PerfError::Protocol("handshake without a test path".into()))?;

    let mut session = Session::new(direction, Transport::Ndt7, Origin::Server);
    session.peer = Some(info.peer);
    session.local = info.local;
    session.alpn = info.alpn;
    session.proto = Some("HTTP/1.1".into());

    match direction {
        Direction::Download => {
            let limits = Limits {
                duration: options.send_duration,
                bytes: options.max_bytes,
            };
            sender::run(ws, session, limits, emitter, cancel).await
        }
        Direction::Upload => {
            let limits = Limits::duration(options.receive_timeout);
            receiver::run(ws, session, limits, emitter, cancel).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, protocol: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(format!("ws://localhost{path}"));
        if let Some(p) = protocol {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, p);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn paths_select_direction() {
        let dl = request(params::DOWNLOAD_URL_PATH, Some(params::SEC_WEBSOCKET_PROTOCOL));
        assert_eq!(check_request(&dl).unwrap(), Direction::Download);
        let ul = request(params::UPLOAD_URL_PATH, Some("chat, net.measurementlab.ndt.v7"));
        assert_eq!(check_request(&ul).unwrap(), Direction::Upload);
    }

    #[test]
    fn unknown_path_is_not_found() {
        let req = request("/ndt/v7/other", Some(params::SEC_WEBSOCKET_PROTOCOL));
        assert_eq!(check_request(&req).unwrap_err().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn missing_subprotocol_is_bad_request() {
        let req = request(params::DOWNLOAD_URL_PATH, None);
        assert_eq!(check_request(&req).unwrap_err().status(), StatusCode::BAD_REQUEST);
        let req = request(params::DOWNLOAD_URL_PATH, Some("chat"));
        assert_eq!(check_request(&req).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bind_refuses_http_transports() {
        let config = ServerConfig::new(Transport::Http1, "127.0.0.1:0".parse().unwrap());
        let emitter = Arc::new(crate::emitter::tests::Recorder::default());
        assert!(matches!(
            Ndt7Server::bind(&config, emitter).await,
            Err(PerfError::Config(_))
        ));
    }
}
