//! Measurement client for every transport.
//!
//! HTTP transports download with `GET /{n}` or upload with `PUT /{n}` and
//! count the body through a [`Metered`] stream. ndt7 connects a WebSocket to
//! `/ndt/v7/download` or `/ndt/v7/upload` and runs the matching role.

use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, StatusCode, Version};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::{Connector, MaybeTlsStream, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::{AlpnPolicy, ClientConfig, Transport};
use crate::emitter::Emitter;
use crate::error::{PerfError, Result};
use crate::meter::{Meter, Metered, Outcome, Session};
use crate::ndt7::{Limits, receiver, sender};
use crate::params;
use crate::source::{Bounded, FillSource};
use crate::spec::{Direction, Origin};
use crate::tls;

/// Type alias for the WebSocket stream
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Runs one measurement against a server.
pub struct Client {
    config: ClientConfig,
    emitter: Arc<dyn Emitter>,
    /// Reported to ndt7 servers as `client_name`.
    pub client_name: String,
    /// Reported to ndt7 servers as `client_version`.
    pub client_version: String,
}

impl Client {
    /// A client identifying itself with this crate's name and version.
    pub fn new(config: ClientConfig, emitter: Arc<dyn Emitter>) -> Self {
        Client {
            config,
            emitter,
            client_name: env!("CARGO_PKG_NAME").to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Override the ndt7 client metadata.
    pub fn with_client_name(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = name.into();
        self.client_version = version.into();
        self
    }

    /// The configuration this client runs.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run the configured measurement until it completes, fails or `cancel`
    /// fires.
    pub async fn measure(&self, cancel: CancellationToken) -> Result<Outcome> {
        self.config.validate()?;
        match self.config.transport {
            Transport::Ndt7 => self.ndt7(cancel).await,
            _ => self.http(cancel).await,
        }
    }

    fn http_url(&self, n: u64) -> String {
        let scheme = if self.config.secure { "https" } else { "http" };
        format!("{scheme}://{}/{n}", self.config.authority())
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        let config = &self.config;
        let builder = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(params::IO_TIMEOUT)
            .http2_initial_stream_window_size(config.h2.stream_window)
            .http2_initial_connection_window_size(config.h2.connection_window)
            .http2_max_frame_size(config.h2.max_frame_size);
        let builder = match config.transport {
            Transport::H2c => builder.http2_prior_knowledge(),
            Transport::Http2 => {
                let tls = tls::client_config(config.ca_cert.as_deref(), config.alpn.protocols())?;
                let builder = builder.use_preconfigured_tls(tls);
                match config.alpn {
                    AlpnPolicy::Http1Only => builder.http1_only(),
                    AlpnPolicy::Http2 => builder,
                }
            }
            _ => builder.http1_only(),
        };
        Ok(builder.build()?)
    }

    // Every started session ends in exactly one on_complete or on_error,
    // and only after the server's answer has been checked.
    async fn http(&self, cancel: CancellationToken) -> Result<Outcome> {
        let n = self.config.bytes.ok_or_else(|| {
            PerfError::Config(format!("{} needs a byte count", self.config.transport))
        })?;
        let client = self.http_client()?;
        let url = self.http_url(n);
        debug!(%url, direction = %self.config.direction, "starting HTTP measurement");

        let mut session = Session::new(
            self.config.direction,
            self.config.transport,
            Origin::Client,
        );
        session.bytes = Some(n);
        self.emitter.on_starting(&session);

        let meter = Meter::start();
        let transfer = async {
            match self.config.direction {
                Direction::Download => self.download(&client, &url, n, &meter, &mut session).await,
                Direction::Upload => self.upload(&client, &url, n, &meter, &mut session).await,
            }
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(PerfError::Cancelled),
            result = transfer => result,
        };

        let local = meter.snapshot();
        match result {
            Ok(()) => {
                self.emitter.on_complete(&session, &local);
                Ok(Outcome { local, peer: None })
            }
            Err(e) => {
                self.emitter.on_error(&session, &e.to_string(), &local);
                Err(e)
            }
        }
    }

    fn answered(&self, session: &mut Session, resp: &reqwest::Response) {
        session.peer = resp.remote_addr();
        session.proto = Some(format!("{:?}", resp.version()));
        session.alpn = self.negotiated_alpn(resp.version());
        info!(
            status = %resp.status(),
            proto = ?session.proto,
            alpn = ?session.alpn,
            direction = %session.direction,
            "server answered"
        );
    }

    async fn download(
        &self,
        client: &reqwest::Client,
        url: &str,
        n: u64,
        meter: &Meter,
        session: &mut Session,
    ) -> Result<()> {
        let resp = client.get(url).send().await?;
        self.answered(session, &resp);
        if resp.status() != StatusCode::OK {
            return Err(PerfError::UnexpectedStatus(resp.status().as_u16()));
        }
        if let Some(len) = resp.content_length().filter(|&len| len != n) {
            return Err(PerfError::Protocol(format!(
                "server announced {len} bytes, {n} requested"
            )));
        }

        let mut body = Metered::progress_only(
            Bounded::new(Box::pin(resp.bytes_stream()), n),
            meter.clone(),
            Arc::new(session.clone()),
            self.emitter.clone(),
        );
        while let Some(chunk) = body.next().await {
            chunk?;
        }
        Ok(())
    }

    async fn upload(
        &self,
        client: &reqwest::Client,
        url: &str,
        n: u64,
        meter: &Meter,
        session: &mut Session,
    ) -> Result<()> {
        let body = Metered::progress_only(
            Bounded::new(FillSource::new(), n),
            meter.clone(),
            Arc::new(session.clone()),
            self.emitter.clone(),
        );
        let resp = client
            .put(url)
            .header(CONTENT_LENGTH, n)
            .body(Body::wrap_stream(body))
            .send()
            .await?;
        self.answered(session, &resp);
        if resp.status() != StatusCode::NO_CONTENT {
            return Err(PerfError::UnexpectedStatus(resp.status().as_u16()));
        }
        Ok(())
    }

    fn negotiated_alpn(&self, version: Version) -> Option<String> {
        if !self.config.secure {
            return None;
        }
        Some(if version == Version::HTTP_2 { "h2" } else { "http/1.1" }.to_owned())
    }

    /// The ndt7 URL for the configured direction, client metadata included.
    pub fn ndt7_url(&self) -> Result<Url> {
        let scheme = if self.config.secure { "wss" } else { "ws" };
        let path = match self.config.direction {
            Direction::Download => params::DOWNLOAD_URL_PATH,
            Direction::Upload => params::UPLOAD_URL_PATH,
        };
        let mut url = Url::parse(&format!("{scheme}://{}{path}", self.config.authority()))?;
        url.query_pairs_mut()
            .append_pair("client_name", &self.client_name)
            .append_pair("client_version", &self.client_version)
            .append_pair("client_os", std::env::consts::OS)
            .append_pair("client_arch", std::env::consts::ARCH);
        Ok(url)
    }

    /// Establish the ndt7 WebSocket, offering the ndt7 subprotocol.
    pub async fn connect(&self) -> Result<WsStream> {
        let mut request = self.ndt7_url()?.as_str().into_client_request()?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(params::SEC_WEBSOCKET_PROTOCOL),
        );

        let connector = if self.config.secure {
            let tls = tls::client_config(
                self.config.ca_cert.as_deref(),
                AlpnPolicy::Http1Only.protocols(),
            )?;
            Connector::Rustls(Arc::new(tls))
        } else {
            Connector::Plain
        };
        let (ws_stream, _response) = timeout(
            params::IO_TIMEOUT,
            connect_async_tls_with_config(request, None, false, Some(connector)),
        )
        .await
        .map_err(|_| PerfError::Timeout)??;

        Ok(ws_stream)
    }

    async fn ndt7(&self, cancel: CancellationToken) -> Result<Outcome> {
        let ws = tokio::select! {
            _ = cancel.cancelled() => return Err(PerfError::Cancelled),
            ws = self.connect() => ws?,
        };

        let direction = self.config.direction;
        let mut session = Session::new(direction, Transport::Ndt7, Origin::Client);
        session.bytes = self.config.bytes;
        session.proto = Some("HTTP/1.1".into());
        match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => {
                session.peer = tcp.peer_addr().ok();
                session.local = tcp.local_addr().ok();
            }
            MaybeTlsStream::Rustls(tls) => {
                let (tcp, conn) = tls.get_ref();
                session.peer = tcp.peer_addr().ok();
                session.local = tcp.local_addr().ok();
                session.alpn = conn
                    .alpn_protocol()
                    .map(|p| String::from_utf8_lossy(p).into_owned());
            }
            _ => {}
        }

        let emitter = self.emitter.clone();
        match direction {
            Direction::Download => {
                let limits = Limits::duration(self.config.duration);
                receiver::run(ws, session, limits, emitter, cancel).await
            }
            Direction::Upload => {
                let limits = Limits {
                    duration: self.config.duration,
                    bytes: self.config.bytes,
                };
                sender::run(ws, session, limits, emitter, cancel).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::TracingEmitter;

    fn client(transport: Transport, direction: Direction, host: &str) -> Client {
        let config = ClientConfig::new(transport, direction, host, transport.default_port());
        Client::new(config, Arc::new(TracingEmitter))
    }

    #[test]
    fn http_urls_follow_transport() {
        let c = client(Transport::Http1, Direction::Download, "127.0.0.1");
        assert_eq!(c.http_url(1 << 20), "http://127.0.0.1:8080/1048576");
        let c = client(Transport::Http2, Direction::Upload, "localhost");
        assert_eq!(c.http_url(0), "https://localhost:4443/0");
    }

    #[test]
    fn ndt7_url_carries_client_metadata() {
        let c = client(Transport::Ndt7, Direction::Upload, "::1").with_client_name("probe", "9.9");
        let url = c.ndt7_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), params::UPLOAD_URL_PATH);
        assert_eq!(url.port(), Some(4567));
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("client_name".into(), "probe".into())));
        assert!(query.contains(&("client_version".into(), "9.9".into())));
        assert!(query.iter().any(|(k, _)| k == "client_os"));
        assert!(query.iter().any(|(k, _)| k == "client_arch"));
    }

    #[test]
    fn alpn_is_derived_from_version_over_tls_only() {
        let c = client(Transport::Http2, Direction::Download, "localhost");
        assert_eq!(c.negotiated_alpn(Version::HTTP_2).as_deref(), Some("h2"));
        assert_eq!(c.negotiated_alpn(Version::HTTP_11).as_deref(), Some("http/1.1"));
        let c = client(Transport::H2c, Direction::Download, "localhost");
        assert_eq!(c.negotiated_alpn(Version::HTTP_2), None);
    }

    #[tokio::test]
    async fn invalid_config_fails_before_connecting() {
        let mut config = ClientConfig::new(Transport::Http1, Direction::Download, "127.0.0.1", 1);
        config.bytes = None;
        let c = Client::new(config, Arc::new(TracingEmitter));
        let err = c.measure(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PerfError::Config(_)));
    }
}
