//! Transport configuration value objects.
//!
//! The HTTP handlers are written once; what differs between HTTP/1.1,
//! HTTP/2 over TLS and h2c is captured here and consumed only by connection
//! setup.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::{PerfError, Result};
use crate::params;
use crate::spec::Direction;

/// Transport stack a session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain HTTP/1.1 over TCP.
    Http1,
    /// HTTP/2 (or HTTP/1.1, per ALPN) over TLS.
    Http2,
    /// HTTP/2 over cleartext TCP with prior knowledge.
    H2c,
    /// ndt7 over WebSocket.
    Ndt7,
}

impl Transport {
    /// Port used when the caller does not pick one.
    pub fn default_port(self) -> u16 {
        match self {
            Transport::Http1 => 8080,
            Transport::Http2 | Transport::H2c => 4443,
            Transport::Ndt7 => 4567,
        }
    }

    /// Whether this transport is one of the HTTP transfer endpoints.
    pub fn is_http(self) -> bool {
        !matches!(self, Transport::Ndt7)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Http1 => "http1",
            Transport::Http2 => "http2",
            Transport::H2c => "h2c",
            Transport::Ndt7 => "ndt7",
        };
        f.write_str(name)
    }
}

/// Which application protocols TLS may negotiate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AlpnPolicy {
    /// Pin negotiation to `http/1.1`.
    Http1Only,
    /// Offer `h2`, falling back to `http/1.1`.
    #[default]
    Http2,
}

impl AlpnPolicy {
    /// ALPN identifiers in preference order.
    pub fn protocols(self) -> Vec<Vec<u8>> {
        match self {
            AlpnPolicy::Http1Only => vec![b"http/1.1".to_vec()],
            AlpnPolicy::Http2 => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        }
    }
}

/// Server certificate chain and private key, both PEM files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// Certificate chain.
    pub cert: PathBuf,
    /// Private key.
    pub key: PathBuf,
}

/// HTTP/2 flow-control tuning. The defaults are sized so that window updates
/// never cap a single bulk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2Tuning {
    /// Initial per-stream receive window.
    pub stream_window: u32,
    /// Initial per-connection receive window.
    pub connection_window: u32,
    /// Largest frame payload we accept.
    pub max_frame_size: u32,
}

impl Default for H2Tuning {
    fn default() -> Self {
        H2Tuning {
            stream_window: params::H2_WINDOW_SIZE,
            connection_window: params::H2_WINDOW_SIZE,
            max_frame_size: params::H2_MAX_FRAME_SIZE,
        }
    }
}

/// Server-side ndt7 limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ndt7Options {
    /// How long a download session sends payload.
    pub send_duration: Duration,
    /// How long an upload session waits for the client.
    pub receive_timeout: Duration,
    /// Optional cap on payload bytes per download session.
    pub max_bytes: Option<u64>,
}

impl Default for Ndt7Options {
    fn default() -> Self {
        Ndt7Options {
            send_duration: params::SEND_DURATION,
            receive_timeout: params::RECEIVE_TIMEOUT,
            max_bytes: None,
        }
    }
}

/// Everything a server needs to start listening.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub addr: SocketAddr,
    /// Transport to serve.
    pub transport: Transport,
    /// TLS material; `None` serves cleartext.
    pub tls: Option<TlsFiles>,
    /// ALPN offered during the TLS handshake.
    pub alpn: AlpnPolicy,
    /// HTTP/2 flow-control tuning.
    pub h2: H2Tuning,
    /// ndt7 session limits.
    pub ndt7: Ndt7Options,
}

impl ServerConfig {
    /// Cleartext configuration for `transport` with default tuning.
    pub fn new(transport: Transport, addr: SocketAddr) -> Self {
        ServerConfig {
            addr,
            transport,
            tls: None,
            alpn: AlpnPolicy::default(),
            h2: H2Tuning::default(),
            ndt7: Ndt7Options::default(),
        }
    }

    /// Attach TLS material.
    pub fn with_tls(mut self, files: TlsFiles) -> Self {
        self.tls = Some(files);
        self
    }

    /// Check that the transport and TLS material agree.
    pub fn validate(&self) -> Result<()> {
        match (self.transport, &self.tls) {
            (Transport::Http2, None) => Err(PerfError::Config(
                "http2 requires a certificate and a private key".into(),
            )),
            (Transport::Http1 | Transport::H2c, Some(_)) => Err(PerfError::Config(format!(
                "{} is a cleartext transport and takes no TLS material",
                self.transport
            ))),
            _ => Ok(()),
        }
    }
}

/// Everything a measurement run needs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Transport to measure.
    pub transport: Transport,
    /// Download (GET) or upload (PUT).
    pub direction: Direction,
    /// Bytes to move. Required for HTTP; an optional cap for ndt7.
    pub bytes: Option<u64>,
    /// ndt7 only: how long to send, or how long to wait when receiving.
    pub duration: Duration,
    /// Use TLS. Fixed by the transport for HTTP, a choice for ndt7.
    pub secure: bool,
    /// CA certificate to trust instead of the public web roots.
    pub ca_cert: Option<PathBuf>,
    /// ALPN policy for HTTP over TLS.
    pub alpn: AlpnPolicy,
    /// HTTP/2 flow-control tuning.
    pub h2: H2Tuning,
}

impl ClientConfig {
    /// Configuration with the transport's defaults.
    pub fn new(
        transport: Transport,
        direction: Direction,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let (bytes, duration) = match (transport, direction) {
            (Transport::Ndt7, Direction::Download) => (None, params::RECEIVE_TIMEOUT),
            (Transport::Ndt7, Direction::Upload) => (None, params::SEND_DURATION),
            _ => (Some(params::DEFAULT_TRANSFER_BYTES), params::RECEIVE_TIMEOUT),
        };
        ClientConfig {
            host: host.into(),
            port,
            transport,
            direction,
            bytes,
            duration,
            secure: matches!(transport, Transport::Http2 | Transport::Ndt7),
            ca_cert: None,
            alpn: AlpnPolicy::Http1Only,
            h2: H2Tuning::default(),
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Check that the transport, TLS choice and byte count agree.
    pub fn validate(&self) -> Result<()> {
        match self.transport {
            Transport::Http2 if !self.secure => {
                return Err(PerfError::Config("http2 always runs over TLS".into()));
            }
            Transport::Http1 | Transport::H2c if self.secure => {
                return Err(PerfError::Config(format!(
                    "{} is a cleartext transport",
                    self.transport
                )));
            }
            _ => {}
        }
        if self.transport.is_http() && self.bytes.is_none() {
            return Err(PerfError::Config(format!(
                "{} needs a byte count",
                self.transport
            )));
        }
        if self.ca_cert.is_some() && !self.secure {
            return Err(PerfError::Config(
                "a CA certificate was given for a cleartext run".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn files() -> TlsFiles {
        TlsFiles {
            cert: "cert.pem".into(),
            key: "key.pem".into(),
        }
    }

    #[test]
    fn http2_server_needs_tls() {
        let config = ServerConfig::new(Transport::Http2, loopback());
        assert!(matches!(config.validate(), Err(PerfError::Config(_))));
        assert!(config.with_tls(files()).validate().is_ok());
    }

    #[test]
    fn cleartext_servers_refuse_tls() {
        for transport in [Transport::Http1, Transport::H2c] {
            let config = ServerConfig::new(transport, loopback()).with_tls(files());
            assert!(config.validate().is_err(), "{transport}");
        }
    }

    #[test]
    fn ndt7_server_takes_either() {
        let config = ServerConfig::new(Transport::Ndt7, loopback());
        assert!(config.validate().is_ok());
        assert!(config.with_tls(files()).validate().is_ok());
    }

    #[test]
    fn client_defaults_follow_transport() {
        let http2 = ClientConfig::new(Transport::Http2, Direction::Download, "127.0.0.1", 4443);
        assert!(http2.secure);
        assert!(http2.validate().is_ok());

        let h2c = ClientConfig::new(Transport::H2c, Direction::Upload, "127.0.0.1", 4443);
        assert!(!h2c.secure);
        assert!(h2c.validate().is_ok());

        let ndt7 = ClientConfig::new(Transport::Ndt7, Direction::Upload, "127.0.0.1", 4567);
        assert_eq!(ndt7.bytes, None);
        assert_eq!(ndt7.duration, params::SEND_DURATION);
    }

    #[test]
    fn http_client_needs_bytes() {
        let mut config = ClientConfig::new(Transport::Http1, Direction::Download, "::1", 8080);
        config.bytes = None;
        assert!(config.validate().is_err());
        assert_eq!(config.authority(), "[::1]:8080");
    }

    #[test]
    fn alpn_lists() {
        assert_eq!(AlpnPolicy::Http1Only.protocols(), vec![b"http/1.1".to_vec()]);
        assert_eq!(AlpnPolicy::Http2.protocols()[0], b"h2".to_vec());
    }
}
