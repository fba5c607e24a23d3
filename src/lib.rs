//! Throughput benchmarking over HTTP/1.1, HTTP/2 over TLS, h2c and
//! [ndt7](https://github.com/m-lab/ndt-server/blob/master/spec/ndt7-protocol.md).
//!
//! The HTTP servers expose one endpoint: `GET /{n}` streams exactly `n`
//! filler bytes and `PUT /{n}` consumes exactly `n` bytes of the request
//! body. The ndt7 server runs timed WebSocket sessions in which both sides
//! report their own measurements while payload flows one way. The same
//! crate provides the measurement client for every transport.
//!
//! Events (progress, completion, errors) go through an [`emitter::Emitter`]
//! chosen by the caller.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use h2perf::client::Client;
//! use h2perf::config::{ClientConfig, Transport};
//! use h2perf::emitter::TracingEmitter;
//! use h2perf::spec::Direction;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ClientConfig::new(Transport::H2c, Direction::Download, "127.0.0.1", 4443);
//! config.bytes = Some(1 << 30);
//!
//! let client = Client::new(config, Arc::new(TracingEmitter));
//! let outcome = client.measure(CancellationToken::new()).await?;
//! println!("{}", outcome.local);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod emitter;
pub mod endpoint;
pub mod error;
pub mod meter;
pub mod ndt7;
pub mod params;
pub mod server;
pub mod source;
pub mod spec;
pub mod tls;
