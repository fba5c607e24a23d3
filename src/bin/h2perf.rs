use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use h2perf::client::Client;
use h2perf::config::{AlpnPolicy, ClientConfig, ServerConfig, TlsFiles, Transport};
use h2perf::emitter::{Emitter, JsonEmitter, TracingEmitter};
use h2perf::endpoint::HttpServer;
use h2perf::ndt7::Ndt7Server;
use h2perf::spec::Direction;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, clap::ValueEnum)]
enum Format {
    Log,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Method {
    #[value(name = "GET")]
    Get,
    #[value(name = "PUT")]
    Put,
}

impl From<Method> for Direction {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => Direction::Download,
            Method::Put => Direction::Upload,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Output format for session events: 'log' or 'json' for batch processing
    #[arg(long, global = true, default_value = "log")]
    format: Format,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the transfer endpoint
    Serve(ServeArgs),
    /// Run one measurement against a server
    Measure(MeasureArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Transport to serve
    transport: Transport,
    /// Address to listen on
    #[arg(short = 'A', long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    address: IpAddr,
    /// Port to listen on; defaults to the transport's port
    #[arg(short, long)]
    port: Option<u16>,
    /// PEM certificate chain
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    /// Offer only http/1.1 during the TLS handshake
    #[arg(long)]
    http1_only: bool,
    /// Serve ndt7 over cleartext WebSocket
    #[arg(long, conflicts_with_all = ["cert", "key"])]
    no_tls: bool,
    /// ndt7: seconds a download session sends payload
    #[arg(long)]
    duration: Option<f64>,
}

#[derive(Args, Debug)]
struct MeasureArgs {
    /// Transport to measure
    transport: Transport,
    /// Server address or host name
    #[arg(short = 'A', long, default_value = "127.0.0.1")]
    address: String,
    /// Server port; defaults to the transport's port
    #[arg(short, long)]
    port: Option<u16>,
    /// Bytes to transfer (HTTP); optional byte cap for an ndt7 upload
    #[arg(short = 'n', long)]
    bytes: Option<u64>,
    /// GET downloads, PUT uploads
    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,
    /// CA certificate to trust instead of the public web roots
    #[arg(long)]
    ca_cert: Option<PathBuf>,
    /// Allow HTTP/2 during ALPN negotiation (http2 transport)
    #[arg(short = '2', long)]
    http2: bool,
    /// Connect to ndt7 over cleartext WebSocket
    #[arg(long, conflicts_with = "ca_cert")]
    no_tls: bool,
    /// ndt7: seconds to send, or to wait for the server when downloading
    #[arg(long)]
    duration: Option<f64>,
}

fn seconds(s: f64) -> Result<Duration, Box<dyn std::error::Error>> {
    Ok(Duration::try_from_secs_f64(s)?)
}

fn server_config(args: &ServeArgs) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let port = args.port.unwrap_or(args.transport.default_port());
    let mut config = ServerConfig::new(args.transport, SocketAddr::new(args.address, port));
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        config = config.with_tls(TlsFiles {
            cert: cert.clone(),
            key: key.clone(),
        });
    }
    if args.http1_only {
        config.alpn = AlpnPolicy::Http1Only;
    }
    if args.transport == Transport::Ndt7 && config.tls.is_none() && !args.no_tls {
        return Err("ndt7 needs --cert and --key, or --no-tls for cleartext".into());
    }
    if let Some(d) = args.duration {
        config.ndt7.send_duration = seconds(d)?;
    }
    Ok(config)
}

fn client_config(args: &MeasureArgs) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let port = args.port.unwrap_or(args.transport.default_port());
    let mut config = ClientConfig::new(args.transport, args.method.into(), &args.address, port);
    if args.bytes.is_some() {
        config.bytes = args.bytes;
    }
    config.ca_cert = args.ca_cert.clone();
    if args.http2 {
        config.alpn = AlpnPolicy::Http2;
    }
    if args.transport == Transport::Ndt7 && args.no_tls {
        config.secure = false;
    }
    if let Some(d) = args.duration {
        config.duration = seconds(d)?;
    }
    Ok(config)
}

async fn serve(
    args: ServeArgs,
    emitter: Arc<dyn Emitter>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = server_config(&args)?;
    match config.transport {
        Transport::Ndt7 => {
            let server = Ndt7Server::bind(&config, emitter).await?;
            info!(addr = %server.local_addr()?, "ndt7 server listening");
            server.run(cancel).await?;
        }
        _ => {
            let server = HttpServer::bind(&config, emitter).await?;
            info!(
                addr = %server.local_addr()?,
                transport = %config.transport,
                "HTTP server listening"
            );
            server.run(cancel).await?;
        }
    }
    Ok(())
}

async fn measure(
    args: MeasureArgs,
    emitter: Arc<dyn Emitter>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new(client_config(&args)?, emitter);
    let outcome = client.measure(cancel).await?;
    info!(result = %outcome.local, "measurement done");
    if let Some(peer) = outcome.peer.as_ref().and_then(|m| m.num_bytes()) {
        if peer != outcome.local.bytes {
            warn!(local = outcome.local.bytes, peer, "peer counted a different byte total");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let emitter: Arc<dyn Emitter> = match cli.format {
        Format::Log => Arc::new(TracingEmitter),
        Format::Json => Arc::new(JsonEmitter::new(std::io::stdout())),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Serve(args) => serve(args, emitter, cancel).await,
        Command::Measure(args) => measure(args, emitter, cancel).await,
    }
}
