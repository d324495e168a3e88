use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use text_tunnel::config::{DEFAULT_HOST, DEFAULT_PORT, Mode, TunnelConfig};
use text_tunnel::transport::{StdioTransport, Transport, TransportKind};
use text_tunnel::tunnel::{Client, Server};
use text_tunnel::utils::logging::init_logging;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tunnel TCP connections over a text channel", long_about = None)]
struct Args {
    /// Run as server (accept TCP connections)
    #[arg(short, long)]
    server: bool,

    /// Run as client (connect to the target for each tunnelled stream)
    #[arg(short, long)]
    client: bool,

    /// Host to listen on (server) or connect to (client)
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on (server) or connect to (client)
    #[arg(short = 'P', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Channel carrying the tunnel frames
    #[arg(short = 'p', long, value_enum, default_value = "stdio")]
    transport: TransportKind,

    /// Debug logging for the tunnel (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

// The stdin reader parks on a blocking thread that only returns with the next
// line; don't let runtime teardown wait for it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mode = Mode::from_flags(args.server, args.client)?;
    let mut config = TunnelConfig::new(mode);
    config.host = args.host;
    config.port = args.port;
    config.transport = args.transport;

    tracing::info!(mode = ?config.mode, address = %config.address(), transport = ?config.transport, "starting tunnel");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let result = runtime.block_on(async {
        match config.transport {
            TransportKind::Stdio => run(config, Arc::new(StdioTransport::stdio())).await,
        }
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run<T: Transport>(config: TunnelConfig, transport: Arc<T>) -> Result<()> {
    let result = match config.mode {
        Mode::Server => {
            let server = Server::new(config.host, config.port, Arc::clone(&transport));
            stop_on_ctrl_c({
                let server = server.clone();
                move || server.stop()
            });
            tokio::try_join!(server.start(), async {
                transport.start().await.context("Failed to start transport")
            })
            .map(|_| ())
        }
        Mode::Client => {
            let client = Client::new(config.host, config.port, Arc::clone(&transport));
            stop_on_ctrl_c({
                let client = client.clone();
                move || client.stop()
            });
            tokio::try_join!(client.start(), async {
                transport.start().await.context("Failed to start transport")
            })
            .map(|_| ())
        }
    };

    transport.stop().await.context("Failed to stop transport")?;
    result
}

fn stop_on_ctrl_c(stop: impl FnOnce() + Send + 'static) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C, shutting down");
            stop();
        }
    });
}
