//! # pipeget
//!
//! Parallel chunked file transfer over a custom application-level protocol.
//!
//! A server offers the plain files under its resource directory; a client
//! splits each target into byte ranges and fetches them over parallel
//! channels. Two transport bindings are available:
//!
//! - **stream** — a TCP control connection (`LIST` / `OPEN` / `GET`) plus N
//!   dedicated data connections per session
//! - **datagram** — UDP request/reply with per-range worker sockets and
//!   CRC32 checksum-and-retry
//!
//! ## Subcommands
//!
//! - `pipeget serve` — run the server (both bindings unless `--transport`)
//! - `pipeget fetch` — run the download scheduler against a manifest
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, graceful shutdown
//! config.rs      — TOML + env-var configuration
//! catalog.rs     — resource directory enumeration
//! plan.rs        — range partitioning and channel assignment
//! proto/         — wire codecs (stream frames, datagram messages)
//! server/        — stream and datagram dispatchers
//! client/        — channel set, datagram workers, download scheduler
//! reassemble.rs  — part concatenation and integrity checks
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pipeget::client::{DownloadScheduler, Transport};
use pipeget::server::{DatagramServer, StreamServer};
use pipeget::Config;

/// Parallel chunked file transfer client and server.
#[derive(Parser)]
#[command(name = "pipeget", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transfer server.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Serve only one transport binding (default: both).
        #[arg(long, value_enum)]
        transport: Option<Transport>,
    },
    /// Run the download scheduler.
    Fetch {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Transport binding to fetch over.
        #[arg(long, value_enum, default_value = "stream")]
        transport: Transport,
        /// Run a single pass and exit instead of looping.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, transport } => run_server(config.as_deref(), transport).await,
        Commands::Fetch {
            config,
            transport,
            once,
        } => run_fetch(config.as_deref(), transport, once).await,
    }
}

fn init(config_path: Option<&str>) -> (Arc<Config>, CancellationToken) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("pipeget v{} starting", env!("CARGO_PKG_VERSION"));

    // One token observed by every blocking loop; cancelled on SIGINT/SIGTERM.
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    (Arc::new(config), shutdown)
}

async fn run_server(config_path: Option<&str>, transport: Option<Transport>) {
    let (config, shutdown) = init(config_path);

    let serve_stream = transport.is_none() || transport == Some(Transport::Stream);
    let serve_datagram = transport.is_none() || transport == Some(Transport::Datagram);
    let mut tasks = Vec::new();

    if serve_stream {
        let listener = TcpListener::bind(&config.server.listen)
            .await
            .expect("Failed to bind control listener");
        let server = StreamServer::new(Arc::clone(&config));
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve(listener, token).await {
                error!("Stream server failed: {e}");
            }
        }));
    }

    if serve_datagram {
        let base: SocketAddr = config
            .server
            .datagram_listen
            .parse()
            .expect("Bad datagram listen address");
        let mut sockets = Vec::new();
        for i in 0..config.server.datagram_ports.max(1) {
            let addr = SocketAddr::new(base.ip(), base.port() + i);
            let socket = UdpSocket::bind(addr)
                .await
                .expect("Failed to bind datagram socket");
            sockets.push(socket);
        }
        let server = DatagramServer::new(Arc::clone(&config));
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve_all(sockets, token).await {
                error!("Datagram server failed: {e}");
            }
        }));
    }

    info!("Server ready");
    for task in tasks {
        let _ = task.await;
    }
    info!("Goodbye");
}

async fn run_fetch(config_path: Option<&str>, transport: Transport, once: bool) {
    let (config, shutdown) = init(config_path);
    let scheduler = DownloadScheduler::new(config, transport);

    if once {
        match scheduler.run_pass(&shutdown).await {
            Ok(report) => info!(
                satisfied = report.satisfied,
                fetched = report.fetched,
                failed = report.failed,
                missing = report.missing,
                "Pass complete"
            ),
            Err(e) => {
                error!("Pass failed: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = scheduler.run(shutdown).await {
        error!("Scheduler failed: {e}");
        std::process::exit(1);
    }
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
