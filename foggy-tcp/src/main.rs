//! Entry point for `foggy-tcp`.
//!
//! A small file-transfer driver: the server accepts one connection and writes
//! everything it receives to a file; the client streams a file to the server
//! and reports how long the transfer took.  Protocol work is delegated to the
//! library; `main.rs` owns only process setup (logging, argument parsing).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::Instant;

use foggy_tcp::{Config, Connection, Listener, UdpTransport};

/// Reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Maximum payload bytes per segment.
    #[arg(long, global = true, default_value_t = 1400)]
    mss: usize,

    /// Initial retransmission timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 1000)]
    initial_rto_ms: u64,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept one connection and save the received stream.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:3120).
        #[arg(short, long, default_value = "0.0.0.0:3120")]
        bind: SocketAddr,
        /// Where to write the received bytes.
        #[arg(short, long, default_value = "received.bin")]
        output: PathBuf,
    },
    /// Connect to a server and send a file.
    Client {
        /// Remote server address (e.g. 127.0.0.1:3120).
        #[arg(short, long)]
        server: SocketAddr,
        /// File to send.
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = Config {
        mss: cli.mss,
        initial_rto: Duration::from_millis(cli.initial_rto_ms),
        ..Config::default()
    };
    config.validate().context("invalid configuration")?;

    match cli.mode {
        Mode::Server { bind, output } => run_server(bind, output, config).await,
        Mode::Client { server, file } => run_client(server, file, config).await,
    }
}

async fn run_server(bind: SocketAddr, output: PathBuf, config: Config) -> Result<()> {
    let transport = UdpTransport::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let listener = Listener::bind(transport, config)?;
    log::info!("[server] listening on {}", listener.local_addr());

    let conn = listener.accept().await.context("accept")?;
    log::info!("[server] connection from {}", conn.peer_addr());

    let mut received = Vec::new();
    loop {
        let chunk = conn.recv(64 * 1024).await.context("receive")?;
        if chunk.is_empty() {
            break;
        }
        received.extend_from_slice(&chunk);
    }
    conn.close().await.context("close")?;

    tokio::fs::write(&output, &received)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    println!("[server] received {} bytes into {}", received.len(), output.display());
    Ok(())
}

async fn run_client(server: SocketAddr, file: PathBuf, config: Config) -> Result<()> {
    let data = tokio::fs::read(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let local: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let transport = UdpTransport::bind(local).await.context("binding client socket")?;

    let start = Instant::now();
    let conn = Connection::open(transport, server, config)
        .await
        .with_context(|| format!("connecting to {server}"))?;
    conn.send_all(&data).await.context("send")?;
    conn.close().await.context("close")?;
    let elapsed = start.elapsed();

    let stats = conn.stats();
    println!(
        "[client] sent {} bytes in {} ms ({} retransmits, {} fast, {} timeouts)",
        data.len(),
        elapsed.as_millis(),
        stats.retransmits,
        stats.fast_retransmits,
        stats.timeout_losses
    );
    Ok(())
}
