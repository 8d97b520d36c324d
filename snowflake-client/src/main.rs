#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use snowflake_client_lib::{load_from_path, Config, ConnectionEvent, Dialer, PeerPool, WebRtcPeer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Snowflake circumvention client")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", default_value = "client.toml")]
    config: PathBuf,
    /// Local address to forward through the snowflake tunnel
    /// (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,
}

/// How long an accepted connection will wait for a snowflake before
/// giving up.
const POP_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match load_from_path(&cli.config) {
        Ok(cfg) => {
            init_tracing(&cfg.logging.level, cfg.logging.show_target);
            if let Err(err) = run(cli, cfg).await {
                error!(%err, "client exited with error");
                std::process::exit(1);
            }
        }
        Err(err) => {
            init_tracing("info", false);
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    }
}

fn init_tracing(level: &str, show_target: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(show_target)
        .init();
}

async fn run(cli: Cli, cfg: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listen = cli
        .listen
        .or(cfg.listen)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 1080)));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let dialer = Arc::new(Dialer::from_config(&cfg)?.with_events(event_tx));
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ConnectionEvent::Connected => info!("snowflake connected"),
                ConnectionEvent::Failed { reason } => info!(%reason, "snowflake failed"),
            }
        }
    });

    let pool = Arc::new(PeerPool::new(dialer));
    {
        let pool = pool.clone();
        tokio::spawn(async move { pool.maintain().await });
    }

    let listener = TcpListener::bind(listen).await?;
    info!(%listen, max_peers = pool.capacity(), "local forwarder listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    accept_loop(listener, pool.clone(), shutdown_rx).await;
    pool.end().await;
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    pool: Arc<PeerPool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let result = tokio::select! {
            res = listener.accept() => res,
            res = shutdown.changed() => {
                if res.is_ok() {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                } else {
                    // sender dropped; treat as no shutdown signal
                    continue;
                }
            }
        };
        let (stream, addr) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };
        info!(%addr, "accepted connection");
        let pool = pool.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(POP_TIMEOUT, pool.pop()).await {
                Ok(Some(peer)) => {
                    info!(%addr, id = peer.id(), "tunnelling through a snowflake");
                    relay(stream, peer, addr).await;
                }
                Ok(None) => info!(%addr, "pool ended, dropping connection"),
                Err(_) => warn!(%addr, "no snowflake available, dropping connection"),
            }
        });
    }
}

/// Shovels bytes between the local connection and the tunnel until either
/// side goes away.
async fn relay(mut stream: TcpStream, peer: WebRtcPeer, addr: SocketAddr) {
    let (mut reader, mut writer) = stream.split();
    let mut up = [0u8; 16 * 1024];
    let mut down = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            read = reader.read(&mut up) => match read {
                Ok(0) => {
                    info!(%addr, "local connection closed");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = peer.send(&up[..n]).await {
                        warn!(%addr, error = %e, "tunnel write failed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(%addr, error = %e, "local read failed");
                    break;
                }
            },
            received = peer.recv(&mut down) => match received {
                Ok(n) => {
                    if let Err(e) = writer.write_all(&down[..n]).await {
                        warn!(%addr, error = %e, "local write failed");
                        break;
                    }
                }
                Err(e) => {
                    info!(%addr, error = %e, "tunnel closed");
                    break;
                }
            },
        }
    }
    peer.close().await;
}
