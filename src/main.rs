//! RLPx session daemon
//!
//! Loads configuration, dials a peer and/or accepts inbound sessions, and
//! logs every packet that arrives.

use clap::Parser;
use rlpx_session::{
    dial, listen, DisconnectReason, Message, NodeConfig, Peer, SessionHandle, Subscriber,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rlpxd", about = "RLPx peer session daemon", version)]
struct Args {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer to dial: enode://<128 hex digits>@host:port
    #[arg(long)]
    peer: Option<String>,

    /// Address to accept inbound sessions on, e.g. 0.0.0.0:30303.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

/// Subscriber that logs every delivered packet.
struct LogSubscriber;

impl Subscriber for LogSubscriber {
    fn on_packet(&self, packet: &Message, peer: &Peer) {
        match packet {
            Message::Disconnect(reason) => {
                info!(peer = %peer, reason = %reason, "peer session ended")
            }
            other => info!(peer = %peer, packet = other.name(), "packet received"),
        }
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    info!("rlpxd starting");

    let node_config = match &args.config {
        Some(path) => match NodeConfig::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                error!("failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("no config file given, using defaults");
            NodeConfig::default()
        }
    };

    if node_config.secret_key.is_none() {
        warn!("no identity configured, generating ephemeral keypair");
    }

    let config = match node_config.into_session_config() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(client_id = %config.client_id, "identity ready");
    info!("  enode id: {}", hex::encode(config.node_id().as_bytes()));

    if args.peer.is_none() && args.listen.is_none() {
        error!("nothing to do: pass --peer and/or --listen");
        std::process::exit(2);
    }

    // Every session, outbound and inbound, lands here so the shutdown path
    // below can close all of them.
    let sessions: Arc<Mutex<Vec<SessionHandle>>> = Arc::new(Mutex::new(Vec::new()));

    if let Some(peer_url) = &args.peer {
        let peer = match Peer::from_enode(peer_url) {
            Ok(peer) => peer,
            Err(e) => {
                error!("invalid --peer: {}", e);
                std::process::exit(2);
            }
        };
        match dial(peer, config.clone(), vec![Arc::new(LogSubscriber)]).await {
            Ok(handle) => {
                info!(peer = %handle.peer(), "outbound session started");
                sessions.lock().await.push(handle);
            }
            Err(e) => {
                error!("dial failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Some(listen_addr) = args.listen {
        let listener = match TcpListener::bind(listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind {}: {}", listen_addr, e);
                std::process::exit(1);
            }
        };
        info!(addr = %listen_addr, "listening for inbound sessions");

        let accept_config = config.clone();
        let accept_sessions = sessions.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        match listen(stream, accept_config.clone(), vec![Arc::new(LogSubscriber)]) {
                            Ok(handle) => {
                                info!(peer = %handle.peer(), "inbound session started");
                                let mut guard = accept_sessions.lock().await;
                                guard.push(handle);
                                guard.retain(|handle| !handle.is_closed());
                            }
                            Err(e) => {
                                warn!(peer_addr = %peer_addr, error = %e, "inbound session setup failed");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                    }
                }
            }
        });
    }

    info!("rlpxd running, press ctrl-c to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("failed to listen for shutdown signal: {}", e),
    }

    // Take the list so the accept task cannot race new entries into a
    // shutdown we already walked past.
    let handles = std::mem::take(&mut *sessions.lock().await);
    for handle in &handles {
        let _ = handle.close(Some(DisconnectReason::ClientQuitting)).await;
    }
    for handle in &handles {
        handle.closed().await;
    }
    info!("rlpxd shutdown complete");
}
