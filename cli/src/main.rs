// peerlink: relay and client command line
//
// `peerlink relay` runs the introduction/rendezvous relay over WebSockets.
// `peerlink join` attaches to a relay as a peer and chats with whoever shares
// its topics.

mod config;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use config::Config;
use peerlink_core::{
    ClientSession, Frame, RelayServer, SessionConfig, SessionEvent, WebSocketConnector,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "peerlink: introductions and rendezvous for unreachable peers", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Relay {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Join topics on a relay and talk to introduced peers
    Join {
        /// Relay URL, e.g. ws://localhost:8080/
        #[arg(short, long)]
        server: Option<String>,
        #[arg(long)]
        peer_id: Option<String>,
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,
    },
    /// Inspect or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print every setting
    Show,
    /// Print the config file location
    Path,
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_file()?,
    };

    match cli.command {
        Commands::Relay { port } => cmd_relay(&config_path, port).await,
        Commands::Join {
            server,
            peer_id,
            topics,
        } => cmd_join(&config_path, server, peer_id, topics).await,
        Commands::Config { action } => cmd_config(&config_path, action),
    }
}

async fn cmd_relay(config_path: &Path, port: Option<u16>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let port = port.unwrap_or(config.relay.port);

    let relay = RelayServer::with_config(config.relay.server.clone());

    println!("{}", "peerlink relay".bold());
    println!("  {} Listening on 0.0.0.0:{}", "✓".green(), port);
    println!(
        "  {} Holding requests buffer at most {} frames / {} bytes",
        "✓".green(),
        config.relay.server.broker.max_pending_frames,
        config.relay.server.broker.max_pending_bytes
    );
    println!();

    tokio::select! {
        _ = server::serve(Arc::clone(&relay), port) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            let stats = relay.get_stats();
            info!(
                "Shutting down: {} peers connected, {} pairs formed, {} introductions sent",
                stats.peers_connected, stats.pairs_formed, stats.introductions_sent
            );
        }
    }

    Ok(())
}

async fn cmd_join(
    config_path: &Path,
    server_url: Option<String>,
    peer_id: Option<String>,
    topics: Vec<String>,
) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let server_url = server_url.unwrap_or(config.client.server_url.clone());
    let peer_id = peer_id
        .or(config.client.peer_id.clone())
        .context("No peer id: pass --peer-id or set client.peer_id")?;

    let connector = WebSocketConnector::new(&server_url)
        .with_context(|| format!("Bad relay URL {}", server_url))?;
    let session_config = SessionConfig::new(peer_id.clone())
        .with_topics(topics.clone())
        .with_backoff(config.client.backoff.clone())
        .with_heartbeat_interval(Duration::from_millis(config.client.heartbeat_interval_ms));
    let session = ClientSession::new(session_config, Arc::new(connector))
        .context("Failed to create session")?;

    let mut events = session.subscribe();
    session.start();

    println!("{}", format!("peerlink {} @ {}", peer_id, server_url).bold());
    println!("  Topics: {}", topics.join(", ").bright_cyan());
    println!(
        "  {}",
        "Type a line to send it to every connected peer; /join T, /leave T, /peers, /quit".dimmed()
    );
    println!();

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
            if event == SessionEvent::Shutdown {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                None
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(topic) = line.strip_prefix("/join ") {
            session.join(topic.trim())?;
        } else if let Some(topic) = line.strip_prefix("/leave ") {
            session.leave(topic.trim())?;
        } else if line == "/peers" {
            let peers = session.connected_peers().await?;
            if peers.is_empty() {
                println!("  {}", "(no connected peers)".dimmed());
            }
            for (peer, topic) in peers {
                println!("  {} [{}]", peer.bright_cyan(), topic);
            }
        } else if line == "/quit" {
            break;
        } else {
            let peers = session.connected_peers().await?;
            if peers.is_empty() {
                println!("  {}", "(nobody to send to yet)".dimmed());
            }
            for (peer, topic) in peers {
                if let Err(e) = session.send(peer.clone(), topic, Frame::text(line)).await {
                    println!("  {} {}: {}", "✗".red(), peer, e);
                }
            }
        }
    }

    session.shutdown().await;
    let _ = printer.await;
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::ServerConnected => println!("{} Connected to relay", "✓".green()),
        SessionEvent::ServerDisconnected { retry_in } => println!(
            "{} Relay connection lost, retrying in {:.1}s",
            "!".yellow(),
            retry_in.as_secs_f64()
        ),
        SessionEvent::PeerConnected { peer, topic } => {
            println!("{} {} joined [{}]", "+".green(), peer.bright_cyan(), topic)
        }
        SessionEvent::PeerDisconnected { peer, topic } => {
            println!("{} {} left [{}]", "-".yellow(), peer.bright_cyan(), topic)
        }
        SessionEvent::PeerMessage { peer, topic, frame } => {
            println!("{} [{}]: {}", peer.bright_cyan(), topic.dimmed(), frame)
        }
        SessionEvent::ProtocolViolation { detail } => {
            println!("{} Protocol violation: {}", "✗".red(), detail)
        }
        SessionEvent::Shutdown => println!("{}", "Session closed".dimmed()),
    }
}

fn cmd_config(config_path: &Path, action: ConfigAction) -> Result<()> {
    let mut config = Config::load_from(config_path)?;

    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<30} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => println!("{}", config_path.display()),

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save_to(config_path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
    }

    Ok(())
}
