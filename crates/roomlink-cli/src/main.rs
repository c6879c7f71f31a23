//! RoomLink CLI - relay server, room provisioning and loopback transfers.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use config::Config;
use progress::{BatchProgress, format_bytes};
use roomlink_core::mock::MockNetwork;
use roomlink_core::{
    ConnectionNegotiator, OutgoingFile, ReceiveEvent, RelayLink, Role, SignalLink,
    TransferStateMachine, WsLink,
};
use roomlink_relay::{
    ClientMessage, DEFAULT_RELAY_PORT, RelayHandle, RelayServer, SIGNALING_PATH, ServerMessage,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// RoomLink - two-peer rooms and direct file transfer
#[derive(Parser)]
#[command(name = "roomlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Listen address, overriding the config file
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Ask a running relay for a new room id
    CreateRoom {
        /// Relay WebSocket URL
        #[arg(short, long)]
        relay: Option<String>,
    },

    /// Send files through an in-process relay and peer pair
    Loopback {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Directory for the received copies
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Check the configuration and report the first problem
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { bind } => serve(&config, bind).await,
        Commands::CreateRoom { relay } => create_room(relay).await,
        Commands::Loopback { files, output } => loopback(&config, files, output).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Validate => {
                config.validate()?;
                println!("Configuration is valid");
                Ok(())
            }
        },
    }
}

/// Run the relay until Ctrl+C
async fn serve(config: &Config, bind: Option<String>) -> anyhow::Result<()> {
    config.validate()?;
    let addr = match bind {
        Some(addr) => addr.parse::<SocketAddr>()?,
        None => config.parse_listen_addr()?,
    };

    let server = RelayServer::bind(addr, config.relay_config())
        .await?
        .with_allowed_origin(&config.server.allowed_origin)?;

    println!("RoomLink relay");
    println!("  Listen:   {}", server.local_addr()?);
    println!("  Room TTL: {}s", config.rooms.ttl_secs);
    println!("  Signaling path: {SIGNALING_PATH}");
    println!();
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("Shutting down...");
        }
    }
    Ok(())
}

/// Create a room on a remote relay and print its id
async fn create_room(relay: Option<String>) -> anyhow::Result<()> {
    let url =
        relay.unwrap_or_else(|| format!("ws://127.0.0.1:{DEFAULT_RELAY_PORT}{SIGNALING_PATH}"));
    info!("Connecting to {}", url);

    let mut link = WsLink::connect(&url).await?;
    link.send(ClientMessage::CreateRoom).await?;
    let reply = link.recv().await;
    link.close().await;

    match reply {
        Some(ServerMessage::RoomCreated { room_id }) => {
            println!("{room_id}");
            Ok(())
        }
        Some(ServerMessage::ErrorMessage { message, .. }) => {
            anyhow::bail!("Relay refused: {message}")
        }
        Some(other) => anyhow::bail!("Unexpected reply: {}", other.message_type()),
        None => anyhow::bail!("Relay closed the connection"),
    }
}

/// Negotiate a sender and receiver in-process, send `paths`, save to `output`
async fn loopback(config: &Config, paths: Vec<PathBuf>, output: PathBuf) -> anyhow::Result<()> {
    config.validate()?;

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        files.push(OutgoingFile::open(path).await?);
    }
    let listing: Vec<(String, u64)> = files
        .iter()
        .map(|f| (f.descriptor().name.clone(), f.size()))
        .collect();

    let relay = RelayHandle::spawn(config.relay_config());
    let room_id = relay.create_room().await?;
    info!("Room {} created", room_id);

    let network = MockNetwork::new();
    let (sender_peer, sender_events) = network.peer();
    let (receiver_peer, receiver_events) = network.peer();

    // The sender joins first so the receiver's join triggers the offer
    let mut sender = ConnectionNegotiator::new(
        Role::Sender,
        room_id.clone(),
        sender_peer,
        sender_events,
        RelayLink::new(relay.connect().await?),
        TransferStateMachine::new(),
    );
    sender.start().await?;
    let receiver = ConnectionNegotiator::new(
        Role::Receiver,
        room_id,
        receiver_peer,
        receiver_events,
        RelayLink::new(relay.connect().await?),
        TransferStateMachine::new(),
    );

    let (sender, receiver) = tokio::join!(sender.connect(), receiver.connect());
    let (mut sender, mut receiver) = (sender?, receiver?);
    info!("Peers connected");

    let cancel = Arc::new(AtomicBool::new(false));
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::SeqCst);
            }
        })
    };

    let mut progress = BatchProgress::new(&listing);
    let transfer_config = config.transfer_config();

    let send = sender.send_files(files, &transfer_config, |p| progress.record(&p), cancel);
    let receive = receiver.receive(|event| {
        if let ReceiveEvent::ProtocolViolation(violation) = event {
            warn!("Protocol violation: {}", violation);
        }
    });
    let (sent, received) = tokio::join!(send, receive);
    interrupt.abort();

    let (summary, received) = match (sent, received) {
        (Ok(summary), Ok(received)) => (summary, received),
        (Err(e), _) | (_, Err(e)) => {
            progress.abandon();
            sender.close().await;
            receiver.close().await;
            return Err(e.into());
        }
    };
    progress.finish(summary.files, summary.bytes);

    tokio::fs::create_dir_all(&output).await?;
    for file in &received {
        let path = file.save_to(&output).await?;
        if file.is_complete() {
            println!("  {} -> {}", file.name, path.display());
        } else {
            println!(
                "  {} -> {} (incomplete: {} of {})",
                file.name,
                path.display(),
                format_bytes(file.data.len() as u64),
                format_bytes(file.declared_size)
            );
        }
    }

    sender.close().await;
    receiver.close().await;
    Ok(())
}
