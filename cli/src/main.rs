// circuitline — relay-mediated chat between peers behind NAT
//
// Cross-platform (macOS, Linux, Windows) command-line interface: runs the
// relay service or a peer in listener, dialer or symmetric chat mode.

mod bootstrap;
mod config;
mod console;

use anyhow::{Context, Result};
use circuitline_core::{
    start_relay, IdentityManager, IdentityStore, Multiaddr, NodeKeys, PeerNode, SessionId,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser)]
#[command(name = "circuitline")]
#[command(about = "circuitline — chat through a public relay, no direct dials", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write daily-rolled logs into this directory instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay service
    Relay {
        /// Listen multiaddr (repeatable)
        #[arg(long)]
        listen: Vec<String>,
        /// Public multiaddr announced to peers (repeatable)
        #[arg(long)]
        announce: Vec<String>,
        #[arg(long)]
        max_reservations: Option<usize>,
        /// Publish reserved peers' circuit addresses
        #[arg(long)]
        advertise: bool,
    },
    /// Reserve on the relay and accept sessions
    Listen {
        #[arg(long)]
        relay: Option<String>,
    },
    /// Dial a peer's circuit address once, then chat
    Dial {
        address: String,
        #[arg(long)]
        relay: Option<String>,
    },
    /// Accept sessions and dial with /dial
    Chat {
        #[arg(long)]
        relay: Option<String>,
    },
    /// Generate an Ed25519 identity
    Keygen {
        /// Also write it to this key file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show the configured identity
    Identity,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[derive(Clone, Copy)]
enum PeerMode {
    Listen,
    Dial,
    Chat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, config_path) = match config::Config::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let log_dir = cli
        .log_file
        .clone()
        .or_else(|| config.log_dir.as_ref().map(PathBuf::from));
    let _guard = init_tracing(log_dir.as_deref());

    match run(cli.command, config, config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("{} {:#}", "✗".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("warn,circuitline_core=info,circuitline=info")
    });

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "circuitline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

async fn run(command: Commands, config: config::Config, config_path: PathBuf) -> Result<()> {
    match command {
        Commands::Relay {
            listen,
            announce,
            max_reservations,
            advertise,
        } => cmd_relay(&config, listen, announce, max_reservations, advertise).await,
        Commands::Listen { relay } => cmd_peer(&config, relay, PeerMode::Listen, None).await,
        Commands::Dial { address, relay } => {
            cmd_peer(&config, relay, PeerMode::Dial, Some(address)).await
        }
        Commands::Chat { relay } => cmd_peer(&config, relay, PeerMode::Chat, None).await,
        Commands::Keygen { out } => cmd_keygen(out),
        Commands::Identity => cmd_identity(&config),
        Commands::Config { action } => cmd_config(config, &config_path, action),
    }
}

fn load_keys(config: &config::Config) -> Result<NodeKeys> {
    let key_path = config.key_path()?;
    let mut identity = IdentityManager::with_key_file(&key_path);
    let keys = identity
        .initialize()
        .with_context(|| format!("Failed to load identity from {}", key_path.display()))?;
    Ok(keys.clone())
}

async fn cmd_relay(
    config: &config::Config,
    listen: Vec<String>,
    announce: Vec<String>,
    max_reservations: Option<usize>,
    advertise: bool,
) -> Result<()> {
    let keys = load_keys(config)?;
    let relay_config = config.relay_config(listen, announce, max_reservations, advertise);

    println!("{}", "circuitline relay — Starting...".bold());
    let relay = start_relay(&keys, &relay_config)
        .await
        .context("Failed to start relay")?;

    println!("{} Relay peer ID: {}", "✓".green(), relay.peer_id().to_string().bright_cyan());
    for address in relay.wait_for_addresses().await? {
        println!("  {}", address.to_string().bright_yellow());
    }
    println!();
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    let announcer = relay_config
        .advertise
        .then(|| tokio::spawn(print_advertised(relay.watch_advertised())));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    if let Some(announcer) = announcer {
        announcer.abort();
    }

    let stats = relay.stats();
    println!();
    println!(
        "Reservations: {} active, {} accepted, {} refused",
        stats.reservations_active, stats.reservations_accepted, stats.reservations_refused
    );
    println!("Circuits:     {} opened", stats.circuits_opened);
    relay.shutdown().await;
    Ok(())
}

/// Print the circuit addresses of reserved peers whenever they change
async fn print_advertised(mut advertised: watch::Receiver<Vec<Multiaddr>>) {
    while advertised.changed().await.is_ok() {
        let addresses = advertised.borrow_and_update().clone();
        println!("{} {} reserved peer(s)", "•".yellow(), addresses.len());
        for address in addresses {
            println!("  {}", address.to_string().bright_yellow());
        }
    }
}

async fn cmd_peer(
    config: &config::Config,
    relay: Option<String>,
    mode: PeerMode,
    target: Option<String>,
) -> Result<()> {
    let keys = load_keys(config)?;
    let node_config = config.node_config(relay);

    println!("{}", "circuitline — Starting...".bold());
    let mut node = PeerNode::start(keys, node_config).await?;
    println!("{} Peer ID: {}", "✓".green(), node.peer_id().to_string().bright_cyan());

    if matches!(mode, PeerMode::Listen | PeerMode::Chat) {
        node.accept_inbound()?;
    }
    let output = node
        .take_output()
        .context("Session output already taken")?;
    let printer = console::spawn_printer(output);

    println!("Waiting for relay reservation...");
    let circuits = node.reserve().await.context("Relay reservation failed")?;
    println!("{} Reachable at:", "✓".green());
    for address in &circuits {
        println!("  {}", address.to_string().bright_yellow());
    }
    println!();

    if let Some(target) = target {
        initial_dial(&node, &target).await;
    }

    tokio::select! {
        _ = console::run(&node, !matches!(mode, PeerMode::Listen)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    println!("Shutting down...");
    node.shutdown().await;
    printer.abort();
    Ok(())
}

/// Dial once at startup. A failure is reported and the console stays up.
async fn initial_dial(node: &PeerNode, target: &str) -> Option<SessionId> {
    match node.dial_text(target).await {
        Ok(id) => {
            println!("{} Session {} open", "✓".green(), id);
            Some(id)
        }
        Err(e) => {
            tracing::warn!("Dial to {} failed: {}", target, e);
            println!("{} Failed to dial {}: {}", "✗".red(), target, e);
            println!("{}", "Retry with /dial <multiaddr>.".dimmed());
            None
        }
    }
}

fn cmd_keygen(out: Option<PathBuf>) -> Result<()> {
    let keys = NodeKeys::generate();
    let encoded = keys.to_protobuf_hex()?;

    println!("{}", "Identity generated".bold());
    println!("  Peer ID:  {}", keys.peer_id().to_string().bright_cyan());
    println!("  Protobuf: {}", encoded.as_str().bright_yellow());

    if let Some(path) = out {
        IdentityStore::file(&path).save_keys(&keys)?;
        println!("{} Written to {}", "✓".green(), path.display());
    }
    Ok(())
}

fn cmd_identity(config: &config::Config) -> Result<()> {
    let key_path = config.key_path()?;
    let keys = load_keys(config)?;

    println!("{}", "Identity Information".bold());
    println!("  Peer ID:  {}", keys.peer_id().to_string().bright_cyan());
    println!("  Key file: {}", key_path.display());
    Ok(())
}

fn cmd_config(mut config: config::Config, path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save_to(path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => match key.as_str() {
                "key_file" | "log_dir" | "relay_max_reservations" => {
                    println!("{} = {}", key.bright_cyan(), "(unset)".dimmed())
                }
                _ => anyhow::bail!("Unknown config key: {}", key),
            },
        },

        ConfigAction::List => {
            println!("{} ({})", "Configuration".bold(), path.display());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }

            println!();
            println!("{}", "Relays:".bold());
            if config.relays.is_empty() {
                println!("  {}", "(none configured)".dimmed());
            } else {
                for (i, relay) in config.relays.iter().enumerate() {
                    println!("  {}. {}", i + 1, relay);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuitline_core::NodeConfig;

    #[tokio::test]
    async fn test_failed_initial_dial_keeps_node_running() {
        let relay = format!("/ip4/127.0.0.1/tcp/1/p2p/{}", NodeKeys::generate().peer_id());
        let node = PeerNode::start(NodeKeys::generate(), NodeConfig::default().with_relay(relay))
            .await
            .unwrap();

        let direct = format!("/ip4/192.0.2.7/tcp/4001/p2p/{}", NodeKeys::generate().peer_id());
        assert!(initial_dial(&node, &direct).await.is_none());
        assert!(initial_dial(&node, "not a multiaddr").await.is_none());

        // Still usable afterwards
        assert!(node.sessions().is_empty());
        assert!(node.connected_peers().await.is_ok());
        node.shutdown().await;
    }
}
