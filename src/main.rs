//! CLI entry point for peerway.
//!
//! Runs the signaling relay, manages the local entity and configuration, and
//! runs an entity against a relay.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use peerway::{
    relay::{client, Relay, RelayServer, RelaySession, SortMode},
    storage::MemoryDatabase,
    transport::TcpTransportFactory,
    utils::{StorageConfig, DEFAULT_CONFIG_FILE},
    Entity, Peerway, PeerwayConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

/// Peerway - peer-to-peer messaging over relay signaling
#[derive(Parser)]
#[command(name = "peerway")]
#[command(about = "Peer-to-peer messaging overlay with relay signaling and certificate trust")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys and received files
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Manage the local entity
    Entity {
        #[command(subcommand)]
        action: EntityCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// List entities registered on the relay
    Peers {
        /// Zero-based page
        #[arg(short, long, default_value = "0")]
        page: usize,
        /// Ordering
        #[arg(short, long, value_enum, default_value = "name")]
        sort: Sort,
    },
    /// Register on the relay and connect to peers
    Run {
        /// Relay address
        #[arg(short, long)]
        relay: Option<String>,
        /// Peers to connect to
        #[arg(short, long)]
        peer: Vec<String>,
    },
}

#[derive(Subcommand)]
enum EntityCommands {
    /// Generate a new entity
    Generate {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Force overwrite an existing entity
        #[arg(short, long)]
        force: bool,
    },
    /// Show the local entity
    Show {
        /// Display format (json, pretty)
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum Sort {
    Name,
    Id,
}

impl From<Sort> for SortMode {
    fn from(sort: Sort) -> Self {
        match sort {
            Sort::Name => SortMode::ByName,
            Sort::Id => SortMode::ById,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let mut config = PeerwayConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage = StorageConfig::under(data_dir);
    }

    match cli.command {
        Commands::Relay { listen } => handle_relay_command(listen, config).await,
        Commands::Entity { action } => handle_entity_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Peers { page, sort } => handle_peers_command(page, sort, &config).await,
        Commands::Run { relay, peer } => handle_run_command(relay, peer, config).await,
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

async fn handle_relay_command(listen: Option<SocketAddr>, config: PeerwayConfig) -> Result<()> {
    let listen = listen.unwrap_or(config.relay.listen);
    let server = RelayServer::bind(listen, Relay::new()).await?;
    info!("Relay listening on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay error: {e}");
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down relay...");
        }
    }
    Ok(())
}

fn handle_entity_commands(action: EntityCommands, config: &PeerwayConfig) -> Result<()> {
    let keys_dir = &config.storage.keys_dir;
    match action {
        EntityCommands::Generate { name, force } => {
            if Entity::load(keys_dir)?.is_some() && !force {
                return Err(anyhow::anyhow!(
                    "Entity already exists. Use --force to overwrite."
                ));
            }

            info!("Generating new entity for '{name}'");
            let entity = Entity::new(name);
            entity.save(keys_dir)?;

            println!("✓ Entity generated successfully");
            println!("  Name: {}", entity.profile().name);
            println!("  ID: {}", entity.id());
            println!("  Saved to: {}", keys_dir.display());
        }
        EntityCommands::Show { format } => {
            let entity = Entity::load(keys_dir)?
                .ok_or_else(|| anyhow::anyhow!("No entity found. Run `peerway entity generate`."))?;

            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&entity.record)?),
                "pretty" => {
                    println!("Entity");
                    println!("======");
                    println!("Name: {}", entity.profile().name);
                    println!("ID: {}", entity.id());
                    println!("Short ID: {}", entity.short_id());
                    println!(
                        "Created: {}",
                        entity.record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    println!("Public Key: {}", entity.public_key_hex());
                }
                _ => return Err(anyhow::anyhow!("Unsupported format: {format}")),
            }
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &PeerwayConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            PeerwayConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = match file {
                Some(path) => PeerwayConfig::from_file(path)?,
                None => config.clone(),
            };
            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => println!("{}", config.to_toml_string()?),
    }
    Ok(())
}

async fn handle_peers_command(page: usize, sort: Sort, config: &PeerwayConfig) -> Result<()> {
    let (tx, mut rx) = client::connect(&config.relay.address).await?;
    let session = RelaySession::new(tx, config.relay.request_timeout());

    let replies = session.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            replies.handle(event);
        }
    });

    let listings = session.list_entities(page, sort.into()).await?;
    if listings.is_empty() {
        println!("No entities on page {page}");
    }
    for listing in listings {
        println!("{}  {}", listing.id, listing.name);
    }
    Ok(())
}

async fn handle_run_command(
    relay: Option<String>,
    peers: Vec<String>,
    mut config: PeerwayConfig,
) -> Result<()> {
    if let Some(relay) = relay {
        config.relay.address = relay;
    }
    config.ensure_directories()?;

    let default_name = std::env::var("USER").unwrap_or_else(|_| "peer".to_string());
    let entity = Entity::load_or_create(&config.storage.keys_dir, &default_name)?;
    info!("Starting {entity} against relay {}", config.relay.address);

    let (tx, rx) = client::connect(&config.relay.address).await?;
    let session = RelaySession::new(tx, config.relay.request_timeout());
    let factory = Arc::new(TcpTransportFactory::new(
        config.network.bind_address,
        config.network.max_frame_size,
    ));
    let app = Peerway::new(entity, config, Arc::new(MemoryDatabase::new()), session, factory);

    let events = app.events();
    let mut online = events.online.subscribe();
    let mut messages = events.message.subscribe();
    let mut peer_updates = events.peer_updated.subscribe();
    let mut posts = events.post.subscribe();
    let mut notifications = events.notification.subscribe();

    app.start(rx).await?;

    for peer in &peers {
        if let Err(e) = app.connect_to_peer(peer).await {
            error!("Could not connect to {peer}: {e}");
        }
    }

    loop {
        tokio::select! {
            Some((peer, up)) = online.recv() => {
                println!("{peer} is {}", if up { "online" } else { "unavailable" });
            }
            Some(message) = messages.recv() => {
                println!("[{}] {}: {}", message.chat_id, message.author_id, message.content);
            }
            Some(peer) = peer_updates.recv() => {
                println!("{} is now known as {}", peer.id, peer.display_name);
            }
            Some(post) = posts.recv() => {
                println!("Post {} v{} from {}", post.id, post.version, post.author_id);
            }
            Some(notification) = notifications.recv() => {
                println!("Notification from {}: {}", notification.from, notification.notif);
            }
            result = signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    info!("Shutting down gracefully...");
    for peer in &peers {
        app.close_peer(peer).await;
    }
    Ok(())
}
