//! Gossip node CLI application
//!
//! Runs a node, or inspects a node's data directory while it is stopped.

use clap::{Parser, Subcommand};
use ledger_gossip::api::handlers::{DeadLetterEntry, QueueEntry};
use ledger_gossip::config::NodeConfig;
use ledger_gossip::gossip::AcceptAllLedger;
use ledger_gossip::network::Node;
use ledger_gossip::queue::read_snapshot;
use ledger_gossip::storage::Storage;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gossip-node")]
#[command(version)]
#[command(about = "Peer-to-peer gossip node for a permissioned ledger", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C
    Start {
        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// RPC (framed TCP) port
        #[arg(short, long)]
        port: Option<u16>,

        /// HTTP port (REST, WebSocket, operator API)
        #[arg(long)]
        http_port: Option<u16>,

        /// Comma-separated seeds (host:port[:http_port])
        #[arg(short, long)]
        seeds: Option<String>,

        /// Advertise this address instead of discovering one
        #[arg(long)]
        external_address: Option<IpAddr>,

        /// Data directory
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Healthy peers needed before transactions are sent instead of queued
        #[arg(long)]
        min_healthy_peers: Option<usize>,
    },

    /// Show queued and dead-lettered transactions
    Queue {
        #[arg(short, long, default_value = ".gossip_data")]
        data_dir: PathBuf,
    },

    /// Print the node id, creating it if needed
    Id {
        #[arg(short, long, default_value = ".gossip_data")]
        data_dir: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logger
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.command {
        Commands::Start {
            config,
            port,
            http_port,
            seeds,
            external_address,
            data_dir,
            min_healthy_peers,
        } => {
            let mut config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(http_port) = http_port {
                config.http_port = http_port;
            }
            if let Some(seeds) = seeds {
                config.set_seeds(&seeds)?;
            }
            if let Some(ip) = external_address {
                config.address.external_address = Some(ip);
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(min) = min_healthy_peers {
                config.health.min_healthy_peers = min;
            }
            run_node(config)
        }

        Commands::Queue { data_dir } => cmd_queue(data_dir),

        Commands::Id { data_dir } => {
            let storage = Storage::new(data_dir)?;
            println!("{}", storage.load_or_create_node_id()?);
            Ok(())
        }
    }
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        println!(
            "🌐 Starting gossip node (rpc port {}, http port {})...",
            config.port, config.http_port
        );

        let node = Node::new(config, Arc::new(AcceptAllLedger)).await?;
        node.start().await?;

        let advert = node.advert().await;
        println!("   Node id:    {}", advert.id);
        println!("   Advertised: {}", advert.rpc_endpoint());
        println!("   HTTP API:   {}", node.http_addr());

        tokio::signal::ctrl_c().await?;
        println!("\n📴 Shutting down node...");
        node.shutdown().await?;

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn cmd_queue(data_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let storage = Storage::new(data_dir)?;
    let snapshot = read_snapshot(&storage)?;

    println!("📬 Pending: {}", snapshot.pending.len());
    for entry in snapshot.pending.iter().map(QueueEntry::from) {
        println!(
            "   #{:<6} {}  {} bytes  retries {}  queued {}",
            entry.seq,
            entry.hash,
            entry.size,
            entry.retry_count,
            entry.queued_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("💀 Dead letters: {}", snapshot.dead_letters.len());
    for entry in snapshot.dead_letters.iter().map(DeadLetterEntry::from) {
        println!(
            "   {}  {} bytes  after {} retries: {}",
            entry.hash, entry.size, entry.retry_count, entry.reason
        );
    }

    Ok(())
}
