//! relaymail - Decentralized mail relay
//!
//! Main entry point for the relaymail CLI.

use anyhow::Context;
use clap::{Parser, Subcommand};
use relaymail::account::FileAccountRepository;
use relaymail::address::AddressHash;
use relaymail::config::{validate_config_result, RelayConfig};
use relaymail::delivery::{deliver_remote, DeliveryContext, DeliveryPolicy};
use relaymail::dispatcher::{Dispatcher, DispatcherCommand, DispatcherConfig};
use relaymail::envelope::{generate_keypair, parse_public_key};
use relaymail::message::{MessageComposer, Sender};
use relaymail::pow::ProofOfWork;
use relaymail::queue::{FilesystemQueue, MemoryQueue, QueueStore, Section};
use relaymail::resolver::{directory_from_config, DirectoryRecord, Resolver, StaticDirectory};
use relaymail::server::{shutdown_signal, RelayServer, TicketPolicy, TicketStore};
use relaymail::transport::HttpClientFactory;
use relaymail::{RelayError, Result};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Instant;

/// relaymail - Decentralized mail relay
#[derive(Parser, Debug)]
#[command(name = "relaymail")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/relaymail/config.yaml)
    #[arg(short, long, global = true, env = "RELAYMAIL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Run the relay server and delivery dispatcher
    Serve,

    /// Show how many messages each queue section holds
    Queue,

    /// Verify or solve a proof-of-work puzzle
    Pow {
        /// Required leading zero bits
        #[arg(short, long)]
        bits: u32,

        /// Puzzle data
        #[arg(short, long)]
        data: String,

        /// Proof to verify; solves the puzzle when omitted
        #[arg(short, long)]
        proof: Option<u64>,
    },

    /// Compose an encrypted message and upload it to a relay
    Send {
        /// Relay hosting the recipient (host, host:port or URL)
        #[arg(long)]
        server: String,

        /// Sender address
        #[arg(long)]
        from: String,

        /// Recipient address
        #[arg(long)]
        to: String,

        /// Recipient public key (hex)
        #[arg(long)]
        recipient_key: String,

        /// Message subject
        #[arg(short, long, default_value = "")]
        subject: String,

        /// File holding the plain text body
        #[arg(long)]
        body: Option<PathBuf>,

        /// Files to attach
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
}

fn main() {
    // Initialize logging
    if let Err(e) = relaymail::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(RelayConfig::default_path);

    match cli.command {
        Commands::Init => handle_init_command(&config_path),
        Commands::Pow { bits, data, proof } => handle_pow_command(bits, &data, proof),
        Commands::Serve => {
            let config = load_config(&config_path)?;
            runtime()?.block_on(serve(config))
        }
        Commands::Queue => {
            let config = load_config(&config_path)?;
            handle_queue_command(&config)
        }
        Commands::Send {
            server,
            from,
            to,
            recipient_key,
            subject,
            body,
            attachments,
        } => {
            let config = load_config_or_default(&config_path)?;
            let request = SendRequest {
                server,
                from,
                to,
                recipient_key,
                subject,
                body,
                attachments,
            };
            runtime()?.block_on(send(config, request))
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

fn load_config(path: &Path) -> Result<RelayConfig> {
    match RelayConfig::load(path) {
        Ok(config) => {
            validate_config_result(&config)?;
            Ok(config)
        }
        Err(RelayError::Config(msg)) if msg.contains("Config file not found") => {
            Err(RelayError::Config(format!(
                "No configuration found at {}. Run 'relaymail init' first to create one.",
                path.display()
            )))
        }
        Err(e) => Err(e),
    }
}

fn load_config_or_default(path: &Path) -> Result<RelayConfig> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(RelayConfig::default())
    }
}

fn handle_init_command(config_file: &Path) -> Result<()> {
    if config_file.exists() {
        println!("Configuration already exists at {}", config_file.display());
        return Ok(());
    }

    let config = RelayConfig::default();
    config.save(config_file)?;

    println!("✓ Created configuration at {}", config_file.display());
    println!();
    println!("Next steps:");
    println!("  1. Review storage.path and server.port");
    println!("  2. Start the relay:");
    println!("     relaymail serve");

    Ok(())
}

fn handle_pow_command(bits: u32, data: &str, proof: Option<u64>) -> Result<()> {
    match proof {
        Some(proof) => {
            let pow = ProofOfWork::new(bits, data, proof);
            if pow.is_valid() {
                println!("✓ Proof {} is valid for {} bits", proof, bits);
                Ok(())
            } else {
                Err(RelayError::Other(format!(
                    "Proof {} is not valid for {} bits",
                    proof, bits
                )))
            }
        }
        None => {
            let mut pow = ProofOfWork::new(bits, data, 0);
            let started = Instant::now();
            pow.work();
            println!(
                "✓ Solved {} bits in {:.2?}: proof = {}",
                bits,
                started.elapsed(),
                pow.proof
            );
            Ok(())
        }
    }
}

fn handle_queue_command(config: &RelayConfig) -> Result<()> {
    let queue = FilesystemQueue::new(config.storage.queue_dir())?;

    println!("Queue at {}", queue.root().display());
    for section in Section::ALL {
        println!("  {:<12} {}", section.as_str(), queue.count(section)?);
    }

    Ok(())
}

async fn serve(config: RelayConfig) -> Result<()> {
    let queue: Arc<dyn QueueStore> = Arc::new(FilesystemQueue::new(config.storage.queue_dir())?);
    let accounts = Arc::new(FileAccountRepository::new(config.storage.accounts_dir())?);
    let directory = directory_from_config(&config.directory, config.client.timeout())?;
    let resolver = Resolver::new(accounts.clone(), directory);
    let clients = Arc::new(HttpClientFactory::new(
        config.client.timeout(),
        config.server.allow_insecure,
    )?);

    let ctx = DeliveryContext::new(queue.clone(), resolver, accounts.clone(), clients).with_policy(
        DeliveryPolicy {
            max_header_attempts: config.queue.max_header_attempts,
            ..Default::default()
        },
    );

    let mut dispatcher = Dispatcher::new(DispatcherConfig::from_queue_config(&config.queue), ctx);
    let intake = dispatcher.intake();
    let commands = dispatcher.command_sender();
    let dispatcher_task = tokio::spawn(async move { dispatcher.run().await });

    let server = RelayServer::new(
        TicketPolicy::from_config(&config),
        TicketStore::open(config.storage.tickets_db())?,
        queue,
        accounts,
        intake,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    server.run(&addr, shutdown_signal()).await?;

    tracing::info!("Server stopped, draining deliveries");
    if commands.send(DispatcherCommand::Shutdown).await.is_err() {
        tracing::warn!("Dispatcher already stopped");
    }

    dispatcher_task.await.context("Dispatcher task failed")?
}

struct SendRequest {
    server: String,
    from: String,
    to: String,
    recipient_key: String,
    subject: String,
    body: Option<PathBuf>,
    attachments: Vec<PathBuf>,
}

async fn send(config: RelayConfig, request: SendRequest) -> Result<()> {
    let recipient_key = parse_public_key(&request.recipient_key)?;
    let (_, sender_key) = generate_keypair();
    let sender = Sender::new(request.from.as_str(), sender_key, config.pow.sender_bits);

    let mut composer =
        MessageComposer::new(sender, request.to.as_str(), recipient_key).subject(request.subject);
    if let Some(path) = &request.body {
        let body = std::fs::read(path)
            .with_context(|| format!("Failed to read body from {}", path.display()))?;
        composer = composer.block("text/plain", &body)?;
    }
    for path in &request.attachments {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read attachment {}", path.display()))?;
        composer = composer.attachment(&filename, "application/octet-stream", &data)?;
    }
    let artifacts = composer.build()?;

    // Drive the same ticket protocol the dispatcher uses, from a private queue
    let queue: Arc<dyn QueueStore> = Arc::new(MemoryQueue::new());
    queue.enqueue(Section::Processing, &artifacts)?;

    let record = DirectoryRecord {
        hash: AddressHash::from_address(&request.to),
        server: request.server,
        public_key: request.recipient_key,
    };
    let accounts = Arc::new(FileAccountRepository::new(config.storage.accounts_dir())?);
    let resolver = Resolver::new(accounts.clone(), Arc::new(StaticDirectory::new([record.clone()])));
    let clients = Arc::new(HttpClientFactory::new(
        config.client.timeout(),
        config.server.allow_insecure,
    )?);
    let ctx = DeliveryContext::new(queue, resolver, accounts, clients);

    let server = deliver_remote(&ctx, &record, &artifacts.id)
        .await
        .context("Delivery failed")?;

    println!(
        "✓ Uploaded message {} for {} to {}",
        artifacts.id, record.hash, server
    );
    Ok(())
}
