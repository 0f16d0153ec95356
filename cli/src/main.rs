// statusbeacon: command-line front end for StatusBeacon
//
// Passphrase codec tools, identifier derivation, persistent settings and a
// two-node simulation over the in-memory loopback radio.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use statusbeacon_core::crypto;
use statusbeacon_core::transport::{AdvertisingOutcome, DiscoveryOutcome, LoopbackAir};
use statusbeacon_core::{ExchangeSettings, ServiceId, StatusNode, TopicId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "statusbeacon")]
#[command(about = "StatusBeacon: status-topic exchange over short-range radio", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a payload with a passphrase
    Encrypt {
        plaintext: String,
        #[arg(short, long)]
        passphrase: String,
    },
    /// Decrypt a `salt]iv]ciphertext` payload
    Decrypt {
        ciphertext: String,
        #[arg(short, long)]
        passphrase: String,
    },
    /// Show the wire identifier derived from a topic or service name
    TopicId { name: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage local topic values
    Topic {
        #[command(subcommand)]
        action: TopicAction,
    },
    /// Show the configured node
    Status,
    /// Run a local node against a simulated peer over a loopback radio
    Simulate {
        /// Peer topic values as name=value; defaults to the local topics
        #[arg(long = "peer-topic")]
        peer_topics: Vec<String>,
        /// Network id handed over on a difference
        #[arg(long, default_value = "DIRECT-sim")]
        network: String,
        /// Network secret handed over on a difference
        #[arg(long, default_value = "sim-secret")]
        secret: String,
        #[arg(long, default_value = "500")]
        scan_ms: u64,
        #[arg(long, default_value = "1000")]
        idle_ms: u64,
        /// How long to run
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[derive(Subcommand)]
enum TopicAction {
    Set { name: String, value: String },
    Remove { name: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Encrypt {
            plaintext,
            passphrase,
        } => cmd_encrypt(&plaintext, &passphrase),
        Commands::Decrypt {
            ciphertext,
            passphrase,
        } => cmd_decrypt(&ciphertext, &passphrase),
        Commands::TopicId { name } => cmd_topic_id(&name),
        Commands::Config { action } => cmd_config(action),
        Commands::Topic { action } => cmd_topic(action),
        Commands::Status => cmd_status(),
        Commands::Simulate {
            peer_topics,
            network,
            secret,
            scan_ms,
            idle_ms,
            seconds,
        } => {
            let options = SimulateOptions {
                peer_topics: parse_topics(&peer_topics)?,
                network,
                secret,
                scan: Duration::from_millis(scan_ms),
                idle: Duration::from_millis(idle_ms),
                run_for: Duration::from_secs(seconds),
            };
            cmd_simulate(options).await
        }
    }
}

fn cmd_encrypt(plaintext: &str, passphrase: &str) -> Result<()> {
    let encrypted = crypto::encrypt(plaintext, passphrase).context("Encryption failed")?;
    println!("{}", encrypted);
    Ok(())
}

fn cmd_decrypt(ciphertext: &str, passphrase: &str) -> Result<()> {
    let decrypted = crypto::decrypt(ciphertext, passphrase).context("Decryption failed")?;
    println!("{}", decrypted);
    Ok(())
}

fn cmd_topic_id(name: &str) -> Result<()> {
    // service and topic ids share one derivation
    println!("{}", TopicId::from_name(name));
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("No value for key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:28} {}", key.bright_cyan(), value);
            }
            println!();
            println!("Config file: {}", config::Config::config_file()?.display());
        }
    }
    Ok(())
}

fn cmd_topic(action: TopicAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        TopicAction::Set { name, value } => {
            config.set_topic(&name, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), name.bright_cyan(), value);
        }
        TopicAction::Remove { name } => {
            if config.remove_topic(&name) {
                config.save()?;
                println!("{} Removed {}", "✓".green(), name.bright_cyan());
            } else {
                println!("{} No topic named {}", "✗".red(), name);
            }
        }
        TopicAction::List => {
            println!("{} ({} total)", "Topics".bold(), config.topics.len());
            for (name, value) in &config.topics {
                println!(
                    "  {:20} {:10} {}",
                    name.bright_cyan(),
                    value,
                    TopicId::from_name(name).to_string().dimmed()
                );
            }
        }
    }
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = config::Config::load()?;
    let settings = &config.settings;

    println!("{}", "StatusBeacon Node".bold());
    println!("  Service:     {} ({})", settings.service_name.bright_cyan(), settings.service_id());
    println!("  Peer id:     {}", settings.local_peer_id);
    println!(
        "  Encryption:  {}",
        if settings.passphrase.is_some() {
            "passphrase".green()
        } else {
            "plaintext".yellow()
        }
    );
    println!(
        "  Duty cycle:  scan {:?} / idle {:?}",
        settings.scan_duration(),
        settings.idle_duration()
    );
    println!(
        "  Writes:      {} attempts, {}ms apart",
        settings.write_retry.max_attempts, settings.write_retry.delay_ms
    );
    println!("  Topics:      {}", config.topics.len());
    Ok(())
}

// ============================================================================
// SIMULATION
// ============================================================================

struct SimulateOptions {
    peer_topics: BTreeMap<String, String>,
    network: String,
    secret: String,
    scan: Duration,
    idle: Duration,
    run_for: Duration,
}

/// Parse `name=value` pairs
fn parse_topics(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (name, value) = pair
                .split_once('=')
                .with_context(|| format!("Expected name=value, got '{}'", pair))?;
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}

enum SimEvent {
    Compared(&'static str, AdvertisingOutcome),
    Discovered(&'static str, DiscoveryOutcome),
}

async fn build_node(
    air: &LoopbackAir,
    label: &'static str,
    settings: ExchangeSettings,
    topics: &BTreeMap<String, String>,
    credentials: (String, String),
    events: mpsc::UnboundedSender<SimEvent>,
) -> Result<StatusNode> {
    let node = StatusNode::new(
        Arc::new(air.peripheral(label)),
        Arc::new(air.central(label)),
        settings,
    )?;
    for (name, value) in topics {
        node.add_topic(name, value.as_bytes()).await?;
    }

    let mut compared = node.advertiser().attach_consumer();
    let mut discovered = node.discovery().attach_consumer();

    let advertiser = node.advertiser().clone();
    let compare_events = events.clone();
    tokio::spawn(async move {
        let (network, secret) = credentials;
        while let Some(outcome) = compared.recv().await {
            let result = match &outcome {
                AdvertisingOutcome::SameStatus { .. } => advertiser.notify_same().await,
                AdvertisingOutcome::DifferentStatus { .. } => {
                    advertiser.notify_status(&network, &secret, None).await
                }
            };
            if let Err(e) = result {
                tracing::warn!("{}: notify failed: {}", label, e);
            }
            let _ = compare_events.send(SimEvent::Compared(label, outcome));
        }
    });
    tokio::spawn(async move {
        while let Some(outcome) = discovered.recv().await {
            let _ = events.send(SimEvent::Discovered(label, outcome));
        }
    });

    Ok(node)
}

async fn cmd_simulate(options: SimulateOptions) -> Result<()> {
    let config = config::Config::load()?;
    if config.topics.is_empty() {
        anyhow::bail!("No local topics; add one with `statusbeacon topic set <name> <value>`");
    }
    let peer_topics = if options.peer_topics.is_empty() {
        config.topics.clone()
    } else {
        options.peer_topics
    };

    let mut local_settings = config.settings.clone();
    local_settings.scan_duration_ms = options.scan.as_millis() as u64;
    local_settings.idle_duration_ms = options.idle.as_millis() as u64;
    let mut peer_settings = local_settings.clone();
    peer_settings.local_peer_id = format!("{}-peer", local_settings.local_peer_id);

    let air = LoopbackAir::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let credentials = (options.network, options.secret);
    let local = build_node(
        &air,
        "local",
        local_settings,
        &config.topics,
        credentials.clone(),
        tx.clone(),
    )
    .await?;
    let peer = build_node(&air, "peer", peer_settings, &peer_topics, credentials, tx).await?;

    println!("{}", "StatusBeacon: simulating...".bold());
    println!(
        "  Service: {} ({})",
        config.settings.service_name.bright_cyan(),
        ServiceId::from_name(&config.settings.service_name)
    );
    println!("  Running for {:?}", options.run_for);
    println!();

    local.start().await?;
    peer.start().await?;

    let deadline = tokio::time::sleep(options.run_for);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = rx.recv() => print_event(event),
        }
    }

    local.stop().await?;
    peer.stop().await?;
    println!();
    println!(
        "{} Simulation finished ({} writes, {} notifications)",
        "✓".green(),
        air.writes(),
        air.notifications()
    );
    Ok(())
}

fn print_event(event: SimEvent) {
    match event {
        SimEvent::Compared(node, AdvertisingOutcome::SameStatus { topic }) => {
            println!("  [{}] {} compared '{}': same", node.bright_blue(), "←".dimmed(), topic);
        }
        SimEvent::Compared(node, AdvertisingOutcome::DifferentStatus { topic, peer_id, .. }) => {
            println!(
                "  [{}] {} compared '{}' with {}: {}",
                node.bright_blue(),
                "←".dimmed(),
                topic,
                peer_id,
                "different".yellow()
            );
        }
        SimEvent::Discovered(node, DiscoveryOutcome::SameStatus { peer, topic }) => {
            println!("  [{}] {} '{}' on {}: same", node.bright_blue(), "→".dimmed(), topic, peer);
        }
        SimEvent::Discovered(
            node,
            DiscoveryOutcome::DifferentStatus {
                peer,
                topic,
                credentials,
            },
        ) => {
            println!(
                "  [{}] {} '{}' on {}: {} (network {}, info '{}')",
                node.bright_blue(),
                "→".dimmed(),
                topic,
                peer,
                "different".yellow().bold(),
                credentials.network.bright_cyan(),
                credentials.peer_info
            );
        }
    }
}
