//! Agrolink CLI
//!
//! Command-line access to the real-time session:
//! - Listen to live messages
//! - Send a single message
//! - Generate a default config file

use agrolink::{
    generate_default_config, Config, ConnectionState, LoggingConfig, Session, Subscription,
    WILDCARD,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agrolink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time session client for the traceability suite")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Server endpoint, overrides the config file
    #[arg(short, long, global = true)]
    pub endpoint: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print live messages as JSON lines
    Listen {
        /// Message types to follow (default: all)
        #[arg(short = 't', long = "type")]
        types: Vec<String>,
    },

    /// Send one message and exit
    Send {
        /// Message type
        msg_type: String,
        /// JSON payload (plain text is sent as a string)
        data: Option<String>,
        /// Seconds to wait for the connection to open
        #[arg(long, default_value = "10")]
        wait_secs: u64,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("Failed to write {:?}", path))?;
                eprintln!("Config written to {:?}", path);
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.session.endpoint = endpoint;
    }

    init_logging(&config.logging);
    tracing::info!("Agrolink v{}", env!("CARGO_PKG_VERSION"));

    let session = Session::start(&config.session)?;

    let result = match cli.command {
        Commands::Listen { types } => listen(&session, types).await,
        Commands::Send {
            msg_type,
            data,
            wait_secs,
        } => send(&session, &msg_type, data, Duration::from_secs(wait_secs)).await,
        Commands::Config { .. } => Ok(()),
    };

    tracing::info!("{}", session.stats());
    session.shutdown().await;
    result
}

/// Logs go to stderr; stdout carries message output
fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("agrolink={}", config.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn listen(session: &Session, types: Vec<String>) -> anyhow::Result<()> {
    let subscriptions: Vec<Subscription> = if types.is_empty() {
        vec![session.subscribe(WILDCARD, |envelope| println!("{}", envelope))]
    } else {
        types
            .into_iter()
            .map(|msg_type| {
                let label = msg_type.clone();
                session.subscribe(&msg_type, move |data| {
                    println!("{}", json!({ "type": label, "data": data }));
                })
            })
            .collect()
    };

    session.connect();

    let mut states = session.watch_state();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, shutting down");
                break Ok(());
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *states.borrow_and_update();
                tracing::info!(state = %state, "Connection state changed");
                if state == ConnectionState::Failed {
                    break Err(anyhow::anyhow!(
                        "Gave up connecting to {}",
                        session.endpoint()
                    ));
                }
            }
        }
    };

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    outcome
}

async fn send(
    session: &Session,
    msg_type: &str,
    data: Option<String>,
    wait: Duration,
) -> anyhow::Result<()> {
    let data = match data {
        Some(raw) => serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw)),
        None => Value::Null,
    };

    session.connect();
    if !session.wait_connected(wait).await {
        bail!(
            "Could not connect to {} within {:?} (state: {})",
            session.endpoint(),
            wait,
            session.state()
        );
    }

    session.send_message(msg_type, data)?;
    // Close waits for the frame to be flushed
    session.close().await;
    tracing::info!(msg_type = %msg_type, "Message sent");
    Ok(())
}
