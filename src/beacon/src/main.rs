//! Beacon CLI — drive the tracking client from a shell. Delivered batches are
//! written to stdout as newline-delimited JSON; logs go to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use beacon_core::config::TrackerConfig;
use beacon_core::transport::Transport;
use beacon_core::types::{Event, Properties};
use beacon_web_sdk::{FileStore, MemoryStore, Tracker};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "beacon")]
#[command(about = "Event tracking client with persistent sessions and queue")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); BEACON__* environment variables take precedence
    #[arg(short, long, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    /// Durable state file shared between runs
    #[arg(short, long, default_value = "beacon-state.json")]
    state: PathBuf,

    /// Ingestion host (overrides config and stored value)
    #[arg(long)]
    host: Option<String>,

    /// Tracking API key (overrides config and stored value)
    #[arg(long)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Track a custom event
    Track {
        /// Event name
        name: String,

        /// Event property as key=value; values that parse as JSON keep their type
        #[arg(short = 'p', long = "property", value_parser = parse_property)]
        properties: Vec<(String, Value)>,
    },

    /// Record a screen view
    Screen {
        /// Screen name
        name: String,
    },

    /// Attach a customer id to subsequent events
    Identify {
        customer_id: String,
    },

    /// Print the current session, creating or renewing it first
    Session,

    /// Deliver events carried over from earlier runs
    Flush,

    /// End the session and forget the visitor
    Reset,
}

fn parse_property(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty property key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
    Ok((key.to_string(), value))
}

/// Writes each delivered event to stdout as one JSON line.
struct StdoutTransport;

#[async_trait]
impl Transport for StdoutTransport {
    async fn submit(&self, events: &[Event]) -> anyhow::Result<bool> {
        let mut out = std::io::stdout().lock();
        for event in events {
            serde_json::to_writer(&mut out, event)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(true)
    }
}

fn load_config(path: Option<&Path>) -> TrackerConfig {
    let loaded = match path {
        Some(path) => TrackerConfig::load_from(path),
        None => TrackerConfig::load(),
    };
    loaded.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        TrackerConfig::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=info,beacon_web_sdk=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref());
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(api_key) = cli.api_key {
        config.api_key = api_key;
    }

    let durable = Arc::new(
        FileStore::open(&cli.state)
            .with_context(|| format!("opening state file {}", cli.state.display()))?,
    );
    let tracker = Tracker::builder(config)
        .with_durable_store(durable)
        // Volatile state is per process: every invocation is a fresh tab.
        .with_volatile_store(Arc::new(MemoryStore::new()))
        .with_transport(Arc::new(StdoutTransport))
        .from_stored_credentials()?
        .build()?;

    match cli.command {
        Commands::Track { name, properties } => {
            let properties: Properties = properties.into_iter().collect();
            tracker.track(&name, properties).await;
        }
        Commands::Screen { name } => {
            tracker.enter_screen(&name, Properties::new()).await;
        }
        Commands::Identify { customer_id } => {
            tracker.identify(&customer_id).await;
        }
        Commands::Session => {
            tracker.touch_session().await;
            let session = tracker.core().and_then(|core| core.session());
            eprintln!("{}", serde_json::to_string_pretty(&session)?);
        }
        Commands::Flush => {}
        Commands::Reset => {
            tracker.reset().await;
        }
    }

    tracker.flush();
    tracker.close().await;
    info!("beacon finished");
    Ok(())
}
