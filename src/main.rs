//! Pulse Link CLI
//!
//! Command-line interface for watching a push channel:
//! - Stream task progress, task logs and data channels as JSON lines
//! - Generate a default config file

use anyhow::Context;
use clap::{Parser, Subcommand};
use pulse_link::{Config, LoggingConfig, Session, SubscriptionHandle};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pulse-link")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Watch a live-dashboard push channel")]
#[command(long_about = "Pulse Link keeps one WebSocket open to a dashboard backend.\nSubscribe to task progress, task logs and data channels; payloads are printed as JSON lines.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the usual locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// WebSocket URL, overriding the config
    #[arg(long, global = true)]
    pub url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Subscribe and print payloads until Ctrl-C
    Watch {
        /// Task ids to follow progress for
        #[arg(short, long)]
        progress: Vec<String>,
        /// Task ids to follow logs for
        #[arg(short, long)]
        logs: Vec<String>,
        /// Data channel names
        #[arg(short, long)]
        data: Vec<String>,
        /// Raw channel keys (e.g. `error:t1` or a custom frame type)
        #[arg(long = "channel")]
        channels: Vec<String>,
        /// Also print session lifecycle events
        #[arg(long)]
        events: bool,
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

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(url) = cli.url {
        config.session.url = Some(url);
    }

    init_logging(&config.logging);

    match cli.command {
        Commands::Watch {
            progress,
            logs,
            data,
            channels,
            events,
        } => {
            config.validate()?;
            watch(config, progress, logs, data, channels, events).await?;
        }
        Commands::Config { output } => {
            let content = pulse_link::generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("pulse_link={}", logging.level)),
    );
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries payloads; logs go to stderr
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn watch(
    config: Config,
    progress: Vec<String>,
    logs: Vec<String>,
    data: Vec<String>,
    channels: Vec<String>,
    events: bool,
) -> anyhow::Result<()> {
    let keys: Vec<String> = progress
        .iter()
        .map(|id| format!("progress:{}", id))
        .chain(logs.iter().map(|id| format!("log:{}", id)))
        .chain(data.iter().map(|name| format!("data:{}", name)))
        .chain(channels)
        .collect();
    if keys.is_empty() {
        anyhow::bail!("nothing to watch; pass --progress, --logs, --data or --channel");
    }

    let session = Session::new(config.session)?;
    tracing::info!("Pulse Link v{}", env!("CARGO_PKG_VERSION"));

    let _subscriptions: Vec<SubscriptionHandle> = keys
        .iter()
        .map(|key| {
            let channel = key.clone();
            session.subscribe(key, move |payload| {
                let line = serde_json::json!({ "channel": channel, "payload": payload });
                println!("{}", line);
            })
        })
        .collect();

    if events {
        let mut lifecycle = session.events();
        tokio::spawn(async move {
            loop {
                match lifecycle.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tracing::warn!(error = %e, "Cannot serialize event"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    session.connect()?;
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    session.shutdown().await?;
    let stats = session.stats();
    tracing::info!(
        frames = stats.frames_received,
        dispatched = stats.router.dispatched,
        reconnects = stats.reconnects_scheduled,
        "Pulse Link shutdown complete"
    );
    Ok(())
}
