use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::abuse::ChallengeScope;
use floodgate::config::{FloodgateConfig, LogFormat, LoggingConfig};
use floodgate::identity::RequestHeaders;
use floodgate::Floodgate;

/// Token bucket rate limiting with abuse escalation.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// YAML configuration file; FLOODGATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the janitor and escalation monitor until interrupted
    Serve,

    /// Gate a single request and print the decision
    Check {
        /// Operation name, e.g. submit_form
        #[arg(short, long)]
        operation: String,

        /// Request header as NAME=VALUE; may be repeated
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Print the decision as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete idle buckets now
    Sweep {
        /// Override the configured idle age
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Show the current escalation state
    Escalation {
        /// Evaluate a single caller instead of the global scope
        #[arg(long)]
        identifier: Option<String>,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = FloodgateConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Floodgate");

    let gate = Floodgate::from_config(&config)?;

    match cli.command {
        Command::Serve => serve(&gate).await,
        Command::Check {
            operation,
            headers,
            json,
        } => {
            let headers: RequestHeaders = headers.into_iter().collect();
            let result = gate.check_request(&headers, &operation).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                let d = &result.decision;
                println!(
                    "{} {} for {}: remaining={} reset_after={}s{}{}",
                    if d.allowed { "ALLOW" } else { "DENY" },
                    result.operation,
                    result.identifier,
                    d.remaining_tokens,
                    d.reset_after_secs,
                    d.retry_after_secs
                        .map(|s| format!(" retry_after={}s", s))
                        .unwrap_or_default(),
                    if result.challenge_required { " challenge" } else { "" },
                );
            }
            Ok(())
        }
        Command::Sweep { max_age_secs } => {
            let removed = match max_age_secs {
                Some(age) => gate.sweep(age).await?,
                None => gate.sweep_now().await?,
            };
            println!("removed {} idle buckets", removed);
            Ok(())
        }
        Command::Escalation { identifier } => {
            let scope = identifier
                .map(ChallengeScope::Identifier)
                .unwrap_or(ChallengeScope::Global);
            let state = gate.escalation_state(&scope).await;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
    }
}

/// Run background maintenance until a shutdown signal arrives.
async fn serve(gate: &Floodgate) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = gate.spawn_background(shutdown_rx);
    info!("Background tasks running");

    shutdown_signal().await?;

    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Floodgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_thread_ids(true).init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
    Ok(())
}
