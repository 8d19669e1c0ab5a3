use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use clickstream::agent::Agent;
use clickstream::config::Config;
use clickstream::generator;

/// Real-time clickstream metrics over web-access logs.
#[derive(Parser)]
#[command(name = "clickstream", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Aggregate log lines from the configured source (default).
    Run,
    /// Print synthetic log lines to stdout.
    Generate {
        /// Number of simulated users (overrides config).
        #[arg(long)]
        users: Option<usize>,

        /// How long to generate for, e.g. "5m" (overrides config).
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<std::time::Duration>,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("clickstream {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(level) = &cli.log_level {
        cfg.log_level = level.clone();
    }

    // Logs go to stderr so generated lines on stdout stay pipeable.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Generate { users, duration }) => {
            if let Some(users) = users {
                cfg.generator.users = users;
            }
            if let Some(duration) = duration {
                cfg.generator.duration = duration;
            }
            cfg.validate()?;

            rt.block_on(generate(cfg))
        }
        Some(Command::Run) | None => {
            cfg.validate()?;

            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting clickstream",
            );

            rt.block_on(run(cfg))
        }
        Some(Command::Version) => Ok(()),
    }
}

/// Resolves once SIGINT or SIGTERM arrives.
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;

    if let Err(e) = agent.start().await {
        // Release whatever did start before reporting.
        if let Err(stop_err) = agent.stop().await {
            tracing::error!(error = %format_args!("{stop_err:#}"), "error during cleanup");
        }
        return Err(e);
    }

    let engine_stopped = agent.engine_stopped();

    tokio::select! {
        result = shutdown_signal() => {
            if let Err(e) = result {
                tracing::error!(error = %format_args!("{e:#}"), "signal handling failed, shutting down");
            }
        }
        _ = engine_stopped.cancelled() => {
            tracing::error!("aggregation engine stopped unexpectedly, shutting down");
        }
    }

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("clickstream stopped");

    Ok(())
}

async fn generate(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::warn!(error = %format_args!("{e:#}"), "signal handling unavailable");
            return;
        }
        signal_cancel.cancel();
    });

    generator::run(&cfg.generator, tokio::io::stdout(), cancel).await?;

    Ok(())
}
