//! tiermemd
//!
//! Runs a tier manager from a YAML configuration until interrupted, logging
//! a metrics summary at a fixed interval.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tiermem::{EngineConfig, Manager, Result};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiermemd - multi-tier memory orchestration daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; built-in defaults when omitted
    #[arg(long, short, env = "TIERMEM_CONFIG")]
    config: Option<PathBuf>,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,

    /// Seconds between metrics summaries (0 disables them)
    #[arg(long, env = "TIERMEM_STATS_INTERVAL", default_value = "60")]
    stats_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if args.print_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    info!(
        config = ?args.config,
        tiers = config.enabled_tiers().count(),
        max_concurrency = config.engine.max_concurrency,
        "Starting tiermemd"
    );

    let manager = Manager::from_config(config).await.map_err(|e| {
        error!(error = %e, "Failed to start tier manager");
        e
    })?;

    if args.stats_interval_secs > 0 {
        let reporter = manager.clone();
        let period = Duration::from_secs(args.stats_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                if reporter.is_closed() {
                    break;
                }
                report(&reporter).await;
            }
        });
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutdown signal received");
    manager.close().await?;
    info!("tiermemd shutdown complete");
    Ok(())
}

async fn report(manager: &Manager) {
    let snapshot = manager.metrics();
    let shortest = snapshot.windows.first();
    info!(
        uptime_secs = snapshot.uptime_secs,
        operations = snapshot.lifetime.operations,
        hits = snapshot.lifetime.hits,
        misses = snapshot.lifetime.misses,
        errors = snapshot.lifetime.errors,
        migrations = snapshot.lifetime.migrations,
        hit_rate = shortest.map_or(0.0, |w| w.hit_rate),
        active_alerts = snapshot.alerts.len(),
        "Metrics summary"
    );

    match manager.stats().await {
        Ok(stats) => {
            for tier in stats.tiers {
                info!(
                    tier = %tier.name,
                    items = tier.backend.total_items,
                    bytes = tier.backend.total_size_bytes,
                    hit_ratio = tier.backend.hit_ratio(),
                    "Tier summary"
                );
            }
        }
        Err(e) => error!(error = %e, "Failed to collect tier stats"),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["sqlx=warn", "tokio=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
