//! chanwatch - bias-aware public channel collector
//!
//! Collects public channel messages into SQLite and reports what each
//! backend could and could not observe.

mod process_lock;
mod scrape;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chanwatch_core::bias::export_bias_report;
use chanwatch_core::capabilities::{disclaimer, BiasDisclosure};
use chanwatch_core::{
    normalize_channel_name, BackendKind, Capabilities, Config, Database, ProxyPool,
};
use clap::{Parser, Subcommand};

use crate::scrape::ScrapeArgs;

#[derive(Parser, Debug)]
#[command(name = "chanwatch")]
#[command(about = "Collect public channel messages with bias and continuity tracking")]
#[command(version)]
struct Cli {
    /// Config file to use instead of the XDG default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect one or more channels as a single run
    Scrape(ScrapeArgs),

    /// Export a bias report for a collected channel
    Report {
        /// Channel name, with or without a leading @
        channel: String,

        /// Output path (defaults to the XDG reports directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show recent run manifests
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Only runs that included this channel
        #[arg(long)]
        channel: Option<String>,
    },

    /// Show what each backend can observe
    Caps {
        /// Single backend to describe
        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// Print the disclosure as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the configured proxy pool
    Proxies {
        /// Print pool statistics as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let _log_guard =
        chanwatch_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Command::Scrape(args) => scrape::run(config, args).await,
        Command::Report { channel, output } => report(&channel, output),
        Command::Runs { limit, channel } => runs(limit, channel.as_deref()),
        Command::Caps { backend, json } => caps(backend, json),
        Command::Proxies { json } => proxies(&config, json),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    // Must happen before any path helpers run
    Config::ensure_xdg_env();

    let config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

pub(crate) fn open_database(path: &Path) -> Result<Database> {
    tracing::info!(path = %path.display(), "Opening database");
    let db = Database::open(path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(db)
}

fn report(channel: &str, output: Option<PathBuf>) -> Result<()> {
    let db = open_database(&Config::database_path())?;
    let name = normalize_channel_name(channel);

    let stored = db
        .find_channel(&name)
        .context("failed to look up channel")?
        .with_context(|| format!("channel {} has not been collected yet", name))?;

    let path = output.unwrap_or_else(|| {
        Config::report_dir().join(format!(
            "{}-{}.json",
            name,
            chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
        ))
    });

    let report = export_bias_report(&db, stored.channel.id, &path)
        .context("failed to export bias report")?;

    println!(
        "Bias report for {} ({} backend, confidence: {})",
        report.channel.name, report.disclosure.backend, report.disclosure.bias_confidence
    );
    println!();
    println!("{}", report.methodology_statement);
    println!();
    println!("Written to {}", path.display());
    Ok(())
}

fn runs(limit: usize, channel: Option<&str>) -> Result<()> {
    let db = open_database(&Config::database_path())?;
    let manifests = match channel {
        Some(channel) => db.recent_runs_for_channel(&normalize_channel_name(channel), limit),
        None => db.recent_runs(limit),
    }
    .context("failed to load run history")?;

    if manifests.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!(
        "{:<10} {:<20} {:<7} {:<12} {:>9} {:>7} {:>9}  CHANNELS",
        "RUN", "STARTED", "BACKEND", "MODE", "COLLECTED", "ERRORS", "DURATION"
    );
    for manifest in &manifests {
        let duration = manifest
            .duration()
            .map(|d| format!("{}s", d.num_seconds()))
            .unwrap_or_else(|| "running".to_string());
        println!(
            "{:<10} {:<20} {:<7} {:<12} {:>9} {:>7} {:>9}  {}",
            manifest.short_id(),
            manifest.start_time.format("%Y-%m-%d %H:%M:%S"),
            manifest.backend,
            manifest.mode.as_str(),
            manifest.counters.messages_collected,
            manifest.counters.errors_encountered,
            duration,
            manifest.channels.join(", ")
        );
    }
    Ok(())
}

fn caps(backend: Option<BackendKind>, json: bool) -> Result<()> {
    let kinds = match backend {
        Some(kind) => vec![kind],
        None => BackendKind::all().to_vec(),
    };

    if json {
        let disclosures: Vec<BiasDisclosure> =
            kinds.into_iter().map(Capabilities::bias_disclosure).collect();
        println!("{}", serde_json::to_string_pretty(&disclosures)?);
        return Ok(());
    }

    for kind in kinds {
        let caps = Capabilities::for_backend(kind);
        println!(
            "{} (bias confidence: {}, gap metrics: {})",
            kind,
            caps.bias_confidence,
            caps.metrics_confidence()
        );
        let limitations = caps.limitations();
        if limitations.is_empty() {
            println!("  No known limitations");
        }
        for limitation in limitations {
            println!("  - {}", limitation);
        }
        println!("  {}", disclaimer(kind));
        println!();
    }
    Ok(())
}

fn proxies(config: &Config, json: bool) -> Result<()> {
    let pool = ProxyPool::from_config(&config.proxy).context("invalid proxy endpoint")?;
    let stats = pool.stats();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    if pool.is_empty() {
        println!("No proxy endpoints configured; connections are direct.");
        return Ok(());
    }

    println!(
        "{} endpoints ({} available, {} dead), strategy {}",
        stats.total,
        stats.available,
        stats.dead,
        pool.strategy().as_str()
    );
    for (kind, count) in &stats.by_kind {
        println!("  {}: {}", kind, count);
    }
    println!();
    for endpoint in pool.endpoints() {
        println!(
            "  {:<28} {:<7} {:<4} {:>5.1}%",
            endpoint.key(),
            endpoint.kind.scheme(),
            endpoint.country.as_deref().unwrap_or("-"),
            endpoint.success_rate() * 100.0
        );
    }
    Ok(())
}
