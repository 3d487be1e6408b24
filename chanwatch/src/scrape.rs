//! `chanwatch scrape`: one collection run over one or more channels.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chanwatch_core::fetch::{HttpMediaFetcher, MediaPool};
use chanwatch_core::{
    normalize_channel_name, BackendKind, ChannelOutcome, Collector, Config, MessageFilter,
    MessageStore, ProxyPool, RunContext, RunSummary, ScrapeMode, SourceAdapter,
};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};

use crate::process_lock::acquire_channel_locks;

#[derive(Args, Debug)]
pub struct ScrapeArgs {
    /// Channel names, with or without a leading @
    #[arg(required = true)]
    pub channels: Vec<String>,

    /// Stop each channel after this many messages
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Override the configured backend
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// Override the configured base URL
    #[arg(long)]
    pub base_url: Option<String>,

    /// Ignore stored checkpoints and fetch everything reachable
    #[arg(long)]
    pub full: bool,

    /// Do not resume from stored checkpoints (mode stays as configured)
    #[arg(long)]
    pub no_resume: bool,

    /// Download media attachments
    #[arg(long)]
    pub media: bool,
}

impl ScrapeArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(backend) = self.backend {
            config.source.backend = backend;
        }
        if let Some(url) = &self.base_url {
            config.source.base_url = Some(url.clone());
        }
        if self.full {
            config.collection.mode = ScrapeMode::Full;
        }
        if self.no_resume {
            config.collection.resume = false;
        }
        if self.media {
            config.collection.download_media = true;
        }
    }
}

pub async fn run(mut config: Config, args: ScrapeArgs) -> Result<()> {
    args.apply(&mut config);

    let channels: Vec<String> = args
        .channels
        .iter()
        .map(|c| normalize_channel_name(c))
        .collect();

    let db_path = Config::database_path();
    let _locks = acquire_channel_locks(&db_path, &channels)
        .context("failed to acquire channel locks")?;
    let db = Arc::new(crate::open_database(&db_path)?);

    let mut adapter =
        SourceAdapter::from_config(&config.source).context("failed to create source adapter")?;
    let caps = adapter.capabilities();
    tracing::info!(
        backend = %adapter.kind(),
        confidence = %caps.metrics_confidence(),
        channels = channels.len(),
        "chanwatch scrape starting"
    );

    let store: Arc<dyn MessageStore> = db.clone();
    let mut collector = Collector::new(store, &config);

    if let Some(filter) =
        MessageFilter::from_config(&config.filter).context("invalid message filter")?
    {
        collector = collector.with_filter(filter);
    }

    if !config.proxy.endpoints.is_empty() {
        let pool = ProxyPool::from_config(&config.proxy).context("invalid proxy endpoint")?;
        collector = collector.with_proxy_pool(Arc::new(pool));
    }

    if config.collection.download_media {
        if caps.media_reachable() {
            let fetcher = HttpMediaFetcher::new(Duration::from_secs(config.source.timeout_secs))
                .context("failed to create media client")?;
            collector = collector.with_media(MediaPool::start(
                &config.media,
                config.media_dir(),
                Arc::new(fetcher),
            ));
        } else {
            println!(
                "The {} backend exposes no media; downloads are disabled for this run.",
                adapter.kind()
            );
        }
    }

    let stop = collector.stop_signal();
    ctrlc::set_handler(move || {
        eprintln!("\nStopping after the current message...");
        stop.stop();
    })
    .context("failed to set Ctrl+C handler")?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("connecting...");

    let bar = pb.clone();
    collector = collector.with_progress(move |outcome: &ChannelOutcome| {
        bar.set_message(progress_message(outcome));
    });

    let mut ctx = RunContext::new(Arc::clone(&db), Config::manifest_dir());
    let result = collector
        .run(&mut adapter, &mut ctx, &channels, args.limit)
        .await;
    pb.finish_and_clear();

    let summary = result.context("collection run failed")?;
    print_summary(&summary);

    tracing::info!(
        collected = summary.total_collected(),
        inserted = summary.total_inserted(),
        failures = summary.failures.len(),
        "chanwatch scrape complete"
    );
    Ok(())
}

fn progress_message(outcome: &ChannelOutcome) -> String {
    let name = outcome
        .channel
        .as_ref()
        .map(|c| c.name.as_str())
        .unwrap_or("...");
    let mut msg = format!(
        "{}: {} collected, {} new",
        name, outcome.collected, outcome.inserted
    );
    if outcome.flood_waits > 0 {
        msg.push_str(&format!(", {} flood waits", outcome.flood_waits));
    }
    msg
}

fn print_summary(summary: &RunSummary) {
    if let Some(manifest) = &summary.manifest {
        println!(
            "Run {} ({} backend, {})",
            manifest.short_id(),
            manifest.backend,
            manifest.mode.as_str()
        );
    }

    for outcome in &summary.channels {
        let name = outcome
            .channel
            .as_ref()
            .map(|c| c.name.as_str())
            .unwrap_or("?");
        println!(
            "  {:<24} {:>6} collected  {:>6} new  {:>4} skipped  {:>4} errors",
            name, outcome.collected, outcome.inserted, outcome.skipped, outcome.errors
        );
        if outcome.flood_waits > 0 || outcome.rotations > 0 {
            println!(
                "  {:<24} {} flood waits, {} rotations",
                "", outcome.flood_waits, outcome.rotations
            );
        }
        if outcome.filtered > 0 {
            println!("  {:<24} {} filtered out", "", outcome.filtered);
        }
        if outcome.new_gaps > 0 {
            println!("  {:<24} {} new gaps", "", outcome.new_gaps);
        }
        if let Some(checkpoint) = outcome.checkpoint {
            println!("  {:<24} checkpoint {}", "", checkpoint);
        }
        if !outcome.forwards.is_empty() {
            println!(
                "  {:<24} forwarded from: {}",
                "",
                outcome.forwards.join(", ")
            );
        }
    }

    for (channel, reason) in &summary.failures {
        println!("  {:<24} failed: {}", channel, reason);
    }

    if let Some(media) = &summary.media {
        println!(
            "Media: {} downloaded, {} already present, {} duplicates, {} failed",
            media.downloaded, media.skipped_existing, media.duplicates, media.failed
        );
    }

    if summary.stopped() {
        println!("Stopped early; the next run resumes from the saved checkpoints.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanwatch_core::ChannelRef;

    fn args(flags: &[&str]) -> ScrapeArgs {
        use clap::Parser;

        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: ScrapeArgs,
        }

        let mut argv = vec!["scrape", "news"];
        argv.extend_from_slice(flags);
        Wrapper::parse_from(argv).args
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = Config::default();
        args(&["--backend", "mirror", "--full", "--no-resume", "--media"]).apply(&mut config);

        assert_eq!(config.source.backend, BackendKind::Mirror);
        assert_eq!(config.collection.mode, ScrapeMode::Full);
        assert!(!config.collection.resume);
        assert!(config.collection.download_media);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let mut config = Config::default();
        config.source.base_url = Some("https://upstream.example".into());
        args(&[]).apply(&mut config);

        assert_eq!(config.source.backend, BackendKind::Api);
        assert_eq!(config.collection.mode, ScrapeMode::Incremental);
        assert!(config.collection.resume);
        assert_eq!(
            config.source.base_url.as_deref(),
            Some("https://upstream.example")
        );
    }

    #[test]
    fn test_progress_message_mentions_flood_waits() {
        let mut outcome = ChannelOutcome {
            channel: Some(ChannelRef::new(7, "news")),
            collected: 40,
            inserted: 12,
            ..Default::default()
        };
        assert_eq!(progress_message(&outcome), "news: 40 collected, 12 new");

        outcome.flood_waits = 2;
        assert_eq!(
            progress_message(&outcome),
            "news: 40 collected, 12 new, 2 flood waits"
        );
    }
}
