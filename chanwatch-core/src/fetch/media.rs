//! Background media downloads
//!
//! The fetch loop enqueues [`MediaTask`]s and never waits on them. A fixed
//! set of workers drains a shared queue, bounded by a semaphore, retrying
//! each file with exponential backoff. Identical content is stored once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::types::{MediaRef, MessageRecord};

/// Extra wait per attempt when a download is rate limited
const MEDIA_FLOOD_STEP: Duration = Duration::from_secs(5);

/// One file to download.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaTask {
    pub channel_name: String,
    pub message_id: Option<i64>,
    pub posted_at: DateTime<Utc>,
    /// Position of the attachment within its message
    pub index: usize,
    pub url: String,
    pub media: MediaRef,
}

impl MediaTask {
    /// Tasks for every attachment of `record` that has a URL
    pub fn for_record(record: &MessageRecord) -> Vec<MediaTask> {
        record
            .media
            .iter()
            .enumerate()
            .filter_map(|(index, media)| {
                Some(MediaTask {
                    channel_name: record.channel_name.clone(),
                    message_id: record.message_id,
                    posted_at: record.posted_at,
                    index,
                    url: media.url.clone()?,
                    media: media.clone(),
                })
            })
            .collect()
    }

    /// `{YYYYmmdd_HHMMSS}_{id}_{index}_{kind}.{ext}`
    pub fn file_name(&self) -> String {
        let id = self
            .message_id
            .map_or_else(|| "noid".to_string(), |id| id.to_string());
        format!(
            "{}_{}_{}_{}.{}",
            self.posted_at.format("%Y%m%d_%H%M%S"),
            id,
            self.index,
            self.media.kind.as_str(),
            self.extension()
        )
    }

    fn extension(&self) -> String {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        let last = path.rsplit('/').next().unwrap_or(path);
        match last.rsplit_once('.') {
            Some((_, ext))
                if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                ext.to_ascii_lowercase().replace("jpeg", "jpg")
            }
            _ => self.media.kind.default_extension().to_string(),
        }
    }
}

/// Fetches raw bytes for a media URL.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Plain HTTP fetcher.
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Media(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited {
                wait: Duration::from_secs(30),
            });
        }
        if !status.is_success() {
            return Err(Error::Media(format!("{} answered {}", url, status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Media(format!("failed to read {}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }
}

/// Download counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaStats {
    pub downloaded: u64,
    /// File already present on disk
    pub skipped_existing: u64,
    /// Content identical to a file downloaded earlier
    pub duplicates: u64,
    pub failed: u64,
    pub pending: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    downloaded: AtomicU64,
    skipped_existing: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> MediaStats {
        let downloaded = self.downloaded.load(Ordering::Relaxed);
        let skipped_existing = self.skipped_existing.load(Ordering::Relaxed);
        let duplicates = self.duplicates.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let done = downloaded + skipped_existing + duplicates + failed;
        MediaStats {
            downloaded,
            skipped_existing,
            duplicates,
            failed,
            pending: self.enqueued.load(Ordering::Relaxed).saturating_sub(done),
        }
    }
}

struct Shared {
    fetcher: Arc<dyn MediaFetcher>,
    directory: PathBuf,
    permits: Semaphore,
    hashes: Mutex<HashSet<String>>,
    counters: Counters,
    max_attempts: u32,
    retry_base: Duration,
}

enum Outcome {
    Downloaded(PathBuf),
    Existing,
    Duplicate,
}

/// Bounded pool of download workers.
pub struct MediaPool {
    sender: Option<mpsc::UnboundedSender<MediaTask>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl MediaPool {
    /// Spawn `config.workers` workers on the current runtime.
    pub fn start(config: &MediaConfig, directory: PathBuf, fetcher: Arc<dyn MediaFetcher>) -> Self {
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            fetcher,
            directory,
            permits: Semaphore::new(worker_count),
            hashes: Mutex::new(HashSet::new()),
            counters: Counters::default(),
            max_attempts: config.max_retries.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..worker_count)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let task = receiver.lock().await.recv().await;
                        match task {
                            Some(task) => shared.run(worker, task).await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        tracing::debug!(workers = worker_count, "Media pool started");
        Self {
            sender: Some(sender),
            workers,
            shared,
        }
    }

    /// Queue one download. Returns false once the pool is finishing.
    pub fn enqueue(&self, task: MediaTask) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if sender.send(task).is_err() {
            self.shared.counters.enqueued.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Queue every attachment of a record; returns how many were queued.
    pub fn enqueue_record(&self, record: &MessageRecord) -> usize {
        MediaTask::for_record(record)
            .into_iter()
            .map(|task| self.enqueue(task))
            .filter(|queued| *queued)
            .count()
    }

    pub fn stats(&self) -> MediaStats {
        self.shared.counters.snapshot()
    }

    /// Stop accepting work, wait for the queue to drain, and report.
    pub async fn finish(mut self) -> MediaStats {
        self.sender = None;
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Media worker panicked");
            }
        }
        let stats = self.stats();
        tracing::info!(
            downloaded = stats.downloaded,
            skipped = stats.skipped_existing,
            duplicates = stats.duplicates,
            failed = stats.failed,
            "Media downloads finished"
        );
        stats
    }
}

impl Shared {
    async fn run(&self, worker: usize, task: MediaTask) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        for attempt in 0..self.max_attempts {
            match self.download(&task).await {
                Ok(Outcome::Downloaded(path)) => {
                    self.counters.downloaded.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(worker, path = %path.display(), "Downloaded media");
                    return;
                }
                Ok(Outcome::Existing) => {
                    self.counters.skipped_existing.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(Outcome::Duplicate) => {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    let remaining = self.max_attempts - attempt - 1;
                    if remaining == 0 {
                        tracing::warn!(
                            worker,
                            url = %task.url,
                            attempts = self.max_attempts,
                            error = %e,
                            "Giving up on media download"
                        );
                        break;
                    }
                    let wait = match e {
                        Error::RateLimited { wait } => wait + MEDIA_FLOOD_STEP * attempt,
                        _ => self.retry_base.saturating_mul(1 << attempt.min(16)),
                    };
                    tracing::debug!(
                        worker,
                        url = %task.url,
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying media download"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    async fn download(&self, task: &MediaTask) -> Result<Outcome> {
        let directory = self.directory.join(&task.channel_name);
        let path = directory.join(task.file_name());
        if tokio::fs::try_exists(&path).await? {
            return Ok(Outcome::Existing);
        }

        let bytes = self.fetcher.fetch(&task.url).await?;
        let digest = hex::encode(Sha256::digest(&bytes));
        if !self.remember(digest) {
            return Ok(Outcome::Duplicate);
        }

        tokio::fs::create_dir_all(&directory).await?;
        write_file(&path, &bytes).await?;
        Ok(Outcome::Downloaded(path))
    }

    /// Record a content hash; false when it was already known.
    fn remember(&self, digest: String) -> bool {
        self.hashes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(digest)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let partial = path.with_extension("part");
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendKind, IdProvenance, MediaKind};
    use chrono::TimeZone;
    use std::collections::HashMap;

    /// Serves fixed bodies; URLs listed in `flaky` fail that many times first.
    struct FakeFetcher {
        bodies: HashMap<String, Vec<u8>>,
        flaky: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(left) = flaky.get_mut(url) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(Error::Media("connection reset".to_string()));
                    }
                }
            }
            self.bodies
                .get(url)
                .cloned()
                .ok_or_else(|| Error::Media(format!("404 {}", url)))
        }
    }

    fn fetcher(bodies: &[(&str, &[u8])], flaky: &[(&str, u32)]) -> Arc<dyn MediaFetcher> {
        Arc::new(FakeFetcher {
            bodies: bodies
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_vec()))
                .collect(),
            flaky: Mutex::new(flaky.iter().map(|(u, n)| (u.to_string(), *n)).collect()),
        })
    }

    fn record(id: i64, urls: &[&str]) -> MessageRecord {
        MessageRecord {
            channel_id: 1,
            channel_name: "news".to_string(),
            message_id: Some(id),
            id_provenance: IdProvenance::Authoritative,
            posted_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            text: String::new(),
            views: None,
            forwards: None,
            reply_count: None,
            reactions: vec![],
            media: urls
                .iter()
                .map(|url| MediaRef {
                    kind: MediaKind::Photo,
                    url: Some(url.to_string()),
                    mime_type: None,
                })
                .collect(),
            forwarded_from: None,
            edited_at: None,
            is_pinned: false,
            backend: BackendKind::Api,
            collected_at: Utc::now(),
        }
    }

    fn config(workers: usize, retries: u32) -> MediaConfig {
        MediaConfig {
            workers,
            max_retries: retries,
            retry_base_ms: 2000,
            directory: None,
        }
    }

    #[test]
    fn test_file_name() {
        let tasks = MediaTask::for_record(&record(42, &["https://cdn/a/photo.JPEG?sig=1", "https://cdn/raw"]));
        assert_eq!(tasks[0].file_name(), "20240301_100000_42_0_photo.jpg");
        assert_eq!(tasks[1].file_name(), "20240301_100000_42_1_photo.jpg");

        let mut no_url = record(1, &[]);
        no_url.media.push(MediaRef {
            kind: MediaKind::Video,
            url: None,
            mime_type: None,
        });
        assert!(MediaTask::for_record(&no_url).is_empty());
    }

    #[tokio::test]
    async fn test_downloads_dedupes_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = MediaPool::start(
            &config(2, 3),
            dir.path().to_path_buf(),
            fetcher(&[("u1", b"same"), ("u2", b"same"), ("u3", b"other")], &[]),
        );

        assert_eq!(pool.enqueue_record(&record(1, &["u1"])), 1);
        let first = pool.finish().await;
        assert_eq!(first.downloaded, 1);

        let pool = MediaPool::start(
            &config(2, 3),
            dir.path().to_path_buf(),
            fetcher(&[("u1", b"same"), ("u2", b"same"), ("u3", b"other")], &[]),
        );
        pool.enqueue_record(&record(1, &["u1"]));
        pool.enqueue_record(&record(2, &["u3"]));
        let stats = pool.finish().await;
        assert_eq!(stats.skipped_existing, 1);
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.pending, 0);

        let pool = MediaPool::start(
            &config(1, 3),
            dir.path().join("fresh"),
            fetcher(&[("u1", b"same"), ("u2", b"same")], &[]),
        );
        pool.enqueue_record(&record(5, &["u1", "u2"]));
        let stats = pool.finish().await;
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.duplicates, 1);

        let written = std::fs::read(
            dir.path()
                .join("news")
                .join("20240301_100000_1_0_photo.jpg"),
        )
        .unwrap();
        assert_eq!(written, b"same");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pool = MediaPool::start(
            &config(2, 3),
            dir.path().to_path_buf(),
            fetcher(&[("flaky", b"x")], &[("flaky", 2)]),
        );
        pool.enqueue_record(&record(1, &["flaky"]));
        pool.enqueue_record(&record(2, &["missing"]));

        let stats = pool.finish().await;
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_finish_with_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let pool = MediaPool::start(&config(1, 1), dir.path().to_path_buf(), fetcher(&[], &[]));
        assert_eq!(pool.stats(), MediaStats::default());
        let stats = pool.finish().await;
        assert_eq!(stats, MediaStats::default());
    }
}
