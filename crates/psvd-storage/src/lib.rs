//! Filesystem artifact storage + HTTP fetch utilities for the pipeline.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use psvd_core::ItemsEnvelope;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "psvd-storage";

#[derive(Debug, Clone)]
pub struct WrittenArtifact {
    pub path: PathBuf,
    pub items: usize,
    pub byte_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub removed_files: usize,
    pub removed_dirs: usize,
    pub preserved: Vec<String>,
    pub skipped: Vec<PathBuf>,
}

/// Named outputs under a single root: audit ID lists, downloaded videos, run
/// results, weights and logs.
///
/// Numbered paths are allocated by counting directory entries, without
/// locking. Two processes writing into the same directory can be handed the
/// same number and overwrite each other; run one pipeline at a time.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Relative paths resolve under the root; absolute paths pass through.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn exists(&self, path: impl AsRef<Path>) -> bool {
        fs::try_exists(self.resolve(path)).await.unwrap_or(false)
    }

    /// Returns `<dir>/<prefix>_<n>.<ext>` where `n` is the number of visible
    /// entries already in `dir`. Hidden entries such as `.gitignore` are not
    /// counted.
    pub async fn allocate_numbered_path(
        &self,
        dir: impl AsRef<Path>,
        prefix: &str,
        extension: &str,
    ) -> anyhow::Result<PathBuf> {
        let dir = self.resolve(dir);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating directory {}", dir.display()))?;

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        let mut count = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            if !entry.file_name().to_string_lossy().starts_with('.') {
                count += 1;
            }
        }

        let ext = extension.trim_start_matches('.');
        Ok(dir.join(format!("{prefix}_{count}.{ext}")))
    }

    /// Streams `{"items":[...]}` into a temp file next to `path`, one item at a
    /// time, then renames it into place.
    pub async fn write_json_array<T: Serialize>(
        &self,
        path: impl AsRef<Path>,
        items: &[T],
    ) -> anyhow::Result<WrittenArtifact> {
        let path = self.resolve(path);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;

        let written = write_items(BufWriter::new(file), items).await;
        let byte_size = match written {
            Ok(n) => n,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| format!("writing {}", temp_path.display()));
            }
        };

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            });
        }

        Ok(WrittenArtifact {
            path,
            items: items.len(),
            byte_size,
        })
    }

    pub async fn read_json_array<T: DeserializeOwned>(
        &self,
        path: impl AsRef<Path>,
    ) -> anyhow::Result<Vec<T>> {
        let path = self.resolve(path);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let envelope: ItemsEnvelope<T> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(envelope.items)
    }

    pub async fn read_bytes(&self, path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(path);
        fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    /// One entry per line with the line terminator stripped. Blank lines are
    /// dropped.
    pub async fn read_lines(&self, path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
        let path = self.resolve(path);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(text
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Deletes every direct child of `dir` whose name is not in
    /// `ignore_names`. Child directories are removed with their contents.
    /// Permission-denied entries are skipped; any other failure aborts.
    pub async fn clean<S: AsRef<str>>(
        &self,
        dir: impl AsRef<Path>,
        ignore_names: &[S],
    ) -> anyhow::Result<CleanReport> {
        let dir = self.resolve(dir);
        let mut report = CleanReport::default();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(dir = %dir.display(), "clean target does not exist; nothing to remove");
                return Ok(report);
            }
            Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if ignore_names.iter().any(|ignored| ignored.as_ref() == name) {
                report.preserved.push(name);
                continue;
            }

            let path = entry.path();
            let is_dir = entry
                .file_type()
                .await
                .with_context(|| format!("inspecting {}", path.display()))?
                .is_dir();
            let removed = if is_dir {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };

            match removed {
                Ok(()) if is_dir => report.removed_dirs += 1,
                Ok(()) => report.removed_files += 1,
                Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                    warn!(path = %path.display(), "permission denied while cleaning; skipped");
                    report.skipped.push(path);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("removing {}", path.display()));
                }
            }
        }

        report.preserved.sort();
        Ok(report)
    }
}

async fn write_items<T: Serialize>(
    mut writer: BufWriter<fs::File>,
    items: &[T],
) -> anyhow::Result<usize> {
    let mut byte_size = 0usize;
    writer.write_all(b"{\"items\":[").await?;
    byte_size += 10;
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            writer.write_all(b",").await?;
            byte_size += 1;
        }
        let bytes = serde_json::to_vec(item).context("serializing item")?;
        writer.write_all(&bytes).await?;
        byte_size += bytes.len();
    }
    writer.write_all(b"]}").await?;
    byte_size += 2;
    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(byte_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Allows a burst of `requests` and refills one token every
    /// `60s / requests`. `None` when `requests` is zero.
    pub fn per_minute(requests: u32) -> Option<Self> {
        if requests == 0 {
            return None;
        }
        Some(Self {
            capacity: requests,
            refill_every: Duration::from_secs(60) / requests,
        })
    }
}

/// Keeps API calls inside a request quota shared by every caller of one
/// fetcher.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<QuotaState>,
}

#[derive(Debug, Clone, Copy)]
struct QuotaState {
    available: u32,
    refilled_at: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(QuotaState {
                available: config.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits until a request may be sent and consumes one token.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if !self.refill_every.is_zero() {
                    let elapsed = state.refilled_at.elapsed();
                    let earned = u32::try_from(elapsed.as_nanos() / self.refill_every.as_nanos())
                        .unwrap_or(u32::MAX);
                    if earned > 0 {
                        state.available = state.available.saturating_add(earned).min(self.capacity);
                        state.refilled_at = if state.available == self.capacity {
                            Instant::now()
                        } else {
                            // keep the partial interval so refills stay on schedule
                            state.refilled_at + self.refill_every * earned
                        };
                    }
                }

                if state.available > 0 || self.refill_every.is_zero() {
                    state.available = state.available.saturating_sub(1);
                    return;
                }
                self.refill_every
                    .saturating_sub(state.refilled_at.elapsed())
                    .max(Duration::from_millis(1))
            };
            debug!(wait_ms = wait.as_millis() as u64, "request quota exhausted; waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {endpoint} failed after retries: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
    #[error("decoding response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Sequential HTTP client with retry/backoff. Query parameters are passed
/// separately so credentials never end up in span fields or error text.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|quota| Arc::new(SimpleTokenBucket::new(quota)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        endpoint: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<u8>, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", endpoint);
        self.fetch_with_retries(endpoint, url, query)
            .instrument(span)
            .await
    }

    pub async fn fetch_json(
        &self,
        endpoint: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let body = self.fetch_bytes(endpoint, url, query).await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    async fn fetch_with_retries(
        &self,
        endpoint: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .bytes()
                            .await
                            .map(|b| b.to_vec())
                            .map_err(|source| FetchError::Request {
                                endpoint: endpoint.to_string(),
                                source,
                            });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        endpoint: endpoint.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        endpoint: endpoint.to_string(),
                        source: err.without_url(),
                    });
                }
            }
        }
    }
}
