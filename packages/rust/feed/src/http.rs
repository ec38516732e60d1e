//! HTTP feed source for the live publisher and the historical archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use gtfs_etl_shared::{BundleFile, DATE_PATH_FORMAT, FeedConfig, FileBundle, GtfsEtlError, Result};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::FeedSource;

/// User-Agent string for feed requests.
const USER_AGENT: &str = concat!("gtfs-etl/", env!("CARGO_PKG_VERSION"));

/// Bounded attempts with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): base doubling per
    /// attempt, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Downloads bundles over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    client: Client,
    live_base_url: String,
    archive_base_url: String,
    live_retry: RetryPolicy,
    archive_retry: RetryPolicy,
}

impl HttpFeedSource {
    pub fn new(
        live_base_url: &str,
        archive_base_url: &str,
        timeout: Duration,
        live_retry: RetryPolicy,
        archive_retry: RetryPolicy,
    ) -> Result<Self> {
        for base in [live_base_url, archive_base_url] {
            Url::parse(base)
                .map_err(|e| GtfsEtlError::config(format!("invalid feed base URL {base}: {e}")))?;
        }
        Ok(Self {
            client: build_client(timeout)?,
            live_base_url: live_base_url.trim_end_matches('/').to_string(),
            archive_base_url: archive_base_url.trim_end_matches('/').to_string(),
            live_retry,
            archive_retry,
        })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self> {
        let base_delay = Duration::from_secs(config.retry_base_delay_secs);
        let max_delay = Duration::from_secs(config.retry_max_delay_secs);
        Self::new(
            &config.live_base_url,
            &config.archive_base_url,
            Duration::from_secs(config.timeout_secs),
            RetryPolicy {
                attempts: config.live_attempts,
                base_delay,
                max_delay,
            },
            RetryPolicy {
                attempts: config.archive_attempts,
                base_delay,
                max_delay,
            },
        )
    }

    pub fn live_url(&self, member: BundleFile) -> String {
        format!("{}/{}", self.live_base_url, member.file_name())
    }

    pub fn archive_url(&self, date: NaiveDate, member: BundleFile) -> String {
        format!(
            "{}/{}/{}",
            self.archive_base_url,
            date.format(DATE_PATH_FORMAT),
            member.file_name()
        )
    }

    async fn fetch_bundle(
        &self,
        dest: &Path,
        policy: RetryPolicy,
        url_for: impl Fn(BundleFile) -> String,
    ) -> Result<FileBundle> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| GtfsEtlError::io(dest, e))?;
        let bundle = FileBundle::in_dir(dest);
        for (member, target) in bundle.files() {
            let url = url_for(member);
            download_with_retry(&self.client, &url, target, policy).await?;
        }
        Ok(bundle)
    }
}

impl FeedSource for HttpFeedSource {
    #[instrument(skip_all, fields(dest = %dest.display()))]
    async fn fetch_current(&self, dest: &Path) -> Result<FileBundle> {
        info!(base = %self.live_base_url, "downloading live snapshot");
        self.fetch_bundle(dest, self.live_retry, |m| self.live_url(m))
            .await
    }

    #[instrument(skip_all, fields(%source_date, dest = %dest.display()))]
    async fn fetch_archived(&self, source_date: NaiveDate, dest: &Path) -> Result<FileBundle> {
        info!(base = %self.archive_base_url, "downloading archived snapshot");
        self.fetch_bundle(dest, self.archive_retry, |m| self.archive_url(source_date, m))
            .await
    }
}

/// Build a reqwest client with appropriate settings.
fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| GtfsEtlError::SourceUnavailable(format!("failed to build HTTP client: {e}")))
}

async fn download_with_retry(client: &Client, url: &str, target: &Path, policy: RetryPolicy) -> Result<()> {
    let mut attempt = 1;
    loop {
        match download(client, url, target).await {
            Ok(bytes) => {
                debug!(%url, bytes, attempt, "downloaded");
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let delay = policy.delay(attempt);
                warn!(%url, attempt, delay_secs = delay.as_secs(), error = %e, "download failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stream `url` into `target` through a temp file, returning the byte count.
async fn download(client: &Client, url: &str, target: &Path) -> Result<u64> {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| GtfsEtlError::SourceUnavailable(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(GtfsEtlError::SourceUnavailable(format!("{url}: HTTP {status}")));
    }

    let temp = temp_path(target);
    let mut file = tokio::fs::File::create(&temp)
        .await
        .map_err(|e| GtfsEtlError::io(&temp, e))?;
    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| GtfsEtlError::SourceUnavailable(format!("{url}: failed to read body: {e}")))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| GtfsEtlError::io(&temp, e))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| GtfsEtlError::io(&temp, e))?;
    drop(file);

    tokio::fs::rename(&temp, target)
        .await
        .map_err(|e| GtfsEtlError::io(target, e))?;
    Ok(written)
}

fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.part"))
}
