//! Cache-aware downloader for dated reference files
//!
//! Fetches a remote file, works out which date the upstream copy belongs to,
//! and only writes it when nothing equally fresh is already cached. Timeouts
//! are retried with exponential backoff; every other failure is final.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_DISPOSITION, LAST_MODIFIED};
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::manager::{date_prefix, extension_of, DatedCache, PARTIAL_SUFFIX};

/// Connect timeout for reference file downloads
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of attempts for a download
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Backoff before the second attempt; doubles for each further attempt
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Longest wait between two attempts
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// User agent sent to the AEMPS servers
pub const USER_AGENT: &str = concat!("cima-proxy/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur when downloading a dated file
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connect or read timeout; the only retryable failure
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Upstream answered with a non-success status
    #[error("Upstream returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// Any other transport failure
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether a retry could succeed
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Status {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            FetchError::Request(e.to_string())
        }
    }
}

/// Response headers that decide the cached filename
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteHeaders {
    /// Raw `Content-Disposition` value
    pub content_disposition: Option<String>,
    /// Raw `Last-Modified` value
    pub last_modified: Option<String>,
}

impl RemoteHeaders {
    /// Reads the relevant headers from a response
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            content_disposition: text(CONTENT_DISPOSITION),
            last_modified: text(LAST_MODIFIED),
        }
    }

    /// True when neither header is present
    pub fn is_empty(&self) -> bool {
        self.content_disposition.is_none() && self.last_modified.is_none()
    }

    /// Fills missing headers from `other`
    pub fn or(self, other: &RemoteHeaders) -> RemoteHeaders {
        RemoteHeaders {
            content_disposition: self
                .content_disposition
                .or_else(|| other.content_disposition.clone()),
            last_modified: self.last_modified.or_else(|| other.last_modified.clone()),
        }
    }
}

/// An opened download: headers plus the body as a chunk stream
pub struct RemoteBody {
    pub headers: RemoteHeaders,
    pub chunks: BoxStream<'static, Result<Bytes, FetchError>>,
}

/// Network access used by the downloader
#[async_trait]
pub trait Transport: Send + Sync {
    /// Header-only request. Failures are tolerated by the caller.
    async fn probe(&self, url: &str) -> Result<RemoteHeaders, FetchError>;

    /// Streaming GET. Non-success statuses must be reported as errors.
    async fn open(&self, url: &str) -> Result<RemoteBody, FetchError>;
}

/// reqwest-backed transport with distinct connect and read timeouts
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport whose reads time out after `read_timeout`
    pub fn new(read_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(read_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &str) -> Result<RemoteHeaders, FetchError> {
        let response = self.client.head(url).send().await?.error_for_status()?;
        Ok(RemoteHeaders::from_header_map(response.headers()))
    }

    async fn open(&self, url: &str) -> Result<RemoteBody, FetchError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let headers = RemoteHeaders::from_header_map(response.headers());
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();
        Ok(RemoteBody { headers, chunks })
    }
}

/// A remote dataset and where its dated copies live
#[derive(Debug, Clone)]
pub struct DatedFile {
    /// Remote location
    pub url: String,
    /// Directory holding the dated copies
    pub dest_dir: PathBuf,
    /// Name used when the URL path gives nothing usable; its extension
    /// identifies the dataset inside `dest_dir`
    pub fallback_name: String,
}

impl DatedFile {
    pub fn new(url: impl Into<String>, dest_dir: impl Into<PathBuf>, fallback_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dest_dir: dest_dir.into(),
            fallback_name: fallback_name.into(),
        }
    }

    /// Extension shared by every copy of this dataset
    pub fn extension(&self) -> &str {
        extension_of(&self.fallback_name).unwrap_or("")
    }

    fn cache(&self) -> DatedCache {
        DatedCache::with_dir(&self.dest_dir)
    }
}

/// Downloads dated files, keeping one current copy per dataset
pub struct DatedDownloader<T = HttpTransport> {
    transport: T,
    max_retries: u32,
    backoff: Duration,
}

impl DatedDownloader<HttpTransport> {
    /// Creates a downloader over HTTP with the given read timeout
    pub fn http(read_timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self::new(HttpTransport::new(read_timeout)?))
    }
}

impl<T: Transport> DatedDownloader<T> {
    /// Creates a downloader with default retry settings
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Sets the maximum number of attempts (at least one is always made)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay before the second attempt
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fetches `file` unless an equally fresh copy is already cached
    ///
    /// # Returns
    /// * `Ok(path)` - the newly written file, or the existing copy that made
    ///   the download unnecessary
    /// * `Err(FetchError)` - a non-timeout failure, or the last timeout once
    ///   all attempts are used
    ///
    /// # Behavior
    /// - A HEAD probe runs first; its failure is ignored. When it yields a
    ///   filename hint, the freshness check runs before any body transfer.
    /// - The new file is written under a `.part` name and renamed into place
    ///   before older copies are evicted, so the directory always holds a
    ///   complete current file.
    pub async fn fetch(&self, file: &DatedFile) -> Result<PathBuf, FetchError> {
        let cache = file.cache();
        cache.ensure_dir()?;

        let probed = match self.transport.probe(&file.url).await {
            Ok(headers) => headers,
            Err(e) => {
                debug!(url = %file.url, error = %e, "header probe failed, falling back to full download");
                RemoteHeaders::default()
            }
        };

        if !probed.is_empty() {
            let name = resolve_file_name(file, &probed, Utc::now());
            if let Some(existing) = fresh_copy(&cache, file.extension(), &name)? {
                info!(path = %existing.display(), "cached copy is up to date, skipping download");
                return Ok(existing);
            }
        }

        let max_attempts = self.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.download_once(file, &cache, &probed).await {
                Ok(path) => return Ok(path),
                Err(e) if e.is_timeout() && attempt < max_attempts => {
                    let delay = backoff_delay(self.backoff, attempt);
                    warn!(
                        url = %file.url,
                        attempt,
                        max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "download timed out, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One GET, freshness check, write and eviction
    async fn download_once(
        &self,
        file: &DatedFile,
        cache: &DatedCache,
        probed: &RemoteHeaders,
    ) -> Result<PathBuf, FetchError> {
        let body = self.transport.open(&file.url).await?;
        let headers = probed.clone().or(&body.headers);
        let name = resolve_file_name(file, &headers, Utc::now());

        if let Some(existing) = fresh_copy(cache, file.extension(), &name)? {
            info!(path = %existing.display(), "cached copy is up to date, discarding download");
            return Ok(existing);
        }

        let target = cache.path_for(&name);
        let partial = cache.path_for(&format!("{name}{PARTIAL_SUFFIX}"));
        if let Err(e) = write_stream(&partial, body.chunks).await {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                debug!(path = %partial.display(), error = %cleanup, "could not remove partial download");
            }
            return Err(e);
        }
        tokio::fs::rename(&partial, &target).await?;

        if let Some(date) = date_prefix(&name) {
            cache.evict_older_than(file.extension(), date)?;
        }

        info!(path = %target.display(), "downloaded new copy");
        Ok(target)
    }
}

/// Returns an existing copy at least as fresh as `name`, if any
fn fresh_copy(cache: &DatedCache, extension: &str, name: &str) -> Result<Option<PathBuf>, FetchError> {
    let Some(date) = date_prefix(name) else {
        return Ok(None);
    };
    Ok(cache.fresh_as_of(extension, date)?.map(|file| file.path))
}

async fn write_stream(
    path: &Path,
    mut chunks: BoxStream<'static, Result<Bytes, FetchError>>,
) -> Result<(), FetchError> {
    let mut out = tokio::fs::File::create(path).await?;
    while let Some(chunk) = chunks.next().await {
        out.write_all(&chunk?).await?;
    }
    out.flush().await?;
    Ok(())
}

/// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at [`MAX_BACKOFF`]
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32
        .checked_pow(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Works out the dated filename for a download
///
/// Prefers the `Content-Disposition` filename, dating it when it carries no
/// `YYYYMMDD` prefix. Otherwise builds `{YYYYMMDD}_{basename}` from the URL
/// path (or the fallback name). The date comes from `Last-Modified`, or `now`
/// when the header is absent or unparseable.
pub fn resolve_file_name(file: &DatedFile, headers: &RemoteHeaders, now: DateTime<Utc>) -> String {
    let extension = file.extension();
    let version = headers
        .last_modified
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc2822(raw.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);
    let date = version.format("%Y%m%d").to_string();

    if let Some(name) = headers
        .content_disposition
        .as_deref()
        .and_then(disposition_file_name)
    {
        let name = with_extension(name, extension);
        return if date_prefix(&name).is_some() {
            name
        } else {
            format!("{date}_{name}")
        };
    }

    let base = url_basename(&file.url)
        .filter(|base| extension_of(base).is_some_and(|ext| ext.eq_ignore_ascii_case(extension)))
        .unwrap_or_else(|| file.fallback_name.clone());
    format!("{date}_{base}")
}

/// Extracts the `filename=` value of a `Content-Disposition` header
///
/// Directory components are stripped so the result is always a bare name.
pub fn disposition_file_name(header: &str) -> Option<String> {
    let start = header.to_ascii_lowercase().find("filename=")? + "filename=".len();
    let rest = header[start..].trim_start();
    let value = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next().unwrap_or(""),
        None => rest.split(';').next().unwrap_or(""),
    };
    let value = value.trim().replace('\\', "/");
    let name = value.rsplit('/').next().unwrap_or("").trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

fn url_basename(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?;
    if last.is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}

fn with_extension(name: String, extension: &str) -> String {
    if extension.is_empty()
        || extension_of(&name).is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
    {
        name
    } else {
        format!("{name}.{extension}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::stream;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::time::Instant;

    const URL: &str = "https://example.test/export/nomenclator.do?metodo=x";

    /// Scripted transport: fails the first `timeouts` opens, records timing
    struct StubTransport {
        probe: Option<RemoteHeaders>,
        headers: RemoteHeaders,
        body: &'static str,
        timeouts: Mutex<u32>,
        broken_bodies: Mutex<u32>,
        fatal_status: Option<u16>,
        opens: Mutex<Vec<Instant>>,
    }

    impl StubTransport {
        fn serving(content_disposition: &str) -> Self {
            let headers = RemoteHeaders {
                content_disposition: Some(content_disposition.to_string()),
                last_modified: None,
            };
            Self {
                probe: Some(headers.clone()),
                headers,
                body: "a;b\n1;2\n",
                timeouts: Mutex::new(0),
                broken_bodies: Mutex::new(0),
                fatal_status: None,
                opens: Mutex::new(Vec::new()),
            }
        }

        fn without_probe(mut self) -> Self {
            self.probe = None;
            self
        }

        fn timing_out(self, times: u32) -> Self {
            *self.timeouts.lock().unwrap() = times;
            self
        }

        fn open_count(&self) -> usize {
            self.opens.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn probe(&self, _url: &str) -> Result<RemoteHeaders, FetchError> {
            self.probe
                .clone()
                .ok_or_else(|| FetchError::Status { status: 405, url: URL.to_string() })
        }

        async fn open(&self, url: &str) -> Result<RemoteBody, FetchError> {
            self.opens.lock().unwrap().push(Instant::now());
            if let Some(status) = self.fatal_status {
                return Err(FetchError::Status { status, url: url.to_string() });
            }
            {
                let mut remaining = self.timeouts.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Timeout("read timed out".to_string()));
                }
            }
            let broken = {
                let mut remaining = self.broken_bodies.lock().unwrap();
                let broken = *remaining > 0;
                if broken {
                    *remaining -= 1;
                }
                broken
            };
            let chunks: Vec<Result<Bytes, FetchError>> = if broken {
                vec![
                    Ok(Bytes::from_static(b"a;b\n")),
                    Err(FetchError::Timeout("body stalled".to_string())),
                ]
            } else {
                vec![Ok(Bytes::from_static(self.body.as_bytes()))]
            };
            Ok(RemoteBody {
                headers: self.headers.clone(),
                chunks: stream::iter(chunks).boxed(),
            })
        }
    }

    fn dataset(dir: &TempDir) -> DatedFile {
        DatedFile::new(URL, dir.path(), "nomenclator.csv")
    }

    fn csv_files(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .expect("Should read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".csv"))
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_fetch_writes_new_file() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let downloader = DatedDownloader::new(StubTransport::serving("attachment; filename=\"20240101_data.csv\""));

        let path = downloader.fetch(&dataset(&dir)).await.expect("Should download");

        assert_eq!(path, dir.path().join("20240101_data.csv"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "a;b\n1;2\n");
        assert_eq!(csv_files(&dir), vec!["20240101_data.csv"]);
    }

    #[tokio::test]
    async fn test_second_fetch_is_idempotent_and_skips_body() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let downloader = DatedDownloader::new(StubTransport::serving("attachment; filename=20240101_data.csv"));
        let file = dataset(&dir);

        let first = downloader.fetch(&file).await.expect("First fetch");
        let second = downloader.fetch(&file).await.expect("Second fetch");

        assert_eq!(first, second);
        assert_eq!(csv_files(&dir), vec!["20240101_data.csv"]);
        // Only the first call transferred a body
        assert_eq!(downloader.transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_without_probe() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let downloader = DatedDownloader::new(
            StubTransport::serving("attachment; filename=20240101_data.csv").without_probe(),
        );
        let file = dataset(&dir);

        let first = downloader.fetch(&file).await.expect("First fetch");
        let second = downloader.fetch(&file).await.expect("Second fetch");

        assert_eq!(first, second);
        assert_eq!(csv_files(&dir), vec!["20240101_data.csv"]);
    }

    #[tokio::test]
    async fn test_newer_download_evicts_older_copy() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let old = dir.path().join("20231201_data.csv");
        fs::write(&old, "old").unwrap();
        let downloader = DatedDownloader::new(StubTransport::serving("attachment; filename=20240101_data.csv"));

        let path = downloader.fetch(&dataset(&dir)).await.expect("Should download");

        assert!(path.exists());
        assert!(!old.exists());
        assert_eq!(csv_files(&dir), vec!["20240101_data.csv"]);
    }

    #[tokio::test]
    async fn test_older_upstream_is_skipped() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let existing = dir.path().join("20240101_data.csv");
        fs::write(&existing, "current").unwrap();
        let downloader = DatedDownloader::new(StubTransport::serving("attachment; filename=20231201_data.csv"));

        let path = downloader.fetch(&dataset(&dir)).await.expect("Should succeed");

        assert_eq!(path, existing);
        assert_eq!(fs::read_to_string(&existing).unwrap(), "current");
        assert_eq!(csv_files(&dir), vec!["20240101_data.csv"]);
        assert_eq!(downloader.transport.open_count(), 0);
    }

    #[tokio::test]
    async fn test_other_datasets_are_untouched() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let spreadsheet = dir.path().join("20200101_Presentaciones.xls");
        fs::write(&spreadsheet, "xls").unwrap();
        let downloader = DatedDownloader::new(StubTransport::serving("attachment; filename=20240101_data.csv"));

        downloader.fetch(&dataset(&dir)).await.expect("Should download");

        assert!(spreadsheet.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_timeouts_with_exponential_backoff() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let transport = StubTransport::serving("attachment; filename=20240101_data.csv")
            .without_probe()
            .timing_out(2);
        let downloader = DatedDownloader::new(transport).with_max_retries(3);

        let path = downloader.fetch(&dataset(&dir)).await.expect("Third attempt should succeed");

        assert!(path.exists());
        let opens = downloader.transport.opens.lock().unwrap().clone();
        assert_eq!(opens.len(), 3);
        let first_gap = opens[1] - opens[0];
        let second_gap = opens[2] - opens[1];
        assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1100));
        assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_timeout() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let transport = StubTransport::serving("attachment; filename=20240101_data.csv")
            .without_probe()
            .timing_out(5);
        let downloader = DatedDownloader::new(transport).with_max_retries(3);

        let err = downloader.fetch(&dataset(&dir)).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(downloader.transport.open_count(), 3);
        assert!(csv_files(&dir).is_empty());
    }

    #[test]
    fn test_backoff_delay_doubles_then_caps() {
        assert_eq!(backoff_delay(Duration::from_secs(1), 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(Duration::from_secs(1), 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(Duration::from_secs(1), 40), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::from_secs(1), u32::MAX), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_retries_do_not_overflow_backoff() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let transport = StubTransport::serving("attachment; filename=20240101_data.csv")
            .without_probe()
            .timing_out(100);
        let downloader = DatedDownloader::new(transport).with_max_retries(40);

        let err = downloader.fetch(&dataset(&dir)).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(downloader.transport.open_count(), 40);
    }

    #[tokio::test]
    async fn test_fetch_creates_missing_directory() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let nested = dir.path().join("data").join("documentacion");
        let file = DatedFile::new(URL, &nested, "nomenclator.csv");
        let downloader = DatedDownloader::new(StubTransport::serving(
            "attachment; filename=20240101_data.csv",
        ));

        let path = downloader.fetch(&file).await.expect("Should download");

        assert!(nested.is_dir());
        assert!(path.starts_with(&nested));
    }

    #[tokio::test]
    async fn test_http_error_is_not_retried() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let mut transport = StubTransport::serving("attachment; filename=20240101_data.csv").without_probe();
        transport.fatal_status = Some(503);
        let downloader = DatedDownloader::new(transport);

        let err = downloader.fetch(&dataset(&dir)).await.unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 503, .. }));
        assert_eq!(downloader.transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_is_cleaned_up_and_retried() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let transport = StubTransport::serving("attachment; filename=20240101_data.csv").without_probe();
        *transport.broken_bodies.lock().unwrap() = 1;
        let downloader = DatedDownloader::new(transport);

        let path = downloader.fetch(&dataset(&dir)).await.expect("Retry should succeed");

        assert_eq!(fs::read_to_string(&path).unwrap(), "a;b\n1;2\n");
        assert!(!dir.path().join("20240101_data.csv.part").exists());
        assert_eq!(downloader.transport.open_count(), 2);
    }

    #[test]
    fn test_disposition_file_name_variants() {
        assert_eq!(
            disposition_file_name("attachment; filename=\"20240101_a.csv\""),
            Some("20240101_a.csv".to_string())
        );
        assert_eq!(
            disposition_file_name("attachment; FILENAME=b.csv; size=10"),
            Some("b.csv".to_string())
        );
        assert_eq!(
            disposition_file_name("attachment; filename=\"../../etc/c.csv\""),
            Some("c.csv".to_string())
        );
        assert_eq!(disposition_file_name("inline"), None);
        assert_eq!(disposition_file_name("attachment; filename=\"\""), None);
    }

    #[test]
    fn test_resolve_prefers_disposition() {
        let dir = TempDir::new().unwrap();
        let headers = RemoteHeaders {
            content_disposition: Some("attachment; filename=20240315_nomen.csv".to_string()),
            last_modified: Some("Tue, 01 Jun 2021 08:00:00 GMT".to_string()),
        };
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(resolve_file_name(&dataset(&dir), &headers, now), "20240315_nomen.csv");
    }

    #[test]
    fn test_resolve_dates_undated_disposition() {
        let dir = TempDir::new().unwrap();
        let headers = RemoteHeaders {
            content_disposition: Some("attachment; filename=nomen.csv".to_string()),
            last_modified: Some("Tue, 01 Jun 2021 08:00:00 GMT".to_string()),
        };
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(resolve_file_name(&dataset(&dir), &headers, now), "20210601_nomen.csv");
    }

    #[test]
    fn test_resolve_falls_back_to_name_and_now() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 2, 3, 12, 0, 0).unwrap();
        // URL basename "nomenclator.do" lacks the dataset extension
        assert_eq!(
            resolve_file_name(&dataset(&dir), &RemoteHeaders::default(), now),
            "20250203_nomenclator.csv"
        );
    }

    #[test]
    fn test_resolve_uses_url_basename_with_matching_extension() {
        let dir = TempDir::new().unwrap();
        let file = DatedFile::new(
            "https://listadomedicamentos.aemps.gob.es/Presentaciones.xls",
            dir.path(),
            "presentaciones.xls",
        );
        let headers = RemoteHeaders {
            content_disposition: None,
            last_modified: Some("Mon, 04 Mar 2024 10:00:00 GMT".to_string()),
        };
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(resolve_file_name(&file, &headers, now), "20240304_Presentaciones.xls");
    }

    #[test]
    fn test_resolve_ignores_garbage_last_modified() {
        let dir = TempDir::new().unwrap();
        let headers = RemoteHeaders {
            content_disposition: None,
            last_modified: Some("yesterday-ish".to_string()),
        };
        let now = Utc.with_ymd_and_hms(2025, 2, 3, 12, 0, 0).unwrap();
        assert_eq!(
            resolve_file_name(&dataset(&dir), &headers, now),
            "20250203_nomenclator.csv"
        );
    }

    #[test]
    fn test_headers_or_prefers_self() {
        let probe = RemoteHeaders {
            content_disposition: None,
            last_modified: Some("a".to_string()),
        };
        let get = RemoteHeaders {
            content_disposition: Some("b".to_string()),
            last_modified: Some("c".to_string()),
        };
        let merged = probe.or(&get);
        assert_eq!(merged.content_disposition.as_deref(), Some("b"));
        assert_eq!(merged.last_modified.as_deref(), Some("a"));
    }
}
