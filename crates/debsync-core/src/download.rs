//! Batch downloads.
//!
//! The pipeline hands a [`Downloader`] a batch of requests and gets back one
//! outcome per request. Each request carries an opaque payload so the caller
//! can match outcomes to its own bookkeeping regardless of completion order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::SyncConfig;
use crate::retry::{RetryAction, RetryConfig, retry_with_backoff};

/// Why a single download failed.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Writing the destination (or reading a `file://` source) failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered with a non-success status.
    #[error("server returned {0}")]
    Status(u16),

    /// The URL could not be parsed.
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    /// The URL scheme is neither http(s) nor file.
    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),
}

impl DownloadError {
    /// Whether trying again could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Status(code) => {
                *code == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || *code == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || (500..600).contains(code)
            }
            Self::Io(_) | Self::InvalidUrl(_) | Self::UnsupportedScheme(_) => false,
        }
    }
}

/// One file to fetch.
#[derive(Debug, Clone)]
pub struct DownloadRequest<T> {
    /// Source URL.
    pub url: String,
    /// Where the bytes end up. Parent directories are created as needed.
    pub destination: PathBuf,
    /// Caller payload, returned untouched in the outcome.
    pub data: T,
}

impl<T> DownloadRequest<T> {
    /// Build a request.
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>, data: T) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            data,
        }
    }
}

/// Result of one request.
#[derive(Debug)]
pub struct DownloadOutcome<T> {
    /// The request this outcome is for.
    pub request: DownloadRequest<T>,
    /// Bytes written, or why nothing usable was written.
    pub result: Result<u64, DownloadError>,
}

/// Fetches batches of files.
///
/// Implementations must return exactly one outcome per request; order is
/// unspecified. A failed request must not leave a partial file at its
/// destination.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download every request in the batch.
    async fn fetch<T: Send + 'static>(
        &self,
        requests: Vec<DownloadRequest<T>>,
    ) -> Vec<DownloadOutcome<T>>;
}

/// [`Downloader`] over HTTP(S) and local `file://` URLs.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
    concurrency: usize,
    retry: RetryConfig,
}

impl HttpDownloader {
    /// Build a downloader with its own HTTP client. A transfer that receives
    /// nothing for `read_timeout` fails with a transient error.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(
        concurrency: usize,
        retry: RetryConfig,
        read_timeout: Duration,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self::with_client(client, concurrency, retry))
    }

    /// Build a downloader around an existing client.
    pub fn with_client(client: Client, concurrency: usize, retry: RetryConfig) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
            retry,
        }
    }

    /// Concurrency, retry policy and read timeout from a sync configuration.
    ///
    /// # Errors
    ///
    /// As [`HttpDownloader::new`].
    pub fn from_config(config: &SyncConfig) -> Result<Self, DownloadError> {
        Self::new(
            config.max_concurrent_downloads,
            config.retry.clone(),
            config.download_timeout,
        )
    }

    async fn fetch_one(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match parsed.scheme() {
            "file" => {
                let source = parsed
                    .to_file_path()
                    .map_err(|()| DownloadError::InvalidUrl(url.to_string()))?;
                copy_local(&source, dest).await
            }
            "http" | "https" => {
                retry_with_backoff(
                    &self.retry,
                    |e: &DownloadError| {
                        if e.is_transient() {
                            RetryAction::Retry
                        } else {
                            RetryAction::Abort
                        }
                    },
                    || self.download_http(parsed.clone(), dest),
                )
                .await
            }
            other => Err(DownloadError::UnsupportedScheme(other.to_string())),
        }
    }

    async fn download_http(&self, url: Url, dest: &Path) -> Result<u64, DownloadError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        let partial = partial_path(dest);
        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut stream = response.bytes_stream();
            let mut written: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<_, DownloadError>(written)
        }
        .await;

        match written {
            Ok(n) => {
                tokio::fs::rename(&partial, dest).await?;
                Ok(n)
            }
            Err(e) => {
                tokio::fs::remove_file(&partial).await.ok();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch<T: Send + 'static>(
        &self,
        requests: Vec<DownloadRequest<T>>,
    ) -> Vec<DownloadOutcome<T>> {
        futures::stream::iter(requests)
            .map(|request| async move {
                let result = self.fetch_one(&request.url, &request.destination).await;
                match &result {
                    Ok(bytes) => tracing::debug!("Downloaded {} ({bytes} bytes)", request.url),
                    Err(e) => tracing::warn!("Download failed: {}: {e}", request.url),
                }
                DownloadOutcome { request, result }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

async fn copy_local(source: &Path, dest: &Path) -> Result<u64, DownloadError> {
    let partial = partial_path(dest);
    match tokio::fs::copy(source, &partial).await {
        Ok(n) => {
            tokio::fs::rename(&partial, dest).await?;
            Ok(n)
        }
        Err(e) => {
            tokio::fs::remove_file(&partial).await.ok();
            Err(e.into())
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use std::io::Write as _;

    fn downloader(max_retries: u32) -> HttpDownloader {
        HttpDownloader::new(
            4,
            RetryConfig {
                max_retries,
                base_delay_ms: 0,
                max_delay_ms: 0,
            },
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fetches_batch_over_http() {
        let mut server = Server::new_async().await;
        let _a = server
            .mock("GET", "/pool/a.deb")
            .with_status(200)
            .with_body("aaaa")
            .create_async()
            .await;
        let _b = server
            .mock("GET", "/pool/b.deb")
            .with_status(200)
            .with_body("bb")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let requests = vec![
            DownloadRequest::new(
                format!("{}/pool/a.deb", server.url()),
                dir.path().join("x/a.deb"),
                "a",
            ),
            DownloadRequest::new(
                format!("{}/pool/b.deb", server.url()),
                dir.path().join("y/b.deb"),
                "b",
            ),
        ];

        let mut outcomes = downloader(0).fetch(requests).await;
        outcomes.sort_by_key(|o| o.request.data);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &4);
        assert_eq!(outcomes[1].result.as_ref().unwrap(), &2);
        assert_eq!(std::fs::read(dir.path().join("x/a.deb")).unwrap(), b"aaaa");
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/missing")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing");
        let outcomes = downloader(3)
            .fetch(vec![DownloadRequest::new(
                format!("{}/missing", server.url()),
                &dest,
                (),
            )])
            .await;

        assert!(matches!(outcomes[0].result, Err(DownloadError::Status(404))));
        assert!(!dest.exists());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let outcomes = downloader(2)
            .fetch(vec![DownloadRequest::new(
                format!("{}/flaky", server.url()),
                dir.path().join("flaky"),
                (),
            )])
            .await;

        let err = outcomes[0].result.as_ref().unwrap_err();
        assert!(err.is_transient());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn stalled_transfer_times_out_and_is_retried() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/pool/stall.deb")
            .with_status(200)
            .with_chunked_body(|w| {
                w.write_all(b"first chunk")?;
                w.flush()?;
                std::thread::sleep(Duration::from_secs(2));
                w.write_all(b"too late")
            })
            .expect(2)
            .create_async()
            .await;

        let impatient = HttpDownloader::new(
            1,
            RetryConfig {
                max_retries: 1,
                base_delay_ms: 0,
                max_delay_ms: 0,
            },
            Duration::from_millis(200),
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("stall.deb");
        let outcomes = impatient
            .fetch(vec![DownloadRequest::new(
                format!("{}/pool/stall.deb", server.url()),
                &dest,
                (),
            )])
            .await;

        let err = outcomes[0].result.as_ref().unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn file_urls_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("mirror/Release");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, "Suite: stable\n").unwrap();

        let url = Url::from_file_path(&source).unwrap().to_string();
        let dest = dir.path().join("work/Release");
        let outcomes = downloader(0)
            .fetch(vec![DownloadRequest::new(url, &dest, ())])
            .await;

        assert!(outcomes[0].result.is_ok());
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "Suite: stable\n");
    }

    #[tokio::test]
    async fn missing_local_file_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("absent")).unwrap().to_string();
        let dest = dir.path().join("out");
        let outcomes = downloader(0)
            .fetch(vec![DownloadRequest::new(url, &dest, ())])
            .await;

        assert!(matches!(outcomes[0].result, Err(DownloadError::Io(_))));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn unsupported_scheme_is_permanent() {
        assert!(!DownloadError::UnsupportedScheme("ftp".to_string()).is_transient());
        assert!(DownloadError::Status(502).is_transient());
        assert!(!DownloadError::Status(403).is_transient());
    }
}
