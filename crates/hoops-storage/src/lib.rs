//! Storage listing, meta-file persistence and throttled HTTP fetch utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hoops-storage";

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error("reading {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} does not match the expected schema", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("serializing {}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("writing {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn read_bytes(path: &Path) -> Result<Vec<u8>, MetaStoreError> {
    fs::read(path).await.map_err(|source| MetaStoreError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a YAML document; a shape mismatch is reported as `Malformed`.
pub async fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, MetaStoreError> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| MetaStoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_yaml::from_str(&text).map_err(|source| MetaStoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

pub async fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<StoredFile, MetaStoreError> {
    let text = serde_yaml::to_string(value).map_err(|source| MetaStoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, text.as_bytes()).await
}

/// Write bytes through a temp file next to `path`, then rename into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<StoredFile, MetaStoreError> {
    let write_err = |source| MetaStoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(write_err)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(write_err)?;
    file.write_all(bytes).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(err));
    }

    Ok(StoredFile {
        path: path.to_path_buf(),
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable at {location}: {message}")]
    Unavailable { location: String, message: String },
}

/// Prefix/delimiter style listing of immediate child "directories".
#[async_trait]
pub trait StorageLister: Send + Sync {
    /// Human-readable root, used in logs and errors.
    fn describe(&self) -> String;

    /// Names of the immediate children below `segments`, in ascending order.
    async fn list_children(&self, segments: &[String]) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct LocalDirLister {
    root: PathBuf,
}

impl LocalDirLister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageLister for LocalDirLister {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn list_children(&self, segments: &[String]) -> Result<Vec<String>, StorageError> {
        let dir = segments.iter().fold(self.root.clone(), |acc, s| acc.join(s));
        let unavailable = |err: std::io::Error| StorageError::Unavailable {
            location: dir.display().to_string(),
            message: err.to_string(),
        };

        let mut entries = fs::read_dir(&dir).await.map_err(unavailable)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            // Follows symlinks; a dangling link is skipped like a plain file.
            match fs::metadata(entry.path()).await {
                Ok(meta) if meta.is_dir() => names.push(name),
                _ => continue,
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Connection settings for an S3 (or S3-compatible) bucket. Credentials and
/// region come from the standard `AWS_*` environment variables.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub bucket: String,
    /// Custom endpoint for S3-compatible stores; `None` talks to AWS.
    pub endpoint: Option<String>,
    pub timeout: Duration,
    pub max_retries: usize,
    /// Send unsigned requests, for public buckets.
    pub anonymous: bool,
}

impl BucketConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            anonymous: false,
        }
    }

    fn location(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Lists "folders" of a bucket with `ListObjectsV2` prefix/delimiter queries.
/// The client follows continuation tokens until the listing is exhausted.
#[derive(Debug)]
pub struct BucketPrefixLister {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: Vec<String>,
}

impl BucketPrefixLister {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: &str) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix
                .split('/')
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn s3(config: &BucketConfig, prefix: &str) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_client_options(ClientOptions::new().with_timeout(config.timeout))
            .with_retry(RetryConfig {
                max_retries: config.max_retries,
                ..Default::default()
            });
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if config.anonymous {
            builder = builder.with_skip_signature(true);
        }
        let store = builder.build().map_err(|err| StorageError::Unavailable {
            location: config.location(),
            message: err.to_string(),
        })?;
        Ok(Self::new(Arc::new(store), config.bucket.clone(), prefix))
    }
}

#[async_trait]
impl StorageLister for BucketPrefixLister {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix.join("/"))
    }

    async fn list_children(&self, segments: &[String]) -> Result<Vec<String>, StorageError> {
        let parts: Vec<&str> = self.prefix.iter().chain(segments).map(String::as_str).collect();
        let location = format!("s3://{}/{}", self.bucket, parts.join("/"));
        let path = ObjectPath::from_iter(parts.iter().copied());

        let listing = self
            .store
            .list_with_delimiter((!parts.is_empty()).then_some(&path))
            .await
            .map_err(|err| StorageError::Unavailable {
                location: location.clone(),
                message: err.to_string(),
            })?;

        let mut names: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|child| child.filename())
            .map(str::to_string)
            .collect();
        debug!(location = %location, children = names.len(), "listed bucket prefix");
        names.sort();
        names.dedup();
        Ok(names)
    }
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
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
    pub default_headers: Vec<(String, String)>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            default_headers: Vec::new(),
            global_concurrency: 4,
            per_source_concurrency: 1,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// At most one request per `interval`.
    pub fn min_interval(interval: Duration) -> Self {
        Self {
            capacity: 1,
            refill_every: interval,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}


impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
