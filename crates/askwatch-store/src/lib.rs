//! Durable notification-state persistence for askwatch.
//!
//! One JSON document lives behind a pluggable blob backend: an HTTP remote
//! store for shared deployments, a local file for single-host runs and as
//! the degraded tier when the remote is unreachable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use askwatch_core::{StateDocument, STATE_SCHEMA_VERSION};

pub const CRATE_NAME: &str = "askwatch-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding state document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Raw blob access for the one state document. The key or path is fixed at
/// construction; callers only ever see whole-document reads and writes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetches the document bytes. `Ok(None)` means never written.
    async fn get(&self) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put(&self, bytes: &[u8]) -> Result<(), StoreError>;
    /// Human-readable location for logs and receipts.
    fn location(&self) -> String;
}

pub fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
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
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Blob store backed by a single local file. Writes go through a
/// uuid-suffixed temp file in the same directory followed by a rename, so
/// an interrupted run never leaves a partial document behind.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self, byte_len: usize) -> PathBuf {
        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), byte_len);
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(temp_name),
            _ => PathBuf::from(temp_name),
        }
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn get(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io {
                path: self.path.clone(),
                source: err,
            }),
        }
    }

    async fn put(&self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|err| StoreError::Io {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
            }
        }

        let temp_path = self.temp_path(bytes.len());
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StoreError::Io {
                path: temp_path.clone(),
                source: err,
            })?;
        if let Err(err) = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await
        {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: temp_path,
                source: err,
            });
        }
        drop(file);

        // rename replaces any previous document in one step
        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: self.path.clone(),
                source: err,
            });
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub url: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl RemoteStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Blob store backed by a remote HTTP endpoint: GET and PUT of one URL,
/// with bounded retries on throttling, server errors and timeouts. A 404
/// on GET maps to an absent document.
#[derive(Debug)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpBlobStore {
    pub fn new(config: RemoteStoreConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            url: config.url,
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, &self.url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        request
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let span = info_span!("state_get", url = %self.url);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                match self.request(reqwest::Method::GET).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status == StatusCode::NOT_FOUND {
                            return Ok(None);
                        }
                        if status.is_success() {
                            return Ok(Some(resp.bytes().await?.to_vec()));
                        }
                        if retryable_status(status) && attempt < self.backoff.max_retries {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StoreError::HttpStatus {
                            status: status.as_u16(),
                            url: self.url.clone(),
                        });
                    }
                    Err(err) => {
                        if retryable_error(&err) && attempt < self.backoff.max_retries {
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StoreError::Request(err));
                    }
                }
            }

            Err(StoreError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }

    async fn put(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let span = info_span!("state_put", url = %self.url, bytes = bytes.len());
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                let sent = self
                    .request(reqwest::Method::PUT)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(bytes.to_vec())
                    .send()
                    .await;

                match sent {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(());
                        }
                        if retryable_status(status) && attempt < self.backoff.max_retries {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StoreError::HttpStatus {
                            status: status.as_u16(),
                            url: self.url.clone(),
                        });
                    }
                    Err(err) => {
                        if retryable_error(&err) && attempt < self.backoff.max_retries {
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StoreError::Request(err));
                    }
                }
            }

            Err(StoreError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }

    fn location(&self) -> String {
        self.url.clone()
    }
}

/// Outcome of a successful save: where the document landed and, when the
/// primary had to be bypassed, the error that forced the fallback.
#[derive(Debug, Clone)]
pub struct SaveReceipt {
    pub location: String,
    pub degraded: Option<String>,
}

/// Document-level store wrapping a primary blob backend plus an optional
/// local fallback tier used when the primary is unreachable.
pub struct StateStore {
    primary: Box<dyn BlobStore>,
    fallback: Option<FileBlobStore>,
}

impl StateStore {
    pub fn new(primary: Box<dyn BlobStore>, fallback: Option<FileBlobStore>) -> Self {
        Self { primary, fallback }
    }

    /// Store over a single local file, no fallback tier.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            primary: Box::new(FileBlobStore::new(path)),
            fallback: None,
        }
    }

    pub fn location(&self) -> String {
        self.primary.location()
    }

    /// Loads the current document. An absent key, undecodable bytes, or an
    /// unknown schema version all come back as an empty document with a
    /// warning; only an unreachable primary with no usable fallback copy is
    /// an error.
    pub async fn load(&self) -> Result<StateDocument, StoreError> {
        match self.primary.get().await {
            Ok(found) => Ok(decode_document(found, &self.primary.location())),
            Err(err) => {
                let Some(fallback) = &self.fallback else {
                    return Err(err);
                };
                warn!(
                    primary = %self.primary.location(),
                    error = %err,
                    "primary state store unreachable, reading local fallback"
                );
                let found = fallback.get().await?;
                Ok(decode_document(found, &fallback.location()))
            }
        }
    }

    /// Persists the document as a full overwrite, stamping the schema
    /// version and write time. Degrades to a best-effort local write when
    /// the primary rejects it; the receipt records the degradation.
    pub async fn save(&self, document: &StateDocument) -> Result<SaveReceipt, StoreError> {
        let mut stamped = document.clone();
        stamped.schema_version = STATE_SCHEMA_VERSION;
        stamped.updated_at = Utc::now();

        let mut bytes = serde_json::to_vec_pretty(&stamped)?;
        bytes.push(b'\n');

        match self.primary.put(&bytes).await {
            Ok(()) => Ok(SaveReceipt {
                location: self.primary.location(),
                degraded: None,
            }),
            Err(err) => {
                let Some(fallback) = &self.fallback else {
                    return Err(err);
                };
                warn!(
                    primary = %self.primary.location(),
                    fallback = %fallback.location(),
                    error = %err,
                    "primary state store rejected write, keeping local fallback copy"
                );
                fallback.put(&bytes).await?;
                Ok(SaveReceipt {
                    location: fallback.location(),
                    degraded: Some(err.to_string()),
                })
            }
        }
    }
}

fn decode_document(found: Option<Vec<u8>>, origin: &str) -> StateDocument {
    let now = Utc::now();
    let Some(bytes) = found else {
        info!(origin, "no existing state document, starting fresh");
        return StateDocument::empty(now);
    };

    match serde_json::from_slice::<StateDocument>(&bytes) {
        Ok(doc) if doc.schema_version == STATE_SCHEMA_VERSION => doc,
        Ok(doc) => {
            warn!(
                origin,
                found_version = doc.schema_version,
                expected_version = STATE_SCHEMA_VERSION,
                "state document has unknown schema version, starting fresh"
            );
            StateDocument::empty(now)
        }
        Err(err) => {
            warn!(origin, error = %err, "state document undecodable, starting fresh");
            StateDocument::empty(now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askwatch_core::{NotificationRecord, Price};
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn record(minor: i64, stamp: &str) -> NotificationRecord {
        NotificationRecord {
            last_ask: Price::from_minor(minor),
            last_notified_at: Some(ts(stamp)),
            last_seen_at: ts(stamp),
        }
    }

    struct DownStore;

    #[async_trait]
    impl BlobStore for DownStore {
        async fn get(&self) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::HttpStatus {
                status: 503,
                url: "https://state.example/doc".into(),
            })
        }

        async fn put(&self, _bytes: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::HttpStatus {
                status: 503,
                url: "https://state.example/doc".into(),
            })
        }

        fn location(&self) -> String {
            "https://state.example/doc".into()
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_records() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::local(dir.path().join("state.json"));

        let mut doc = StateDocument::empty(Utc::now());
        doc.records
            .insert("SKU123".into(), record(9000, "2025-11-23T08:10:00Z"));

        store.save(&doc).await.expect("save");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.records, doc.records);
        assert_eq!(loaded.schema_version, STATE_SCHEMA_VERSION);

        // saving what was just loaded must leave records untouched
        store.save(&loaded).await.expect("second save");
        let again = store.load().await.expect("second load");
        assert_eq!(again.records, doc.records);
    }

    #[tokio::test]
    async fn missing_state_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::local(dir.path().join("never").join("state.json"));

        let doc = store.load().await.expect("load");
        assert!(doc.records.is_empty());
        assert_eq!(doc.schema_version, STATE_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn corrupt_state_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{this is not json").expect("write");

        let store = StateStore::local(&path);
        let doc = store.load().await.expect("load");
        assert!(doc.records.is_empty());
    }

    #[tokio::test]
    async fn unknown_schema_version_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let body = r#"{
  "schema_version": 99,
  "updated_at": "2025-11-23T08:10:00Z",
  "records": {
    "SKU123": {
      "last_ask": 90.0,
      "last_notified_at": null,
      "last_seen_at": "2025-11-23T08:10:00Z"
    }
  }
}"#;
        std::fs::write(&path, body).expect("write");

        let store = StateStore::local(&path);
        let doc = store.load().await.expect("load");
        assert!(doc.records.is_empty());
    }

    #[tokio::test]
    async fn save_creates_parent_directories_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data").join("state.json");
        let store = StateStore::local(&path);

        store
            .save(&StateDocument::empty(Utc::now()))
            .await
            .expect("save");
        assert!(path.exists());

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn remote_failure_degrades_to_local_fallback() {
        let dir = tempdir().expect("tempdir");
        let fallback = FileBlobStore::new(dir.path().join("state.json"));
        let store = StateStore::new(Box::new(DownStore), Some(fallback.clone()));

        let mut doc = StateDocument::empty(Utc::now());
        doc.records
            .insert("A1".into(), record(10000, "2025-11-23T08:10:00Z"));

        let receipt = store.save(&doc).await.expect("degraded save");
        assert_eq!(receipt.location, fallback.location());
        assert!(receipt.degraded.is_some());

        // reads fall back to the same local copy
        let loaded = store.load().await.expect("degraded load");
        assert_eq!(loaded.records, doc.records);
    }

    #[tokio::test]
    async fn remote_failure_without_fallback_is_an_error() {
        let store = StateStore::new(Box::new(DownStore), None);
        assert!(store.load().await.is_err());
        let doc = StateDocument::empty(Utc::now());
        assert!(store.save(&doc).await.is_err());
    }

    #[test]
    fn backoff_delays_are_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_cover_throttling_and_server_errors() {
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!retryable_status(StatusCode::FORBIDDEN));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
    }
}
