//! Document-store contract, filesystem + in-memory stores, and retry/backoff utilities.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oppmatch_core::{Clock, SystemClock};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppmatch-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub meta: ObjectMeta,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object s3://{bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Missing objects and bad keys will not heal on retry; I/O faults may.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Unavailable(_))
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// The document-store collaborator: get, put, list by prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, StorageError>;

    /// Create or overwrite.
    async fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<ObjectMeta, StorageError>;

    /// Create only when no object exists at `key`. Returns whether it was created.
    async fn put_if_absent(&self, bucket: &str, key: &str, body: &[u8]) -> Result<bool, StorageError>;

    /// All objects under `prefix`, sorted by key.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError>;

    /// Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;
}

/// Move by put-then-delete. A crash in between leaves both copies, never none.
pub async fn move_object(
    store: &dyn ObjectStore,
    bucket: &str,
    from: &str,
    to: &str,
) -> Result<(), StorageError> {
    let object = store.get(bucket, from).await?;
    store.put(bucket, to, &object.body).await?;
    store.delete(bucket, from).await
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn validate_key(key: &str) -> Result<PathBuf, StorageError> {
    if key.is_empty() || key.ends_with('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    let path = PathBuf::from(key);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(StorageError::InvalidKey(key.to_string())),
        }
    }
    Ok(path)
}

/// Filesystem-backed store: `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let bucket_path = validate_key(bucket)?;
        Ok(self.root.join(bucket_path).join(validate_key(key)?))
    }

    async fn meta_for(&self, path: &Path, key: &str) -> Result<ObjectMeta, StorageError> {
        let metadata = fs::metadata(path).await.map_err(|e| StorageError::io(path, e))?;
        let modified = metadata.modified().map_err(|e| StorageError::io(path, e))?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: metadata.len(),
            last_modified: DateTime::<Utc>::from(modified),
        })
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        Ok(())
    }

    /// Write `body` to a hidden sibling of `path` and return the temp path.
    async fn write_temp(path: &Path, body: &[u8]) -> Result<PathBuf, StorageError> {
        Self::ensure_parent(path).await?;
        let temp_path = path.with_file_name(format!(".{}.{}.tmp", Uuid::new_v4(), body.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StorageError::io(&temp_path, e))?;
        file.write_all(body)
            .await
            .map_err(|e| StorageError::io(&temp_path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&temp_path, e))?;
        Ok(temp_path)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        let path = self.object_path(bucket, key)?;
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => return Err(StorageError::io(&path, err)),
        };
        let meta = self.meta_for(&path, key).await?;
        Ok(StoredObject { meta, body })
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let path = self.object_path(bucket, key)?;
        match fs::try_exists(&path).await {
            Ok(true) if path.is_file() => Ok(Some(self.meta_for(&path, key).await?)),
            Ok(_) => Ok(None),
            Err(err) => Err(StorageError::io(&path, err)),
        }
    }

    /// Atomic temp-file write + rename, so readers never observe a partial object.
    async fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<ObjectMeta, StorageError> {
        let path = self.object_path(bucket, key)?;
        let temp_path = Self::write_temp(&path, body).await?;
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(&path, err));
        }
        debug!(bucket, key, bytes = body.len(), "object written");
        self.meta_for(&path, key).await
    }

    /// The body is complete before the key appears: a hard link never replaces an existing file.
    async fn put_if_absent(&self, bucket: &str, key: &str, body: &[u8]) -> Result<bool, StorageError> {
        let path = self.object_path(bucket, key)?;
        let temp_path = Self::write_temp(&path, body).await?;
        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(StorageError::io(&path, err)),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let bucket_root = self.root.join(validate_key(bucket)?);
        let mut out = Vec::new();
        let mut pending = vec![bucket_root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::io(&dir, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| StorageError::io(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    out.push(self.meta_for(&path, &key).await?);
                }
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(&path, err)),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// In-process store used by tests and dry runs. Timestamps come from the injected clock.
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), MemoryEntry>>,
    clock: Arc<dyn Clock>,
    fail_writes_under: Mutex<Option<String>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryObjectStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            clock,
            fail_writes_under: Mutex::new(None),
        }
    }

    /// Seed an object with an explicit modification time.
    pub async fn insert_at(&self, bucket: &str, key: &str, body: &[u8], last_modified: DateTime<Utc>) {
        self.objects.lock().await.insert(
            (bucket.to_string(), key.to_string()),
            MemoryEntry {
                body: body.to_vec(),
                last_modified,
            },
        );
    }

    /// Make every write under `prefix` fail with a transient error.
    pub async fn fail_writes_under(&self, prefix: Option<&str>) {
        *self.fail_writes_under.lock().await = prefix.map(str::to_string);
    }

    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    async fn check_writable(&self, key: &str) -> Result<(), StorageError> {
        match self.fail_writes_under.lock().await.as_deref() {
            Some(prefix) if key.starts_with(prefix) => Err(StorageError::Unavailable(format!(
                "injected write failure for {key}"
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        let objects = self.objects.lock().await;
        let entry = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        Ok(StoredObject {
            meta: ObjectMeta {
                key: key.to_string(),
                size: entry.body.len() as u64,
                last_modified: entry.last_modified,
            },
            body: entry.body.clone(),
        })
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| ObjectMeta {
                key: key.to_string(),
                size: entry.body.len() as u64,
                last_modified: entry.last_modified,
            }))
    }

    async fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<ObjectMeta, StorageError> {
        validate_key(key)?;
        self.check_writable(key).await?;
        let last_modified = self.clock.now();
        self.insert_at(bucket, key, body, last_modified).await;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: body.len() as u64,
            last_modified,
        })
    }

    async fn put_if_absent(&self, bucket: &str, key: &str, body: &[u8]) -> Result<bool, StorageError> {
        validate_key(key)?;
        self.check_writable(key).await?;
        let mut objects = self.objects.lock().await;
        let slot = (bucket.to_string(), key.to_string());
        if objects.contains_key(&slot) {
            return Ok(false);
        }
        objects.insert(
            slot,
            MemoryEntry {
                body: body.to_vec(),
                last_modified: self.clock.now(),
            },
        );
        Ok(true)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), entry)| ObjectMeta {
                key: k.clone(),
                size: entry.body.len() as u64,
                last_modified: entry.last_modified,
            })
            .collect())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.check_writable(key).await?;
        self.objects
            .lock()
            .await
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

#[derive(Debug, Clone, Copy, PartialEq)]
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
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Upper bound of time spent across all attempts of one call.
    pub fn worst_case(&self, attempt_timeout: Duration) -> Duration {
        let attempts = self.max_retries as u32 + 1;
        let sleeps = (0..self.max_retries)
            .map(|i| self.delay_for_attempt(i))
            .fold(Duration::ZERO, Duration::saturating_add);
        attempt_timeout.saturating_mul(attempts).saturating_add(sleeps)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts; last attempt timed out after {timeout:?}")]
    TimedOut { attempts: usize, timeout: Duration },
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
    #[error("non-retryable failure on attempt {attempts}: {last}")]
    Fatal { attempts: usize, last: E },
}

/// Run `op` with a per-attempt timeout, retrying retryable failures with capped
/// exponential backoff. A timed-out attempt counts as retryable.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    attempt_timeout: Duration,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        let outcome = tokio::time::timeout(attempt_timeout, op(attempt)).await;
        let last_attempt = attempt >= policy.max_retries;
        match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                if err.disposition() == RetryDisposition::NonRetryable {
                    return Err(RetryError::Fatal {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                if last_attempt {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                debug!(attempt, error = %err, "retryable failure; backing off");
            }
            Err(_elapsed) => {
                if last_attempt {
                    return Err(RetryError::TimedOut {
                        attempts: attempt + 1,
                        timeout: attempt_timeout,
                    });
                }
                debug!(attempt, timeout_ms = attempt_timeout.as_millis() as u64, "attempt timed out; backing off");
            }
        }
        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
        attempt += 1;
    }
}
