// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

/// Key conventions shared by every component that persists artifacts.
pub mod keys {
    /// Canonical bytes of a payload.
    #[must_use]
    pub fn oml(cid: &str) -> String {
        format!("oml/{cid}")
    }
    /// Proof envelope receipt.
    #[must_use]
    pub fn envelope(cid: &str) -> String {
        format!("receipts/{cid}.env.json")
    }
    /// Signed transform receipt.
    #[must_use]
    pub fn transform(output_cid: &str) -> String {
        format!("receipts/transform/{output_cid}.json")
    }
    /// Hop receipt, zero-padded for lexicographic ordering.
    #[must_use]
    pub fn hop(trace_id: &str, hop_index: u32) -> String {
        format!("hops/{trace_id}/{hop_index:08}.json")
    }
    /// Chain index for a trace.
    #[must_use]
    pub fn hop_index(trace_id: &str) -> String {
        format!("hops/index/{trace_id}.ndjson")
    }
    /// Service registry record.
    #[must_use]
    pub fn registry(id: &str) -> String {
        format!("registry/{id}.json")
    }
    /// Registered agent record.
    #[must_use]
    pub fn agent(did: &str) -> String {
        format!("agents/{did}.json")
    }
    /// SFT map document.
    #[must_use]
    pub fn map(name: &str) -> String {
        format!("maps/{name}.json")
    }
}

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The key contains path traversal or other forbidden characters.
    #[error("invalid storage key {key}")]
    InvalidKey {
        /// The rejected key.
        key: String,
    },
    /// A write to an existing key carried different bytes.
    #[error("conflicting write to existing key {key}")]
    ConflictingWrite {
        /// The conflicted key.
        key: String,
    },
    /// Filesystem failure.
    #[error("io error on {key}: {source}")]
    Io {
        /// Key involved.
        key: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Remote backend failure.
    #[error("backend error on {key}: {detail}")]
    Backend {
        /// Key involved.
        key: String,
        /// Failure detail.
        detail: String,
    },
}

/// The storage capability set. Implementations are stateless between
/// calls; all composition (fallback, mirroring) happens in wrappers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name for logs and metric labels.
    fn name(&self) -> &'static str;

    /// Write `bytes` at `key`. Idempotent: writing identical bytes to an
    /// existing key succeeds; different bytes fail with
    /// [`StorageError::ConflictingWrite`].
    async fn put_bytes(&self, key: &str, bytes: &[u8], content_type: &str)
    -> Result<(), StorageError>;

    /// Read the bytes at `key`, or `None` when absent.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// List up to `limit` keys under `prefix`, lexicographically ordered.
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError>;

    /// Delete `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Append a line to an NDJSON ledger key. Unlike [`Storage::put_bytes`]
    /// this grows an existing key; it is the only mutation that does.
    async fn append_line(&self, key: &str, line: &[u8]) -> Result<(), StorageError>;
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::InvalidKey { key: key.to_owned() });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// Local filesystem backend; the default in production.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `root` (created lazily on first write).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut p = self.root.clone();
        for seg in key.split('/') {
            p.push(seg);
        }
        p
    }
}

#[async_trait]
impl Storage for FsStore {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        let path = self.path_for(key);
        let io_err = |source| StorageError::Io { key: key.to_owned(), source };

        if let Ok(existing) = tokio::fs::read(&path).await {
            if existing == bytes {
                return Ok(());
            }
            return Err(StorageError::ConflictingWrite { key: key.to_owned() });
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { key: key.to_owned(), source }),
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(StorageError::Io { key: prefix.to_owned(), source });
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(|source| {
                StorageError::Io { key: prefix.to_owned(), source }
            })? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(key) = relative_key(&self.root, &path) {
                    if key.starts_with(prefix) {
                        out.push(key);
                    }
                }
            }
        }
        out.sort();
        out.truncate(limit);
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { key: key.to_owned(), source }),
        }
    }

    async fn append_line(&self, key: &str, line: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        let path = self.path_for(key);
        let io_err = |source| StorageError::Io { key: key.to_owned(), source };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(line).await.map_err(io_err)?;
        file.write_all(b"\n").await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel.iter().map(|s| s.to_str()).collect::<Option<_>>()?;
    Some(parts.join("/"))
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory backend for tests and the local mirror.
#[derive(Debug, Default)]
pub struct MemStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemStore {
    fn name(&self) -> &'static str {
        "mem"
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key) {
            if existing == bytes {
                return Ok(());
            }
            return Err(StorageError::ConflictingWrite { key: key.to_owned() });
        }
        entries.insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn append_line(&self, key: &str, line: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut entries = self.entries.write().await;
        let buf = entries.entry(key.to_owned()).or_default();
        buf.extend_from_slice(line);
        buf.push(b'\n');
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// External HTTP document store
// ---------------------------------------------------------------------------

/// External document store speaking plain HTTP: `PUT/GET/DELETE {base}/{key}`
/// and `GET {base}/?prefix=&limit=` returning a JSON array of keys.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base: String,
}

impl HttpStore {
    /// Create a store against `base` (no trailing slash).
    #[must_use]
    pub fn new(client: reqwest::Client, base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self { client, base }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{key}", self.base)
    }

    fn backend_err(key: &str, detail: impl ToString) -> StorageError {
        StorageError::Backend {
            key: key.to_owned(),
            detail: detail.to_string(),
        }
    }
}

#[async_trait]
impl Storage for HttpStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        if let Some(existing) = self.get_bytes(key).await? {
            if existing == bytes {
                return Ok(());
            }
            return Err(StorageError::ConflictingWrite { key: key.to_owned() });
        }
        let resp = self
            .client
            .put(self.url_for(key))
            .header("content-type", content_type.to_owned())
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| Self::backend_err(key, e))?;
        if !resp.status().is_success() {
            return Err(Self::backend_err(key, format!("put status {}", resp.status())));
        }
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        let resp = self
            .client
            .get(self.url_for(key))
            .send()
            .await
            .map_err(|e| Self::backend_err(key, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::backend_err(key, format!("get status {}", resp.status())));
        }
        let bytes = resp.bytes().await.map_err(|e| Self::backend_err(key, e))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        let limit_text = limit.to_string();
        let resp = self
            .client
            .get(format!("{}/", self.base))
            .query(&[("prefix", prefix), ("limit", limit_text.as_str())])
            .send()
            .await
            .map_err(|e| Self::backend_err(prefix, e))?;
        if !resp.status().is_success() {
            return Err(Self::backend_err(prefix, format!("list status {}", resp.status())));
        }
        let mut keys: Vec<String> = resp.json().await.map_err(|e| Self::backend_err(prefix, e))?;
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let resp = self
            .client
            .delete(self.url_for(key))
            .send()
            .await
            .map_err(|e| Self::backend_err(key, e))?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Self::backend_err(key, format!("delete status {}", resp.status())));
        }
        Ok(())
    }

    async fn append_line(&self, key: &str, line: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        // Document stores have no append; read-modify-write the ledger key.
        let mut buf = self.get_bytes(key).await?.unwrap_or_default();
        buf.extend_from_slice(line);
        buf.push(b'\n');
        let resp = self
            .client
            .put(self.url_for(key))
            .header("content-type", "application/x-ndjson")
            .body(buf)
            .send()
            .await
            .map_err(|e| Self::backend_err(key, e))?;
        if !resp.status().is_success() {
            return Err(Self::backend_err(key, format!("append status {}", resp.status())));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Composition wrappers
// ---------------------------------------------------------------------------

/// Routes around a failing primary backend. Every failover invokes the
/// registered hook (the gateway wires a failure counter there) and logs.
pub struct FallbackStore {
    primary: Arc<dyn Storage>,
    fallback: Arc<dyn Storage>,
    failures: AtomicU64,
    hook: Option<Arc<dyn Fn(&'static str) + Send + Sync>>,
}

impl FallbackStore {
    /// Compose `primary` with `fallback`.
    #[must_use]
    pub fn new(primary: Arc<dyn Storage>, fallback: Arc<dyn Storage>) -> Self {
        Self {
            primary,
            fallback,
            failures: AtomicU64::new(0),
            hook: None,
        }
    }

    /// Install a hook invoked with the operation name on each failover.
    #[must_use]
    pub fn with_failure_hook(mut self, hook: Arc<dyn Fn(&'static str) + Send + Sync>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Number of failovers so far.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn note_failure(&self, op: &'static str, err: &StorageError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        warn!(backend = self.primary.name(), op, error = %err, "primary storage failed; using fallback");
        if let Some(hook) = &self.hook {
            hook(op);
        }
    }
}

#[async_trait]
impl Storage for FallbackStore {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        match self.primary.put_bytes(key, bytes, content_type).await {
            Ok(()) => Ok(()),
            Err(err @ StorageError::ConflictingWrite { .. }) => Err(err),
            Err(err) => {
                self.note_failure("put", &err);
                self.fallback.put_bytes(key, bytes, content_type).await
            }
        }
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.primary.get_bytes(key).await {
            Ok(found @ Some(_)) => Ok(found),
            Ok(None) => self.fallback.get_bytes(key).await,
            Err(err) => {
                self.note_failure("get", &err);
                self.fallback.get_bytes(key).await
            }
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        match self.primary.list(prefix, limit).await {
            Ok(keys) => Ok(keys),
            Err(err) => {
                self.note_failure("list", &err);
                self.fallback.list(prefix, limit).await
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.primary.delete(key).await {
            Ok(()) => self.fallback.delete(key).await,
            Err(err) => {
                self.note_failure("delete", &err);
                self.fallback.delete(key).await
            }
        }
    }

    async fn append_line(&self, key: &str, line: &[u8]) -> Result<(), StorageError> {
        match self.primary.append_line(key, line).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.note_failure("append", &err);
                self.fallback.append_line(key, line).await
            }
        }
    }
}

/// Write-through local read mirror over a (possibly remote) inner backend.
pub struct MirrorStore {
    inner: Arc<dyn Storage>,
    mirror: MemStore,
}

impl MirrorStore {
    /// Wrap `inner` with an in-process mirror.
    #[must_use]
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            mirror: MemStore::new(),
        }
    }
}

#[async_trait]
impl Storage for MirrorStore {
    fn name(&self) -> &'static str {
        "mirror"
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.inner.put_bytes(key, bytes, content_type).await?;
        self.mirror.put_bytes(key, bytes, content_type).await
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(hit) = self.mirror.get_bytes(key).await? {
            return Ok(Some(hit));
        }
        let found = self.inner.get_bytes(key).await?;
        if let Some(bytes) = &found {
            let _ = self
                .mirror
                .put_bytes(key, bytes, "application/octet-stream")
                .await;
        }
        Ok(found)
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix, limit).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.mirror.delete(key).await?;
        self.inner.delete(key).await
    }

    async fn append_line(&self, key: &str, line: &[u8]) -> Result<(), StorageError> {
        self.mirror.append_line(key, line).await?;
        self.inner.append_line(key, line).await
    }
}
