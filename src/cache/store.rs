//! Disk-backed response cache keyed by the literal request-target.
//!
//! # Responsibilities
//! - Map request-target strings to files holding origin response bytes
//! - Give exactly one relay per key the right to fill an entry
//! - Publish an entry only after its file is complete
//! - Stream stored responses back in bounded chunks
//!
//! # Design Decisions
//! - Keys are compared byte for byte; no URI normalization
//! - File names are the hex SHA-256 of the key, so they are filesystem-safe
//!   and stable across runs
//! - A writer fills `<name>.<uuid>.part` and renames on commit; dropping an
//!   uncommitted writer deletes the partial file and frees the key
//! - No expiry, revalidation or eviction

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A replay that stopped early, with the bytes already written to the sink.
#[derive(Debug, Error)]
#[error("replay stopped after {copied} bytes: {source}")]
pub struct ReplayError {
    pub copied: u64,
    #[source]
    pub source: io::Error,
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// State of one key in the index.
#[derive(Debug, Clone)]
enum Slot {
    /// A writer holds the key; readers relay without caching.
    Filling,
    /// Complete response on disk.
    Ready(PathBuf),
}

enum Claim {
    Ready(PathBuf),
    Busy,
    Reserved,
}

/// Outcome of [`CacheStore::open_or_reserve`].
#[derive(Debug)]
pub enum CacheLookup {
    Hit(CachedResponse),
    /// `Some` when the caller became the key's single writer, `None` when
    /// another relay is already filling it.
    Miss(Option<CacheWriter>),
}

/// Shared handle to the cache. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    directory: PathBuf,
    index: DashMap<String, Slot>,
}

impl CacheStore {
    /// The directory is created lazily, on the first write.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                directory: directory.into(),
                index: DashMap::new(),
            }),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Number of complete entries.
    pub fn len(&self) -> usize {
        self.inner
            .index
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path a key is stored under once complete.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.inner.directory.join(cache_file_name(key))
    }

    /// Open a complete entry without reserving anything on a miss.
    pub async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let path = match self.inner.index.get(key)?.value() {
            Slot::Ready(path) => path.clone(),
            Slot::Filling => return None,
        };
        self.open_ready(key, path).await
    }

    /// Atomically either open the stored response for `key` or claim the
    /// right to store it.
    pub async fn open_or_reserve(&self, key: &str) -> CacheLookup {
        // The index shard lock is held only inside this match.
        let claim = match self.inner.index.entry(key.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(path) => Claim::Ready(path.clone()),
                Slot::Filling => Claim::Busy,
            },
            Entry::Vacant(entry) => {
                entry.insert(Slot::Filling);
                Claim::Reserved
            }
        };

        match claim {
            Claim::Busy => {
                tracing::debug!(key = %key, "Cache entry is being filled, relaying uncached");
                metrics::record_cache_lookup("busy");
                CacheLookup::Miss(None)
            }
            Claim::Reserved => {
                metrics::record_cache_lookup("miss");
                CacheLookup::Miss(self.begin_write(key).await)
            }
            Claim::Ready(path) => match self.open_ready(key, path).await {
                Some(response) => {
                    metrics::record_cache_lookup("hit");
                    CacheLookup::Hit(response)
                }
                None => {
                    metrics::record_cache_lookup("miss");
                    CacheLookup::Miss(None)
                }
            },
        }
    }

    async fn open_ready(&self, key: &str, path: PathBuf) -> Option<CachedResponse> {
        match open_with_len(&path).await {
            Ok((file, len)) => Some(CachedResponse { file, path, len }),
            Err(e) => {
                tracing::warn!(key = %key, path = %path.display(), error = %e, "Cached file unreadable, dropping entry");
                self.inner
                    .index
                    .remove_if(key, |_, slot| matches!(slot, Slot::Ready(p) if *p == path));
                None
            }
        }
    }

    async fn begin_write(&self, key: &str) -> Option<CacheWriter> {
        let name = cache_file_name(key);
        let final_path = self.inner.directory.join(&name);
        let temp_path = self
            .inner
            .directory
            .join(format!("{}.{}.part", name, uuid::Uuid::new_v4().simple()));

        let opened = async {
            tokio::fs::create_dir_all(&self.inner.directory)
                .await
                .map_err(|e| CacheError::io(&self.inner.directory, e))?;
            File::create(&temp_path)
                .await
                .map_err(|e| CacheError::io(&temp_path, e))
        }
        .await;

        match opened {
            Ok(file) => Some(CacheWriter {
                store: self.clone(),
                key: key.to_string(),
                temp_path,
                final_path,
                file: BufWriter::new(file),
                written: 0,
                committed: false,
            }),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cannot create cache file, relaying uncached");
                self.release(key);
                None
            }
        }
    }

    fn release(&self, key: &str) {
        self.inner
            .index
            .remove_if(key, |_, slot| matches!(slot, Slot::Filling));
    }

    fn publish(&self, key: &str, path: PathBuf) {
        self.inner.index.insert(key.to_string(), Slot::Ready(path));
    }
}

/// Hex SHA-256 of the key.
pub fn cache_file_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

async fn open_with_len(path: &Path) -> io::Result<(File, u64)> {
    let file = File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}

/// An open, complete cache entry.
#[derive(Debug)]
pub struct CachedResponse {
    file: File,
    path: PathBuf,
    len: u64,
}

impl CachedResponse {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the stored response in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stream the whole entry into `sink`.
    pub async fn replay<W>(mut self, sink: &mut W, chunk_size: usize) -> Result<u64, ReplayError>
    where
        W: AsyncWrite + Unpin,
    {
        replay(&mut self.file, sink, chunk_size).await
    }
}

/// Copy `source` to `sink` in chunks of at most `chunk_size`, flushing once
/// at the end.
pub async fn replay<R, W>(source: &mut R, sink: &mut W, chunk_size: usize) -> Result<u64, ReplayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;
    let stopped = |copied, source| ReplayError { copied, source };
    loop {
        let n = source.read(&mut buf).await.map_err(|e| stopped(total, e))?;
        if n == 0 {
            break;
        }
        tracing::trace!(bytes = n, "Replaying cached chunk");
        sink.write_all(&buf[..n]).await.map_err(|e| stopped(total, e))?;
        total += n as u64;
    }
    sink.flush().await.map_err(|e| stopped(total, e))?;
    Ok(total)
}

/// Exclusive writer for one key. Publishes on [`commit`](Self::commit);
/// dropping it uncommitted discards the partial file.
#[derive(Debug)]
pub struct CacheWriter {
    store: CacheStore,
    key: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    file: BufWriter<File>,
    written: u64,
    committed: bool,
}

impl CacheWriter {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| CacheError::io(&self.temp_path, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Finish the file and make the entry visible to lookups.
    pub async fn commit(mut self) -> Result<PathBuf, CacheError> {
        self.file
            .flush()
            .await
            .map_err(|e| CacheError::io(&self.temp_path, e))?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| CacheError::io(&self.temp_path, e))?;
        tokio::fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(|e| CacheError::io(&self.final_path, e))?;

        self.store.publish(&self.key, self.final_path.clone());
        self.committed = true;
        metrics::record_cache_store("stored");
        tracing::debug!(
            key = %self.key,
            path = %self.final_path.display(),
            bytes = self.written,
            "Cache entry stored"
        );
        Ok(self.final_path.clone())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.store.release(&self.key);
        metrics::record_cache_store("abandoned");
        if let Err(e) = std::fs::remove_file(&self.temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.temp_path.display(), error = %e, "Failed to remove partial cache file");
            }
        }
    }
}
