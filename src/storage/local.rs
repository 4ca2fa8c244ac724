// src/storage/local.rs

//! Local filesystem storage for run caches.
//!
//! ## Storage Layout
//!
//! ```text
//! {cache folder}/
//! ├── .records-hashes-{server}-{bucket}-{collection}.json   # change-detection cache
//! ├── .records-{server}-{bucket}-{collection}.json          # legacy full-record cache
//! └── .metadata-{version}.json                               # metadata memo maps
//! ```
//!
//! Every write goes to a temporary sibling first and is renamed into place, so an
//! interrupted run never leaves a truncated cache behind.

use std::path::{Path, PathBuf};

use async_stream::try_stream;
use futures::Stream;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{AppError, Result};

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root_dir: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Get the full path for a relative key.
    pub fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    pub async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let tmp = self.path(&format!("{key}.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    pub async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete a file; a missing file is not an error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.path(key)).await.unwrap_or(false)
    }
}

/// Stream a file in `chunk_size` pieces; the stream ends at end of file.
pub fn file_chunks(
    path: impl Into<PathBuf>,
    chunk_size: usize,
) -> impl Stream<Item = Result<Vec<u8>>> {
    let path = path.into();
    let chunk_size = chunk_size.max(1);
    try_stream! {
        let mut file = tokio::fs::File::open(&path).await?;
        loop {
            let mut buffer = vec![0u8; chunk_size];
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            buffer.truncate(read);
            yield buffer;
        }
    }
}
