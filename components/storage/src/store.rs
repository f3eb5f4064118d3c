// Copyright 2024 stitch
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The staging area for uploaded chunks.
//!
//! Every upload key owns one directory right below the root, every chunk is
//! one file in it named by the chunk identifier:
//!
//! ```text
//! <root>/<upload key>/<hash>-<index>
//! ```
//!
//! A chunk is written under a dot-prefixed temporary name and renamed onto
//! its identifier once synced, so a failed write never leaves a short chunk
//! behind. Identifiers never start with a dot, listings skip such entries.
//!
//! No operation is atomic across calls, callers serialize conflicting work
//! through the [crate::registry::UploadRegistry].

use std::{
    fmt::Debug,
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::ResultExt;
use stitch_common::{parse_chunk_index, ChunkIndex};
use tokio::{
    fs,
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::{debug, warn};

use crate::err::{CorruptStateSnafu, IoFailureSnafu, NotEmptySnafu, Result};

/// One staged chunk as seen by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedChunk {
    pub identifier: String,
    pub index:      ChunkIndex,
    pub size:       u64,
}

pub type ChunkReader = Box<dyn AsyncRead + Send + Unpin>;

pub type ChunkStoreRef = Arc<dyn ChunkStore>;

#[async_trait]
pub trait ChunkStore: Send + Sync + Debug + 'static {
    /// Creates the staging directory of `key`, succeeds if it already
    /// exists, including when a concurrent call created it.
    async fn ensure(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Stores `data` under `identifier`, replacing an earlier payload.
    async fn put(&self, key: &str, identifier: &str, data: Bytes) -> Result<()>;

    /// Lists the staged chunks in storage order, which is no order at all.
    ///
    /// An entry whose name does not carry a chunk index, or which is not a
    /// regular file, makes the listing fail.
    async fn list(&self, key: &str) -> Result<Vec<StagedChunk>>;

    async fn open(&self, key: &str, identifier: &str) -> Result<ChunkReader>;

    /// Removing an entry that is already gone is not an error.
    async fn remove_entry(&self, key: &str, identifier: &str) -> Result<()>;

    /// Removes the staging directory, fails if anything is left in it.
    async fn remove_if_empty(&self, key: &str) -> Result<()>;
}

/// [ChunkStore] on the local file system.
#[derive(Debug)]
pub struct LocalChunkStore {
    root:      PathBuf,
    write_seq: AtomicU64,
}

const TEMP_PREFIX: char = '.';

impl LocalChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).context(IoFailureSnafu { path: &root })?;
        Ok(Self {
            root,
            write_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path { &self.root }

    fn staging_dir(&self, key: &str) -> PathBuf { self.root.join(key) }

    fn chunk_path(&self, key: &str, identifier: &str) -> PathBuf {
        self.staging_dir(key).join(identifier)
    }

    fn temp_path(&self, key: &str, identifier: &str, seq: u64) -> PathBuf {
        self.staging_dir(key)
            .join(format!("{TEMP_PREFIX}{identifier}.{seq}.tmp"))
    }
}

async fn write_synced(file: &mut fs::File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data).await?;
    file.sync_all().await
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn ensure(&self, key: &str) -> Result<()> {
        let dir = self.staging_dir(key);
        // create_dir_all tolerates a concurrent creator.
        fs::create_dir_all(&dir)
            .await
            .context(IoFailureSnafu { path: &dir })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let dir = self.staging_dir(key);
        match fs::metadata(&dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(IoFailureSnafu { path: dir }),
        }
    }

    async fn put(&self, key: &str, identifier: &str, data: Bytes) -> Result<()> {
        let path = self.chunk_path(key, identifier);
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let temp = self.temp_path(key, identifier, seq);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await
            .context(IoFailureSnafu { path: &temp })?;
        let synced = write_synced(&mut file, &data).await;
        let written = match synced {
            Ok(()) => {
                drop(file);
                fs::rename(&temp, &path)
                    .await
                    .context(IoFailureSnafu { path: &path })
            }
            Err(e) => Err(e).context(IoFailureSnafu { path: &temp }),
        };
        if written.is_err() {
            if let Err(e) = fs::remove_file(&temp).await {
                warn!("failed to remove {:?} after a failed write: {e}", temp);
            }
            return written;
        }
        debug!("staged chunk {:?}, {} bytes", path, data.len());
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<StagedChunk>> {
        let dir = self.staging_dir(key);
        let mut entries = fs::read_dir(&dir)
            .await
            .context(IoFailureSnafu { path: &dir })?;
        let mut chunks = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(IoFailureSnafu { path: &dir })?
        {
            let identifier = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    return CorruptStateSnafu {
                        upload_key: key,
                        reason:     format!("entry {:?} is not valid utf-8", name),
                    }
                    .fail();
                }
            };
            if identifier.starts_with(TEMP_PREFIX) {
                continue;
            }
            let index = parse_chunk_index(&identifier).map_err(|e| {
                CorruptStateSnafu {
                    upload_key: key,
                    reason:     e.to_string(),
                }
                .build()
            })?;
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // removed between read_dir and stat, e.g. by a running merge.
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => return Err(e).context(IoFailureSnafu { path: entry.path() }),
            };
            if !meta.is_file() {
                return CorruptStateSnafu {
                    upload_key: key,
                    reason:     format!("entry {identifier} is not a regular file"),
                }
                .fail();
            }
            chunks.push(StagedChunk {
                identifier,
                index,
                size: meta.len(),
            });
        }
        Ok(chunks)
    }

    async fn open(&self, key: &str, identifier: &str) -> Result<ChunkReader> {
        let path = self.chunk_path(key, identifier);
        let file = fs::File::open(&path)
            .await
            .context(IoFailureSnafu { path: &path })?;
        Ok(Box::new(file))
    }

    async fn remove_entry(&self, key: &str, identifier: &str) -> Result<()> {
        let path = self.chunk_path(key, identifier);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(IoFailureSnafu { path }),
        }
    }

    async fn remove_if_empty(&self, key: &str) -> Result<()> {
        let dir = self.staging_dir(key);
        match remove_stale_writes(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(IoFailureSnafu { path: dir }),
        }
        let err = match fs::remove_dir(&dir).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => e,
        };
        let remaining = count_entries(&dir).await.unwrap_or(0);
        if remaining > 0 {
            return NotEmptySnafu {
                upload_key: key,
                remaining,
            }
            .fail();
        }
        Err(err).context(IoFailureSnafu { path: dir })
    }
}

/// Removes the temporary files of writes that never finished.
async fn remove_stale_writes(dir: &Path) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let stale = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(TEMP_PREFIX));
        if stale && entry.file_type().await?.is_file() {
            debug!("removing unfinished write {:?}", entry.path());
            match fs::remove_file(entry.path()).await {
                Err(e) if e.kind() != IoErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
    }
    Ok(())
}

async fn count_entries(dir: &Path) -> std::io::Result<usize> {
    let mut entries = fs::read_dir(dir).await?;
    let mut cnt = 0;
    while entries.next_entry().await?.is_some() {
        cnt += 1;
    }
    Ok(cnt)
}
