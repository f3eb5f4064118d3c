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

use std::{
    fs::{File, OpenOptions},
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::ResultExt;
use stitch_common::FileOffset;

use crate::err::{IoFailureSnafu, JoinErrSnafu, Result};

/// The file a merge writes into.
///
/// The handle is shared by every copy of the merge. Writes never move a
/// shared cursor, each one names its own offset, so copies of disjoint
/// ranges need no lock.
#[derive(Debug, Clone)]
pub(crate) struct OutputFile {
    path: PathBuf,
    file: Arc<File>,
}

impl OutputFile {
    /// Creates (or truncates) the file at `path` with a length of `len`.
    pub(crate) async fn create(path: PathBuf, len: u64) -> Result<Self> {
        let p = path.clone();
        let file = blocking(&path, move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&p)?;
            file.set_len(len)?;
            Ok(file)
        })
        .await?;
        Ok(Self {
            path,
            file: Arc::new(file),
        })
    }

    /// Reopens the output of an interrupted merge, `None` if it is missing
    /// or does not have the expected length.
    pub(crate) async fn reopen(path: PathBuf, len: u64) -> Result<Option<Self>> {
        let p = path.clone();
        let file = blocking(&path, move || {
            let file = match OpenOptions::new().read(true).write(true).open(&p) {
                Ok(file) => file,
                Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            if file.metadata()?.len() != len {
                return Ok(None);
            }
            Ok(Some(file))
        })
        .await?;
        Ok(file.map(|file| Self {
            path,
            file: Arc::new(file),
        }))
    }

    pub(crate) fn path(&self) -> &Path { &self.path }

    /// Writes `buf[..len]` at `offset` and hands the buffer back for reuse.
    pub(crate) async fn write_at(
        &self,
        offset: FileOffset,
        buf: Vec<u8>,
        len: usize,
    ) -> Result<Vec<u8>> {
        let file = self.file.clone();
        blocking(&self.path, move || {
            write_all_at(&file, &buf[..len], offset)?;
            Ok(buf)
        })
        .await
    }

    pub(crate) async fn sync_all(&self) -> Result<()> {
        let file = self.file.clone();
        blocking(&self.path, move || file.sync_all()).await
    }

    /// Renames the output onto `target`, replacing what is there.
    pub(crate) async fn persist(self, target: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, target)
            .await
            .context(IoFailureSnafu { path: target })
    }
}

async fn blocking<T, F>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context(JoinErrSnafu)?
        .context(IoFailureSnafu { path })
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(IoErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == IoErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
