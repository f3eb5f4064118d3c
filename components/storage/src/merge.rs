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

//! Reassembles an upload from its staged chunks.
//!
//! ## How a merge runs
//! 1. Snapshot the staging directory into a list sorted by chunk index. The
//!    listing order of the store is never trusted.
//! 2. Check the snapshot: indices `0..N` without gaps or duplicates, every
//!    chunk but the last exactly `chunk_size` bytes.
//! 3. Copy all chunks concurrently into a hidden partial file, chunk `i`
//!    lands at `i * chunk_size`. Each copy deletes its chunk right after the
//!    bytes are written.
//! 4. Once every copy succeeded, remove the staging directory and rename the
//!    partial file onto the target name.
//!
//! A failed merge leaves the partial file and the remaining chunks behind,
//! the registry remembers which chunks already made it, so the next merge
//! finishes the job.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use snafu::{ensure, OptionExt, ResultExt};
use stitch_common::{cal_chunk_offset, partial_name, ChunkIndex, ChunkSize, FileOffset};
use tokio::{io::AsyncReadExt, time::Instant};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::Config,
    err::{
        BadRequestSnafu, ChunkSizeMismatchSnafu, CopyTimeoutSnafu, CorruptStateSnafu,
        IncompleteUploadSnafu, IoFailureSnafu, NotFoundSnafu, Result, MAX_REPORTED_MISSING,
    },
    output::OutputFile,
    registry::{MergeLease, MergeProgress},
    store::{ChunkReader, ChunkStoreRef, StagedChunk},
};

/// The outcome of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub filename:   String,
    pub upload_key: String,
    /// Chunks copied by this merge.
    pub merged:     u64,
    /// Chunks the file consists of.
    pub expected:   u64,
    /// Length of the output file.
    pub size:       u64,
}

/// The checked layout of the output file.
#[derive(Debug, PartialEq, Eq)]
struct MergePlan {
    expected:  u64,
    total_len: u64,
    chunks:    Vec<StagedChunk>,
}

impl MergePlan {
    /// Validates the sorted snapshot against an earlier attempt, if any.
    fn new(
        key: &str,
        chunk_size: ChunkSize,
        chunks: Vec<StagedChunk>,
        prior: Option<&MergeProgress>,
    ) -> Result<Self> {
        ensure!(chunk_size > 0, BadRequestSnafu {
            reason: "chunk size must be positive",
        });
        if let Some(dup) = chunks.windows(2).find(|w| w[0].index == w[1].index) {
            return CorruptStateSnafu {
                upload_key: key,
                reason:     format!(
                    "chunks {} and {} share index {}",
                    dup[0].identifier, dup[1].identifier, dup[0].index
                ),
            }
            .fail();
        }

        let expected = match (prior, chunks.last()) {
            (Some(prior), _) => {
                ensure!(prior.chunk_size == chunk_size, BadRequestSnafu {
                    reason: format!(
                        "chunk size {chunk_size} differs from {} used by the interrupted merge",
                        prior.chunk_size
                    ),
                });
                prior.expected
            }
            (None, Some(last)) => last.index.checked_add(1).context(CorruptStateSnafu {
                upload_key: key,
                reason:     "chunk index overflow",
            })?,
            (None, None) => {
                return IncompleteUploadSnafu {
                    upload_key:    key,
                    expected:      0u64,
                    missing_count: 0u64,
                    missing:       Vec::<ChunkIndex>::new(),
                }
                .fail();
            }
        };

        if let Some(beyond) = chunks.iter().find(|c| c.index >= expected) {
            return CorruptStateSnafu {
                upload_key: key,
                reason:     format!(
                    "chunk {} lies beyond the {expected} chunks of the interrupted merge",
                    beyond.identifier
                ),
            }
            .fail();
        }

        let staged = chunks.iter().map(|c| c.index).collect::<BTreeSet<_>>();
        let merged = prior.map(|p| &p.merged);
        let missing = (0..expected)
            .filter(|i| !staged.contains(i) && !merged.is_some_and(|m| m.contains(i)));
        let missing_count = missing.clone().count() as u64;
        if missing_count > 0 {
            return IncompleteUploadSnafu {
                upload_key: key,
                expected,
                missing_count,
                missing: missing.take(MAX_REPORTED_MISSING).collect::<Vec<_>>(),
            }
            .fail();
        }

        let last_index = expected - 1;
        for c in &chunks {
            let last = c.index == last_index;
            let fits = if last {
                c.size <= chunk_size
            } else {
                c.size == chunk_size
            };
            ensure!(fits, ChunkSizeMismatchSnafu {
                upload_key: key,
                identifier: &c.identifier,
                expected: chunk_size,
                actual: c.size,
                last,
            });
        }

        let body_len = cal_chunk_offset(last_index, chunk_size).context(BadRequestSnafu {
            reason: format!("{expected} chunks of {chunk_size} bytes overflow the file size"),
        })?;
        let total_len = match (prior, chunks.last()) {
            (_, Some(last)) if last.index == last_index => body_len + last.size,
            (Some(prior), _) => prior.total_len,
            // unreachable: without a prior attempt the last staged chunk
            // defines the expected count.
            (None, _) => body_len,
        };
        if let Some(prior) = prior {
            ensure!(prior.total_len == total_len, ChunkSizeMismatchSnafu {
                upload_key: key,
                identifier: chunks.last().map(|c| c.identifier.as_str()).unwrap_or_default(),
                expected: prior.total_len - body_len,
                actual: total_len - body_len,
                last: true,
            });
        }

        Ok(Self {
            expected,
            total_len,
            chunks,
        })
    }

    /// Whether the staged chunks still describe the file of the interrupted
    /// merge: nothing past its last chunk, and a restaged last chunk keeps
    /// the file length.
    fn resumes(prior: &MergeProgress, chunks: &[StagedChunk]) -> bool {
        let Some(last_index) = prior.expected.checked_sub(1) else {
            return chunks.is_empty();
        };
        chunks.iter().all(|c| match c.index.cmp(&last_index) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => cal_chunk_offset(last_index, prior.chunk_size)
                .and_then(|body| body.checked_add(c.size))
                .is_some_and(|len| len == prior.total_len),
            std::cmp::Ordering::Greater => false,
        })
    }
}

pub struct MergeCoordinator {
    store:       ChunkStoreRef,
    root:        PathBuf,
    concurrency: usize,
    buffer_len:  usize,
    timeout:     Option<Duration>,
}

impl MergeCoordinator {
    pub fn new(store: ChunkStoreRef, config: &Config) -> Self {
        Self {
            store,
            root: config.upload_dir.clone(),
            concurrency: config.copy_concurrency(),
            buffer_len: config.copy_buffer_len(),
            timeout: config.copy_timeout(),
        }
    }

    /// Merges the chunks staged for `filename` into `<root>/<filename>`.
    ///
    /// The caller holds the [MergeLease] of the upload key; on error the
    /// lease is dropped by the caller and records the progress.
    #[instrument(level = "info", skip_all, fields(filename = filename, chunk_size = chunk_size))]
    pub async fn merge(
        &self,
        lease: &mut MergeLease,
        filename: &str,
        chunk_size: ChunkSize,
    ) -> Result<MergeReport> {
        let start = Instant::now();
        let key = lease.key().to_string();

        let chunks = if self.store.exists(&key).await? {
            let mut chunks = self.store.list(&key).await?;
            chunks.sort_by_key(|c| c.index);
            chunks
        } else if lease.prior().is_some() {
            // every chunk was copied, only the final steps failed.
            vec![]
        } else {
            return NotFoundSnafu { upload_key: key }.fail();
        };

        if lease
            .prior()
            .is_some_and(|prior| !MergePlan::resumes(prior, &chunks))
        {
            warn!(
                "staged chunks of {} no longer match the interrupted merge, starting over",
                key
            );
            lease.discard_prior();
        }

        let partial_path = self.root.join(partial_name(filename));
        let (plan, output) = match lease.prior().cloned() {
            Some(prior) => {
                let plan = MergePlan::new(&key, chunk_size, chunks.clone(), Some(&prior))?;
                match OutputFile::reopen(partial_path.clone(), plan.total_len).await? {
                    Some(output) => (plan, output),
                    None => {
                        warn!(
                            "partial output {:?} of the interrupted merge is gone, starting over",
                            partial_path
                        );
                        lease.discard_prior();
                        let plan = MergePlan::new(&key, chunk_size, chunks, None)?;
                        let output = OutputFile::create(partial_path, plan.total_len).await?;
                        (plan, output)
                    }
                }
            }
            None => {
                let plan = MergePlan::new(&key, chunk_size, chunks, None)?;
                let output = OutputFile::create(partial_path, plan.total_len).await?;
                (plan, output)
            }
        };
        lease.set_plan(chunk_size, plan.expected, plan.total_len);
        debug!(
            "merging {} staged chunks of {} into {:?}",
            plan.chunks.len(),
            plan.expected,
            output.path()
        );

        let merged = lease.merged();
        let copied = futures::stream::iter(plan.chunks)
            .map(|chunk| self.copy_chunk(&key, chunk, chunk_size, &output, merged.clone()))
            .buffer_unordered(self.concurrency)
            .try_fold(0u64, |cnt, _| async move { Ok(cnt + 1) })
            .await?;

        output.sync_all().await?;
        self.store.remove_if_empty(&key).await?;
        let target = self.root.join(filename);
        output.persist(&target).await?;

        info!(
            "merged {} into {:?}, {} of {} chunks copied, {} bytes, cost: {:?}",
            key,
            target,
            copied,
            plan.expected,
            plan.total_len,
            start.elapsed()
        );
        Ok(MergeReport {
            filename:   filename.to_string(),
            upload_key: key,
            merged:     copied,
            expected:   plan.expected,
            size:       plan.total_len,
        })
    }

    async fn copy_chunk(
        &self,
        key: &str,
        chunk: StagedChunk,
        chunk_size: ChunkSize,
        output: &OutputFile,
        merged: Arc<Mutex<BTreeSet<ChunkIndex>>>,
    ) -> Result<()> {
        let offset = cal_chunk_offset(chunk.index, chunk_size).context(BadRequestSnafu {
            reason: format!("offset of chunk {} overflows", chunk.identifier),
        })?;
        let copy = self.copy_range(key, &chunk, offset, output);
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, copy)
                .await
                .map_err(|_| {
                    CopyTimeoutSnafu {
                        identifier: &chunk.identifier,
                        timeout,
                    }
                    .build()
                })??,
            None => copy.await?,
        }

        // The bytes are in the output from here on, record it before the
        // chunk disappears.
        if let Ok(mut merged) = merged.lock() {
            merged.insert(chunk.index);
        }
        self.store.remove_entry(key, &chunk.identifier).await?;
        debug!(
            "chunk {} copied to [{}, {})",
            chunk.identifier,
            offset,
            offset + chunk.size
        );
        Ok(())
    }

    /// Streams the chunk into `[offset, offset + chunk.size)`.
    async fn copy_range(
        &self,
        key: &str,
        chunk: &StagedChunk,
        offset: FileOffset,
        output: &OutputFile,
    ) -> Result<()> {
        let mut reader = self.store.open(key, &chunk.identifier).await?;
        let mut buf = vec![0u8; self.buffer_len];
        let mut copied = 0u64;
        loop {
            let n = read_full(&mut reader, &mut buf)
                .await
                .context(IoFailureSnafu {
                    path: self.root.join(key).join(&chunk.identifier),
                })?;
            if n == 0 {
                break;
            }
            ensure!(copied + n as u64 <= chunk.size, CorruptStateSnafu {
                upload_key: key,
                reason:     format!("chunk {} grew while merging", chunk.identifier),
            });
            buf = output.write_at(offset + copied, buf, n).await?;
            copied += n as u64;
        }
        ensure!(copied == chunk.size, CorruptStateSnafu {
            upload_key: key,
            reason:     format!(
                "chunk {} shrank to {copied} of {} bytes while merging",
                chunk.identifier, chunk.size
            ),
        });
        Ok(())
    }
}

/// Reads until `buf` is full or the reader is exhausted.
async fn read_full(reader: &mut ChunkReader, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::Error;

    fn chunk(index: u64, size: u64) -> StagedChunk {
        StagedChunk {
            identifier: format!("h-{index}"),
            index,
            size,
        }
    }

    #[test]
    fn plan_accepts_short_last_chunk() {
        let plan = MergePlan::new(
            "video",
            1024,
            vec![chunk(0, 1024), chunk(1, 1024), chunk(2, 512)],
            None,
        )
        .unwrap();
        assert_eq!(plan.expected, 3);
        assert_eq!(plan.total_len, 2560);
    }

    #[test]
    fn plan_rejects_gaps() {
        let err = MergePlan::new("video", 10, vec![chunk(0, 10), chunk(2, 3)], None).unwrap_err();
        match err {
            Error::IncompleteUpload {
                expected,
                missing_count,
                missing,
                ..
            } => {
                assert_eq!(expected, 3);
                assert_eq!(missing_count, 1);
                assert_eq!(missing, vec![1]);
            }
            e => panic!("unexpected {e}"),
        }

        let err = MergePlan::new("video", 10, vec![], None).unwrap_err();
        assert!(matches!(err, Error::IncompleteUpload { expected: 0, .. }), "{err}");
    }

    #[test]
    fn plan_reports_bounded_missing_list() {
        let err = MergePlan::new("video", 10, vec![chunk(1000, 3)], None).unwrap_err();
        match err {
            Error::IncompleteUpload {
                missing_count,
                missing,
                ..
            } => {
                assert_eq!(missing_count, 1000);
                assert_eq!(missing.len(), MAX_REPORTED_MISSING);
                assert_eq!(missing[0], 0);
            }
            e => panic!("unexpected {e}"),
        }
    }

    #[test]
    fn plan_rejects_duplicates_and_bad_sizes() {
        let mut dup = vec![chunk(0, 10), chunk(1, 10)];
        dup[1].index = 0;
        dup[1].identifier = "other-0".to_string();
        let err = MergePlan::new("video", 10, dup, None).unwrap_err();
        assert!(matches!(err, Error::CorruptState { .. }), "{err}");

        let err = MergePlan::new("video", 10, vec![chunk(0, 9), chunk(1, 3)], None).unwrap_err();
        assert!(
            matches!(err, Error::ChunkSizeMismatch { last: false, actual: 9, .. }),
            "{err}"
        );

        let err = MergePlan::new("video", 10, vec![chunk(0, 10), chunk(1, 11)], None).unwrap_err();
        assert!(matches!(err, Error::ChunkSizeMismatch { last: true, .. }), "{err}");

        let err = MergePlan::new("video", 0, vec![chunk(0, 0)], None).unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }), "{err}");
    }

    #[test]
    fn plan_resumes_interrupted_merge() {
        let prior = MergeProgress {
            chunk_size: 10,
            expected:   3,
            total_len:  24,
            merged:     BTreeSet::from([0, 2]),
        };
        let plan = MergePlan::new("video", 10, vec![chunk(1, 10)], Some(&prior)).unwrap();
        assert_eq!(plan.expected, 3);
        assert_eq!(plan.total_len, 24);

        // the last chunk was merged and uploaded again
        let plan =
            MergePlan::new("video", 10, vec![chunk(1, 10), chunk(2, 4)], Some(&prior)).unwrap();
        assert_eq!(plan.total_len, 24);

        let err = MergePlan::new("video", 8, vec![chunk(1, 8)], Some(&prior)).unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }), "{err}");

        let err = MergePlan::new("video", 10, vec![], Some(&prior)).unwrap_err();
        assert!(matches!(err, Error::IncompleteUpload { missing_count: 1, .. }), "{err}");

        let err = MergePlan::new("video", 10, vec![chunk(3, 2)], Some(&prior)).unwrap_err();
        assert!(matches!(err, Error::CorruptState { .. }), "{err}");
    }

    #[test]
    fn staged_chunks_outgrow_interrupted_merge() {
        let prior = MergeProgress {
            chunk_size: 10,
            expected:   3,
            total_len:  24,
            merged:     BTreeSet::from([0]),
        };
        assert!(MergePlan::resumes(&prior, &[chunk(1, 10), chunk(2, 4)]));
        assert!(MergePlan::resumes(&prior, &[chunk(1, 10)]));
        assert!(MergePlan::resumes(&prior, &[]));

        // the client went on with a longer file
        assert!(!MergePlan::resumes(&prior, &[chunk(1, 10), chunk(2, 10), chunk(3, 2)]));
        // or restaged a different last chunk
        assert!(!MergePlan::resumes(&prior, &[chunk(1, 10), chunk(2, 7)]));
    }
}
