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

//! Per upload key state machine.
//!
//! ```text
//!   chunk upload          merge ok
//! Receiving ----> Merging ----> Done
//!     ^              |            |
//!     +--------------+            |
//!       merge failed              |
//!     ^                           |
//!     +---------------------------+
//!       new chunk, next upload cycle
//! ```
//!
//! Chunk writes hold a shared lease for as long as they touch the staging
//! directory. A merge takes the exclusive lease only to flip the state to
//! [UploadState::Merging], so it waits for in-flight writes and turns away
//! later ones.
//!
//! A key in `Receiving` without merge progress is the same as an unknown
//! key, its entry goes away with the last lease. Only the most recent
//! [DEFAULT_DONE_CAPACITY] merged keys are remembered as `Done`.

use std::{
    collections::{BTreeSet, VecDeque},
    sync::{Arc, Mutex},
};

use dashmap::DashMap;
use serde::Serialize;
use stitch_common::{ChunkIndex, ChunkSize};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, warn};

use crate::err::{AlreadyMergedSnafu, Result, UploadBusySnafu};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Receiving,
    Merging,
    Done,
}

/// What an interrupted merge already moved into the partial output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeProgress {
    pub chunk_size: ChunkSize,
    /// The number of chunks of the whole file.
    pub expected:   u64,
    pub total_len:  u64,
    /// Chunks whose bytes are in the partial output.
    pub merged:     BTreeSet<ChunkIndex>,
}

#[derive(Debug)]
pub struct Upload {
    pub state:    UploadState,
    pub progress: Option<MergeProgress>,
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            state:    UploadState::Receiving,
            progress: None,
        }
    }
}

type UploadRef = Arc<RwLock<Upload>>;

/// How many merged keys keep answering [UploadState::Done].
pub const DEFAULT_DONE_CAPACITY: usize = 4096;

#[derive(Debug)]
struct Uploads {
    entries:       DashMap<String, UploadRef>,
    /// Merged keys, oldest first.
    done:          Mutex<VecDeque<String>>,
    done_capacity: usize,
}

impl Uploads {
    /// Drops the entry of `key` when it holds nothing a fresh entry would not,
    /// and nobody but the caller, who holds `held` references, is using it.
    fn forget_if_idle(&self, key: &str, held: usize) {
        let removed = self.entries.remove_if(key, |_, upload| {
            Arc::strong_count(upload) <= held + 1
                && upload.try_read().is_ok_and(|u| {
                    u.state == UploadState::Receiving && u.progress.is_none()
                })
        });
        if removed.is_some() {
            debug!("upload {key} is idle, forgetting it");
        }
    }

    /// Remembers `key` as merged, evicting the oldest merged keys beyond the
    /// capacity.
    fn record_done(&self, key: &str) {
        let evicted = {
            let mut done = match self.done.lock() {
                Ok(done) => done,
                Err(poisoned) => poisoned.into_inner(),
            };
            done.retain(|k| k != key);
            done.push_back(key.to_string());
            let excess = done.len().saturating_sub(self.done_capacity);
            done.drain(..excess).collect::<Vec<_>>()
        };
        for key in evicted {
            self.entries.remove_if(&key, |_, upload| {
                Arc::strong_count(upload) == 1
                    && upload
                        .try_read()
                        .is_ok_and(|u| u.state == UploadState::Done)
            });
        }
    }
}

/// Tracks the uploads that are being merged, were merged, or carry the
/// progress of a failed merge. Keys without any of these are not kept.
#[derive(Debug, Clone)]
pub struct UploadRegistry {
    uploads: Arc<Uploads>,
}

impl Default for UploadRegistry {
    fn default() -> Self { Self::with_done_capacity(DEFAULT_DONE_CAPACITY) }
}

impl UploadRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_done_capacity(done_capacity: usize) -> Self {
        Self {
            uploads: Arc::new(Uploads {
                entries: DashMap::new(),
                done: Mutex::new(VecDeque::new()),
                done_capacity,
            }),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize { self.uploads.entries.len() }

    pub fn is_empty(&self) -> bool { self.uploads.entries.is_empty() }

    fn entry(&self, key: &str) -> UploadRef {
        if let Some(upload) = self.uploads.entries.get(key) {
            return upload.value().clone();
        }
        self.uploads
            .entries
            .entry(key.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// The state and merge progress of `key`, `None` if nothing is tracked
    /// for it.
    pub async fn snapshot(&self, key: &str) -> Option<(UploadState, Option<MergeProgress>)> {
        let upload = self.uploads.entries.get(key).map(|u| u.value().clone())?;
        let guard = upload.read().await;
        Some((guard.state, guard.progress.clone()))
    }

    /// Takes the shared lease a chunk write holds while it touches the
    /// staging directory.
    pub async fn lease_chunk(&self, key: &str) -> Result<ChunkLease> {
        let upload = self.entry(key);
        let lease = |guard| ChunkLease {
            key:     key.to_string(),
            uploads: self.uploads.clone(),
            guard:   Some(guard),
        };
        let read_guard = upload.clone().read_owned().await;
        match read_guard.state {
            UploadState::Receiving => return Ok(lease(read_guard)),
            UploadState::Merging => return UploadBusySnafu { upload_key: key }.fail(),
            UploadState::Done => drop(read_guard),
        }

        let mut write_guard = upload.clone().write_owned().await;
        match write_guard.state {
            UploadState::Merging => return UploadBusySnafu { upload_key: key }.fail(),
            UploadState::Done => {
                debug!("upload {key} was merged before, starting a new upload cycle");
                write_guard.state = UploadState::Receiving;
                write_guard.progress = None;
            }
            UploadState::Receiving => {}
        }
        Ok(lease(write_guard.downgrade()))
    }

    /// Moves `key` into [UploadState::Merging].
    pub async fn lease_merge(&self, key: &str) -> Result<MergeLease> {
        let upload = self.entry(key);
        let mut write_guard = upload.write().await;
        match write_guard.state {
            UploadState::Merging => return UploadBusySnafu { upload_key: key }.fail(),
            UploadState::Done => return AlreadyMergedSnafu { upload_key: key }.fail(),
            UploadState::Receiving => write_guard.state = UploadState::Merging,
        }
        let prior = write_guard.progress.clone();
        drop(write_guard);

        let merged = prior
            .as_ref()
            .map(|p| p.merged.clone())
            .unwrap_or_default();
        Ok(MergeLease {
            key: key.to_string(),
            uploads: self.uploads.clone(),
            upload,
            prior,
            plan: None,
            merged: Arc::new(Mutex::new(merged)),
            finished: false,
        })
    }
}

/// Keeps merges away while a chunk is written.
pub struct ChunkLease {
    key:     String,
    uploads: Arc<Uploads>,
    guard:   Option<OwnedRwLockReadGuard<Upload>>,
}

impl Drop for ChunkLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.uploads.forget_if_idle(&self.key, 0);
    }
}

/// The right to merge one upload.
///
/// Dropping the lease without [MergeLease::complete] puts the upload back
/// into [UploadState::Receiving] and remembers what was merged so far, so a
/// later merge can pick up from there.
pub struct MergeLease {
    key:      String,
    uploads:  Arc<Uploads>,
    upload:   UploadRef,
    prior:    Option<MergeProgress>,
    plan:     Option<(ChunkSize, u64, u64)>,
    merged:   Arc<Mutex<BTreeSet<ChunkIndex>>>,
    finished: bool,
}

impl MergeLease {
    pub fn key(&self) -> &str { &self.key }

    /// The progress left behind by an earlier, failed merge.
    pub fn prior(&self) -> Option<&MergeProgress> { self.prior.as_ref() }

    /// Records the layout of the output file this merge writes.
    pub fn set_plan(&mut self, chunk_size: ChunkSize, expected: u64, total_len: u64) {
        self.plan = Some((chunk_size, expected, total_len));
    }

    /// Forgets the interrupted merge, used when its partial output is gone
    /// or the staged chunks describe another file.
    pub fn discard_prior(&mut self) {
        self.prior = None;
        self.plan = None;
        if let Ok(mut merged) = self.merged.lock() {
            merged.clear();
        }
    }

    /// Shared with the copy tasks, which record every chunk whose bytes are
    /// in the output.
    pub fn merged(&self) -> Arc<Mutex<BTreeSet<ChunkIndex>>> { self.merged.clone() }

    pub async fn complete(mut self) {
        let mut guard = self.upload.write().await;
        guard.state = UploadState::Done;
        guard.progress = None;
        drop(guard);
        self.finished = true;
        self.uploads.record_done(&self.key);
    }

    fn progress(&self) -> Option<MergeProgress> {
        let (chunk_size, expected, total_len) = self.plan?;
        let merged = match self.merged.lock() {
            Ok(merged) => merged.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Some(MergeProgress {
            chunk_size,
            expected,
            total_len,
            merged,
        })
    }
}

impl Drop for MergeLease {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let progress = self.progress().or_else(|| self.prior.clone());
        let release = |upload: &mut Upload, progress: Option<MergeProgress>| {
            upload.state = UploadState::Receiving;
            upload.progress = progress.filter(|p| !p.merged.is_empty());
        };
        if let Ok(mut guard) = self.upload.try_write() {
            release(&mut guard, progress);
            drop(guard);
            self.uploads.forget_if_idle(&self.key, 1);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let key = self.key.clone();
                let uploads = self.uploads.clone();
                let upload = self.upload.clone();
                handle.spawn(async move {
                    let mut guard = upload.write().await;
                    release(&mut guard, progress);
                    drop(guard);
                    drop(upload);
                    uploads.forget_if_idle(&key, 0);
                });
            }
            Err(_) => warn!("upload {} is left in merging state", self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::Error;

    #[tokio::test]
    async fn chunk_rejected_while_merging() {
        let registry = UploadRegistry::new();
        let lease = registry.lease_merge("video").await.unwrap();

        let err = registry.lease_chunk("video").await.err().unwrap();
        assert!(matches!(err, Error::UploadBusy { .. }), "{err}");
        let err = registry.lease_merge("video").await.err().unwrap();
        assert!(matches!(err, Error::UploadBusy { .. }), "{err}");
        // other uploads are unaffected
        registry.lease_chunk("audio").await.unwrap();

        lease.complete().await;
        let (state, _) = registry.snapshot("video").await.unwrap();
        assert_eq!(state, UploadState::Done);
    }

    #[tokio::test]
    async fn duplicate_merge_rejected_once_done() {
        let registry = UploadRegistry::new();
        registry.lease_merge("video").await.unwrap().complete().await;

        let err = registry.lease_merge("video").await.err().unwrap();
        assert!(matches!(err, Error::AlreadyMerged { .. }), "{err}");

        // a new chunk starts the next cycle
        let chunk = registry.lease_chunk("video").await.unwrap();
        let (state, progress) = registry.snapshot("video").await.unwrap();
        assert_eq!(state, UploadState::Receiving);
        assert!(progress.is_none());
        drop(chunk);
        registry.lease_merge("video").await.unwrap();
    }

    #[tokio::test]
    async fn merge_waits_for_inflight_chunks() {
        let registry = Arc::new(UploadRegistry::new());
        let chunk = registry.lease_chunk("video").await.unwrap();

        let r = registry.clone();
        let merge = tokio::spawn(async move { r.lease_merge("video").await.map(|_| ()) });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!merge.is_finished());

        drop(chunk);
        merge.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_lease_keeps_progress() {
        let registry = UploadRegistry::new();
        let mut lease = registry.lease_merge("video").await.unwrap();
        lease.set_plan(1024, 3, 2560);
        lease.merged().lock().unwrap().insert(1);
        drop(lease);

        let (state, progress) = registry.snapshot("video").await.unwrap();
        assert_eq!(state, UploadState::Receiving);
        let progress = progress.unwrap();
        assert_eq!(progress.expected, 3);
        assert_eq!(progress.merged, BTreeSet::from([1]));

        let lease = registry.lease_merge("video").await.unwrap();
        assert_eq!(lease.prior(), Some(&progress));
    }

    #[tokio::test]
    async fn dropped_lease_without_progress() {
        let registry = UploadRegistry::new();
        let mut lease = registry.lease_merge("video").await.unwrap();
        lease.set_plan(1024, 3, 2560);
        drop(lease);

        assert!(registry.snapshot("video").await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn idle_keys_are_forgotten() {
        let registry = UploadRegistry::new();
        for i in 0..1000 {
            drop(registry.lease_merge(&format!("ghost{i}")).await.unwrap());
        }
        drop(registry.lease_chunk("video").await.unwrap());
        assert_eq!(registry.len(), 0);

        // a key in use stays
        let chunk = registry.lease_chunk("video").await.unwrap();
        drop(registry.lease_chunk("video").await.unwrap());
        assert_eq!(registry.len(), 1);
        let merge = tokio::spawn({
            let registry = registry.clone();
            async move { registry.lease_merge("video").await.map(drop) }
        });
        drop(chunk);
        merge.await.unwrap().unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn merged_keys_are_bounded() {
        let registry = UploadRegistry::with_done_capacity(2);
        for key in ["a", "b", "c"] {
            registry.lease_merge(key).await.unwrap().complete().await;
        }
        assert_eq!(registry.len(), 2);
        assert!(registry.snapshot("a").await.is_none());

        let err = registry.lease_merge("c").await.err().unwrap();
        assert!(matches!(err, Error::AlreadyMerged { .. }), "{err}");

        // merging a key again refreshes its place
        drop(registry.lease_chunk("b").await.unwrap());
        registry.lease_merge("b").await.unwrap().complete().await;
        registry.lease_merge("d").await.unwrap().complete().await;
        assert!(registry.snapshot("c").await.is_none());
        let (state, _) = registry.snapshot("b").await.unwrap();
        assert_eq!(state, UploadState::Done);
    }
}
