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

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use snafu::ResultExt;
use stitch_common::{upload_key, ChunkIndex, ChunkSize};
use tracing::{info, instrument};

use crate::{
    config::Config,
    err::{InvalidNameSnafu, NotFoundSnafu, Result},
    merge::{MergeCoordinator, MergeReport},
    receiver::ChunkReceiver,
    registry::{UploadRegistry, UploadState},
    store::{ChunkStoreRef, LocalChunkStore},
};

/// What is known about one upload key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadStatus {
    pub upload_key: String,
    pub state:      UploadState,
    /// Chunks waiting in the staging directory.
    pub staged:     Vec<ChunkIndex>,
    /// Chunks an interrupted merge already moved into the output.
    pub merged:     Vec<ChunkIndex>,
}

pub type UploadEngineRef = Arc<UploadEngine>;

/// The entry point of the service: receives chunks and merges them.
pub struct UploadEngine {
    store:       ChunkStoreRef,
    registry:    Arc<UploadRegistry>,
    receiver:    ChunkReceiver,
    coordinator: MergeCoordinator,
}

impl UploadEngine {
    /// Stages chunks on the local disk below `config.upload_dir`.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(LocalChunkStore::new(&config.upload_dir)?);
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: ChunkStoreRef) -> Self {
        let registry = Arc::new(UploadRegistry::new());
        let receiver = ChunkReceiver::new(store.clone(), registry.clone());
        let coordinator = MergeCoordinator::new(store.clone(), &config);
        info!(
            "upload engine serving {:?}, {} concurrent copies per merge",
            config.upload_dir, config.max_concurrent_copies
        );
        Self {
            store,
            registry,
            receiver,
            coordinator,
        }
    }

    pub async fn receive_chunk(
        &self,
        filename: &str,
        identifier: &str,
        data: Bytes,
    ) -> Result<()> {
        self.receiver.receive(filename, identifier, data).await
    }

    /// Reassembles `filename` from its staged chunks.
    ///
    /// The upload is closed for new chunks while the merge runs. After a
    /// failure the upload accepts chunks again and the next merge resumes
    /// where this one stopped.
    #[instrument(level = "info", skip(self))]
    pub async fn merge(&self, filename: &str, chunk_size: ChunkSize) -> Result<MergeReport> {
        let key = upload_key(filename).context(InvalidNameSnafu)?;
        let mut lease = self.registry.lease_merge(key).await?;
        let report = self.coordinator.merge(&mut lease, filename, chunk_size).await?;
        lease.complete().await;
        Ok(report)
    }

    /// Fails with not found when the key has neither staged chunks nor a
    /// tracked merge, merged keys are only tracked for a while.
    pub async fn status(&self, filename: &str) -> Result<UploadStatus> {
        let key = upload_key(filename).context(InvalidNameSnafu)?;
        let snapshot = self.registry.snapshot(key).await;
        let mut staged = if self.store.exists(key).await? {
            self.store
                .list(key)
                .await?
                .into_iter()
                .map(|c| c.index)
                .collect::<Vec<_>>()
        } else if snapshot
            .as_ref()
            .is_some_and(|(state, progress)| *state != UploadState::Receiving || progress.is_some())
        {
            vec![]
        } else {
            return NotFoundSnafu { upload_key: key }.fail();
        };
        staged.sort_unstable();

        let (state, progress) = snapshot.unwrap_or((UploadState::Receiving, None));
        Ok(UploadStatus {
            upload_key: key.to_string(),
            state,
            staged,
            merged: progress
                .map(|p| p.merged.into_iter().collect())
                .unwrap_or_default(),
        })
    }
}
