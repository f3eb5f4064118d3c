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

use serde::{Deserialize, Serialize};
use stitch_common::{DEFAULT_LISTEN_ADDR, MAX_CHUNK_SIZE};
use stitch_storage::Config as StorageConfig;
use stitch_utils::{num_cpus, readable_size::ReadableSize};

/// Multipart framing on top of the chunk bytes.
const MULTIPART_OVERHEAD: usize = 64 << 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen:         String,
    /// HTTP worker threads.
    pub workers:        usize,
    /// The largest chunk an upload request may carry.
    pub max_chunk_size: ReadableSize,
    pub storage:        StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen:         DEFAULT_LISTEN_ADDR.to_string(),
            workers:        num_cpus::get(),
            max_chunk_size: ReadableSize::from(MAX_CHUNK_SIZE),
            storage:        StorageConfig::default(),
        }
    }
}

impl ServerConfig {
    pub(crate) fn upload_limit(&self) -> usize {
        self.max_chunk_size
            .as_bytes_usize()
            .saturating_add(MULTIPART_OVERHEAD)
    }
}
