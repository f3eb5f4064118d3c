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

mod config;
mod engine;
mod err;
mod merge;
mod output;
mod receiver;
mod registry;
mod store;

pub use config::Config;
pub use engine::{UploadEngine, UploadEngineRef, UploadStatus};
pub use err::{Error, ErrorKind, Result, MAX_REPORTED_MISSING};
pub use merge::{MergeCoordinator, MergeReport};
pub use receiver::ChunkReceiver;
pub use registry::{ChunkLease, MergeLease, MergeProgress, UploadRegistry, UploadState};
pub use store::{ChunkReader, ChunkStore, ChunkStoreRef, LocalChunkStore, StagedChunk};
