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

use snafu::{ensure, OptionExt, Snafu};

pub const STITCH: &str = "stitch";
pub const STITCH_DEBUG_UPLOAD_DIR: &str = "/tmp/stitch.upload";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7400";

// The max size of one uploaded chunk the http layer accepts.
pub const MAX_CHUNK_SIZE: usize = 64 << 20; // 64 MiB
// The buffer size used when copying a staged chunk into the output file.
pub const COPY_BUFFER_SIZE: usize = 256 << 10; // 256 KiB
pub const MAX_CONCURRENT_COPIES: usize = 16;
pub const COPY_TIMEOUT_SECS: u64 = 60;

/// Separates the opaque hash from the ordinal in a chunk identifier.
pub const INDEX_SEPARATOR: char = '-';
/// Separates the upload key from the extension(s) in a filename.
pub const EXTENSION_SEPARATOR: char = '.';
pub const PARTIAL_SUFFIX: &str = ".partial";

pub type ChunkIndex = u64;
pub type ChunkSize = u64;
pub type FileOffset = u64;

/// Byte offset of chunk `idx` in the output file, `None` on overflow.
pub fn cal_chunk_offset(idx: ChunkIndex, chunk_size: ChunkSize) -> Option<FileOffset> {
    idx.checked_mul(chunk_size)
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum NameError {
    #[snafu(display("{kind} must not be empty"))]
    EmptyName { kind: &'static str },

    #[snafu(display("{kind} {name:?} is not a plain file name"))]
    InvalidName { kind: &'static str, name: String },

    #[snafu(display("filename {filename:?} has an empty upload key"))]
    EmptyUploadKey { filename: String },

    #[snafu(display("chunk identifier {identifier:?} does not end with -<index>"))]
    MissingIndex { identifier: String },
}

/// Checks that `name` can be used as a single entry of a directory.
///
/// Names starting with a dot are reserved for the in-progress merge output.
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), NameError> {
    ensure!(!name.is_empty(), EmptyNameSnafu { kind });
    let plain = !name.starts_with('.')
        && !name.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
    ensure!(plain, InvalidNameSnafu { kind, name });
    Ok(())
}

/// Derives the upload key from the target filename: the part before the
/// first extension separator, so `video.mp4` and `video.tar.gz` both map to
/// `video`.
pub fn upload_key(filename: &str) -> Result<&str, NameError> {
    validate_name("filename", filename)?;
    let key = filename
        .split(EXTENSION_SEPARATOR)
        .next()
        .unwrap_or_default();
    ensure!(!key.is_empty(), EmptyUploadKeySnafu { filename });
    Ok(key)
}

/// Extracts the trailing ordinal of a `<hash>-<index>` chunk identifier.
pub fn parse_chunk_index(identifier: &str) -> Result<ChunkIndex, NameError> {
    let (hash, index) = identifier
        .rsplit_once(INDEX_SEPARATOR)
        .context(MissingIndexSnafu { identifier })?;
    ensure!(
        !hash.is_empty() && !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()),
        MissingIndexSnafu { identifier }
    );
    index
        .parse::<ChunkIndex>()
        .ok()
        .context(MissingIndexSnafu { identifier })
}

/// The hidden name the merge output is built under before it is renamed
/// into place.
pub fn partial_name(filename: &str) -> String { format!(".{filename}{PARTIAL_SUFFIX}") }
