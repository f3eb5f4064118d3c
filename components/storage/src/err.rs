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

use std::{path::PathBuf, time::Duration};

use snafu::{Location, Snafu};
use stitch_common::{ChunkIndex, NameError};

/// How far the missing chunk list of [Error::IncompleteUpload] is spelled
/// out.
pub const MAX_REPORTED_MISSING: usize = 32;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("bad request: {reason}"))]
    BadRequest {
        reason:   String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("bad request: {source}"))]
    InvalidName {
        source:   NameError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "chunk {identifier} of {upload_key} is {actual} bytes, expected {}{expected} bytes",
        if *last { "at most " } else { "" }
    ))]
    ChunkSizeMismatch {
        upload_key: String,
        identifier: String,
        expected:   u64,
        actual:     u64,
        last:       bool,
    },

    #[snafu(display("no staged chunks for upload {upload_key}"))]
    NotFound {
        upload_key: String,
        #[snafu(implicit)]
        location:   Location,
    },

    #[snafu(display("staging area of {upload_key} is corrupt: {reason}"))]
    CorruptState {
        upload_key: String,
        reason:     String,
        #[snafu(implicit)]
        location:   Location,
    },

    #[snafu(display(
        "upload {upload_key} is incomplete: {missing_count} of {expected} chunks missing, first missing {missing:?}"
    ))]
    IncompleteUpload {
        upload_key:    String,
        expected:      u64,
        missing_count: u64,
        missing:       Vec<ChunkIndex>,
    },

    #[snafu(display("upload {upload_key} is being merged"))]
    UploadBusy { upload_key: String },

    #[snafu(display("upload {upload_key} is already merged"))]
    AlreadyMerged { upload_key: String },

    #[snafu(display("staging directory of {upload_key} still holds {remaining} entries"))]
    NotEmpty {
        upload_key: String,
        remaining:  usize,
        #[snafu(implicit)]
        location:   Location,
    },

    #[snafu(display("copying chunk {identifier} did not finish within {timeout:?}"))]
    CopyTimeout {
        identifier: String,
        timeout:    Duration,
    },

    #[snafu(display("io failure on {}: {source}", path.display()))]
    IoFailure {
        path:     PathBuf,
        source:   std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    JoinErr {
        #[snafu(implicit)]
        location: Location,
        source:   tokio::task::JoinError,
    },
}

/// The coarse classes callers react to, the transport maps them to status
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Incomplete,
    CorruptState,
    IoFailure,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest { .. }
            | Error::InvalidName { .. }
            | Error::ChunkSizeMismatch { .. } => ErrorKind::BadRequest,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::UploadBusy { .. } | Error::AlreadyMerged { .. } => ErrorKind::Conflict,
            Error::IncompleteUpload { .. } => ErrorKind::Incomplete,
            Error::CorruptState { .. } | Error::NotEmpty { .. } => ErrorKind::CorruptState,
            Error::CopyTimeout { .. } | Error::IoFailure { .. } | Error::JoinErr { .. } => {
                ErrorKind::IoFailure
            }
        }
    }

    pub fn is_not_found(&self) -> bool { self.kind() == ErrorKind::NotFound }
}

pub type Result<T> = std::result::Result<T, Error>;
