use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use stitch_common::{
    COPY_BUFFER_SIZE, COPY_TIMEOUT_SECS, MAX_CONCURRENT_COPIES, STITCH_DEBUG_UPLOAD_DIR,
};
use stitch_utils::readable_size::ReadableSize;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The root upload directory. Staging directories live right below it,
    /// so do merged files.
    pub upload_dir: PathBuf,

    // ========Merge Configs ===>
    /// How many chunks of one merge are copied at the same time.
    pub max_concurrent_copies: usize,
    /// Upper bound for copying a single chunk, in seconds. Zero disables it.
    pub copy_timeout_secs:     u64,
    /// The buffer used to move chunk bytes into the output file.
    pub copy_buffer_size:      ReadableSize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upload_dir:            PathBuf::from(STITCH_DEBUG_UPLOAD_DIR),
            max_concurrent_copies: MAX_CONCURRENT_COPIES,
            copy_timeout_secs:     COPY_TIMEOUT_SECS,
            copy_buffer_size:      ReadableSize::from(COPY_BUFFER_SIZE), // 256KiB
        }
    }
}

impl Config {
    pub fn with_upload_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.upload_dir = dir.into();
        self
    }

    pub fn copy_timeout(&self) -> Option<Duration> {
        (self.copy_timeout_secs > 0).then(|| Duration::from_secs(self.copy_timeout_secs))
    }

    pub(crate) fn copy_concurrency(&self) -> usize { self.max_concurrent_copies.max(1) }

    pub(crate) fn copy_buffer_len(&self) -> usize { self.copy_buffer_size.as_bytes_usize().max(1) }
}
