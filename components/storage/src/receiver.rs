use std::sync::Arc;

use bytes::Bytes;
use snafu::ResultExt;
use stitch_common::{parse_chunk_index, upload_key, validate_name};
use tracing::{debug, instrument};

use crate::{
    err::{InvalidNameSnafu, Result},
    registry::UploadRegistry,
    store::ChunkStoreRef,
};

/// Persists uploaded chunks into their staging directory.
pub struct ChunkReceiver {
    store:    ChunkStoreRef,
    registry: Arc<UploadRegistry>,
}

impl ChunkReceiver {
    pub fn new(store: ChunkStoreRef, registry: Arc<UploadRegistry>) -> Self {
        Self { store, registry }
    }

    /// Stages `data` as chunk `identifier` of `filename`.
    ///
    /// Uploading the same identifier again replaces the earlier bytes.
    #[instrument(level = "debug", skip_all, fields(filename = filename, identifier = identifier, len = data.len()))]
    pub async fn receive(&self, filename: &str, identifier: &str, data: Bytes) -> Result<()> {
        let key = upload_key(filename).context(InvalidNameSnafu)?;
        validate_name("chunk identifier", identifier).context(InvalidNameSnafu)?;
        let index = parse_chunk_index(identifier).context(InvalidNameSnafu)?;

        let _lease = self.registry.lease_chunk(key).await?;
        self.store.ensure(key).await?;
        self.store.put(key, identifier, data).await?;
        debug!("received chunk {index} of {key}");
        Ok(())
    }
}
