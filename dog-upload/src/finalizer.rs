use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::transport::{BlockTransport, SessionHandle};
use crate::{ObjectParams, UploadError, UploadProgress, UploadResult};

/// Issues the single create-object call once every chunk is acknowledged
pub struct Finalizer {
    transport: Arc<dyn BlockTransport>,
}

impl Finalizer {
    pub fn new(transport: Arc<dyn BlockTransport>) -> Self {
        Self { transport }
    }

    /// Assemble the blocks `0..chunks` in ascending order into one object
    ///
    /// Never retried: the blocks are already accepted, and the response may come from a
    /// callback with side effects. Any failure here is wrapped in [`UploadError::Finalize`].
    #[instrument(skip_all, fields(chunks = chunks, size = total_size))]
    pub async fn finalize(
        &self,
        session: &SessionHandle,
        params: &ObjectParams,
        progress: &UploadProgress,
        chunks: u32,
        total_size: u64,
        cancel: &CancellationToken,
    ) -> UploadResult<serde_json::Value> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let tokens = progress.ordered_tokens(chunks).map_err(UploadError::finalize)?;
        let response = self
            .transport
            .complete(session, params, total_size, tokens)
            .await
            .map_err(UploadError::finalize)?;

        info!("Object created from {} blocks", chunks);
        Ok(response)
    }
}
