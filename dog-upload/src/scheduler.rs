use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::aggregator::{FailureAggregator, WaveDecision};
use crate::observability::ObservabilityLayer;
use crate::recorder::{RecordedBlock, RecoverySession};
use crate::source::ChunkSource;
use crate::transport::{BlockTransport, SessionHandle};
use crate::{Chunk, ChunkError, CompletedBlock, UploadError, UploadId, UploadProgress, UploadResult, WorkerPool};

/// State shared by every chunk task of one upload
pub struct ChunkTaskContext {
    pub upload_id: UploadId,
    pub transport: Arc<dyn BlockTransport>,
    pub session: SessionHandle,
    pub aggregator: FailureAggregator,
    pub progress: UploadProgress,
    pub observability: ObservabilityLayer,
    pub recovery: Option<RecoverySession>,
    pub cancel: CancellationToken,
}

impl ChunkTaskContext {
    /// Upload one chunk and report the outcome
    async fn run_chunk(&self, chunk: Chunk) {
        if self.cancel.is_cancelled() {
            self.aggregator.record_failure(chunk, ChunkError::Cancelled, None);
            return;
        }

        let mut token = self.aggregator.resume_token(chunk.id);
        match self.transport.upload_chunk(&self.session, &chunk, &mut token, &self.cancel).await {
            Ok(block) => {
                let size = chunk.len();
                self.aggregator.record_success(chunk.id);
                self.progress.insert(CompletedBlock {
                    chunk_id: chunk.id,
                    offset: chunk.offset,
                    size,
                    token: block.clone(),
                    resumed: false,
                });
                if let Some(recovery) = &self.recovery {
                    recovery
                        .record(RecordedBlock {
                            offset: chunk.offset,
                            size,
                            token: block,
                            uploaded_at: chrono::Utc::now().timestamp(),
                        })
                        .await;
                }
                self.observability
                    .record_chunk_completed(&self.upload_id, chunk.id, chunk.offset, size, chunk.attempt);
            }
            Err(err) => {
                warn!("Chunk {} attempt {} failed: {}", chunk.id, chunk.attempt, err);
                self.observability
                    .record_chunk_failed(&self.upload_id, chunk.id, chunk.attempt, &err.to_string());
                self.aggregator.record_failure(chunk, err, token);
            }
        }
    }
}

/// Runs chunk uploads in synchronized waves
///
/// Wave 1 drains the chunk source. Every later wave resubmits exactly the chunks the
/// aggregator hands back, so a chunk is attempted at most `max_retries` times.
pub struct WaveScheduler {
    pool: Arc<WorkerPool>,
    context: Arc<ChunkTaskContext>,
    max_retries: u32,
}

impl WaveScheduler {
    pub fn new(pool: Arc<WorkerPool>, context: Arc<ChunkTaskContext>, max_retries: u32) -> Self {
        Self {
            pool,
            context,
            max_retries: max_retries.max(1),
        }
    }

    async fn submit(&self, chunk: Chunk, done: &mpsc::UnboundedSender<u32>) -> UploadResult<()> {
        let context = self.context.clone();
        let done = done.clone();
        self.pool
            .submit(async move {
                let chunk_id = chunk.id;
                context.run_chunk(chunk).await;
                let _ = done.send(chunk_id);
            })
            .await
    }

    /// Upload every chunk of `source`, returning once all are acknowledged
    #[instrument(skip_all, fields(upload_id = %self.context.upload_id, max_retries = self.max_retries))]
    pub async fn run(&self, source: &mut ChunkSource) -> UploadResult<()> {
        let mut pending: Vec<Chunk> = Vec::new();

        for wave in 1..=self.max_retries {
            let (done_tx, mut done_rx) = mpsc::unbounded_channel();
            let mut submitted = 0usize;
            let mut stop: Option<UploadError> = None;

            if wave == 1 {
                loop {
                    match source.next_chunk().await {
                        Ok(Some(chunk)) => match self.submit(chunk, &done_tx).await {
                            Ok(()) => submitted += 1,
                            Err(err) => {
                                stop = Some(err);
                                break;
                            }
                        },
                        Ok(None) => break,
                        Err(err) => {
                            stop = Some(err);
                            break;
                        }
                    }
                }
            } else {
                for chunk in pending.drain(..) {
                    if self.context.cancel.is_cancelled() {
                        stop = Some(UploadError::Cancelled);
                        break;
                    }
                    if let Err(err) = self.submit(chunk, &done_tx).await {
                        stop = Some(err);
                        break;
                    }
                    submitted += 1;
                }
            }
            drop(done_tx);

            // Barrier: in-flight tasks always finish before the wave is judged
            let mut finished = 0usize;
            while finished < submitted {
                match done_rx.recv().await {
                    Some(_) => finished += 1,
                    None => break,
                }
            }
            debug!("Wave {} drained: {} of {} tasks reported", wave, finished, submitted);

            if let Some(err) = stop {
                return Err(err);
            }
            if finished < submitted {
                return Err(UploadError::invalid(format!(
                    "{} chunk tasks of wave {} ended without reporting",
                    submitted - finished,
                    wave
                )));
            }

            match self.context.aggregator.decide(self.max_retries, self.context.cancel.is_cancelled()) {
                WaveDecision::Complete => return Ok(()),
                WaveDecision::Abort(err) => return Err(err),
                WaveDecision::Retry(chunks) => {
                    let ids = chunks.iter().map(|chunk| chunk.id).collect();
                    self.context.observability.record_retrying(&self.context.upload_id, wave + 1, ids);
                    pending = chunks;
                }
            }
        }

        // Chunks in wave `n` are on attempt `n`, so the last wave always completes or aborts
        Err(UploadError::invalid("retry waves exhausted without a decision"))
    }
}
