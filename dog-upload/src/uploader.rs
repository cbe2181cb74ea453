use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregator::FailureAggregator;
use crate::config::MAX_PARTS;
use crate::finalizer::Finalizer;
use crate::observability::{ObservabilityLayer, UploadStats};
use crate::recorder::{RecordHeader, RecordedBlock, RecoverySession, ResumableRecorder, SessionKey};
use crate::scheduler::{ChunkTaskContext, WaveScheduler};
use crate::token::HostResolver;
use crate::transport::{block_transport, BlockTransport, RequestTransport, SessionHandle, UploadTarget};
use crate::{
    BlockToken, CompletedBlock, FailureClass, ObjectParams, Protocol, UpToken, UploadConfig, UploadError, UploadEvent,
    UploadId, UploadOutcome, UploadProgress, UploadResult, UploadSource, WorkerPool,
};

/// Chunked, resumable uploads into one bucket
///
/// Cheap to share behind an `Arc`; every `put` is independent. Without [`with_pool`] each
/// `put` spins up its own worker pool and shuts it down when done.
///
/// [`with_pool`]: ResumableUploader::with_pool
pub struct ResumableUploader {
    client: Arc<dyn RequestTransport>,
    token: UpToken,
    resolver: Arc<dyn HostResolver>,
    config: UploadConfig,
    pool: Option<Arc<WorkerPool>>,
    recorder: Option<Arc<dyn ResumableRecorder>>,
    block_transport: Option<Arc<dyn BlockTransport>>,
    observability: ObservabilityLayer,
}

impl ResumableUploader {
    pub fn new(
        client: Arc<dyn RequestTransport>,
        token: UpToken,
        resolver: Arc<dyn HostResolver>,
        config: UploadConfig,
    ) -> Self {
        Self {
            client,
            token,
            resolver,
            config: config.normalized(),
            pool: None,
            recorder: None,
            block_transport: None,
            observability: ObservabilityLayer::new(),
        }
    }

    /// Run chunk uploads on a shared pool
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Persist progress so an interrupted upload of the same content can resume
    pub fn with_recorder(mut self, recorder: Arc<dyn ResumableRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Replace the protocol transport selected from the config
    pub fn with_block_transport(mut self, transport: Arc<dyn BlockTransport>) -> Self {
        self.block_transport = Some(transport);
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn token(&self) -> &UpToken {
        &self.token
    }

    /// Subscribe to events of every upload from now on
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.observability.subscribe()
    }

    /// Event stream; events missed by a slow consumer are skipped
    pub fn events(&self) -> impl Stream<Item = UploadEvent> + Send + 'static {
        self.observability.events()
    }

    pub fn stats(&self) -> &UploadStats {
        self.observability.stats()
    }

    /// Upload `source` as one object
    pub async fn put(&self, params: ObjectParams, source: UploadSource) -> UploadResult<UploadOutcome> {
        self.put_with_cancel(params, source, CancellationToken::new()).await
    }

    /// Upload `source`, stopping early once `cancel` fires
    ///
    /// Cancellation stops new chunk dispatch and prevents finalization. Calls already in
    /// flight are allowed to finish.
    pub async fn put_with_cancel(
        &self,
        params: ObjectParams,
        source: UploadSource,
        cancel: CancellationToken,
    ) -> UploadResult<UploadOutcome> {
        let upload_id = UploadId::new();
        let result = self.run(&upload_id, params, source, cancel).await;
        if let Err(err) = &result {
            warn!("Upload {} aborted: {}", upload_id, err);
            self.observability.record_aborted(&upload_id, err);
        }
        result
    }

    #[instrument(skip_all, fields(upload_id = %upload_id, bucket = %self.token.bucket()))]
    async fn run(
        &self,
        upload_id: &UploadId,
        params: ObjectParams,
        source: UploadSource,
        cancel: CancellationToken,
    ) -> UploadResult<UploadOutcome> {
        let config = &self.config;
        config.validate()?;
        if self.token.is_expired_at(chrono::Utc::now().timestamp()) {
            return Err(UploadError::token("upload token has expired"));
        }
        let size = source.size();
        if let Some(size) = size {
            if config.protocol == Protocol::V2 && size.div_ceil(config.chunk_size) > MAX_PARTS {
                return Err(UploadError::invalid(format!(
                    "{} bytes in {} byte parts exceeds {} parts",
                    size, config.chunk_size, MAX_PARTS
                )));
            }
        }

        let key = params.key.clone().or_else(|| self.token.key().map(str::to_string));
        let host = self
            .resolver
            .resolve(self.token.access_key(), self.token.bucket())
            .await?;
        let target = UploadTarget {
            token: self.token.clone(),
            host,
            key: key.clone(),
        };
        let transport = self.block_transport.clone().unwrap_or_else(|| {
            block_transport(config.protocol, self.client.clone(), config.effective_slice_size())
        });

        let fingerprint = params
            .fingerprint
            .clone()
            .or_else(|| source.fingerprint().map(str::to_string));
        let recovery = match (&self.recorder, &fingerprint) {
            (Some(recorder), Some(fingerprint)) => {
                let header = RecordHeader::new(
                    self.token.bucket(),
                    key.as_deref(),
                    fingerprint,
                    transport.protocol(),
                    config.chunk_size,
                );
                let session_key = SessionKey::derive(self.token.bucket(), key.as_deref(), fingerprint);
                Some(RecoverySession::new(recorder.clone(), session_key, header))
            }
            _ => None,
        };
        let trusted = match &recovery {
            Some(recovery) => recovery.load_trusted(config.record_ttl).await,
            None => None,
        };
        let resumed_session = trusted.as_ref().and_then(|record| record.header.resumed_session());

        let mut session = self.init_session(&*transport, &target, resumed_session.as_ref(), &cancel).await?;

        let mut recovered = Vec::new();
        if let Some(recovery) = &recovery {
            let same_session = session.upload_id == resumed_session.as_ref().map(|s| s.upload_id.clone());
            match trusted {
                Some(record) if same_session => {
                    recovered = usable_blocks(record.blocks, config.chunk_size, size, transport.protocol());
                }
                _ => recovery.start(session.resumable()).await,
            }
        }

        let (pool, owned_pool) = match &self.pool {
            Some(pool) => (pool.clone(), false),
            None => (Arc::new(WorkerPool::from_config(config)), true),
        };

        let mut source = source;
        let mut reopened = false;
        let mut resumed_chunks = 0;
        let scheduled = loop {
            let progress = UploadProgress::new();
            let mut skip = HashSet::new();
            for block in recovered.drain(..) {
                skip.insert(block.offset);
                progress.insert(CompletedBlock {
                    chunk_id: (block.offset / config.chunk_size) as u32,
                    offset: block.offset,
                    size: block.size,
                    token: block.token,
                    resumed: true,
                });
            }
            if !reopened {
                resumed_chunks = progress.resumed_count() as u32;
                if resumed_chunks > 0 {
                    info!(
                        "Resuming with {} chunks ({} bytes) already acknowledged",
                        resumed_chunks,
                        progress.acknowledged_bytes()
                    );
                }
                self.observability.record_started(upload_id, size, resumed_chunks);
            }

            let replay = if reopened { None } else { source.try_clone() };
            let context = Arc::new(ChunkTaskContext {
                upload_id: upload_id.clone(),
                transport: transport.clone(),
                session: session.clone(),
                aggregator: FailureAggregator::new(),
                progress,
                observability: self.observability.clone(),
                recovery: recovery.clone(),
                cancel: cancel.clone(),
            });
            let mut chunks = source.into_chunks(config.chunk_size, skip, cancel.clone());
            let scheduler = WaveScheduler::new(pool.clone(), context.clone(), config.max_retries);

            match scheduler.run(&mut chunks).await {
                Ok(()) => break Ok((context, chunks)),
                Err(err)
                    if transport.protocol() == Protocol::V2 && err.root_class() == FailureClass::InvalidContext =>
                {
                    // Parts recorded under a dead upload id are useless
                    let Some(replay) = replay else {
                        if let Some(recovery) = &recovery {
                            recovery.discard().await;
                        }
                        break Err(err);
                    };
                    warn!("Multipart upload is gone, reopening and uploading every part again: {}", err);
                    session = match self.init_session(&*transport, &target, None, &cancel).await {
                        Ok(session) => session,
                        Err(err) => break Err(err),
                    };
                    if let Some(recovery) = &recovery {
                        recovery.start(session.resumable()).await;
                    }
                    source = replay;
                    resumed_chunks = 0;
                    reopened = true;
                }
                Err(err) => break Err(err),
            }
        };
        if owned_pool {
            pool.shutdown().await;
        }
        let (context, chunks) = scheduled?;

        let total_chunks = chunks.discovered_chunks();
        let total_size = chunks.bytes_seen();
        let response = Finalizer::new(transport)
            .finalize(&context.session, &params, &context.progress, total_chunks, total_size, &cancel)
            .await?;

        if let Some(recovery) = &context.recovery {
            recovery.discard().await;
        }
        self.observability.record_finalized(upload_id, total_size, total_chunks);
        info!("Uploaded {} bytes in {} chunks", total_size, total_chunks);

        Ok(UploadOutcome {
            upload_id: upload_id.clone(),
            response,
            size: total_size,
            chunks: total_chunks,
            resumed_chunks,
        })
    }

    /// Open the transport session, retrying within the chunk attempt budget
    async fn init_session(
        &self,
        transport: &dyn BlockTransport,
        target: &UploadTarget,
        resumed: Option<&crate::transport::ResumedSession>,
        cancel: &CancellationToken,
    ) -> UploadResult<SessionHandle> {
        let attempts = self.config.max_retries.max(1);
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            match transport.init(target, resumed).await {
                Ok(session) => return Ok(session),
                Err(err) if attempt < attempts && matches!(err, UploadError::Transport { .. }) => {
                    warn!("Opening upload failed on attempt {}: {}", attempt, err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(UploadError::invalid("upload session could not be opened"))
    }
}

/// Recorded blocks that line up with how this upload partitions the source
fn usable_blocks(blocks: Vec<RecordedBlock>, chunk_size: u64, size: Option<u64>, protocol: Protocol) -> Vec<RecordedBlock> {
    blocks
        .into_iter()
        .filter(|block| {
            let protocol_matches = matches!(
                (&block.token, protocol),
                (BlockToken::V1 { .. }, Protocol::V1) | (BlockToken::V2 { .. }, Protocol::V2)
            );
            let aligned = block.offset % chunk_size == 0 && block.size > 0 && block.size <= chunk_size;
            let fits = match size {
                Some(size) => block.offset < size && block.size == chunk_size.min(size - block.offset),
                None => true,
            };
            protocol_matches && aligned && fits && block.token.is_complete(block.size)
        })
        .collect()
}
