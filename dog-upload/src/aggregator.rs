use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{BlockToken, Chunk, ChunkError, UploadError};

/// Most recent failure of one chunk
#[derive(Debug, Clone)]
pub struct FailureEntry {
    pub chunk: Chunk,
    pub error: ChunkError,
}

impl FailureEntry {
    pub fn attempt(&self) -> u32 {
        self.chunk.attempt
    }
}

/// What the scheduler does after a wave drains
#[derive(Debug)]
pub enum WaveDecision {
    /// No chunk is outstanding
    Complete,
    /// Resubmit these chunks, attempt counters already advanced
    Retry(Vec<Chunk>),
    /// Stop the upload
    Abort(UploadError),
}

/// Tracks failed chunks between waves
///
/// Workers record outcomes concurrently; `decide` runs once the wave barrier is passed.
#[derive(Debug, Default)]
pub struct FailureAggregator {
    failures: DashMap<u32, FailureEntry>,
    resume_tokens: DashMap<u32, BlockToken>,
}

impl FailureAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the failure of `chunk` and the partial block state it left behind
    pub fn record_failure(&self, chunk: Chunk, error: ChunkError, partial: Option<BlockToken>) {
        let chunk_id = chunk.id;
        match partial {
            Some(token) if !error.is_invalid_context() => {
                self.resume_tokens.insert(chunk_id, token);
            }
            _ => {
                self.resume_tokens.remove(&chunk_id);
            }
        }
        self.failures.insert(chunk_id, FailureEntry { chunk, error });
    }

    /// Forget everything about a chunk that is now fully acknowledged
    pub fn record_success(&self, chunk_id: u32) {
        self.failures.remove(&chunk_id);
        self.resume_tokens.remove(&chunk_id);
    }

    /// Partial block state left by the last attempt of `chunk_id`
    pub fn resume_token(&self, chunk_id: u32) -> Option<BlockToken> {
        self.resume_tokens.get(&chunk_id).map(|entry| entry.value().clone())
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn failure(&self, chunk_id: u32) -> Option<FailureEntry> {
        self.failures.get(&chunk_id).map(|entry| entry.value().clone())
    }

    /// Decide the next step once every task of the wave has reported
    ///
    /// Cancellation wins over everything. Otherwise the first chunk, by id, whose attempts
    /// reached `max_retries` aborts the upload. Any remaining failures are drained and
    /// returned for another wave.
    pub fn decide(&self, max_retries: u32, cancelled: bool) -> WaveDecision {
        if cancelled || self.failures.iter().any(|entry| entry.error.is_cancelled()) {
            return WaveDecision::Abort(UploadError::Cancelled);
        }
        if self.failures.is_empty() {
            return WaveDecision::Complete;
        }

        let mut entries: Vec<FailureEntry> = self.failures.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by_key(|entry| entry.chunk.id);

        if let Some(exhausted) = entries.iter().find(|entry| entry.attempt() >= max_retries) {
            warn!(
                "Chunk {} exhausted {} attempts: {}",
                exhausted.chunk.id,
                exhausted.attempt(),
                exhausted.error
            );
            return WaveDecision::Abort(UploadError::MaxRetriesExceeded {
                chunk_id: exhausted.chunk.id,
                attempts: exhausted.attempt(),
                source: Box::new(exhausted.error.clone().into_upload_error(exhausted.chunk.id)),
            });
        }

        let retry: Vec<Chunk> = entries
            .into_iter()
            .map(|entry| {
                self.failures.remove(&entry.chunk.id);
                entry.chunk.next_attempt()
            })
            .collect();
        debug!("Retrying {} chunks", retry.len());
        WaveDecision::Retry(retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportError;
    use bytes::Bytes;

    fn chunk(id: u32, attempt: u32) -> Chunk {
        Chunk {
            attempt,
            ..Chunk::new(id, id as u64 * 4, Bytes::from_static(b"data"))
        }
    }

    fn transient() -> ChunkError {
        ChunkError::Transport(TransportError::status(503, "busy"))
    }

    #[test]
    fn empty_wave_completes() {
        let aggregator = FailureAggregator::new();
        assert!(matches!(aggregator.decide(3, false), WaveDecision::Complete));
    }

    #[test]
    fn failures_below_budget_are_retried_with_next_attempt() {
        let aggregator = FailureAggregator::new();
        aggregator.record_failure(chunk(2, 1), transient(), None);
        aggregator.record_failure(chunk(0, 2), ChunkError::InvalidContext, None);

        match aggregator.decide(3, false) {
            WaveDecision::Retry(chunks) => {
                let ids: Vec<(u32, u32)> = chunks.iter().map(|c| (c.id, c.attempt)).collect();
                assert_eq!(ids, vec![(0, 3), (2, 2)]);
            }
            other => panic!("unexpected decision {:?}", other),
        }
        assert_eq!(aggregator.failure_count(), 0);
    }

    #[test]
    fn exhausted_chunk_aborts_with_last_error() {
        let aggregator = FailureAggregator::new();
        aggregator.record_failure(chunk(1, 3), transient(), None);

        match aggregator.decide(3, false) {
            WaveDecision::Abort(UploadError::MaxRetriesExceeded {
                chunk_id,
                attempts,
                source,
            }) => {
                assert_eq!(chunk_id, 1);
                assert_eq!(attempts, 3);
                assert!(matches!(*source, UploadError::Transport { .. }));
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn cancellation_is_never_retried() {
        let aggregator = FailureAggregator::new();
        aggregator.record_failure(chunk(0, 1), ChunkError::Cancelled, None);
        assert!(matches!(
            aggregator.decide(3, false),
            WaveDecision::Abort(UploadError::Cancelled)
        ));

        let aggregator = FailureAggregator::new();
        aggregator.record_failure(chunk(0, 1), transient(), None);
        assert!(matches!(
            aggregator.decide(3, true),
            WaveDecision::Abort(UploadError::Cancelled)
        ));
    }

    #[test]
    fn success_removes_tracking() {
        let aggregator = FailureAggregator::new();
        let partial = BlockToken::v1("ctx".into(), 0, 2, "h".into(), 0);
        aggregator.record_failure(chunk(4, 1), transient(), Some(partial.clone()));
        assert_eq!(aggregator.resume_token(4), Some(partial));

        aggregator.record_success(4);
        assert!(aggregator.failure(4).is_none());
        assert!(aggregator.resume_token(4).is_none());
        assert!(matches!(aggregator.decide(3, false), WaveDecision::Complete));
    }

    #[test]
    fn invalid_context_drops_partial_state() {
        let aggregator = FailureAggregator::new();
        let partial = BlockToken::v1("ctx".into(), 0, 2, "h".into(), 0);
        aggregator.record_failure(chunk(1, 1), transient(), Some(partial.clone()));
        aggregator.record_failure(chunk(1, 2), ChunkError::InvalidContext, Some(partial));
        assert!(aggregator.resume_token(1).is_none());
    }
}
