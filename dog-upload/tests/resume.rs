mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use common::{body_starts_with, patterned, sha256_hex, up_token, FakeObjectService, FaultAction, BUCKET, HOST};
use dog_upload::{
    FailureClass, FileRecorder, MemoryRecorder, Method, ObjectParams, Protocol, ResumableRecorder, ResumableUploader,
    SessionKey, StaticHosts, UploadConfig, UploadSource,
};

const MIB: usize = 1024 * 1024;

fn uploader(
    service: &Arc<FakeObjectService>,
    recorder: Arc<dyn ResumableRecorder>,
    config: UploadConfig,
) -> ResumableUploader {
    ResumableUploader::new(service.clone(), up_token(), Arc::new(StaticHosts::single(HOST)), config)
        .with_recorder(recorder)
}

fn params(key: &str, fingerprint: &str) -> ObjectParams {
    ObjectParams::new().with_key(key).with_fingerprint(fingerprint)
}

/// A second put of the same content only uploads what the first one missed
#[tokio::test]
async fn test_resume_skips_acknowledged_blocks() {
    let chunk = 64 * 1024;
    let data = patterned(4 * chunk, chunk);
    let service = FakeObjectService::new();
    let recorder = Arc::new(MemoryRecorder::new());
    let config = UploadConfig::new().with_chunk_size(chunk as u64).with_max_retries(2);
    service.inject(2, FaultAction::Status(503), body_starts_with(&data[2 * chunk..3 * chunk]));

    let err = uploader(&service, recorder.clone(), config.clone())
        .put(params("video.bin", "video:v1"), UploadSource::from_bytes(data.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.class(), FailureClass::MaxRetriesExceeded);
    assert_eq!(service.block_calls.load(Ordering::SeqCst), 3);

    let session = SessionKey::derive(BUCKET, Some("video.bin"), "video:v1");
    let record = recorder.load(&session).await.unwrap().unwrap();
    let mut offsets = record.offsets();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, chunk as u64, 3 * chunk as u64]);

    let resumed = uploader(&service, recorder.clone(), config);
    let outcome = resumed
        .put(params("video.bin", "video:v1"), UploadSource::from_bytes(data.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.resumed_chunks, 3);
    assert_eq!(outcome.chunks, 4);
    assert_eq!(service.block_calls.load(Ordering::SeqCst), 4);
    assert_eq!(service.object("video.bin").unwrap(), Bytes::from(data.clone()));
    assert_eq!(outcome.put_ret().unwrap().hash, Some(sha256_hex(&data)));
    assert_eq!(resumed.stats().chunks_resumed(), 3);
    assert!(recorder.load(&session).await.unwrap().is_none());
}

/// A changed fingerprint never reuses blocks recorded for other content
#[tokio::test]
async fn test_fingerprint_change_restarts_from_zero() {
    let chunk = 64 * 1024;
    let old = patterned(3 * chunk, chunk);
    let service = FakeObjectService::new();
    let recorder = Arc::new(MemoryRecorder::new());
    let config = UploadConfig::new().with_chunk_size(chunk as u64).with_max_retries(1);
    service.inject(1, FaultAction::Status(503), body_starts_with(&old[chunk..2 * chunk]));

    uploader(&service, recorder.clone(), config.clone())
        .put(params("doc", "doc:v1"), UploadSource::from_bytes(old))
        .await
        .unwrap_err();
    assert_eq!(recorder.len(), 1);

    let new: Vec<u8> = patterned(3 * chunk, chunk).iter().map(|b| b ^ 0xff).collect();
    let before = service.block_calls.load(Ordering::SeqCst);
    let outcome = uploader(&service, recorder.clone(), config)
        .put(params("doc", "doc:v2"), UploadSource::from_bytes(new.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.resumed_chunks, 0);
    assert_eq!(service.block_calls.load(Ordering::SeqCst) - before, 3);
    assert_eq!(service.object("doc").unwrap(), Bytes::from(new));
}

#[tokio::test]
async fn test_without_fingerprint_nothing_is_recorded() {
    let chunk = 64 * 1024;
    let data = patterned(2 * chunk, chunk);
    let service = FakeObjectService::new();
    let recorder = Arc::new(MemoryRecorder::new());
    service.inject(1, FaultAction::Status(503), body_starts_with(&data[chunk..]));

    uploader(&service, recorder.clone(), UploadConfig::new().with_chunk_size(chunk as u64).with_max_retries(1))
        .put(ObjectParams::new().with_key("plain"), UploadSource::from_bytes(data))
        .await
        .unwrap_err();
    assert!(recorder.is_empty());
}

/// Parts recorded on disk are reused together with their multipart upload id
#[tokio::test]
async fn test_v2_resume_from_file_record_reuses_upload_id() {
    let dir = tempfile::tempdir().unwrap();
    let chunk = MIB;
    let data = patterned(3 * chunk, chunk);
    let service = FakeObjectService::new();
    let config = UploadConfig::new()
        .with_chunk_size(chunk as u64)
        .with_protocol(Protocol::V2)
        .with_max_retries(2);
    service.inject(2, FaultAction::Status(503), body_starts_with(&data[chunk..2 * chunk]));

    uploader(&service, Arc::new(FileRecorder::new(dir.path())), config.clone())
        .put(params("parts.bin", "parts:v1"), UploadSource::from_bytes(data.clone()))
        .await
        .unwrap_err();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

    let outcome = uploader(&service, Arc::new(FileRecorder::new(dir.path())), config)
        .put(params("parts.bin", "parts:v1"), UploadSource::from_bytes(data.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.resumed_chunks, 2);
    assert_eq!(service.init_calls.load(Ordering::SeqCst), 1);
    assert_eq!(service.block_calls.load(Ordering::SeqCst), 3);
    assert_eq!(service.object("parts.bin").unwrap(), Bytes::from(data));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// A recorded multipart upload the service has since dropped is reopened from scratch
#[tokio::test]
async fn test_expired_multipart_upload_is_reopened_on_resume() {
    let chunk = MIB;
    let data = patterned(3 * chunk, chunk);
    let service = FakeObjectService::new();
    let recorder = Arc::new(MemoryRecorder::new());
    let config = UploadConfig::new()
        .with_chunk_size(chunk as u64)
        .with_protocol(Protocol::V2)
        .with_max_retries(2);
    service.inject(2, FaultAction::Status(503), body_starts_with(&data[chunk..2 * chunk]));

    uploader(&service, recorder.clone(), config.clone())
        .put(params("gone", "gone:v1"), UploadSource::from_bytes(data.clone()))
        .await
        .unwrap_err();
    assert_eq!(recorder.len(), 1);

    service.forget_uploads();
    let outcome = uploader(&service, recorder.clone(), config)
        .put(params("gone", "gone:v1"), UploadSource::from_bytes(data.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.resumed_chunks, 0);
    assert_eq!(service.init_calls.load(Ordering::SeqCst), 2);
    assert_eq!(service.object("gone").unwrap(), Bytes::from(data));
    assert!(recorder.is_empty());
}

/// A stream cannot be read twice, so a dead multipart upload aborts and drops the record
#[tokio::test]
async fn test_dead_multipart_upload_of_stream_discards_record() {
    let chunk = MIB;
    let data = patterned(2 * chunk, chunk);
    let service = FakeObjectService::new();
    let recorder = Arc::new(MemoryRecorder::new());
    let config = UploadConfig::new()
        .with_chunk_size(chunk as u64)
        .with_protocol(Protocol::V2)
        .with_max_retries(2);
    service.inject(u32::MAX, FaultAction::Status(612), |request| matches!(request.method, Method::Put));

    let err = uploader(&service, recorder.clone(), config)
        .put(params("live", "live:v1"), UploadSource::stream(std::io::Cursor::new(data)))
        .await
        .unwrap_err();

    assert_eq!(err.root_class(), FailureClass::InvalidContext);
    assert_eq!(service.init_calls.load(Ordering::SeqCst), 1);
    assert!(recorder.is_empty());
}

/// Files carry their own fingerprint, so resuming needs no caller-built identity
#[tokio::test]
async fn test_file_source_resumes_without_explicit_fingerprint() {
    let chunk = 64 * 1024;
    let data = patterned(3 * chunk, chunk);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &data).unwrap();
    let service = FakeObjectService::new();
    let recorder = Arc::new(MemoryRecorder::new());
    let config = UploadConfig::new().with_chunk_size(chunk as u64).with_max_retries(1);
    service.inject(1, FaultAction::Status(503), body_starts_with(&data[2 * chunk..]));

    uploader(&service, recorder.clone(), config.clone())
        .put(ObjectParams::new().with_key("file.bin"), UploadSource::from_file(file.path()).await.unwrap())
        .await
        .unwrap_err();
    assert_eq!(recorder.len(), 1);

    let outcome = uploader(&service, recorder.clone(), config)
        .put(ObjectParams::new().with_key("file.bin"), UploadSource::from_file(file.path()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(outcome.resumed_chunks, 2);
    assert_eq!(service.object("file.bin").unwrap(), Bytes::from(data));
    assert!(recorder.is_empty());
}
