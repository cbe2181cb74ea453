use std::collections::HashSet;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{Chunk, UploadError, UploadResult};

/// Random-access byte source of known length
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes>;
}

fn slice_at(data: &Bytes, offset: u64, len: usize) -> io::Result<Bytes> {
    let start = usize::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    let end = start.saturating_add(len);
    if end > data.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("range {}..{} past end of {} bytes", start, end, data.len()),
        ));
    }
    Ok(data.slice(start..end))
}

#[async_trait]
impl ReadAt for Bytes {
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        slice_at(self, offset, len)
    }
}

#[async_trait]
impl ReadAt for Vec<u8> {
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let start = usize::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let end = start.saturating_add(len);
        self.get(start..end)
            .map(Bytes::copy_from_slice)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
    }
}

/// File opened for positioned reads
pub struct FileReadAt {
    file: Mutex<File>,
}

impl FileReadAt {
    pub fn new(file: File) -> Self {
        Self { file: Mutex::new(file) }
    }

    /// Open `path`, returning the reader and the file length
    pub async fn open(path: impl AsRef<Path>) -> io::Result<(Self, u64)> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok((Self::new(file), size))
    }
}

#[async_trait]
impl ReadAt for FileReadAt {
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Input of a `put`
pub enum UploadSource {
    /// Random-access reader with a known length
    Sized {
        reader: Arc<dyn ReadAt>,
        size: u64,
        fingerprint: Option<String>,
    },
    /// Forward-only stream of unknown length
    Stream { reader: Box<dyn AsyncRead + Send + Unpin> },
}

impl UploadSource {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let size = data.len() as u64;
        Self::Sized {
            reader: Arc::new(data),
            size,
            fingerprint: None,
        }
    }

    pub fn sized(reader: Arc<dyn ReadAt>, size: u64) -> Self {
        Self::Sized {
            reader,
            size,
            fingerprint: None,
        }
    }

    pub fn stream<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> Self {
        Self::Stream {
            reader: Box::new(reader),
        }
    }

    /// Open a file, fingerprinted by path, length and modification time
    pub async fn from_file(path: impl AsRef<Path>) -> UploadResult<Self> {
        let path = path.as_ref();
        let (reader, size) = FileReadAt::open(path).await?;
        let modified = tokio::fs::metadata(path)
            .await?
            .modified()
            .ok()
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let path = tokio::fs::canonicalize(path).await.unwrap_or_else(|_| path.to_path_buf());
        Ok(Self::Sized {
            reader: Arc::new(reader),
            size,
            fingerprint: Some(format!("{}:{}:{}", path.display(), size, modified)),
        })
    }

    /// Identity of the content, used to find progress of an earlier upload
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::Sized { fingerprint, .. } => fingerprint.as_deref(),
            Self::Stream { .. } => None,
        }
    }

    /// Second handle to the same content; streams cannot be read twice
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Sized {
                reader,
                size,
                fingerprint,
            } => Some(Self::Sized {
                reader: reader.clone(),
                size: *size,
                fingerprint: fingerprint.clone(),
            }),
            Self::Stream { .. } => None,
        }
    }

    /// Total length when known up front
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::Sized { size, .. } => Some(*size),
            Self::Stream { .. } => None,
        }
    }

    /// Start chunking, skipping chunks whose offset is in `recovered`
    pub fn into_chunks(self, chunk_size: u64, recovered: HashSet<u64>, cancel: CancellationToken) -> ChunkSource {
        match self {
            Self::Sized { reader, size, .. } => {
                ChunkSource::Sized(SizedChunkSource::new(reader, size, chunk_size, recovered, cancel))
            }
            Self::Stream { reader } => {
                ChunkSource::Stream(StreamChunkSource::new(reader, chunk_size, recovered, cancel))
            }
        }
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sized { size, .. } => f.debug_struct("Sized").field("size", size).finish(),
            Self::Stream { .. } => f.debug_struct("Stream").finish_non_exhaustive(),
        }
    }
}

/// Partitions `[0, size)` into `chunk_size` ranges
pub struct SizedChunkSource {
    reader: Arc<dyn ReadAt>,
    size: u64,
    chunk_size: u64,
    next_offset: u64,
    next_id: u32,
    recovered: HashSet<u64>,
    cancel: CancellationToken,
}

impl SizedChunkSource {
    pub fn new(
        reader: Arc<dyn ReadAt>,
        size: u64,
        chunk_size: u64,
        recovered: HashSet<u64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            size,
            chunk_size: chunk_size.max(1),
            next_offset: 0,
            next_id: 0,
            recovered,
            cancel,
        }
    }

    /// Number of chunks the source partitions into, emitted or skipped
    pub fn total_chunks(&self) -> u32 {
        self.size.div_ceil(self.chunk_size) as u32
    }

    pub async fn next_chunk(&mut self) -> UploadResult<Option<Chunk>> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if self.next_offset >= self.size {
                return Ok(None);
            }

            let offset = self.next_offset;
            let len = self.chunk_size.min(self.size - offset);
            let id = self.next_id;
            self.next_offset += len;
            self.next_id += 1;

            if self.recovered.contains(&offset) {
                continue;
            }

            let data = self.reader.read_at(offset, len as usize).await?;
            if data.len() as u64 != len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read {} of {} bytes at offset {}", data.len(), len, offset),
                )
                .into());
            }
            return Ok(Some(Chunk::new(id, offset, data)));
        }
    }
}

/// Reads a forward-only stream `chunk_size` bytes at a time
pub struct StreamChunkSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    chunk_size: usize,
    next_offset: u64,
    next_id: u32,
    finished: bool,
    recovered: HashSet<u64>,
    cancel: CancellationToken,
}

impl StreamChunkSource {
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        chunk_size: u64,
        recovered: HashSet<u64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            chunk_size: usize::try_from(chunk_size.max(1)).unwrap_or(usize::MAX),
            next_offset: 0,
            next_id: 0,
            finished: false,
            recovered,
            cancel,
        }
    }

    /// Fill `buf` until it is full or the stream ends
    async fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    pub async fn next_chunk(&mut self) -> UploadResult<Option<Chunk>> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if self.finished {
                return Ok(None);
            }

            let mut buf = vec![0u8; self.chunk_size];
            let filled = self.fill(&mut buf).await?;
            if filled == 0 {
                self.finished = true;
                return Ok(None);
            }
            if filled < self.chunk_size {
                self.finished = true;
            }
            buf.truncate(filled);

            let offset = self.next_offset;
            let id = self.next_id;
            self.next_offset += filled as u64;
            self.next_id += 1;

            // Skipped ranges are still consumed; the stream cannot seek past them
            if self.recovered.contains(&offset) {
                continue;
            }
            return Ok(Some(Chunk::new(id, offset, Bytes::from(buf))));
        }
    }
}

/// Either chunk source behind one interface
pub enum ChunkSource {
    Sized(SizedChunkSource),
    Stream(StreamChunkSource),
}

impl ChunkSource {
    /// Next chunk to upload, `None` once the source is exhausted
    pub async fn next_chunk(&mut self) -> UploadResult<Option<Chunk>> {
        match self {
            Self::Sized(source) => source.next_chunk().await,
            Self::Stream(source) => source.next_chunk().await,
        }
    }

    /// Ids assigned so far, including skipped chunks
    pub fn discovered_chunks(&self) -> u32 {
        match self {
            Self::Sized(source) => source.next_id,
            Self::Stream(source) => source.next_id,
        }
    }

    /// Bytes of the source partitioned so far
    pub fn bytes_seen(&self) -> u64 {
        match self {
            Self::Sized(source) => source.next_offset,
            Self::Stream(source) => source.next_offset,
        }
    }
}
