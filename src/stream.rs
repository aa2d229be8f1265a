//! Streamed payloads: upload bodies and download sinks.
//!
//! Large file content never crosses the client as one buffer. Uploads read
//! from an [`UploadBody`] in bounded chunks; downloads are delivered chunk by
//! chunk to a [`DownloadSink`]. The overall length of an upload must be known
//! up front because the protocol header carries it; a reader of unknown
//! length cannot be framed and is unrepresentable here.

use std::fmt;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use futures::future::{self, BoxFuture, FutureExt};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::{ClientError, Result};

/// Chunks the file sink buffers before the network read loop blocks on the
/// writer task.
const FILE_SINK_QUEUE_DEPTH: usize = 16;

/// Source of bytes for upload, append and modify operations.
pub enum UploadBody {
    /// Content already in memory.
    Buffer(Bytes),
    /// Content streamed from a reader with a known length.
    Reader {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        len: u64,
    },
}

impl UploadBody {
    pub fn from_buffer(data: impl Into<Bytes>) -> Self {
        UploadBody::Buffer(data.into())
    }

    /// Wraps a reader that will yield exactly `len` bytes. The exchange fails
    /// with a protocol error if the reader runs dry early.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static, len: u64) -> Self {
        UploadBody::Reader {
            reader: Box::new(reader),
            len,
        }
    }

    /// Opens a local file and takes its current size as the upload length.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).await?;
        let len = file.metadata().await?.len();
        Ok(UploadBody::Reader {
            reader: Box::new(file),
            len,
        })
    }

    /// Total number of bytes this body will produce.
    pub fn len(&self) -> u64 {
        match self {
            UploadBody::Buffer(b) => b.len() as u64,
            UploadBody::Reader { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadBody::Buffer(b) => f.debug_tuple("Buffer").field(&b.len()).finish(),
            UploadBody::Reader { len, .. } => {
                f.debug_struct("Reader").field("len", len).finish()
            }
        }
    }
}

/// Destination for a streamed response body.
///
/// The protocol engine calls [`write`](DownloadSink::write) once per chunk in
/// arrival order, then [`complete`](DownloadSink::complete) exactly once after
/// the final chunk. [`release`](DownloadSink::release) is called instead if
/// the exchange aborts. After a write error the sink is terminal and rejects
/// further writes.
pub trait DownloadSink: Send {
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<()>>;
    fn complete(&mut self) -> BoxFuture<'_, Result<()>>;
    fn release(&mut self) -> BoxFuture<'_, ()>;
}

/// Sink that collects the whole body in memory.
///
/// Only suitable for responses known to be small; large downloads should go
/// through [`FileSink`] or a caller-provided sink.
#[derive(Default)]
pub struct BufferSink {
    buf: BytesMut,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The collected body.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl DownloadSink for BufferSink {
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
        self.buf.extend_from_slice(&chunk);
        future::ready(Ok(())).boxed()
    }

    fn complete(&mut self) -> BoxFuture<'_, Result<()>> {
        future::ready(Ok(())).boxed()
    }

    fn release(&mut self) -> BoxFuture<'_, ()> {
        self.buf.clear();
        future::ready(()).boxed()
    }
}

/// Sink that writes the body to a local file.
///
/// Chunks are handed to a dedicated writer task over a bounded queue so the
/// network read loop is not stalled by disk latency; when the writer lags,
/// the queue fills and backpressure blocks the producer instead of growing
/// memory. Bytes are never dropped: a disk error surfaces on the next write
/// and the sink stays in that failed state.
pub struct FileSink {
    tx: Option<mpsc::Sender<Bytes>>,
    writer: Option<JoinHandle<std::io::Result<()>>>,
}

impl FileSink {
    /// Creates (or truncates) the file at `path` and starts the writer task.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref()).await?;
        let (tx, rx) = mpsc::channel(FILE_SINK_QUEUE_DEPTH);
        let writer = tokio::spawn(write_loop(file, rx));
        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    async fn writer_failure(&mut self) -> String {
        match self.writer.take() {
            Some(handle) => match handle.await {
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(())) => "writer exited before the sink completed".to_string(),
                Err(e) => format!("writer task failed: {e}"),
            },
            None => "sink already failed".to_string(),
        }
    }
}

async fn write_loop(mut file: File, mut rx: mpsc::Receiver<Bytes>) -> std::io::Result<()> {
    while let Some(chunk) = rx.recv().await {
        file.write_all(&chunk).await?;
    }
    file.flush().await
}

impl DownloadSink for FileSink {
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(tx) = self.tx.clone() else {
                return Err(ClientError::Stream(
                    "sink is closed or already failed".to_string(),
                ));
            };
            if tx.send(chunk).await.is_ok() {
                return Ok(());
            }
            // The writer hung up mid-download; collect its error.
            self.tx = None;
            Err(ClientError::Stream(self.writer_failure().await))
        })
    }

    fn complete(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // Dropping the sender closes the queue; the writer drains what is
            // left and flushes.
            self.tx = None;
            match self.writer.take() {
                Some(handle) => match handle.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ClientError::Stream(e.to_string())),
                    Err(e) => Err(ClientError::Stream(format!("writer task failed: {e}"))),
                },
                None => Err(ClientError::Stream("sink already completed".to_string())),
            }
        })
    }

    fn release(&mut self) -> BoxFuture<'_, ()> {
        self.tx = None;
        if let Some(handle) = self.writer.take() {
            handle.abort();
        }
        future::ready(()).boxed()
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Some(handle) = self.writer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_body_reports_length() {
        let body = UploadBody::from_buffer(vec![0u8; 4096]);
        assert_eq!(body.len(), 4096);
        assert!(!body.is_empty());

        let body = UploadBody::from_reader(std::io::Cursor::new(vec![1u8; 10]), 10);
        assert_eq!(body.len(), 10);
    }

    #[tokio::test]
    async fn upload_body_from_file_takes_disk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, vec![7u8; 1234]).unwrap();

        let body = UploadBody::from_file(&path).await.unwrap();
        assert_eq!(body.len(), 1234);
    }

    #[tokio::test]
    async fn buffer_sink_collects_chunks_in_order() {
        let mut sink = BufferSink::new();
        sink.write(Bytes::from_static(b"hello ")).await.unwrap();
        sink.write(Bytes::from_static(b"world")).await.unwrap();
        sink.complete().await.unwrap();
        assert_eq!(sink.into_bytes().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn file_sink_writes_all_chunks_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileSink::create(&path).await.unwrap();
        for i in 0..10u8 {
            sink.write(Bytes::from(vec![i; 100])).await.unwrap();
        }
        sink.complete().await.unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 1000);
        assert_eq!(&written[0..100], &[0u8; 100]);
        assert_eq!(&written[900..1000], &[9u8; 100]);
    }

    #[tokio::test]
    async fn file_sink_rejects_writes_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileSink::create(&path).await.unwrap();
        sink.write(Bytes::from_static(b"data")).await.unwrap();
        sink.complete().await.unwrap();

        let err = sink.write(Bytes::from_static(b"more")).await.unwrap_err();
        assert!(matches!(err, ClientError::Stream(_)));
    }

    #[tokio::test]
    async fn file_sink_release_leaves_no_running_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileSink::create(&path).await.unwrap();
        sink.write(Bytes::from_static(b"partial")).await.unwrap();
        sink.release().await;

        let err = sink.write(Bytes::from_static(b"more")).await.unwrap_err();
        assert!(matches!(err, ClientError::Stream(_)));
    }
}
