//! Main client struct for interacting with a FastDFS cluster.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::codec::{Request, Response};
use crate::config::ClientConfig;
use crate::errors::{ClientError, Result};
use crate::operations::Operations;
use crate::stream::{BufferSink, DownloadSink, FileSink, UploadBody};
use crate::types::{
    FetchNode, FileInfo, GroupStat, Metadata, MetadataFlag, StorageNode, StorageStat, StoredFile,
};

/// FastDFS client.
///
/// A thin facade over the operation layer: it validates the configuration,
/// owns the cancellation token that tears everything down on
/// [`close`](Client::close), and keeps one background task sweeping idle
/// connections. All methods are safe to call concurrently; each operation
/// checks out its own connection.
///
/// # Example
///
/// ```no_run
/// use fdfs::{Client, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ClientConfig::from_tracker_addrs(["192.168.1.100:22122"])?;
///     let client = Client::new(config)?;
///
///     let file = client.upload_buffer(&b"Hello, FastDFS!"[..], "txt").await?;
///     let data = client.download_file(&file.id()).await?;
///     assert_eq!(data.as_ref(), b"Hello, FastDFS!");
///     client.delete_file(&file.id()).await?;
///
///     client.close().await;
///     Ok(())
/// }
/// ```
pub struct Client {
    ops: Arc<Operations>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client. Fails if the configuration is invalid.
    ///
    /// Must be called within a Tokio runtime; the idle sweeper is spawned
    /// here.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let cfg = Arc::new(config);
        let cancel = CancellationToken::new();
        let ops = Arc::new(Operations::new(cfg.clone(), cancel.clone()));

        tokio::spawn(sweep_loop(ops.clone(), cancel.clone(), cfg.idle_timeout));

        Ok(Self { ops, cancel })
    }

    fn check_closed(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Uploads in-memory data, letting the tracker pick the group.
    pub async fn upload_buffer(
        &self,
        data: impl Into<Bytes>,
        ext: &str,
    ) -> Result<StoredFile> {
        self.check_closed()?;
        self.ops
            .upload(None, ext, false, UploadBody::from_buffer(data))
            .await
    }

    /// Uploads in-memory data into a specific group.
    pub async fn upload_buffer_to_group(
        &self,
        group: &str,
        data: impl Into<Bytes>,
        ext: &str,
    ) -> Result<StoredFile> {
        self.check_closed()?;
        self.ops
            .upload(Some(group), ext, false, UploadBody::from_buffer(data))
            .await
    }

    /// Uploads a local file; the extension is taken from the filename. The
    /// content is streamed from disk, not loaded whole.
    pub async fn upload_file(&self, local_path: impl AsRef<Path>) -> Result<StoredFile> {
        self.check_closed()?;
        let local_path = local_path.as_ref();
        let ext = local_path
            .to_str()
            .map(crate::codec::file_ext_name)
            .unwrap_or_default();
        let body = UploadBody::from_file(local_path).await?;
        self.ops.upload(None, &ext, false, body).await
    }

    /// Uploads an upload body with full control over group, extension and
    /// appender-ness.
    pub async fn upload(
        &self,
        group: Option<&str>,
        ext: &str,
        appender: bool,
        body: UploadBody,
    ) -> Result<StoredFile> {
        self.check_closed()?;
        self.ops.upload(group, ext, appender, body).await
    }

    /// Uploads in-memory data as an appender file, which can later grow via
    /// [`append_buffer`](Client::append_buffer).
    pub async fn upload_appender_buffer(
        &self,
        data: impl Into<Bytes>,
        ext: &str,
    ) -> Result<StoredFile> {
        self.check_closed()?;
        self.ops
            .upload(None, ext, true, UploadBody::from_buffer(data))
            .await
    }

    /// Uploads a slave file whose id derives from an existing master file
    /// plus a prefix.
    pub async fn upload_slave_buffer(
        &self,
        master_id: &str,
        prefix: &str,
        ext: &str,
        data: impl Into<Bytes>,
    ) -> Result<StoredFile> {
        self.check_closed()?;
        let master = StoredFile::parse(master_id)?;
        self.ops
            .upload_slave(&master, prefix, ext, UploadBody::from_buffer(data))
            .await
    }

    /// Downloads a whole file into memory.
    pub async fn download_file(&self, file_id: &str) -> Result<Bytes> {
        self.download_file_range(file_id, 0, 0).await
    }

    /// Downloads a byte range into memory. `length == 0` reads to the end of
    /// the file.
    pub async fn download_file_range(
        &self,
        file_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        let mut sink = BufferSink::new();
        self.ops.download(&file, offset, length, &mut sink).await?;
        Ok(sink.into_bytes())
    }

    /// Streams a file to the local filesystem without buffering it whole.
    /// Returns the number of bytes written.
    pub async fn download_to_file(
        &self,
        file_id: &str,
        local_path: impl AsRef<Path>,
    ) -> Result<u64> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        let mut sink = FileSink::create(local_path).await?;
        self.ops.download(&file, 0, 0, &mut sink).await
    }

    /// Streams a file (or range of it) into a caller-supplied sink.
    pub async fn download_to_sink(
        &self,
        file_id: &str,
        offset: u64,
        length: u64,
        sink: &mut dyn DownloadSink,
    ) -> Result<u64> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops.download(&file, offset, length, sink).await
    }

    /// Appends in-memory data to an appender file.
    pub async fn append_buffer(&self, file_id: &str, data: impl Into<Bytes>) -> Result<()> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops.append(&file, UploadBody::from_buffer(data)).await
    }

    /// Overwrites a range of an appender file with in-memory data.
    pub async fn modify_buffer(
        &self,
        file_id: &str,
        offset: u64,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops
            .modify(&file, offset, UploadBody::from_buffer(data))
            .await
    }

    /// Truncates an appender file to `new_size` bytes.
    pub async fn truncate_file(&self, file_id: &str, new_size: u64) -> Result<()> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops.truncate(&file, new_size).await
    }

    /// Deletes a file.
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops.delete(&file).await
    }

    /// Replaces or merges a file's metadata.
    pub async fn set_metadata(
        &self,
        file_id: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops.set_metadata(&file, metadata, flag).await
    }

    /// Fetches a file's metadata.
    pub async fn get_metadata(&self, file_id: &str) -> Result<Metadata> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops.get_metadata(&file).await
    }

    /// Fetches size, creation time and CRC32 of a file.
    pub async fn file_info(&self, file_id: &str) -> Result<FileInfo> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops.file_info(&file).await
    }

    /// Whether a file exists on its storage server.
    pub async fn file_exists(&self, file_id: &str) -> bool {
        self.file_info(file_id).await.is_ok()
    }

    /// Lists every group known to the tracker.
    pub async fn list_groups(&self) -> Result<Vec<GroupStat>> {
        self.check_closed()?;
        self.ops.list_groups().await
    }

    /// Lists a single group.
    pub async fn list_one_group(&self, group: &str) -> Result<GroupStat> {
        self.check_closed()?;
        self.ops.list_one_group(group).await
    }

    /// Lists the storage servers of a group, optionally narrowed to one
    /// server id.
    pub async fn list_storages(
        &self,
        group: &str,
        storage_id: Option<&str>,
    ) -> Result<Vec<StorageStat>> {
        self.check_closed()?;
        self.ops.list_storages(group, storage_id).await
    }

    /// Asks a tracker for an upload target without uploading anything.
    pub async fn query_storage(&self, group: Option<&str>) -> Result<StorageNode> {
        self.check_closed()?;
        self.ops.query_storage(group).await
    }

    /// Asks a tracker which storage serves a file for reading.
    pub async fn query_fetch(&self, file_id: &str) -> Result<FetchNode> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops.query_fetch(&file).await
    }

    /// Asks a tracker which storage accepts updates for a file.
    pub async fn query_update(&self, file_id: &str) -> Result<FetchNode> {
        self.check_closed()?;
        let file = StoredFile::parse(file_id)?;
        self.ops.query_update(&file).await
    }

    /// Runs an arbitrary request, routing it to the right server role.
    /// Downloads need `sink`; everything else can pass `None`.
    pub async fn execute(
        &self,
        request: Request,
        sink: Option<&mut dyn DownloadSink>,
    ) -> Result<Response> {
        self.check_closed()?;
        self.ops.execute(request, sink).await
    }

    /// Closes the client: cancels in-flight exchanges, stops the sweeper and
    /// drops every pooled connection. Safe to call more than once.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.ops.close().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Stop the sweeper and any exchange still borrowing the token.
        self.cancel.cancel();
    }
}

async fn sweep_loop(ops: Arc<Operations>, cancel: CancellationToken, idle_timeout: Duration) {
    let period = (idle_timeout / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => ops.sweep().await,
        }
    }
}
