//! High-level operations.
//!
//! Every public operation is a fixed composition of protocol exchanges:
//! one tracker exchange to pick a storage server, then (usually) one storage
//! exchange that does the work. This module owns the pool registry, threads
//! the tracker's answer into the storage request, and surfaces one logical
//! result. Trackers are tried in configuration order from a rotating cursor;
//! only connect failures roll over to the next tracker; an error from a
//! tracker that answered is final, and a storage chosen by a tracker is used
//! as-is.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Request, Response, Role};
use crate::config::ClientConfig;
use crate::errors::{ClientError, Result};
use crate::pool::PoolRegistry;
use crate::stream::{DownloadSink, UploadBody};
use crate::types::{
    Endpoint, FetchNode, FileInfo, GroupStat, Metadata, MetadataFlag, StorageNode, StorageStat,
    StoredFile,
};

/// Which tracker query resolves the storage endpoint for a command.
enum RouteVia {
    Store(Option<String>),
    Fetch(String, String),
    Update(String, String),
}

pub struct Operations {
    cfg: Arc<ClientConfig>,
    registry: PoolRegistry,
    tracker_cursor: AtomicUsize,
}

impl Operations {
    pub fn new(cfg: Arc<ClientConfig>, cancel: CancellationToken) -> Self {
        let registry = PoolRegistry::new(cfg.clone(), cancel);
        Self {
            cfg,
            registry,
            tracker_cursor: AtomicUsize::new(0),
        }
    }

    /// Runs a tracker request against the configured trackers.
    ///
    /// Starts at the round-robin cursor and falls through to the next
    /// tracker on connect failure only.
    async fn tracker_round_trip(&self, request: &mut Request) -> Result<Response> {
        let trackers = &self.cfg.trackers;
        if trackers.is_empty() {
            return Err(ClientError::Config("no trackers configured".to_string()));
        }
        let start = self.tracker_cursor.fetch_add(1, Ordering::Relaxed) % trackers.len();

        let mut last_err = None;
        for i in 0..trackers.len() {
            let endpoint = &trackers[(start + i) % trackers.len()];
            let pool = self.registry.pool_for(endpoint).await;
            let mut lease = match pool.acquire().await {
                Ok(lease) => lease,
                Err(err @ ClientError::Connect { .. }) => {
                    warn!(tracker = %endpoint, error = %err, "tracker unreachable, trying next");
                    last_err = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            let result = lease.exchange(request, None).await;
            pool.release(lease).await;
            return result;
        }
        // Every tracker refused the connection.
        Err(last_err
            .unwrap_or_else(|| ClientError::Config("no trackers configured".to_string())))
    }

    /// Runs a storage request against the endpoint a tracker returned.
    async fn storage_round_trip(
        &self,
        endpoint: &Endpoint,
        request: &mut Request,
        sink: Option<&mut dyn DownloadSink>,
    ) -> Result<Response> {
        let pool = self.registry.pool_for(endpoint).await;
        let mut lease = pool.acquire().await?;
        let result = lease.exchange(request, sink).await;
        pool.release(lease).await;
        result
    }

    fn route(request: &Request) -> Option<RouteVia> {
        match request {
            Request::Upload { group, .. } => Some(RouteVia::Store(group.clone())),
            Request::UploadSlave {
                group, master_path, ..
            } => Some(RouteVia::Update(group.clone(), master_path.clone())),
            Request::Download { group, path, .. }
            | Request::GetMeta { group, path }
            | Request::QueryFileInfo { group, path } => {
                Some(RouteVia::Fetch(group.clone(), path.clone()))
            }
            Request::Append { group, path, .. }
            | Request::Modify { group, path, .. }
            | Request::Truncate { group, path, .. }
            | Request::Delete { group, path }
            | Request::SetMeta { group, path, .. } => {
                Some(RouteVia::Update(group.clone(), path.clone()))
            }
            _ => None,
        }
    }

    /// Runs an arbitrary request.
    ///
    /// Tracker requests go straight to a tracker. Storage requests are
    /// routed by first asking a tracker which storage serves them, exactly
    /// as the named operations do; a download needs `sink`.
    pub async fn execute(
        &self,
        mut request: Request,
        sink: Option<&mut dyn DownloadSink>,
    ) -> Result<Response> {
        match request.role() {
            Role::Tracker => self.tracker_round_trip(&mut request).await,
            Role::Storage => {
                let endpoint = match Self::route(&request) {
                    Some(RouteVia::Store(group)) => {
                        let node = self.query_storage(group.as_deref()).await?;
                        if let Request::Upload { store_index, .. } = &mut request {
                            *store_index = node.store_index;
                        }
                        node.endpoint
                    }
                    Some(RouteVia::Fetch(group, path)) => {
                        self.query_fetch(&StoredFile::new(group, path)).await?.endpoint
                    }
                    Some(RouteVia::Update(group, path)) => {
                        self.query_update(&StoredFile::new(group, path)).await?.endpoint
                    }
                    None => {
                        return Err(ClientError::InvalidArgument(
                            "request cannot be routed to a storage server".to_string(),
                        ))
                    }
                };
                self.storage_round_trip(&endpoint, &mut request, sink).await
            }
        }
    }

    /// Asks a tracker for an upload target.
    pub async fn query_storage(&self, group: Option<&str>) -> Result<StorageNode> {
        let mut request = Request::QueryStore {
            group: group.map(str::to_string),
        };
        self.tracker_round_trip(&mut request).await?.into_store_node()
    }

    /// Asks a tracker which storage serves `file` for reading.
    pub async fn query_fetch(&self, file: &StoredFile) -> Result<FetchNode> {
        let mut request = Request::QueryFetch {
            group: file.group.clone(),
            path: file.path.clone(),
        };
        self.tracker_round_trip(&mut request).await?.into_fetch_node()
    }

    /// Asks a tracker which storage accepts updates for `file`.
    pub async fn query_update(&self, file: &StoredFile) -> Result<FetchNode> {
        let mut request = Request::QueryUpdate {
            group: file.group.clone(),
            path: file.path.clone(),
        };
        self.tracker_round_trip(&mut request).await?.into_fetch_node()
    }

    /// Uploads a file, optionally pinned to a group, as a normal or appender
    /// file.
    pub async fn upload(
        &self,
        group: Option<&str>,
        ext: &str,
        appender: bool,
        body: UploadBody,
    ) -> Result<StoredFile> {
        let node = self.query_storage(group).await?;
        debug!(storage = %node.endpoint, group = %node.group, size = body.len(), "uploading");
        let mut request = Request::Upload {
            group: group.map(str::to_string),
            store_index: node.store_index,
            ext: ext.to_string(),
            appender,
            body,
        };
        self.storage_round_trip(&node.endpoint, &mut request, None)
            .await?
            .into_stored_file()
    }

    /// Uploads a slave file next to an existing master file.
    pub async fn upload_slave(
        &self,
        master: &StoredFile,
        prefix: &str,
        ext: &str,
        body: UploadBody,
    ) -> Result<StoredFile> {
        let node = self.query_update(master).await?;
        let mut request = Request::UploadSlave {
            group: master.group.clone(),
            master_path: master.path.clone(),
            prefix: prefix.to_string(),
            ext: ext.to_string(),
            body,
        };
        self.storage_round_trip(&node.endpoint, &mut request, None)
            .await?
            .into_stored_file()
    }

    /// Streams `file` content into `sink`. `length == 0` downloads to the
    /// end of the file. Returns the number of bytes delivered.
    pub async fn download(
        &self,
        file: &StoredFile,
        offset: u64,
        length: u64,
        sink: &mut dyn DownloadSink,
    ) -> Result<u64> {
        let node = self.query_fetch(file).await?;
        let mut request = Request::Download {
            group: file.group.clone(),
            path: file.path.clone(),
            offset,
            length,
        };
        match self
            .storage_round_trip(&node.endpoint, &mut request, Some(sink))
            .await?
        {
            Response::Streamed(n) => Ok(n),
            other => Err(ClientError::Protocol(format!(
                "expected streamed response, got {other:?}"
            ))),
        }
    }

    /// Appends to an appender file.
    pub async fn append(&self, file: &StoredFile, body: UploadBody) -> Result<()> {
        let node = self.query_update(file).await?;
        let mut request = Request::Append {
            group: file.group.clone(),
            path: file.path.clone(),
            body,
        };
        self.storage_round_trip(&node.endpoint, &mut request, None)
            .await?;
        Ok(())
    }

    /// Overwrites a range of an appender file.
    pub async fn modify(&self, file: &StoredFile, offset: u64, body: UploadBody) -> Result<()> {
        let node = self.query_update(file).await?;
        let mut request = Request::Modify {
            group: file.group.clone(),
            path: file.path.clone(),
            offset,
            body,
        };
        self.storage_round_trip(&node.endpoint, &mut request, None)
            .await?;
        Ok(())
    }

    /// Truncates an appender file to `new_size` bytes.
    pub async fn truncate(&self, file: &StoredFile, new_size: u64) -> Result<()> {
        let node = self.query_update(file).await?;
        let mut request = Request::Truncate {
            group: file.group.clone(),
            path: file.path.clone(),
            new_size,
        };
        self.storage_round_trip(&node.endpoint, &mut request, None)
            .await?;
        Ok(())
    }

    /// Deletes a file.
    pub async fn delete(&self, file: &StoredFile) -> Result<()> {
        let node = self.query_update(file).await?;
        debug!(file = %file, "deleting");
        let mut request = Request::Delete {
            group: file.group.clone(),
            path: file.path.clone(),
        };
        self.storage_round_trip(&node.endpoint, &mut request, None)
            .await?;
        Ok(())
    }

    /// Replaces or merges a file's metadata.
    pub async fn set_metadata(
        &self,
        file: &StoredFile,
        meta: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        let node = self.query_update(file).await?;
        let mut request = Request::SetMeta {
            group: file.group.clone(),
            path: file.path.clone(),
            meta: meta.clone(),
            flag,
        };
        self.storage_round_trip(&node.endpoint, &mut request, None)
            .await?;
        Ok(())
    }

    /// Fetches a file's metadata. A file without metadata yields an empty map.
    pub async fn get_metadata(&self, file: &StoredFile) -> Result<Metadata> {
        let node = self.query_fetch(file).await?;
        let mut request = Request::GetMeta {
            group: file.group.clone(),
            path: file.path.clone(),
        };
        self.storage_round_trip(&node.endpoint, &mut request, None)
            .await?
            .into_meta()
    }

    /// Fetches size, creation time and checksum of a file.
    pub async fn file_info(&self, file: &StoredFile) -> Result<FileInfo> {
        let node = self.query_fetch(file).await?;
        let mut request = Request::QueryFileInfo {
            group: file.group.clone(),
            path: file.path.clone(),
        };
        self.storage_round_trip(&node.endpoint, &mut request, None)
            .await?
            .into_file_info()
    }

    /// Lists every group the tracker knows.
    pub async fn list_groups(&self) -> Result<Vec<GroupStat>> {
        self.tracker_round_trip(&mut Request::ListGroups)
            .await?
            .into_groups()
    }

    /// Lists a single group.
    pub async fn list_one_group(&self, group: &str) -> Result<GroupStat> {
        let mut request = Request::ListOneGroup {
            group: group.to_string(),
        };
        self.tracker_round_trip(&mut request)
            .await?
            .into_groups()?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Protocol("empty list-group response".to_string()))
    }

    /// Lists the storage servers of a group.
    pub async fn list_storages(
        &self,
        group: &str,
        storage_id: Option<&str>,
    ) -> Result<Vec<StorageStat>> {
        let mut request = Request::ListStorages {
            group: group.to_string(),
            storage_id: storage_id.map(str::to_string),
        };
        self.tracker_round_trip(&mut request).await?.into_storages()
    }

    /// One idle-eviction pass across all pools.
    pub async fn sweep(&self) {
        self.registry.sweep().await;
    }

    /// Closes every pool.
    pub async fn close(&self) {
        self.registry.close().await;
    }
}
