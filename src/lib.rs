//! Async Rust client for the FastDFS distributed file system.
//!
//! FastDFS splits a cluster into trackers (metadata and dispatch) and
//! storages (file content). This crate speaks the binary protocol to both:
//! it asks a tracker which storage serves a request, then runs the upload,
//! download, append, delete or metadata exchange against that storage over
//! pooled TCP connections.
//!
//! # Features
//!
//! - Upload (normal, appender, slave), download, append, modify, truncate,
//!   delete, metadata and file-info operations
//! - Streamed uploads and downloads that never buffer a whole file
//! - Per-endpoint connection pooling with idle eviction and liveness checks
//! - Tracker failover in configuration order
//! - Structured logging via `tracing`
//!
//! # Example
//!
//! ```no_run
//! use fdfs::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::from_tracker_addrs(["192.168.1.100:22122"])?;
//!     let client = Client::new(config)?;
//!
//!     let file = client.upload_buffer(&b"Hello, FastDFS!"[..], "txt").await?;
//!     let data = client.download_file(&file.id()).await?;
//!     client.delete_file(&file.id()).await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

mod client;
pub mod codec;
mod config;
mod conn;
mod errors;
mod operations;
mod pool;
pub mod stream;
pub mod types;

pub use client::Client;
pub use codec::{Header, Request, Response, Role};
pub use config::ClientConfig;
pub use conn::{ConnState, Connection};
pub use errors::{ClientError, Result};
pub use stream::{BufferSink, DownloadSink, FileSink, UploadBody};
pub use types::{
    Endpoint, FetchNode, FileInfo, GroupStat, Metadata, MetadataFlag, StorageCommand,
    StorageNode, StorageStat, StorageStatus, StoredFile, TrackerCommand,
};
