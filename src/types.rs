//! Protocol constants, command codes, and domain types shared across the
//! tracker and storage halves of the client.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use crate::errors::{ClientError, Result};

/// Default network ports for FastDFS servers.
pub const TRACKER_DEFAULT_PORT: u16 = 22122;
pub const STORAGE_DEFAULT_PORT: u16 = 23000;

/// Protocol header size.
pub const FDFS_PROTO_HEADER_LEN: usize = 10;

/// Size of an 8-byte big-endian length field.
pub const FDFS_PROTO_PKG_LEN_SIZE: usize = 8;

/// Field size limits.
pub const FDFS_GROUP_NAME_MAX_LEN: usize = 16;
pub const FDFS_FILE_EXT_NAME_MAX_LEN: usize = 6;
pub const FDFS_FILE_PREFIX_MAX_LEN: usize = 16;
pub const FDFS_MAX_META_NAME_LEN: usize = 64;
pub const FDFS_MAX_META_VALUE_LEN: usize = 256;
pub const FDFS_STORAGE_ID_MAX_SIZE: usize = 16;
pub const FDFS_DOMAIN_NAME_MAX_SIZE: usize = 128;
pub const FDFS_VERSION_SIZE: usize = 8;
pub const IP_ADDRESS_SIZE: usize = 16;

/// Metadata wire-format separators.
pub const FDFS_RECORD_SEPARATOR: u8 = 0x01;
pub const FDFS_FIELD_SEPARATOR: u8 = 0x02;

/// Command code shared by all success/error responses.
pub const PROTO_CMD_RESP: u8 = 100;

/// Tracker protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackerCommand {
    ListOneGroup = 90,
    ListAllGroups = 91,
    ListStorages = 92,
    QueryStoreWithoutGroup = 101,
    QueryFetchOne = 102,
    QueryUpdate = 103,
    QueryStoreWithGroup = 104,
}

impl From<TrackerCommand> for u8 {
    fn from(cmd: TrackerCommand) -> u8 {
        cmd as u8
    }
}

/// Storage protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageCommand {
    UploadFile = 11,
    DeleteFile = 12,
    SetMetadata = 13,
    DownloadFile = 14,
    GetMetadata = 15,
    UploadSlaveFile = 21,
    QueryFileInfo = 22,
    UploadAppenderFile = 23,
    AppendFile = 24,
    ModifyFile = 34,
    TruncateFile = 36,
}

impl From<StorageCommand> for u8 {
    fn from(cmd: StorageCommand) -> u8 {
        cmd as u8
    }
}

/// Status of a storage server as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageStatus {
    Init = 0,
    WaitSync = 1,
    Syncing = 2,
    IpChanged = 3,
    Deleted = 4,
    Offline = 5,
    Online = 6,
    Active = 7,
    Recovery = 9,
    None = 99,
}

impl From<u8> for StorageStatus {
    fn from(b: u8) -> Self {
        match b {
            0 => StorageStatus::Init,
            1 => StorageStatus::WaitSync,
            2 => StorageStatus::Syncing,
            3 => StorageStatus::IpChanged,
            4 => StorageStatus::Deleted,
            5 => StorageStatus::Offline,
            6 => StorageStatus::Online,
            7 => StorageStatus::Active,
            9 => StorageStatus::Recovery,
            _ => StorageStatus::None,
        }
    }
}

/// Metadata operation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataFlag {
    /// Replace all existing metadata with the new values.
    Overwrite = b'O',
    /// Merge the new metadata into the existing set.
    Merge = b'M',
}

impl From<MetadataFlag> for u8 {
    fn from(flag: MetadataFlag) -> u8 {
        flag as u8
    }
}

/// Metadata dictionary type.
pub type Metadata = std::collections::HashMap<String, String>;

/// A `(host, port)` pair identifying a tracker or storage server.
///
/// Endpoints are the identity under which connections are pooled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClientError::Config(format!("address without port: {s:?}")))?;
        if host.is_empty() {
            return Err(ClientError::Config(format!("address without host: {s:?}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ClientError::Config(format!("invalid port in address {s:?}")))?;
        Ok(Endpoint::new(host, port))
    }
}

/// Storage server returned by a tracker query-store exchange.
#[derive(Debug, Clone)]
pub struct StorageNode {
    /// Group the file will be stored under.
    pub group: String,
    /// Endpoint to upload to.
    pub endpoint: Endpoint,
    /// Index of the store path to use on that server.
    pub store_index: u8,
}

/// Storage server returned by a tracker query-fetch or query-update exchange.
#[derive(Debug, Clone)]
pub struct FetchNode {
    pub group: String,
    pub endpoint: Endpoint,
}

/// A file stored in FastDFS, identified by its group and storage-relative path.
///
/// The single-string form returned by [`StoredFile::id`] is `"group/path"`,
/// e.g. `"group1/M00/00/00/wKgBcFxyz.jpg"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub group: String,
    pub path: String,
}

impl StoredFile {
    pub fn new(group: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            path: path.into(),
        }
    }

    /// Splits a `"group/path"` file id into its components.
    pub fn parse(file_id: &str) -> Result<Self> {
        let (group, path) = file_id
            .split_once('/')
            .ok_or_else(|| ClientError::InvalidFileId(file_id.to_string()))?;
        if group.is_empty() || group.len() > FDFS_GROUP_NAME_MAX_LEN || path.is_empty() {
            return Err(ClientError::InvalidFileId(file_id.to_string()));
        }
        Ok(Self::new(group, path))
    }

    /// The `"group/path"` form consumed by download, delete and friends.
    pub fn id(&self) -> String {
        format!("{}/{}", self.group, self.path)
    }
}

impl fmt::Display for StoredFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.path)
    }
}

/// Information about a stored file as reported by query-file-info.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Size of the file in bytes.
    pub file_size: u64,
    /// When the file was created.
    pub create_time: SystemTime,
    /// CRC32 checksum of the file content.
    pub crc32: u32,
    /// IP address of the source storage server.
    pub source_ip_addr: String,
}

/// Per-group statistics from a tracker list-groups exchange.
#[derive(Debug, Clone)]
pub struct GroupStat {
    pub group_name: String,
    pub total_mb: u64,
    pub free_mb: u64,
    pub trunk_free_mb: u64,
    pub server_count: u64,
    pub storage_port: u64,
    pub storage_http_port: u64,
    pub active_count: u64,
    pub current_write_server: u64,
    pub store_path_count: u64,
    pub subdir_count_per_path: u64,
    pub current_trunk_file_id: u64,
}

/// Per-server statistics from a tracker list-storages exchange.
#[derive(Debug, Clone)]
pub struct StorageStat {
    pub status: StorageStatus,
    pub id: String,
    pub ip_addr: String,
    pub domain_name: String,
    pub src_ip_addr: String,
    pub version: String,
    pub join_time: u64,
    pub up_time: u64,
    pub total_mb: u64,
    pub free_mb: u64,
    pub upload_priority: u64,
    pub store_path_count: u64,
    pub subdir_count_per_path: u64,
    pub current_write_path: u64,
    pub storage_port: u64,
    pub storage_http_port: u64,
    pub total_upload_count: u64,
    pub success_upload_count: u64,
    pub total_download_count: u64,
    pub success_download_count: u64,
    pub last_heart_beat_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_host_and_port() {
        let ep: Endpoint = "192.168.1.100:22122".parse().unwrap();
        assert_eq!(ep.host, "192.168.1.100");
        assert_eq!(ep.port, 22122);
        assert_eq!(ep.to_string(), "192.168.1.100:22122");
    }

    #[test]
    fn endpoint_rejects_malformed_addresses() {
        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":22122".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn stored_file_round_trips_through_id() {
        let file = StoredFile::parse("group1/M00/00/00/test.jpg").unwrap();
        assert_eq!(file.group, "group1");
        assert_eq!(file.path, "M00/00/00/test.jpg");
        assert_eq!(file.id(), "group1/M00/00/00/test.jpg");
    }

    #[test]
    fn stored_file_rejects_bad_ids() {
        assert!(StoredFile::parse("").is_err());
        assert!(StoredFile::parse("nogroup").is_err());
        assert!(StoredFile::parse("/path-only").is_err());
        assert!(StoredFile::parse("group-name-way-too-long-for-fdfs/x").is_err());
    }
}
