//! Protocol encoding and decoding.
//!
//! Everything that touches wire bytes lives here: the 10-byte frame header,
//! the fixed-width field helpers, the metadata wire format, and a tagged
//! [`Request`] variant per command with its body encoder. Responses are
//! decoded by dispatching on the request that produced them, so every
//! request/response pair stays together.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime};

use crate::errors::{ClientError, Result};
use crate::stream::UploadBody;
use crate::types::*;

/// Body length of a query-store response: group, ip, port, store index.
pub const QUERY_STORE_BODY_LEN: usize =
    FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE + FDFS_PROTO_PKG_LEN_SIZE + 1;

/// Body length of a query-fetch / query-update response: group, ip, port.
pub const QUERY_FETCH_BODY_LEN: usize =
    FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE + FDFS_PROTO_PKG_LEN_SIZE;

/// Size of one group record in a list-groups response body.
pub const GROUP_STAT_LEN: usize = FDFS_GROUP_NAME_MAX_LEN + 1 + 11 * FDFS_PROTO_PKG_LEN_SIZE;

/// Size of one storage record in a list-storages response body.
pub const STORAGE_STAT_LEN: usize = 1
    + FDFS_STORAGE_ID_MAX_SIZE
    + IP_ADDRESS_SIZE
    + FDFS_DOMAIN_NAME_MAX_SIZE
    + IP_ADDRESS_SIZE
    + FDFS_VERSION_SIZE
    + 15 * FDFS_PROTO_PKG_LEN_SIZE;

/// Body length of a query-file-info response.
pub const FILE_INFO_BODY_LEN: usize = 8 + 8 + 4 + IP_ADDRESS_SIZE;

/// Largest response body the client will buffer in memory. Streamed bodies
/// (downloads) are exempt; anything else this large is a malformed frame.
pub const MAX_BUFFERED_BODY: u64 = 16 * 1024 * 1024;

/// The 10-byte frame header: body length, command, status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of the body (and trailing stream, if any), excluding the header.
    pub length: u64,
    /// Command code of the request or response.
    pub command: u8,
    /// 0 on success; an errno-style code otherwise.
    pub status: u8,
}

impl Header {
    pub fn new(length: u64, command: u8, status: u8) -> Self {
        Self {
            length,
            command,
            status,
        }
    }

    /// Encodes the header into its wire form.
    pub fn encode(&self) -> [u8; FDFS_PROTO_HEADER_LEN] {
        let mut buf = [0u8; FDFS_PROTO_HEADER_LEN];
        buf[..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8] = self.command;
        buf[9] = self.status;
        buf
    }

    /// Decodes a header from a buffer of at least 10 bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FDFS_PROTO_HEADER_LEN {
            return Err(ClientError::Protocol(format!(
                "header truncated: {} bytes",
                data.len()
            )));
        }
        let mut buf = &data[..FDFS_PROTO_HEADER_LEN];
        Ok(Self {
            length: buf.get_u64(),
            command: buf.get_u8(),
            status: buf.get_u8(),
        })
    }
}

/// Pads a string into a fixed-width field with trailing `\0` bytes,
/// truncating if it is too long.
pub fn pad_fixed(s: &str, width: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(width);
    let bytes = s.as_bytes();
    let copy = bytes.len().min(width);
    buf.put_slice(&bytes[..copy]);
    buf.resize(width, 0);
    buf.freeze()
}

/// Extracts a string from a fixed-width field, trimming trailing `\0`.
pub fn trim_fixed(data: &[u8]) -> String {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&data[..end]).to_string()
}

/// Encodes metadata pairs into the wire form
/// `key 0x02 value 0x01 key 0x02 value 0x01 …`.
///
/// Keys and values beyond the protocol limits are truncated. Pairs are
/// emitted in key order so the encoding is deterministic.
pub fn encode_metadata(metadata: &Metadata) -> Bytes {
    if metadata.is_empty() {
        return Bytes::new();
    }
    let mut pairs: Vec<_> = metadata.iter().collect();
    pairs.sort_by_key(|(k, _)| k.as_str());

    let mut buf = BytesMut::new();
    for (key, value) in pairs {
        let key = key.as_bytes();
        let value = value.as_bytes();
        buf.put_slice(&key[..key.len().min(FDFS_MAX_META_NAME_LEN)]);
        buf.put_u8(FDFS_FIELD_SEPARATOR);
        buf.put_slice(&value[..value.len().min(FDFS_MAX_META_VALUE_LEN)]);
        buf.put_u8(FDFS_RECORD_SEPARATOR);
    }
    buf.freeze()
}

/// Decodes the metadata wire form. Records that do not have exactly two
/// fields are skipped.
pub fn decode_metadata(data: &[u8]) -> Metadata {
    let mut metadata = Metadata::new();
    for record in data.split(|&b| b == FDFS_RECORD_SEPARATOR) {
        if record.is_empty() {
            continue;
        }
        let fields: Vec<&[u8]> = record.split(|&b| b == FDFS_FIELD_SEPARATOR).collect();
        if fields.len() != 2 {
            continue;
        }
        metadata.insert(
            String::from_utf8_lossy(fields[0]).to_string(),
            String::from_utf8_lossy(fields[1]).to_string(),
        );
    }
    metadata
}

/// Extracts a file extension without the leading dot, truncated to the
/// protocol maximum.
pub fn file_ext_name(filename: &str) -> String {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    ext.chars().take(FDFS_FILE_EXT_NAME_MAX_LEN).collect()
}

/// Which server role a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Tracker,
    Storage,
}

/// One request to a tracker or storage server.
///
/// Each variant carries the parameters of one protocol command. Variants
/// with bulk content own an [`UploadBody`] that the connection streams after
/// the encoded body; it is counted in the frame header but never buffered
/// here. `group` fields on storage commands whose wire body omits the group
/// are used for tracker routing only.
#[derive(Debug)]
pub enum Request {
    /// Ask a tracker for an upload target, optionally pinned to a group.
    QueryStore { group: Option<String> },
    /// Ask a tracker which storage serves a file for reading.
    QueryFetch { group: String, path: String },
    /// Ask a tracker which storage accepts updates for a file.
    QueryUpdate { group: String, path: String },
    /// List every group known to the tracker.
    ListGroups,
    /// List a single group.
    ListOneGroup { group: String },
    /// List the storage servers of a group, optionally one server.
    ListStorages {
        group: String,
        storage_id: Option<String>,
    },
    /// Store a new file (or appender file) on a storage server.
    Upload {
        group: Option<String>,
        store_index: u8,
        ext: String,
        appender: bool,
        body: UploadBody,
    },
    /// Store a slave file alongside an existing master file.
    UploadSlave {
        group: String,
        master_path: String,
        prefix: String,
        ext: String,
        body: UploadBody,
    },
    /// Append to an appender file.
    Append {
        group: String,
        path: String,
        body: UploadBody,
    },
    /// Overwrite a range of an appender file.
    Modify {
        group: String,
        path: String,
        offset: u64,
        body: UploadBody,
    },
    /// Truncate an appender file.
    Truncate {
        group: String,
        path: String,
        new_size: u64,
    },
    /// Delete a file.
    Delete { group: String, path: String },
    /// Fetch file content. `length == 0` means "to the end of the file".
    Download {
        group: String,
        path: String,
        offset: u64,
        length: u64,
    },
    /// Replace or merge a file's metadata.
    SetMeta {
        group: String,
        path: String,
        meta: Metadata,
        flag: MetadataFlag,
    },
    /// Fetch a file's metadata.
    GetMeta { group: String, path: String },
    /// Fetch size, timestamp and checksum of a file.
    QueryFileInfo { group: String, path: String },
}

impl Request {
    /// The wire command code.
    pub fn command(&self) -> u8 {
        match self {
            Request::QueryStore { group: None } => TrackerCommand::QueryStoreWithoutGroup.into(),
            Request::QueryStore { group: Some(_) } => TrackerCommand::QueryStoreWithGroup.into(),
            Request::QueryFetch { .. } => TrackerCommand::QueryFetchOne.into(),
            Request::QueryUpdate { .. } => TrackerCommand::QueryUpdate.into(),
            Request::ListGroups => TrackerCommand::ListAllGroups.into(),
            Request::ListOneGroup { .. } => TrackerCommand::ListOneGroup.into(),
            Request::ListStorages { .. } => TrackerCommand::ListStorages.into(),
            Request::Upload { appender: false, .. } => StorageCommand::UploadFile.into(),
            Request::Upload { appender: true, .. } => StorageCommand::UploadAppenderFile.into(),
            Request::UploadSlave { .. } => StorageCommand::UploadSlaveFile.into(),
            Request::Append { .. } => StorageCommand::AppendFile.into(),
            Request::Modify { .. } => StorageCommand::ModifyFile.into(),
            Request::Truncate { .. } => StorageCommand::TruncateFile.into(),
            Request::Delete { .. } => StorageCommand::DeleteFile.into(),
            Request::Download { .. } => StorageCommand::DownloadFile.into(),
            Request::SetMeta { .. } => StorageCommand::SetMetadata.into(),
            Request::GetMeta { .. } => StorageCommand::GetMetadata.into(),
            Request::QueryFileInfo { .. } => StorageCommand::QueryFileInfo.into(),
        }
    }

    /// Which server role this request is addressed to.
    pub fn role(&self) -> Role {
        match self {
            Request::QueryStore { .. }
            | Request::QueryFetch { .. }
            | Request::QueryUpdate { .. }
            | Request::ListGroups
            | Request::ListOneGroup { .. }
            | Request::ListStorages { .. } => Role::Tracker,
            _ => Role::Storage,
        }
    }

    /// Length of the streamed payload following the encoded body.
    pub fn payload_len(&self) -> u64 {
        self.payload().map(UploadBody::len).unwrap_or(0)
    }

    fn payload(&self) -> Option<&UploadBody> {
        match self {
            Request::Upload { body, .. }
            | Request::UploadSlave { body, .. }
            | Request::Append { body, .. }
            | Request::Modify { body, .. } => Some(body),
            _ => None,
        }
    }

    /// The streamed payload, if this command carries one.
    pub fn payload_mut(&mut self) -> Option<&mut UploadBody> {
        match self {
            Request::Upload { body, .. }
            | Request::UploadSlave { body, .. }
            | Request::Append { body, .. }
            | Request::Modify { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Whether the response body is streamed to a sink rather than buffered.
    pub fn expects_streamed_response(&self) -> bool {
        matches!(self, Request::Download { .. })
    }

    /// Serializes the body parameters (the streamed payload, if any, is not
    /// included; the connection writes it after this buffer).
    pub fn encode_body(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Request::QueryStore { group: None } | Request::ListGroups => {}
            Request::QueryStore { group: Some(group) } | Request::ListOneGroup { group } => {
                buf.put_slice(&pad_fixed(checked_group(group)?, FDFS_GROUP_NAME_MAX_LEN));
            }
            Request::QueryFetch { group, path }
            | Request::QueryUpdate { group, path }
            | Request::Delete { group, path }
            | Request::GetMeta { group, path }
            | Request::QueryFileInfo { group, path } => {
                buf.put_slice(&pad_fixed(checked_group(group)?, FDFS_GROUP_NAME_MAX_LEN));
                buf.put_slice(path.as_bytes());
            }
            Request::ListStorages { group, storage_id } => {
                buf.put_slice(&pad_fixed(checked_group(group)?, FDFS_GROUP_NAME_MAX_LEN));
                if let Some(id) = storage_id {
                    buf.put_slice(id.as_bytes());
                }
            }
            Request::Upload {
                store_index,
                ext,
                body,
                ..
            } => {
                buf.put_u8(*store_index);
                buf.put_u64(body.len());
                buf.put_slice(&pad_fixed(ext, FDFS_FILE_EXT_NAME_MAX_LEN));
            }
            Request::UploadSlave {
                master_path,
                prefix,
                ext,
                body,
                ..
            } => {
                buf.put_u64(master_path.len() as u64);
                buf.put_u64(body.len());
                buf.put_slice(&pad_fixed(prefix, FDFS_FILE_PREFIX_MAX_LEN));
                buf.put_slice(&pad_fixed(ext, FDFS_FILE_EXT_NAME_MAX_LEN));
                buf.put_slice(master_path.as_bytes());
            }
            Request::Append { path, body, .. } => {
                buf.put_u64(path.len() as u64);
                buf.put_u64(body.len());
                buf.put_slice(path.as_bytes());
            }
            Request::Modify {
                path,
                offset,
                body,
                ..
            } => {
                buf.put_u64(path.len() as u64);
                buf.put_u64(*offset);
                buf.put_u64(body.len());
                buf.put_slice(path.as_bytes());
            }
            Request::Truncate { path, new_size, .. } => {
                buf.put_u64(path.len() as u64);
                buf.put_u64(*new_size);
                buf.put_slice(path.as_bytes());
            }
            Request::Download {
                group,
                path,
                offset,
                length,
            } => {
                buf.put_u64(*offset);
                buf.put_u64(*length);
                buf.put_slice(&pad_fixed(checked_group(group)?, FDFS_GROUP_NAME_MAX_LEN));
                buf.put_slice(path.as_bytes());
            }
            Request::SetMeta {
                group,
                path,
                meta,
                flag,
            } => {
                let meta_bytes = encode_metadata(meta);
                buf.put_u64(path.len() as u64);
                buf.put_u64(meta_bytes.len() as u64);
                buf.put_u8((*flag).into());
                buf.put_slice(&pad_fixed(checked_group(group)?, FDFS_GROUP_NAME_MAX_LEN));
                buf.put_slice(path.as_bytes());
                buf.put_slice(&meta_bytes);
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes the buffered response body for this request.
    ///
    /// Streamed responses (downloads) never come through here; the connection
    /// feeds their bytes to the sink instead.
    pub fn decode_response(&self, body: &[u8]) -> Result<Response> {
        match self {
            Request::QueryStore { .. } => decode_store_node(body).map(Response::StoreNode),
            Request::QueryFetch { .. } | Request::QueryUpdate { .. } => {
                decode_fetch_node(body).map(Response::FetchNode)
            }
            Request::ListGroups | Request::ListOneGroup { .. } => {
                decode_group_stats(body).map(Response::Groups)
            }
            Request::ListStorages { .. } => decode_storage_stats(body).map(Response::Storages),
            Request::Upload { .. } | Request::UploadSlave { .. } => {
                decode_stored_file(body).map(Response::Stored)
            }
            Request::GetMeta { .. } => Ok(Response::Meta(decode_metadata(body))),
            Request::QueryFileInfo { .. } => decode_file_info(body).map(Response::Info),
            Request::Append { .. }
            | Request::Modify { .. }
            | Request::Truncate { .. }
            | Request::Delete { .. }
            | Request::SetMeta { .. } => Ok(Response::Done),
            Request::Download { .. } => Err(ClientError::Protocol(
                "download responses are streamed, not buffered".to_string(),
            )),
        }
    }
}

fn checked_group(group: &str) -> Result<&str> {
    if group.len() > FDFS_GROUP_NAME_MAX_LEN {
        return Err(ClientError::InvalidArgument(format!(
            "group name {group:?} exceeds {FDFS_GROUP_NAME_MAX_LEN} bytes"
        )));
    }
    Ok(group)
}

/// Decoded response, paired with the request that produced it.
#[derive(Debug)]
pub enum Response {
    /// Result of a query-store exchange.
    StoreNode(StorageNode),
    /// Result of a query-fetch or query-update exchange.
    FetchNode(FetchNode),
    /// Result of an upload: where the file landed.
    Stored(StoredFile),
    /// Result of a list-groups exchange.
    Groups(Vec<GroupStat>),
    /// Result of a list-storages exchange.
    Storages(Vec<StorageStat>),
    /// Result of a get-metadata exchange.
    Meta(Metadata),
    /// Result of a query-file-info exchange.
    Info(FileInfo),
    /// Success response with no body semantics.
    Done,
    /// Streamed download: number of bytes delivered to the sink.
    Streamed(u64),
}

impl Response {
    pub fn into_store_node(self) -> Result<StorageNode> {
        match self {
            Response::StoreNode(n) => Ok(n),
            other => Err(unexpected("storage node", &other)),
        }
    }

    pub fn into_fetch_node(self) -> Result<FetchNode> {
        match self {
            Response::FetchNode(n) => Ok(n),
            other => Err(unexpected("fetch node", &other)),
        }
    }

    pub fn into_stored_file(self) -> Result<StoredFile> {
        match self {
            Response::Stored(f) => Ok(f),
            other => Err(unexpected("stored file", &other)),
        }
    }

    pub fn into_groups(self) -> Result<Vec<GroupStat>> {
        match self {
            Response::Groups(g) => Ok(g),
            other => Err(unexpected("group stats", &other)),
        }
    }

    pub fn into_storages(self) -> Result<Vec<StorageStat>> {
        match self {
            Response::Storages(s) => Ok(s),
            other => Err(unexpected("storage stats", &other)),
        }
    }

    pub fn into_meta(self) -> Result<Metadata> {
        match self {
            Response::Meta(m) => Ok(m),
            other => Err(unexpected("metadata", &other)),
        }
    }

    pub fn into_file_info(self) -> Result<FileInfo> {
        match self {
            Response::Info(i) => Ok(i),
            other => Err(unexpected("file info", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Response) -> ClientError {
    ClientError::Protocol(format!("expected {wanted} response, got {got:?}"))
}

fn decode_store_node(body: &[u8]) -> Result<StorageNode> {
    if body.len() < QUERY_STORE_BODY_LEN {
        return Err(ClientError::Protocol(format!(
            "query-store response too short: {} bytes",
            body.len()
        )));
    }
    let group = trim_fixed(&body[..FDFS_GROUP_NAME_MAX_LEN]);
    let mut offset = FDFS_GROUP_NAME_MAX_LEN;
    let ip = trim_fixed(&body[offset..offset + IP_ADDRESS_SIZE]);
    offset += IP_ADDRESS_SIZE;
    let port = read_u64(&body[offset..]) as u16;
    offset += FDFS_PROTO_PKG_LEN_SIZE;
    let store_index = body[offset];
    Ok(StorageNode {
        group,
        endpoint: Endpoint::new(ip, port),
        store_index,
    })
}

fn decode_fetch_node(body: &[u8]) -> Result<FetchNode> {
    if body.len() < QUERY_FETCH_BODY_LEN {
        return Err(ClientError::Protocol(format!(
            "query-fetch response too short: {} bytes",
            body.len()
        )));
    }
    let group = trim_fixed(&body[..FDFS_GROUP_NAME_MAX_LEN]);
    let mut offset = FDFS_GROUP_NAME_MAX_LEN;
    let ip = trim_fixed(&body[offset..offset + IP_ADDRESS_SIZE]);
    offset += IP_ADDRESS_SIZE;
    let port = read_u64(&body[offset..]) as u16;
    Ok(FetchNode {
        group,
        endpoint: Endpoint::new(ip, port),
    })
}

fn decode_stored_file(body: &[u8]) -> Result<StoredFile> {
    if body.len() <= FDFS_GROUP_NAME_MAX_LEN {
        return Err(ClientError::Protocol(format!(
            "upload response too short: {} bytes",
            body.len()
        )));
    }
    let group = trim_fixed(&body[..FDFS_GROUP_NAME_MAX_LEN]);
    let path = String::from_utf8_lossy(&body[FDFS_GROUP_NAME_MAX_LEN..]).to_string();
    Ok(StoredFile::new(group, path))
}

fn decode_group_stats(body: &[u8]) -> Result<Vec<GroupStat>> {
    if body.len() % GROUP_STAT_LEN != 0 {
        return Err(ClientError::Protocol(format!(
            "list-groups body length {} is not a multiple of {GROUP_STAT_LEN}",
            body.len()
        )));
    }
    let mut groups = Vec::with_capacity(body.len() / GROUP_STAT_LEN);
    for record in body.chunks_exact(GROUP_STAT_LEN) {
        let group_name = trim_fixed(&record[..FDFS_GROUP_NAME_MAX_LEN + 1]);
        let mut ints = &record[FDFS_GROUP_NAME_MAX_LEN + 1..];
        groups.push(GroupStat {
            group_name,
            total_mb: ints.get_u64(),
            free_mb: ints.get_u64(),
            trunk_free_mb: ints.get_u64(),
            server_count: ints.get_u64(),
            storage_port: ints.get_u64(),
            storage_http_port: ints.get_u64(),
            active_count: ints.get_u64(),
            current_write_server: ints.get_u64(),
            store_path_count: ints.get_u64(),
            subdir_count_per_path: ints.get_u64(),
            current_trunk_file_id: ints.get_u64(),
        });
    }
    Ok(groups)
}

fn decode_storage_stats(body: &[u8]) -> Result<Vec<StorageStat>> {
    if body.len() % STORAGE_STAT_LEN != 0 {
        return Err(ClientError::Protocol(format!(
            "list-storages body length {} is not a multiple of {STORAGE_STAT_LEN}",
            body.len()
        )));
    }
    let mut storages = Vec::with_capacity(body.len() / STORAGE_STAT_LEN);
    for record in body.chunks_exact(STORAGE_STAT_LEN) {
        let status = StorageStatus::from(record[0]);
        let mut offset = 1;
        let id = trim_fixed(&record[offset..offset + FDFS_STORAGE_ID_MAX_SIZE]);
        offset += FDFS_STORAGE_ID_MAX_SIZE;
        let ip_addr = trim_fixed(&record[offset..offset + IP_ADDRESS_SIZE]);
        offset += IP_ADDRESS_SIZE;
        let domain_name = trim_fixed(&record[offset..offset + FDFS_DOMAIN_NAME_MAX_SIZE]);
        offset += FDFS_DOMAIN_NAME_MAX_SIZE;
        let src_ip_addr = trim_fixed(&record[offset..offset + IP_ADDRESS_SIZE]);
        offset += IP_ADDRESS_SIZE;
        let version = trim_fixed(&record[offset..offset + FDFS_VERSION_SIZE]);
        offset += FDFS_VERSION_SIZE;
        let mut ints = &record[offset..];
        storages.push(StorageStat {
            status,
            id,
            ip_addr,
            domain_name,
            src_ip_addr,
            version,
            join_time: ints.get_u64(),
            up_time: ints.get_u64(),
            total_mb: ints.get_u64(),
            free_mb: ints.get_u64(),
            upload_priority: ints.get_u64(),
            store_path_count: ints.get_u64(),
            subdir_count_per_path: ints.get_u64(),
            current_write_path: ints.get_u64(),
            storage_port: ints.get_u64(),
            storage_http_port: ints.get_u64(),
            total_upload_count: ints.get_u64(),
            success_upload_count: ints.get_u64(),
            total_download_count: ints.get_u64(),
            success_download_count: ints.get_u64(),
            last_heart_beat_time: ints.get_u64(),
        });
    }
    Ok(storages)
}

fn decode_file_info(body: &[u8]) -> Result<FileInfo> {
    if body.len() < FILE_INFO_BODY_LEN {
        return Err(ClientError::Protocol(format!(
            "file-info response too short: {} bytes",
            body.len()
        )));
    }
    let file_size = read_u64(body);
    let create_timestamp = read_u64(&body[8..]);
    let crc32 = u32::from_be_bytes([body[16], body[17], body[18], body[19]]);
    let source_ip_addr = trim_fixed(&body[20..20 + IP_ADDRESS_SIZE]);
    Ok(FileInfo {
        file_size,
        create_time: SystemTime::UNIX_EPOCH + Duration::from_secs(create_timestamp),
        crc32,
        source_ip_addr,
    })
}

fn read_u64(data: &[u8]) -> u64 {
    let mut buf = &data[..FDFS_PROTO_PKG_LEN_SIZE];
    buf.get_u64()
}
