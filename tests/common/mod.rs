//! In-process FastDFS servers for integration tests.
//!
//! One mock tracker and one mock storage run on loopback, speaking enough of
//! the wire protocol for every client operation: the tracker answers
//! query/list commands pointing at the mock storage, and the storage keeps
//! uploaded files in a map. Connections are served exchange after exchange,
//! so pooled connection reuse is exercised for real.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

const HEADER_LEN: usize = 10;
const GROUP_LEN: usize = 16;
const IP_LEN: usize = 16;
const EXT_LEN: usize = 6;
const PREFIX_LEN: usize = 16;
const RESP: u8 = 100;

const GROUP_STAT_LEN: usize = 17 + 11 * 8;
const STORAGE_STAT_LEN: usize = 1 + 16 + 16 + 128 + 16 + 8 + 15 * 8;

#[derive(Default)]
pub struct ClusterOptions {
    /// Artificial pause before a storage answers an upload; used to hold
    /// pool slots open in concurrency tests.
    pub upload_delay: Duration,
}

struct ClusterState {
    group: String,
    storage_port: u16,
    files: Mutex<HashMap<String, Vec<u8>>>,
    metas: Mutex<HashMap<String, Vec<u8>>>,
    seq: AtomicU64,
    options: ClusterOptions,
}

pub struct MockCluster {
    state: Arc<ClusterState>,
    tracker_port: u16,
}

impl MockCluster {
    pub async fn start() -> Self {
        Self::start_with(ClusterOptions::default()).await
    }

    pub async fn start_with(options: ClusterOptions) -> Self {
        let storage_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let storage_port = storage_listener.local_addr().unwrap().port();
        let tracker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tracker_port = tracker_listener.local_addr().unwrap().port();

        let state = Arc::new(ClusterState {
            group: "group1".to_string(),
            storage_port,
            files: Mutex::new(HashMap::new()),
            metas: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            options,
        });

        let tracker_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = tracker_listener.accept().await {
                let state = tracker_state.clone();
                tokio::spawn(async move {
                    let _ = serve_tracker(stream, state).await;
                });
            }
        });

        let storage_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = storage_listener.accept().await {
                let state = storage_state.clone();
                tokio::spawn(async move {
                    let _ = serve_storage(stream, state).await;
                });
            }
        });

        Self {
            state,
            tracker_port,
        }
    }

    pub fn tracker_addr(&self) -> String {
        format!("127.0.0.1:{}", self.tracker_port)
    }

    pub async fn stored_file_count(&self) -> usize {
        self.state.files.lock().await.len()
    }
}

fn be64(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    u64::from_be_bytes(buf)
}

fn trim(data: &[u8]) -> String {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&data[..end]).to_string()
}

fn pad(s: &str, width: usize) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.truncate(width);
    out.resize(width, 0);
    out
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; HEADER_LEN];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = be64(&header[..8]) as usize;
    let cmd = header[8];
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some((cmd, body)))
}

async fn reply(stream: &mut TcpStream, status: u8, body: &[u8]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.push(RESP);
    frame.push(status);
    frame.extend_from_slice(body);
    stream.write_all(&frame).await?;
    stream.flush().await
}

async fn serve_tracker(mut stream: TcpStream, state: Arc<ClusterState>) -> std::io::Result<()> {
    while let Some((cmd, _body)) = read_frame(&mut stream).await? {
        match cmd {
            // query-store, with or without group
            101 | 104 => {
                let mut body = Vec::new();
                body.extend_from_slice(&pad(&state.group, GROUP_LEN));
                body.extend_from_slice(&pad("127.0.0.1", IP_LEN));
                body.extend_from_slice(&(state.storage_port as u64).to_be_bytes());
                body.push(0);
                reply(&mut stream, 0, &body).await?;
            }
            // query-fetch / query-update
            102 | 103 => {
                let mut body = Vec::new();
                body.extend_from_slice(&pad(&state.group, GROUP_LEN));
                body.extend_from_slice(&pad("127.0.0.1", IP_LEN));
                body.extend_from_slice(&(state.storage_port as u64).to_be_bytes());
                reply(&mut stream, 0, &body).await?;
            }
            // list one group / list all groups
            90 | 91 => {
                let mut body = Vec::new();
                body.extend_from_slice(&pad(&state.group, GROUP_LEN + 1));
                body.extend_from_slice(&10240u64.to_be_bytes()); // total_mb
                body.extend_from_slice(&8192u64.to_be_bytes()); // free_mb
                body.extend_from_slice(&0u64.to_be_bytes()); // trunk_free_mb
                body.extend_from_slice(&1u64.to_be_bytes()); // server count
                body.extend_from_slice(&(state.storage_port as u64).to_be_bytes());
                for _ in 0..6 {
                    body.extend_from_slice(&0u64.to_be_bytes());
                }
                assert_eq!(body.len(), GROUP_STAT_LEN);
                reply(&mut stream, 0, &body).await?;
            }
            // list storages
            92 => {
                let mut body = Vec::new();
                body.push(7); // active
                body.extend_from_slice(&pad("storage01", 16));
                body.extend_from_slice(&pad("127.0.0.1", IP_LEN));
                body.extend_from_slice(&pad("", 128));
                body.extend_from_slice(&pad("127.0.0.1", IP_LEN));
                body.extend_from_slice(&pad("6.9.5", 8));
                for _ in 0..15 {
                    body.extend_from_slice(&1u64.to_be_bytes());
                }
                assert_eq!(body.len(), STORAGE_STAT_LEN);
                reply(&mut stream, 0, &body).await?;
            }
            _ => reply(&mut stream, 22, &[]).await?,
        }
    }
    Ok(())
}

async fn serve_storage(mut stream: TcpStream, state: Arc<ClusterState>) -> std::io::Result<()> {
    while let Some((cmd, body)) = read_frame(&mut stream).await? {
        match cmd {
            // upload / upload appender
            11 | 23 => {
                tokio::time::sleep(state.options.upload_delay).await;
                let size = be64(&body[1..9]) as usize;
                let ext = trim(&body[9..9 + EXT_LEN]);
                let content = body[9 + EXT_LEN..].to_vec();
                assert_eq!(content.len(), size, "upload size field must match payload");

                let seq = state.seq.fetch_add(1, Ordering::Relaxed);
                let path = if ext.is_empty() {
                    format!("M00/00/00/{seq:08x}")
                } else {
                    format!("M00/00/00/{seq:08x}.{ext}")
                };
                state
                    .files
                    .lock()
                    .await
                    .insert(format!("{}/{}", state.group, path), content);

                let mut resp = Vec::new();
                resp.extend_from_slice(&pad(&state.group, GROUP_LEN));
                resp.extend_from_slice(path.as_bytes());
                reply(&mut stream, 0, &resp).await?;
            }
            // upload slave
            21 => {
                let master_len = be64(&body[..8]) as usize;
                let size = be64(&body[8..16]) as usize;
                let prefix = trim(&body[16..16 + PREFIX_LEN]);
                let ext = trim(&body[16 + PREFIX_LEN..16 + PREFIX_LEN + EXT_LEN]);
                let rest = &body[16 + PREFIX_LEN + EXT_LEN..];
                let master = String::from_utf8_lossy(&rest[..master_len]).to_string();
                let content = rest[master_len..].to_vec();
                assert_eq!(content.len(), size);

                let stem = master.rsplit_once('.').map(|(s, _)| s).unwrap_or(&master);
                let path = if ext.is_empty() {
                    format!("{stem}{prefix}")
                } else {
                    format!("{stem}{prefix}.{ext}")
                };
                state
                    .files
                    .lock()
                    .await
                    .insert(format!("{}/{}", state.group, path), content);

                let mut resp = Vec::new();
                resp.extend_from_slice(&pad(&state.group, GROUP_LEN));
                resp.extend_from_slice(path.as_bytes());
                reply(&mut stream, 0, &resp).await?;
            }
            // download
            14 => {
                let offset = be64(&body[..8]) as usize;
                let length = be64(&body[8..16]) as usize;
                let group = trim(&body[16..16 + GROUP_LEN]);
                let path = String::from_utf8_lossy(&body[16 + GROUP_LEN..]).to_string();

                let files = state.files.lock().await;
                match files.get(&format!("{group}/{path}")) {
                    Some(content) => {
                        let start = offset.min(content.len());
                        let end = if length == 0 {
                            content.len()
                        } else {
                            (start + length).min(content.len())
                        };
                        let slice = content[start..end].to_vec();
                        drop(files);
                        reply(&mut stream, 0, &slice).await?;
                    }
                    None => {
                        drop(files);
                        reply(&mut stream, 2, &[]).await?;
                    }
                }
            }
            // delete
            12 => {
                let group = trim(&body[..GROUP_LEN]);
                let path = String::from_utf8_lossy(&body[GROUP_LEN..]).to_string();
                let key = format!("{group}/{path}");
                let removed = state.files.lock().await.remove(&key).is_some();
                state.metas.lock().await.remove(&key);
                reply(&mut stream, if removed { 0 } else { 2 }, &[]).await?;
            }
            // set metadata
            13 => {
                let path_len = be64(&body[..8]) as usize;
                let meta_len = be64(&body[8..16]) as usize;
                let group = trim(&body[17..17 + GROUP_LEN]);
                let rest = &body[17 + GROUP_LEN..];
                let path = String::from_utf8_lossy(&rest[..path_len]).to_string();
                let meta = rest[path_len..path_len + meta_len].to_vec();
                state
                    .metas
                    .lock()
                    .await
                    .insert(format!("{group}/{path}"), meta);
                reply(&mut stream, 0, &[]).await?;
            }
            // get metadata
            15 => {
                let group = trim(&body[..GROUP_LEN]);
                let path = String::from_utf8_lossy(&body[GROUP_LEN..]).to_string();
                let metas = state.metas.lock().await;
                let meta = metas
                    .get(&format!("{group}/{path}"))
                    .cloned()
                    .unwrap_or_default();
                drop(metas);
                reply(&mut stream, 0, &meta).await?;
            }
            // query file info
            22 => {
                let group = trim(&body[..GROUP_LEN]);
                let path = String::from_utf8_lossy(&body[GROUP_LEN..]).to_string();
                let files = state.files.lock().await;
                match files.get(&format!("{group}/{path}")) {
                    Some(content) => {
                        let mut resp = Vec::new();
                        resp.extend_from_slice(&(content.len() as u64).to_be_bytes());
                        resp.extend_from_slice(&1_700_000_000u64.to_be_bytes());
                        resp.extend_from_slice(&0u32.to_be_bytes());
                        resp.extend_from_slice(&pad("127.0.0.1", IP_LEN));
                        drop(files);
                        reply(&mut stream, 0, &resp).await?;
                    }
                    None => {
                        drop(files);
                        reply(&mut stream, 2, &[]).await?;
                    }
                }
            }
            // append
            24 => {
                let path_len = be64(&body[..8]) as usize;
                let size = be64(&body[8..16]) as usize;
                let rest = &body[16..];
                let path = String::from_utf8_lossy(&rest[..path_len]).to_string();
                let content = &rest[path_len..path_len + size];

                let mut files = state.files.lock().await;
                match files.get_mut(&format!("{}/{}", state.group, path)) {
                    Some(existing) => {
                        existing.extend_from_slice(content);
                        drop(files);
                        reply(&mut stream, 0, &[]).await?;
                    }
                    None => {
                        drop(files);
                        reply(&mut stream, 2, &[]).await?;
                    }
                }
            }
            // modify
            34 => {
                let path_len = be64(&body[..8]) as usize;
                let offset = be64(&body[8..16]) as usize;
                let size = be64(&body[16..24]) as usize;
                let rest = &body[24..];
                let path = String::from_utf8_lossy(&rest[..path_len]).to_string();
                let content = &rest[path_len..path_len + size];

                let mut files = state.files.lock().await;
                match files.get_mut(&format!("{}/{}", state.group, path)) {
                    Some(existing) => {
                        if existing.len() < offset + size {
                            existing.resize(offset + size, 0);
                        }
                        existing[offset..offset + size].copy_from_slice(content);
                        drop(files);
                        reply(&mut stream, 0, &[]).await?;
                    }
                    None => {
                        drop(files);
                        reply(&mut stream, 2, &[]).await?;
                    }
                }
            }
            // truncate
            36 => {
                let path_len = be64(&body[..8]) as usize;
                let new_size = be64(&body[8..16]) as usize;
                let rest = &body[16..];
                let path = String::from_utf8_lossy(&rest[..path_len]).to_string();

                let mut files = state.files.lock().await;
                match files.get_mut(&format!("{}/{}", state.group, path)) {
                    Some(existing) => {
                        existing.resize(new_size, 0);
                        drop(files);
                        reply(&mut stream, 0, &[]).await?;
                    }
                    None => {
                        drop(files);
                        reply(&mut stream, 2, &[]).await?;
                    }
                }
            }
            _ => reply(&mut stream, 22, &[]).await?,
        }
    }
    Ok(())
}
