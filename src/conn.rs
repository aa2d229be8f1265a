//! A single TCP connection to a tracker or storage server.
//!
//! One connection serves exactly one exchange at a time; taking `&mut self`
//! for the whole round trip is what enforces it. The exchange loop owns the
//! framing: it writes the header and body, streams any upload payload in
//! bounded chunks, then reads the response header and either buffers the
//! body for the codec or feeds it chunk by chunk into the caller's sink.
//!
//! Any I/O failure, decode failure, timeout or cancellation leaves the
//! framing state indeterminate, so the connection transitions to `Broken`
//! and the pool discards it. A server-reported error (nonzero status) keeps
//! the frame boundary intact and the connection stays usable.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::{Header, Request, Response, MAX_BUFFERED_BODY};
use crate::config::ClientConfig;
use crate::errors::{ClientError, Result};
use crate::stream::{DownloadSink, UploadBody};
use crate::types::{Endpoint, FDFS_PROTO_HEADER_LEN, PROTO_CMD_RESP};

/// Chunk size for streamed response bodies.
const READ_CHUNK: usize = 64 * 1024;

/// Scratch size used when draining the body of an error response.
const DISCARD_CHUNK: usize = 8 * 1024;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    InUse,
    Broken,
    Closed,
}

pub struct Connection {
    stream: TcpStream,
    endpoint: Endpoint,
    state: ConnState,
    last_used: Instant,
    cfg: Arc<ClientConfig>,
    cancel: CancellationToken,
}

impl Connection {
    /// Establishes a connection to `endpoint`.
    ///
    /// When reconnect is enabled, connect failures are retried up to
    /// `max_reconnect` more times with a fixed pause between attempts.
    /// Cancellation is checked before each attempt; an exchange already in
    /// progress is never retried.
    pub async fn connect(
        endpoint: &Endpoint,
        cfg: Arc<ClientConfig>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let attempts = 1 + if cfg.enable_reconnect {
            cfg.max_reconnect
        } else {
            0
        };
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            match Self::connect_once(endpoint, &cfg).await {
                Ok(stream) => {
                    debug!(endpoint = %endpoint, "connected");
                    return Ok(Self {
                        stream,
                        endpoint: endpoint.clone(),
                        state: ConnState::Idle,
                        last_used: Instant::now(),
                        cfg,
                        cancel,
                    });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(e);
                    }
                    debug!(endpoint = %endpoint, attempt, error = %e, "retrying connect");
                    sleep(cfg.reconnect_interval).await;
                }
            }
        }
    }

    async fn connect_once(endpoint: &Endpoint, cfg: &ClientConfig) -> Result<TcpStream> {
        let fail = |source: std::io::Error| ClientError::Connect {
            addr: endpoint.to_string(),
            source,
        };

        let addr = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(fail)?
            .next()
            .ok_or_else(|| {
                fail(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "hostname resolved to no addresses",
                ))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(fail)?;
        socket.set_keepalive(true).map_err(fail)?;
        // The send buffer doubles as the write high-water mark: the kernel
        // blocks our chunked writes once this much is queued.
        socket
            .set_send_buffer_size(cfg.write_high_water as u32)
            .map_err(fail)?;

        let stream = match timeout(cfg.connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(fail(e)),
            Err(_) => {
                return Err(fail(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        };
        stream.set_nodelay(cfg.tcp_nodelay).map_err(fail)?;
        Ok(stream)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_broken(&self) -> bool {
        matches!(self.state, ConnState::Broken | ConnState::Closed)
    }

    /// How long this connection has sat unused.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn set_in_use(&mut self) {
        self.state = ConnState::InUse;
    }

    pub(crate) fn set_idle(&mut self) {
        self.state = ConnState::Idle;
        self.last_used = Instant::now();
    }

    /// Cheap liveness probe for idle connections.
    ///
    /// Nothing should arrive on an idle connection, so a pending byte is as
    /// fatal as a close: either way the framing can no longer be trusted.
    pub fn is_alive(&mut self) -> bool {
        if self.is_broken() {
            return false;
        }
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Ok(_) | Err(_) => {
                self.state = ConnState::Broken;
                false
            }
        }
    }

    /// Performs one request/response round trip.
    ///
    /// Streamed responses require `sink`; buffered responses are decoded by
    /// the request's paired decoder. At most one exchange is in flight;
    /// the `&mut self` receiver is the serialization.
    pub async fn exchange(
        &mut self,
        request: &mut Request,
        sink: Option<&mut dyn DownloadSink>,
    ) -> Result<Response> {
        if self.cancel.is_cancelled() {
            self.state = ConnState::Broken;
            return Err(ClientError::Cancelled);
        }
        let cancel = self.cancel.clone();
        let result = {
            let fut = self.run_exchange(request, sink);
            tokio::pin!(fut);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                r = &mut fut => r,
            }
        };
        match &result {
            Ok(_) | Err(ClientError::Server { .. }) => {
                self.last_used = Instant::now();
            }
            Err(_) => {
                self.state = ConnState::Broken;
            }
        }
        result
    }

    async fn run_exchange(
        &mut self,
        request: &mut Request,
        sink: Option<&mut dyn DownloadSink>,
    ) -> Result<Response> {
        let body = request.encode_body()?;
        let header = Header::new(
            body.len() as u64 + request.payload_len(),
            request.command(),
            0,
        );

        let mut frame = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN + body.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&body);
        self.write_timed(&frame, "request write").await?;

        if let Some(payload) = request.payload_mut() {
            self.send_payload(payload).await?;
        }

        let mut raw = [0u8; FDFS_PROTO_HEADER_LEN];
        self.read_timed(&mut raw, "response header read").await?;
        let resp = Header::decode(&raw)?;
        trace!(command = resp.command, status = resp.status, length = resp.length, "response header");
        if resp.command != PROTO_CMD_RESP {
            return Err(ClientError::Protocol(format!(
                "unexpected response command {}",
                resp.command
            )));
        }

        if resp.status != 0 {
            // The error response may still carry a body; drain it so the
            // next exchange starts on a frame boundary.
            self.discard_body(resp.length).await?;
            return Err(ClientError::Server {
                status: resp.status,
            });
        }

        if request.expects_streamed_response() {
            let sink = sink.ok_or_else(|| {
                ClientError::InvalidArgument(
                    "a streamed response requires a download sink".to_string(),
                )
            })?;
            return self.receive_streamed(resp.length, sink).await;
        }

        if resp.length > MAX_BUFFERED_BODY {
            return Err(ClientError::Protocol(format!(
                "refusing to buffer a {} byte response body",
                resp.length
            )));
        }
        let mut body = vec![0u8; resp.length as usize];
        self.read_timed(&mut body, "response body read").await?;
        request.decode_response(&body)
    }

    /// Streams the upload payload after the encoded body. The payload is
    /// never buffered whole: the socket send buffer caps queued bytes at the
    /// high-water mark and each write hands over at most a low-water-sized
    /// chunk.
    async fn send_payload(&mut self, payload: &mut UploadBody) -> Result<()> {
        let chunk_size = self.cfg.write_low_water.max(1);
        match payload {
            UploadBody::Buffer(data) => {
                let data = data.clone();
                for chunk in data.chunks(chunk_size) {
                    self.write_timed(chunk, "payload write").await?;
                }
            }
            UploadBody::Reader { reader, len } => {
                let mut remaining = *len;
                let mut buf = vec![0u8; chunk_size.min(*len as usize).max(1)];
                while remaining > 0 {
                    let want = remaining.min(buf.len() as u64) as usize;
                    let n = reader.read(&mut buf[..want]).await?;
                    if n == 0 {
                        return Err(ClientError::Protocol(format!(
                            "upload stream ended {remaining} bytes short of its declared length"
                        )));
                    }
                    self.write_timed(&buf[..n], "payload write").await?;
                    remaining -= n as u64;
                }
            }
        }
        Ok(())
    }

    /// Reads exactly `length` bytes and delivers them to the sink in arrival
    /// order, then completes the sink.
    async fn receive_streamed(
        &mut self,
        length: u64,
        sink: &mut dyn DownloadSink,
    ) -> Result<Response> {
        let mut remaining = length;
        let mut buf = vec![0u8; READ_CHUNK.min(length.max(1) as usize)];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            if let Err(e) = self.read_timed(&mut buf[..want], "download chunk read").await {
                sink.release().await;
                return Err(e);
            }
            if let Err(e) = sink.write(Bytes::copy_from_slice(&buf[..want])).await {
                sink.release().await;
                return Err(e);
            }
            remaining -= want as u64;
        }
        sink.complete().await?;
        Ok(Response::Streamed(length))
    }

    /// Reads and drops `length` bytes, keeping the connection on a frame
    /// boundary after an error response.
    async fn discard_body(&mut self, length: u64) -> Result<()> {
        let mut remaining = length;
        let mut scratch = [0u8; DISCARD_CHUNK];
        while remaining > 0 {
            let want = remaining.min(DISCARD_CHUNK as u64) as usize;
            self.read_timed(&mut scratch[..want], "error body read").await?;
            remaining -= want as u64;
        }
        Ok(())
    }

    async fn write_timed(&mut self, data: &[u8], operation: &'static str) -> Result<()> {
        match timeout(self.cfg.write_timeout, self.stream.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ClientError::Timeout { operation }),
        }
    }

    async fn read_timed(&mut self, buf: &mut [u8], operation: &'static str) -> Result<()> {
        match timeout(self.cfg.read_timeout, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ClientError::Timeout { operation }),
        }
    }

    /// Half-closes the write side and releases the transport.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
        self.state = ConnState::Closed;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    fn test_config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig::new(vec![Endpoint::new("127.0.0.1", 22122)]))
    }

    async fn local_listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn connect_refused_surfaces_connect_error() {
        // Port 1 is essentially never listening on loopback.
        let endpoint = Endpoint::new("127.0.0.1", 1);
        let err = Connection::connect(&endpoint, test_config(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[tokio::test]
    async fn fresh_connection_is_idle_and_alive() {
        let (listener, endpoint) = local_listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut conn = Connection::connect(&endpoint, test_config(), CancellationToken::new())
            .await
            .unwrap();
        let _server_side = accept.await.unwrap();

        assert_eq!(conn.state(), ConnState::Idle);
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn closed_peer_fails_the_liveness_probe() {
        let (listener, endpoint) = local_listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut conn = Connection::connect(&endpoint, test_config(), CancellationToken::new())
            .await
            .unwrap();
        drop(accept.await.unwrap());

        // Give the FIN a moment to arrive.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!conn.is_alive());
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn unsolicited_bytes_break_the_connection() {
        let (listener, endpoint) = local_listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut conn = Connection::connect(&endpoint, test_config(), CancellationToken::new())
            .await
            .unwrap();
        let mut server_side = accept.await.unwrap();
        server_side.write_all(b"!").await.unwrap();
        server_side.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_exchange() {
        let (listener, endpoint) = local_listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let token = CancellationToken::new();
        let mut conn = Connection::connect(&endpoint, test_config(), token.clone())
            .await
            .unwrap();
        let _server_side = accept.await.unwrap();

        token.cancel();
        let mut request = Request::ListGroups;
        let err = conn.exchange(&mut request, None).await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        assert!(conn.is_broken());
    }
}
