//! Control channel client used on the source host.
//!
//! Each request opens a new TCP connection, sends one JSON line, reads one
//! JSON line back and closes the connection.
//!
//! ```rust,ignore
//! use magikmigrate::client::PeerClient;
//!
//! let peer = PeerClient::new("node-b:7788");
//! peer.setup("4f1c2a", MigrationMode::Live).await?;
//! ```

use crate::config::MigrationMode;
use crate::constants::{CHECKPOINT_TIMEOUT, PEER_REQUEST_TIMEOUT};
use crate::error::{Error, Result};
use crate::peer::{CheckpointRef, RemotePeer};
use crate::protocol::{Request, Response, ResponseData};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Client side of the control channel.
#[derive(Debug, Clone)]
pub struct PeerClient {
    addr: String,
    timeout: Duration,
    restore_timeout: Duration,
}

impl PeerClient {
    /// Creates a client for `host:port`.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: PEER_REQUEST_TIMEOUT,
            restore_timeout: CHECKPOINT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how long to wait for the destination to finish a restore.
    #[must_use]
    pub fn with_restore_timeout(mut self, timeout: Duration) -> Self {
        self.restore_timeout = timeout;
        self
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Checks that the destination is serving; returns its version and
    /// the number of iterations it has seen.
    pub async fn ping(&self) -> Result<(String, u32)> {
        match self.send_request(&Request::Ping).await? {
            Some(ResponseData::Pong { version, iteration }) => Ok((version, iteration)),
            other => Err(unexpected("pong", other)),
        }
    }

    async fn send_request(&self, request: &Request) -> Result<Option<ResponseData>> {
        let reply_timeout = match request {
            Request::Restore { .. } => self.restore_timeout,
            _ => self.timeout,
        };
        let timed_out = |step: &str, duration: Duration| Error::Timeout {
            operation: format!("{step} {} to {}", request.action(), self.addr),
            duration,
        };

        let stream = timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| timed_out("connect for", self.timeout))??;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let line = request.to_json_line()?;
        timeout(self.timeout, writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| timed_out("send", self.timeout))??;
        writer.flush().await?;

        let mut response_line = String::new();
        let read = timeout(reply_timeout, reader.read_line(&mut response_line))
            .await
            .map_err(|_| timed_out("await reply to", reply_timeout))??;
        if read == 0 {
            return Err(Error::Protocol(format!(
                "peer closed connection without answering {}",
                request.action()
            )));
        }

        let response = Response::from_json(&response_line)
            .map_err(|e| Error::Protocol(format!("malformed response: {e}")))?;
        debug!(action = request.action(), ok = response.is_ok(), "peer replied");

        match response {
            Response::Ok(payload) => Ok(payload.data),
            Response::Error(err) => Err(Error::Remote {
                code: err.code.to_string(),
                message: err.message,
            }),
        }
    }

    async fn send_ack(&self, request: &Request) -> Result<()> {
        self.send_request(request).await.map(|_| ())
    }

    async fn send_check(&self, request: &Request) -> Result<Option<bool>> {
        match self.send_request(request).await? {
            Some(ResponseData::Check { matched }) => Ok(matched),
            other => Err(unexpected("check", other)),
        }
    }
}

fn unexpected(expected: &str, got: Option<ResponseData>) -> Error {
    Error::Protocol(format!("unexpected response: expected {expected}, got {got:?}"))
}

#[async_trait]
impl RemotePeer for PeerClient {
    async fn setup(&self, container_id: &str, mode: MigrationMode) -> Result<()> {
        self.send_ack(&Request::Setup {
            container_id: container_id.to_string(),
            mode,
        })
        .await
    }

    async fn start_iteration(&self, is_final: bool) -> Result<()> {
        self.send_ack(&Request::StartIteration { is_final }).await
    }

    async fn end_iteration(&self) -> Result<()> {
        self.send_ack(&Request::EndIteration).await
    }

    async fn send_cpu_info(&self, data: &[u8]) -> Result<()> {
        self.send_ack(&Request::PutCpuInfo {
            data: hex::encode(data),
        })
        .await
    }

    async fn check_cpu_info(&self) -> Result<Option<bool>> {
        self.send_check(&Request::CheckCpuInfo).await
    }

    async fn check_tool_version(&self, version: &str) -> Result<Option<bool>> {
        self.send_check(&Request::CheckToolVersion {
            version: version.to_string(),
        })
        .await
    }

    async fn set_memory_tracking(&self, enabled: bool) -> Result<()> {
        self.send_ack(&Request::MemoryTracking { enabled }).await
    }

    async fn restore_from_images(
        &self,
        container_id: &str,
        checkpoint: &CheckpointRef,
    ) -> Result<()> {
        self.send_ack(&Request::Restore {
            container_id: container_id.to_string(),
            checkpoint: checkpoint.clone(),
        })
        .await
    }
}
