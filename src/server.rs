//! Control channel server run on the destination host.
//!
//! Answers the requests of [`crate::client::PeerClient`]. Session state is
//! shared between connections behind an `RwLock`; a new `setup` request
//! replaces whatever session existed before.
//!
//! The host-specific work (CPU descriptor check, tool version, restore) goes
//! through [`RestoreTarget`]. [`LocalRestoreTarget`] implements it with the
//! `criu` binary and the container engine's checkpoint CLI.

use crate::checkpoint::CheckpointInvoker;
use crate::config::MigrationMode;
use crate::constants::{
    CPUINFO_IMAGE, MAX_CONNECTIONS, MAX_CPUINFO_SIZE, MAX_REQUEST_LINE_LEN, PEER_CPUINFO_DIR,
    PEER_REQUEST_TIMEOUT,
};
use crate::criu::{CheckpointService, CriuCli, versions_compatible};
use crate::error::Result;
use crate::peer::CheckpointRef;
use crate::protocol::{ErrorCode, Request, Response, ResponseData};
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Destination-side operations behind the control channel.
#[async_trait]
pub trait RestoreTarget: Send + Sync {
    /// Checks the CPU descriptor stored in `dir` against the local CPU.
    async fn check_cpu_info(&self, dir: &Path) -> Result<bool>;

    /// Local checkpoint tool version.
    async fn tool_version(&self) -> Result<Option<String>>;

    /// Starts the container from a transferred checkpoint.
    async fn restore(&self, container_id: &str, checkpoint: &CheckpointRef) -> Result<()>;
}

/// [`RestoreTarget`] over the local `criu` binary and container engine.
#[derive(Debug, Clone)]
pub struct LocalRestoreTarget {
    criu: CriuCli,
    invoker: CheckpointInvoker,
}

impl LocalRestoreTarget {
    pub fn new(criu: CriuCli, invoker: CheckpointInvoker) -> Self {
        Self { criu, invoker }
    }
}

#[async_trait]
impl RestoreTarget for LocalRestoreTarget {
    async fn check_cpu_info(&self, dir: &Path) -> Result<bool> {
        self.criu.check_cpu_info(dir).await
    }

    async fn tool_version(&self) -> Result<Option<String>> {
        self.criu.tool_version().await
    }

    async fn restore(&self, container_id: &str, checkpoint: &CheckpointRef) -> Result<()> {
        self.invoker
            .final_restore(container_id, &checkpoint.name, &checkpoint.image_dir)
            .await
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Destination view of the current migration session.
#[derive(Debug, Default)]
struct SessionState {
    container_id: Option<String>,
    mode: MigrationMode,
    /// Iterations started so far.
    iteration: u32,
    in_iteration: bool,
    final_started: bool,
    cpuinfo_received: bool,
    memory_tracking: bool,
    restored: bool,
}

// =============================================================================
// Server
// =============================================================================

/// Control channel server.
#[derive(Clone)]
pub struct PeerServer {
    work_dir: PathBuf,
    target: Arc<dyn RestoreTarget>,
    state: Arc<RwLock<SessionState>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for PeerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerServer")
            .field("work_dir", &self.work_dir)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl PeerServer {
    pub fn new(work_dir: impl Into<PathBuf>, target: Arc<dyn RestoreTarget>) -> Self {
        Self {
            work_dir: work_dir.into(),
            target,
            state: Arc::new(RwLock::new(SessionState::default())),
            request_timeout: PEER_REQUEST_TIMEOUT,
        }
    }

    /// Sets how long a client may take to send its request line.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn cpuinfo_dir(&self) -> PathBuf {
        self.work_dir.join(PEER_CPUINFO_DIR)
    }

    /// Binds `listen` and serves until `shutdown` resolves.
    pub async fn run(self, listen: &str, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = match TcpListener::bind(listen).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, listen, "failed to bind control server");
                return Err(e.into());
            }
        };
        self.serve(listener, shutdown).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "control server listening");
        let connection_count = Arc::new(AtomicUsize::new(0));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("control server shutting down");
                    return Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let current = connection_count.load(Ordering::Relaxed);
                            if current >= MAX_CONNECTIONS {
                                warn!(addr = %addr, max = MAX_CONNECTIONS, "connection rejected: limit reached");
                                continue;
                            }

                            debug!(addr = %addr, "control connection accepted");
                            let server = self.clone();
                            let counter = Arc::clone(&connection_count);
                            counter.fetch_add(1, Ordering::Relaxed);

                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    debug!(error = %e, "control connection error");
                                }
                                counter.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader).take(MAX_REQUEST_LINE_LEN as u64 + 1);
        let mut line = String::new();

        let read = tokio::time::timeout(self.request_timeout, reader.read_line(&mut line)).await;
        let response = match read {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) if n > MAX_REQUEST_LINE_LEN => {
                Response::error(ErrorCode::InvalidRequest, "request too large")
            }
            Ok(Ok(_)) => match Request::from_json(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    Response::error(ErrorCode::InvalidRequest, format!("JSON parse error: {e}"))
                }
            },
            Ok(Err(e)) => Response::error(ErrorCode::Internal, format!("read error: {e}")),
            Err(_) => Response::error(ErrorCode::InvalidRequest, "request timed out"),
        };

        let response_line = response.to_json_line()?;
        writer.write_all(response_line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Handles a parsed request.
    pub async fn handle_request(&self, request: Request) -> Response {
        debug!(action = request.action(), "control request");
        match request {
            Request::Setup { container_id, mode } => self.handle_setup(container_id, mode).await,
            Request::StartIteration { is_final } => self.handle_start_iteration(is_final).await,
            Request::EndIteration => self.handle_end_iteration().await,
            Request::PutCpuInfo { data } => self.handle_put_cpu_info(&data).await,
            Request::CheckCpuInfo => self.handle_check_cpu_info().await,
            Request::CheckToolVersion { version } => self.handle_check_tool_version(&version).await,
            Request::MemoryTracking { enabled } => self.handle_memory_tracking(enabled).await,
            Request::Restore {
                container_id,
                checkpoint,
            } => self.handle_restore(&container_id, &checkpoint).await,
            Request::Ping => self.handle_ping().await,
        }
    }

    async fn handle_setup(&self, container_id: String, mode: MigrationMode) -> Response {
        if container_id.is_empty() {
            return Response::error(ErrorCode::InvalidRequest, "empty container id");
        }
        let mut s = self.state.write().await;
        if let Some(previous) = &s.container_id
            && !s.restored
        {
            warn!(previous = %previous, "replacing unfinished migration session");
        }
        info!(container = %container_id, mode = %mode, "migration session opened");
        *s = SessionState {
            container_id: Some(container_id),
            mode,
            ..SessionState::default()
        };
        Response::ok()
    }

    async fn handle_start_iteration(&self, is_final: bool) -> Response {
        let mut s = self.state.write().await;
        if s.container_id.is_none() {
            return no_session();
        }
        if s.in_iteration {
            return Response::error(
                ErrorCode::BadSequence,
                format!("iteration {} still open", s.iteration),
            );
        }
        if s.final_started {
            return Response::error(ErrorCode::BadSequence, "final iteration already started");
        }
        s.iteration += 1;
        s.in_iteration = true;
        s.final_started = is_final;
        info!(iteration = s.iteration, is_final, "iteration started");
        Response::ok()
    }

    async fn handle_end_iteration(&self) -> Response {
        let mut s = self.state.write().await;
        if s.container_id.is_none() {
            return no_session();
        }
        if !s.in_iteration {
            return Response::error(ErrorCode::BadSequence, "no iteration open");
        }
        s.in_iteration = false;
        debug!(iteration = s.iteration, "iteration ended");
        Response::ok()
    }

    async fn handle_put_cpu_info(&self, data: &str) -> Response {
        if self.state.read().await.container_id.is_none() {
            return no_session();
        }
        let bytes = match hex::decode(data) {
            Ok(b) => b,
            Err(e) => return Response::error(ErrorCode::InvalidRequest, format!("bad hex: {e}")),
        };
        if bytes.is_empty() || bytes.len() > MAX_CPUINFO_SIZE {
            return Response::error(
                ErrorCode::CpuInfo,
                format!("descriptor size {} out of range", bytes.len()),
            );
        }

        let dir = self.cpuinfo_dir();
        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join(CPUINFO_IMAGE), &bytes).await
        }
        .await;
        if let Err(e) = written {
            return Response::error(ErrorCode::Internal, format!("cannot store descriptor: {e}"));
        }

        self.state.write().await.cpuinfo_received = true;
        debug!(bytes = bytes.len(), "CPU descriptor stored");
        Response::ok()
    }

    async fn handle_check_cpu_info(&self) -> Response {
        {
            let s = self.state.read().await;
            if s.container_id.is_none() {
                return no_session();
            }
            if !s.cpuinfo_received {
                return Response::error(ErrorCode::CpuInfo, "no CPU descriptor uploaded");
            }
        }
        let matched = match self.target.check_cpu_info(&self.cpuinfo_dir()).await {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "CPU descriptor check could not run");
                None
            }
        };
        info!(matched = ?matched, "CPU descriptor checked");
        Response::ok_with_data(ResponseData::Check { matched })
    }

    async fn handle_check_tool_version(&self, version: &str) -> Response {
        if self.state.read().await.container_id.is_none() {
            return no_session();
        }
        let matched = match self.target.tool_version().await {
            Ok(Some(local)) => {
                let ok = versions_compatible(version, &local);
                info!(remote = version, local = %local, compatible = ok, "tool version checked");
                Some(ok)
            }
            Ok(None) => {
                warn!("local tool version unknown");
                None
            }
            Err(e) => {
                warn!(error = %e, "tool version query failed");
                None
            }
        };
        Response::ok_with_data(ResponseData::Check { matched })
    }

    async fn handle_memory_tracking(&self, enabled: bool) -> Response {
        let mut s = self.state.write().await;
        if s.container_id.is_none() {
            return no_session();
        }
        s.memory_tracking = enabled;
        info!(enabled, mode = %s.mode, "memory tracking announced");
        Response::ok()
    }

    async fn handle_restore(&self, container_id: &str, checkpoint: &CheckpointRef) -> Response {
        {
            let s = self.state.read().await;
            match &s.container_id {
                None => return no_session(),
                Some(id) if id != container_id => {
                    return Response::error(
                        ErrorCode::InvalidRequest,
                        format!("session is for '{id}', not '{container_id}'"),
                    );
                }
                Some(_) => {}
            }
            if s.in_iteration {
                return Response::error(ErrorCode::BadSequence, "iteration still open");
            }
        }

        info!(
            container = container_id,
            checkpoint = %checkpoint.name,
            image = %checkpoint.image_dir.display(),
            "restoring container"
        );
        if let Err(e) = self.target.restore(container_id, checkpoint).await {
            error!(container = container_id, error = %e, "restore failed");
            return Response::error(ErrorCode::RestoreFailed, e.to_string());
        }
        self.state.write().await.restored = true;
        Response::ok()
    }

    async fn handle_ping(&self) -> Response {
        let s = self.state.read().await;
        Response::ok_with_data(ResponseData::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
            iteration: s.iteration,
        })
    }
}

fn no_session() -> Response {
    Response::error(ErrorCode::NoSession, "no migration session, send setup first")
}
