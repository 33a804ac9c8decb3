//! # Migration Orchestrator
//!
//! Drives one live migration attempt from the source host.
//!
//! ## Phases
//!
//! ```text
//! Init ─► Validating ─► PreliminarySync ─► PreDumpIter(0..6) ─► FinalDump
//!                                                                  │
//!            Completed ◄─ RestoreRequested ◄─ FinalSync ◄──────────┘
//! ```
//!
//! Every step is awaited before the next one starts. Each pre-dump depends
//! on the image directory of the previous one as its parent, so nothing is
//! pipelined across iterations.
//!
//! ## Failure Handling
//!
//! | Where                              | Effect                                    |
//! |------------------------------------|-------------------------------------------|
//! | Init through FinalDump             | error returned, nothing rolled back       |
//! | FinalSync, RestoreRequested        | failure hook runs once, error returned    |
//! | after the peer accepted a restore  | logged with `warn!`, report still returned|
//!
//! The critical section starts at FinalSync and ends when the destination
//! accepts the restore. Only failures inside it run the worker's failure
//! hook; a failure while closing the final iteration is returned like any
//! other pre-copy error. Once the destination accepted the restore the
//! migration is committed and nothing on the source side can undo it.
//!
//! ## Pre-Copy Bound
//!
//! The pre-dump loop always runs [`MAX_PRE_DUMP_ITERATIONS`] rounds when
//! enabled. There is no convergence signal.

use crate::config::{MigrationMode, MigrationOptions, PreDumpMode};
use crate::constants::MAX_PRE_DUMP_ITERATIONS;
use crate::criu::CheckpointService;
use crate::error::{Error, Result};
use crate::fs::{FsDriverProvider, FsSyncDriver};
use crate::images::{CheckpointImageDirectory, ImageManager};
use crate::peer::{CheckpointRef, RemotePeer};
use crate::stats::{MigrationReport, MigrationStats};
use crate::worker::{MigrationWorker, WorkerProvider};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Init,
    Validating,
    PreliminarySync,
    /// Pre-dump round, 0-based.
    PreDumpIter(u32),
    FinalDump,
    FinalSync,
    RestoreRequested,
    Completed,
    Failed,
}

impl MigrationPhase {
    /// True for phases where a failure runs the failure hook.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::FinalSync | Self::RestoreRequested)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Validating => write!(f, "validating"),
            Self::PreliminarySync => write!(f, "preliminary sync"),
            Self::PreDumpIter(n) => write!(f, "pre-dump iteration {n}"),
            Self::FinalDump => write!(f, "final dump"),
            Self::FinalSync => write!(f, "final sync"),
            Self::RestoreRequested => write!(f, "restore requested"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Collaborators of a session.
pub struct SessionDeps {
    pub workers: Box<dyn WorkerProvider>,
    pub fs: Box<dyn FsDriverProvider>,
    pub images: Box<dyn ImageManager>,
    pub service: Box<dyn CheckpointService>,
    pub peer: Box<dyn RemotePeer>,
}

/// One migration attempt.
pub struct MigrationSession {
    id: Uuid,
    mode: MigrationMode,
    options: MigrationOptions,
    phase: MigrationPhase,
    failed_at: Option<MigrationPhase>,
    worker: Box<dyn MigrationWorker>,
    fs: Box<dyn FsSyncDriver>,
    images: Box<dyn ImageManager>,
    service: Box<dyn CheckpointService>,
    peer: Box<dyn RemotePeer>,
    stats: MigrationStats,
}

impl std::fmt::Debug for MigrationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationSession")
            .field("id", &self.id)
            .field("container", &self.worker.identity().full_id)
            .field("mode", &self.mode)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl MigrationSession {
    /// Resolves the container, binds a filesystem driver and opens the
    /// session on the destination.
    pub async fn open(
        container_id: &str,
        mode: MigrationMode,
        options: MigrationOptions,
        deps: SessionDeps,
    ) -> Result<Self> {
        let SessionDeps {
            workers,
            fs,
            images,
            service,
            peer,
        } = deps;

        if options.to.is_empty() {
            return Err(Error::Setup("no destination host given".into()));
        }

        let worker = workers.open_worker(container_id).await?;
        let full_id = worker.identity().full_id.clone();

        let fs = fs
            .driver_for(worker.path_set(), images.work_dir())
            .ok_or_else(|| Error::NoFsDriver(format!("cannot sync filesystem of {full_id}")))?;

        peer.setup(&full_id, mode).await?;

        let id = Uuid::now_v7();
        info!(
            session = %id,
            container = %full_id,
            target = %options.to,
            mode = %mode,
            images = %images.work_dir().display(),
            "migration session opened"
        );
        let stats = MigrationStats::handle_start(id, &full_id, &options.to);

        Ok(Self {
            id,
            mode,
            options,
            phase: MigrationPhase::Init,
            failed_at: None,
            worker,
            fs,
            images,
            service,
            peer,
            stats,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Phase that was active when the session failed.
    pub fn failed_at(&self) -> Option<MigrationPhase> {
        self.failed_at
    }

    pub fn worker(&self) -> &dyn MigrationWorker {
        self.worker.as_ref()
    }

    /// Runs the migration to a terminal phase.
    ///
    /// Returns the report once the destination accepted the restore, even
    /// if cleanup afterwards fails.
    pub async fn run(&mut self) -> Result<MigrationReport> {
        if self.phase != MigrationPhase::Init {
            return Err(Error::Internal(format!(
                "session {} already ran (phase {})",
                self.id, self.phase
            )));
        }

        let image = match self.precopy().await {
            Ok(image) => image,
            Err(e) => return Err(self.fail(e)),
        };

        if let Err(e) = self.commit_to_target(&image).await {
            let failed_in = self.phase;
            let e = self.fail(e);
            warn!(phase = %failed_in, "critical section failed, invoking failure hook");
            if let Err(hook_err) = self.worker.migration_fail(Some(&image)).await {
                error!(error = %hook_err, "failure hook failed");
            }
            return Err(e);
        }

        Ok(self.finish(&image).await)
    }

    fn enter(&mut self, phase: MigrationPhase) {
        info!(container = %self.worker.identity().short_id, phase = %phase, "migration phase");
        self.phase = phase;
    }

    fn fail(&mut self, e: Error) -> Error {
        error!(
            container = %self.worker.identity().full_id,
            phase = %self.phase,
            error = %e,
            "migration failed"
        );
        self.failed_at = Some(self.phase);
        self.phase = MigrationPhase::Failed;
        e
    }

    // =========================================================================
    // Pre-Copy
    // =========================================================================

    /// Validation through the final dump; returns the final image directory.
    async fn precopy(&mut self) -> Result<CheckpointImageDirectory> {
        self.enter(MigrationPhase::Validating);
        self.validate().await?;

        let use_pre_dumps = self.mode.is_live() && self.check_use_pre_dumps().await;
        self.peer.set_memory_tracking(use_pre_dumps).await?;

        self.enter(MigrationPhase::PreliminarySync);
        let fs = self.fs.start_migration().await?;
        self.stats.handle_preliminary(fs);

        if use_pre_dumps {
            for iteration in 0..MAX_PRE_DUMP_ITERATIONS {
                self.enter(MigrationPhase::PreDumpIter(iteration));
                self.pre_dump_iteration(iteration).await?;
            }
        }

        self.enter(MigrationPhase::FinalDump);
        self.peer.start_iteration(true).await?;
        let image = self.images.new_image_dir()?;
        self.worker.final_dump(&image).await?;
        self.peer.end_iteration().await?;
        Ok(image)
    }

    async fn validate(&mut self) -> Result<()> {
        if self.options.force {
            info!("compatibility checks skipped (force)");
            return Ok(());
        }
        if self.options.skip_cpu_check {
            info!("CPU check skipped");
        } else {
            self.validate_cpu().await?;
        }
        if self.options.skip_tool_version_check {
            info!("tool version check skipped");
        } else {
            self.validate_tool_version().await?;
        }
        Ok(())
    }

    async fn validate_cpu(&self) -> Result<()> {
        let dump = self
            .service
            .dump_cpu_info(&self.images.cpuinfo_dir())
            .await?;
        if dump.is_unsupported() {
            warn!("CPU descriptor dump not supported, skipping CPU check");
            return Ok(());
        }
        if !dump.success {
            return Err(Error::Protocol(format!(
                "CPU descriptor dump failed (errno {:?})",
                dump.errno
            )));
        }

        self.images.send_cpuinfo(self.peer.as_ref()).await?;
        match self.peer.check_cpu_info().await? {
            Some(true) => {
                info!("CPUs match");
                Ok(())
            }
            Some(false) => Err(Error::Validation("CPUs mismatch".into())),
            None => Err(Error::Validation(
                "destination could not compare CPUs".into(),
            )),
        }
    }

    async fn validate_tool_version(&self) -> Result<()> {
        // A failing query is a fault; only a missing answer is a mismatch.
        let Some(version) = self.service.tool_version().await? else {
            return Err(Error::Validation(
                "checkpoint tool version unavailable".into(),
            ));
        };
        match self.peer.check_tool_version(&version).await? {
            Some(true) => {
                info!(version = %version, "checkpoint tool versions compatible");
                Ok(())
            }
            _ => Err(Error::Validation(format!(
                "destination cannot restore images of checkpoint tool {version}"
            ))),
        }
    }

    /// Decides whether iterative pre-dumps are used.
    async fn check_use_pre_dumps(&self) -> bool {
        let enabled = match self.options.pre_dump {
            PreDumpMode::Enabled => true,
            PreDumpMode::Disabled => false,
            PreDumpMode::Auto => match self.service.query_features().await {
                Ok(resp) => resp.mem_track_supported() && self.worker.can_pre_dump(),
                Err(e) => {
                    warn!(error = %e, "feature query failed, pre-dumps disabled");
                    false
                }
            },
        };
        info!(enabled, mode = ?self.options.pre_dump, "pre-dumps");
        enabled
    }

    async fn pre_dump_iteration(&mut self, iteration: u32) -> Result<()> {
        self.peer.start_iteration(false).await?;
        let image = self.images.new_image_dir()?;
        self.worker.pre_dump(&image).await?;
        let image_sync = self
            .images
            .sync_images_to_target(self.worker.as_ref(), &self.options.to, true)
            .await?;
        let fs = self.fs.mnt_diff_sync(self.worker.as_ref()).await?;
        self.stats.handle_pre_dump(iteration, image_sync, fs);
        self.peer.end_iteration().await
    }

    // =========================================================================
    // Critical Section
    // =========================================================================

    async fn commit_to_target(&mut self, image: &CheckpointImageDirectory) -> Result<()> {
        self.enter(MigrationPhase::FinalSync);
        let worker = self.worker.as_ref();
        let mut fs = self.fs.stop_migration(worker).await?;
        self.images
            .sync_images_to_target(worker, &self.options.to, false)
            .await?;
        let diff = self.fs.mnt_diff_sync(worker).await?;
        fs.merge(&diff);
        self.stats.handle_final_sync(fs);

        self.enter(MigrationPhase::RestoreRequested);
        let checkpoint = CheckpointRef {
            name: self.worker.checkpoint_name(),
            image_dir: image.path().to_path_buf(),
        };
        self.peer
            .restore_from_images(&self.worker.identity().full_id, &checkpoint)
            .await
    }

    // =========================================================================
    // Post-Commit
    // =========================================================================

    async fn finish(&mut self, image: &CheckpointImageDirectory) -> MigrationReport {
        self.enter(MigrationPhase::Completed);

        match self.service.dump_stats(image).await {
            Ok(dump) => self.stats.handle_final_dump(dump),
            Err(e) => warn!(error = %e, "failed to collect dump statistics"),
        }
        if let Err(e) = self.worker.migration_complete(&self.options.to).await {
            warn!(error = %e, "completion callback failed");
        }
        if let Err(e) = self.service.close().await {
            warn!(error = %e, "failed to close checkpoint service");
        }
        if let Err(e) = self.images.close().await {
            warn!(error = %e, "failed to release image directories");
        }

        let report = self.stats.handle_stop();
        info!(
            session = %self.id,
            container = %report.container,
            target = %report.target,
            "migration completed"
        );
        report
    }
}
