//! Filesystem sync driver contract and the rsync-backed driver.
//!
//! A driver is bound to one container's [`FilesystemPathSet`] and a work
//! directory. The orchestrator calls it three ways:
//!
//! - `start_migration`: full copy while the container runs
//! - `mnt_diff_sync`: re-copy of the paths a running container can modify
//! - `stop_migration`: closing copy against the stopped container, deleting
//!   files that vanished on the source

use crate::error::Result;
use crate::resolver::FilesystemPathSet;
use crate::rsync::{Rsync, RsyncFlags};
use crate::stats::FsStats;
use crate::worker::MigrationWorker;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Log written by the driver inside the work directory.
const FS_SYNC_LOG: &str = "fs-sync.log";

/// Filesystem synchronization driver.
#[async_trait]
pub trait FsSyncDriver: Send + Sync {
    async fn start_migration(&self) -> Result<FsStats>;

    async fn mnt_diff_sync(&self, worker: &dyn MigrationWorker) -> Result<FsStats>;

    async fn stop_migration(&self, worker: &dyn MigrationWorker) -> Result<FsStats>;
}

/// Hands out drivers bound to a path set.
pub trait FsDriverProvider: Send + Sync {
    /// Returns `None` when no driver can serve the path set.
    fn driver_for(&self, paths: &FilesystemPathSet, work_dir: &Path) -> Option<Box<dyn FsSyncDriver>>;
}

// =============================================================================
// Rsync Driver
// =============================================================================

/// Driver copying paths to the destination host with rsync.
#[derive(Debug)]
pub struct RsyncDriver {
    rsync: Rsync,
    paths: FilesystemPathSet,
    log_file: PathBuf,
    dest_host: String,
}

impl RsyncDriver {
    pub fn new(
        rsync: Rsync,
        paths: FilesystemPathSet,
        work_dir: &Path,
        dest_host: impl Into<String>,
    ) -> Self {
        Self {
            rsync,
            paths,
            log_file: work_dir.join(FS_SYNC_LOG),
            dest_host: dest_host.into(),
        }
    }

    fn flags(&self, delete: bool) -> RsyncFlags {
        RsyncFlags {
            delete,
            log_file: Some(self.log_file.clone()),
        }
    }
}

#[async_trait]
impl FsSyncDriver for RsyncDriver {
    async fn start_migration(&self) -> Result<FsStats> {
        let sources = self.paths.all();
        info!(paths = sources.len(), target = %self.dest_host, "FS migration start");
        self.rsync
            .copy(&sources, &self.dest_host, &self.flags(false))
            .await
    }

    async fn mnt_diff_sync(&self, worker: &dyn MigrationWorker) -> Result<FsStats> {
        let sources = worker.path_set().mutable_paths();
        self.rsync
            .copy(&sources, &self.dest_host, &self.flags(false))
            .await
    }

    async fn stop_migration(&self, worker: &dyn MigrationWorker) -> Result<FsStats> {
        let sources = worker.path_set().all();
        info!(
            container = %worker.identity().full_id,
            paths = sources.len(),
            "final FS sync"
        );
        self.rsync
            .copy(&sources, &self.dest_host, &self.flags(true))
            .await
    }
}

/// Provides [`RsyncDriver`]s when rsync is installed.
#[derive(Debug, Clone)]
pub struct RsyncDriverProvider {
    rsync_bin: PathBuf,
    timeout: std::time::Duration,
    dest_host: String,
}

impl RsyncDriverProvider {
    pub fn new(rsync_bin: impl Into<PathBuf>, timeout: std::time::Duration, dest_host: impl Into<String>) -> Self {
        Self {
            rsync_bin: rsync_bin.into(),
            timeout,
            dest_host: dest_host.into(),
        }
    }
}

impl FsDriverProvider for RsyncDriverProvider {
    fn driver_for(&self, paths: &FilesystemPathSet, work_dir: &Path) -> Option<Box<dyn FsSyncDriver>> {
        let Some(bin) = Rsync::locate(&self.rsync_bin) else {
            warn!(bin = %self.rsync_bin.display(), "rsync not found");
            return None;
        };
        let rsync = Rsync::new(bin).with_timeout(self.timeout);
        Some(Box::new(RsyncDriver::new(
            rsync,
            paths.clone(),
            work_dir,
            &self.dest_host,
        )))
    }
}
