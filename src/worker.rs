//! Migration worker: one container's identity, paths and checkpoint hooks.
//!
//! The orchestrator sees the resolver and the checkpoint invoker only
//! through [`MigrationWorker`]. A worker is opened once per session and is
//! immutable afterwards.

use crate::checkpoint::CheckpointInvoker;
use crate::constants::CHECKPOINT_NAME_SUFFIX;
use crate::error::{Error, Result};
use crate::images::CheckpointImageDirectory;
use crate::resolver::{
    ContainerIdentity, FilesystemPathSet, LayerResolver, ResolvedContainer, build_path_set,
};
use async_trait::async_trait;
use std::path::Path;
use tracing::{info, warn};

/// Container-specific side of a migration.
#[async_trait]
pub trait MigrationWorker: Send + Sync {
    fn identity(&self) -> &ContainerIdentity;

    /// Directories to synchronize.
    fn path_set(&self) -> &FilesystemPathSet;

    /// Name of the checkpoint inside each image directory.
    fn checkpoint_name(&self) -> String {
        format!("{}{CHECKPOINT_NAME_SUFFIX}", self.identity().short_id)
    }

    /// Whether the workload tolerates pre-dumps at all.
    fn can_pre_dump(&self) -> bool {
        true
    }

    async fn pre_dump(&self, image: &CheckpointImageDirectory) -> Result<()>;

    async fn final_dump(&self, image: &CheckpointImageDirectory) -> Result<()>;

    async fn final_restore(&self, image_dir: &Path, checkpoint: &str) -> Result<()>;

    /// Called once the destination accepted the restore.
    async fn migration_complete(&self, target: &str) -> Result<()>;

    /// Called when the critical section fails; must leave the source
    /// container runnable.
    async fn migration_fail(&self, image: Option<&CheckpointImageDirectory>) -> Result<()>;
}

/// Opens workers for container id prefixes.
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    async fn open_worker(&self, short_id: &str) -> Result<Box<dyn MigrationWorker>>;
}

// =============================================================================
// Docker Worker
// =============================================================================

/// Worker for containers managed by the Docker engine.
#[derive(Debug)]
pub struct DockerWorker {
    resolved: ResolvedContainer,
    paths: FilesystemPathSet,
    invoker: CheckpointInvoker,
}

impl DockerWorker {
    /// Resolves a container and builds its path set.
    pub fn open(resolver: &LayerResolver, short_id: &str, invoker: CheckpointInvoker) -> Result<Self> {
        let resolved = resolver.resolve(short_id)?;
        let paths = build_path_set(resolver.layout(), &resolved);
        Ok(Self {
            resolved,
            paths,
            invoker,
        })
    }

    pub fn resolved(&self) -> &ResolvedContainer {
        &self.resolved
    }
}

#[async_trait]
impl MigrationWorker for DockerWorker {
    fn identity(&self) -> &ContainerIdentity {
        &self.resolved.identity
    }

    fn path_set(&self) -> &FilesystemPathSet {
        &self.paths
    }

    async fn pre_dump(&self, image: &CheckpointImageDirectory) -> Result<()> {
        self.invoker
            .pre_dump(&self.identity().short_id, &self.checkpoint_name(), image)
            .await
    }

    async fn final_dump(&self, image: &CheckpointImageDirectory) -> Result<()> {
        self.invoker
            .final_dump(&self.identity().short_id, &self.checkpoint_name(), image)
            .await
    }

    async fn final_restore(&self, image_dir: &Path, checkpoint: &str) -> Result<()> {
        self.invoker
            .final_restore(&self.identity().short_id, checkpoint, image_dir)
            .await
    }

    async fn migration_complete(&self, target: &str) -> Result<()> {
        info!(
            container = %self.identity().full_id,
            target,
            "container migrated, source copy retired"
        );
        Ok(())
    }

    async fn migration_fail(&self, image: Option<&CheckpointImageDirectory>) -> Result<()> {
        let Some(image) = image else {
            warn!(
                container = %self.identity().full_id,
                "no checkpoint to restart from, source container left as is"
            );
            return Ok(());
        };
        warn!(
            container = %self.identity().full_id,
            image = %image.path().display(),
            "migration aborted, restarting source container from final checkpoint"
        );
        self.final_restore(image.path(), &self.checkpoint_name()).await
    }
}

/// Opens [`DockerWorker`]s.
#[derive(Debug, Clone)]
pub struct DockerWorkerProvider {
    resolver: LayerResolver,
    invoker: CheckpointInvoker,
}

impl DockerWorkerProvider {
    pub fn new(resolver: LayerResolver, invoker: CheckpointInvoker) -> Self {
        Self { resolver, invoker }
    }
}

#[async_trait]
impl WorkerProvider for DockerWorkerProvider {
    async fn open_worker(&self, short_id: &str) -> Result<Box<dyn MigrationWorker>> {
        let resolver = self.resolver.clone();
        let invoker = self.invoker.clone();
        let short_id = short_id.to_string();

        let worker = tokio::task::spawn_blocking(move || {
            DockerWorker::open(&resolver, &short_id, invoker)
        })
        .await
        .map_err(|e| Error::Internal(format!("resolver task failed: {e}")))??;

        Ok(Box::new(worker))
    }
}
