//! Remote peer contract.
//!
//! The orchestrator drives the destination host through [`RemotePeer`]. The
//! JSON-lines implementation lives in [`crate::client`]; the destination side
//! answering it lives in [`crate::server`].

use crate::config::MigrationMode;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Checkpoint to restore on the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// Checkpoint name inside the image directory.
    pub name: String,
    /// Final image directory, same absolute path on both hosts.
    pub image_dir: PathBuf,
}

/// Calls the orchestrator makes on the destination host.
///
/// Compatibility checks return `Ok(None)` when the peer answered without a
/// verdict; callers treat that like a mismatch.
#[async_trait]
pub trait RemotePeer: Send + Sync {
    /// Opens the migration session on the destination.
    async fn setup(&self, container_id: &str, mode: MigrationMode) -> Result<()>;

    /// Brackets the start of a dump and sync cycle.
    async fn start_iteration(&self, is_final: bool) -> Result<()>;

    /// Brackets the end of a dump and sync cycle.
    async fn end_iteration(&self) -> Result<()>;

    /// Uploads the source CPU descriptor image.
    async fn send_cpu_info(&self, data: &[u8]) -> Result<()>;

    /// Compares the uploaded CPU descriptor against the destination CPU.
    async fn check_cpu_info(&self) -> Result<Option<bool>>;

    /// Checks that the destination tool can restore images of `version`.
    async fn check_tool_version(&self, version: &str) -> Result<Option<bool>>;

    /// Tells the destination whether incremental dumps are in use.
    async fn set_memory_tracking(&self, enabled: bool) -> Result<()>;

    /// Restores the container from the transferred checkpoint.
    async fn restore_from_images(&self, container_id: &str, checkpoint: &CheckpointRef)
    -> Result<()>;
}
