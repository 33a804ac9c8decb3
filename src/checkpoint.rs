//! # Checkpoint/Restore Invoker
//!
//! Wraps the container engine's checkpoint CLI. Every operation is a blocking
//! external process whose stdout and stderr go to a per-operation log file;
//! success is exit status 0.
//!
//! | Operation  | Command                                                              | Log                         |
//! |------------|----------------------------------------------------------------------|-----------------------------|
//! | pre-dump   | `checkpoint create --pre-dump --checkpoint-dir=D <ct> <name>`        | `docker_pre_checkpoint.log` |
//! | final dump | `checkpoint create --checkpoint-dir=D [--parent-path=P] <ct> <name>` | `docker_checkpoint.log`     |
//! | restore    | `start --checkpoint-dir=D --checkpoint=<name> <ct>`                  | `docker_restore.log`        |
//!
//! The final dump is chained to the previous image directory once at least
//! one pre-dump exists, so the tool reuses unchanged memory pages.

use crate::constants::{
    CHECKPOINT_TIMEOUT, DEFAULT_DOCKER_BIN, DEFAULT_LOG_DIR, FINAL_DUMP_LOG, PRE_DUMP_LOG,
    RESTORE_LOG,
};
use crate::error::{Error, Result};
use crate::images::CheckpointImageDirectory;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

/// Checkpoint operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOp {
    PreDump,
    FinalDump,
    Restore,
}

impl CheckpointOp {
    /// Log file receiving the tool's output.
    pub fn log_file(self) -> &'static str {
        match self {
            Self::PreDump => PRE_DUMP_LOG,
            Self::FinalDump => FINAL_DUMP_LOG,
            Self::Restore => RESTORE_LOG,
        }
    }
}

impl std::fmt::Display for CheckpointOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreDump => write!(f, "pre-dump"),
            Self::FinalDump => write!(f, "final dump"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

/// Invokes the checkpoint/restore tool.
#[derive(Debug, Clone)]
pub struct CheckpointInvoker {
    docker_bin: PathBuf,
    log_dir: PathBuf,
    timeout: Duration,
}

impl Default for CheckpointInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_DOCKER_BIN)
    }
}

impl CheckpointInvoker {
    /// Creates an invoker for the given engine binary.
    pub fn new(docker_bin: impl Into<PathBuf>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            timeout: CHECKPOINT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the log path of an operation.
    pub fn log_path(&self, op: CheckpointOp) -> PathBuf {
        self.log_dir.join(op.log_file())
    }

    /// Takes an incremental checkpoint without stopping the container.
    pub async fn pre_dump(
        &self,
        container: &str,
        checkpoint: &str,
        image: &CheckpointImageDirectory,
    ) -> Result<()> {
        info!(container, iteration = image.current_iter(), "Pre-dump container");
        let args = pre_dump_args(container, checkpoint, image);
        self.run(CheckpointOp::PreDump, &args).await
    }

    /// Takes the final, stopping checkpoint.
    pub async fn final_dump(
        &self,
        container: &str,
        checkpoint: &str,
        image: &CheckpointImageDirectory,
    ) -> Result<()> {
        match image.parent() {
            Some(parent) => info!(
                container,
                parent = %parent.display(),
                "Last dump with parent path"
            ),
            None => info!(
                container,
                iteration = image.current_iter(),
                "Last dump without parent path"
            ),
        }
        let args = final_dump_args(container, checkpoint, image);
        self.run(CheckpointOp::FinalDump, &args).await
    }

    /// Starts the container from a checkpoint.
    pub async fn final_restore(
        &self,
        container: &str,
        checkpoint: &str,
        image_dir: &Path,
    ) -> Result<()> {
        info!(container, checkpoint, "Restoring container");
        let args = restore_args(container, checkpoint, image_dir);
        self.run(CheckpointOp::Restore, &args).await
    }

    async fn run(&self, op: CheckpointOp, args: &[String]) -> Result<()> {
        let log = self.log_path(op);
        debug!("{} {}", self.docker_bin.display(), args.join(" "));

        let log_file = File::create(&log)?;
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true);

        let status = timeout(self.timeout, cmd.status())
            .await
            .map_err(|_| Error::Timeout {
                operation: op.to_string(),
                duration: self.timeout,
            })?
            .map_err(|e| Error::ToolUnavailable {
                tool: self.docker_bin.display().to_string(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(Error::ExternalTool {
                operation: op.to_string(),
                status: status.to_string(),
                log,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Command Lines
// =============================================================================

fn checkpoint_dir_opt(dir: &Path) -> String {
    format!("--checkpoint-dir={}", dir.display())
}

/// Arguments of a pre-dump.
pub fn pre_dump_args(
    container: &str,
    checkpoint: &str,
    image: &CheckpointImageDirectory,
) -> Vec<String> {
    vec![
        "checkpoint".into(),
        "create".into(),
        "--pre-dump".into(),
        checkpoint_dir_opt(image.path()),
        container.into(),
        checkpoint.into(),
    ]
}

/// Arguments of the final dump, parented when the image has a parent.
pub fn final_dump_args(
    container: &str,
    checkpoint: &str,
    image: &CheckpointImageDirectory,
) -> Vec<String> {
    let mut args = vec![
        "checkpoint".into(),
        "create".into(),
        checkpoint_dir_opt(image.path()),
    ];
    if let Some(parent) = image.parent() {
        args.push(format!("--parent-path={}", parent.display()));
    }
    args.push(container.into());
    args.push(checkpoint.into());
    args
}

/// Arguments of a restore.
pub fn restore_args(container: &str, checkpoint: &str, image_dir: &Path) -> Vec<String> {
    vec![
        "start".into(),
        checkpoint_dir_opt(image_dir),
        format!("--checkpoint={checkpoint}"),
        container.into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_final_dump_is_standalone() {
        let image = CheckpointImageDirectory::new(1, "/w/dump/1", None);
        let args = final_dump_args("abc", "abc_checkpoint", &image);
        assert!(!args.iter().any(|a| a.starts_with("--parent-path")));
        assert_eq!(args.last().map(String::as_str), Some("abc_checkpoint"));
    }

    #[test]
    fn test_later_final_dump_is_parented() {
        let image = CheckpointImageDirectory::new(3, "/w/dump/3", Some("/w/dump/2".into()));
        let args = final_dump_args("abc", "abc_checkpoint", &image);
        assert!(args.contains(&"--parent-path=/w/dump/2".to_string()));
        assert!(args.contains(&"--checkpoint-dir=/w/dump/3".to_string()));
    }

    #[test]
    fn test_pre_dump_and_restore_args() {
        let image = CheckpointImageDirectory::new(1, "/w/dump/1", None);
        let args = pre_dump_args("abc", "abc_checkpoint", &image);
        assert_eq!(args[2], "--pre-dump");

        let args = restore_args("abc", "abc_checkpoint", Path::new("/w/dump/7"));
        assert_eq!(
            args,
            vec![
                "start",
                "--checkpoint-dir=/w/dump/7",
                "--checkpoint=abc_checkpoint",
                "abc"
            ]
        );
    }
}
