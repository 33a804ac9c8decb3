//! Thin wrapper over the `rsync` binary.
//!
//! Shared by the filesystem sync driver and the checkpoint image manager.
//! Sources are copied with `--relative` so they land on the same absolute
//! path on the target host.

use crate::constants::{DEFAULT_RSYNC_BIN, TRANSFER_TIMEOUT};
use crate::error::{Error, Result};
use crate::stats::FsStats;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Transfer options.
#[derive(Debug, Clone, Default)]
pub struct RsyncFlags {
    /// Remove files on the target that vanished on the source.
    pub delete: bool,
    /// Write rsync's own log here.
    pub log_file: Option<PathBuf>,
}

/// Invokes rsync.
#[derive(Debug, Clone)]
pub struct Rsync {
    bin: PathBuf,
    timeout: Duration,
}

impl Default for Rsync {
    fn default() -> Self {
        Self::new(DEFAULT_RSYNC_BIN)
    }
}

impl Rsync {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            timeout: TRANSFER_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolves the binary on `PATH`; `None` if rsync is not installed.
    pub fn locate(bin: &Path) -> Option<PathBuf> {
        which::which(bin).ok()
    }

    /// Copies `sources` to the same absolute paths on `host`.
    ///
    /// Sources that do not exist are skipped.
    pub async fn copy(&self, sources: &[&Path], host: &str, flags: &RsyncFlags) -> Result<FsStats> {
        let start = Instant::now();
        let existing: Vec<&Path> = sources
            .iter()
            .copied()
            .filter(|p| {
                let exists = p.exists();
                if !exists {
                    debug!(path = %p.display(), "skipping missing source");
                }
                exists
            })
            .collect();

        if existing.is_empty() {
            return Ok(FsStats {
                elapsed: start.elapsed(),
                ..FsStats::default()
            });
        }

        let args = copy_args(&existing, host, flags);
        debug!("{} {}", self.bin.display(), args.join(" "));

        let mut cmd = Command::new(&self.bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: "rsync".to_string(),
                duration: self.timeout,
            })?
            .map_err(|e| Error::ToolUnavailable {
                tool: self.bin.display().to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, "rsync failed: {}", stderr.trim());
            return Err(Error::ExternalTool {
                operation: "rsync".to_string(),
                status: output.status.to_string(),
                log: flags.log_file.clone().unwrap_or_default(),
            });
        }

        let (files, bytes) = parse_stats(&String::from_utf8_lossy(&output.stdout));
        Ok(FsStats {
            paths: existing.len() as u64,
            files,
            bytes,
            elapsed: start.elapsed(),
        })
    }
}

fn copy_args(sources: &[&Path], host: &str, flags: &RsyncFlags) -> Vec<String> {
    let mut args = vec![
        "-a".to_string(),
        "--relative".to_string(),
        "--stats".to_string(),
    ];
    if flags.delete {
        args.push("--delete".to_string());
    }
    if let Some(log) = &flags.log_file {
        args.push(format!("--log-file={}", log.display()));
    }
    args.extend(sources.iter().map(|p| p.display().to_string()));
    args.push(format!("{host}:/"));
    args
}

/// Extracts (files transferred, bytes sent) from `--stats` output.
pub(crate) fn parse_stats(output: &str) -> (u64, u64) {
    let mut files = 0;
    let mut bytes = 0;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let number = || {
            value
                .split_whitespace()
                .next()
                .map(|n| n.replace(',', ""))
                .and_then(|n| n.parse::<u64>().ok())
                .unwrap_or(0)
        };
        match key.trim() {
            "Number of regular files transferred" => files = number(),
            "Total bytes sent" => bytes = number(),
            _ => {}
        }
    }
    (files, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stats() {
        let out = "\
Number of files: 12 (reg: 10, dir: 2)
Number of regular files transferred: 4
Total file size: 9,876 bytes
Total bytes sent: 1,234
Total bytes received: 99
";
        assert_eq!(parse_stats(out), (4, 1234));
        assert_eq!(parse_stats(""), (0, 0));
    }

    #[test]
    fn test_copy_args() {
        let flags = RsyncFlags {
            delete: true,
            log_file: Some(PathBuf::from("/w/rsync.log")),
        };
        let args = copy_args(&[Path::new("/a"), Path::new("/b")], "node-b", &flags);
        assert_eq!(
            args,
            vec![
                "-a",
                "--relative",
                "--stats",
                "--delete",
                "--log-file=/w/rsync.log",
                "/a",
                "/b",
                "node-b:/"
            ]
        );
    }

    #[tokio::test]
    async fn test_copy_with_no_existing_sources_is_noop() {
        let rsync = Rsync::new("/nonexistent/rsync");
        let stats = rsync
            .copy(&[Path::new("/nonexistent/source")], "node-b", &RsyncFlags::default())
            .await
            .unwrap();
        assert_eq!(stats.paths, 0);
    }
}
