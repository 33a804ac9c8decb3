//! Checkpoint service: feature negotiation and image queries.
//!
//! The orchestrator talks to the checkpoint tool directly (not through the
//! container engine) for everything that is not a dump or a restore: CPU
//! descriptor dumps, feature probes, version queries and image statistics.
//! [`CriuCli`] implements [`CheckpointService`] by shelling out to `criu`.

use crate::constants::{CPUINFO_IMAGE, DEFAULT_CRIU_BIN, TOOL_QUERY_TIMEOUT};
use crate::error::{Error, Result};
use crate::images::CheckpointImageDirectory;
use crate::stats::DumpStats;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Memory dirty tracking feature name.
const MEM_TRACK_FEATURE: &str = "mem_dirty_track";

/// Outcome of a CPU descriptor dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfoDump {
    pub success: bool,
    /// Errno reported by the tool on failure, if recognizable.
    pub errno: Option<i32>,
}

impl CpuInfoDump {
    /// The tool does not support CPU descriptor dumps on this host.
    pub fn is_unsupported(&self) -> bool {
        !self.success && self.errno == Some(libc::ENOTSUP)
    }
}

/// Features reported by the tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
    /// Memory dirty tracking; `None` when the tool did not report it.
    pub mem_track: Option<bool>,
}

/// Answer to a feature request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureResponse {
    pub success: bool,
    pub features: Option<FeatureSet>,
}

impl FeatureResponse {
    /// True only for a successful answer that reports tracking as supported.
    pub fn mem_track_supported(&self) -> bool {
        self.success && self.features.and_then(|f| f.mem_track) == Some(true)
    }
}

/// Local checkpoint tool queries used by the orchestrator.
#[async_trait]
pub trait CheckpointService: Send + Sync {
    /// Dumps the local CPU descriptor into `dir`.
    async fn dump_cpu_info(&self, dir: &Path) -> Result<CpuInfoDump>;

    /// Asks which incremental dump features are available.
    async fn query_features(&self) -> Result<FeatureResponse>;

    /// Tool version string; `None` if it could not be determined.
    async fn tool_version(&self) -> Result<Option<String>>;

    /// Collects statistics of a filled image directory.
    async fn dump_stats(&self, image: &CheckpointImageDirectory) -> Result<DumpStats>;

    /// Releases the service connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// CRIU Command Line
// =============================================================================

/// Checkpoint service over the `criu` binary.
#[derive(Debug, Clone)]
pub struct CriuCli {
    bin: PathBuf,
    timeout: Duration,
}

impl Default for CriuCli {
    fn default() -> Self {
        Self::new(DEFAULT_CRIU_BIN)
    }
}

impl CriuCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            timeout: TOOL_QUERY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks a CPU descriptor image in `dir` against the local CPU.
    pub async fn check_cpu_info(&self, dir: &Path) -> Result<bool> {
        let output = self
            .output(&["cpuinfo", "check", "-D", &dir.display().to_string()])
            .await?;
        if !output.status.success() {
            debug!(
                "cpuinfo check failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        debug!("{} {}", self.bin.display(), args.join(" "));
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("criu {}", args.first().copied().unwrap_or_default()),
                duration: self.timeout,
            })?
            .map_err(|e| Error::ToolUnavailable {
                tool: self.bin.display().to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl CheckpointService for CriuCli {
    async fn dump_cpu_info(&self, dir: &Path) -> Result<CpuInfoDump> {
        tokio::fs::create_dir_all(dir).await?;
        let output = self
            .output(&["cpuinfo", "dump", "-D", &dir.display().to_string()])
            .await?;

        if output.status.success() && dir.join(CPUINFO_IMAGE).is_file() {
            return Ok(CpuInfoDump {
                success: true,
                errno: None,
            });
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(status = %output.status, "cpuinfo dump failed: {}", stderr.trim());
        Ok(CpuInfoDump {
            success: false,
            errno: dump_errno(&stderr),
        })
    }

    async fn query_features(&self) -> Result<FeatureResponse> {
        let output = self.output(&["check", "--feature", MEM_TRACK_FEATURE]).await?;
        let supported = output.status.success();
        debug!(feature = MEM_TRACK_FEATURE, supported, "feature probe");
        Ok(FeatureResponse {
            success: true,
            features: Some(FeatureSet {
                mem_track: Some(supported),
            }),
        })
    }

    async fn tool_version(&self) -> Result<Option<String>> {
        let output = self.output(&["--version"]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_version(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn dump_stats(&self, image: &CheckpointImageDirectory) -> Result<DumpStats> {
        let root = image.path().to_path_buf();
        let iteration = image.current_iter();
        tokio::task::spawn_blocking(move || collect_dump_stats(&root, iteration))
            .await
            .map_err(|e| Error::Internal(format!("stats task failed: {e}")))?
    }
}

// =============================================================================
// Output Parsing
// =============================================================================

fn dump_errno(stderr: &str) -> Option<i32> {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("not supported") {
        Some(libc::ENOTSUP)
    } else {
        None
    }
}

/// Extracts the version from `criu --version` output (`Version: 3.12`).
pub(crate) fn parse_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let value = value.trim();
        (key.trim() == "Version" && !value.is_empty()).then(|| value.to_string())
    })
}

/// Returns true if images dumped by `a` can be restored by `b`.
///
/// Versions are compatible when their major and minor components match.
pub fn versions_compatible(a: &str, b: &str) -> bool {
    fn major_minor(v: &str) -> Option<(u32, u32)> {
        let mut parts = v.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
        Some((major, minor))
    }
    match (major_minor(a), major_minor(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn collect_dump_stats(root: &Path, iteration: u32) -> Result<DumpStats> {
    let mut stats = DumpStats {
        iteration,
        ..DumpStats::default()
    };
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(entry.path());
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            stats.files += 1;
            stats.image_bytes += meta.len();
            if name.starts_with("pages-") && name.ends_with(".img") {
                stats.pages_bytes += meta.len();
            }
        }
    }
    Ok(stats)
}
