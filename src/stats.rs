//! Migration statistics.
//!
//! Collected as the session advances and returned to the caller as a
//! [`MigrationReport`] once the destination has accepted the restore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// Result of one filesystem synchronization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    /// Source paths handed to the transfer.
    pub paths: u64,
    /// Regular files transferred.
    pub files: u64,
    /// Bytes sent over the wire.
    pub bytes: u64,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl FsStats {
    /// Accumulates another pass into this one.
    pub fn merge(&mut self, other: &FsStats) {
        self.paths += other.paths;
        self.files += other.files;
        self.bytes += other.bytes;
        self.elapsed += other.elapsed;
    }
}

/// Size of one checkpoint image directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpStats {
    pub iteration: u32,
    /// Bytes of memory page images.
    pub pages_bytes: u64,
    /// Bytes of all image files.
    pub image_bytes: u64,
    pub files: u64,
}

/// One pre-dump round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationStats {
    pub iteration: u32,
    /// Checkpoint image transfer time.
    #[serde(with = "humantime_serde")]
    pub image_sync: Duration,
    pub fs: FsStats,
}

/// Summary of a committed migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub session_id: uuid::Uuid,
    pub container: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub total: Duration,
    pub preliminary: FsStats,
    pub iterations: Vec<IterationStats>,
    pub final_fs: FsStats,
    /// Statistics of the final dump; `None` if they could not be collected.
    pub final_dump: Option<DumpStats>,
}

/// Accumulates statistics over a session.
#[derive(Debug)]
pub struct MigrationStats {
    session_id: uuid::Uuid,
    container: String,
    target: String,
    started_at: DateTime<Utc>,
    started: Instant,
    preliminary: FsStats,
    iterations: Vec<IterationStats>,
    final_fs: FsStats,
    final_dump: Option<DumpStats>,
}

impl MigrationStats {
    /// Starts collecting.
    pub fn handle_start(
        session_id: uuid::Uuid,
        container: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            container: container.into(),
            target: target.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            preliminary: FsStats::default(),
            iterations: Vec::new(),
            final_fs: FsStats::default(),
            final_dump: None,
        }
    }

    pub fn handle_preliminary(&mut self, fs: FsStats) {
        info!(
            files = fs.files,
            bytes = fs.bytes,
            elapsed = ?fs.elapsed,
            "preliminary FS sync done"
        );
        self.preliminary = fs;
    }

    pub fn handle_pre_dump(&mut self, iteration: u32, image_sync: Duration, fs: FsStats) {
        info!(
            iteration,
            image_sync = ?image_sync,
            fs_bytes = fs.bytes,
            "pre-dump iteration done"
        );
        self.iterations.push(IterationStats {
            iteration,
            image_sync,
            fs,
        });
    }

    pub fn handle_final_sync(&mut self, fs: FsStats) {
        self.final_fs.merge(&fs);
    }

    pub fn handle_final_dump(&mut self, dump: DumpStats) {
        info!(
            pages_bytes = dump.pages_bytes,
            image_bytes = dump.image_bytes,
            "final dump statistics"
        );
        self.final_dump = Some(dump);
    }

    /// Stops collecting and produces the report.
    pub fn handle_stop(&self) -> MigrationReport {
        let total = self.started.elapsed();
        info!(
            container = %self.container,
            target = %self.target,
            total = ?total,
            iterations = self.iterations.len(),
            "migration statistics"
        );
        MigrationReport {
            session_id: self.session_id,
            container: self.container.clone(),
            target: self.target.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            total,
            preliminary: self.preliminary,
            iterations: self.iterations.clone(),
            final_fs: self.final_fs,
            final_dump: self.final_dump,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_stats_merge() {
        let mut a = FsStats {
            paths: 2,
            files: 3,
            bytes: 100,
            elapsed: Duration::from_secs(1),
        };
        a.merge(&FsStats {
            paths: 1,
            files: 1,
            bytes: 50,
            elapsed: Duration::from_secs(2),
        });
        assert_eq!(a.files, 4);
        assert_eq!(a.bytes, 150);
        assert_eq!(a.elapsed, Duration::from_secs(3));
    }

    #[test]
    fn test_report_collects_iterations() {
        let mut stats = MigrationStats::handle_start(uuid::Uuid::now_v7(), "abc", "node-b");
        stats.handle_pre_dump(0, Duration::from_millis(5), FsStats::default());
        stats.handle_pre_dump(1, Duration::from_millis(3), FsStats::default());
        let report = stats.handle_stop();
        assert_eq!(report.iterations.len(), 2);
        assert_eq!(report.container, "abc");
        assert!(report.final_dump.is_none());
        assert!(report.finished_at >= report.started_at);
    }
}
