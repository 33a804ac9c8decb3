//! Checkpoint image directories and their transfer to the target.
//!
//! Every session owns a directory `<work>/<session>` named by a fresh v7
//! UUID, so an aborted session never leaks images into the next one. Every
//! dump gets a new directory under it. From the second directory on, each
//! one records the previous directory as its parent so the final dump can be
//! taken incrementally:
//!
//! ```text
//! <work>/<session>/
//! ├── cpuinfo/cpuinfo.img
//! └── dump/
//!     ├── 1/             pre-dump 0
//!     ├── 2/  parent=1   pre-dump 1
//!     └── 3/  parent=2   final dump
//! ```
//!
//! The work directory has the same absolute path on both hosts, so images
//! are copied verbatim and restored from the path they were dumped to.
//! An image directory that already exists is never reused.

use crate::constants::{CPUINFO_DIR, CPUINFO_IMAGE, DUMP_DIR, MAX_CPUINFO_SIZE};
use crate::error::{Error, Result};
use crate::peer::RemotePeer;
use crate::rsync::{Rsync, RsyncFlags};
use crate::worker::MigrationWorker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// One dump's image directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointImageDirectory {
    current_iter: u32,
    path: PathBuf,
    parent: Option<PathBuf>,
}

impl CheckpointImageDirectory {
    pub fn new(current_iter: u32, path: impl Into<PathBuf>, parent: Option<PathBuf>) -> Self {
        Self {
            current_iter,
            path: path.into(),
            parent,
        }
    }

    /// 1-based dump counter.
    pub fn current_iter(&self) -> u32 {
        self.current_iter
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previous dump's directory, present when `current_iter > 1`.
    pub fn parent(&self) -> Option<&Path> {
        self.parent.as_deref()
    }
}

/// Owns checkpoint image directories for one session.
#[async_trait]
pub trait ImageManager: Send + Sync {
    /// Session directory holding every image directory of the session.
    fn work_dir(&self) -> &Path;

    /// Directory the CPU descriptor is dumped into.
    fn cpuinfo_dir(&self) -> PathBuf {
        self.work_dir().join(CPUINFO_DIR)
    }

    /// Allocates the next image directory.
    fn new_image_dir(&mut self) -> Result<CheckpointImageDirectory>;

    /// Most recently allocated directory.
    fn image_dir(&self) -> Option<&CheckpointImageDirectory>;

    /// Parent of the most recently allocated directory.
    fn parent_image_dir(&self) -> Option<&Path> {
        self.image_dir().and_then(CheckpointImageDirectory::parent)
    }

    /// Ships the dumped CPU descriptor to the peer.
    async fn send_cpuinfo(&self, peer: &dyn RemotePeer) -> Result<()>;

    /// Copies image directories to the destination host.
    ///
    /// Intermediate transfers copy only the current directory; the final
    /// transfer copies every directory so the parent chain is complete.
    async fn sync_images_to_target(
        &self,
        worker: &dyn MigrationWorker,
        dest_host: &str,
        intermediate: bool,
    ) -> Result<Duration>;

    /// Releases the image directories.
    async fn close(&mut self) -> Result<()>;
}

/// Image manager over a per-session work directory, transferring with rsync.
#[derive(Debug)]
pub struct LocalImageManager {
    session_dir: PathBuf,
    rsync: Rsync,
    keep_images: bool,
    current: Option<CheckpointImageDirectory>,
}

impl LocalImageManager {
    /// Creates a fresh session directory under `work_dir`.
    pub fn new(work_dir: impl AsRef<Path>, rsync: Rsync) -> Result<Self> {
        let work_dir = work_dir.as_ref();
        std::fs::create_dir_all(work_dir)?;
        let session_dir = work_dir.join(Uuid::now_v7().to_string());
        std::fs::create_dir(&session_dir)?;
        debug!(path = %session_dir.display(), "image session directory created");

        Ok(Self {
            session_dir,
            rsync,
            keep_images: false,
            current: None,
        })
    }

    /// Keeps the session directory on close.
    #[must_use]
    pub fn keep_images(mut self, keep: bool) -> Self {
        self.keep_images = keep;
        self
    }

    fn dump_root(&self) -> PathBuf {
        self.session_dir.join(DUMP_DIR)
    }
}

#[async_trait]
impl ImageManager for LocalImageManager {
    fn work_dir(&self) -> &Path {
        &self.session_dir
    }

    fn new_image_dir(&mut self) -> Result<CheckpointImageDirectory> {
        let iter = self.current.as_ref().map_or(1, |c| c.current_iter() + 1);
        let path = self.dump_root().join(iter.to_string());
        let parent = self.current.as_ref().map(|c| c.path().to_path_buf());

        std::fs::create_dir_all(self.dump_root())?;
        if let Err(e) = std::fs::create_dir(&path) {
            return Err(match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::Internal(format!(
                    "image directory {} already exists",
                    path.display()
                )),
                _ => e.into(),
            });
        }
        debug!(iteration = iter, path = %path.display(), "image directory allocated");

        let image = CheckpointImageDirectory::new(iter, path, parent);
        self.current = Some(image.clone());
        Ok(image)
    }

    fn image_dir(&self) -> Option<&CheckpointImageDirectory> {
        self.current.as_ref()
    }

    async fn send_cpuinfo(&self, peer: &dyn RemotePeer) -> Result<()> {
        let path = self.cpuinfo_dir().join(CPUINFO_IMAGE);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::metadata_missing(&path, e))?;
        if data.len() > MAX_CPUINFO_SIZE {
            return Err(Error::metadata_invalid(
                &path,
                format!("{} bytes exceeds {MAX_CPUINFO_SIZE}", data.len()),
            ));
        }
        peer.send_cpu_info(&data).await
    }

    async fn sync_images_to_target(
        &self,
        worker: &dyn MigrationWorker,
        dest_host: &str,
        intermediate: bool,
    ) -> Result<Duration> {
        let start = Instant::now();
        let current = self
            .current
            .as_ref()
            .ok_or_else(|| Error::Internal("no image directory allocated".into()))?;

        let source = if intermediate {
            current.path().to_path_buf()
        } else {
            self.dump_root()
        };
        self.rsync
            .copy(&[source.as_path()], dest_host, &RsyncFlags::default())
            .await?;

        let elapsed = start.elapsed();
        info!(
            container = %worker.identity().full_id,
            iteration = current.current_iter(),
            intermediate,
            elapsed = ?elapsed,
            "checkpoint images synced"
        );
        Ok(elapsed)
    }

    async fn close(&mut self) -> Result<()> {
        self.current = None;
        if self.keep_images {
            return Ok(());
        }
        if self.session_dir.exists() {
            tokio::fs::remove_dir_all(&self.session_dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_directories_chain_to_previous() {
        let temp = TempDir::new().unwrap();
        let mut images = LocalImageManager::new(temp.path(), Rsync::default()).unwrap();

        let first = images.new_image_dir().unwrap();
        assert_eq!(first.current_iter(), 1);
        assert!(first.parent().is_none());
        assert!(first.path().is_dir());
        assert!(first.path().starts_with(images.work_dir()));

        let second = images.new_image_dir().unwrap();
        assert_eq!(second.current_iter(), 2);
        assert_eq!(second.parent(), Some(first.path()));
        assert_eq!(images.parent_image_dir(), Some(first.path()));
        assert_eq!(images.image_dir(), Some(&second));
    }

    #[test]
    fn test_sessions_never_share_image_directories() {
        let temp = TempDir::new().unwrap();

        let mut aborted = LocalImageManager::new(temp.path(), Rsync::default()).unwrap();
        let stale = aborted.new_image_dir().unwrap();
        let checkpoint = stale.path().join("aaa_checkpoint");
        std::fs::create_dir(&checkpoint).unwrap();
        std::fs::write(checkpoint.join("pages-1.img"), b"old pages").unwrap();
        // Dropped without close, as after a failed migration.
        drop(aborted);

        let mut next = LocalImageManager::new(temp.path(), Rsync::default()).unwrap();
        let fresh = next.new_image_dir().unwrap();

        assert_ne!(fresh.path(), stale.path());
        assert_ne!(next.work_dir(), stale.path().parent().unwrap().parent().unwrap());
        assert!(entries(fresh.path()).is_empty());
        assert!(checkpoint.join("pages-1.img").is_file());
    }

    #[test]
    fn test_existing_image_directory_is_not_reused() {
        let temp = TempDir::new().unwrap();
        let mut images = LocalImageManager::new(temp.path(), Rsync::default()).unwrap();
        std::fs::create_dir_all(images.work_dir().join(DUMP_DIR).join("1")).unwrap();

        let err = images.new_image_dir().unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(images.image_dir().is_none());
    }

    #[tokio::test]
    async fn test_close_removes_session_unless_kept() {
        let temp = TempDir::new().unwrap();
        let mut images = LocalImageManager::new(temp.path(), Rsync::default()).unwrap();
        let session = images.work_dir().to_path_buf();
        images.new_image_dir().unwrap();
        images.close().await.unwrap();
        assert!(!session.exists());
        assert!(temp.path().is_dir());
        assert!(images.image_dir().is_none());

        let mut images = LocalImageManager::new(temp.path(), Rsync::default())
            .unwrap()
            .keep_images(true);
        images.new_image_dir().unwrap();
        images.close().await.unwrap();
        assert!(images.work_dir().join(DUMP_DIR).join("1").exists());
    }
}
