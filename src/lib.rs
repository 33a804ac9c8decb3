//! # magikmigrate
//!
//! **Live Container Migration over Checkpoint/Restore**
//!
//! Moves a running container from a source host to a destination host with
//! a short freeze. Memory state is pre-copied in a bounded number of
//! incremental pre-dumps while the container keeps running; only the final
//! dump stops it.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ Source host                                                          │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │                      MigrationSession                          │  │
//! │  │  validate → pre-sync → pre-dump ×6 → final dump → final sync   │  │
//! │  │                                                → restore       │  │
//! │  └───┬──────────────┬───────────────┬───────────────┬─────────────┘  │
//! │      │              │               │               │                │
//! │  ┌───▼──────┐  ┌────▼──────┐  ┌─────▼──────┐  ┌─────▼─────┐          │
//! │  │ Worker   │  │ FsSync    │  │ Image      │  │ Peer      │          │
//! │  │ resolver │  │ (rsync)   │  │ manager    │  │ client    │──┐       │
//! │  │ invoker  │  └───────────┘  └────────────┘  └───────────┘  │       │
//! │  └──────────┘                                                │ TCP   │
//! └──────────────────────────────────────────────────────────────┼───────┘
//!                                                                ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ Destination host: PeerServer (session, CPU/version checks, restore)  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Layered Storage
//!
//! The resolver maps a container id prefix to the on-disk artifacts of the
//! container engine's layered store (aufs layout by default) by walking the
//! parent links of the layer database. See [`resolver`].
//!
//! # Example
//!
//! ```rust,ignore
//! use magikmigrate::{MigrationSession, SessionDeps, MigrationMode, MigrationOptions};
//!
//! let mut session = MigrationSession::open("4f1c2a", MigrationMode::Live, options, deps).await?;
//! let report = session.run().await?;
//! println!("{} pre-dump rounds", report.iterations.len());
//! ```

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod constants;
pub mod criu;
pub mod error;
pub mod fs;
pub mod images;
pub mod orchestrator;
pub mod peer;
pub mod protocol;
pub mod resolver;
pub mod rsync;
pub mod server;
pub mod stats;
pub mod worker;

// Re-exports
pub use checkpoint::{CheckpointInvoker, CheckpointOp};
pub use client::PeerClient;
pub use config::{Config, MigrationMode, MigrationOptions, PreDumpMode};
pub use constants::*;
pub use criu::{CheckpointService, CriuCli};
pub use error::{Error, ErrorKind, Result};
pub use fs::{FsDriverProvider, FsSyncDriver, RsyncDriver, RsyncDriverProvider};
pub use images::{CheckpointImageDirectory, ImageManager, LocalImageManager};
pub use orchestrator::{MigrationPhase, MigrationSession, SessionDeps};
pub use peer::{CheckpointRef, RemotePeer};
pub use resolver::{
    ContainerIdentity, FilesystemPathSet, LayerResolver, ResolvedContainer, StorageLayout,
    VolumeBindings, build_path_set,
};
pub use server::{LocalRestoreTarget, PeerServer, RestoreTarget};
pub use stats::{FsStats, MigrationReport};
pub use worker::{DockerWorker, DockerWorkerProvider, MigrationWorker, WorkerProvider};
