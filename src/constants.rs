//! # Migration Constants
//!
//! Defines the iteration cap, metadata limits, default on-disk locations and
//! timeouts used by the migration orchestrator. These constants are the
//! **single source of truth** for the protocol's bounds.
//!
//! ## Modification Guidelines
//!
//! Before modifying any constant:
//! 1. Check whether the destination side (`magikmigrate serve`) relies on it
//! 2. Consider interactions with other limits (e.g., `MAX_CHAIN_DEPTH` vs
//!    the number of layers the storage driver allows)
//! 3. Update dependent tests and documentation
//!
//! ## Cross-References
//!
//! - [`crate::orchestrator`]: Uses the iteration cap and short id bound
//! - [`crate::resolver`]: Uses the storage paths and chain depth
//! - [`crate::checkpoint`]: Uses the tool paths, log names and timeouts
//! - [`crate::peer`]: Uses the control port and request limits

use std::time::Duration;

// =============================================================================
// Pre-Copy Bounds
// =============================================================================
//
// There is no dirty-page or time based convergence signal. The pre-dump loop
// runs a fixed number of rounds; alternative convergence strategies should
// wrap this cap rather than replace it.
// =============================================================================

/// Maximum number of pre-dump iterations before stop-and-copy.
///
/// Counter values 0 through 5 inclusive, i.e. six rounds. Each round copies
/// the memory pages dirtied since the previous round while the container
/// keeps running.
pub const MAX_PRE_DUMP_ITERATIONS: u32 = 6;

// =============================================================================
// Identity & Metadata Limits
// =============================================================================

/// Minimum length of a user-supplied container id prefix.
///
/// Shorter prefixes match too many containers to be meaningful.
pub const MIN_SHORT_ID_LEN: usize = 3;

/// Default maximum number of parent links followed in a layer chain walk.
///
/// A well-formed store never exceeds the graph driver's layer limit (127 for
/// aufs/overlay2). A walk that goes further is treated as a cyclic or
/// corrupt store and fails instead of looping forever.
pub const MAX_CHAIN_DEPTH: usize = 128;

/// Maximum size of a single-value metadata file (`mount-id`, `parent`).
pub const MAX_METADATA_FILE_SIZE: u64 = 4096;

/// Maximum size of a container configuration document (1 MiB).
pub const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Separator between a digest algorithm and its hash (`sha256:<hex>`).
pub const DIGEST_SEPARATOR: char = ':';

// =============================================================================
// Storage Layout
// =============================================================================
//
// Relative paths inside the container engine's storage root. The graph
// driver name (`aufs` by default) is substituted where noted.
// =============================================================================

/// Default container engine storage root.
pub const DEFAULT_DOCKER_ROOT: &str = "/var/lib/docker";

/// Default graph driver.
pub const DEFAULT_GRAPH_DRIVER: &str = "aufs";

/// Per-container configuration directories.
pub const CONTAINERS_DIR: &str = "containers";

/// Container configuration document inside a container directory.
pub const CONTAINER_CONFIG_FILE: &str = "config.v2.json";

/// Managed volume storage.
pub const VOLUMES_DIR: &str = "volumes";

/// File naming the mount layer of a container (under `layerdb/mounts/<id>`).
pub const MOUNT_ID_FILE: &str = "mount-id";

/// File naming the parent layer of a layer or container.
pub const PARENT_FILE: &str = "parent";

/// Suffix of the init layer that sits between image and container layer.
pub const INIT_LAYER_SUFFIX: &str = "-init";

// =============================================================================
// Checkpoint Tooling
// =============================================================================

/// Default container engine CLI used for checkpoint and restore.
pub const DEFAULT_DOCKER_BIN: &str = "/usr/bin/docker";

/// Default checkpoint/restore tool binary.
pub const DEFAULT_CRIU_BIN: &str = "criu";

/// Default rsync binary.
pub const DEFAULT_RSYNC_BIN: &str = "rsync";

/// Default directory for external tool logs.
pub const DEFAULT_LOG_DIR: &str = "/tmp";

/// Log file for pre-dump invocations.
pub const PRE_DUMP_LOG: &str = "docker_pre_checkpoint.log";

/// Log file for final dump invocations.
pub const FINAL_DUMP_LOG: &str = "docker_checkpoint.log";

/// Log file for restore invocations.
pub const RESTORE_LOG: &str = "docker_restore.log";

/// Suffix appended to the short container id to name its checkpoint.
pub const CHECKPOINT_NAME_SUFFIX: &str = "_checkpoint";

/// Default working directory for checkpoint images.
pub const DEFAULT_WORK_DIR: &str = "/var/lib/magikmigrate";

/// Subdirectory of the work dir holding one image directory per dump.
pub const DUMP_DIR: &str = "dump";

/// Subdirectory of the work dir holding the dumped CPU descriptor.
pub const CPUINFO_DIR: &str = "cpuinfo";

/// Subdirectory of the work dir where the destination stores the uploaded
/// CPU descriptor.
pub const PEER_CPUINFO_DIR: &str = "peer-cpuinfo";

/// CPU descriptor image written by `criu cpuinfo dump`.
pub const CPUINFO_IMAGE: &str = "cpuinfo.img";

/// Maximum accepted size of a CPU descriptor image (1 MiB).
pub const MAX_CPUINFO_SIZE: usize = 1024 * 1024;

// =============================================================================
// Timeouts
// =============================================================================
//
// Every external process and remote call is bounded. Dumps of large
// containers are slow, so the checkpoint timeout is generous.
// =============================================================================

/// Timeout for a single dump or restore invocation (10 minutes).
pub const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for short tool queries (`--version`, feature checks).
pub const TOOL_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a single rsync transfer (1 hour).
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Timeout for a remote peer request, restore excluded (60 seconds).
///
/// A restore request waits for [`CHECKPOINT_TIMEOUT`] instead.
pub const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Remote Peer Control Protocol
// =============================================================================

/// Default TCP port of the destination control server.
pub const DEFAULT_CONTROL_PORT: u16 = 7788;

/// Maximum length of a single request line (3 MiB, fits a hex CPU descriptor).
pub const MAX_REQUEST_LINE_LEN: usize = 3 * 1024 * 1024;

/// Maximum concurrent control connections on the destination.
pub const MAX_CONNECTIONS: usize = 16;
