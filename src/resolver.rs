//! # Container Identity & Layer Resolver
//!
//! Discovers which on-disk artifacts belong to a container in the container
//! engine's layered storage, so they can be synchronized to the destination.
//!
//! ## Storage Model
//!
//! ```text
//! /var/lib/docker/
//! ├── containers/<full-id>/config.v2.json        container config (Image, MountPoints)
//! ├── image/aufs/
//! │   ├── layerdb/mounts/<full-id>/{mount-id,parent}
//! │   ├── layerdb/sha256/<diff-id>/parent          metadata-layer chain
//! │   └── imagedb/{content,metadata}/sha256/<image-id>
//! ├── aufs/
//! │   ├── mnt/<mount-id>[-init]                    merged rootfs
//! │   ├── diff/<mount-id>                          per-layer mutable content
//! │   └── layers/<mount-id>                        newline list of ancestor mounts
//! └── volumes/<name>                               managed volumes
//! ```
//!
//! ## Resolution Pipeline
//!
//! Each step returns a value consumed by the next; nothing is cached on the
//! resolver itself:
//!
//! ```text
//! short id ──▶ full id ──┬──▶ mount id ──▶ mount chain ──┐
//!                        ├──▶ diff chain ────────────────┤
//!                        ├──▶ volumes ───────────────────┼──▶ FilesystemPathSet
//!                        └──▶ image id ──────────────────┘
//! ```
//!
//! ## Chain Walks
//!
//! Both chains are singly-linked lists stored as one file per node. Walks
//! are iterative and bounded by [`ResolverOptions::max_chain_depth`]; a store
//! whose chain exceeds the bound fails with [`Error::CorruptChain`] instead
//! of looping forever.
//!
//! ## Prefix Matching
//!
//! By default the first container whose id starts with the prefix wins, in
//! directory scan order. [`ResolverOptions::strict_prefix`] turns multiple
//! matches into [`Error::AmbiguousContainerId`].

use crate::constants::{
    CONTAINER_CONFIG_FILE, CONTAINERS_DIR, DEFAULT_DOCKER_ROOT, DEFAULT_GRAPH_DRIVER,
    DIGEST_SEPARATOR, INIT_LAYER_SUFFIX, MAX_CHAIN_DEPTH, MAX_CONFIG_SIZE,
    MAX_METADATA_FILE_SIZE, MIN_SHORT_ID_LEN, MOUNT_ID_FILE, PARENT_FILE, VOLUMES_DIR,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Storage Layout
// =============================================================================

/// Paths of the container engine's layered storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    root: PathBuf,
    driver: String,
}

impl StorageLayout {
    /// Creates a layout for the given storage root and graph driver.
    pub fn new(root: impl Into<PathBuf>, driver: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            driver: driver.into(),
        }
    }

    /// Returns the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the graph driver name.
    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(CONTAINERS_DIR)
    }

    pub fn container_dir(&self, full_id: &str) -> PathBuf {
        self.containers_dir().join(full_id)
    }

    pub fn container_config(&self, full_id: &str) -> PathBuf {
        self.container_dir(full_id).join(CONTAINER_CONFIG_FILE)
    }

    fn layerdb(&self) -> PathBuf {
        self.root.join("image").join(&self.driver).join("layerdb")
    }

    pub fn layerdb_mount_dir(&self, full_id: &str) -> PathBuf {
        self.layerdb().join("mounts").join(full_id)
    }

    pub fn mount_id_file(&self, full_id: &str) -> PathBuf {
        self.layerdb_mount_dir(full_id).join(MOUNT_ID_FILE)
    }

    pub fn container_parent_file(&self, full_id: &str) -> PathBuf {
        self.layerdb_mount_dir(full_id).join(PARENT_FILE)
    }

    pub fn layer_dir(&self, diff_id: &str) -> PathBuf {
        self.layerdb().join("sha256").join(diff_id)
    }

    pub fn layer_parent_file(&self, diff_id: &str) -> PathBuf {
        self.layer_dir(diff_id).join(PARENT_FILE)
    }

    fn imagedb(&self) -> PathBuf {
        self.root.join("image").join(&self.driver).join("imagedb")
    }

    pub fn image_content_dir(&self, image_id: &str) -> PathBuf {
        self.imagedb().join("content").join("sha256").join(image_id)
    }

    pub fn image_metadata_dir(&self, image_id: &str) -> PathBuf {
        self.imagedb().join("metadata").join("sha256").join(image_id)
    }

    pub fn mnt_dir(&self, mount_id: &str) -> PathBuf {
        self.root.join(&self.driver).join("mnt").join(mount_id)
    }

    pub fn diff_dir(&self, mount_id: &str) -> PathBuf {
        self.root.join(&self.driver).join("diff").join(mount_id)
    }

    pub fn layers_file(&self, mount_id: &str) -> PathBuf {
        self.root.join(&self.driver).join("layers").join(mount_id)
    }

    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.root.join(VOLUMES_DIR).join(name)
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new(DEFAULT_DOCKER_ROOT, DEFAULT_GRAPH_DRIVER)
    }
}

// =============================================================================
// Resolved Types
// =============================================================================

/// A container's user-supplied and canonical identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerIdentity {
    /// Prefix supplied by the user (at least 3 characters).
    pub short_id: String,
    /// Canonical identifier starting with `short_id`.
    pub full_id: String,
}

/// Ordered layer identifiers obtained by following parent links.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerChain(Vec<String>);

impl LayerChain {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Volume bindings of a container, all of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entries", rename_all = "lowercase")]
pub enum VolumeBindings {
    /// Named volumes whose storage the engine owns.
    Managed(Vec<String>),
    /// Host paths bind-mounted into the container.
    External(Vec<PathBuf>),
}

/// Everything the resolver learned about a container.
///
/// Input of [`build_path_set`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedContainer {
    pub identity: ContainerIdentity,
    pub mount_id: String,
    /// Metadata-layer chain (diff ids), container's parent first.
    pub diff_chain: LayerChain,
    /// Mount-layer chain, the container's own mount id first.
    pub mount_chain: LayerChain,
    pub volumes: Option<VolumeBindings>,
    pub image_id: String,
    /// Whether the image metadata directory exists on disk.
    pub image_metadata_present: bool,
}

/// The full set of directories to synchronize for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPathSet {
    pub rootfs: PathBuf,
    pub init_rootfs: PathBuf,
    pub config_dir: PathBuf,
    pub layerdb_dir: PathBuf,
    pub image_dir: PathBuf,
    pub image_metadata_dir: Option<PathBuf>,
    /// `layers` files, init layer first.
    pub layer_files: Vec<PathBuf>,
    /// Metadata-layer directories, one per diff chain entry.
    pub diff_dirs: Vec<PathBuf>,
    /// Mutable diff directories, one per mount chain entry.
    pub mount_diff_dirs: Vec<PathBuf>,
    pub volumes: Vec<PathBuf>,
}

impl FilesystemPathSet {
    /// Returns every path in synchronization order.
    pub fn all(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = vec![
            &self.rootfs,
            &self.init_rootfs,
            &self.config_dir,
            &self.layerdb_dir,
            &self.image_dir,
        ];
        paths.extend(self.layer_files.iter().map(PathBuf::as_path));
        paths.extend(self.diff_dirs.iter().map(PathBuf::as_path));
        paths.extend(self.volumes.iter().map(PathBuf::as_path));
        paths.extend(self.mount_diff_dirs.iter().map(PathBuf::as_path));
        if let Some(meta) = &self.image_metadata_dir {
            paths.push(meta);
        }
        paths
    }

    /// Returns the paths a running container can still modify.
    ///
    /// Image layers below the container's own mount layer are read-only and
    /// are copied once during the preliminary sync.
    pub fn mutable_paths(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = vec![&self.rootfs, &self.config_dir];
        if let Some(own) = self.mount_diff_dirs.first() {
            paths.push(own);
        }
        paths.extend(self.volumes.iter().map(PathBuf::as_path));
        paths
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolver behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// Maximum parent links followed before the chain is declared corrupt.
    pub max_chain_depth: usize,
    /// Reject prefixes matching more than one container.
    pub strict_prefix: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_chain_depth: MAX_CHAIN_DEPTH,
            strict_prefix: false,
        }
    }
}

/// Resolves container identity and on-disk state from layered storage.
#[derive(Debug, Clone, Default)]
pub struct LayerResolver {
    layout: StorageLayout,
    options: ResolverOptions,
}

impl LayerResolver {
    /// Creates a resolver over the given storage layout.
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            options: ResolverOptions::default(),
        }
    }

    /// Sets the resolver options.
    #[must_use]
    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Runs the full resolution pipeline for a short id.
    pub fn resolve(&self, short_id: &str) -> Result<ResolvedContainer> {
        let identity = self.resolve_full_identity(short_id)?;
        let mount_id = self.resolve_mount_id(&identity.full_id)?;
        let diff_chain = self.resolve_diff_chain(&identity.full_id)?;
        let mount_chain = self.resolve_mount_diff_chain(&mount_id)?;
        let volumes = self.resolve_volumes(&identity.full_id)?;
        let image_id = self.resolve_image_id(&identity.full_id)?;
        let image_metadata_present = self.layout.image_metadata_dir(&image_id).is_dir();

        info!(
            container = %identity.full_id,
            mount_id = %mount_id,
            diff_layers = diff_chain.len(),
            mount_layers = mount_chain.len(),
            "container resolved"
        );

        Ok(ResolvedContainer {
            identity,
            mount_id,
            diff_chain,
            mount_chain,
            volumes,
            image_id,
            image_metadata_present,
        })
    }

    /// Finds the full id of the container whose id starts with `short_id`.
    pub fn resolve_full_identity(&self, short_id: &str) -> Result<ContainerIdentity> {
        validate_short_id(short_id)?;

        let dir = self.layout.containers_dir();
        let entries = fs::read_dir(&dir).map_err(|e| Error::metadata_missing(&dir, e))?;

        let mut matches = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::metadata_missing(&dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(short_id) {
                matches.push(name);
                if !self.options.strict_prefix {
                    break;
                }
            }
        }

        match matches.len() {
            0 => Err(Error::ContainerNotFound(short_id.to_string())),
            1 => Ok(ContainerIdentity {
                short_id: short_id.to_string(),
                full_id: matches.remove(0),
            }),
            _ => Err(Error::AmbiguousContainerId {
                prefix: short_id.to_string(),
                candidates: matches,
            }),
        }
    }

    /// Reads the mount layer id of a container.
    pub fn resolve_mount_id(&self, full_id: &str) -> Result<String> {
        let path = self.layout.mount_id_file(full_id);
        let mount_id = read_single_value(&path)?;
        validate_layer_id(&mount_id, &path)?;
        debug!(container = %full_id, mount_id = %mount_id, "mount id resolved");
        Ok(mount_id)
    }

    /// Walks the metadata-layer parent chain starting at the container.
    ///
    /// Returns diff ids nearest-first with the digest algorithm stripped.
    /// An empty chain means the container has no parent layer.
    pub fn resolve_diff_chain(&self, full_id: &str) -> Result<LayerChain> {
        let mut chain = Vec::new();
        let mut parent = self.layout.container_parent_file(full_id);

        while parent.exists() {
            if chain.len() >= self.options.max_chain_depth {
                return Err(Error::CorruptChain {
                    start: full_id.to_string(),
                    limit: self.options.max_chain_depth,
                });
            }

            debug!(path = %parent.display(), "following parent link");
            let raw = read_single_value(&parent)?;
            let diff_id = strip_digest_prefix(&raw).to_string();
            validate_layer_id(&diff_id, &parent)?;

            parent = self.layout.layer_parent_file(&diff_id);
            chain.push(diff_id);
        }

        Ok(LayerChain(chain))
    }

    /// Reads the ancestor list of a mount layer, prefixed by the layer itself.
    pub fn resolve_mount_diff_chain(&self, mount_id: &str) -> Result<LayerChain> {
        let path = self.layout.layers_file(mount_id);
        let content = fs::read_to_string(&path).map_err(|e| Error::metadata_missing(&path, e))?;

        let mut chain = vec![mount_id.to_string()];
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if chain.len() > self.options.max_chain_depth {
                return Err(Error::CorruptChain {
                    start: mount_id.to_string(),
                    limit: self.options.max_chain_depth,
                });
            }
            validate_layer_id(line, &path)?;
            chain.push(line.to_string());
        }

        Ok(LayerChain(chain))
    }

    /// Classifies the container's mount points into volume bindings.
    pub fn resolve_volumes(&self, full_id: &str) -> Result<Option<VolumeBindings>> {
        let config = self.load_config(full_id)?;
        Ok(classify_volumes(config.mount_points()?))
    }

    /// Returns the container's image id without its digest algorithm.
    pub fn resolve_image_id(&self, full_id: &str) -> Result<String> {
        let config = self.load_config(full_id)?;
        let image_id = strip_digest_prefix(&config.image).to_string();
        validate_layer_id(&image_id, &config.path)?;
        Ok(image_id)
    }

    fn load_config(&self, full_id: &str) -> Result<ContainerConfig> {
        let path = self.layout.container_config(full_id);
        let meta = fs::metadata(&path).map_err(|e| Error::metadata_missing(&path, e))?;
        if meta.len() > MAX_CONFIG_SIZE {
            return Err(Error::metadata_invalid(
                &path,
                format!("{} bytes exceeds {MAX_CONFIG_SIZE}", meta.len()),
            ));
        }
        let content = fs::read_to_string(&path).map_err(|e| Error::metadata_missing(&path, e))?;
        let mut config: ContainerConfig =
            serde_json::from_str(&content).map_err(|e| Error::metadata_invalid(&path, e))?;
        config.path = path;
        Ok(config)
    }
}

// =============================================================================
// Container Config Document
// =============================================================================

#[derive(Debug, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "MountPoints", default)]
    mount_points: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip)]
    path: PathBuf,
}

impl ContainerConfig {
    /// Returns mount points in document order.
    fn mount_points(&self) -> Result<Vec<MountPoint>> {
        let Some(map) = &self.mount_points else {
            return Ok(Vec::new());
        };
        map.iter()
            .map(|(destination, value)| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    Error::metadata_invalid(&self.path, format!("mount point {destination}: {e}"))
                })
            })
            .collect()
    }
}

/// One entry of the container's mount-point map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MountPoint {
    /// Managed volume name (empty for bind mounts).
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Host source path (empty for some managed volumes).
    #[serde(rename = "Source", default)]
    pub source: String,
}

/// Classifies mount points in scan order.
///
/// The first entry with a volume name wins: classification stops there and
/// the result holds only that name, discarding bind mounts seen before it.
/// Without any named volume, every non-empty source is an external binding.
pub fn classify_volumes(mount_points: impl IntoIterator<Item = MountPoint>) -> Option<VolumeBindings> {
    let mut external = Vec::new();
    for mp in mount_points {
        if !mp.name.is_empty() {
            debug!(volume = %mp.name, "managed volume");
            return Some(VolumeBindings::Managed(vec![mp.name]));
        }
        if !mp.source.is_empty() {
            debug!(source = %mp.source, "external volume");
            external.push(PathBuf::from(mp.source));
        }
    }
    if external.is_empty() {
        None
    } else {
        Some(VolumeBindings::External(external))
    }
}

// =============================================================================
// Path Set
// =============================================================================

/// Combines resolver output into the directories to synchronize.
///
/// Pure apart from the diagnostic trace: identical inputs always produce
/// identical path sets.
pub fn build_path_set(layout: &StorageLayout, resolved: &ResolvedContainer) -> FilesystemPathSet {
    let full_id = &resolved.identity.full_id;
    let mount_id = &resolved.mount_id;
    let init_mount = format!("{mount_id}{INIT_LAYER_SUFFIX}");

    let mut layer_files = vec![layout.layers_file(&init_mount)];
    layer_files.extend(resolved.mount_chain.iter().map(|id| layout.layers_file(id)));

    let volumes = match &resolved.volumes {
        Some(VolumeBindings::Managed(names)) => {
            names.iter().map(|name| layout.volume_dir(name)).collect()
        }
        Some(VolumeBindings::External(paths)) => paths.clone(),
        None => Vec::new(),
    };

    let paths = FilesystemPathSet {
        rootfs: layout.mnt_dir(mount_id),
        init_rootfs: layout.mnt_dir(&init_mount),
        config_dir: layout.container_dir(full_id),
        layerdb_dir: layout.layerdb_mount_dir(full_id),
        image_dir: layout.image_content_dir(&resolved.image_id),
        image_metadata_dir: resolved
            .image_metadata_present
            .then(|| layout.image_metadata_dir(&resolved.image_id)),
        layer_files,
        diff_dirs: resolved.diff_chain.iter().map(|id| layout.layer_dir(id)).collect(),
        mount_diff_dirs: resolved.mount_chain.iter().map(|id| layout.diff_dir(id)).collect(),
        volumes,
    };

    info!("Container rootfs: {}", paths.rootfs.display());
    info!("Container config: {}", paths.config_dir.display());
    info!("Container mounts dir: {}", paths.layerdb_dir.display());
    info!("Container image: {}", paths.image_dir.display());
    info!("Container layers: {:?}", paths.layer_files);
    info!("Container diff: {:?}", paths.diff_dirs);
    info!("Container mount diff: {:?}", paths.mount_diff_dirs);
    info!("Container volumes: {:?}", paths.volumes);

    paths
}

// =============================================================================
// Helpers
// =============================================================================

/// Strips the digest algorithm (`sha256:`) from a content-addressed id.
///
/// Ids without a separator are returned unchanged.
pub fn strip_digest_prefix(digest: &str) -> &str {
    digest
        .split_once(DIGEST_SEPARATOR)
        .map_or(digest, |(_, hash)| hash)
}

fn validate_short_id(short_id: &str) -> Result<()> {
    if short_id.len() < MIN_SHORT_ID_LEN {
        return Err(Error::InvalidContainerId {
            id: short_id.to_string(),
            reason: format!("must be at least {MIN_SHORT_ID_LEN} characters"),
        });
    }
    // SECURITY: the prefix is matched against directory names only
    if !short_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidContainerId {
            id: short_id.to_string(),
            reason: "must contain only alphanumeric characters".to_string(),
        });
    }
    Ok(())
}

/// Rejects ids that would escape the storage root when joined to a path.
fn validate_layer_id(id: &str, source: &Path) -> Result<()> {
    let safe = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if safe {
        Ok(())
    } else {
        Err(Error::metadata_invalid(source, format!("invalid layer id '{id}'")))
    }
}

fn read_single_value(path: &Path) -> Result<String> {
    let meta = fs::metadata(path).map_err(|e| Error::metadata_missing(path, e))?;
    if meta.len() > MAX_METADATA_FILE_SIZE {
        return Err(Error::metadata_invalid(
            path,
            format!("{} bytes exceeds {MAX_METADATA_FILE_SIZE}", meta.len()),
        ));
    }
    let value = fs::read_to_string(path).map_err(|e| Error::metadata_missing(path, e))?;
    Ok(value.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_digest_prefix() {
        assert_eq!(strip_digest_prefix("sha256:deadbeef"), "deadbeef");
        assert_eq!(strip_digest_prefix("deadbeef"), "deadbeef");
        assert_eq!(strip_digest_prefix("sha512:ab:cd"), "ab:cd");
    }

    #[test]
    fn test_short_id_validation() {
        assert!(validate_short_id("ab").is_err());
        assert!(validate_short_id("abc").is_ok());
        assert!(validate_short_id("../etc").is_err());
    }

    #[test]
    fn test_layer_id_validation() {
        let src = Path::new("/x");
        assert!(validate_layer_id("abc123", src).is_ok());
        assert!(validate_layer_id("abc-init", src).is_ok());
        assert!(validate_layer_id("..", src).is_err());
        assert!(validate_layer_id("a/b", src).is_err());
        assert!(validate_layer_id("", src).is_err());
    }

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/var/lib/docker", "aufs");
        assert_eq!(
            layout.mount_id_file("c1"),
            PathBuf::from("/var/lib/docker/image/aufs/layerdb/mounts/c1/mount-id")
        );
        assert_eq!(
            layout.layer_parent_file("d1"),
            PathBuf::from("/var/lib/docker/image/aufs/layerdb/sha256/d1/parent")
        );
        assert_eq!(
            layout.diff_dir("m1"),
            PathBuf::from("/var/lib/docker/aufs/diff/m1")
        );
        assert_eq!(
            layout.image_metadata_dir("i1"),
            PathBuf::from("/var/lib/docker/image/aufs/imagedb/metadata/sha256/i1")
        );
    }

    #[test]
    fn test_classify_managed_wins() {
        let mps = vec![
            MountPoint {
                name: String::new(),
                source: "/srv/data".into(),
            },
            MountPoint {
                name: "dbdata".into(),
                source: "/var/lib/docker/volumes/dbdata/_data".into(),
            },
        ];
        assert_eq!(
            classify_volumes(mps),
            Some(VolumeBindings::Managed(vec!["dbdata".into()]))
        );
    }

    #[test]
    fn test_classify_empty() {
        assert_eq!(classify_volumes(Vec::new()), None);
        assert_eq!(classify_volumes(vec![MountPoint::default()]), None);
    }
}
