//! Tests for the container identity and layer resolver.
//!
//! Builds aufs-style storage trees in temporary directories and checks
//! prefix matching, chain walks, volume classification and path sets.

use magikmigrate::resolver::ResolverOptions;
use magikmigrate::{
    Error, LayerResolver, StorageLayout, VolumeBindings, build_path_set,
};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const FULL_ID: &str = "4f1c2a9be0d34c51a7e6b1f0c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1";
const MOUNT_ID: &str = "9a8b7c6d5e4f";
const IMAGE_ID: &str = "1111222233334444";

/// Writes a minimal well-formed store for one container.
struct Fixture {
    temp: TempDir,
    layout: StorageLayout,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path(), "aufs");
        Self { temp, layout }
    }

    fn write(&self, path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn container(&self, full_id: &str, config: &str) {
        self.write(&self.layout.container_config(full_id), config);
    }

    fn standard(&self) {
        self.container(
            FULL_ID,
            &format!(r#"{{"Image":"sha256:{IMAGE_ID}","MountPoints":{{}}}}"#),
        );
        self.write(&self.layout.mount_id_file(FULL_ID), &format!("{MOUNT_ID}\n"));
        self.write(&self.layout.container_parent_file(FULL_ID), "sha256:layer3");
        self.write(&self.layout.layer_parent_file("layer3"), "sha256:layer2");
        self.write(&self.layout.layer_parent_file("layer2"), "sha256:layer1");
        fs::create_dir_all(self.layout.layer_dir("layer1")).unwrap();
        self.write(
            &self.layout.layers_file(MOUNT_ID),
            &format!("{MOUNT_ID}-init\nbase2\nbase1\n"),
        );
    }

    fn resolver(&self) -> LayerResolver {
        LayerResolver::new(self.layout.clone())
    }
}

// =============================================================================
// Identity Tests
// =============================================================================

#[test]
fn test_prefix_resolves_to_matching_full_id() {
    let fx = Fixture::new();
    fx.standard();

    for prefix in ["4f1", "4f1c2a", FULL_ID] {
        let identity = fx.resolver().resolve_full_identity(prefix).unwrap();
        assert!(identity.full_id.starts_with(prefix));
        assert_eq!(identity.full_id, FULL_ID);
        assert_eq!(identity.short_id, prefix);
    }
}

#[test]
fn test_unknown_prefix_is_not_found() {
    let fx = Fixture::new();
    fx.standard();

    let err = fx.resolver().resolve_full_identity("ffff").unwrap_err();
    assert!(matches!(err, Error::ContainerNotFound(ref p) if p == "ffff"));
    assert!(err.is_setup());
}

#[test]
fn test_short_prefix_rejected() {
    let fx = Fixture::new();
    fx.standard();

    let err = fx.resolver().resolve_full_identity("4f").unwrap_err();
    assert!(matches!(err, Error::InvalidContainerId { .. }));
}

#[test]
fn test_ambiguous_prefix_first_wins_unless_strict() {
    let fx = Fixture::new();
    fx.container("abc111", "{}");
    fx.container("abc222", "{}");

    let identity = fx.resolver().resolve_full_identity("abc").unwrap();
    assert!(identity.full_id.starts_with("abc"));

    let strict = fx.resolver().with_options(ResolverOptions {
        strict_prefix: true,
        ..ResolverOptions::default()
    });
    match strict.resolve_full_identity("abc").unwrap_err() {
        Error::AmbiguousContainerId { candidates, .. } => assert_eq!(candidates.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        strict.resolve_full_identity("abc1").unwrap().full_id,
        "abc111"
    );
}

#[test]
fn test_missing_containers_dir_is_metadata_missing() {
    let fx = Fixture::new();
    let err = fx.resolver().resolve_full_identity("abc").unwrap_err();
    assert!(matches!(err, Error::MetadataMissing { .. }));
}

// =============================================================================
// Chain Walk Tests
// =============================================================================

#[test]
fn test_diff_chain_follows_parent_links() {
    let fx = Fixture::new();
    fx.standard();

    let chain = fx.resolver().resolve_diff_chain(FULL_ID).unwrap();
    assert_eq!(chain.ids(), ["layer3", "layer2", "layer1"]);
}

#[test]
fn test_diff_chain_without_parent_is_empty() {
    let fx = Fixture::new();
    fx.container("abc111", "{}");

    let chain = fx.resolver().resolve_diff_chain("abc111").unwrap();
    assert!(chain.is_empty());
}

#[test]
fn test_cyclic_diff_chain_is_corrupt() {
    let fx = Fixture::new();
    fx.container("abc111", "{}");
    fx.write(&fx.layout.container_parent_file("abc111"), "sha256:loopa");
    fx.write(&fx.layout.layer_parent_file("loopa"), "sha256:loopb");
    fx.write(&fx.layout.layer_parent_file("loopb"), "sha256:loopa");

    let resolver = fx.resolver().with_options(ResolverOptions {
        max_chain_depth: 16,
        ..ResolverOptions::default()
    });
    match resolver.resolve_diff_chain("abc111").unwrap_err() {
        Error::CorruptChain { start, limit } => {
            assert_eq!(start, "abc111");
            assert_eq!(limit, 16);
        }
        other => panic!("unexpected error: {other}"),
    }
}

impl Fixture {
    /// Links `abc111` to a linear chain of `depth` layers.
    fn linear_diff_chain(&self, depth: usize) {
        self.container("abc111", "{}");
        let mut file = self.layout.container_parent_file("abc111");
        for n in 1..=depth {
            let id = format!("layer{n}");
            self.write(&file, &format!("sha256:{id}"));
            file = self.layout.layer_parent_file(&id);
        }
    }

    /// Writes a layers file listing `count` ancestors of `mount`.
    fn mount_ancestors(&self, mount: &str, count: usize) {
        let lines: String = (1..=count).map(|n| format!("base{n}\n")).collect();
        self.write(&self.layout.layers_file(mount), &lines);
    }
}

fn limited(fx: &Fixture, depth: usize) -> LayerResolver {
    fx.resolver().with_options(ResolverOptions {
        max_chain_depth: depth,
        ..ResolverOptions::default()
    })
}

#[test]
fn test_diff_chain_at_depth_limit_resolves() {
    let fx = Fixture::new();
    fx.linear_diff_chain(4);

    let chain = limited(&fx, 4).resolve_diff_chain("abc111").unwrap();
    assert_eq!(chain.ids(), ["layer1", "layer2", "layer3", "layer4"]);
}

#[test]
fn test_diff_chain_past_depth_limit_is_corrupt() {
    let fx = Fixture::new();
    fx.linear_diff_chain(5);

    let err = limited(&fx, 4).resolve_diff_chain("abc111").unwrap_err();
    assert!(matches!(err, Error::CorruptChain { limit: 4, .. }));
}

#[test]
fn test_mount_chain_at_depth_limit_resolves() {
    let fx = Fixture::new();
    fx.mount_ancestors(MOUNT_ID, 4);

    let chain = limited(&fx, 4).resolve_mount_diff_chain(MOUNT_ID).unwrap();
    assert_eq!(chain.len(), 5);
    assert_eq!(chain.ids()[0], MOUNT_ID);
    assert_eq!(chain.ids()[4], "base4");
}

#[test]
fn test_oversized_layers_file_is_corrupt() {
    let fx = Fixture::new();
    fx.mount_ancestors(MOUNT_ID, 5);

    match limited(&fx, 4).resolve_mount_diff_chain(MOUNT_ID).unwrap_err() {
        Error::CorruptChain { start, limit } => {
            assert_eq!(start, MOUNT_ID);
            assert_eq!(limit, 4);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_parent_escaping_store_rejected() {
    let fx = Fixture::new();
    fx.container("abc111", "{}");
    fx.write(&fx.layout.container_parent_file("abc111"), "sha256:../../etc");

    let err = fx.resolver().resolve_diff_chain("abc111").unwrap_err();
    assert!(matches!(err, Error::MetadataInvalid { .. }));
}

#[test]
fn test_mount_chain_starts_with_own_layer() {
    let fx = Fixture::new();
    fx.standard();

    let chain = fx.resolver().resolve_mount_diff_chain(MOUNT_ID).unwrap();
    assert_eq!(
        chain.ids(),
        [
            MOUNT_ID.to_string(),
            format!("{MOUNT_ID}-init"),
            "base2".to_string(),
            "base1".to_string()
        ]
    );
}

#[test]
fn test_missing_layers_file_is_metadata_missing() {
    let fx = Fixture::new();
    let err = fx.resolver().resolve_mount_diff_chain(MOUNT_ID).unwrap_err();
    match err {
        Error::MetadataMissing { path, .. } => assert_eq!(path, fx.layout.layers_file(MOUNT_ID)),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_mount_id_is_metadata_missing() {
    let fx = Fixture::new();
    fx.container("abc111", "{}");
    let err = fx.resolver().resolve_mount_id("abc111").unwrap_err();
    assert!(matches!(err, Error::MetadataMissing { .. }));
}

// =============================================================================
// Volume Tests
// =============================================================================

#[test]
fn test_managed_volume() {
    let fx = Fixture::new();
    fx.container(
        "abc111",
        r#"{"MountPoints":{"/data":{"Name":"dbdata","Source":""}}}"#,
    );
    assert_eq!(
        fx.resolver().resolve_volumes("abc111").unwrap(),
        Some(VolumeBindings::Managed(vec!["dbdata".into()]))
    );
}

#[test]
fn test_external_volume() {
    let fx = Fixture::new();
    fx.container(
        "abc111",
        r#"{"MountPoints":{"/data":{"Name":"","Source":"/srv/data"}}}"#,
    );
    assert_eq!(
        fx.resolver().resolve_volumes("abc111").unwrap(),
        Some(VolumeBindings::External(vec!["/srv/data".into()]))
    );
}

#[test]
fn test_managed_volume_wins_over_external() {
    let fx = Fixture::new();
    fx.container(
        "abc111",
        r#"{"MountPoints":{
            "/srv":{"Name":"","Source":"/srv/data"},
            "/db":{"Name":"dbdata","Source":"/var/lib/docker/volumes/dbdata/_data"}
        }}"#,
    );
    assert_eq!(
        fx.resolver().resolve_volumes("abc111").unwrap(),
        Some(VolumeBindings::Managed(vec!["dbdata".into()]))
    );
}

#[test]
fn test_no_mount_points() {
    let fx = Fixture::new();
    fx.container("abc111", "{}");
    assert_eq!(fx.resolver().resolve_volumes("abc111").unwrap(), None);
}

#[test]
fn test_malformed_config_is_metadata_invalid() {
    let fx = Fixture::new();
    fx.container("abc111", "{not json");
    let err = fx.resolver().resolve_volumes("abc111").unwrap_err();
    assert!(matches!(err, Error::MetadataInvalid { .. }));
}

// =============================================================================
// Path Set Tests
// =============================================================================

#[test]
fn test_full_resolution_and_path_set() {
    let fx = Fixture::new();
    fx.standard();
    fs::create_dir_all(fx.layout.image_metadata_dir(IMAGE_ID)).unwrap();

    let resolved = fx.resolver().resolve("4f1c").unwrap();
    assert_eq!(resolved.mount_id, MOUNT_ID);
    assert_eq!(resolved.image_id, IMAGE_ID);
    assert!(resolved.image_metadata_present);

    let paths = build_path_set(&fx.layout, &resolved);
    let root = fx.temp.path();
    assert_eq!(paths.rootfs, root.join("aufs/mnt").join(MOUNT_ID));
    assert_eq!(
        paths.init_rootfs,
        root.join("aufs/mnt").join(format!("{MOUNT_ID}-init"))
    );
    assert_eq!(paths.config_dir, root.join("containers").join(FULL_ID));
    assert_eq!(
        paths.image_dir,
        root.join("image/aufs/imagedb/content/sha256").join(IMAGE_ID)
    );
    assert!(paths.image_metadata_dir.is_some());
    assert_eq!(paths.diff_dirs.len(), 3);
    assert_eq!(paths.mount_diff_dirs.len(), 4);
    assert_eq!(
        paths.layer_files[0],
        fx.layout.layers_file(&format!("{MOUNT_ID}-init"))
    );
    assert!(paths.volumes.is_empty());
    assert!(paths.all().contains(&paths.rootfs.as_path()));
    assert_eq!(paths.mutable_paths()[0], paths.rootfs.as_path());
}

#[test]
fn test_path_set_is_idempotent() {
    let fx = Fixture::new();
    fx.standard();

    let resolved = fx.resolver().resolve(FULL_ID).unwrap();
    let first = build_path_set(&fx.layout, &resolved);
    let second = build_path_set(&fx.layout, &resolved);
    assert_eq!(first, second);
    assert!(first.image_metadata_dir.is_none());
}
