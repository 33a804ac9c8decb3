//! Tests for configuration loading.

use magikmigrate::{Config, Error, MigrationMode, PreDumpMode};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// File Loading Tests
// =============================================================================

#[test]
fn test_load_from_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [migration]
        to = "node-b"
        skip_cpu_check = true

        [checkpoint]
        criu_bin = "/usr/local/sbin/criu"
        timeout = "90s"

        [transfer]
        work_dir = "/srv/migrate"
        keep_images = true

        [peer]
        port = 9000
        timeout = "2m"
        "#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.migration.mode, MigrationMode::Live);
    assert_eq!(config.migration.options.to, "node-b");
    assert!(config.migration.options.skip_cpu_check);
    assert!(!config.migration.options.force);
    assert_eq!(config.migration.options.pre_dump, PreDumpMode::Auto);
    assert_eq!(
        config.checkpoint.criu_bin,
        PathBuf::from("/usr/local/sbin/criu")
    );
    assert_eq!(config.checkpoint.timeout, Duration::from_secs(90));
    assert_eq!(config.transfer.work_dir, PathBuf::from("/srv/migrate"));
    assert!(config.transfer.keep_images);
    assert_eq!(config.peer.port, 9000);
    assert_eq!(config.peer.timeout, Duration::from_secs(120));
}

#[test]
fn test_missing_file_is_config_error() {
    let temp = TempDir::new().unwrap();
    let err = Config::load(&temp.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_malformed_toml_is_config_error() {
    let err = Config::from_toml("[peer\nport = 1").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_zero_port_rejected() {
    let err = Config::from_toml("[peer]\nport = 0").unwrap_err();
    assert!(err.to_string().contains("peer.port"));
}

#[test]
fn test_unknown_mode_rejected() {
    assert!(Config::from_toml("[migration]\nmode = \"teleport\"").is_err());
}

#[test]
fn test_storage_layout_follows_root_and_driver() {
    let config = Config::from_toml(
        r#"
        [storage]
        docker_root = "/data/docker"
        driver = "aufs"
        max_chain_depth = 32
        "#,
    )
    .unwrap();

    let layout = config.storage.layout();
    assert_eq!(
        layout.container_config("abc"),
        PathBuf::from("/data/docker/containers/abc/config.v2.json")
    );
    assert_eq!(config.storage.resolver_options().max_chain_depth, 32);
}

#[test]
fn test_default_path_is_under_config_dir() {
    if let Some(path) = Config::default_path() {
        assert!(path.ends_with("magikmigrate/config.toml"));
    }
}
