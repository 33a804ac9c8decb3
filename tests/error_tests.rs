//! Tests for error types.
//!
//! Validates display formatting and the retry classification callers use
//! to choose an exit code.

use magikmigrate::{Error, ErrorKind};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Display Tests
// =============================================================================

#[test]
fn test_invalid_container_id_display() {
    let err = Error::InvalidContainerId {
        id: "ab".to_string(),
        reason: "prefix shorter than 3 characters".to_string(),
    };
    let msg = format!("{}", err);

    assert!(msg.contains("ab"), "should include container ID");
    assert!(msg.contains("invalid container ID"), "should indicate invalid ID");
    assert!(msg.contains("shorter than 3"), "should include reason");
}

#[test]
fn test_ambiguous_prefix_lists_candidates() {
    let err = Error::AmbiguousContainerId {
        prefix: "abc".to_string(),
        candidates: vec!["abc111".to_string(), "abc222".to_string()],
    };
    let msg = format!("{}", err);

    assert!(msg.contains("ambiguous"));
    assert!(msg.contains("abc111") && msg.contains("abc222"));
}

#[test]
fn test_external_tool_points_at_log() {
    let err = Error::ExternalTool {
        operation: "pre-dump".to_string(),
        status: "exit status: 1".to_string(),
        log: PathBuf::from("/tmp/docker_pre_checkpoint.log"),
    };
    let msg = format!("{}", err);

    assert!(msg.contains("pre-dump"), "should include operation");
    assert!(
        msg.contains("/tmp/docker_pre_checkpoint.log"),
        "should point at the log file"
    );
}

#[test]
fn test_corrupt_chain_display() {
    let err = Error::CorruptChain {
        start: "abc111".to_string(),
        limit: 128,
    };
    let msg = format!("{}", err);

    assert!(msg.contains("abc111"));
    assert!(msg.contains("128"));
}

#[test]
fn test_remote_error_display() {
    let err = Error::Remote {
        code: "bad_sequence".to_string(),
        message: "no iteration open".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "remote peer error (bad_sequence): no iteration open"
    );
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "final dump".to_string(),
        duration: Duration::from_secs(600),
    };
    let msg = format!("{}", err);

    assert!(msg.contains("timed out"));
    assert!(msg.contains("final dump"));
}

// =============================================================================
// Conversion Tests
// =============================================================================

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
    assert!(err.to_string().contains("gone"));
}

#[test]
fn test_serde_error_conversion() {
    let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: Error = serde_err.into();
    assert!(matches!(err, Error::Serialization(_)));
}

// =============================================================================
// Classification Tests
// =============================================================================

#[test]
fn test_only_validation_is_validation_kind() {
    let faults = [
        Error::ContainerNotFound("abc".into()),
        Error::NoFsDriver("rsync".into()),
        Error::Protocol("eof".into()),
        Error::Remote {
            code: "restore_failed".into(),
            message: "x".into(),
        },
        Error::ToolUnavailable {
            tool: "criu".into(),
            reason: "not found".into(),
        },
        Error::Internal("x".into()),
    ];
    for err in faults {
        assert_eq!(err.kind(), ErrorKind::Fault, "{err}");
    }
    assert_eq!(
        Error::Validation("CPUs mismatch".into()).kind(),
        ErrorKind::Validation
    );
}

#[test]
fn test_metadata_errors_are_setup_errors() {
    assert!(
        Error::MetadataMissing {
            path: PathBuf::from("/var/lib/docker/aufs/layers/x"),
            reason: "not found".into(),
        }
        .is_setup()
    );
    assert!(
        Error::MetadataInvalid {
            path: PathBuf::from("/var/lib/docker/containers/x/config.v2.json"),
            reason: "expected value".into(),
        }
        .is_setup()
    );
    assert!(!Error::Protocol("eof".into()).is_setup());
    assert!(
        !Error::Remote {
            code: "restore_failed".into(),
            message: "x".into(),
        }
        .is_setup()
    );
}
