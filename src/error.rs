//! Error types for the migration layer.

use std::path::PathBuf;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification used by callers to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Negative compatibility outcome. Retrying with different flags
    /// (e.g. `--force`, `--skip-cpu-check`) may succeed.
    Validation,
    /// Environment or tooling problem. Retrying unchanged will likely fail.
    Fault,
}

/// Errors that can occur while migrating a container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Setup Errors
    // =========================================================================
    /// Container id prefix is unusable.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// No known container matches the prefix.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// More than one container matches the prefix (strict mode only).
    #[error("container ID prefix '{prefix}' is ambiguous: {candidates:?}")]
    AmbiguousContainerId {
        prefix: String,
        candidates: Vec<String>,
    },

    /// No filesystem sync driver could be bound to the container.
    #[error("no filesystem sync driver available: {0}")]
    NoFsDriver(String),

    /// Session setup failed.
    #[error("migration setup failed: {0}")]
    Setup(String),

    // =========================================================================
    // Metadata Errors
    // =========================================================================
    /// Required metadata file is absent or unreadable.
    #[error("metadata missing at {path}: {reason}")]
    MetadataMissing { path: PathBuf, reason: String },

    /// Metadata file exists but cannot be interpreted.
    #[error("invalid metadata at {path}: {reason}")]
    MetadataInvalid { path: PathBuf, reason: String },

    /// Parent chain did not terminate within the depth limit.
    #[error("layer chain starting at '{start}' exceeds {limit} links (cyclic or corrupt store)")]
    CorruptChain { start: String, limit: usize },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Source and destination are not compatible.
    #[error("validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // External Tool Errors
    // =========================================================================
    /// External tool exited with a non-zero status.
    #[error("{operation} failed with {status}, see {log}")]
    ExternalTool {
        operation: String,
        status: String,
        log: PathBuf,
    },

    /// External tool could not be spawned.
    #[error("tool '{tool}' unavailable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed or unexpected RPC exchange.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Remote peer answered with an error.
    #[error("remote peer error ({code}): {message}")]
    Remote { code: String, message: String },

    // =========================================================================
    // I/O and Configuration Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classifies the error for retry decisions.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::Fault,
        }
    }

    /// Returns true if the error happened before anything external changed.
    ///
    /// Setup, metadata and validation failures abort the session before the
    /// first dump.
    #[must_use]
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::InvalidContainerId { .. }
                | Self::ContainerNotFound(_)
                | Self::AmbiguousContainerId { .. }
                | Self::NoFsDriver(_)
                | Self::Setup(_)
                | Self::MetadataMissing { .. }
                | Self::MetadataInvalid { .. }
                | Self::CorruptChain { .. }
        )
    }

    pub(crate) fn metadata_missing(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::MetadataMissing {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn metadata_invalid(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::MetadataInvalid {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}
