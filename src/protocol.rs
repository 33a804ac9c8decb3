//! Control channel wire protocol.
//!
//! # Protocol Format
//!
//! - **Transport**: TCP
//! - **Encoding**: JSON
//! - **Framing**: newline-delimited, one request and one response per
//!   connection
//!
//! ```text
//! Source (migrate)                      Destination (serve)
//!   |                                      |
//!   |  {"action":"start_iteration",...}\n  |
//!   |------------------------------------->|
//!   |  {"status":"ok"}\n                   |
//!   |<-------------------------------------|
//! ```
//!
//! | Action               | Description                                |
//! |----------------------|--------------------------------------------|
//! | `setup`              | Open a session for a container             |
//! | `start_iteration`    | Begin a dump/sync cycle                    |
//! | `end_iteration`      | End a dump/sync cycle                      |
//! | `put_cpu_info`       | Upload the source CPU descriptor (hex)     |
//! | `check_cpu_info`     | Compare the descriptor with the local CPU  |
//! | `check_tool_version` | Compare checkpoint tool versions           |
//! | `memory_tracking`    | Announce incremental dumps                 |
//! | `restore`            | Restore the container from images          |
//! | `ping`               | Liveness check                             |

use crate::config::MigrationMode;
use crate::peer::CheckpointRef;
use serde::{Deserialize, Serialize};

// =============================================================================
// Request Types
// =============================================================================

/// Request from the source host to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Setup {
        container_id: String,
        mode: MigrationMode,
    },

    StartIteration {
        is_final: bool,
    },

    EndIteration,

    /// CPU descriptor image, hex encoded.
    PutCpuInfo {
        data: String,
    },

    CheckCpuInfo,

    CheckToolVersion {
        version: String,
    },

    MemoryTracking {
        enabled: bool,
    },

    Restore {
        container_id: String,
        checkpoint: CheckpointRef,
    },

    Ping,
}

impl Request {
    /// Short name for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "setup",
            Self::StartIteration { .. } => "start_iteration",
            Self::EndIteration => "end_iteration",
            Self::PutCpuInfo { .. } => "put_cpu_info",
            Self::CheckCpuInfo => "check_cpu_info",
            Self::CheckToolVersion { .. } => "check_tool_version",
            Self::MemoryTracking { .. } => "memory_tracking",
            Self::Restore { .. } => "restore",
            Self::Ping => "ping",
        }
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// Response from the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok(OkPayload),
    Error(ErrorPayload),
}

impl Response {
    #[must_use]
    pub fn ok() -> Self {
        Self::Ok(OkPayload { data: None })
    }

    #[must_use]
    pub fn ok_with_data(data: ResponseData) -> Self {
        Self::Ok(OkPayload { data: Some(data) })
    }

    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Success payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// Response data variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Compatibility verdict; absent when the check could not decide.
    Check { matched: Option<bool> },

    Pong {
        version: String,
        /// Iterations started in the current session.
        iteration: u32,
    },
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request arrived outside the expected session order.
    NoSession,
    /// Iteration brackets do not match.
    BadSequence,
    /// CPU descriptor was not uploaded or could not be checked.
    CpuInfo,
    /// Restore failed.
    RestoreFailed,
    /// Malformed request.
    InvalidRequest,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoSession => "no_session",
            Self::BadSequence => "bad_sequence",
            Self::CpuInfo => "cpu_info",
            Self::RestoreFailed => "restore_failed",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Wire Format Helpers
// =============================================================================

impl Request {
    /// Serializes the request to a JSON line.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json.trim())
    }
}

impl Response {
    /// Serializes the response to a JSON line.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json.trim())
    }
}
