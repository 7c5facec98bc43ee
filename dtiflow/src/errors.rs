//! Error types for the dtiflow orchestrator.
//!
//! The taxonomy mirrors how failures are handled at runtime: precondition
//! and configuration errors fail fast, tool and transfer errors surface as
//! stage failures, and cancellation unwinds the whole run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DtiflowError>;

/// The main error type for dtiflow operations.
#[derive(Debug, Error)]
pub enum DtiflowError {
    /// Invalid run configuration (bad CLI value, unreadable tool map).
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A required input is missing or malformed.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Disk, memory or permission gate failed.
    #[error("{0}")]
    Resource(#[from] ResourceError),

    /// The subject is locked by another process.
    #[error("Subject '{subject}' is locked by another pipeline instance")]
    Locked {
        /// The contended subject.
        subject: String,
    },

    /// An external tool failed.
    #[error("{0}")]
    Tool(#[from] ToolError),

    /// A storage transfer failed verification or exhausted retries.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// A registration attempt failed.
    #[error("Registration failed: {0}")]
    Registration(String),

    /// A volume could not be decoded.
    #[error("Volume error in {path}: {message}")]
    Volume {
        /// The volume file.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A completion marker could not be written.
    #[error("Checkpoint for '{subject}' not recorded: {source}")]
    Checkpoint {
        /// The subject whose log failed.
        subject: String,
        /// Underlying write failure.
        source: std::io::Error,
    },

    /// The run was cancelled by the operator.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DtiflowError {
    /// Creates a precondition error.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Creates a volume decoding error.
    #[must_use]
    pub fn volume(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Volume {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error came from operator cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns captured tool output when the error carries any.
    #[must_use]
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::Tool(ToolError::Failed { output, .. } | ToolError::TimedOut { output, .. }) => {
                Some(output.as_str())
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DtiflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Startup-time validation errors.
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration for '{field}': {message}")]
pub struct ConfigError {
    /// The offending setting.
    pub field: String,
    /// Why it was rejected.
    pub message: String,
}

impl ConfigError {
    /// Creates a new config error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The resource that failed a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Free disk space.
    Disk,
    /// Available memory.
    Memory,
    /// Directory write permission.
    WritePermission,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disk => write!(f, "disk"),
            Self::Memory => write!(f, "memory"),
            Self::WritePermission => write!(f, "write_permission"),
        }
    }
}

/// A resource gate rejected a stage.
#[derive(Debug, Clone, Error)]
#[error("Insufficient {kind} for {context}: {detail}")]
pub struct ResourceError {
    /// Which resource.
    pub kind: ResourceKind,
    /// The stage or operation that was gated.
    pub context: String,
    /// Measured vs required.
    pub detail: String,
}

impl ResourceError {
    /// Creates a new resource error.
    #[must_use]
    pub fn new(kind: ResourceKind, context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            detail: detail.into(),
        }
    }
}

/// Errors related to external tool execution.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// No executable is configured or discoverable for the logical tool.
    #[error("Tool not found: {name}")]
    NotFound {
        /// Logical tool name.
        name: String,
    },

    /// The tool exited unsuccessfully.
    #[error("Tool {name} failed with exit code {code:?}")]
    Failed {
        /// Logical tool name.
        name: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Combined captured output.
        output: String,
    },

    /// The tool exceeded its timeout and was killed.
    #[error("Tool {name} timed out after {timeout_secs}s")]
    TimedOut {
        /// Logical tool name.
        name: String,
        /// The enforced timeout in seconds.
        timeout_secs: f64,
        /// Output captured before the kill.
        output: String,
    },

    /// The tool reported success but a declared output is missing.
    #[error("Tool {name} did not produce expected output {path}")]
    MissingOutput {
        /// Logical tool name.
        name: String,
        /// The missing file.
        path: PathBuf,
    },
}

impl ToolError {
    /// Creates a tool not found error.
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates a tool failure error.
    #[must_use]
    pub fn failed(name: impl Into<String>, code: Option<i32>, output: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            code,
            output: output.into(),
        }
    }

    /// Creates a missing output error.
    #[must_use]
    pub fn missing_output(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingOutput {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Converts to a dictionary representation for the event log.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();

        match self {
            Self::NotFound { name } => {
                map.insert("type".to_string(), serde_json::json!("ToolNotFound"));
                map.insert("name".to_string(), serde_json::json!(name));
            }
            Self::Failed { name, code, .. } => {
                map.insert("type".to_string(), serde_json::json!("ToolFailed"));
                map.insert("name".to_string(), serde_json::json!(name));
                map.insert("code".to_string(), serde_json::json!(code));
            }
            Self::TimedOut { name, timeout_secs, .. } => {
                map.insert("type".to_string(), serde_json::json!("ToolTimedOut"));
                map.insert("name".to_string(), serde_json::json!(name));
                map.insert("timeout_secs".to_string(), serde_json::json!(timeout_secs));
            }
            Self::MissingOutput { name, path } => {
                map.insert("type".to_string(), serde_json::json!("ToolMissingOutput"));
                map.insert("name".to_string(), serde_json::json!(name));
                map.insert("path".to_string(), serde_json::json!(path.display().to_string()));
            }
        }

        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("pe_direction", "expected one of AP, PA, LR, RL");
        assert!(err.to_string().contains("pe_direction"));
        assert!(err.to_string().contains("AP, PA"));
    }

    #[test]
    fn test_resource_error_display() {
        let err = ResourceError::new(ResourceKind::Disk, "motion_correction", "12.0 GB < 30.0 GB");
        assert_eq!(
            err.to_string(),
            "Insufficient disk for motion_correction: 12.0 GB < 30.0 GB"
        );
    }

    #[test]
    fn test_tool_error_to_dict() {
        let err = ToolError::not_found("eddy");
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "ToolNotFound");
        assert_eq!(dict.get("name").unwrap(), "eddy");
    }

    #[test]
    fn test_captured_output_only_for_tool_failures() {
        let err = DtiflowError::from(ToolError::failed("denoise", Some(1), "bad header"));
        assert_eq!(err.captured_output(), Some("bad header"));

        let err = DtiflowError::precondition("missing bval");
        assert!(err.captured_output().is_none());
    }

    #[test]
    fn test_cancelled_flag() {
        assert!(DtiflowError::Cancelled("SIGINT".into()).is_cancelled());
        assert!(!DtiflowError::Transfer("x".into()).is_cancelled());
    }
}
