//! Stage outcome type with factory methods.

use super::StageId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Terminal status of a single stage for a single subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The work ran and its outputs were verified.
    Completed,
    /// A checkpoint already proved completion; the work was not re-run.
    Resumed,
    /// The stage was not run (disabled, missing optional input, resource gate).
    Skipped,
    /// The work ran and failed, or a fatal gate rejected it.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Resumed => write!(f, "resumed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The outcome of running (or not running) a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    /// The stage.
    pub stage: StageId,
    /// Terminal status.
    pub status: StageStatus,
    /// Wall-clock duration in seconds, when the work ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    /// Why the stage was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Error message for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured-output snippet written for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_log: Option<PathBuf>,
    /// Stage-specific details (applied registration method, metric files).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StageOutcome {
    fn base(stage: StageId, status: StageStatus) -> Self {
        Self {
            stage,
            status,
            duration_s: None,
            skip_reason: None,
            error: None,
            failure_log: None,
            metadata: HashMap::new(),
        }
    }

    /// Creates a completed outcome.
    #[must_use]
    pub fn completed(stage: StageId, duration_s: f64) -> Self {
        Self {
            duration_s: Some(duration_s),
            ..Self::base(stage, StageStatus::Completed)
        }
    }

    /// Creates a resumed outcome.
    #[must_use]
    pub fn resumed(stage: StageId) -> Self {
        Self::base(stage, StageStatus::Resumed)
    }

    /// Creates a skipped outcome with a reason.
    #[must_use]
    pub fn skipped(stage: StageId, reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::base(stage, StageStatus::Skipped)
        }
    }

    /// Creates a failed outcome.
    #[must_use]
    pub fn failed(stage: StageId, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(stage, StageStatus::Failed)
        }
    }

    /// Attaches the failure log path.
    #[must_use]
    pub fn with_failure_log(mut self, path: PathBuf) -> Self {
        self.failure_log = Some(path);
        self
    }

    /// Attaches the elapsed time.
    #[must_use]
    pub fn with_duration(mut self, duration_s: f64) -> Self {
        self.duration_s = Some(duration_s);
        self
    }

    /// Adds a single metadata entry.
    #[must_use]
    pub fn add_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns true if the stage is known complete (ran or resumed).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self.status, StageStatus::Completed | StageStatus::Resumed)
    }

    /// Returns true if the stage failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.status, StageStatus::Failed)
    }

    /// Returns true if the stage was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self.status, StageStatus::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_outcome() {
        let outcome = StageOutcome::completed(StageId::MotionCorrection, 12.5);
        assert!(outcome.is_complete());
        assert!(!outcome.is_failure());
        assert_eq!(outcome.duration_s, Some(12.5));
    }

    #[test]
    fn test_resumed_counts_as_complete() {
        assert!(StageOutcome::resumed(StageId::BasicPreprocessing).is_complete());
    }

    #[test]
    fn test_skipped_outcome() {
        let outcome = StageOutcome::skipped(StageId::Connectivity, "disabled by --skip-connectivity");
        assert!(outcome.is_skipped());
        assert!(!outcome.is_complete());
        assert_eq!(
            outcome.skip_reason.as_deref(),
            Some("disabled by --skip-connectivity")
        );
    }

    #[test]
    fn test_failed_outcome_with_log() {
        let outcome = StageOutcome::failed(StageId::BasicPreprocessing, "denoise failed")
            .with_failure_log(PathBuf::from("/tmp/x.log"));
        assert!(outcome.is_failure());
        assert_eq!(outcome.failure_log, Some(PathBuf::from("/tmp/x.log")));
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let outcome = StageOutcome::resumed(StageId::Refinement);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "resumed");
        assert!(json.get("error").is_none());
        assert!(json.get("metadata").is_none());
    }
}
