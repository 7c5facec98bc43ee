//! Error contract and per-subject state enums.

use super::StageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a stage failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContract {
    /// Failure halts the remaining stages for the subject.
    Fatal,
    /// Failure is logged at WARN and the subject continues.
    Advisory,
}

impl ErrorContract {
    /// Returns true for the fatal contract.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal)
    }
}

impl fmt::Display for ErrorContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Advisory => write!(f, "advisory"),
        }
    }
}

/// Where a subject currently is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "stage")]
pub enum SubjectState {
    /// No stage has been entered yet.
    NotStarted,
    /// The given stage is executing (or being resumed past).
    Running(StageId),
    /// All stages have been visited and no fatal stage failed.
    Done,
    /// A fatal stage failed; remaining stages were not run.
    Failed(StageId),
}

impl Default for SubjectState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl SubjectState {
    /// Returns true if the state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// Returns true if the subject finished successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for SubjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running(stage) => write!(f, "running:{stage}"),
            Self::Done => write!(f, "done"),
            Self::Failed(stage) => write!(f, "failed:{stage}"),
        }
    }
}
