//! Per-subject stage state machine.

use super::StageRunner;
use crate::cancellation::CancellationToken;
use crate::core::{StageId, StageOutcome, StageStatus, SubjectState};
use crate::observability::subject_span;
use crate::stages::{Stage, StageContext};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// What happened to one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectReport {
    /// Subject ID.
    pub subject: String,
    /// Terminal (or last reached) state.
    pub state: SubjectState,
    /// One outcome per stage visited, in order.
    pub outcomes: Vec<StageOutcome>,
    /// Why the subject never entered the state machine, if it didn't.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Log explaining a rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_log: Option<PathBuf>,
    /// The run was interrupted while this subject was in progress.
    #[serde(default)]
    pub cancelled: bool,
}

impl SubjectReport {
    /// A subject rejected before any stage ran.
    #[must_use]
    pub fn rejected(subject: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            state: SubjectState::NotStarted,
            outcomes: Vec::new(),
            error: Some(error.into()),
            failure_log: None,
            cancelled: false,
        }
    }

    /// Attaches the rejection log.
    #[must_use]
    pub fn with_failure_log(mut self, path: PathBuf) -> Self {
        self.failure_log = Some(path);
        self
    }

    /// Returns true if every fatal stage succeeded and the run was not interrupted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state.is_success() && !self.cancelled
    }

    /// Outcome of a stage, if it was visited.
    #[must_use]
    pub fn outcome(&self, stage: StageId) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage == stage)
    }
}

/// Transition logic: fatal failure is terminal, anything else advances.
#[derive(Debug, Clone)]
pub struct SubjectStateMachine {
    subject: String,
    state: SubjectState,
    outcomes: Vec<StageOutcome>,
}

impl SubjectStateMachine {
    /// A machine in `NotStarted`.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            state: SubjectState::NotStarted,
            outcomes: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubjectState {
        self.state
    }

    /// Marks `stage` as running.
    pub fn enter(&mut self, stage: StageId) {
        self.state = SubjectState::Running(stage);
    }

    /// Applies a stage outcome.
    pub fn record(&mut self, outcome: StageOutcome) {
        let stage = outcome.stage;
        if outcome.status == StageStatus::Failed && stage.contract().is_fatal() {
            self.state = SubjectState::Failed(stage);
        } else if stage.index() + 1 == StageId::ALL.len() {
            self.state = SubjectState::Done;
        }
        self.outcomes.push(outcome);
    }

    /// Finishes the machine into a report.
    #[must_use]
    pub fn into_report(self, cancelled: bool) -> SubjectReport {
        SubjectReport {
            subject: self.subject,
            state: self.state,
            outcomes: self.outcomes,
            error: None,
            failure_log: None,
            cancelled,
        }
    }
}

/// Drives one subject through `stages` until done, a fatal failure, or cancellation.
pub async fn run_subject(
    runner: &StageRunner,
    stages: &[Arc<dyn Stage>],
    ctx: &StageContext,
    cancel: &CancellationToken,
) -> SubjectReport {
    let subject = ctx.id().to_string();
    async {
        let mut machine = SubjectStateMachine::new(&subject);
        let mut cancelled = false;

        for stage in stages {
            if cancel.is_cancelled() {
                warn!(subject = %subject, state = %machine.state(), "Interrupted between stages");
                cancelled = true;
                break;
            }
            machine.enter(stage.id());
            let outcome = runner.run_stage(stage.as_ref(), ctx).await;
            let interrupted = outcome.status == StageStatus::Failed && cancel.is_cancelled();
            machine.record(outcome);
            if interrupted {
                cancelled = true;
                break;
            }
            if machine.state().is_terminal() {
                break;
            }
        }

        info!(subject = %subject, state = %machine.state(), "Subject finished");
        machine.into_report(cancelled)
    }
    .instrument(subject_span(ctx.id()))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorContract;
    use pretty_assertions::assert_eq;

    fn walk(statuses: &[(StageId, StageStatus)]) -> SubjectStateMachine {
        let mut m = SubjectStateMachine::new("sub-001");
        for (stage, status) in statuses {
            m.enter(*stage);
            let outcome = match status {
                StageStatus::Completed => StageOutcome::completed(*stage, 1.0),
                StageStatus::Resumed => StageOutcome::resumed(*stage),
                StageStatus::Skipped => StageOutcome::skipped(*stage, "disabled"),
                StageStatus::Failed => StageOutcome::failed(*stage, "boom"),
            };
            m.record(outcome);
            if m.state().is_terminal() {
                break;
            }
        }
        m
    }

    #[test]
    fn test_all_stages_reach_done() {
        let m = walk(&StageId::ALL.map(|s| (s, StageStatus::Completed)));
        assert_eq!(m.state(), SubjectState::Done);
    }

    #[test]
    fn test_advisory_failures_continue() {
        let statuses: Vec<_> = StageId::ALL
            .into_iter()
            .map(|s| match s.contract() {
                ErrorContract::Advisory => (s, StageStatus::Failed),
                ErrorContract::Fatal => (s, StageStatus::Completed),
            })
            .collect();
        let m = walk(&statuses);
        assert_eq!(m.state(), SubjectState::Done);
        assert_eq!(m.into_report(false).outcomes.len(), StageId::ALL.len());
    }

    #[test]
    fn test_fatal_failure_is_terminal() {
        let m = walk(&[
            (StageId::DistortionCorrection, StageStatus::Skipped),
            (StageId::BasicPreprocessing, StageStatus::Completed),
            (StageId::MotionCorrection, StageStatus::Failed),
            (StageId::Refinement, StageStatus::Completed),
        ]);
        assert_eq!(m.state(), SubjectState::Failed(StageId::MotionCorrection));
        let report = m.into_report(false);
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcome(StageId::Refinement).is_none());
        assert!(!report.is_success());
    }

    #[test]
    fn test_cancelled_report_is_not_success() {
        let m = walk(&StageId::ALL.map(|s| (s, StageStatus::Resumed)));
        assert!(!m.into_report(true).is_success());
    }

    #[test]
    fn test_rejected_report() {
        let report = SubjectReport::rejected("sub-002", "locked");
        assert_eq!(report.state, SubjectState::NotStarted);
        assert!(!report.is_success());
    }
}
