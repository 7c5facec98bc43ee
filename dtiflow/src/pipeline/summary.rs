//! Run-level aggregation: tallies, per-stage counts, failures and plans.

use super::SubjectReport;
use crate::core::{ErrorContract, StageId, StageStatus};
use crate::errors::Result;
use crate::storage::StorageReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the summary written under the work root.
pub const SUMMARY_FILE_NAME: &str = "run_summary.json";

/// Exit status when every subject succeeded.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status when any subject failed.
pub const EXIT_FAILURE: i32 = 1;
/// Exit status on startup validation errors.
pub const EXIT_INVALID: i32 = 2;
/// Exit status after an operator interrupt.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Per-stage status counts across subjects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    /// Ran and verified.
    pub completed: usize,
    /// Passed via checkpoint.
    pub resumed: usize,
    /// Not run.
    pub skipped: usize,
    /// Failed.
    pub failed: usize,
}

impl StageCounts {
    fn add(&mut self, status: StageStatus) {
        match status {
            StageStatus::Completed => self.completed += 1,
            StageStatus::Resumed => self.resumed += 1,
            StageStatus::Skipped => self.skipped += 1,
            StageStatus::Failed => self.failed += 1,
        }
    }
}

/// A failure worth pointing the operator at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Subject ID.
    pub subject: String,
    /// Failing stage; `None` for pre-flight, disk or lock rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    /// The stage's contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<ErrorContract>,
    /// Error message.
    pub error: String,
    /// Captured-output snippet, or the rejection log for pre-stage failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_log: Option<PathBuf>,
}

/// What a dry run would do for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "reason")]
pub enum PlannedAction {
    /// The stage would execute.
    Run,
    /// A checkpoint exists; the stage would be resumed past.
    Resume,
    /// The stage would be skipped.
    Skip(String),
}

/// Dry-run plan for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectPlan {
    /// Subject ID.
    pub subject: String,
    /// Why the subject would be rejected before any stage, if it would.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Planned action per stage.
    pub stages: Vec<(StageId, PlannedAction)>,
}

/// Aggregate result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Whether the run was interrupted.
    pub cancelled: bool,
    /// Subjects that reached `Done`.
    pub success_count: usize,
    /// Subjects that did not.
    pub failure_count: usize,
    /// Per-subject reports, in processing order.
    pub subjects: Vec<SubjectReport>,
    /// Per-stage status counts.
    pub stage_counts: BTreeMap<StageId, StageCounts>,
    /// Fatal, advisory and pre-stage failures.
    pub failures: Vec<FailureRecord>,
    /// Tier utilization at the end of the run.
    pub storage: StorageReport,
    /// Dry-run plans.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<SubjectPlan>,
}

impl RunSummary {
    /// An empty summary starting now.
    #[must_use]
    pub fn start(dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            dry_run,
            cancelled: false,
            success_count: 0,
            failure_count: 0,
            subjects: Vec::new(),
            stage_counts: BTreeMap::new(),
            failures: Vec::new(),
            storage: StorageReport::default(),
            plan: Vec::new(),
        }
    }

    /// Tallies one subject.
    pub fn add_subject(&mut self, report: SubjectReport) {
        if report.is_success() {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        if report.cancelled {
            self.cancelled = true;
        }

        if let Some(error) = &report.error {
            self.failures.push(FailureRecord {
                subject: report.subject.clone(),
                stage: None,
                contract: None,
                error: error.clone(),
                failure_log: report.failure_log.clone(),
            });
        }
        for outcome in &report.outcomes {
            self.stage_counts.entry(outcome.stage).or_default().add(outcome.status);
            if outcome.status == StageStatus::Failed {
                self.failures.push(FailureRecord {
                    subject: report.subject.clone(),
                    stage: Some(outcome.stage),
                    contract: Some(outcome.stage.contract()),
                    error: outcome.error.clone().unwrap_or_default(),
                    failure_log: outcome.failure_log.clone(),
                });
            }
        }
        self.subjects.push(report);
    }

    /// Adds a dry-run plan; subjects with a pre-flight error count as failures.
    pub fn add_plan(&mut self, plan: SubjectPlan) {
        if plan.error.is_some() {
            self.failure_count += 1;
        } else {
            self.success_count += 1;
        }
        self.plan.push(plan);
    }

    /// Stamps the end time.
    pub fn finish(&mut self, storage: StorageReport) {
        self.storage = storage;
        self.finished_at = Utc::now();
    }

    /// Process exit status for this run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_INTERRUPTED
        } else if self.failure_count == 0 {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }

    /// Writes the summary as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reads a summary back.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Report for one subject.
    #[must_use]
    pub fn subject(&self, id: &str) -> Option<&SubjectReport> {
        self.subjects.iter().find(|s| s.subject == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StageOutcome, SubjectState};
    use pretty_assertions::assert_eq;

    fn report(state: SubjectState, outcomes: Vec<StageOutcome>) -> SubjectReport {
        SubjectReport {
            subject: "sub-001".into(),
            state,
            outcomes,
            error: None,
            failure_log: None,
            cancelled: false,
        }
    }

    #[test]
    fn test_tallies_and_failures() {
        let mut summary = RunSummary::start(false);
        summary.add_subject(report(
            SubjectState::Done,
            vec![
                StageOutcome::completed(StageId::BasicPreprocessing, 2.0),
                StageOutcome::failed(StageId::Refinement, "flirt crashed")
                    .with_failure_log(PathBuf::from("/w/sub-001/logs/refinement_failure.log")),
            ],
        ));
        summary.add_subject(
            SubjectReport::rejected("sub-002", "missing bval")
                .with_failure_log(PathBuf::from("/w/sub-002/logs/preflight_failure.log")),
        );

        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.exit_code(), EXIT_FAILURE);
        assert_eq!(summary.stage_counts[&StageId::Refinement].failed, 1);
        assert_eq!(summary.failures.len(), 2);
        assert_eq!(summary.failures[0].contract, Some(ErrorContract::Advisory));
        assert_eq!(summary.failures[1].stage, None);
        assert_eq!(
            summary.failures[1].failure_log,
            Some(PathBuf::from("/w/sub-002/logs/preflight_failure.log"))
        );
    }

    #[test]
    fn test_exit_codes() {
        let mut summary = RunSummary::start(false);
        assert_eq!(summary.exit_code(), EXIT_SUCCESS);
        let mut interrupted = report(SubjectState::Running(StageId::MotionCorrection), vec![]);
        interrupted.cancelled = true;
        summary.add_subject(interrupted);
        assert_eq!(summary.exit_code(), EXIT_INTERRUPTED);
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SUMMARY_FILE_NAME);
        let mut summary = RunSummary::start(true);
        summary.add_plan(SubjectPlan {
            subject: "sub-001".into(),
            error: None,
            stages: vec![
                (StageId::DistortionCorrection, PlannedAction::Skip("no T1 image".into())),
                (StageId::BasicPreprocessing, PlannedAction::Resume),
            ],
        });
        summary.finish(StorageReport::default());
        summary.write(&path).unwrap();

        let loaded = RunSummary::load(&path).unwrap();
        assert_eq!(loaded.run_id, summary.run_id);
        assert_eq!(loaded.plan, summary.plan);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"action\": \"skip\""));
    }
}
