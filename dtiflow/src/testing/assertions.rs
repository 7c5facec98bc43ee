//! Assertions over stage outcomes, recorded tool calls and tier contents.

use std::path::Path;

use super::RecordingToolRunner;
use crate::config::Tool;
use crate::core::{StageId, StageOutcome, StageStatus};

/// Finds the outcome of `stage`, panicking when it is absent.
pub fn outcome_for(outcomes: &[StageOutcome], stage: StageId) -> &StageOutcome {
    outcomes
        .iter()
        .find(|o| o.stage == stage)
        .unwrap_or_else(|| panic!("No outcome recorded for stage {stage}"))
}

/// Asserts that `stage` ended with `expected`.
pub fn assert_stage_status(outcomes: &[StageOutcome], stage: StageId, expected: StageStatus) {
    let outcome = outcome_for(outcomes, stage);
    assert_eq!(
        outcome.status, expected,
        "Expected {stage} to be {expected}, got {} (error: {:?}, skip: {:?})",
        outcome.status, outcome.error, outcome.skip_reason
    );
}

/// Asserts that `stage` never produced an outcome (the subject halted first).
pub fn assert_stage_not_reached(outcomes: &[StageOutcome], stage: StageId) {
    assert!(
        outcomes.iter().all(|o| o.stage != stage),
        "Expected {stage} not to be reached"
    );
}

/// Asserts that `tool` was never invoked.
pub fn assert_tool_not_called(runner: &RecordingToolRunner, tool: Tool) {
    let count = runner.count_for(tool);
    assert_eq!(count, 0, "Expected {} not to run, ran {count} times", tool.name());
}

/// Asserts that every path exists.
pub fn assert_files_exist<P: AsRef<Path>>(paths: &[P]) {
    let missing: Vec<_> = paths
        .iter()
        .map(AsRef::as_ref)
        .filter(|p| !p.exists())
        .collect();
    assert!(missing.is_empty(), "Missing files: {missing:?}");
}
