//! Pipeline execution.
//!
//! This module provides:
//! - The stage runner (resume, skip, resource gate, timing, failure logs, checkpoints)
//! - The per-subject state machine with fatal/advisory propagation
//! - The sequential multi-subject driver and its run summary

mod driver;
mod runner;
mod subject;
mod summary;

pub use driver::PipelineDriver;
pub use runner::{
    missing_outputs, write_failure_log, write_rejection_log, StageRunner, FAILURE_LOG_LINES,
};
pub use subject::{run_subject, SubjectReport, SubjectStateMachine};
pub use summary::{
    FailureRecord, PlannedAction, RunSummary, StageCounts, SubjectPlan, EXIT_FAILURE,
    EXIT_INTERRUPTED, EXIT_INVALID, EXIT_SUCCESS, SUMMARY_FILE_NAME,
};
