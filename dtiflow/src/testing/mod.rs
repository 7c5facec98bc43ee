//! Test support for pipeline code.
//!
//! - A recording [`ToolRunner`](crate::process::ToolRunner) that simulates
//!   external tools, including rsync-style transfers
//! - Raw subject fixtures and temporary tier roots
//! - Assertions over stage outcomes

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_files_exist, assert_stage_not_reached, assert_stage_status, assert_tool_not_called,
    outcome_for,
};
pub use fixtures::{
    gradient_table, write_gradients, write_raw_subject, TestWorkspace, FIXTURE_BVALUE, FIXTURE_SHAPE,
    FIXTURE_VOLUMES,
};
pub use mocks::{MockBehavior, MockFn, RecordingToolRunner};
