//! Core domain model types for dtiflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - The fixed stage set and each stage's error contract
//! - Stage outcomes with factory methods
//! - Per-subject state

mod outcome;
mod stage;
mod status;

pub use outcome::{StageOutcome, StageStatus};
pub use stage::StageId;
pub use status::{ErrorContract, SubjectState};
