//! Operator interrupt handling.
//!
//! This module provides:
//! - CancellationToken shared by the driver, stage runner and tool runner
//! - CleanupRegistry for LIFO cleanup when the run is interrupted

mod cleanup;
mod token;

pub use cleanup::{kill_by_pattern, CleanupRegistry};
pub use token::CancellationToken;
