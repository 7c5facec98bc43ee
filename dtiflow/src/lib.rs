//! # dtiflow
//!
//! Crash-safe orchestration of a multi-stage diffusion MRI pipeline across
//! many subjects.
//!
//! dtiflow coordinates external scientific tools rather than reimplementing
//! them. What it owns is the engine around them:
//!
//! - **Per-subject state machine**: six stages with declared fatal/advisory contracts
//! - **Checkpoints**: append-only completion markers, so reruns resume safely
//! - **Resource gates**: disk, memory and permission checks before every stage
//! - **Subject locks**: one pipeline instance per subject, released on exit
//! - **Tier migration**: verified, retried transfers to durable storage
//! - **Registration selection**: quality-gated fallback across ML and classical methods
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dtiflow::prelude::*;
//!
//! let config = Arc::new(RunConfig::new(paths).with_tools(ToolLocations::resolve(&overrides)?));
//! let cancel = Arc::new(CancellationToken::new());
//! let runner = Arc::new(SubprocessRunner::new(config.tools.clone(), config.threads, cancel.clone()));
//! let driver = PipelineDriver::new(config, runner, Arc::new(NoOpEventSink), cancel);
//!
//! let summary = driver.run(&["sub-001".to_string()]).await;
//! std::process::exit(summary.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod cancellation;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod locking;
pub mod observability;
pub mod pipeline;
pub mod process;
pub mod registration;
pub mod resources;
pub mod retry;
pub mod stages;
pub mod storage;
pub mod subject;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, CleanupRegistry};
    pub use crate::checkpoint::CheckpointStore;
    pub use crate::config::{
        PathsConfig, PhaseEncoding, RegistrationConfig, RunConfig, StageToggles, Tool,
        ToolLocations,
    };
    pub use crate::core::{ErrorContract, StageId, StageOutcome, StageStatus, SubjectState};
    pub use crate::errors::{DtiflowError, Result};
    pub use crate::events::{EventSink, JsonlEventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{PipelineDriver, RunSummary, StageRunner};
    pub use crate::process::{SubprocessRunner, ToolInvocation, ToolRunner};
    pub use crate::registration::{QualityClass, RegistrationMethod, RequestedMethod};
    pub use crate::resources::ResourceGuard;
    pub use crate::stages::{Stage, StageContext};
    pub use crate::subject::Subject;
    pub use std::sync::Arc;
}
