//! Stage trait and the six pipeline stages.
//!
//! A stage is a unit of work for one subject. It declares whether it should
//! be skipped, which files prove it completed, and how to produce them. The
//! runner wraps every stage with the same gating, timing, failure-log and
//! checkpoint handling, so implementations only describe their tool calls.

pub mod acquisition;
mod artifacts;
mod connectivity;
mod context;
mod distortion;
mod microstructure;
mod motion;
mod preprocessing;
mod refinement;

pub use artifacts::Artifacts;
pub use connectivity::{Connectivity, STREAMLINE_COUNT};
pub use context::StageContext;
pub use distortion::DistortionCorrection;
pub use microstructure::Microstructure;
pub use motion::MotionCorrection;
pub use preprocessing::BasicPreprocessing;
pub use refinement::Refinement;

use crate::core::StageId;
use crate::errors::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

/// Facts a stage reports about a completed execution.
pub type StageMetadata = HashMap<String, serde_json::Value>;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Which stage this is. Its contract and checkpoint token follow from it.
    fn id(&self) -> StageId;

    /// Returns a reason when the stage should not run for this subject.
    ///
    /// Checked before resource gating, so a disabled stage never consumes
    /// disk or memory headroom.
    fn skip_reason(&self, _ctx: &StageContext) -> Option<String> {
        None
    }

    /// Files that must exist once the stage has succeeded.
    fn declared_outputs(&self, ctx: &StageContext) -> Vec<PathBuf>;

    /// Runs the stage's tools.
    async fn execute(&self, ctx: &StageContext) -> Result<StageMetadata>;
}

/// All stages, in execution order.
#[must_use]
pub fn pipeline_stages() -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(DistortionCorrection),
        Arc::new(BasicPreprocessing),
        Arc::new(MotionCorrection),
        Arc::new(Refinement),
        Arc::new(Connectivity),
        Arc::new(Microstructure),
    ]
}
