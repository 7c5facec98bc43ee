//! The fixed set of pipeline stages and their declared error contracts.

use super::ErrorContract;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A pipeline stage.
///
/// The order of [`StageId::ALL`] is the execution order. Each stage's error
/// contract is declared in [`StageId::contract`] and never inferred from
/// runtime behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Synthetic-field susceptibility distortion estimation from the T1.
    DistortionCorrection,
    /// Denoising, Gibbs removal, bias correction and brain masking.
    BasicPreprocessing,
    /// Eddy-current and motion correction.
    MotionCorrection,
    /// Post-hoc b0-to-anatomy registration.
    Refinement,
    /// Anatomical reconstruction, tractography and connectome.
    Connectivity,
    /// Tensor metrics and neurite-model fitting.
    Microstructure,
}

impl StageId {
    /// All stages in execution order.
    pub const ALL: [Self; 6] = [
        Self::DistortionCorrection,
        Self::BasicPreprocessing,
        Self::MotionCorrection,
        Self::Refinement,
        Self::Connectivity,
        Self::Microstructure,
    ];

    /// Stable snake_case name, used in logs and file names.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::DistortionCorrection => "distortion_correction",
            Self::BasicPreprocessing => "basic_preprocessing",
            Self::MotionCorrection => "motion_correction",
            Self::Refinement => "refinement",
            Self::Connectivity => "connectivity",
            Self::Microstructure => "microstructure",
        }
    }

    /// The token written to the checkpoint store on completion.
    #[must_use]
    pub fn checkpoint_token(&self) -> &'static str {
        match self {
            Self::DistortionCorrection => "DISTORTION_CORRECTION",
            Self::BasicPreprocessing => "BASIC_PREPROCESSING",
            Self::MotionCorrection => "MOTION_CORRECTION",
            Self::Refinement => "REFINEMENT",
            Self::Connectivity => "CONNECTIVITY",
            Self::Microstructure => "MICROSTRUCTURE",
        }
    }

    /// Looks a stage up by its checkpoint token.
    #[must_use]
    pub fn from_checkpoint_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.checkpoint_token() == token)
    }

    /// The declared error contract.
    ///
    /// - `DistortionCorrection`: advisory; eddy runs without a synthetic field.
    /// - `BasicPreprocessing`: fatal; nothing downstream is meaningful without it.
    /// - `MotionCorrection`: fatal; every analysis consumes the corrected series.
    /// - `Refinement`: advisory; downstream falls back to the unrefined series.
    /// - `Connectivity`: advisory; the connectome is an optional analysis.
    /// - `Microstructure`: advisory; metric maps are an optional analysis.
    #[must_use]
    pub fn contract(&self) -> ErrorContract {
        match self {
            Self::BasicPreprocessing | Self::MotionCorrection => ErrorContract::Fatal,
            Self::DistortionCorrection
            | Self::Refinement
            | Self::Connectivity
            | Self::Microstructure => ErrorContract::Advisory,
        }
    }

    /// Position in the pipeline, starting at 0.
    #[must_use]
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or_default()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}
