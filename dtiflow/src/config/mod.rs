//! Run configuration.
//!
//! A [`RunConfig`] is built once at startup (from the CLI and an optional
//! tool map) and then shared read-only by every component for the duration
//! of the run.

mod threads;
mod tools;

pub use threads::{default_thread_count, load_adjusted_thread_count, read_load_average, resolve_thread_count};
pub use tools::{Tool, ToolLocations};

use crate::core::StageId;
use crate::errors::ConfigError;
use crate::registration::{QualityThresholds, RequestedMethod};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Phase-encoding direction of the diffusion acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseEncoding {
    /// Anterior to posterior.
    AP,
    /// Posterior to anterior.
    PA,
    /// Left to right.
    LR,
    /// Right to left.
    RL,
}

impl PhaseEncoding {
    /// The unit vector written to an eddy `acqparams` row.
    #[must_use]
    pub fn acqparams_vector(&self) -> [i8; 3] {
        match self {
            Self::AP => [0, -1, 0],
            Self::PA => [0, 1, 0],
            Self::LR => [-1, 0, 0],
            Self::RL => [1, 0, 0],
        }
    }

    /// Image axis along which phase is encoded (0 = i, 1 = j).
    #[must_use]
    pub fn axis(&self) -> usize {
        match self {
            Self::AP | Self::PA => 1,
            Self::LR | Self::RL => 0,
        }
    }
}

impl fmt::Display for PhaseEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AP => write!(f, "AP"),
            Self::PA => write!(f, "PA"),
            Self::LR => write!(f, "LR"),
            Self::RL => write!(f, "RL"),
        }
    }
}

impl FromStr for PhaseEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AP" => Ok(Self::AP),
            "PA" => Ok(Self::PA),
            "LR" => Ok(Self::LR),
            "RL" => Ok(Self::RL),
            other => Err(ConfigError::new(
                "pe_direction",
                format!("'{other}' is not one of AP, PA, LR, RL"),
            )),
        }
    }
}

/// Echo spacing in seconds; always positive and finite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct EchoSpacing(f64);

impl EchoSpacing {
    /// Validates and wraps an echo spacing value.
    pub fn new(seconds: f64) -> Result<Self, ConfigError> {
        if seconds.is_finite() && seconds > 0.0 {
            Ok(Self(seconds))
        } else {
            Err(ConfigError::new(
                "echo_spacing",
                format!("{seconds} is not a positive decimal number of seconds"),
            ))
        }
    }

    /// The value in seconds.
    #[must_use]
    pub fn seconds(&self) -> f64 {
        self.0
    }

    /// Total readout time for `pe_steps` phase-encode lines.
    #[must_use]
    pub fn total_readout_time(&self, pe_steps: usize) -> f64 {
        self.0 * pe_steps.saturating_sub(1) as f64
    }
}

impl TryFrom<f64> for EchoSpacing {
    type Error = ConfigError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EchoSpacing> for f64 {
    fn from(value: EchoSpacing) -> Self {
        value.0
    }
}

impl FromStr for EchoSpacing {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s.trim().parse().map_err(|_| {
            ConfigError::new("echo_spacing", format!("'{s}' is not a decimal number"))
        })?;
        Self::new(value)
    }
}

/// Input, working and tier root directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root holding `{subject}/dwi` and `{subject}/anat`.
    pub input_root: PathBuf,
    /// Ephemeral working area (locks, checkpoints, scratch, logs).
    pub work_root: PathBuf,
    /// Durable fast tier.
    pub fast_tier_root: PathBuf,
    /// Durable large-capacity tier.
    pub large_tier_root: PathBuf,
    /// JSONL event log; defaults to `{work_root}/events.jsonl`.
    pub event_log: Option<PathBuf>,
}

impl PathsConfig {
    /// Creates a paths config rooted at the given directories.
    #[must_use]
    pub fn new(
        input_root: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
        fast_tier_root: impl Into<PathBuf>,
        large_tier_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input_root: input_root.into(),
            work_root: work_root.into(),
            fast_tier_root: fast_tier_root.into(),
            large_tier_root: large_tier_root.into(),
            event_log: None,
        }
    }

    /// The effective event log path.
    #[must_use]
    pub fn event_log_path(&self) -> PathBuf {
        self.event_log
            .clone()
            .unwrap_or_else(|| self.work_root.join("events.jsonl"))
    }
}

/// Optional stage switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageToggles {
    /// Run synthetic-field distortion correction.
    pub distortion_correction: bool,
    /// Run anatomical reconstruction and connectome.
    pub connectivity: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            distortion_correction: true,
            connectivity: true,
        }
    }
}

/// Registration behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Use ML-based registration; otherwise the traditional FSL route.
    pub ml_enabled: bool,
    /// Requested method (`auto` or an explicit backend).
    pub method: RequestedMethod,
    /// Quick (fewer iterations) instead of full mode.
    pub quick: bool,
    /// Accept ML output without computing similarity metrics.
    pub skip_quality_check: bool,
    /// Quality gate cutoffs.
    pub thresholds: QualityThresholds,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            ml_enabled: false,
            method: RequestedMethod::Auto,
            quick: false,
            skip_quality_check: false,
            thresholds: QualityThresholds::default(),
        }
    }
}

/// Minimum free resources before a stage may start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageRequirements {
    /// Minimum free disk in GB on the working area.
    pub min_disk_gb: f64,
    /// Minimum available memory in GB.
    pub min_memory_gb: f64,
}

impl StageRequirements {
    /// Creates a requirement pair.
    #[must_use]
    pub fn new(min_disk_gb: f64, min_memory_gb: f64) -> Self {
        Self {
            min_disk_gb,
            min_memory_gb,
        }
    }
}

/// Per-stage resource thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Free space required on the work root before a subject starts.
    pub subject_min_disk_gb: f64,
    /// Requirements keyed by stage.
    pub stages: BTreeMap<StageId, StageRequirements>,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        let stages = BTreeMap::from([
            (StageId::DistortionCorrection, StageRequirements::new(10.0, 4.0)),
            (StageId::BasicPreprocessing, StageRequirements::new(20.0, 4.0)),
            (StageId::MotionCorrection, StageRequirements::new(30.0, 8.0)),
            (StageId::Refinement, StageRequirements::new(10.0, 4.0)),
            (StageId::Connectivity, StageRequirements::new(50.0, 16.0)),
            (StageId::Microstructure, StageRequirements::new(15.0, 8.0)),
        ]);
        Self {
            subject_min_disk_gb: 50.0,
            stages,
        }
    }
}

impl ResourceThresholds {
    /// Thresholds that every probe passes; useful for tests.
    #[must_use]
    pub fn none() -> Self {
        Self {
            subject_min_disk_gb: 0.0,
            stages: StageId::ALL
                .into_iter()
                .map(|s| (s, StageRequirements::new(0.0, 0.0)))
                .collect(),
        }
    }

    /// Requirements for a stage (zero when unset).
    #[must_use]
    pub fn for_stage(&self, stage: StageId) -> StageRequirements {
        self.stages
            .get(&stage)
            .copied()
            .unwrap_or_else(|| StageRequirements::new(0.0, 0.0))
    }

    /// Overrides the requirements of one stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageId, requirements: StageRequirements) -> Self {
        self.stages.insert(stage, requirements);
        self
    }
}

/// Migration retry policy: 3 attempts, 5 s doubling.
#[must_use]
pub fn default_migration_retry() -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(3)
        .with_base_delay_ms(5_000)
        .with_max_delay_ms(60_000)
}

/// Immutable configuration for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory roots.
    pub paths: PathsConfig,
    /// Restrict the run to one subject.
    pub subject: Option<String>,
    /// Phase-encoding direction.
    pub pe_direction: PhaseEncoding,
    /// Echo spacing.
    pub echo_spacing: EchoSpacing,
    /// Optional stage switches.
    pub toggles: StageToggles,
    /// Registration behavior.
    pub registration: RegistrationConfig,
    /// Resource gates.
    pub resources: ResourceThresholds,
    /// Retry policy for storage transfers.
    pub migration_retry: RetryConfig,
    /// Resolved external tools.
    #[serde(skip)]
    pub tools: ToolLocations,
    /// Thread-count hint passed to tools.
    pub threads: usize,
    /// Report planned work only.
    pub dry_run: bool,
    /// Honor checkpoints (skip completed stages).
    pub resume: bool,
    /// Timeout for the bias-correction sub-step.
    pub bias_correct_timeout_secs: u64,
}

impl RunConfig {
    /// Creates a configuration with defaults for everything but the paths.
    #[must_use]
    pub fn new(paths: PathsConfig) -> Self {
        Self {
            paths,
            subject: None,
            pe_direction: PhaseEncoding::AP,
            echo_spacing: EchoSpacing(0.000_69),
            toggles: StageToggles::default(),
            registration: RegistrationConfig::default(),
            resources: ResourceThresholds::default(),
            migration_retry: default_migration_retry(),
            tools: ToolLocations::default(),
            threads: resolve_thread_count(None),
            dry_run: false,
            resume: true,
            bias_correct_timeout_secs: 1_800,
        }
    }

    /// Restricts the run to one subject.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the phase-encoding direction.
    #[must_use]
    pub fn with_pe_direction(mut self, pe: PhaseEncoding) -> Self {
        self.pe_direction = pe;
        self
    }

    /// Sets the echo spacing.
    #[must_use]
    pub fn with_echo_spacing(mut self, echo_spacing: EchoSpacing) -> Self {
        self.echo_spacing = echo_spacing;
        self
    }

    /// Sets the stage toggles.
    #[must_use]
    pub fn with_toggles(mut self, toggles: StageToggles) -> Self {
        self.toggles = toggles;
        self
    }

    /// Sets the registration config.
    #[must_use]
    pub fn with_registration(mut self, registration: RegistrationConfig) -> Self {
        self.registration = registration;
        self
    }

    /// Sets the resource thresholds.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceThresholds) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the migration retry policy.
    #[must_use]
    pub fn with_migration_retry(mut self, retry: RetryConfig) -> Self {
        self.migration_retry = retry;
        self
    }

    /// Sets the tool locations.
    #[must_use]
    pub fn with_tools(mut self, tools: ToolLocations) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the thread-count hint.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Enables or disables dry-run mode.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Enables or disables checkpoint-aware resume.
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Sets the bias-correction timeout.
    #[must_use]
    pub fn with_bias_correct_timeout_secs(mut self, secs: u64) -> Self {
        self.bias_correct_timeout_secs = secs;
        self
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.input_root.as_os_str().is_empty() {
            return Err(ConfigError::new("input_root", "must not be empty"));
        }
        if self.paths.fast_tier_root == self.paths.large_tier_root {
            return Err(ConfigError::new(
                "large_tier_root",
                "must differ from the fast tier root",
            ));
        }
        if self.threads == 0 {
            return Err(ConfigError::new("threads", "must be at least 1"));
        }
        if self.migration_retry.max_attempts == 0 {
            return Err(ConfigError::new("migration_retry", "max_attempts must be >= 1"));
        }
        self.registration
            .thresholds
            .validate()
            .map_err(|msg| ConfigError::new("quality_thresholds", msg))?;
        if !self.dry_run {
            self.tools.validate_required()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn paths() -> PathsConfig {
        PathsConfig::new("/data/raw", "/scratch/work", "/ssd/out", "/bulk/out")
    }

    #[test]
    fn test_phase_encoding_parse() {
        assert_eq!("ap".parse::<PhaseEncoding>().unwrap(), PhaseEncoding::AP);
        assert_eq!(" RL ".parse::<PhaseEncoding>().unwrap(), PhaseEncoding::RL);
        let err = "IS".parse::<PhaseEncoding>().unwrap_err();
        assert_eq!(err.field, "pe_direction");
    }

    #[test]
    fn test_phase_encoding_vectors() {
        assert_eq!(PhaseEncoding::AP.acqparams_vector(), [0, -1, 0]);
        assert_eq!(PhaseEncoding::LR.acqparams_vector(), [-1, 0, 0]);
        assert_eq!(PhaseEncoding::PA.axis(), 1);
        assert_eq!(PhaseEncoding::RL.axis(), 0);
    }

    #[test]
    fn test_echo_spacing_validation() {
        assert!("0.00069".parse::<EchoSpacing>().is_ok());
        assert!("0".parse::<EchoSpacing>().is_err());
        assert!("-0.1".parse::<EchoSpacing>().is_err());
        assert!("fast".parse::<EchoSpacing>().is_err());
        assert!(EchoSpacing::new(f64::NAN).is_err());
    }

    #[test]
    fn test_total_readout_time() {
        let es = EchoSpacing::new(0.0005).unwrap();
        assert!((es.total_readout_time(101) - 0.05).abs() < 1e-12);
        assert_eq!(es.total_readout_time(0), 0.0);
    }

    #[test]
    fn test_resource_thresholds_default() {
        let thresholds = ResourceThresholds::default();
        assert_eq!(thresholds.stages.len(), StageId::ALL.len());
        assert!(
            thresholds.for_stage(StageId::Connectivity).min_disk_gb
                > thresholds.for_stage(StageId::Refinement).min_disk_gb
        );
    }

    #[test]
    fn test_migration_retry_defaults() {
        let retry = default_migration_retry();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay_ms, 5_000);
        assert_eq!(retry.delay_for_retry(2), std::time::Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_identical_tiers() {
        let mut p = paths();
        p.large_tier_root = p.fast_tier_root.clone();
        let config = RunConfig::new(p).with_dry_run(true);
        assert_eq!(config.validate().unwrap_err().field, "large_tier_root");
    }

    #[test]
    fn test_validate_requires_tools_unless_dry_run() {
        let config = RunConfig::new(paths());
        assert!(config.validate().is_err());
        assert!(config.with_dry_run(true).validate().is_ok());
    }

    #[test]
    fn test_event_log_default_path() {
        assert_eq!(
            paths().event_log_path(),
            PathBuf::from("/scratch/work/events.jsonl")
        );
    }
}
