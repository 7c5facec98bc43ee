//! Command-line surface.
//!
//! Every flag has an environment fallback so batch schedulers can configure
//! runs without editing command lines. Values are kept as strings here and
//! validated into a [`RunConfig`] by [`Cli::to_config`], so every rejection
//! surfaces as a configuration error naming the offending setting.

use crate::config::{
    resolve_thread_count, EchoSpacing, PathsConfig, PhaseEncoding, RegistrationConfig, RunConfig,
    StageToggles, ToolLocations,
};
use crate::errors::{ConfigError, DtiflowError, Result};
use crate::registration::RequestedMethod;
use crate::subject::{discover, validate_subject_id};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

/// Name of the run log under the work root.
pub const LOG_FILE_NAME: &str = "dtiflow.log";

/// Crash-safe, multi-subject diffusion MRI pipeline.
#[derive(Parser, Debug, Clone)]
#[command(name = "dtiflow")]
#[command(about = "Run the DTI preprocessing and analysis pipeline over BIDS-style subjects")]
#[command(version)]
pub struct Cli {
    /// Directory containing `sub-*` input folders
    #[arg(long, env = "DTIFLOW_INPUT_ROOT")]
    pub input_root: PathBuf,

    /// Ephemeral working directory
    #[arg(long, env = "DTIFLOW_WORK_ROOT")]
    pub work_root: PathBuf,

    /// Durable, frequently-read output tier
    #[arg(long, env = "DTIFLOW_FAST_TIER_ROOT")]
    pub fast_tier_root: PathBuf,

    /// Durable tier for large reconstruction outputs
    #[arg(long, env = "DTIFLOW_LARGE_TIER_ROOT")]
    pub large_tier_root: PathBuf,

    /// Process only this subject
    #[arg(long, env = "DTIFLOW_SUBJECT")]
    pub subject: Option<String>,

    /// Phase-encoding direction (AP, PA, LR, RL)
    #[arg(long, default_value = "AP", env = "DTIFLOW_PE_DIRECTION")]
    pub pe_direction: String,

    /// Echo spacing in seconds
    #[arg(long, default_value = "0.00069", env = "DTIFLOW_ECHO_SPACING")]
    pub echo_spacing: String,

    /// Do not estimate a synthetic distortion field
    #[arg(long, env = "DTIFLOW_SKIP_DISTORTION_CORRECTION")]
    pub skip_distortion_correction: bool,

    /// Do not run reconstruction, tractography or the connectome
    #[arg(long, env = "DTIFLOW_SKIP_CONNECTIVITY")]
    pub skip_connectivity: bool,

    /// Use ML registration for refinement instead of the FSL route
    #[arg(long, env = "DTIFLOW_ML_REGISTRATION")]
    pub ml_registration: bool,

    /// Registration method (auto, deformable-net, synthmorph, enhanced-classical)
    #[arg(long, default_value = "auto", env = "DTIFLOW_ML_METHOD")]
    pub ml_method: String,

    /// Fewer registration iterations
    #[arg(long, env = "DTIFLOW_ML_QUICK")]
    pub ml_quick: bool,

    /// Accept ML registration output without the quality gate
    #[arg(long, env = "DTIFLOW_SKIP_QUALITY_CHECK")]
    pub skip_quality_check: bool,

    /// Report the planned work and exit
    #[arg(long, env = "DTIFLOW_DRY_RUN")]
    pub dry_run: bool,

    /// Re-run stages even when checkpointed
    #[arg(long, env = "DTIFLOW_NO_RESUME")]
    pub no_resume: bool,

    /// Thread-count hint for external tools (default: derived from cores and load)
    #[arg(long, env = "DTIFLOW_THREADS")]
    pub threads: Option<usize>,

    /// TOML map of logical tool names to executables
    #[arg(long, env = "DTIFLOW_TOOL_CONFIG")]
    pub tool_config: Option<PathBuf>,

    /// Log filter (e.g. `info`, `dtiflow=debug`); falls back to RUST_LOG
    #[arg(long, env = "DTIFLOW_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// JSONL progress log (default: `{work_root}/events.jsonl`)
    #[arg(long, env = "DTIFLOW_EVENT_LOG")]
    pub event_log: Option<PathBuf>,
}

impl Cli {
    /// Configured directory roots.
    #[must_use]
    pub fn paths(&self) -> PathsConfig {
        let mut paths = PathsConfig::new(
            &self.input_root,
            &self.work_root,
            &self.fast_tier_root,
            &self.large_tier_root,
        );
        paths.event_log.clone_from(&self.event_log);
        paths
    }

    /// Persistent log file, or `None` for dry runs, which write nothing.
    #[must_use]
    pub fn log_file(&self) -> Option<PathBuf> {
        (!self.dry_run).then(|| self.work_root.join(LOG_FILE_NAME))
    }

    /// Validates every flag and resolves tools into a run configuration.
    pub fn to_config(&self) -> Result<RunConfig> {
        if self.threads == Some(0) {
            return Err(ConfigError::new("threads", "must be at least 1").into());
        }
        let pe: PhaseEncoding = self.pe_direction.parse()?;
        let echo_spacing: EchoSpacing = self.echo_spacing.parse()?;
        let method: RequestedMethod = self.ml_method.parse()?;
        if let Some(id) = &self.subject {
            validate_subject_id(id)?;
        }

        let overrides = match &self.tool_config {
            Some(path) => ToolLocations::read_overrides(path)?,
            None => BTreeMap::new(),
        };
        let tools = ToolLocations::resolve(&overrides)?;

        let mut config = RunConfig::new(self.paths())
            .with_pe_direction(pe)
            .with_echo_spacing(echo_spacing)
            .with_toggles(StageToggles {
                distortion_correction: !self.skip_distortion_correction,
                connectivity: !self.skip_connectivity,
            })
            .with_registration(RegistrationConfig {
                ml_enabled: self.ml_registration,
                method,
                quick: self.ml_quick,
                skip_quality_check: self.skip_quality_check,
                ..RegistrationConfig::default()
            })
            .with_tools(tools)
            .with_threads(resolve_thread_count(self.threads))
            .with_dry_run(self.dry_run)
            .with_resume(!self.no_resume);
        if let Some(id) = &self.subject {
            config = config.with_subject(id.clone());
        }

        config.validate()?;
        info!(
            pe = %config.pe_direction,
            echo_spacing = config.echo_spacing.seconds(),
            threads = config.threads,
            ml = config.registration.ml_enabled,
            "Configuration validated"
        );
        Ok(config)
    }
}

/// Subjects to process: the explicit one, or every `sub-*` under the input root.
pub fn select_subjects(config: &RunConfig) -> Result<Vec<String>> {
    match &config.subject {
        Some(id) => Ok(vec![id.clone()]),
        None => {
            let found = discover(&config.paths.input_root)?;
            if found.is_empty() {
                return Err(DtiflowError::precondition(format!(
                    "no sub-* directories under {}",
                    config.paths.input_root.display()
                )));
            }
            Ok(found)
        }
    }
}

/// Returns true for errors that mean the run never started.
#[must_use]
pub fn is_startup_error(err: &DtiflowError) -> bool {
    matches!(err, DtiflowError::Config(_) | DtiflowError::Precondition(_))
}
