//! Logical tool names and their resolved executables.

use crate::errors::{ConfigError, DtiflowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An external collaborator, by logical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    /// Diffusion denoising.
    Denoise,
    /// Gibbs ringing removal.
    Degibbs,
    /// Bias-field correction.
    BiasCorrect,
    /// Brain mask estimation.
    Mask,
    /// Eddy-current and motion correction.
    Eddy,
    /// Synthetic undistorted b0 / field estimation.
    Synb0,
    /// Traditional linear registration.
    Flirt,
    /// Synthetic-modality learned registration.
    Synthmorph,
    /// Deformable-net learned registration.
    Voxelmorph,
    /// Enhanced classical (SyN) registration.
    Ants,
    /// Cortical reconstruction.
    ReconAll,
    /// Five-tissue-type segmentation.
    FiveTt,
    /// Response function estimation.
    Response,
    /// Fiber orientation distribution estimation.
    Fod,
    /// Streamline tractography.
    Tckgen,
    /// Connectome construction.
    Connectome,
    /// Diffusion tensor fitting.
    Tensor,
    /// Tensor-derived metric maps.
    TensorMetric,
    /// Neurite orientation dispersion and density fitting.
    Noddi,
    /// Verified file transfer.
    Transfer,
    /// Kill processes by name pattern.
    Kill,
}

impl Tool {
    /// Every tool the pipeline knows about.
    pub const ALL: [Self; 21] = [
        Self::Denoise,
        Self::Degibbs,
        Self::BiasCorrect,
        Self::Mask,
        Self::Eddy,
        Self::Synb0,
        Self::Flirt,
        Self::Synthmorph,
        Self::Voxelmorph,
        Self::Ants,
        Self::ReconAll,
        Self::FiveTt,
        Self::Response,
        Self::Fod,
        Self::Tckgen,
        Self::Connectome,
        Self::Tensor,
        Self::TensorMetric,
        Self::Noddi,
        Self::Transfer,
        Self::Kill,
    ];

    /// Tools without which no subject can complete its fatal stages.
    pub const REQUIRED: [Self; 4] = [Self::Denoise, Self::Mask, Self::Eddy, Self::Transfer];

    /// Logical name used in the tool map and in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Denoise => "denoise",
            Self::Degibbs => "degibbs",
            Self::BiasCorrect => "bias_correct",
            Self::Mask => "mask",
            Self::Eddy => "eddy",
            Self::Synb0 => "synb0",
            Self::Flirt => "flirt",
            Self::Synthmorph => "synthmorph",
            Self::Voxelmorph => "voxelmorph",
            Self::Ants => "ants",
            Self::ReconAll => "recon_all",
            Self::FiveTt => "fivett",
            Self::Response => "response",
            Self::Fod => "fod",
            Self::Tckgen => "tckgen",
            Self::Connectome => "connectome",
            Self::Tensor => "tensor",
            Self::TensorMetric => "tensor_metric",
            Self::Noddi => "noddi",
            Self::Transfer => "transfer",
            Self::Kill => "kill",
        }
    }

    /// Executable searched on `PATH` when the tool map has no entry.
    #[must_use]
    pub fn default_executable(&self) -> &'static str {
        match self {
            Self::Denoise => "dwidenoise",
            Self::Degibbs => "mrdegibbs",
            Self::BiasCorrect => "dwibiascorrect",
            Self::Mask => "dwi2mask",
            Self::Eddy => "eddy_openmp",
            Self::Synb0 => "synb0-disco",
            Self::Flirt => "flirt",
            Self::Synthmorph => "mri_synthmorph",
            Self::Voxelmorph => "voxelmorph-register",
            Self::Ants => "antsRegistrationSyN.sh",
            Self::ReconAll => "recon-all",
            Self::FiveTt => "5ttgen",
            Self::Response => "dwi2response",
            Self::Fod => "dwi2fod",
            Self::Tckgen => "tckgen",
            Self::Connectome => "tck2connectome",
            Self::Tensor => "dwi2tensor",
            Self::TensorMetric => "tensor2metric",
            Self::Noddi => "amico-noddi",
            Self::Transfer => "rsync",
            Self::Kill => "pkill",
        }
    }

    /// Tools whose children are long-running and must be killed on interrupt.
    #[must_use]
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            Self::Eddy | Self::ReconAll | Self::Tckgen | Self::Synb0 | Self::Noddi | Self::Ants
        )
    }

    /// Looks a tool up by logical name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Deserialize)]
struct ToolMapFile {
    #[serde(default)]
    tools: BTreeMap<String, PathBuf>,
}

/// Mapping from logical tool to resolved executable path.
///
/// Resolved once at startup and passed to subprocess helpers; the process
/// environment is never mutated to steer tool discovery.
#[derive(Debug, Clone, Default)]
pub struct ToolLocations {
    paths: BTreeMap<Tool, PathBuf>,
}

impl ToolLocations {
    /// Creates an empty set (every tool unavailable).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a TOML tool map of the form `[tools] eddy = "/opt/fsl/bin/eddy"`.
    pub fn read_overrides(path: &Path) -> Result<BTreeMap<Tool, PathBuf>> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new("tool_config", format!("cannot read {}: {e}", path.display()))
        })?;
        let parsed: ToolMapFile = toml::from_str(&text).map_err(|e| {
            ConfigError::new("tool_config", format!("{}: {e}", path.display()))
        })?;

        let mut overrides = BTreeMap::new();
        for (name, exe) in parsed.tools {
            let tool = Tool::from_name(&name).ok_or_else(|| {
                ConfigError::new("tool_config", format!("unknown tool '{name}'"))
            })?;
            overrides.insert(tool, exe);
        }
        Ok(overrides)
    }

    /// Resolves every tool: explicit overrides first, then `PATH`.
    ///
    /// An override naming a missing file is a configuration error. Tools not
    /// found on `PATH` are left unavailable.
    pub fn resolve(overrides: &BTreeMap<Tool, PathBuf>) -> Result<Self> {
        let mut paths = BTreeMap::new();

        for tool in Tool::ALL {
            if let Some(exe) = overrides.get(&tool) {
                if !exe.is_file() {
                    return Err(DtiflowError::Config(ConfigError::new(
                        "tool_config",
                        format!("{tool} points at missing file {}", exe.display()),
                    )));
                }
                paths.insert(tool, exe.clone());
                continue;
            }

            match which::which(tool.default_executable()) {
                Ok(exe) => {
                    debug!(tool = %tool, path = %exe.display(), "Resolved tool");
                    paths.insert(tool, exe);
                }
                Err(_) => {
                    debug!(tool = %tool, executable = tool.default_executable(), "Tool not on PATH");
                }
            }
        }

        Ok(Self { paths })
    }

    /// Adds or replaces a tool location.
    #[must_use]
    pub fn with_tool(mut self, tool: Tool, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(tool, path.into());
        self
    }

    /// Marks every tool available under its default executable name.
    #[must_use]
    pub fn all_defaults() -> Self {
        Self {
            paths: Tool::ALL
                .into_iter()
                .map(|t| (t, PathBuf::from(t.default_executable())))
                .collect(),
        }
    }

    /// Removes a tool, making it unavailable.
    #[must_use]
    pub fn without_tool(mut self, tool: Tool) -> Self {
        self.paths.remove(&tool);
        self
    }

    /// The resolved executable for a tool.
    #[must_use]
    pub fn get(&self, tool: Tool) -> Option<&Path> {
        self.paths.get(&tool).map(PathBuf::as_path)
    }

    /// Returns true if the tool resolved.
    #[must_use]
    pub fn is_available(&self, tool: Tool) -> bool {
        self.paths.contains_key(&tool)
    }

    /// Fails when a tool needed by the fatal stages is missing; warns for the rest.
    pub fn validate_required(&self) -> std::result::Result<(), ConfigError> {
        let missing: Vec<&str> = Tool::REQUIRED
            .iter()
            .filter(|t| !self.is_available(**t))
            .map(Tool::name)
            .collect();

        for tool in Tool::ALL {
            if !Tool::REQUIRED.contains(&tool) && !self.is_available(tool) {
                warn!(tool = %tool, "Optional tool unavailable; dependent steps will skip or fall back");
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::new(
                "tools",
                format!("required tools not found: {}", missing.join(", ")),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tool_name_roundtrip() {
        for tool in Tool::ALL {
            assert_eq!(Tool::from_name(tool.name()), Some(tool));
        }
    }

    #[test]
    fn test_validate_required() {
        assert!(ToolLocations::all_defaults().validate_required().is_ok());

        let err = ToolLocations::all_defaults()
            .without_tool(Tool::Eddy)
            .validate_required()
            .unwrap_err();
        assert!(err.message.contains("eddy"));
    }

    #[test]
    fn test_read_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("tools.toml");
        let mut file = std::fs::File::create(&map).unwrap();
        writeln!(file, "[tools]\neddy = \"/opt/fsl/bin/eddy_cuda\"").unwrap();

        let overrides = ToolLocations::read_overrides(&map).unwrap();
        assert_eq!(
            overrides.get(&Tool::Eddy),
            Some(&PathBuf::from("/opt/fsl/bin/eddy_cuda"))
        );
    }

    #[test]
    fn test_read_overrides_rejects_unknown_tool() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("tools.toml");
        std::fs::write(&map, "[tools]\nmagic = \"/bin/true\"\n").unwrap();

        assert!(ToolLocations::read_overrides(&map).is_err());
    }

    #[test]
    fn test_resolve_rejects_missing_override() {
        let overrides = BTreeMap::from([(Tool::Eddy, PathBuf::from("/definitely/not/here"))]);
        assert!(ToolLocations::resolve(&overrides).is_err());
    }

    #[test]
    fn test_resolve_accepts_existing_override() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("eddy");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();

        let tools = ToolLocations::resolve(&BTreeMap::from([(Tool::Eddy, exe.clone())])).unwrap();
        assert_eq!(tools.get(Tool::Eddy), Some(exe.as_path()));
    }
}
