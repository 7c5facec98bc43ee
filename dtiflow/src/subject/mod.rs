//! Subjects: discovery, raw inputs and the on-disk layout of their outputs.

use crate::config::PathsConfig;
use crate::core::StageId;
use crate::errors::{ConfigError, DtiflowError, Result};
use crate::registration::nifti;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

static SUBJECT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sub-[A-Za-z0-9][A-Za-z0-9_-]*$").expect("valid subject ID regex"));

/// Checks a subject ID (`sub-` followed by a label).
pub fn validate_subject_id(id: &str) -> std::result::Result<(), ConfigError> {
    if SUBJECT_ID.is_match(id) {
        Ok(())
    } else {
        Err(ConfigError::new(
            "subject",
            format!("'{id}' is not a subject ID of the form sub-<label>"),
        ))
    }
}

/// Lists `sub-*` directories under `input_root`, sorted.
pub fn discover(input_root: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(input_root).map_err(|e| {
        DtiflowError::precondition(format!("cannot read input root {}: {e}", input_root.display()))
    })?;

    let mut subjects = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("sub-") {
            continue;
        }
        if validate_subject_id(&name).is_ok() {
            subjects.push(name);
        } else {
            warn!(directory = %name, "Ignoring directory with malformed subject ID");
        }
    }
    subjects.sort();
    debug!(root = %input_root.display(), count = subjects.len(), "Discovered subjects");
    Ok(subjects)
}

/// Parses a whitespace-separated b-value file.
pub fn read_bvals(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)?;
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>().map_err(|_| {
                DtiflowError::precondition(format!("{}: '{tok}' is not a b-value", path.display()))
            })
        })
        .collect()
}

/// Parses a b-vector file: one row per axis, one column per volume.
pub fn read_bvecs(path: &Path) -> Result<Vec<Vec<f64>>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split_whitespace()
                .map(|tok| {
                    tok.parse::<f64>().map_err(|_| {
                        DtiflowError::precondition(format!(
                            "{}: '{tok}' is not a vector component",
                            path.display()
                        ))
                    })
                })
                .collect()
        })
        .collect()
}

/// One subject and where everything about it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    id: String,
    input_dir: PathBuf,
    work_dir: PathBuf,
    fast_dir: PathBuf,
    large_dir: PathBuf,
}

impl Subject {
    /// Lays out `id` under the configured roots.
    #[must_use]
    pub fn new(id: impl Into<String>, paths: &PathsConfig) -> Self {
        let id = id.into();
        Self {
            input_dir: paths.input_root.join(&id),
            work_dir: paths.work_root.join(&id),
            fast_dir: paths.fast_tier_root.join(&id),
            large_dir: paths.large_tier_root.join(&id),
            id,
        }
    }

    /// Subject ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn raw(&self, modality: &str, suffix: &str) -> PathBuf {
        self.input_dir.join(modality).join(format!("{}_{suffix}", self.id))
    }

    /// Raw diffusion series.
    #[must_use]
    pub fn raw_dwi(&self) -> PathBuf {
        self.raw("dwi", "dwi.nii.gz")
    }

    /// Raw b-values.
    #[must_use]
    pub fn raw_bval(&self) -> PathBuf {
        self.raw("dwi", "dwi.bval")
    }

    /// Raw gradient directions.
    #[must_use]
    pub fn raw_bvec(&self) -> PathBuf {
        self.raw("dwi", "dwi.bvec")
    }

    /// Raw T1-weighted anatomy (optional).
    #[must_use]
    pub fn raw_t1(&self) -> PathBuf {
        self.raw("anat", "T1w.nii.gz")
    }

    /// Returns true when a T1 image is present.
    #[must_use]
    pub fn has_t1(&self) -> bool {
        self.raw_t1().is_file()
    }

    /// Working directory.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Failure logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.work_dir.join("logs")
    }

    /// Scratch space removed on interrupt.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.work_dir.join("tmp")
    }

    /// Working directory of one stage.
    #[must_use]
    pub fn stage_dir(&self, stage: StageId) -> PathBuf {
        let name = match stage {
            StageId::DistortionCorrection => "distortion",
            StageId::BasicPreprocessing => "preproc",
            StageId::MotionCorrection => "eddy",
            StageId::Refinement => "refinement",
            StageId::Connectivity => "connectivity",
            StageId::Microstructure => "microstructure",
        };
        self.work_dir.join(name)
    }

    /// Staging area for deliverables bound for a durable tier.
    #[must_use]
    pub fn export_dir(&self, name: &str) -> PathBuf {
        self.work_dir.join("export").join(name)
    }

    /// Failure log of one stage.
    #[must_use]
    pub fn failure_log(&self, stage: StageId) -> PathBuf {
        self.logs_dir().join(format!("{}_failure.log", stage.name()))
    }

    /// Why the subject was turned away before its first stage.
    #[must_use]
    pub fn preflight_failure_log(&self) -> PathBuf {
        self.logs_dir().join("preflight_failure.log")
    }

    /// Raw diffusion inputs checked before the first stage.
    #[must_use]
    pub fn raw_inputs(&self) -> [PathBuf; 3] {
        [self.raw_dwi(), self.raw_bval(), self.raw_bvec()]
    }

    /// Persisted registration outcome.
    #[must_use]
    pub fn registration_record(&self) -> PathBuf {
        self.work_dir.join(crate::registration::RECORD_FILE_NAME)
    }

    /// This subject's directory on the fast tier.
    #[must_use]
    pub fn fast_dir(&self) -> &Path {
        &self.fast_dir
    }

    /// This subject's directory on the large tier.
    #[must_use]
    pub fn large_dir(&self) -> &Path {
        &self.large_dir
    }

    /// Checks that the raw diffusion inputs exist, that the series is 4-D
    /// and that the gradient table has one entry per volume.
    pub fn preflight(&self) -> Result<()> {
        for path in self.raw_inputs() {
            let meta = std::fs::metadata(&path).map_err(|_| {
                DtiflowError::precondition(format!("{}: missing {}", self.id, path.display()))
            })?;
            if meta.len() == 0 {
                return Err(DtiflowError::precondition(format!(
                    "{}: empty {}",
                    self.id,
                    path.display()
                )));
            }
        }
        let header = nifti::read_header(&self.raw_dwi()).map_err(|e| {
            DtiflowError::precondition(format!("{}: unreadable diffusion series: {e}", self.id))
        })?;
        if header.dims.len() < 4 {
            return Err(DtiflowError::precondition(format!(
                "{}: diffusion series is {}-D, expected 4-D",
                self.id,
                header.dims.len()
            )));
        }
        let volumes = header.volumes();

        let bvals = read_bvals(&self.raw_bval())?;
        if bvals.is_empty() {
            return Err(DtiflowError::precondition(format!("{}: no b-values", self.id)));
        }
        if bvals.len() != volumes {
            return Err(DtiflowError::precondition(format!(
                "{}: {} b-values for {volumes} volumes",
                self.id,
                bvals.len()
            )));
        }

        let bvecs = read_bvecs(&self.raw_bvec())?;
        if bvecs.len() != 3 {
            return Err(DtiflowError::precondition(format!(
                "{}: b-vector file has {} rows, expected 3",
                self.id,
                bvecs.len()
            )));
        }
        if let Some((axis, row)) = bvecs.iter().enumerate().find(|(_, row)| row.len() != volumes) {
            return Err(DtiflowError::precondition(format!(
                "{}: b-vector row {axis} has {} entries for {volumes} volumes",
                self.id,
                row.len()
            )));
        }
        Ok(())
    }
}
