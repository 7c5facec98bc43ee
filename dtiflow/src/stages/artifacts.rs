//! Paths of files handed from one stage to the next.

use crate::core::StageId;
use crate::registration::RegistrationRecord;
use crate::subject::Subject;
use std::path::PathBuf;
use tracing::debug;

/// Inter-stage file locations for one subject.
#[derive(Debug, Clone)]
pub struct Artifacts<'a> {
    subject: &'a Subject,
}

impl<'a> Artifacts<'a> {
    /// Artifacts of `subject`.
    #[must_use]
    pub fn new(subject: &'a Subject) -> Self {
        Self { subject }
    }

    fn in_stage(&self, stage: StageId, name: &str) -> PathBuf {
        self.subject.stage_dir(stage).join(name)
    }

    /// Output basename prefix of the synthetic field (`--topup` argument).
    #[must_use]
    pub fn field_prefix(&self) -> PathBuf {
        self.in_stage(StageId::DistortionCorrection, "topup")
    }

    /// Field coefficients of the synthetic field.
    #[must_use]
    pub fn field_coefficients(&self) -> PathBuf {
        self.in_stage(StageId::DistortionCorrection, "topup_fieldcoef.nii.gz")
    }

    /// Movement parameters accompanying the synthetic field.
    #[must_use]
    pub fn field_movpar(&self) -> PathBuf {
        self.in_stage(StageId::DistortionCorrection, "topup_movpar.txt")
    }

    /// Returns true when a synthetic field is available for eddy.
    #[must_use]
    pub fn has_synthetic_field(&self) -> bool {
        self.field_coefficients().is_file() && self.field_movpar().is_file()
    }

    /// Bias-corrected diffusion series.
    #[must_use]
    pub fn preprocessed_dwi(&self) -> PathBuf {
        self.in_stage(StageId::BasicPreprocessing, "dwi_biascorr.nii.gz")
    }

    /// Brain mask.
    #[must_use]
    pub fn brain_mask(&self) -> PathBuf {
        self.in_stage(StageId::BasicPreprocessing, "mask.nii.gz")
    }

    /// Prefix of eddy outputs.
    #[must_use]
    pub fn eddy_prefix(&self) -> PathBuf {
        self.in_stage(StageId::MotionCorrection, "eddy_corrected")
    }

    /// Motion- and eddy-corrected series; the input to every model fit.
    #[must_use]
    pub fn corrected_dwi(&self) -> PathBuf {
        self.in_stage(StageId::MotionCorrection, "eddy_corrected.nii.gz")
    }

    /// Gradient directions rotated by eddy.
    #[must_use]
    pub fn rotated_bvecs(&self) -> PathBuf {
        self.in_stage(StageId::MotionCorrection, "eddy_corrected.eddy_rotated_bvecs")
    }

    /// Registered diffusion image written by refinement.
    #[must_use]
    pub fn refined_dwi(&self) -> PathBuf {
        self.in_stage(StageId::Refinement, "dwi_to_t1.nii.gz")
    }

    /// FreeSurfer `SUBJECTS_DIR` used by connectivity.
    #[must_use]
    pub fn freesurfer_dir(&self) -> PathBuf {
        self.in_stage(StageId::Connectivity, "freesurfer")
    }

    /// The registration record, when refinement produced a usable one.
    ///
    /// The registered image lives on the T1 grid. Model fitting stays on
    /// [`Self::corrected_dwi`], which shares a grid with the brain mask and
    /// the rotated gradients; the registration only steers tract seeding.
    #[must_use]
    pub fn usable_registration(&self) -> Option<RegistrationRecord> {
        let path = self.subject.registration_record();
        match RegistrationRecord::load(&path) {
            Ok(record) if record.is_usable() => Some(record),
            Ok(record) => {
                debug!(subject = %self.subject.id(), applied = %record.applied, "Registration not usable downstream");
                None
            }
            Err(_) => None,
        }
    }
}
