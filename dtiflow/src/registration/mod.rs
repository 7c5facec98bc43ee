//! Registration of diffusion data to anatomy.
//!
//! Three learned or classical methods are tried in a fixed preference order;
//! learned results must pass a similarity gate before they are accepted.
//! When nothing succeeds the moving image is passed through unregistered and
//! the outcome is recorded rather than treated as an error. The accepted
//! outcome is persisted as a [`RegistrationRecord`] for downstream stages.

mod backends;
mod method;
pub mod nifti;
mod quality;
mod selector;

pub use backends::{run_traditional, RegistrationBackend, RegistrationRequest, ToolBackend};
pub use method::{AppliedMethod, RegistrationMethod, RequestedMethod};
pub use quality::{
    compute_metrics, mutual_information, normalized_correlation, NiftiQualityAssessor, QualityAssessor,
    QualityClass, QualityMetrics, QualityThresholds, MI_BINS,
};
pub use selector::{
    fallback_chain, run_fallback_chain, RegistrationAttempt, RegistrationOutcome, RegistrationRecord,
    RegistrationSelector, RECORD_FILE_NAME,
};
