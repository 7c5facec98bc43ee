//! Registration quality metrics and the quality gate.

use super::nifti;
use crate::errors::{DtiflowError, Result};
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Joint histogram resolution for mutual information.
pub const MI_BINS: usize = 32;

/// Quality gate cutoffs. Both metrics must reach a class's cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Minimum correlation for Good.
    pub good_correlation: f64,
    /// Minimum mutual information for Good.
    pub good_mutual_information: f64,
    /// Minimum correlation for Acceptable.
    pub acceptable_correlation: f64,
    /// Minimum mutual information for Acceptable.
    pub acceptable_mutual_information: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            good_correlation: 0.80,
            good_mutual_information: 0.50,
            acceptable_correlation: 0.60,
            acceptable_mutual_information: 0.30,
        }
    }
}

impl QualityThresholds {
    /// Checks that cutoffs are finite and ordered.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let all = [
            self.good_correlation,
            self.good_mutual_information,
            self.acceptable_correlation,
            self.acceptable_mutual_information,
        ];
        if all.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err("cutoffs must be finite and non-negative".into());
        }
        if self.good_correlation > 1.0 {
            return Err("correlation cutoffs cannot exceed 1.0".into());
        }
        if self.acceptable_correlation > self.good_correlation
            || self.acceptable_mutual_information > self.good_mutual_information
        {
            return Err("acceptable cutoffs must not exceed good cutoffs".into());
        }
        Ok(())
    }

    /// Classifies a metric pair. Boundaries are inclusive.
    #[must_use]
    pub fn classify(&self, metrics: &QualityMetrics) -> QualityClass {
        let corr = metrics.correlation;
        let mi = metrics.mutual_information;
        if corr >= self.good_correlation && mi >= self.good_mutual_information {
            QualityClass::Good
        } else if corr >= self.acceptable_correlation && mi >= self.acceptable_mutual_information {
            QualityClass::Acceptable
        } else {
            QualityClass::Poor
        }
    }
}

/// Outcome of the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityClass {
    /// Meets the good cutoffs.
    Good,
    /// Usable, with a logged caveat.
    Acceptable,
    /// Rejected.
    Poor,
    /// Not measured.
    Unchecked,
}

impl QualityClass {
    /// Returns true unless the gate rejected the result.
    #[must_use]
    pub fn passes(&self) -> bool {
        !matches!(self, Self::Poor)
    }
}

impl fmt::Display for QualityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => write!(f, "good"),
            Self::Acceptable => write!(f, "acceptable"),
            Self::Poor => write!(f, "poor"),
            Self::Unchecked => write!(f, "unchecked"),
        }
    }
}

/// Similarity between a registered image and its target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Pearson correlation over the valid mask.
    pub correlation: f64,
    /// Mutual information in nats over the valid mask.
    pub mutual_information: f64,
    /// Voxels in the valid mask.
    pub voxels: usize,
}

fn masked_pairs(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Vec<(f64, f64)> {
    let mut pairs = Vec::new();
    Zip::from(a).and(b).for_each(|&x, &y| {
        if x.is_finite() && y.is_finite() && x > 0.0 && y > 0.0 {
            pairs.push((f64::from(x), f64::from(y)));
        }
    });
    pairs
}

/// Pearson correlation over voxels where both images are finite and positive.
///
/// Returns 0.0 when either side has no variance. Shapes must match.
#[must_use]
pub fn normalized_correlation(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f64 {
    correlation_of(&masked_pairs(a, b))
}

fn correlation_of(pairs: &[(f64, f64)]) -> f64 {
    if pairs.len() < 2 {
        return 0.0;
    }
    let n = pairs.len() as f64;
    let (sx, sy) = pairs.iter().fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
    let (mx, my) = (sx / n, sy / n);
    let (mut cov, mut vx, mut vy) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        let (dx, dy) = (x - mx, y - my);
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }
    let denom = (vx * vy).sqrt();
    if denom <= f64::EPSILON {
        0.0
    } else {
        cov / denom
    }
}

fn bin_index(value: f64, min: f64, max: f64, bins: usize) -> usize {
    if max <= min {
        return 0;
    }
    let idx = ((value - min) / (max - min) * bins as f64).floor();
    (idx.max(0.0) as usize).min(bins - 1)
}

/// Mutual information (natural log) from a `bins` x `bins` joint histogram
/// over voxels where both images are finite and positive.
#[must_use]
pub fn mutual_information(a: &ArrayD<f32>, b: &ArrayD<f32>, bins: usize) -> f64 {
    mutual_information_of(&masked_pairs(a, b), bins)
}

fn mutual_information_of(pairs: &[(f64, f64)], bins: usize) -> f64 {
    if pairs.is_empty() || bins == 0 {
        return 0.0;
    }
    let range = |sel: fn(&(f64, f64)) -> f64| {
        pairs
            .iter()
            .map(sel)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
    };
    let (min_x, max_x) = range(|p| p.0);
    let (min_y, max_y) = range(|p| p.1);

    let mut joint = vec![0u64; bins * bins];
    let mut px = vec![0u64; bins];
    let mut py = vec![0u64; bins];
    for (x, y) in pairs {
        let i = bin_index(*x, min_x, max_x, bins);
        let j = bin_index(*y, min_y, max_y, bins);
        joint[i * bins + j] += 1;
        px[i] += 1;
        py[j] += 1;
    }

    let n = pairs.len() as f64;
    let mut mi = 0.0;
    for i in 0..bins {
        for j in 0..bins {
            let c = joint[i * bins + j];
            if c == 0 {
                continue;
            }
            let pxy = c as f64 / n;
            let pxpy = (px[i] as f64 / n) * (py[j] as f64 / n);
            mi += pxy * (pxy / pxpy).ln();
        }
    }
    mi.max(0.0)
}

/// Computes both metrics; a shape mismatch is an error.
pub fn compute_metrics(fixed: &ArrayD<f32>, registered: &ArrayD<f32>) -> std::result::Result<QualityMetrics, String> {
    if fixed.shape() != registered.shape() {
        return Err(format!(
            "shape mismatch: registered {:?} vs fixed {:?}",
            registered.shape(),
            fixed.shape()
        ));
    }
    let pairs = masked_pairs(fixed, registered);
    Ok(QualityMetrics {
        correlation: correlation_of(&pairs),
        mutual_information: mutual_information_of(&pairs, MI_BINS),
        voxels: pairs.len(),
    })
}

/// Measures a registered image against its target.
#[cfg_attr(test, mockall::automock)]
pub trait QualityAssessor: Send + Sync {
    /// Fails unless `registered` lies on the same spatial grid as `fixed`.
    ///
    /// Runs for every attempt, including when quality metrics are skipped.
    fn check_shape(&self, fixed: &Path, registered: &Path) -> Result<()>;

    /// Computes metrics for `registered` against `fixed`.
    fn assess(&self, fixed: &Path, registered: &Path) -> Result<QualityMetrics>;
}

/// The first three dimensions of a header, padded with 1.
fn spatial_dims(header: &nifti::NiftiHeader) -> [usize; 3] {
    let mut dims = [1; 3];
    for (slot, d) in dims.iter_mut().zip(&header.dims) {
        *slot = *d;
    }
    dims
}

/// Assessor reading NIfTI volumes from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiQualityAssessor;

impl QualityAssessor for NiftiQualityAssessor {
    fn check_shape(&self, fixed: &Path, registered: &Path) -> Result<()> {
        let want = spatial_dims(&nifti::read_header(fixed)?);
        let got = spatial_dims(&nifti::read_header(registered)?);
        if want == got {
            Ok(())
        } else {
            Err(DtiflowError::volume(
                registered,
                format!("shape mismatch: registered {got:?} vs fixed {want:?}"),
            ))
        }
    }

    fn assess(&self, fixed: &Path, registered: &Path) -> Result<QualityMetrics> {
        let fixed_vol = nifti::first_volume(nifti::read_volume(fixed)?);
        let registered_vol = nifti::first_volume(nifti::read_volume(registered)?);
        compute_metrics(&fixed_vol, &registered_vol).map_err(|msg| DtiflowError::volume(registered, msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn, ShapeBuilder};

    fn metrics(correlation: f64, mutual_information: f64) -> QualityMetrics {
        QualityMetrics {
            correlation,
            mutual_information,
            voxels: 1000,
        }
    }

    fn volume(values: Vec<f32>) -> ArrayD<f32> {
        let n = values.len();
        Array::from_shape_vec(IxDyn(&[n, 1, 1]), values).unwrap()
    }

    #[test]
    fn test_gate_boundaries_inclusive() {
        let t = QualityThresholds::default();
        assert_eq!(t.classify(&metrics(0.80, 0.50)), QualityClass::Good);
        assert_eq!(t.classify(&metrics(0.79, 0.50)), QualityClass::Acceptable);
        assert_eq!(t.classify(&metrics(0.60, 0.30)), QualityClass::Acceptable);
        assert_eq!(t.classify(&metrics(0.59, 0.90)), QualityClass::Poor);
        assert_eq!(t.classify(&metrics(0.95, 0.29)), QualityClass::Poor);
    }

    #[test]
    fn test_quality_class_passes() {
        assert!(QualityClass::Good.passes());
        assert!(QualityClass::Acceptable.passes());
        assert!(QualityClass::Unchecked.passes());
        assert!(!QualityClass::Poor.passes());
    }

    #[test]
    fn test_thresholds_validate() {
        assert!(QualityThresholds::default().validate().is_ok());
        let inverted = QualityThresholds {
            acceptable_correlation: 0.9,
            ..QualityThresholds::default()
        };
        assert!(inverted.validate().is_err());
        let nan = QualityThresholds {
            good_mutual_information: f64::NAN,
            ..QualityThresholds::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_identical_images_score_high() {
        let a = volume((1..=200).map(|i| i as f32).collect());
        let m = compute_metrics(&a, &a).unwrap();
        assert!((m.correlation - 1.0).abs() < 1e-9);
        assert!(m.mutual_information > 3.0);
        assert_eq!(m.voxels, 200);
    }

    #[test]
    fn test_anticorrelated_images() {
        let a = volume((1..=100).map(|i| i as f32).collect());
        let b = volume((1..=100).rev().map(|i| i as f32).collect());
        assert!((normalized_correlation(&a, &b) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mask_excludes_zero_and_nonfinite() {
        let a = volume(vec![0.0, 1.0, 2.0, 3.0, f32::NAN]);
        let b = volume(vec![5.0, 1.0, 2.0, 3.0, 4.0]);
        let m = compute_metrics(&a, &b).unwrap();
        assert_eq!(m.voxels, 3);
        assert!((m.correlation - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_image_has_no_information() {
        let a = volume(vec![1.0; 50]);
        let b = volume((1..=50).map(|i| i as f32).collect());
        assert_eq!(normalized_correlation(&a, &b), 0.0);
        assert!(mutual_information(&a, &b, MI_BINS).abs() < 1e-12);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let a = volume(vec![1.0; 8]);
        let b = Array::from_shape_vec(IxDyn(&[2, 2, 2]), vec![1.0; 8]).unwrap();
        let err = compute_metrics(&a, &b).unwrap_err();
        assert!(err.contains("shape mismatch"));
    }

    #[test]
    fn test_nifti_assessor_reads_first_volume() {
        let dir = tempfile::tempdir().unwrap();
        let fixed = dir.path().join("t1.nii.gz");
        let moving = dir.path().join("b0_reg.nii.gz");
        let base: Vec<f32> = (1..=27).map(|i| i as f32).collect();
        let fixed_arr = Array::from_shape_vec(IxDyn(&[3, 3, 3]).f(), base.clone()).unwrap();
        nifti::write_volume(&fixed, &fixed_arr).unwrap();
        let mut four_d = base.clone();
        four_d.extend(base.iter().map(|v| 100.0 - v));
        // Fortran order puts volume 0 first, matching the fixed image voxel for voxel.
        let arr = Array::from_shape_vec(IxDyn(&[3, 3, 3, 2]).f(), four_d).unwrap();
        nifti::write_volume(&moving, &arr).unwrap();

        NiftiQualityAssessor.check_shape(&fixed, &moving).unwrap();
        let m = NiftiQualityAssessor.assess(&fixed, &moving).unwrap();
        assert!(m.correlation > 0.99);
    }

    #[test]
    fn test_nifti_shape_check_compares_spatial_grid() {
        let dir = tempfile::tempdir().unwrap();
        let fixed = dir.path().join("t1.nii.gz");
        let other = dir.path().join("wrong_grid.nii.gz");
        nifti::write_volume(&fixed, &ArrayD::zeros(IxDyn(&[3, 3, 3]))).unwrap();
        nifti::write_volume(&other, &ArrayD::zeros(IxDyn(&[3, 3, 2, 4]))).unwrap();

        let err = NiftiQualityAssessor.check_shape(&fixed, &other).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"), "{err}");
        assert!(NiftiQualityAssessor.check_shape(&fixed, &dir.path().join("absent.nii.gz")).is_err());
    }
}
