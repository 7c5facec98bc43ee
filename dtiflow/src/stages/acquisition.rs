//! Acquisition parameter files for distortion and eddy correction.

use crate::config::{EchoSpacing, PhaseEncoding};
use crate::errors::{DtiflowError, Result};
use crate::registration::nifti;
use std::fmt::Write as _;
use std::path::Path;

/// Number of phase-encode lines: the image extent along the PE axis.
pub fn pe_steps(dwi: &Path, pe: PhaseEncoding) -> Result<usize> {
    let header = nifti::read_header(dwi)?;
    header
        .dims
        .get(pe.axis())
        .copied()
        .ok_or_else(|| DtiflowError::volume(dwi, format!("no axis {} for {pe} encoding", pe.axis())))
}

/// `acqparams` text: one row for the acquired series and, when a synthetic
/// undistorted b0 is paired with it, a second row with zero readout time.
#[must_use]
pub fn acqparams(pe: PhaseEncoding, total_readout_time: f64, with_synthetic_b0: bool) -> String {
    let [x, y, z] = pe.acqparams_vector();
    let mut text = format!("{x} {y} {z} {total_readout_time:.6}\n");
    if with_synthetic_b0 {
        let _ = writeln!(text, "{x} {y} {z} 0.000000");
    }
    text
}

/// Writes `acqparams` for `dwi` and returns the total readout time.
pub fn write_acqparams(
    path: &Path,
    dwi: &Path,
    pe: PhaseEncoding,
    echo_spacing: EchoSpacing,
    with_synthetic_b0: bool,
) -> Result<f64> {
    let trt = echo_spacing.total_readout_time(pe_steps(dwi, pe)?);
    std::fs::write(path, acqparams(pe, trt, with_synthetic_b0))?;
    Ok(trt)
}

/// Eddy `index` text mapping every volume to acquisition row 1.
#[must_use]
pub fn index(volumes: usize) -> String {
    let mut text = vec!["1"; volumes].join(" ");
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_raw_subject, FIXTURE_SHAPE};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_acqparams_rows() {
        assert_eq!(acqparams(PhaseEncoding::AP, 0.0345, false), "0 -1 0 0.034500\n");
        assert_eq!(
            acqparams(PhaseEncoding::RL, 0.05, true),
            "1 0 0 0.050000\n1 0 0 0.000000\n"
        );
    }

    #[test]
    fn test_index_counts_volumes() {
        assert_eq!(index(4), "1 1 1 1\n");
    }

    #[test]
    fn test_write_acqparams_uses_pe_extent() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_raw_subject(dir.path(), "sub-001", false).unwrap();
        let dwi = raw.join("dwi/sub-001_dwi.nii.gz");
        let out = dir.path().join("acqparams.txt");
        let es = EchoSpacing::new(0.001).unwrap();

        let trt = write_acqparams(&out, &dwi, PhaseEncoding::AP, es, false).unwrap();

        let expected = 0.001 * (FIXTURE_SHAPE[1] - 1) as f64;
        assert!((trt - expected).abs() < 1e-12);
        assert!(std::fs::read_to_string(&out).unwrap().starts_with("0 -1 0 "));
    }
}
