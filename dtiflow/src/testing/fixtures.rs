//! On-disk fixtures: raw subject trees and a throwaway set of tier roots.

use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::{PathsConfig, ResourceThresholds, RunConfig, ToolLocations};
use crate::errors::{DtiflowError, Result};
use crate::registration::nifti;
use crate::retry::RetryConfig;

/// Volumes in the synthetic DWI series: 32 diffusion directions.
pub const FIXTURE_VOLUMES: usize = 32;

/// b-value of every diffusion-weighted volume after the leading b0.
pub const FIXTURE_BVALUE: u32 = 1000;

/// Spatial shape of the synthetic DWI series.
pub const FIXTURE_SHAPE: [usize; 3] = [4, 4, 3];

fn synthetic_series(shape: &[usize]) -> Result<ArrayD<f32>> {
    let count: usize = shape.iter().product();
    #[allow(clippy::cast_precision_loss)]
    let values: Vec<f32> = (0..count).map(|i| 100.0 + (i % 97) as f32).collect();
    ArrayD::from_shape_vec(IxDyn(shape).f(), values)
        .map_err(|e| DtiflowError::precondition(e.to_string()))
}

/// Gradient table for `volumes` volumes: a b0 followed by unit directions
/// spread over the sphere on a Fibonacci spiral.
///
/// Returns the bval line and the three bvec rows.
#[must_use]
pub fn gradient_table(volumes: usize) -> (String, [String; 3]) {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    let mut bvals = Vec::with_capacity(volumes);
    let mut rows: [Vec<String>; 3] = Default::default();
    for i in 0..volumes {
        if i == 0 {
            bvals.push("0".to_string());
            for row in &mut rows {
                row.push("0".to_string());
            }
            continue;
        }
        #[allow(clippy::cast_precision_loss)]
        let (k, n) = (i as f64, volumes.saturating_sub(1).max(1) as f64);
        let z = 1.0 - 2.0 * (k - 0.5) / n;
        let r = (1.0 - z * z).max(0.0).sqrt();
        let theta = golden * k;
        bvals.push(FIXTURE_BVALUE.to_string());
        for (row, v) in rows.iter_mut().zip([r * theta.cos(), r * theta.sin(), z]) {
            row.push(format!("{v:.6}"));
        }
    }
    (bvals.join(" "), rows.map(|row| row.join(" ")))
}

/// Writes a bval/bvec pair for `volumes` volumes next to `dwi_dir`'s series.
pub fn write_gradients(dwi_dir: &Path, id: &str, volumes: usize) -> Result<()> {
    let (bvals, rows) = gradient_table(volumes);
    std::fs::write(dwi_dir.join(format!("{id}_dwi.bval")), format!("{bvals}\n"))?;
    std::fs::write(dwi_dir.join(format!("{id}_dwi.bvec")), format!("{}\n", rows.join("\n")))?;
    Ok(())
}

/// Writes `{input_root}/{id}/dwi/{id}_dwi.{nii.gz,bval,bvec}` and,
/// when `with_t1`, `{input_root}/{id}/anat/{id}_T1w.nii.gz`.
pub fn write_raw_subject(input_root: &Path, id: &str, with_t1: bool) -> Result<PathBuf> {
    let subject_dir = input_root.join(id);
    let dwi_dir = subject_dir.join("dwi");
    std::fs::create_dir_all(&dwi_dir)?;

    let [x, y, z] = FIXTURE_SHAPE;
    let dwi = synthetic_series(&[x, y, z, FIXTURE_VOLUMES])?;
    nifti::write_volume(&dwi_dir.join(format!("{id}_dwi.nii.gz")), &dwi)?;
    write_gradients(&dwi_dir, id, FIXTURE_VOLUMES)?;

    if with_t1 {
        let anat_dir = subject_dir.join("anat");
        std::fs::create_dir_all(&anat_dir)?;
        let t1 = synthetic_series(&FIXTURE_SHAPE)?;
        nifti::write_volume(&anat_dir.join(format!("{id}_T1w.nii.gz")), &t1)?;
    }
    Ok(subject_dir)
}

/// Input, work and tier roots inside one temporary directory.
#[derive(Debug)]
pub struct TestWorkspace {
    /// Owns the directory; dropped last.
    pub dir: TempDir,
    /// Roots under `dir`.
    pub paths: PathsConfig,
}

impl TestWorkspace {
    /// Creates empty `input`, `work`, `fast` and `large` roots.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        let paths = PathsConfig::new(
            root.join("input"),
            root.join("work"),
            root.join("fast"),
            root.join("large"),
        );
        for p in [
            &paths.input_root,
            &paths.work_root,
            &paths.fast_tier_root,
            &paths.large_tier_root,
        ] {
            std::fs::create_dir_all(p)?;
        }
        Ok(Self { dir, paths })
    }

    /// Adds a raw subject under the input root.
    pub fn add_subject(&self, id: &str, with_t1: bool) -> Result<PathBuf> {
        write_raw_subject(&self.paths.input_root, id, with_t1)
    }

    /// A run config over these roots: every tool resolved to its default
    /// name, no resource gates, millisecond migration retries, two threads.
    #[must_use]
    pub fn config(&self) -> RunConfig {
        RunConfig::new(self.paths.clone())
            .with_tools(ToolLocations::all_defaults())
            .with_resources(ResourceThresholds::none())
            .with_migration_retry(RetryConfig::new().with_max_attempts(3).with_base_delay_ms(1))
            .with_threads(2)
    }
}
