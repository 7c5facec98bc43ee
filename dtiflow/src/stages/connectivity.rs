//! Anatomical reconstruction, tractography and the structural connectome.

use super::{Stage, StageContext, StageMetadata};
use crate::config::Tool;
use crate::core::StageId;
use crate::errors::{DtiflowError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

/// Streamlines requested from tractography.
pub const STREAMLINE_COUNT: u32 = 1_000_000;

const PARCELLATION: &str = "mri/aparc+aseg.mgz";

/// FreeSurfer + MRtrix connectome construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Connectivity;

impl Connectivity {
    fn connectome_name(ctx: &StageContext) -> String {
        format!("{}_connectome.csv", ctx.id())
    }

    fn fslgrad(ctx: &StageContext) -> Vec<String> {
        vec![
            "-fslgrad".to_string(),
            ctx.artifacts().rotated_bvecs().to_string_lossy().into_owned(),
            ctx.subject.raw_bval().to_string_lossy().into_owned(),
        ]
    }

    async fn reconstruct(ctx: &StageContext, subjects_dir: &Path) -> Result<PathBuf> {
        let parcellation = subjects_dir.join(ctx.id()).join(PARCELLATION);
        ctx.run(
            ctx.tool(Tool::ReconAll)
                .arg("-s")
                .arg(ctx.id())
                .arg("-i")
                .path_arg(&ctx.subject.raw_t1())
                .arg("-all")
                .arg("-sd")
                .path_arg(subjects_dir)
                .arg("-openmp")
                .arg(ctx.threads().to_string())
                .with_env("SUBJECTS_DIR", subjects_dir.to_string_lossy())
                .expect_output(&parcellation),
        )
        .await?;
        Ok(parcellation)
    }
}

#[async_trait]
impl Stage for Connectivity {
    fn id(&self) -> StageId {
        StageId::Connectivity
    }

    fn skip_reason(&self, ctx: &StageContext) -> Option<String> {
        if !ctx.config.toggles.connectivity {
            Some("disabled by --skip-connectivity".into())
        } else if !ctx.subject.has_t1() {
            Some("no T1 image".into())
        } else {
            None
        }
    }

    fn declared_outputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        vec![
            ctx.subject
                .large_dir()
                .join("freesurfer")
                .join(ctx.id())
                .join(PARCELLATION),
            ctx.subject.fast_dir().join("mrtrix3").join(Self::connectome_name(ctx)),
        ]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageMetadata> {
        let dir = ctx.ensure_dir(ctx.subject.stage_dir(self.id()))?;
        let a = ctx.artifacts();
        let subjects_dir = ctx.ensure_dir(a.freesurfer_dir())?;
        let dwi = a.corrected_dwi();
        if !dwi.is_file() {
            return Err(DtiflowError::precondition(format!(
                "{}: missing diffusion input {}",
                ctx.id(),
                dwi.display()
            )));
        }

        let parcellation = Self::reconstruct(ctx, &subjects_dir).await?;

        let five_tt = dir.join("5tt.nii.gz");
        ctx.run(
            ctx.tool(Tool::FiveTt)
                .arg("fsl")
                .path_arg(&ctx.subject.raw_t1())
                .path_arg(&five_tt)
                .with_nthreads(ctx.threads())
                .expect_output(&five_tt),
        )
        .await?;

        let response = dir.join("response_wm.txt");
        ctx.run(
            ctx.tool(Tool::Response)
                .arg("tournier")
                .path_arg(&dwi)
                .path_arg(&response)
                .args(Self::fslgrad(ctx))
                .with_nthreads(ctx.threads())
                .expect_output(&response),
        )
        .await?;

        let fod = dir.join("wm_fod.mif");
        ctx.run(
            ctx.tool(Tool::Fod)
                .arg("csd")
                .path_arg(&dwi)
                .path_arg(&response)
                .path_arg(&fod)
                .arg("-mask")
                .path_arg(&a.brain_mask())
                .args(Self::fslgrad(ctx))
                .with_nthreads(ctx.threads())
                .expect_output(&fod),
        )
        .await?;

        // Seed from the registered image when refinement produced one.
        let seeding = a.usable_registration().map(|record| record.output);
        let tracks = dir.join("tracks.tck");
        let mut tckgen = ctx
            .tool(Tool::Tckgen)
            .path_arg(&fod)
            .path_arg(&tracks)
            .arg("-act")
            .path_arg(&five_tt)
            .arg("-select")
            .arg(STREAMLINE_COUNT.to_string());
        tckgen = match &seeding {
            Some(image) => tckgen.arg("-seed_image").path_arg(image),
            None => tckgen.arg("-seed_dynamic").path_arg(&fod),
        };
        ctx.run(tckgen.with_nthreads(ctx.threads()).expect_output(&tracks)).await?;

        let export = ctx.ensure_dir(ctx.subject.export_dir("connectome"))?;
        let connectome = export.join(Self::connectome_name(ctx));
        ctx.run(
            ctx.tool(Tool::Connectome)
                .path_arg(&tracks)
                .path_arg(&parcellation)
                .path_arg(&connectome)
                .with_nthreads(ctx.threads())
                .expect_output(&connectome),
        )
        .await?;
        info!(subject = %ctx.id(), "Connectome built");

        ctx.migrate(
            &subjects_dir,
            &ctx.subject.large_dir().join("freesurfer"),
            "FreeSurfer reconstruction to large tier",
            &[PathBuf::from(ctx.id()).join(PARCELLATION)],
        )
        .await?;
        ctx.migrate(
            &export,
            &ctx.subject.fast_dir().join("mrtrix3"),
            "connectome to fast tier",
            &[PathBuf::from(Self::connectome_name(ctx))],
        )
        .await?;

        Ok(StageMetadata::from([
            ("seed".to_string(), json!(if seeding.is_some() { "image" } else { "dynamic" })),
            ("streamlines".to_string(), json!(STREAMLINE_COUNT)),
        ]))
    }
}
