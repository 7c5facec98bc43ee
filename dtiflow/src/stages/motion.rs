//! Eddy-current and motion correction, and export of the preprocessed series.

use super::{acquisition, Stage, StageContext, StageMetadata};
use crate::config::Tool;
use crate::core::StageId;
use crate::errors::{DtiflowError, Result};
use crate::subject::read_bvals;
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

/// Runs eddy, using the synthetic field when distortion correction produced one.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotionCorrection;

impl MotionCorrection {
    fn exported_name(ctx: &StageContext) -> String {
        format!("{}_dwi_preproc.nii.gz", ctx.id())
    }
}

#[async_trait]
impl Stage for MotionCorrection {
    fn id(&self) -> StageId {
        StageId::MotionCorrection
    }

    fn declared_outputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        let a = ctx.artifacts();
        vec![
            a.corrected_dwi(),
            a.rotated_bvecs(),
            ctx.subject.fast_dir().join("dwi").join(Self::exported_name(ctx)),
        ]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageMetadata> {
        let dir = ctx.ensure_dir(ctx.subject.stage_dir(self.id()))?;
        let a = ctx.artifacts();
        let input = a.preprocessed_dwi();
        let mask = a.brain_mask();
        for required in [&input, &mask] {
            if !required.is_file() {
                return Err(DtiflowError::precondition(format!(
                    "{}: missing preprocessing output {}",
                    ctx.id(),
                    required.display()
                )));
            }
        }

        let with_field = a.has_synthetic_field();
        if !with_field {
            info!(subject = %ctx.id(), "No synthetic field; eddy runs without distortion correction");
        }

        let acq = dir.join("acqparams.txt");
        acquisition::write_acqparams(
            &acq,
            &ctx.subject.raw_dwi(),
            ctx.config.pe_direction,
            ctx.config.echo_spacing,
            with_field,
        )?;
        let volumes = read_bvals(&ctx.subject.raw_bval())?.len();
        let index = dir.join("index.txt");
        std::fs::write(&index, acquisition::index(volumes))?;

        let flag = |name: &str, path: &std::path::Path| format!("--{name}={}", path.display());
        let mut invocation = ctx
            .tool(Tool::Eddy)
            .arg(flag("imain", &input))
            .arg(flag("mask", &mask))
            .arg(flag("acqp", &acq))
            .arg(flag("index", &index))
            .arg(flag("bvecs", &ctx.subject.raw_bvec()))
            .arg(flag("bvals", &ctx.subject.raw_bval()))
            .arg(flag("out", &a.eddy_prefix()));
        if with_field {
            invocation = invocation.arg(flag("topup", &a.field_prefix()));
        }
        invocation = invocation
            .arg(format!("--nthreads={}", ctx.threads()))
            .expect_output(a.corrected_dwi())
            .expect_output(a.rotated_bvecs());
        ctx.run(invocation).await?;

        let export = ctx.ensure_dir(ctx.subject.export_dir("dwi"))?;
        let name = Self::exported_name(ctx);
        std::fs::copy(a.corrected_dwi(), export.join(&name))?;
        std::fs::copy(a.rotated_bvecs(), export.join(format!("{}_dwi_preproc.bvec", ctx.id())))?;
        std::fs::copy(ctx.subject.raw_bval(), export.join(format!("{}_dwi_preproc.bval", ctx.id())))?;
        ctx.migrate(
            &export,
            &ctx.subject.fast_dir().join("dwi"),
            "preprocessed diffusion to fast tier",
            &[PathBuf::from(name)],
        )
        .await?;

        Ok(StageMetadata::from([
            ("synthetic_field".to_string(), json!(with_field)),
            ("volumes".to_string(), json!(volumes)),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::context;
    use crate::stages::{BasicPreprocessing, DistortionCorrection};
    use crate::testing::{MockBehavior, RecordingToolRunner, TestWorkspace, FIXTURE_VOLUMES};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_eddy_without_field_and_export() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", false).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let ctx = context(&ws, ws.config(), runner.clone(), "sub-001");
        BasicPreprocessing.execute(&ctx).await.unwrap();

        let meta = MotionCorrection.execute(&ctx).await.unwrap();

        assert_eq!(meta["synthetic_field"], json!(false));
        assert_eq!(meta["volumes"], json!(FIXTURE_VOLUMES));
        let eddy = &runner.calls_for(Tool::Eddy)[0];
        assert!(!eddy.args.iter().any(|a| a.starts_with("--topup=")));
        let dir = ctx.subject.stage_dir(StageId::MotionCorrection);
        let index = std::fs::read_to_string(dir.join("index.txt")).unwrap();
        assert_eq!(index.split_whitespace().count(), FIXTURE_VOLUMES);
        assert_eq!(std::fs::read_to_string(dir.join("acqparams.txt")).unwrap().lines().count(), 1);
        for path in MotionCorrection.declared_outputs(&ctx) {
            assert!(path.exists(), "{}", path.display());
        }
        assert!(ws.paths.fast_tier_root.join("sub-001/dwi/sub-001_dwi_preproc.bval").exists());
    }

    #[tokio::test]
    async fn test_eddy_uses_synthetic_field() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", true).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let ctx = context(&ws, ws.config(), runner.clone(), "sub-001");
        DistortionCorrection.execute(&ctx).await.unwrap();
        BasicPreprocessing.execute(&ctx).await.unwrap();

        MotionCorrection.execute(&ctx).await.unwrap();

        let eddy = &runner.calls_for(Tool::Eddy)[0];
        assert!(eddy.args.iter().any(|a| a.starts_with("--topup=") && a.ends_with("topup")));
    }

    #[tokio::test]
    async fn test_failed_export_fails_stage() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", false).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        runner.script(Tool::Transfer, MockBehavior::fail(12, "rsync: disk full"));
        let ctx = context(&ws, ws.config(), runner.clone(), "sub-001");
        BasicPreprocessing.execute(&ctx).await.unwrap();

        let err = MotionCorrection.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, DtiflowError::Transfer(_)));
        assert!(ctx.subject.export_dir("dwi").join("sub-001_dwi_preproc.nii.gz").exists());
    }

    #[tokio::test]
    async fn test_requires_preprocessing_outputs() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", false).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let ctx = context(&ws, ws.config(), runner.clone(), "sub-001");

        let err = MotionCorrection.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, DtiflowError::Precondition(_)));
        assert_eq!(runner.call_count(), 0);
    }
}
