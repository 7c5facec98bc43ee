//! Denoising, Gibbs-ringing removal, bias correction and brain masking.

use super::{Stage, StageContext, StageMetadata};
use crate::config::Tool;
use crate::core::StageId;
use crate::errors::{DtiflowError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Basic preprocessing of the raw diffusion series.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicPreprocessing;

impl BasicPreprocessing {
    fn fslgrad(ctx: &StageContext) -> [String; 3] {
        [
            "-fslgrad".to_string(),
            ctx.subject.raw_bvec().to_string_lossy().into_owned(),
            ctx.subject.raw_bval().to_string_lossy().into_owned(),
        ]
    }

    /// Bias correction falls back to its input on timeout or failure.
    async fn bias_correct(ctx: &StageContext, input: &Path, output: &Path) -> Result<bool> {
        if !ctx.has_tool(Tool::BiasCorrect) {
            ctx.warn_event("Bias correction unavailable; using uncorrected image");
            std::fs::copy(input, output)?;
            return Ok(false);
        }

        let invocation = ctx
            .tool(Tool::BiasCorrect)
            .arg("ants")
            .path_arg(input)
            .path_arg(output)
            .args(Self::fslgrad(ctx))
            .with_nthreads(ctx.threads())
            .with_timeout(Duration::from_secs(ctx.config.bias_correct_timeout_secs))
            .expect_output(output);

        match ctx.run(invocation).await {
            Ok(_) => Ok(true),
            Err(e @ DtiflowError::Cancelled(_)) => Err(e),
            Err(e) => {
                ctx.warn_event(format!("Bias correction failed ({e}); using uncorrected image"));
                std::fs::copy(input, output)?;
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Stage for BasicPreprocessing {
    fn id(&self) -> StageId {
        StageId::BasicPreprocessing
    }

    fn declared_outputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        let a = ctx.artifacts();
        vec![a.preprocessed_dwi(), a.brain_mask()]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageMetadata> {
        let dir = ctx.ensure_dir(ctx.subject.stage_dir(self.id()))?;
        let a = ctx.artifacts();

        let denoised = dir.join("dwi_denoised.nii.gz");
        ctx.run(
            ctx.tool(Tool::Denoise)
                .path_arg(&ctx.subject.raw_dwi())
                .path_arg(&denoised)
                .arg("-noise")
                .path_arg(&dir.join("noise.nii.gz"))
                .with_nthreads(ctx.threads())
                .expect_output(&denoised),
        )
        .await?;

        let mut current = denoised;
        let degibbs = ctx.has_tool(Tool::Degibbs);
        if degibbs {
            let unrung = dir.join("dwi_degibbs.nii.gz");
            ctx.run(
                ctx.tool(Tool::Degibbs)
                    .path_arg(&current)
                    .path_arg(&unrung)
                    .with_nthreads(ctx.threads())
                    .expect_output(&unrung),
            )
            .await?;
            current = unrung;
        } else {
            info!(subject = %ctx.id(), "Gibbs ringing removal unavailable; skipping");
        }

        let corrected = a.preprocessed_dwi();
        let bias_corrected = Self::bias_correct(ctx, &current, &corrected).await?;

        let mask = a.brain_mask();
        ctx.run(
            ctx.tool(Tool::Mask)
                .path_arg(&corrected)
                .path_arg(&mask)
                .args(Self::fslgrad(ctx))
                .with_nthreads(ctx.threads())
                .expect_output(&mask),
        )
        .await?;

        Ok(StageMetadata::from([
            ("degibbs".to_string(), json!(degibbs)),
            ("bias_corrected".to_string(), json!(bias_corrected)),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolLocations;
    use crate::stages::test_support::context;
    use crate::testing::{MockBehavior, RecordingToolRunner, TestWorkspace};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_full_chain_in_order() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", false).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let ctx = context(&ws, ws.config(), runner.clone(), "sub-001");

        let meta = BasicPreprocessing.execute(&ctx).await.unwrap();

        let tools: Vec<Tool> = runner.calls().iter().map(|c| c.tool).collect();
        assert_eq!(tools, vec![Tool::Denoise, Tool::Degibbs, Tool::BiasCorrect, Tool::Mask]);
        assert_eq!(meta["bias_corrected"], json!(true));
        let bias = &runner.calls_for(Tool::BiasCorrect)[0];
        assert_eq!(bias.timeout, Some(Duration::from_secs(1800)));
    }

    #[tokio::test]
    async fn test_bias_timeout_falls_back_to_input() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", false).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        runner.script(Tool::BiasCorrect, MockBehavior::TimeOut);
        let ctx = context(&ws, ws.config(), runner.clone(), "sub-001");

        let meta = BasicPreprocessing.execute(&ctx).await.unwrap();

        assert_eq!(meta["bias_corrected"], json!(false));
        let a = ctx.artifacts();
        let degibbs = ctx.subject.stage_dir(StageId::BasicPreprocessing).join("dwi_degibbs.nii.gz");
        assert_eq!(
            std::fs::read(a.preprocessed_dwi()).unwrap(),
            std::fs::read(degibbs).unwrap()
        );
        assert_eq!(runner.count_for(Tool::Mask), 1);
    }

    #[tokio::test]
    async fn test_missing_degibbs_is_skipped() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", false).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let config = ws
            .config()
            .with_tools(ToolLocations::all_defaults().without_tool(Tool::Degibbs));
        let ctx = context(&ws, config, runner.clone(), "sub-001");

        let meta = BasicPreprocessing.execute(&ctx).await.unwrap();
        assert_eq!(meta["degibbs"], json!(false));
        assert_eq!(runner.count_for(Tool::Degibbs), 0);
    }

    #[tokio::test]
    async fn test_denoise_failure_propagates() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", false).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        runner.script(Tool::Denoise, MockBehavior::fail(1, "corrupt header"));
        let ctx = context(&ws, ws.config(), runner.clone(), "sub-001");

        let err = BasicPreprocessing.execute(&ctx).await.unwrap_err();
        assert_eq!(err.captured_output(), Some("corrupt header"));
        assert_eq!(runner.count_for(Tool::Mask), 0);
    }
}
