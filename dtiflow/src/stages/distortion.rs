//! Susceptibility distortion estimation from a synthetic undistorted b0.

use super::{acquisition, Stage, StageContext, StageMetadata};
use crate::config::Tool;
use crate::core::StageId;
use crate::errors::Result;
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

/// Runs synb0 to produce a field that eddy can consume.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistortionCorrection;

#[async_trait]
impl Stage for DistortionCorrection {
    fn id(&self) -> StageId {
        StageId::DistortionCorrection
    }

    fn skip_reason(&self, ctx: &StageContext) -> Option<String> {
        if !ctx.config.toggles.distortion_correction {
            Some("disabled by --skip-distortion-correction".into())
        } else if !ctx.subject.has_t1() {
            Some("no T1 image".into())
        } else if !ctx.has_tool(Tool::Synb0) {
            Some("synb0 not available".into())
        } else {
            None
        }
    }

    fn declared_outputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        let a = ctx.artifacts();
        vec![a.field_coefficients(), a.field_movpar()]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageMetadata> {
        let dir = ctx.ensure_dir(ctx.subject.stage_dir(self.id()))?;
        let a = ctx.artifacts();
        let acq = dir.join("acqparams.txt");
        let trt = acquisition::write_acqparams(
            &acq,
            &ctx.subject.raw_dwi(),
            ctx.config.pe_direction,
            ctx.config.echo_spacing,
            true,
        )?;

        let invocation = ctx
            .tool(Tool::Synb0)
            .arg("--dwi")
            .path_arg(&ctx.subject.raw_dwi())
            .arg("--t1")
            .path_arg(&ctx.subject.raw_t1())
            .arg("--acqparams")
            .path_arg(&acq)
            .arg("--out")
            .path_arg(&a.field_prefix())
            .arg("--threads")
            .arg(ctx.threads().to_string())
            .expect_output(a.field_coefficients())
            .expect_output(a.field_movpar());
        ctx.run(invocation).await?;

        info!(subject = %ctx.id(), total_readout_time = trt, "Synthetic field estimated");
        Ok(StageMetadata::from([("total_readout_time".to_string(), json!(trt))]))
    }
}
