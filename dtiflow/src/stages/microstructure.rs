//! Tensor metric maps and optional NODDI fitting.

use super::{Stage, StageContext, StageMetadata};
use crate::config::Tool;
use crate::core::StageId;
use crate::errors::{DtiflowError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;

/// Tensor fit, FA/MD maps and, when available, NODDI.
#[derive(Debug, Clone, Copy, Default)]
pub struct Microstructure;

impl Microstructure {
    fn map_name(ctx: &StageContext, metric: &str) -> String {
        format!("{}_{metric}.nii.gz", ctx.id())
    }

    async fn fit_noddi(ctx: &StageContext, dwi: &std::path::Path) -> Result<Option<PathBuf>> {
        if !ctx.has_tool(Tool::Noddi) {
            return Ok(None);
        }
        let export = ctx.ensure_dir(ctx.subject.export_dir("noddi"))?;
        let ndi = export.join(Self::map_name(ctx, "ndi"));
        let odi = export.join(Self::map_name(ctx, "odi"));
        let invocation = ctx
            .tool(Tool::Noddi)
            .arg("--dwi")
            .path_arg(dwi)
            .arg("--bval")
            .path_arg(&ctx.subject.raw_bval())
            .arg("--bvec")
            .path_arg(&ctx.artifacts().rotated_bvecs())
            .arg("--mask")
            .path_arg(&ctx.artifacts().brain_mask())
            .arg("--out")
            .path_arg(&export)
            .arg("--prefix")
            .arg(ctx.id())
            .expect_output(&ndi)
            .expect_output(&odi);

        match ctx.run(invocation).await {
            Ok(_) => Ok(Some(export)),
            Err(e @ DtiflowError::Cancelled(_)) => Err(e),
            Err(e) => {
                ctx.warn_event(format!("NODDI fitting failed ({e}); tensor maps only"));
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Stage for Microstructure {
    fn id(&self) -> StageId {
        StageId::Microstructure
    }

    fn declared_outputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        let mrtrix = ctx.subject.fast_dir().join("mrtrix3");
        vec![
            mrtrix.join(Self::map_name(ctx, "fa")),
            mrtrix.join(Self::map_name(ctx, "md")),
        ]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageMetadata> {
        let dir = ctx.ensure_dir(ctx.subject.stage_dir(self.id()))?;
        let a = ctx.artifacts();
        let dwi = a.corrected_dwi();
        if !dwi.is_file() {
            return Err(DtiflowError::precondition(format!(
                "{}: missing diffusion input {}",
                ctx.id(),
                dwi.display()
            )));
        }

        let tensor = dir.join("tensor.nii.gz");
        ctx.run(
            ctx.tool(Tool::Tensor)
                .path_arg(&dwi)
                .path_arg(&tensor)
                .arg("-mask")
                .path_arg(&a.brain_mask())
                .arg("-fslgrad")
                .path_arg(&a.rotated_bvecs())
                .path_arg(&ctx.subject.raw_bval())
                .with_nthreads(ctx.threads())
                .expect_output(&tensor),
        )
        .await?;

        let export = ctx.ensure_dir(ctx.subject.export_dir("mrtrix3"))?;
        let fa = export.join(Self::map_name(ctx, "fa"));
        let md = export.join(Self::map_name(ctx, "md"));
        ctx.run(
            ctx.tool(Tool::TensorMetric)
                .path_arg(&tensor)
                .arg("-fa")
                .path_arg(&fa)
                .arg("-adc")
                .path_arg(&md)
                .with_nthreads(ctx.threads())
                .expect_output(&fa)
                .expect_output(&md),
        )
        .await?;

        let noddi = Self::fit_noddi(ctx, &dwi).await?;

        ctx.migrate(
            &export,
            &ctx.subject.fast_dir().join("mrtrix3"),
            "tensor metrics to fast tier",
            &[
                PathBuf::from(Self::map_name(ctx, "fa")),
                PathBuf::from(Self::map_name(ctx, "md")),
            ],
        )
        .await?;
        if let Some(noddi_dir) = &noddi {
            ctx.migrate(
                noddi_dir,
                &ctx.subject.fast_dir().join("noddi"),
                "NODDI maps to fast tier",
                &[PathBuf::from(Self::map_name(ctx, "ndi"))],
            )
            .await?;
        }

        Ok(StageMetadata::from([("noddi".to_string(), json!(noddi.is_some()))]))
    }
}
