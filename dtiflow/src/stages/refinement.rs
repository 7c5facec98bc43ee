//! Post-hoc registration of the corrected diffusion series to the T1.

use super::{Stage, StageContext, StageMetadata};
use crate::core::StageId;
use crate::errors::{DtiflowError, Result};
use crate::registration::{run_traditional, RegistrationOutcome, RegistrationRecord, RegistrationRequest};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

/// Registers the eddy output to anatomy and persists the decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct Refinement;

#[async_trait]
impl Stage for Refinement {
    fn id(&self) -> StageId {
        StageId::Refinement
    }

    fn skip_reason(&self, ctx: &StageContext) -> Option<String> {
        (!ctx.subject.has_t1()).then(|| "no T1 image".to_string())
    }

    fn declared_outputs(&self, ctx: &StageContext) -> Vec<PathBuf> {
        vec![ctx.subject.registration_record(), ctx.artifacts().refined_dwi()]
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageMetadata> {
        ctx.ensure_dir(ctx.subject.stage_dir(self.id()))?;
        let a = ctx.artifacts();
        let moving = a.corrected_dwi();
        if !moving.is_file() {
            return Err(DtiflowError::precondition(format!(
                "{}: missing eddy output {}",
                ctx.id(),
                moving.display()
            )));
        }

        let registration = &ctx.config.registration;
        let request = RegistrationRequest {
            subject: ctx.id().to_string(),
            fixed: ctx.subject.raw_t1(),
            moving,
            output: a.refined_dwi(),
            quick: registration.quick,
            threads: ctx.threads(),
        };

        let (requested, outcome) = if registration.ml_enabled {
            let outcome = ctx.selector.select_and_apply(&request, registration.method).await?;
            (Some(registration.method), outcome)
        } else {
            let output = run_traditional(ctx.runner.as_ref(), &request).await?;
            (None, RegistrationOutcome::traditional(output))
        };

        RegistrationRecord::new(ctx.id(), requested, &outcome).save(&ctx.subject.registration_record())?;
        info!(
            subject = %ctx.id(),
            applied = %outcome.applied,
            quality = %outcome.quality,
            "Refinement registration recorded"
        );

        Ok(StageMetadata::from([
            ("applied".to_string(), json!(outcome.applied)),
            ("quality".to_string(), json!(outcome.quality)),
            ("registered".to_string(), json!(outcome.success)),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegistrationConfig, Tool, ToolLocations};
    use crate::registration::{AppliedMethod, QualityClass, RegistrationMethod, RequestedMethod};
    use crate::stages::test_support::context;
    use crate::testing::{MockBehavior, RecordingToolRunner, TestWorkspace};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn seed_eddy_output(ctx: &StageContext) {
        let path = ctx.artifacts().corrected_dwi();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::copy(ctx.subject.raw_dwi(), path).unwrap();
    }

    #[tokio::test]
    async fn test_traditional_route_when_ml_disabled() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", true).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let ctx = context(&ws, ws.config(), runner.clone(), "sub-001");
        seed_eddy_output(&ctx);

        Refinement.execute(&ctx).await.unwrap();

        let record = RegistrationRecord::load(&ctx.subject.registration_record()).unwrap();
        assert_eq!(record.applied, AppliedMethod::Traditional);
        assert_eq!(record.requested, None);
        assert_eq!(runner.count_for(Tool::Flirt), 1);
        assert_eq!(runner.count_for(Tool::Synthmorph), 0);
    }

    #[tokio::test]
    async fn test_ml_passthrough_is_recorded_not_fatal() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", true).unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        runner.script(Tool::Ants, MockBehavior::fail(1, "ants crashed"));
        let config = ws
            .config()
            .with_tools(
                ToolLocations::all_defaults()
                    .without_tool(Tool::Synthmorph)
                    .without_tool(Tool::Voxelmorph),
            )
            .with_registration(RegistrationConfig {
                ml_enabled: true,
                ..RegistrationConfig::default()
            });
        let ctx = context(&ws, config, runner.clone(), "sub-001");
        seed_eddy_output(&ctx);

        let meta = Refinement.execute(&ctx).await.unwrap();

        assert_eq!(meta["applied"], json!("passthrough"));
        let record = RegistrationRecord::load(&ctx.subject.registration_record()).unwrap();
        assert_eq!(record.requested, Some(RequestedMethod::Auto));
        assert_eq!(record.quality, QualityClass::Unchecked);
        assert!(!record.success);
        assert_eq!(record.attempts[0].method, RegistrationMethod::EnhancedClassical);
        assert!(ctx.artifacts().usable_registration().is_none());
    }

    #[tokio::test]
    async fn test_skipped_without_t1() {
        let ws = TestWorkspace::new().unwrap();
        ws.add_subject("sub-001", false).unwrap();
        let ctx = context(&ws, ws.config(), Arc::new(RecordingToolRunner::new()), "sub-001");
        assert!(Refinement.skip_reason(&ctx).is_some());
    }
}
