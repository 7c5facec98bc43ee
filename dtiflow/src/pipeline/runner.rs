//! Runs one stage for one subject under the stage's error contract.

use crate::cancellation::CancellationToken;
use crate::checkpoint::CheckpointStore;
use crate::config::ResourceThresholds;
use crate::core::{StageId, StageOutcome};
use crate::errors::{DtiflowError, Result, ToolError};
use crate::events::{EventSink, ProgressEvent};
use crate::observability::{stage_span, SpanTimer};
use crate::process::tail_lines;
use crate::resources::ResourceGuard;
use crate::stages::{Stage, StageContext, StageMetadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// Lines of captured output kept in a failure log.
pub const FAILURE_LOG_LINES: usize = 40;

/// Wraps stage execution with resume, skip, resource gating, timing,
/// output verification, failure logs and checkpointing.
#[derive(Clone)]
pub struct StageRunner {
    checkpoints: CheckpointStore,
    guard: ResourceGuard,
    thresholds: ResourceThresholds,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    resume: bool,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("checkpoints", &self.checkpoints)
            .field("resume", &self.resume)
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        checkpoints: CheckpointStore,
        guard: ResourceGuard,
        thresholds: ResourceThresholds,
        events: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            checkpoints,
            guard,
            thresholds,
            events,
            cancel,
            resume: true,
        }
    }

    /// Disables checkpoint-based resume (`--no-resume`).
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// The checkpoint store consulted for resume.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Returns true when the stage would be resumed rather than run.
    #[must_use]
    pub fn is_resumable(&self, subject: &str, stage: StageId) -> bool {
        self.resume && self.checkpoints.has(subject, stage)
    }

    /// Runs a stage and returns its definite outcome.
    pub async fn run_stage(&self, stage: &dyn Stage, ctx: &StageContext) -> StageOutcome {
        let id = stage.id();
        let subject = ctx.id();

        if self.is_resumable(subject, id) {
            let missing = missing_outputs(&stage.declared_outputs(ctx));
            if missing.is_empty() {
                info!(subject, stage = %id, "Checkpoint present; resuming past stage");
            } else {
                ctx.warn_event(format!(
                    "{id} is checkpointed but {} declared output(s) are missing, first: {}",
                    missing.len(),
                    missing[0].display()
                ));
            }
            return StageOutcome::resumed(id);
        }

        if let Some(reason) = stage.skip_reason(ctx) {
            info!(subject, stage = %id, reason = %reason, "Skipping stage");
            self.events
                .emit(ProgressEvent::info(Some(subject), format!("{id} skipped: {reason}")))
                .await;
            return StageOutcome::skipped(id, reason);
        }

        if let Err(e) = self
            .guard
            .gate_stage(id, ctx.subject.work_dir(), self.thresholds.for_stage(id))
        {
            return if id.contract().is_fatal() {
                error!(subject, stage = %id, error = %e, "Resource gate failed before fatal stage");
                self.events
                    .emit(ProgressEvent::error(Some(subject), format!("{id} not started: {e}")))
                    .await;
                StageOutcome::failed(id, e.to_string())
            } else {
                ctx.warn_event(format!("{id} skipped: {e}"));
                StageOutcome::skipped(id, format!("resource gate: {e}"))
            };
        }

        if self.cancel.is_cancelled() {
            return StageOutcome::failed(id, self.cancelled_message());
        }

        self.execute(stage, ctx).instrument(stage_span(subject, id)).await
    }

    async fn execute(&self, stage: &dyn Stage, ctx: &StageContext) -> StageOutcome {
        let id = stage.id();
        let subject = ctx.id();
        info!(subject, stage = %id, contract = %id.contract(), "Starting stage");

        let timer = SpanTimer::start(id.name());
        let result = tokio::select! {
            result = stage.execute(ctx) => result,
            () = self.cancel.cancelled() => Err(DtiflowError::Cancelled(self.cancelled_message())),
        };
        let result = result.and_then(|metadata| self.verify_and_record(stage, ctx, metadata));
        let duration = timer.finish();
        self.events.emit(ProgressEvent::timing(subject, id, duration)).await;

        match result {
            Ok(metadata) => {
                info!(subject, stage = %id, duration_s = format!("{duration:.1}"), "Stage completed");
                let mut outcome = StageOutcome::completed(id, duration);
                outcome.metadata = metadata;
                outcome
            }
            Err(e) => self.fail(id, ctx, &e, duration).await,
        }
    }

    fn verify_and_record(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext,
        metadata: StageMetadata,
    ) -> Result<StageMetadata> {
        if let Some(path) = missing_outputs(&stage.declared_outputs(ctx)).into_iter().next() {
            return Err(ToolError::missing_output(stage.id().name(), path).into());
        }
        self.checkpoints.record(ctx.id(), stage.id())?;
        Ok(metadata)
    }

    async fn fail(&self, id: StageId, ctx: &StageContext, err: &DtiflowError, duration: f64) -> StageOutcome {
        let subject = ctx.id();
        let mut outcome = StageOutcome::failed(id, err.to_string()).with_duration(duration);
        if err.is_cancelled() {
            warn!(subject, stage = %id, "Stage interrupted");
            return outcome;
        }

        match write_failure_log(&ctx.subject.failure_log(id), err) {
            Ok(path) => outcome = outcome.with_failure_log(path),
            Err(e) => warn!(subject, stage = %id, error = %e, "Could not write failure log"),
        }

        let msg = format!("{id} failed ({}): {err}", id.contract());
        if id.contract().is_fatal() {
            error!(subject, stage = %id, error = %err, "Fatal stage failed; halting subject");
            self.events.emit(ProgressEvent::error(Some(subject), msg)).await;
        } else {
            warn!(subject, stage = %id, error = %err, "Advisory stage failed; continuing");
            self.events.emit(ProgressEvent::warn(Some(subject), msg)).await;
        }
        outcome
    }

    fn cancelled_message(&self) -> String {
        self.cancel.reason().unwrap_or_else(|| "interrupted".to_string())
    }
}

/// Declared outputs that do not exist.
#[must_use]
pub fn missing_outputs(declared: &[PathBuf]) -> Vec<PathBuf> {
    declared.iter().filter(|p| !p.exists()).cloned().collect()
}

/// Writes the tail of the captured output (or the error itself) to `path`.
pub fn write_failure_log(path: &Path, err: &DtiflowError) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = match err.captured_output() {
        Some(output) if !output.trim().is_empty() => tail_lines(output, FAILURE_LOG_LINES),
        _ => format!("{err}\n"),
    };
    std::fs::write(path, body)?;
    debug!(path = %path.display(), "Wrote failure log");
    Ok(path.to_path_buf())
}

/// Writes why a subject was rejected before its first stage, with the
/// measurements behind the decision.
pub fn write_rejection_log(path: &Path, error: &str, details: &[String]) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = format!("{error}\n");
    for line in details {
        body.push_str(line);
        body.push('\n');
    }
    std::fs::write(path, body)?;
    debug!(path = %path.display(), "Wrote rejection log");
    Ok(path.to_path_buf())
}
