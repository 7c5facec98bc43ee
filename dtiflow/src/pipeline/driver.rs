//! Sequential multi-subject driver.

use super::summary::{PlannedAction, RunSummary, SubjectPlan, SUMMARY_FILE_NAME};
use super::{run_subject, write_rejection_log, StageRunner, SubjectReport};
use crate::cancellation::{CancellationToken, CleanupRegistry};
use crate::checkpoint::CheckpointStore;
use crate::config::RunConfig;
use crate::errors::{DtiflowError, ResourceError, ResourceKind};
use crate::events::{EventSink, ProgressEvent};
use crate::locking::SubjectLockManager;
use crate::process::ToolRunner;
use crate::registration::{NiftiQualityAssessor, QualityAssessor, RegistrationSelector, ToolBackend};
use crate::resources::ResourceGuard;
use crate::stages::{pipeline_stages, Stage, StageContext};
use crate::storage::{utilization, StorageMigrator};
use crate::subject::Subject;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs every requested subject through the pipeline, one at a time.
pub struct PipelineDriver {
    config: Arc<RunConfig>,
    runner: Arc<dyn ToolRunner>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    cleanup: Arc<CleanupRegistry>,
    guard: ResourceGuard,
    assessor: Arc<dyn QualityAssessor>,
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("stages", &self.stages)
            .field("dry_run", &self.config.dry_run)
            .finish_non_exhaustive()
    }
}

impl PipelineDriver {
    /// Creates a driver with the system resource probe and the NIfTI quality assessor.
    #[must_use]
    pub fn new(
        config: Arc<RunConfig>,
        runner: Arc<dyn ToolRunner>,
        events: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            config,
            runner,
            events,
            cancel,
            cleanup: Arc::new(CleanupRegistry::new()),
            guard: ResourceGuard::default(),
            assessor: Arc::new(NiftiQualityAssessor),
            stages: pipeline_stages(),
        }
    }

    /// Uses a specific resource guard.
    #[must_use]
    pub fn with_resource_guard(mut self, guard: ResourceGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Registers scratch removal on a shared cleanup registry.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: Arc<CleanupRegistry>) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Uses a specific registration quality assessor.
    #[must_use]
    pub fn with_assessor(mut self, assessor: Arc<dyn QualityAssessor>) -> Self {
        self.assessor = assessor;
        self
    }

    /// Replaces the stage list.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<Arc<dyn Stage>>) -> Self {
        self.stages = stages;
        self
    }

    fn selector(&self) -> Arc<RegistrationSelector> {
        Arc::new(RegistrationSelector::new(
            ToolBackend::all(&self.runner, &self.config.tools),
            self.assessor.clone(),
            &self.config.registration,
            self.events.clone(),
        ))
    }

    fn stage_runner(&self) -> StageRunner {
        StageRunner::new(
            CheckpointStore::new(&self.config.paths.work_root),
            self.guard.clone(),
            self.config.resources.clone(),
            self.events.clone(),
            self.cancel.clone(),
        )
        .with_resume(self.config.resume)
    }

    fn context(&self, subject: Subject, selector: &Arc<RegistrationSelector>) -> StageContext {
        StageContext {
            subject,
            config: self.config.clone(),
            runner: self.runner.clone(),
            migrator: StorageMigrator::new(self.runner.clone(), self.config.migration_retry.clone()),
            selector: selector.clone(),
            events: self.events.clone(),
        }
    }

    /// Processes `subjects` in order and aggregates the result.
    ///
    /// One subject's failure never stops the others. Cancellation is checked
    /// between subjects; the summary is written to the work root unless this
    /// is a dry run.
    pub async fn run(&self, subjects: &[String]) -> RunSummary {
        let mut summary = RunSummary::start(self.config.dry_run);
        info!(
            run_id = %summary.run_id,
            subjects = subjects.len(),
            dry_run = self.config.dry_run,
            "Run started"
        );
        self.events
            .emit(ProgressEvent::info(
                None,
                format!("Run {} started with {} subject(s)", summary.run_id, subjects.len()),
            ))
            .await;

        let selector = self.selector();
        if self.config.dry_run {
            for id in subjects {
                summary.add_plan(self.plan_subject(id, &selector));
            }
        } else {
            let stage_runner = self.stage_runner();
            for id in subjects {
                if self.cancel.is_cancelled() {
                    warn!(subject = %id, "Run interrupted; remaining subjects not started");
                    summary.cancelled = true;
                    break;
                }
                let report = self.run_one(id, &stage_runner, &selector).await;
                summary.add_subject(report);
            }
        }

        summary.finish(utilization(&self.config.paths));
        self.report(&summary).await;
        summary
    }

    async fn run_one(&self, id: &str, stage_runner: &StageRunner, selector: &Arc<RegistrationSelector>) -> SubjectReport {
        let subject = Subject::new(id, &self.config.paths);
        if let Err(e) = subject.preflight() {
            let details = subject
                .raw_inputs()
                .iter()
                .map(|p| {
                    let state = if p.exists() { "present" } else { "missing" };
                    format!("checked {}: {state}", p.display())
                })
                .collect();
            return self.reject(&subject, e.to_string(), details).await;
        }

        let work_root = &self.config.paths.work_root;
        let min_gb = self.config.resources.subject_min_disk_gb;
        if !self.guard.check_disk(work_root, min_gb) {
            let free = self
                .guard
                .available_disk_gb(work_root)
                .map_or_else(|| "unknown".to_string(), |gb| format!("{gb:.1} GB"));
            let err = ResourceError::new(
                ResourceKind::Disk,
                id,
                format!("{} has less than {min_gb:.1} GB free", work_root.display()),
            );
            let details = vec![
                format!("path: {}", work_root.display()),
                format!("free: {free}"),
                format!("required: {min_gb:.1} GB"),
            ];
            return self.reject(&subject, err.to_string(), details).await;
        }

        let locks = SubjectLockManager::new(work_root);
        let _lock = match locks.acquire(id) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                let err = DtiflowError::Locked { subject: id.to_string() };
                let mut details = vec![format!("lock: {}", locks.lock_path(id).display())];
                if let Some(holder) = locks.holder(id) {
                    details.push(format!("holder pid: {}", holder.pid));
                    if let Some(host) = holder.host {
                        details.push(format!("holder host: {host}"));
                    }
                    details.push(format!("acquired at: {}", holder.acquired_at.to_rfc3339()));
                }
                return self.reject(&subject, err.to_string(), details).await;
            }
            Err(e) => {
                let details = vec![format!("lock: {}", locks.lock_path(id).display())];
                return self.reject(&subject, format!("cannot acquire lock: {e}"), details).await;
            }
        };

        let tmp = subject.tmp_dir();
        let cleanup_name = format!("tmp:{id}");
        self.cleanup.register_path_removal(&cleanup_name, &tmp);

        let ctx = self.context(subject, selector);
        let report = run_subject(stage_runner, &self.stages, &ctx, &self.cancel).await;

        if !report.cancelled {
            self.cleanup.unregister_by_name(&cleanup_name);
            if tmp.exists() {
                if let Err(e) = std::fs::remove_dir_all(&tmp) {
                    warn!(subject = %id, error = %e, "Failed to remove scratch directory");
                }
            }
        }

        let msg = format!("Subject finished: {}", report.state);
        let event = if report.is_success() {
            ProgressEvent::info(Some(id), msg)
        } else {
            ProgressEvent::error(Some(id), msg)
        };
        self.events.emit(event).await;
        report
    }

    async fn reject(&self, subject: &Subject, error: String, details: Vec<String>) -> SubjectReport {
        let id = subject.id();
        error!(subject = %id, error = %error, "Subject not started");
        self.events
            .emit(ProgressEvent::error(Some(id), format!("Subject not started: {error}")))
            .await;
        let report = SubjectReport::rejected(id, &error);
        match write_rejection_log(&subject.preflight_failure_log(), &error, &details) {
            Ok(path) => report.with_failure_log(path),
            Err(e) => {
                warn!(subject = %id, error = %e, "Failed to write rejection log");
                report
            }
        }
    }

    /// What a run would do for one subject, without side effects.
    fn plan_subject(&self, id: &str, selector: &Arc<RegistrationSelector>) -> SubjectPlan {
        let subject = Subject::new(id, &self.config.paths);
        if let Err(e) = subject.preflight() {
            warn!(subject = %id, error = %e, "Dry run: subject would be rejected");
            return SubjectPlan {
                subject: id.to_string(),
                error: Some(e.to_string()),
                stages: Vec::new(),
            };
        }

        let checkpoints = CheckpointStore::new(&self.config.paths.work_root);
        let ctx = self.context(subject, selector);
        let stages = self
            .stages
            .iter()
            .map(|stage| {
                let action = if self.config.resume && checkpoints.has(id, stage.id()) {
                    PlannedAction::Resume
                } else if let Some(reason) = stage.skip_reason(&ctx) {
                    PlannedAction::Skip(reason)
                } else {
                    PlannedAction::Run
                };
                info!(subject = %id, stage = %stage.id(), action = ?action, "Dry run plan");
                (stage.id(), action)
            })
            .collect();

        SubjectPlan {
            subject: id.to_string(),
            error: None,
            stages,
        }
    }

    async fn report(&self, summary: &RunSummary) {
        for (stage, counts) in &summary.stage_counts {
            info!(
                stage = %stage,
                completed = counts.completed,
                resumed = counts.resumed,
                skipped = counts.skipped,
                failed = counts.failed,
                "Stage totals"
            );
        }
        for tier in &summary.storage.tiers {
            info!(tier = %tier.tier, root = %tier.root.display(), bytes = tier.bytes, files = tier.files, "Storage utilization");
        }
        for failure in &summary.failures {
            let stage = failure.stage.map_or_else(|| "pre-flight".to_string(), |s| s.to_string());
            let log = failure
                .failure_log
                .as_ref()
                .map_or_else(|| "-".to_string(), |p| p.display().to_string());
            warn!(subject = %failure.subject, stage = %stage, log = %log, "{}", failure.error);
        }

        if !summary.dry_run {
            let path = self.config.paths.work_root.join(SUMMARY_FILE_NAME);
            if let Err(e) = summary.write(&path) {
                error!(path = %path.display(), error = %e, "Failed to write run summary");
            }
        }

        info!(
            run_id = %summary.run_id,
            succeeded = summary.success_count,
            failed = summary.failure_count,
            cancelled = summary.cancelled,
            "Run finished"
        );
        self.events
            .emit(ProgressEvent::info(
                None,
                format!(
                    "Run finished: {} succeeded, {} failed",
                    summary.success_count, summary.failure_count
                ),
            ))
            .await;
    }
}
