//! dtiflow command-line entry point.

use anyhow::{Context, Result};
use clap::Parser;
use dtiflow::cancellation::{CancellationToken, CleanupRegistry};
use dtiflow::cli::{is_startup_error, select_subjects, Cli};
use dtiflow::config::{RunConfig, Tool};
use dtiflow::events::{EventSink, FanoutEventSink, JsonlEventSink, LoggingEventSink, ProgressEvent};
use dtiflow::observability::init_logging;
use dtiflow::pipeline::{PipelineDriver, EXIT_INTERRUPTED, EXIT_INVALID};
use dtiflow::process::{SubprocessRunner, ToolRunner};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Budget for interrupt cleanup callbacks.
const CLEANUP_TIMEOUT_SECS: f64 = 10.0;

/// How long the driver gets to record an interrupted subject after cleanup.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from),
        Err(e) => {
            error!(error = %format!("{e:#}"), "dtiflow aborted");
            eprintln!("dtiflow: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let log_file = cli.log_file();
    let _log_guard = match init_logging(cli.log_level.as_deref(), log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            if let Some(path) = &log_file {
                eprintln!("dtiflow: cannot write {}: {e}; logging to stderr only", path.display());
            }
            init_logging(cli.log_level.as_deref(), None)?
        }
    };

    let config = match cli.to_config() {
        Ok(config) => config,
        Err(e) => {
            if is_startup_error(&e) {
                error!(error = %e, "Invalid configuration");
            } else {
                error!(error = %e, "Configuration could not be resolved");
            }
            return Ok(EXIT_INVALID);
        }
    };
    let subjects = match select_subjects(&config) {
        Ok(subjects) => subjects,
        Err(e) => {
            error!(error = %e, "No subjects to process");
            return Ok(EXIT_INVALID);
        }
    };
    info!(subjects = ?subjects, "Subjects selected");

    let config = Arc::new(config);
    let cancel = Arc::new(CancellationToken::new());
    let cleanup = Arc::new(CleanupRegistry::new());
    register_kill_patterns(&config, &cleanup);

    let events: Arc<dyn EventSink> = if config.dry_run {
        Arc::new(LoggingEventSink::debug())
    } else {
        let event_log = config.paths.event_log_path();
        let jsonl = JsonlEventSink::open(&event_log)
            .with_context(|| format!("opening event log {}", event_log.display()))?;
        Arc::new(FanoutEventSink::new(vec![
            Arc::new(jsonl) as Arc<dyn EventSink>,
            Arc::new(LoggingEventSink::debug()),
        ]))
    };

    let runner: Arc<dyn ToolRunner> = Arc::new(SubprocessRunner::new(
        config.tools.clone(),
        config.threads,
        cancel.clone(),
    ));
    let driver = PipelineDriver::new(config.clone(), runner, events.clone(), cancel.clone())
        .with_cleanup(cleanup.clone());

    let run = driver.run(&subjects);
    tokio::pin!(run);
    let summary = tokio::select! {
        summary = &mut run => summary,
        () = interrupted() => {
            warn!("Interrupt received; stopping after cleanup");
            events.try_emit(&ProgressEvent::warn(None, "Interrupted by operator"));
            cancel.cancel("operator interrupt");
            for (name, message) in cleanup.run_all(CLEANUP_TIMEOUT_SECS).await {
                warn!(callback = %name, error = %message, "Cleanup step failed");
            }
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut run).await {
                Ok(summary) => info!(failed = summary.failure_count, "Interrupted run recorded"),
                Err(_) => warn!("Driver did not stop in time; run summary not written"),
            }
            return Ok(EXIT_INTERRUPTED);
        }
    };

    Ok(summary.exit_code())
}

/// Completes on Ctrl-C; never completes if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
}

/// Long-running tools may leave grandchildren behind a killed wrapper.
fn register_kill_patterns(config: &RunConfig, cleanup: &CleanupRegistry) {
    let Some(kill) = config.tools.get(Tool::Kill) else {
        warn!("No process killer available; interrupted tools may outlive the run");
        return;
    };
    for tool in Tool::ALL.into_iter().filter(Tool::is_long_running) {
        if let Some(exe) = config.tools.get(tool) {
            cleanup.register_kill_pattern(kill, exe.display().to_string());
        }
    }
}
