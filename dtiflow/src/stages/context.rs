//! Everything a stage needs to do its work for one subject.

use super::Artifacts;
use crate::config::{RunConfig, Tool};
use crate::errors::{DtiflowError, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::process::{ToolInvocation, ToolOutput, ToolRunner};
use crate::registration::RegistrationSelector;
use crate::storage::StorageMigrator;
use crate::subject::Subject;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Per-subject execution context shared by all stages.
#[derive(Clone)]
pub struct StageContext {
    /// The subject being processed.
    pub subject: Subject,
    /// Run configuration.
    pub config: Arc<RunConfig>,
    /// External tool seam.
    pub runner: Arc<dyn ToolRunner>,
    /// Tier migration.
    pub migrator: StorageMigrator,
    /// Registration strategy selection.
    pub selector: Arc<RegistrationSelector>,
    /// Progress events.
    pub events: Arc<dyn EventSink>,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("subject", &self.subject.id())
            .finish_non_exhaustive()
    }
}

impl StageContext {
    /// Subject ID.
    #[must_use]
    pub fn id(&self) -> &str {
        self.subject.id()
    }

    /// Inter-stage file locations.
    #[must_use]
    pub fn artifacts(&self) -> Artifacts<'_> {
        Artifacts::new(&self.subject)
    }

    /// Thread-count hint.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.config.threads
    }

    /// Returns true when `tool` resolved at startup.
    #[must_use]
    pub fn has_tool(&self, tool: Tool) -> bool {
        self.config.tools.is_available(tool)
    }

    /// A new invocation of `tool` tagged with this subject.
    #[must_use]
    pub fn tool(&self, tool: Tool) -> ToolInvocation {
        ToolInvocation::new(tool).for_subject(self.id())
    }

    /// Runs an invocation through the tool runner.
    pub async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput> {
        self.runner.run(&invocation).await
    }

    /// Creates a directory and returns it.
    pub fn ensure_dir(&self, dir: PathBuf) -> Result<PathBuf> {
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Migrates a staged directory to a durable tier; failure is an error.
    pub async fn migrate(&self, source: &Path, dest: &Path, description: &str, critical: &[PathBuf]) -> Result<()> {
        if self.migrator.migrate(source, dest, description, critical).await {
            Ok(())
        } else {
            Err(DtiflowError::Transfer(format!(
                "{}: {description} did not verify at {}",
                self.id(),
                dest.display()
            )))
        }
    }

    /// Logs a degraded-but-continuing condition and records it as an event.
    pub fn warn_event(&self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!(subject = %self.id(), "{msg}");
        self.events.try_emit(&ProgressEvent::warn(Some(self.id()), msg));
    }
}
