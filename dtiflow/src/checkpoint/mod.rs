//! Append-only per-subject checkpoint store.
//!
//! Each completed stage appends one `TOKEN\tRFC3339` line to
//! `{work_root}/{subject}/checkpoints.log`. A line is written with a single
//! `write_all` on an append handle and synced, so a crash leaves either the
//! complete line or a torn tail that readers ignore. Presence of a token is
//! proof of completion; absence only means "not confirmed done".

use crate::core::StageId;
use crate::errors::{DtiflowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the checkpoint log inside a subject's working directory.
pub const CHECKPOINT_FILE_NAME: &str = "checkpoints.log";

/// One recorded completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// The completed stage.
    pub stage: StageId,
    /// When completion was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Durable completion markers for every subject under a working root.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    work_root: PathBuf,
}

impl CheckpointStore {
    /// Creates a store rooted at `work_root`.
    #[must_use]
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }

    /// Path of a subject's checkpoint log.
    #[must_use]
    pub fn path(&self, subject: &str) -> PathBuf {
        self.work_root.join(subject).join(CHECKPOINT_FILE_NAME)
    }

    /// Appends a completion marker for `stage`.
    pub fn record(&self, subject: &str, stage: StageId) -> Result<()> {
        append_line(&self.path(subject), stage).map_err(|source| DtiflowError::Checkpoint {
            subject: subject.to_string(),
            source,
        })?;
        debug!(subject, stage = %stage, "Recorded checkpoint");
        Ok(())
    }

    /// Returns true if `stage` has been recorded for `subject`.
    #[must_use]
    pub fn has(&self, subject: &str, stage: StageId) -> bool {
        self.completed(subject).iter().any(|e| e.stage == stage)
    }

    /// All recorded completions, in write order.
    ///
    /// Unreadable files yield an empty list; malformed lines are skipped.
    #[must_use]
    pub fn completed(&self, subject: &str) -> Vec<CheckpointEntry> {
        read_entries(&self.path(subject))
    }
}

fn append_line(path: &Path, stage: StageId) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = format!("{}\t{}\n", stage.checkpoint_token(), Utc::now().to_rfc3339());
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.sync_data()
}

fn read_entries(path: &Path) -> Vec<CheckpointEntry> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let (token, ts) = line.split_once('\t')?;
            let stage = StageId::from_checkpoint_token(token.trim())?;
            let recorded_at = DateTime::parse_from_rfc3339(ts.trim()).ok()?.with_timezone(&Utc);
            Some(CheckpointEntry { stage, recorded_at })
        })
        .collect()
}
