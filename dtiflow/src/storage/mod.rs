//! Storage tiers and verified migration between them.
//!
//! Stage deliverables are staged under the working tier and moved to a
//! durable tier with `rsync`. A migration only counts once every critical
//! file is present at the destination; until then the working copy stays.

use crate::config::{PathsConfig, Tool};
use crate::errors::DtiflowError;
use crate::process::{ToolInvocation, ToolRunner};
use crate::retry::{with_retry, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// A storage location class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// Ephemeral scratch area.
    Working,
    /// Durable, frequently read outputs.
    Fast,
    /// Durable, large reconstruction outputs.
    Large,
}

impl StorageTier {
    /// Every tier.
    pub const ALL: [Self; 3] = [Self::Working, Self::Fast, Self::Large];

    /// Root directory of this tier.
    #[must_use]
    pub fn root<'a>(&self, paths: &'a PathsConfig) -> &'a Path {
        match self {
            Self::Working => &paths.work_root,
            Self::Fast => &paths.fast_tier_root,
            Self::Large => &paths.large_tier_root,
        }
    }

    /// Returns true for tiers that hold the source of truth.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::Working)
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Working => write!(f, "working"),
            Self::Fast => write!(f, "fast"),
            Self::Large => write!(f, "large"),
        }
    }
}

/// Byte and file totals for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierUsage {
    /// The tier.
    pub tier: StorageTier,
    /// Its root directory.
    pub root: PathBuf,
    /// Total size of regular files.
    pub bytes: u64,
    /// Number of regular files.
    pub files: u64,
}

/// Utilization of every tier at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageReport {
    /// Per-tier totals.
    pub tiers: Vec<TierUsage>,
}

impl StorageReport {
    /// Usage of one tier.
    #[must_use]
    pub fn tier(&self, tier: StorageTier) -> Option<&TierUsage> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}

/// Walks a directory tree and totals regular files.
#[must_use]
pub fn directory_usage(root: &Path) -> (u64, u64) {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(bytes, files), entry| {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (bytes + len, files + 1)
        })
}

/// Measures every tier.
#[must_use]
pub fn utilization(paths: &PathsConfig) -> StorageReport {
    let tiers = StorageTier::ALL
        .into_iter()
        .map(|tier| {
            let root = tier.root(paths).to_path_buf();
            let (bytes, files) = directory_usage(&root);
            TierUsage {
                tier,
                root,
                bytes,
                files,
            }
        })
        .collect();
    StorageReport { tiers }
}

/// Moves directories between tiers with bounded retry and verification.
#[derive(Clone)]
pub struct StorageMigrator {
    runner: Arc<dyn ToolRunner>,
    retry: RetryConfig,
}

impl fmt::Debug for StorageMigrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageMigrator")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl StorageMigrator {
    /// Creates a migrator that transfers through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn ToolRunner>, retry: RetryConfig) -> Self {
        Self { runner, retry }
    }

    fn transfer_invocation(source: &Path, dest: &Path) -> ToolInvocation {
        ToolInvocation::new(Tool::Transfer)
            .arg("-a")
            .arg("--remove-source-files")
            .arg(format!("{}/", source.display()))
            .arg(format!("{}/", dest.display()))
    }

    async fn transfer_once(
        &self,
        invocation: &ToolInvocation,
        dest_dir: &Path,
        critical_files: &[PathBuf],
        attempt: usize,
    ) -> Result<(), DtiflowError> {
        debug!(attempt, command = %invocation.display_command(), "Transfer attempt");
        self.runner.run(invocation).await?;
        let missing: Vec<String> = critical_files
            .iter()
            .filter(|f| !dest_dir.join(f).exists())
            .map(|f| f.display().to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DtiflowError::Transfer(format!(
                "critical files missing at {}: {}",
                dest_dir.display(),
                missing.join(", ")
            )))
        }
    }

    /// Moves the contents of `source_dir` into `dest_dir`.
    ///
    /// `critical_files` are relative to `dest_dir`. Returns true only when
    /// the transfer succeeded and every critical file exists at the
    /// destination; the source is then pruned. On failure nothing left in
    /// the source is removed.
    pub async fn migrate(
        &self,
        source_dir: &Path,
        dest_dir: &Path,
        description: &str,
        critical_files: &[PathBuf],
    ) -> bool {
        if !source_dir.is_dir() {
            error!(source = %source_dir.display(), description, "Migration source does not exist");
            return false;
        }
        if let Err(e) = std::fs::create_dir_all(dest_dir) {
            error!(dest = %dest_dir.display(), error = %e, description, "Cannot create migration destination");
            return false;
        }
        info!(description, "Migrating {} -> {}", source_dir.display(), dest_dir.display());

        let invocation = Self::transfer_invocation(source_dir, dest_dir);
        let result = with_retry(&self.retry, description, |attempt| {
            self.transfer_once(&invocation, dest_dir, critical_files, attempt)
        })
        .await;

        match result {
            Ok(()) => {
                prune_source(source_dir);
                info!(description, dest = %dest_dir.display(), "Migration verified");
                true
            }
            Err(e) => {
                error!(description, error = %e, "Migration failed; local copies kept");
                false
            }
        }
    }
}

/// Removes leftover files and empty directories under `root`, then `root`.
fn prune_source(root: &Path) {
    for entry in WalkDir::new(root).contents_first(true).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Could not prune migrated source");
        }
    }
}
