//! Disk, memory and permission gates evaluated before each stage.

use crate::config::StageRequirements;
use crate::core::StageId;
use crate::errors::{ResourceError, ResourceKind};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of resource measurements.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceProbe: Send + Sync {
    /// Free bytes on the filesystem holding `path`; `None` if unmeasurable.
    fn available_disk_bytes(&self, path: &Path) -> Option<u64>;

    /// Available memory in bytes; `None` if unmeasurable.
    fn available_memory_bytes(&self) -> Option<u64>;
}

/// Probe backed by the host operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn available_disk_bytes(&self, path: &Path) -> Option<u64> {
        // The target may not exist yet; measure the nearest existing ancestor.
        let existing = path.ancestors().find(|p| p.exists())?;
        match fs2::available_space(existing) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(path = %existing.display(), error = %e, "Failed to query free space");
                None
            }
        }
    }

    fn available_memory_bytes(&self) -> Option<u64> {
        let content = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_mem_available(&content)
    }
}

/// Extracts `MemAvailable` (in bytes) from `/proc/meminfo` content.
#[must_use]
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?.trim();
        let kb = rest.strip_suffix("kB").unwrap_or(rest).trim();
        kb.parse::<u64>().ok().map(|kb| kb * 1024)
    })
}

fn to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Gates stage execution on free disk, memory and write permission.
#[derive(Clone)]
pub struct ResourceGuard {
    probe: Arc<dyn ResourceProbe>,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard").finish_non_exhaustive()
    }
}

impl Default for ResourceGuard {
    fn default() -> Self {
        Self::new(Arc::new(SystemProbe))
    }
}

impl ResourceGuard {
    /// Creates a guard over the given probe.
    #[must_use]
    pub fn new(probe: Arc<dyn ResourceProbe>) -> Self {
        Self { probe }
    }

    /// Free space in GB on the filesystem holding `path`.
    #[must_use]
    pub fn available_disk_gb(&self, path: &Path) -> Option<f64> {
        self.probe.available_disk_bytes(path).map(to_gb)
    }

    /// Returns true if at least `min_gb` is free on the filesystem holding `path`.
    ///
    /// An unmeasurable filesystem fails the check.
    pub fn check_disk(&self, path: &Path, min_gb: f64) -> bool {
        match self.probe.available_disk_bytes(path) {
            Some(bytes) => {
                let free_gb = to_gb(bytes);
                if free_gb < min_gb {
                    error!(
                        path = %path.display(),
                        free_gb = format!("{free_gb:.1}"),
                        required_gb = min_gb,
                        "Insufficient disk space"
                    );
                    false
                } else {
                    debug!(path = %path.display(), free_gb = format!("{free_gb:.1}"), "Disk check passed");
                    true
                }
            }
            None => {
                error!(path = %path.display(), "Unable to determine free disk space");
                false
            }
        }
    }

    /// Returns true if at least `min_gb` of memory is available.
    ///
    /// Platforms without a memory probe pass the check.
    pub fn check_memory(&self, min_gb: f64) -> bool {
        match self.probe.available_memory_bytes() {
            Some(bytes) => {
                let avail_gb = to_gb(bytes);
                if avail_gb < min_gb {
                    warn!(
                        available_gb = format!("{avail_gb:.1}"),
                        required_gb = min_gb,
                        "Insufficient memory"
                    );
                    false
                } else {
                    true
                }
            }
            None => {
                debug!("Memory availability unknown; skipping memory gate");
                true
            }
        }
    }

    /// Returns true if a file can be created in `dir`.
    pub fn check_write_permission(&self, dir: &Path) -> bool {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!(dir = %dir.display(), error = %e, "Cannot create directory");
            return false;
        }
        match tempfile::NamedTempFile::new_in(dir) {
            Ok(_) => true,
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Directory is not writable");
                false
            }
        }
    }

    /// Evaluates every gate for a stage about to run against `work_dir`.
    pub fn gate_stage(
        &self,
        stage: StageId,
        work_dir: &Path,
        requirements: StageRequirements,
    ) -> Result<(), ResourceError> {
        if !self.check_write_permission(work_dir) {
            return Err(ResourceError::new(
                ResourceKind::WritePermission,
                stage.name(),
                format!("{} is not writable", work_dir.display()),
            ));
        }
        if !self.check_disk(work_dir, requirements.min_disk_gb) {
            let free = self
                .probe
                .available_disk_bytes(work_dir)
                .map_or_else(|| "unknown".to_string(), |b| format!("{:.1} GB", to_gb(b)));
            return Err(ResourceError::new(
                ResourceKind::Disk,
                stage.name(),
                format!("{free} free < {:.1} GB required", requirements.min_disk_gb),
            ));
        }
        if !self.check_memory(requirements.min_memory_gb) {
            return Err(ResourceError::new(
                ResourceKind::Memory,
                stage.name(),
                format!("< {:.1} GB available", requirements.min_memory_gb),
            ));
        }
        Ok(())
    }
}
