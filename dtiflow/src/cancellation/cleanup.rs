//! Interrupt cleanup registry.
//!
//! The driver registers each subject's scratch directory while the subject
//! is in flight; startup registers kill-by-pattern callbacks for the
//! long-running tools. On Ctrl-C everything still registered runs once,
//! process kills first so nothing is still writing into a directory being
//! removed.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

/// A named cleanup callback.
struct CleanupCallback {
    callback: Box<dyn Fn() + Send + Sync>,
    name: Option<String>,
    kills_processes: bool,
}

/// Registry for cleanup callbacks: process kills first, then the rest, each
/// group in LIFO order.
#[derive(Default)]
pub struct CleanupRegistry {
    callbacks: RwLock<Vec<CleanupCallback>>,
}

impl CleanupRegistry {
    /// Creates a new cleanup registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup callback.
    pub fn register<F>(&self, callback: F, name: Option<&str>)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(Box::new(callback), name, false);
    }

    fn push(&self, callback: Box<dyn Fn() + Send + Sync>, name: Option<&str>, kills_processes: bool) {
        self.callbacks.write().push(CleanupCallback {
            callback,
            name: name.map(String::from),
            kills_processes,
        });
    }

    /// Registers removal of a temporary directory tree.
    pub fn register_path_removal(&self, name: &str, path: impl Into<PathBuf>) {
        let path = path.into();
        self.register(
            move || {
                if path.exists() {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => info!(path = %path.display(), "Removed temporary directory"),
                        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary directory"),
                    }
                }
            },
            Some(name),
        );
    }

    /// Registers a `pkill -f <pattern>` for a child process family.
    pub fn register_kill_pattern(&self, kill_executable: impl Into<PathBuf>, pattern: impl Into<String>) {
        let kill_executable = kill_executable.into();
        let pattern = pattern.into();
        let name = format!("kill:{pattern}");
        self.push(Box::new(move || kill_by_pattern(&kill_executable, &pattern)), Some(&name), true);
    }

    /// Removes every callback registered under `name`.
    ///
    /// Returns true if a callback was removed.
    pub fn unregister_by_name(&self, name: &str) -> bool {
        let mut callbacks = self.callbacks.write();
        let initial_len = callbacks.len();
        callbacks.retain(|cb| cb.name.as_deref() != Some(name));
        callbacks.len() < initial_len
    }

    /// Runs all cleanup callbacks: process kills first, then everything
    /// else, each group in LIFO order.
    ///
    /// Each callback gets an equal share of the total timeout. Failures are
    /// collected as `(name, message)` and do not stop the remaining
    /// callbacks. The registry is empty afterwards.
    pub async fn run_all(&self, timeout_secs: f64) -> Vec<(String, String)> {
        let callbacks: Vec<CleanupCallback> = std::mem::take(&mut *self.callbacks.write());

        if callbacks.is_empty() {
            return Vec::new();
        }

        let per_callback_timeout = (timeout_secs / callbacks.len() as f64).max(0.01);
        let mut failures = Vec::new();

        let (kills, rest): (Vec<_>, Vec<_>) = callbacks.into_iter().rev().partition(|c| c.kills_processes);
        for entry in kills.into_iter().chain(rest) {
            let name = entry.name.clone().unwrap_or_else(|| "<unnamed>".to_string());

            let result = tokio::time::timeout(
                Duration::from_secs_f64(per_callback_timeout),
                tokio::task::spawn_blocking(move || {
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        (entry.callback)();
                    }))
                }),
            )
            .await;

            let failure = match result {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(panic))) => Some(format!("Cleanup callback panicked: {panic:?}")),
                Ok(Err(join_err)) => Some(format!("Cleanup task join error: {join_err}")),
                Err(_) => Some("Cleanup callback timed out".to_string()),
            };
            if let Some(msg) = failure {
                warn!(callback = %name, "{}", msg);
                failures.push((name, msg));
            }
        }

        failures
    }

    /// Returns the number of pending cleanup callbacks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Clears all registered callbacks without running them.
    pub fn clear(&self) {
        self.callbacks.write().clear();
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

/// Sends SIGTERM to every process whose command line matches `pattern`.
///
/// `pkill` exits 1 when nothing matched, which is not an error here.
pub fn kill_by_pattern(kill_executable: &Path, pattern: &str) {
    match Command::new(kill_executable)
        .arg("-f")
        .arg(pattern)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => info!(pattern, "Terminated matching processes"),
        Ok(_) => {}
        Err(e) => warn!(pattern, error = %e, "Failed to run process killer"),
    }
}
