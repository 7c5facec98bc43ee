//! External tool invocation.
//!
//! Every scientific tool, transfer and kill goes through the [`ToolRunner`]
//! seam. [`SubprocessRunner`] is the production implementation; tests use
//! the recording runner from [`crate::testing`].

use crate::cancellation::CancellationToken;
use crate::config::{Tool, ToolLocations};
use crate::errors::{DtiflowError, Result, ToolError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variables that carry the thread-count hint.
pub const THREAD_ENV_VARS: [&str; 3] = [
    "OMP_NUM_THREADS",
    "MRTRIX_NTHREADS",
    "ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS",
];

/// A single external tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Logical tool.
    pub tool: Tool,
    /// Arguments after the executable.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub cwd: Option<PathBuf>,
    /// Extra environment.
    pub env: Vec<(String, String)>,
    /// Kill the child after this long.
    pub timeout: Option<Duration>,
    /// Files that must exist after a successful exit.
    pub expected_outputs: Vec<PathBuf>,
    /// Subject for log context.
    pub subject: Option<String>,
}

impl ToolInvocation {
    /// Creates an invocation with no arguments.
    #[must_use]
    pub fn new(tool: Tool) -> Self {
        Self {
            tool,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
            expected_outputs: Vec::new(),
            subject: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a path argument.
    #[must_use]
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Passes `-nthreads N` (MRtrix convention).
    #[must_use]
    pub fn with_nthreads(self, threads: usize) -> Self {
        self.arg("-nthreads").arg(threads.to_string())
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declares an output file that must exist afterwards.
    #[must_use]
    pub fn expect_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.expected_outputs.push(path.into());
        self
    }

    /// Tags the invocation with a subject.
    #[must_use]
    pub fn for_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Human-readable command line for logs.
    #[must_use]
    pub fn display_command(&self) -> String {
        let mut line = self.tool.name().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Result of a successful tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code.
    pub code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Executes external tools.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the tool to completion.
    ///
    /// Non-zero exit, timeout and missing declared outputs are errors.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Runs tools as child processes of this pipeline.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    tools: ToolLocations,
    threads: usize,
    cancel: Arc<CancellationToken>,
}

impl SubprocessRunner {
    /// Creates a runner over resolved tool locations.
    #[must_use]
    pub fn new(tools: ToolLocations, threads: usize, cancel: Arc<CancellationToken>) -> Self {
        Self {
            tools,
            threads: threads.max(1),
            cancel,
        }
    }

    fn command(&self, executable: &Path, invocation: &ToolInvocation) -> Command {
        let mut cmd = Command::new(executable);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for var in THREAD_ENV_VARS {
            cmd.env(var, self.threads.to_string());
        }
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// How long pipes may stay open after the child was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

type Captured = Arc<Mutex<Vec<u8>>>;

/// Stdout and stderr collected by background readers.
///
/// Chunks land in shared buffers as they arrive, so whatever was read before
/// the readers are aborted still reaches the failure log.
struct Capture {
    stdout: Captured,
    stderr: Captured,
    tasks: Vec<JoinHandle<()>>,
}

impl Capture {
    fn start(child: &mut Child) -> Self {
        let stdout = Captured::default();
        let stderr = Captured::default();
        let tasks = vec![
            spawn_reader(child.stdout.take(), stdout.clone()),
            spawn_reader(child.stderr.take(), stderr.clone()),
        ];
        Self { stdout, stderr, tasks }
    }

    /// Waits for both pipes to close; with a grace period, gives up after it.
    async fn finish(mut self, grace: Option<Duration>) -> String {
        let drain = async {
            for task in &mut self.tasks {
                let _ = task.await;
            }
        };
        let drained = match grace {
            None => {
                drain.await;
                true
            }
            Some(grace) => tokio::time::timeout(grace, drain).await.is_ok(),
        };
        if !drained {
            // A descendant outside the killed group still holds a pipe open.
            for task in &self.tasks {
                task.abort();
            }
        }

        let mut output = String::from_utf8_lossy(&self.stdout.lock()).into_owned();
        let err = self.stderr.lock();
        if !err.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&String::from_utf8_lossy(&err));
        }
        output
    }
}

fn spawn_reader<R>(reader: Option<R>, sink: Captured) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

enum Exit {
    Finished(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

impl SubprocessRunner {
    /// Kills the child and, through the configured killer, its process group.
    async fn terminate(&self, name: &str, child: &mut Child, pgid: Option<u32>) {
        if let Err(e) = child.kill().await {
            warn!(tool = name, error = %e, "Failed to kill child process");
        }
        let (Some(pgid), Some(kill)) = (pgid, self.tools.get(Tool::Kill)) else {
            return;
        };
        let status = Command::new(kill)
            .args(["-KILL", "-g", &pgid.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) => debug!(tool = name, pgid, code = ?status.code(), "Signalled process group"),
            Err(e) => warn!(tool = name, pgid, error = %e, "Failed to signal process group"),
        }
    }
}

#[async_trait]
impl ToolRunner for SubprocessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let name = invocation.tool.name();
        if self.cancel.is_cancelled() {
            return Err(DtiflowError::Cancelled(format!("{name} not started")));
        }

        let executable = self
            .tools
            .get(invocation.tool)
            .ok_or_else(|| ToolError::not_found(name))?
            .to_path_buf();

        info!(
            tool = name,
            subject = invocation.subject.as_deref().unwrap_or("-"),
            command = %invocation.display_command(),
            "Running external tool"
        );

        let started = Instant::now();
        let mut child = self.command(&executable, invocation).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DtiflowError::from(ToolError::not_found(name))
            } else {
                DtiflowError::Io(e)
            }
        })?;
        // The child leads its own group, so the group ID is its PID.
        let pgid = child.id();
        let capture = Capture::start(&mut child);

        let timeout = invocation.timeout.unwrap_or(Duration::MAX);
        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status?),
            () = tokio::time::sleep(timeout), if invocation.timeout.is_some() => Exit::TimedOut,
            () = self.cancel.cancelled() => Exit::Cancelled,
        };

        let output = if let Exit::Finished(_) = exit {
            capture.finish(None).await
        } else {
            self.terminate(name, &mut child, pgid).await;
            capture.finish(Some(DRAIN_GRACE)).await
        };
        let duration = started.elapsed();

        let status = match exit {
            Exit::Finished(status) => status,
            Exit::TimedOut => {
                warn!(tool = name, timeout = ?timeout, "External tool timed out");
                return Err(ToolError::TimedOut {
                    name: name.to_string(),
                    timeout_secs: timeout.as_secs_f64(),
                    output,
                }
                .into());
            }
            Exit::Cancelled => {
                return Err(DtiflowError::Cancelled(format!(
                    "{name} interrupted: {}",
                    self.cancel.reason().unwrap_or_default()
                )));
            }
        };

        if !status.success() {
            return Err(ToolError::failed(name, status.code(), output).into());
        }

        for path in &invocation.expected_outputs {
            if !path.exists() {
                return Err(ToolError::missing_output(name, path).into());
            }
        }

        debug!(tool = name, duration_s = duration.as_secs_f64(), "External tool finished");
        Ok(ToolOutput {
            code: status.code(),
            output,
            duration,
        })
    }
}

/// The last `n` lines of `output`.
#[must_use]
pub fn tail_lines(output: &str, n: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(n);
    let mut tail = lines[start..].join("\n");
    if !tail.is_empty() {
        tail.push('\n');
    }
    tail
}
