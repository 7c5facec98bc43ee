//! Recording tool runner for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

use crate::config::Tool;
use crate::errors::{DtiflowError, Result, ToolError};
use crate::process::{ToolInvocation, ToolOutput, ToolRunner};

/// Closure type for [`MockBehavior::Custom`].
pub type MockFn = Arc<dyn Fn(&ToolInvocation) -> Result<ToolOutput> + Send + Sync>;

/// What a mocked tool does when called.
#[derive(Clone, Default)]
pub enum MockBehavior {
    /// Exit 0 and create every declared output. Transfers copy the source
    /// tree into the destination and remove the source files.
    #[default]
    Succeed,
    /// Exit 0 without writing anything.
    SucceedWithoutOutputs,
    /// Exit non-zero with the given output.
    Fail {
        /// Exit code.
        code: i32,
        /// Captured output.
        output: String,
    },
    /// Report a timeout.
    TimeOut,
    /// Transfer everything except files with this name.
    TransferExcept(String),
    /// Arbitrary behavior.
    Custom(MockFn),
}

impl MockBehavior {
    /// A failing behavior.
    #[must_use]
    pub fn fail(code: i32, output: impl Into<String>) -> Self {
        Self::Fail {
            code,
            output: output.into(),
        }
    }

    /// A custom behavior.
    #[must_use]
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&ToolInvocation) -> Result<ToolOutput> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }
}

impl fmt::Debug for MockBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeed => write!(f, "Succeed"),
            Self::SucceedWithoutOutputs => write!(f, "SucceedWithoutOutputs"),
            Self::Fail { code, .. } => write!(f, "Fail({code})"),
            Self::TimeOut => write!(f, "TimeOut"),
            Self::TransferExcept(name) => write!(f, "TransferExcept({name})"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[derive(Default)]
struct RunnerState {
    persistent: HashMap<Tool, MockBehavior>,
    once: HashMap<Tool, VecDeque<MockBehavior>>,
    calls: Vec<ToolInvocation>,
}

/// A [`ToolRunner`] that records every invocation and simulates tools.
///
/// Unscripted tools succeed and create their declared outputs.
#[derive(Default)]
pub struct RecordingToolRunner {
    state: Mutex<RunnerState>,
}

impl fmt::Debug for RecordingToolRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingToolRunner")
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

impl RecordingToolRunner {
    /// Creates a runner where every tool succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the behavior of every future call to `tool`.
    pub fn script(&self, tool: Tool, behavior: MockBehavior) {
        self.state.lock().persistent.insert(tool, behavior);
    }

    /// Queues a behavior for the next call to `tool` only.
    pub fn script_once(&self, tool: Tool, behavior: MockBehavior) {
        self.state.lock().once.entry(tool).or_default().push_back(behavior);
    }

    /// Every recorded invocation, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.state.lock().calls.clone()
    }

    /// Total number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Invocations of one tool.
    #[must_use]
    pub fn calls_for(&self, tool: Tool) -> Vec<ToolInvocation> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.tool == tool)
            .cloned()
            .collect()
    }

    /// Number of invocations of one tool.
    #[must_use]
    pub fn count_for(&self, tool: Tool) -> usize {
        self.state.lock().calls.iter().filter(|c| c.tool == tool).count()
    }

    /// Forgets recorded calls; scripts stay.
    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn next_behavior(&self, invocation: &ToolInvocation) -> MockBehavior {
        let mut state = self.state.lock();
        state.calls.push(invocation.clone());
        if let Some(behavior) = state.once.get_mut(&invocation.tool).and_then(VecDeque::pop_front) {
            return behavior;
        }
        state.persistent.get(&invocation.tool).cloned().unwrap_or_default()
    }
}

fn ok(output: impl Into<String>) -> ToolOutput {
    ToolOutput {
        code: Some(0),
        output: output.into(),
        duration: Duration::from_millis(1),
    }
}

fn touch_outputs(invocation: &ToolInvocation) -> Result<()> {
    for path in &invocation.expected_outputs {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            std::fs::write(path, format!("{} output\n", invocation.tool.name()))?;
        }
    }
    Ok(())
}

/// Source and destination of an rsync-style `src/ dst/` invocation.
fn transfer_endpoints(invocation: &ToolInvocation) -> Option<(PathBuf, PathBuf)> {
    let n = invocation.args.len();
    if n < 2 {
        return None;
    }
    let strip = |s: &str| PathBuf::from(s.trim_end_matches('/'));
    Some((strip(&invocation.args[n - 2]), strip(&invocation.args[n - 1])))
}

fn simulate_transfer(source: &Path, dest: &Path, except: Option<&str>) -> Result<()> {
    for entry in WalkDir::new(source).into_iter().filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let skipped = except.is_some_and(|name| entry.file_name().to_string_lossy() == name);
        if skipped {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| DtiflowError::Transfer(e.to_string()))?;
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &target)?;
        std::fs::remove_file(entry.path())?;
    }
    Ok(())
}

#[async_trait]
impl ToolRunner for RecordingToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let name = invocation.tool.name();
        match self.next_behavior(invocation) {
            MockBehavior::Succeed if invocation.tool == Tool::Transfer => {
                if let Some((src, dst)) = transfer_endpoints(invocation) {
                    simulate_transfer(&src, &dst, None)?;
                }
                Ok(ok(""))
            }
            MockBehavior::Succeed => {
                touch_outputs(invocation)?;
                Ok(ok(format!("{name} done\n")))
            }
            MockBehavior::SucceedWithoutOutputs => Ok(ok("")),
            MockBehavior::Fail { code, output } => Err(ToolError::failed(name, Some(code), output).into()),
            MockBehavior::TimeOut => Err(ToolError::TimedOut {
                name: name.to_string(),
                timeout_secs: invocation.timeout.map_or(0.0, |t| t.as_secs_f64()),
                output: String::new(),
            }
            .into()),
            MockBehavior::TransferExcept(except) => {
                if let Some((src, dst)) = transfer_endpoints(invocation) {
                    simulate_transfer(&src, &dst, Some(&except))?;
                }
                Ok(ok(""))
            }
            MockBehavior::Custom(f) => f(invocation),
        }
    }
}
