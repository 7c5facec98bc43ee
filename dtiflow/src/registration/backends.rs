//! Registration backends driven through external tools.

use super::RegistrationMethod;
use crate::config::{Tool, ToolLocations};
use crate::errors::{DtiflowError, Result, ToolError};
use crate::process::{ToolInvocation, ToolRunner};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One registration problem: bring `moving` onto `fixed`, write `output`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRequest {
    /// Subject being registered.
    pub subject: String,
    /// Target image.
    pub fixed: PathBuf,
    /// Image to transform.
    pub moving: PathBuf,
    /// Where the registered image goes.
    pub output: PathBuf,
    /// Fewer iterations.
    pub quick: bool,
    /// Thread-count hint.
    pub threads: usize,
}

impl RegistrationRequest {
    /// Output path for a specific method, so attempts never overwrite each other.
    #[must_use]
    pub fn output_for(&self, method: RegistrationMethod) -> PathBuf {
        let dir = self.output.parent().unwrap_or_else(|| Path::new("."));
        dir.join(method.name()).join("registered.nii.gz")
    }
}

/// A registration strategy.
#[async_trait]
pub trait RegistrationBackend: Send + Sync {
    /// Which method this is.
    fn method(&self) -> RegistrationMethod;

    /// Returns true if the backend can run on this host.
    fn is_available(&self) -> bool;

    /// Registers and returns the path of the registered image.
    async fn attempt(&self, request: &RegistrationRequest) -> Result<PathBuf>;
}

/// Backend that shells out to the method's tool.
#[derive(Clone)]
pub struct ToolBackend {
    method: RegistrationMethod,
    runner: Arc<dyn ToolRunner>,
    available: bool,
}

impl std::fmt::Debug for ToolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBackend")
            .field("method", &self.method)
            .field("available", &self.available)
            .finish_non_exhaustive()
    }
}

impl ToolBackend {
    /// Creates a backend; availability comes from the resolved tools.
    #[must_use]
    pub fn new(method: RegistrationMethod, runner: Arc<dyn ToolRunner>, tools: &ToolLocations) -> Self {
        Self {
            method,
            runner,
            available: tools.is_available(method.tool()),
        }
    }

    /// One backend per method.
    #[must_use]
    pub fn all(runner: &Arc<dyn ToolRunner>, tools: &ToolLocations) -> Vec<Arc<dyn RegistrationBackend>> {
        RegistrationMethod::AUTO_ORDER
            .into_iter()
            .map(|m| Arc::new(Self::new(m, runner.clone(), tools)) as Arc<dyn RegistrationBackend>)
            .collect()
    }

    fn invocation(&self, request: &RegistrationRequest, output: &Path) -> ToolInvocation {
        let base = ToolInvocation::new(self.method.tool()).for_subject(&request.subject);
        match self.method {
            RegistrationMethod::SynthMorph => base
                .arg("-m")
                .arg(if request.quick { "affine" } else { "joint" })
                .arg("-j")
                .arg(request.threads.to_string())
                .arg("-o")
                .path_arg(output)
                .path_arg(&request.moving)
                .path_arg(&request.fixed)
                .expect_output(output),
            RegistrationMethod::DeformableNet => base
                .arg("--moving")
                .path_arg(&request.moving)
                .arg("--fixed")
                .path_arg(&request.fixed)
                .arg("--moved")
                .path_arg(output)
                .arg("--iterations")
                .arg(if request.quick { "50" } else { "200" })
                .expect_output(output),
            RegistrationMethod::EnhancedClassical => {
                let prefix = ants_prefix(output);
                base.arg("-d")
                    .arg("3")
                    .arg("-f")
                    .path_arg(&request.fixed)
                    .arg("-m")
                    .path_arg(&request.moving)
                    .arg("-o")
                    .path_arg(&prefix)
                    .arg("-t")
                    .arg(if request.quick { "a" } else { "s" })
                    .arg("-n")
                    .arg(request.threads.to_string())
                    .expect_output(ants_warped(&prefix))
            }
        }
    }
}

fn ants_prefix(output: &Path) -> PathBuf {
    output.parent().unwrap_or_else(|| Path::new(".")).join("ants_")
}

fn ants_warped(prefix: &Path) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push("Warped.nii.gz");
    PathBuf::from(name)
}

#[async_trait]
impl RegistrationBackend for ToolBackend {
    fn method(&self) -> RegistrationMethod {
        self.method
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn attempt(&self, request: &RegistrationRequest) -> Result<PathBuf> {
        if !self.available {
            return Err(ToolError::not_found(self.method.tool().name()).into());
        }
        let output = request.output_for(self.method);
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.runner.run(&self.invocation(request, &output)).await?;

        if self.method == RegistrationMethod::EnhancedClassical {
            std::fs::rename(ants_warped(&ants_prefix(&output)), &output)?;
        }
        if output.exists() {
            Ok(output)
        } else {
            Err(DtiflowError::Registration(format!(
                "{} reported success without writing {}",
                self.method,
                output.display()
            )))
        }
    }
}

/// Rigid (6 dof) FSL registration used when ML registration is disabled.
pub async fn run_traditional(runner: &dyn ToolRunner, request: &RegistrationRequest) -> Result<PathBuf> {
    let dir = request.output.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let matrix = dir.join("b0_to_t1.mat");
    let invocation = ToolInvocation::new(Tool::Flirt)
        .for_subject(&request.subject)
        .arg("-in")
        .path_arg(&request.moving)
        .arg("-ref")
        .path_arg(&request.fixed)
        .arg("-out")
        .path_arg(&request.output)
        .arg("-omat")
        .path_arg(&matrix)
        .arg("-dof")
        .arg("6")
        .expect_output(&request.output);
    runner.run(&invocation).await?;
    Ok(request.output.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingToolRunner;
    use pretty_assertions::assert_eq;

    fn request(dir: &Path, quick: bool) -> RegistrationRequest {
        RegistrationRequest {
            subject: "sub-001".into(),
            fixed: dir.join("t1.nii.gz"),
            moving: dir.join("b0.nii.gz"),
            output: dir.join("refinement/b0_to_t1.nii.gz"),
            quick,
            threads: 4,
        }
    }

    #[tokio::test]
    async fn test_synthmorph_invocation_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let backend = ToolBackend::new(
            RegistrationMethod::SynthMorph,
            runner.clone(),
            &ToolLocations::all_defaults(),
        );

        let out = backend.attempt(&request(dir.path(), true)).await.unwrap();
        assert_eq!(out, dir.path().join("refinement/synthmorph/registered.nii.gz"));
        assert!(out.exists());

        let call = &runner.calls()[0];
        assert_eq!(call.tool, Tool::Synthmorph);
        assert_eq!(&call.args[..2], &["-m".to_string(), "affine".to_string()]);
    }

    #[tokio::test]
    async fn test_classical_renames_warped_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let backend = ToolBackend::new(
            RegistrationMethod::EnhancedClassical,
            runner.clone(),
            &ToolLocations::all_defaults(),
        );

        let out = backend.attempt(&request(dir.path(), false)).await.unwrap();
        assert!(out.exists());
        assert!(!dir.path().join("refinement/enhanced-classical/ants_Warped.nii.gz").exists());
        assert!(runner.calls()[0].args.contains(&"s".to_string()));
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingToolRunner::new());
        let backend = ToolBackend::new(
            RegistrationMethod::DeformableNet,
            runner.clone(),
            &ToolLocations::all_defaults().without_tool(Tool::Voxelmorph),
        );

        assert!(!backend.is_available());
        assert!(backend.attempt(&request(dir.path(), false)).await.is_err());
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_traditional_flirt() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingToolRunner::new();
        let req = request(dir.path(), false);

        let out = run_traditional(&runner, &req).await.unwrap();
        assert_eq!(out, req.output);
        let call = &runner.calls()[0];
        assert_eq!(call.tool, Tool::Flirt);
        assert!(call.args.windows(2).any(|w| w[0] == "-dof" && w[1] == "6"));
    }
}
