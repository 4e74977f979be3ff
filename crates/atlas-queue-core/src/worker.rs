//! Launching the external image-to-3D converter
//!
//! The converter is an opaque executable invoked as
//! `worker <input image> <pipeline config> <request kind> <output path>`.
//! Its exit code is recorded but never inspected: success is decided later
//! by watching and validating the output file.

use crate::error::{ConversionError, Result};
use crate::models::RequestKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Arguments for one worker run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub input_image: PathBuf,
    pub pipeline_config: PathBuf,
    pub kind: RequestKind,
    pub output_path: PathBuf,
}

impl WorkerInvocation {
    /// Positional arguments in the order the worker expects them
    pub fn to_args(&self) -> Vec<OsString> {
        vec![
            self.input_image.clone().into_os_string(),
            self.pipeline_config.clone().into_os_string(),
            OsString::from(self.kind.as_arg()),
            self.output_path.clone().into_os_string(),
        ]
    }
}

/// Captured result of a finished worker process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

/// Something that can turn a staged image into a model file
#[async_trait]
pub trait ConversionWorker: Send + Sync {
    async fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerOutput>;
}

/// The real external converter process
#[derive(Debug, Clone)]
pub struct WorkerProcess {
    executable: PathBuf,
}

impl WorkerProcess {
    /// Use an executable path as given, without checking it
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Resolve the executable, searching `PATH` for bare names
    pub fn locate(executable: impl AsRef<Path>) -> Result<Self> {
        let executable = executable.as_ref();
        let resolved = which::which(executable).map_err(|e| {
            tracing::debug!("Could not resolve {}: {}", executable.display(), e);
            ConversionError::WorkerNotFound {
                executable: executable.to_path_buf(),
            }
        })?;

        tracing::debug!("Using worker executable {}", resolved.display());
        Ok(Self::new(resolved))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

#[async_trait]
impl ConversionWorker for WorkerProcess {
    async fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerOutput> {
        if !tokio::fs::try_exists(&invocation.input_image)
            .await
            .unwrap_or(false)
        {
            remove_staged_input(&invocation.input_image).await;
            return Err(ConversionError::StagingFailed {
                path: invocation.input_image.clone(),
                message: "staged input disappeared before launch".to_string(),
            });
        }

        let start = Instant::now();
        tracing::info!(
            "Launching {} for {}",
            self.executable.display(),
            invocation.input_image.display()
        );

        let result = Command::new(&self.executable)
            .args(invocation.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        // The staged input is scratch space whether or not the worker ran
        remove_staged_input(&invocation.input_image).await;

        let output = result.map_err(|source| ConversionError::WorkerLaunch {
            executable: self.executable.clone(),
            source,
        })?;

        let output = WorkerOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };

        if !output.stdout.trim().is_empty() {
            tracing::debug!("Worker output: {}", output.stdout.trim());
        }
        if !output.stderr.trim().is_empty() {
            tracing::error!("Worker reported errors: {}", output.stderr.trim());
        }

        tracing::info!(
            "Worker exited with {:?} after {:.2}s",
            output.exit_code,
            start.elapsed().as_secs_f64()
        );
        Ok(output)
    }
}

/// Path of the metadata sidecar that accompanies a staged image
pub fn meta_sidecar(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".meta");
    PathBuf::from(name)
}

async fn remove_staged_input(path: &Path) {
    for target in [path.to_path_buf(), meta_sidecar(path)] {
        match tokio::fs::remove_file(&target).await {
            Ok(()) => tracing::trace!("Removed {}", target.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", target.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_invocation(dir: &Path) -> WorkerInvocation {
        WorkerInvocation {
            input_image: dir.join("chair-10-00-00-000.png"),
            pipeline_config: dir.join("default.json"),
            kind: RequestKind::GenerateFbx,
            output_path: dir.join("out/chair-10-00-00-000.fbx"),
        }
    }

    #[test]
    fn test_argument_order() {
        let invocation = create_test_invocation(Path::new("/work"));
        let args = invocation.to_args();

        assert_eq!(args.len(), 4);
        assert_eq!(args[0], OsString::from("/work/chair-10-00-00-000.png"));
        assert_eq!(args[1], OsString::from("/work/default.json"));
        assert_eq!(args[2], OsString::from("generate-fbx"));
        assert_eq!(args[3], OsString::from("/work/out/chair-10-00-00-000.fbx"));
    }

    #[test]
    fn test_meta_sidecar() {
        assert_eq!(
            meta_sidecar(Path::new("temp/chair.png")),
            PathBuf::from("temp/chair.png.meta")
        );
    }

    #[test]
    fn test_locate_missing_executable() {
        let result = WorkerProcess::locate("atlas-queue-no-such-worker");
        assert!(matches!(result, Err(ConversionError::WorkerNotFound { .. })));
    }

    #[tokio::test]
    async fn test_launch_failure_still_cleans_input() {
        let temp_dir = TempDir::new().unwrap();
        let invocation = create_test_invocation(temp_dir.path());
        std::fs::write(&invocation.input_image, b"png").unwrap();
        std::fs::write(meta_sidecar(&invocation.input_image), b"meta").unwrap();

        let worker = WorkerProcess::new(temp_dir.path().join("missing-worker"));
        let result = worker.run(&invocation).await;

        assert!(matches!(result, Err(ConversionError::WorkerLaunch { .. })));
        assert!(!invocation.input_image.exists());
        assert!(!meta_sidecar(&invocation.input_image).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_staged_input_is_not_launched() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("launched");
        let script = temp_dir.path().join("worker.sh");
        std::fs::write(&script, format!("#!/bin/sh\ntouch '{}'\n", marker.display())).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let invocation = create_test_invocation(temp_dir.path());
        std::fs::write(meta_sidecar(&invocation.input_image), b"meta").unwrap();

        let result = WorkerProcess::new(&script).run(&invocation).await;

        assert!(matches!(result, Err(ConversionError::StagingFailed { .. })));
        assert!(!marker.exists());
        assert!(!meta_sidecar(&invocation.input_image).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_streams() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("worker.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"mode $3\"\necho \"bad pixel\" >&2\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let invocation = create_test_invocation(temp_dir.path());
        std::fs::write(&invocation.input_image, b"png").unwrap();

        let output = WorkerProcess::new(&script).run(&invocation).await.unwrap();

        assert_eq!(output.stdout.trim(), "mode generate-fbx");
        assert_eq!(output.stderr.trim(), "bad pixel");
        assert_eq!(output.exit_code, Some(3));
        assert!(!invocation.input_image.exists());
    }
}
