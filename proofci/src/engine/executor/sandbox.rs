//! Per-attempt sandbox.
//!
//! Every profile runs the verifier in a container with no network, the
//! workspace mounted read-only and a private writable scratch directory.
//! Standard adds a read-only root filesystem, dropped capabilities and
//! `no-new-privileges`; Maximum adds the secure OCI runtime on top.
//!
//! A [`Sandbox`] owns everything an attempt allocates on the host: the
//! scratch directory, the container name and the runtime client's process
//! group. Teardown is a single routine; [`Sandbox::teardown`] runs it on the
//! normal path and `Drop` runs a best-effort version if the attempt future
//! was dropped.

use process_utils::{GroupSignal, group_alive, signal_group, std_command, tokio_command};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use super::ExecutorConfig;
use super::process::ContainerRef;
use crate::domain::{AttemptOutcome, FaultCause, Job, SecurityProfile};

/// Mount points inside the container.
const CONTAINER_WORKSPACE: &str = "/workspace";
const CONTAINER_SCRATCH: &str = "/scratch";
const CONTAINER_BACKEND_SOCKET: &str = "/run/proofci/backend.sock";

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub(crate) enum SandboxError {
    #[error("workspace {0} is not a directory")]
    WorkspaceMissing(PathBuf),

    #[error("entry {0} resolves outside the workspace")]
    EntryEscapes(PathBuf),

    #[error("path {0} cannot be bind-mounted")]
    UnsupportedPath(PathBuf),

    #[error("maximum isolation requested but no secure container runtime is configured")]
    SecureRuntimeUnavailable,

    #[error("verifier command is empty")]
    EmptyCommand,

    #[error("failed to create scratch directory: {0}")]
    Scratch(#[source] std::io::Error),
}

impl SandboxError {
    /// Attempt outcome for an attempt that never got a sandbox.
    pub fn into_outcome(self) -> AttemptOutcome {
        match self {
            Self::EntryEscapes(_) => AttemptOutcome::failure(self.to_string()),
            _ => AttemptOutcome::transient(FaultCause::SandboxAllocation, self.to_string()),
        }
    }
}

/// Values substituted into the verifier command template.
struct TemplateVars<'a> {
    kind: String,
    entry: String,
    workspace: String,
    scratch: String,
    backend: String,
    job_id: &'a str,
}

fn substitute_variables(template: &str, vars: &TemplateVars<'_>) -> String {
    template
        .replace("{kind}", &vars.kind)
        .replace("{entry}", &vars.entry)
        .replace("{workspace}", &vars.workspace)
        .replace("{scratch}", &vars.scratch)
        .replace("{backend}", &vars.backend)
        .replace("{job_id}", vars.job_id)
}

fn mountable(path: &Path) -> Result<String, SandboxError> {
    let text = path.to_string_lossy();
    if text.contains([':', ',']) {
        return Err(SandboxError::UnsupportedPath(path.to_path_buf()));
    }
    Ok(text.into_owned())
}

pub(crate) struct Sandbox {
    profile: SecurityProfile,
    container: ContainerRef,
    scratch: Option<TempDir>,
    pgid: Option<u32>,
    torn_down: bool,
}

impl Sandbox {
    /// Check the payload and allocate host resources for one attempt.
    pub async fn allocate(
        config: &ExecutorConfig,
        job: &Job,
        profile: SecurityProfile,
    ) -> Result<Self, SandboxError> {
        let secure_runtime = config.secure_runtime.as_deref().filter(|r| !r.is_empty());
        if profile == SecurityProfile::Maximum && secure_runtime.is_none() {
            return Err(SandboxError::SecureRuntimeUnavailable);
        }

        let workspace = &job.payload.workspace;
        match tokio::fs::metadata(workspace).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(SandboxError::WorkspaceMissing(workspace.clone())),
        }

        // A symlinked entry must still land inside the workspace. A missing
        // entry is left for the verifier to report.
        let entry = workspace.join(&job.payload.entry);
        if let (Ok(root), Ok(resolved)) = (
            tokio::fs::canonicalize(workspace).await,
            tokio::fs::canonicalize(&entry).await,
        ) && !resolved.starts_with(&root)
        {
            return Err(SandboxError::EntryEscapes(job.payload.entry.clone()));
        }
        mountable(workspace)?;

        let scratch = match &config.scratch_root {
            Some(root) => {
                tokio::fs::create_dir_all(root)
                    .await
                    .map_err(SandboxError::Scratch)?;
                tempfile::Builder::new().prefix("proofci-").tempdir_in(root)
            }
            None => tempfile::Builder::new().prefix("proofci-").tempdir(),
        }
        .map_err(SandboxError::Scratch)?;
        mountable(scratch.path())?;
        #[cfg(unix)]
        {
            // The container user is not the host user that owns the dir.
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(scratch.path(), std::fs::Permissions::from_mode(0o777))
                .map_err(SandboxError::Scratch)?;
        }

        let container = ContainerRef {
            runtime: config.container_runtime.clone(),
            name: format!("proofci-{}", uuid::Uuid::new_v4().simple()),
        };

        debug!(
            job_id = %job.id,
            profile = %profile,
            container = %container.name,
            scratch = %scratch.path().display(),
            "Sandbox allocated"
        );

        Ok(Self {
            profile,
            container,
            scratch: Some(scratch),
            pgid: None,
            torn_down: false,
        })
    }

    fn scratch_path(&self) -> &Path {
        self.scratch
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new("/nonexistent"))
    }

    /// Container the attempt runs in.
    pub fn container(&self) -> &ContainerRef {
        &self.container
    }

    /// Build the `<runtime> run` command for this sandbox.
    pub fn command(&self, config: &ExecutorConfig, job: &Job) -> Result<Command, SandboxError> {
        let (program, args) = config
            .verifier_command
            .split_first()
            .ok_or(SandboxError::EmptyCommand)?;
        let container = &self.container;

        let workspace = mountable(&job.payload.workspace)?;
        let scratch = mountable(self.scratch_path())?;
        let entry = Path::new(CONTAINER_WORKSPACE).join(&job.payload.entry);
        let vars = TemplateVars {
            kind: job.kind.to_string(),
            entry: entry.display().to_string(),
            workspace: CONTAINER_WORKSPACE.to_string(),
            scratch: CONTAINER_SCRATCH.to_string(),
            backend: if config.backend_socket.is_some() {
                CONTAINER_BACKEND_SOCKET.to_string()
            } else {
                String::new()
            },
            job_id: &job.id,
        };

        let mut cmd = tokio_command(&container.runtime);
        cmd.args(["run", "--rm"])
            .arg(format!("--name={}", container.name))
            .arg("--network=none")
            .arg(format!("--pids-limit={}", config.pids_limit))
            .arg(format!("--memory={}m", config.memory_mb))
            .arg(format!("--memory-swap={}m", config.memory_mb))
            .arg(format!("--cpus={}", config.cpus));

        if self.profile >= SecurityProfile::Standard {
            cmd.args([
                "--read-only",
                "--cap-drop=ALL",
                "--security-opt=no-new-privileges",
            ])
            .arg(format!(
                "--tmpfs=/tmp:rw,noexec,nosuid,size={}m",
                config.scratch_size_mb
            ));
        }

        cmd.arg(format!("--volume={workspace}:{CONTAINER_WORKSPACE}:ro"))
            .arg(format!("--volume={scratch}:{CONTAINER_SCRATCH}:rw"))
            .arg(format!("--workdir={CONTAINER_SCRATCH}"))
            .arg(format!("--env=HOME={CONTAINER_SCRATCH}"))
            .arg(format!("--env=PROOFCI_JOB_ID={}", job.id));

        if let Some(socket) = &config.backend_socket {
            let socket = mountable(socket)?;
            cmd.arg(format!("--volume={socket}:{CONTAINER_BACKEND_SOCKET}"))
                .arg(format!("--env=PROOFCI_BACKEND={CONTAINER_BACKEND_SOCKET}"));
        }
        if let Some(user) = &config.container_user {
            cmd.arg(format!("--user={user}"));
        }
        if self.profile == SecurityProfile::Maximum {
            // allocate() refuses Maximum without a secure runtime.
            let runtime = config
                .secure_runtime
                .as_deref()
                .ok_or(SandboxError::SecureRuntimeUnavailable)?;
            cmd.arg(format!("--runtime={runtime}"));
        }

        cmd.arg(&config.image)
            .arg(substitute_variables(program, &vars))
            .args(args.iter().map(|a| substitute_variables(a, &vars)));
        Ok(cmd)
    }

    /// Remember the runtime client's process group so teardown can reap it.
    pub fn track_process_group(&mut self, pgid: Option<u32>) {
        self.pgid = pgid;
    }

    #[cfg(test)]
    pub fn scratch_dir(&self) -> Option<PathBuf> {
        self.scratch.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Remove everything the attempt left behind.
    pub async fn teardown(mut self) {
        let removal = tokio_command(&self.container.runtime)
            .args(["rm", "-f", &self.container.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let name = &self.container.name;
        match tokio::time::timeout(TEARDOWN_TIMEOUT, removal).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(container = %name, "Failed to remove container: {}", e),
            Err(_) => warn!(container = %name, "Timed out removing container"),
        }
        self.kill_process_group();
        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), "Failed to remove scratch directory: {}", e);
            }
        }
        self.torn_down = true;
    }

    fn kill_process_group(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        if !group_alive(pgid) {
            return;
        }
        debug!(pgid, "Killing leftover runtime client processes");
        if let Err(e) = signal_group(pgid, GroupSignal::Kill) {
            debug!(pgid, "Failed to kill process group: {}", e);
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        let ContainerRef { runtime, name } = self.container.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = tokio_command(&runtime)
                        .args(["rm", "-f", &name])
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status()
                        .await;
                });
            }
            Err(_) => {
                let _ = std_command(&runtime)
                    .args(["rm", "-f", &name])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            }
        }
        self.kill_process_group();
        // The scratch TempDir removes itself when dropped.
    }
}
