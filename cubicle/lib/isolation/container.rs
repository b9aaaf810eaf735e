//! The container isolation driver.
//!
//! Drives the container CLI: sandboxes become long-lived containers with the
//! workspace bind-mounted at a configured guest path. Also used by the runtime
//! to provision fallback preview replicas.

use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{fs, io::AsyncWriteExt, process::Command};
use tracing::{debug, warn};

use super::{
    ChildStream, DriverHandle, DriverKind, DriverStream, ExecOutcome, ExecRequest, HandleState,
    IsolationDriver, ProvisionSpec,
};
use crate::{config::ContainerSettings, utils::create_private_dir, CubicleError, CubicleResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The container CLI binary.
const CONTAINER_CLI: &str = "docker";

/// Grace period before a stopping container is killed.
const STOP_GRACE_SECONDS: &str = "5";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Container-backed isolation through the container CLI.
pub struct ContainerDriver {
    settings: ContainerSettings,
    boxes: DashMap<String, ContainerBox>,
}

struct ContainerBox {
    state: HandleState,
    name: String,
    workspace: std::path::PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerDriver {
    /// Creates the driver.
    pub fn new(settings: ContainerSettings) -> Self {
        Self {
            settings,
            boxes: DashMap::new(),
        }
    }

    fn container_name(&self, sandbox_id: &str) -> String {
        format!("{}-{}", self.settings.get_name_prefix(), sandbox_id)
    }

    fn require_box(&self, sandbox_id: &str) -> CubicleResult<(HandleState, String)> {
        let entry = self
            .boxes
            .get(sandbox_id)
            .ok_or_else(|| CubicleError::NotFound(format!("unknown sandbox: {}", sandbox_id)))?;
        Ok((entry.state, entry.name.clone()))
    }

    fn transition(&self, sandbox_id: &str, target: HandleState) -> CubicleResult<bool> {
        let mut entry = self
            .boxes
            .get_mut(sandbox_id)
            .ok_or_else(|| CubicleError::NotFound(format!("unknown sandbox: {}", sandbox_id)))?;
        let changed = entry.state.check_transition(target)?;
        if changed {
            entry.state = target;
        }
        Ok(changed)
    }

    /// Runs one container CLI command to completion.
    async fn cli(&self, args: &[String]) -> CubicleResult<std::process::Output> {
        debug!(?args, "container cli");
        let output = Command::new(CONTAINER_CLI)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(CubicleError::Fatal(format!(
                "{} {} failed: {}",
                CONTAINER_CLI,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl IsolationDriver for ContainerDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Container
    }

    async fn available(&self) -> bool {
        Command::new(CONTAINER_CLI)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn provision(&self, spec: ProvisionSpec) -> CubicleResult<DriverHandle> {
        HandleState::Uninitialized.check_transition(HandleState::Provisioned)?;
        create_private_dir(&spec.workspace_root).await?;

        let name = self.container_name(&spec.sandbox_id);
        let guest = self.settings.get_workspace_guest_path().clone();
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name.clone(),
            "--hostname".into(),
            name.clone(),
            "--restart".into(),
            self.settings.get_restart_policy().clone(),
            "--memory".into(),
            format!("{}m", spec.caps.mem_size_mib),
            "--cpus".into(),
            spec.caps.vcpu_count.to_string(),
            "-v".into(),
            format!("{}:{}", spec.workspace_root.display(), guest),
            "-w".into(),
            guest,
        ];
        for mapping in &spec.publish_ports {
            args.push("-p".into());
            args.push(format!("{}:{}", mapping.host, mapping.guest));
        }
        args.push(self.settings.get_image().clone());
        args.extend(["sleep".into(), "infinity".into()]);

        self.cli(&args).await?;

        self.boxes.insert(
            spec.sandbox_id.clone(),
            ContainerBox {
                state: HandleState::Provisioned,
                name,
                workspace: spec.workspace_root,
            },
        );

        Ok(DriverHandle {
            sandbox_id: spec.sandbox_id,
            kind: DriverKind::Container,
        })
    }

    async fn start(&self, handle: &DriverHandle) -> CubicleResult<()> {
        if self.transition(&handle.sandbox_id, HandleState::Running)? {
            let (_, name) = self.require_box(&handle.sandbox_id)?;
            self.cli(&["start".into(), name]).await?;
        }
        Ok(())
    }

    async fn pause(&self, handle: &DriverHandle) -> CubicleResult<()> {
        if self.transition(&handle.sandbox_id, HandleState::Paused)? {
            let (_, name) = self.require_box(&handle.sandbox_id)?;
            self.cli(&["pause".into(), name]).await?;
        }
        Ok(())
    }

    async fn resume(&self, handle: &DriverHandle) -> CubicleResult<()> {
        if self.transition(&handle.sandbox_id, HandleState::Running)? {
            let (_, name) = self.require_box(&handle.sandbox_id)?;
            self.cli(&["unpause".into(), name]).await?;
        }
        Ok(())
    }

    async fn stop(&self, handle: &DriverHandle) -> CubicleResult<()> {
        if self.transition(&handle.sandbox_id, HandleState::Stopped)? {
            let (_, name) = self.require_box(&handle.sandbox_id)?;
            self.cli(&["stop".into(), "-t".into(), STOP_GRACE_SECONDS.into(), name])
                .await?;
        }
        Ok(())
    }

    async fn exec(&self, handle: &DriverHandle, request: ExecRequest) -> CubicleResult<ExecOutcome> {
        let (state, name) = self.require_box(&handle.sandbox_id)?;
        state.require_running(&handle.sandbox_id)?;
        if request.argv.is_empty() {
            return Err(CubicleError::InvalidArgument("argv cannot be empty".into()));
        }

        let mut command = Command::new(CONTAINER_CLI);
        command.arg("exec");
        if request.stdin.is_some() {
            command.arg("-i");
        }
        command
            .arg(&name)
            .args(&request.argv)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        if let Some(stdin_bytes) = &request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(stdin_bytes).await?;
                drop(stdin);
            }
        }

        let wait = async {
            let output = child.wait_with_output().await?;
            Result::Ok::<_, std::io::Error>(output)
        };

        let output = tokio::select! {
            output = wait => output?,
            _ = request.cancel.cancelled() => {
                return Ok(ExecOutcome {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    timed_out: false,
                });
            }
            _ = sleep_opt(request.timeout) => {
                return Err(CubicleError::TimedOut(format!(
                    "exec exceeded {:?}",
                    request.timeout
                )));
            }
        };

        Ok(ExecOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
        })
    }

    async fn open_stream(&self, handle: &DriverHandle) -> CubicleResult<DriverStream> {
        let (state, name) = self.require_box(&handle.sandbox_id)?;
        state.require_running(&handle.sandbox_id)?;

        let child = Command::new(CONTAINER_CLI)
            .args(["exec", "-i", &name, "sh", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        Ok(Box::new(ChildStream::new(child)?))
    }

    async fn mount(
        &self,
        _handle: &DriverHandle,
        _host_path: &Path,
        _guest_path: &str,
        _read_only: bool,
    ) -> CubicleResult<()> {
        // Bind mounts are fixed at container creation.
        Err(CubicleError::InvalidArgument(
            "container driver cannot attach mounts after provision; declare them in the provision spec"
                .to_string(),
        ))
    }

    async fn destroy(&self, handle: &DriverHandle, remove_workspace: bool) -> CubicleResult<()> {
        let Some((_, entry)) = self.boxes.remove(&handle.sandbox_id) else {
            return Ok(());
        };
        entry.state.check_transition(HandleState::Destroyed)?;

        if let Err(e) = self.cli(&["rm".into(), "-f".into(), entry.name.clone()]).await {
            warn!(container = %entry.name, error = %e, "failed to remove container");
        }
        if remove_workspace {
            if let Err(e) = fs::remove_dir_all(&entry.workspace).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn sleep_opt(duration: Option<std::time::Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerSettings;

    #[test]
    fn test_container_names_are_prefixed() {
        let driver = ContainerDriver::new(ContainerSettings::default());
        assert_eq!(driver.container_name("sbx_ab12"), "cubicle-sbx_ab12");
    }

    #[tokio::test]
    async fn test_operations_on_unknown_sandbox_are_not_found() {
        let driver = ContainerDriver::new(ContainerSettings::default());
        let handle = DriverHandle {
            sandbox_id: "sbx_missing".to_string(),
            kind: DriverKind::Container,
        };
        assert!(matches!(
            driver.start(&handle).await,
            Err(CubicleError::NotFound(_))
        ));
        assert!(matches!(
            driver.open_stream(&handle).await,
            Err(CubicleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mount_after_provision_rejected() {
        let driver = ContainerDriver::new(ContainerSettings::default());
        let handle = DriverHandle {
            sandbox_id: "sbx_x".to_string(),
            kind: DriverKind::Container,
        };
        assert!(matches!(
            driver.mount(&handle, Path::new("/tmp"), "data", false).await,
            Err(CubicleError::InvalidArgument(_))
        ));
    }
}
