//! The microVM isolation driver.
//!
//! Provisions a lightweight VM per sandbox from configured kernel and rootfs
//! images and speaks a newline-delimited JSON control protocol over a per-VM
//! unix socket: one request frame out, one response frame back.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
    process::Command,
    time::sleep,
};
use tracing::{debug, warn};

use super::{
    DriverHandle, DriverKind, DriverStream, ExecOutcome, ExecRequest, HandleState, IsolationDriver,
    ProvisionSpec,
};
use crate::{config::MicroVmSettings, utils::create_private_dir, CubicleError, CubicleResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Boot arguments for the guest kernel; unused hardware is disabled to keep
/// boot times down.
const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off i8042.noaux quiet";

/// The guest path the workspace is shared at.
const GUEST_WORKSPACE: &str = "/workspace";

/// How long to wait for the control socket to appear after spawn.
const BOOT_WAIT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the control socket.
const BOOT_POLL: Duration = Duration::from_millis(100);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// MicroVM-backed isolation.
pub struct MicroVmDriver {
    settings: MicroVmSettings,
    boxes: DashMap<String, VmBox>,
}

struct VmBox {
    state: HandleState,
    socket: PathBuf,
    monitor_pid: Option<u32>,
    workspace: PathBuf,
}

/// A control-protocol request frame.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControlRequest<'a> {
    Start,
    Pause,
    Resume,
    Stop,
    Shutdown,
    Exec {
        argv: &'a [String],
        stdin: Option<&'a str>,
        timeout_ms: Option<u64>,
    },
    Mount {
        host: &'a str,
        guest: &'a str,
        read_only: bool,
    },
    Attach,
}

/// A control-protocol response frame.
#[derive(Debug, Deserialize)]
struct ControlResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    timed_out: Option<bool>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MicroVmDriver {
    /// Creates the driver.
    pub fn new(settings: MicroVmSettings) -> Self {
        Self {
            settings,
            boxes: DashMap::new(),
        }
    }

    fn socket_path(sandbox_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cubicle-vm-{}.sock", sandbox_id))
    }

    fn require_box(&self, sandbox_id: &str) -> CubicleResult<(HandleState, PathBuf)> {
        let entry = self
            .boxes
            .get(sandbox_id)
            .ok_or_else(|| CubicleError::NotFound(format!("unknown sandbox: {}", sandbox_id)))?;
        Ok((entry.state, entry.socket.clone()))
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

    /// Sends one request frame and reads one response frame.
    async fn control(socket: &Path, request: &ControlRequest<'_>) -> CubicleResult<ControlResponse> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| CubicleError::Transient(format!("vm control connect: {}", e)))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');
        write_half
            .write_all(&frame)
            .await
            .map_err(|e| CubicleError::Transient(format!("vm control write: {}", e)))?;

        let mut line = String::new();
        BufReader::new(read_half)
            .read_line(&mut line)
            .await
            .map_err(|e| CubicleError::Transient(format!("vm control read: {}", e)))?;

        let response: ControlResponse = serde_json::from_str(line.trim())?;
        if !response.ok {
            return Err(CubicleError::Fatal(format!(
                "vm control error: {}",
                response.error.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        Ok(response)
    }

    async fn lifecycle_op(
        &self,
        handle: &DriverHandle,
        target: HandleState,
        request: ControlRequest<'_>,
    ) -> CubicleResult<()> {
        if self.transition(&handle.sandbox_id, target)? {
            let (_, socket) = self.require_box(&handle.sandbox_id)?;
            Self::control(&socket, &request).await?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl IsolationDriver for MicroVmDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::MicroVm
    }

    async fn available(&self) -> bool {
        let (Some(exe), Some(kernel), Some(rootfs)) = (
            self.settings.get_exe_path(),
            self.settings.get_kernel_path(),
            self.settings.get_rootfs_path(),
        ) else {
            return false;
        };
        let Ok(meta) = fs::metadata(exe).await else {
            return false;
        };
        #[cfg(unix)]
        let executable = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o111 != 0
        };
        #[cfg(not(unix))]
        let executable = true;
        executable
            && fs::try_exists(kernel).await.unwrap_or(false)
            && fs::try_exists(rootfs).await.unwrap_or(false)
    }

    async fn provision(&self, spec: ProvisionSpec) -> CubicleResult<DriverHandle> {
        HandleState::Uninitialized.check_transition(HandleState::Provisioned)?;
        let (Some(exe), Some(kernel), Some(rootfs)) = (
            self.settings.get_exe_path(),
            self.settings.get_kernel_path(),
            self.settings.get_rootfs_path(),
        ) else {
            return Err(CubicleError::PreconditionFailed(
                "microvm exe, kernel, and rootfs paths must be configured".to_string(),
            ));
        };

        create_private_dir(&spec.workspace_root).await?;
        let socket = Self::socket_path(&spec.sandbox_id);
        let _ = fs::remove_file(&socket).await;

        let child = Command::new(exe)
            .arg("--api-sock")
            .arg(&socket)
            .arg("--kernel")
            .arg(kernel)
            .arg("--rootfs")
            .arg(rootfs)
            .arg("--vcpus")
            .arg(spec.caps.vcpu_count.to_string())
            .arg("--mem-mib")
            .arg(spec.caps.mem_size_mib.to_string())
            .arg("--share-dir")
            .arg(format!("{}:{}", spec.workspace_root.display(), GUEST_WORKSPACE))
            .arg("--boot-args")
            .arg(BOOT_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let monitor_pid = child.id();

        // The monitor signals readiness by creating its control socket.
        let deadline = tokio::time::Instant::now() + BOOT_WAIT;
        while !fs::try_exists(&socket).await.unwrap_or(false) {
            if tokio::time::Instant::now() >= deadline {
                if let Some(pid) = monitor_pid {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                return Err(CubicleError::TimedOut(format!(
                    "vm control socket did not appear within {:?}",
                    BOOT_WAIT
                )));
            }
            sleep(BOOT_POLL).await;
        }
        debug!(sandbox_id = %spec.sandbox_id, socket = %socket.display(), "vm booted");

        self.boxes.insert(
            spec.sandbox_id.clone(),
            VmBox {
                state: HandleState::Provisioned,
                socket,
                monitor_pid,
                workspace: spec.workspace_root,
            },
        );

        Ok(DriverHandle {
            sandbox_id: spec.sandbox_id,
            kind: DriverKind::MicroVm,
        })
    }

    async fn start(&self, handle: &DriverHandle) -> CubicleResult<()> {
        self.lifecycle_op(handle, HandleState::Running, ControlRequest::Start)
            .await
    }

    async fn pause(&self, handle: &DriverHandle) -> CubicleResult<()> {
        self.lifecycle_op(handle, HandleState::Paused, ControlRequest::Pause)
            .await
    }

    async fn resume(&self, handle: &DriverHandle) -> CubicleResult<()> {
        self.lifecycle_op(handle, HandleState::Running, ControlRequest::Resume)
            .await
    }

    async fn stop(&self, handle: &DriverHandle) -> CubicleResult<()> {
        self.lifecycle_op(handle, HandleState::Stopped, ControlRequest::Stop)
            .await
    }

    async fn exec(&self, handle: &DriverHandle, request: ExecRequest) -> CubicleResult<ExecOutcome> {
        let (state, socket) = self.require_box(&handle.sandbox_id)?;
        state.require_running(&handle.sandbox_id)?;
        if request.argv.is_empty() {
            return Err(CubicleError::InvalidArgument("argv cannot be empty".into()));
        }

        let stdin_text = request
            .stdin
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).to_string());
        let frame = ControlRequest::Exec {
            argv: &request.argv,
            stdin: stdin_text.as_deref(),
            timeout_ms: request.timeout.map(|t| t.as_millis() as u64),
        };

        // The guest enforces the timeout; the host adds a grace margin so a
        // wedged guest cannot hang the control plane.
        let host_budget = request
            .timeout
            .map(|t| t + Duration::from_secs(5));

        let call = Self::control(&socket, &frame);
        let response = tokio::select! {
            response = call => response?,
            _ = request.cancel.cancelled() => {
                return Ok(ExecOutcome {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    timed_out: false,
                });
            }
            _ = sleep_opt(host_budget) => {
                return Err(CubicleError::TimedOut(format!(
                    "vm exec exceeded {:?}",
                    request.timeout
                )));
            }
        };

        if response.timed_out.unwrap_or(false) {
            return Err(CubicleError::TimedOut(format!(
                "exec exceeded {:?}",
                request.timeout
            )));
        }

        Ok(ExecOutcome {
            stdout: response.stdout.unwrap_or_default(),
            stderr: response.stderr.unwrap_or_default(),
            exit_code: response.exit_code.unwrap_or(-1),
            timed_out: false,
        })
    }

    async fn open_stream(&self, handle: &DriverHandle) -> CubicleResult<DriverStream> {
        let (state, socket) = self.require_box(&handle.sandbox_id)?;
        state.require_running(&handle.sandbox_id)?;

        let mut stream = UnixStream::connect(&socket)
            .await
            .map_err(|e| CubicleError::Transient(format!("vm control connect: {}", e)))?;
        let mut frame = serde_json::to_vec(&ControlRequest::Attach)?;
        frame.push(b'\n');
        stream
            .write_all(&frame)
            .await
            .map_err(|e| CubicleError::Transient(format!("vm attach: {}", e)))?;

        // After the attach frame the socket carries raw terminal bytes.
        Ok(Box::new(stream))
    }

    async fn mount(
        &self,
        handle: &DriverHandle,
        host_path: &Path,
        guest_path: &str,
        read_only: bool,
    ) -> CubicleResult<()> {
        let (_, socket) = self.require_box(&handle.sandbox_id)?;
        Self::control(
            &socket,
            &ControlRequest::Mount {
                host: &host_path.to_string_lossy(),
                guest: guest_path,
                read_only,
            },
        )
        .await?;
        Ok(())
    }

    async fn destroy(&self, handle: &DriverHandle, remove_workspace: bool) -> CubicleResult<()> {
        let Some((_, entry)) = self.boxes.remove(&handle.sandbox_id) else {
            return Ok(());
        };
        entry.state.check_transition(HandleState::Destroyed)?;

        if let Err(e) = Self::control(&entry.socket, &ControlRequest::Shutdown).await {
            debug!(sandbox_id = %handle.sandbox_id, error = %e, "vm shutdown frame failed");
        }
        if let Some(pid) = entry.monitor_pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let _ = fs::remove_file(&entry.socket).await;

        if remove_workspace {
            if let Err(e) = fs::remove_dir_all(&entry.workspace).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "failed to remove workspace");
                }
            }
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(d) => sleep(d).await,
        None => std::future::pending().await,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_without_configured_paths() {
        let driver = MicroVmDriver::new(MicroVmSettings::default());
        assert!(!driver.available().await);
    }

    #[tokio::test]
    async fn test_provision_requires_configuration() {
        let driver = MicroVmDriver::new(MicroVmSettings::default());
        let spec = ProvisionSpec::builder()
            .sandbox_id("sbx_vm".to_string())
            .user_id("u_a".to_string())
            .workspace_root(std::env::temp_dir().join("cubicle-vm-test"))
            .build();
        assert!(matches!(
            driver.provision(spec).await,
            Err(CubicleError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn test_control_frames_serialize() {
        let argv = vec!["echo".to_string(), "hi".to_string()];
        let frame = ControlRequest::Exec {
            argv: &argv,
            stdin: None,
            timeout_ms: Some(5000),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"op\":\"exec\""));
        assert!(json.contains("\"timeout_ms\":5000"));

        let response: ControlResponse =
            serde_json::from_str(r#"{"ok":true,"stdout":"hi\n","exit_code":0}"#).unwrap();
        assert!(response.ok);
        assert_eq!(response.stdout.as_deref(), Some("hi\n"));
        assert_eq!(response.exit_code, Some(0));
    }
}
