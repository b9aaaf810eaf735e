//! The process isolation driver.
//!
//! Runs commands as child processes with their working directory scoped to the
//! sandbox workspace. No kernel-level isolation is claimed; the driver exists so
//! the control plane stays functional on hosts without a VM monitor or container
//! daemon, and it refuses any command outside the deployment allow-list.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use dashmap::DashMap;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{fs, io::AsyncReadExt, io::AsyncWriteExt, process::Command};
use tracing::{debug, warn};

use super::{
    ChildStream, DriverHandle, DriverKind, DriverStream, ExecOutcome, ExecRequest, HandleState,
    IsolationDriver, ProvisionSpec, ResourceSample,
};
use crate::{
    utils::{create_private_dir, normalize_path, PathKind},
    CubicleError, CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Filesystem-scoped child-process isolation.
pub struct ProcessDriver {
    allowed: HashSet<String>,
    boxes: DashMap<String, ProcessBox>,
}

/// Per-sandbox driver state.
struct ProcessBox {
    state: HandleState,
    workspace: PathBuf,
    live_pids: HashSet<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessDriver {
    /// Creates the driver with a deployment command allow-list.
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self {
            allowed: allowed_commands.into_iter().collect(),
            boxes: DashMap::new(),
        }
    }

    fn require_box(
        &self,
        sandbox_id: &str,
    ) -> CubicleResult<dashmap::mapref::one::RefMut<'_, String, ProcessBox>> {
        self.boxes
            .get_mut(sandbox_id)
            .ok_or_else(|| CubicleError::NotFound(format!("unknown sandbox: {}", sandbox_id)))
    }

    fn transition(&self, sandbox_id: &str, target: HandleState) -> CubicleResult<bool> {
        let mut entry = self.require_box(sandbox_id)?;
        let changed = entry.state.check_transition(target)?;
        if changed {
            entry.state = target;
        }
        Ok(changed)
    }

    fn check_allowed(&self, argv: &[String]) -> CubicleResult<()> {
        let program = argv
            .first()
            .ok_or_else(|| CubicleError::InvalidArgument("argv cannot be empty".into()))?;
        let name = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| program.clone());
        if self.allowed.contains(&name) {
            Ok(())
        } else {
            Err(CubicleError::InvalidArgument(format!(
                "command {:?} is not in the process-driver allow-list",
                name
            )))
        }
    }

    fn signal_live(&self, sandbox_id: &str, signal: Signal) {
        if let Some(entry) = self.boxes.get(sandbox_id) {
            for pid in &entry.live_pids {
                if let Err(e) = kill(Pid::from_raw(*pid as i32), signal) {
                    debug!(sandbox_id, pid, signal = %signal, error = %e, "signal failed");
                }
            }
        }
    }

    fn track_pid(&self, sandbox_id: &str, pid: u32, add: bool) {
        if let Some(mut entry) = self.boxes.get_mut(sandbox_id) {
            if add {
                entry.live_pids.insert(pid);
            } else {
                entry.live_pids.remove(&pid);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl IsolationDriver for ProcessDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Process
    }

    async fn available(&self) -> bool {
        // The fallback of last resort.
        true
    }

    async fn provision(&self, spec: ProvisionSpec) -> CubicleResult<DriverHandle> {
        HandleState::Uninitialized.check_transition(HandleState::Provisioned)?;
        create_private_dir(&spec.workspace_root).await?;

        self.boxes.insert(
            spec.sandbox_id.clone(),
            ProcessBox {
                state: HandleState::Provisioned,
                workspace: spec.workspace_root.clone(),
                live_pids: HashSet::new(),
            },
        );

        Ok(DriverHandle {
            sandbox_id: spec.sandbox_id,
            kind: DriverKind::Process,
        })
    }

    async fn start(&self, handle: &DriverHandle) -> CubicleResult<()> {
        self.transition(&handle.sandbox_id, HandleState::Running)?;
        Ok(())
    }

    async fn pause(&self, handle: &DriverHandle) -> CubicleResult<()> {
        if self.transition(&handle.sandbox_id, HandleState::Paused)? {
            self.signal_live(&handle.sandbox_id, Signal::SIGSTOP);
        }
        Ok(())
    }

    async fn resume(&self, handle: &DriverHandle) -> CubicleResult<()> {
        if self.transition(&handle.sandbox_id, HandleState::Running)? {
            self.signal_live(&handle.sandbox_id, Signal::SIGCONT);
        }
        Ok(())
    }

    async fn stop(&self, handle: &DriverHandle) -> CubicleResult<()> {
        if self.transition(&handle.sandbox_id, HandleState::Stopped)? {
            self.signal_live(&handle.sandbox_id, Signal::SIGKILL);
        }
        Ok(())
    }

    async fn exec(&self, handle: &DriverHandle, request: ExecRequest) -> CubicleResult<ExecOutcome> {
        let workspace = {
            let entry = self.require_box(&handle.sandbox_id)?;
            entry.state.require_running(&handle.sandbox_id)?;
            entry.workspace.clone()
        };
        self.check_allowed(&request.argv)?;

        let mut command = Command::new(&request.argv[0]);
        command
            .args(&request.argv[1..])
            .current_dir(&workspace)
            .env("HOME", &workspace)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or_default();
        self.track_pid(&handle.sandbox_id, pid, true);

        if let Some(stdin_bytes) = &request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(stdin_bytes).await?;
                drop(stdin);
            }
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let mut timed_out = false;
        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = request.cancel.cancelled() => {
                cancelled = true;
                None
            }
            _ = sleep_opt(request.timeout) => {
                timed_out = true;
                None
            }
        };

        let status = match status {
            Some(status) => Some(status),
            None => {
                let _ = child.start_kill();
                Some(child.wait().await?)
            }
        };

        self.track_pid(&handle.sandbox_id, pid, false);

        if timed_out {
            return Err(CubicleError::TimedOut(format!(
                "exec exceeded {:?}",
                request.timeout
            )));
        }

        let stdout = String::from_utf8_lossy(&stdout_task.await?).to_string();
        let stderr = String::from_utf8_lossy(&stderr_task.await?).to_string();
        let exit_code = if cancelled {
            -1
        } else {
            status.and_then(|s| s.code()).unwrap_or(-1)
        };

        Ok(ExecOutcome {
            stdout,
            stderr,
            exit_code,
            timed_out: false,
        })
    }

    async fn open_stream(&self, handle: &DriverHandle) -> CubicleResult<DriverStream> {
        let workspace = {
            let entry = self.require_box(&handle.sandbox_id)?;
            entry.state.require_running(&handle.sandbox_id)?;
            entry.workspace.clone()
        };
        self.check_allowed(&["sh".to_string()])?;

        let child = Command::new("sh")
            .arg("-i")
            .current_dir(&workspace)
            .env("HOME", &workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        Ok(Box::new(ChildStream::new(child)?))
    }

    async fn mount(
        &self,
        handle: &DriverHandle,
        host_path: &Path,
        guest_path: &str,
        read_only: bool,
    ) -> CubicleResult<()> {
        let workspace = {
            let entry = self.require_box(&handle.sandbox_id)?;
            entry.workspace.clone()
        };
        if !fs::try_exists(host_path).await? {
            return Err(CubicleError::NotFound(format!(
                "mount source missing: {}",
                host_path.display()
            )));
        }
        if read_only {
            // Symlink attachment cannot enforce read-only on its own.
            warn!(
                sandbox_id = %handle.sandbox_id,
                "process driver cannot enforce read-only mounts"
            );
        }

        let rel = normalize_path(guest_path, PathKind::Relative)?;
        let link = workspace.join(rel);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).await?;
        }
        #[cfg(unix)]
        fs::symlink(host_path, &link).await?;
        Ok(())
    }

    async fn destroy(&self, handle: &DriverHandle, remove_workspace: bool) -> CubicleResult<()> {
        let Some((_, entry)) = self.boxes.remove(&handle.sandbox_id) else {
            // Already destroyed.
            return Ok(());
        };
        entry.state.check_transition(HandleState::Destroyed)?;

        for pid in &entry.live_pids {
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
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

    async fn sample(&self, handle: &DriverHandle) -> Option<ResourceSample> {
        let pids: Vec<u32> = self
            .boxes
            .get(&handle.sandbox_id)?
            .live_pids
            .iter()
            .copied()
            .collect();
        if pids.is_empty() {
            return Some(ResourceSample::default());
        }

        let sample = tokio::task::spawn_blocking(move || {
            let mut system = sysinfo::System::new();
            system.refresh_processes(
                sysinfo::ProcessesToUpdate::Some(
                    &pids
                        .iter()
                        .map(|p| sysinfo::Pid::from_u32(*p))
                        .collect::<Vec<_>>(),
                ),
                true,
            );
            let memory_bytes = pids
                .iter()
                .filter_map(|p| system.process(sysinfo::Pid::from_u32(*p)))
                .map(|process| process.memory())
                .sum();
            ResourceSample { memory_bytes }
        })
        .await
        .ok()?;
        Some(sample)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sleeps for `duration`, or pends forever when there is no timeout.
async fn sleep_opt(duration: Option<std::time::Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
