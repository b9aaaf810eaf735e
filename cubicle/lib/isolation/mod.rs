//! Pluggable sandbox isolation drivers.
//!
//! Every driver exposes the same capability set: provision, lifecycle
//! transitions, exec, interactive streams, mounts, and destroy. The shared
//! state machine is `uninitialized → provisioned → running ↔ paused → stopped
//! → destroyed`; transitions not in that diagram are `PreconditionFailed`, and
//! lifecycle operations are idempotent when the sandbox is already in the
//! requested state.

mod container;
mod microvm;
mod process;
mod stream;

use std::{path::{Path, PathBuf}, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use typed_builder::TypedBuilder;

use crate::{
    config::{Config, IsolationKind},
    CubicleError, CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use container::*;
pub use microvm::*;
pub use process::*;
pub use stream::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The concrete driver a sandbox is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Lightweight virtual machines.
    #[serde(rename = "microvm")]
    MicroVm,

    /// Containers driven through the container CLI.
    Container,

    /// Filesystem-scoped child processes.
    Process,
}

/// Lifecycle state of a driver-managed sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    /// No driver resources exist yet.
    Uninitialized,

    /// Resources allocated, not running.
    Provisioned,

    /// Accepting exec and streams.
    Running,

    /// Frozen; resume returns to running.
    Paused,

    /// Halted; only destroy may follow.
    Stopped,

    /// Terminal.
    Destroyed,
}

/// Resource caps applied at provision time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct ResourceCaps {
    /// Number of virtual CPUs.
    #[builder(default = 1)]
    pub vcpu_count: u8,

    /// Guest memory in MiB.
    #[builder(default = 512)]
    pub mem_size_mib: u32,
}

/// A host-to-guest port mapping requested at provision time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host side.
    pub host: u16,

    /// Port inside the sandbox.
    pub guest: u16,
}

/// Everything a driver needs to provision a sandbox.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ProvisionSpec {
    /// The sandbox being provisioned.
    pub sandbox_id: String,

    /// The owning user.
    pub user_id: String,

    /// Absolute host path of the sandbox workspace.
    pub workspace_root: PathBuf,

    /// Resource caps.
    #[builder(default = ResourceCaps::builder().build())]
    pub caps: ResourceCaps,

    /// Ports published from the sandbox to the host.
    #[builder(default)]
    pub publish_ports: Vec<PortMapping>,
}

/// An opaque reference to a provisioned sandbox inside a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverHandle {
    /// The sandbox this handle belongs to.
    pub sandbox_id: String,

    /// The driver that owns the handle.
    pub kind: DriverKind,
}

/// One command execution inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Program and arguments.
    pub argv: Vec<String>,

    /// Bytes fed to the child's stdin.
    pub stdin: Option<Bytes>,

    /// Wall-clock budget; `None` means no timeout (background jobs).
    pub timeout: Option<Duration>,

    /// Cancellation terminates the child promptly.
    pub cancel: CancellationToken,
}

/// A point-in-time resource sample for a sandbox.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Resident memory of the sandbox's live processes.
    pub memory_bytes: u64,
}

/// The result of one command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// The child's exit status; undefined when `timed_out` is set.
    pub exit_code: i32,

    /// Whether the execution hit its wall-clock budget.
    pub timed_out: bool,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The capability set every isolation backend provides.
#[async_trait]
pub trait IsolationDriver: Send + Sync {
    /// Which driver this is.
    fn kind(&self) -> DriverKind;

    /// Whether the driver can run on this host right now.
    async fn available(&self) -> bool;

    /// Allocates driver resources for a sandbox.
    async fn provision(&self, spec: ProvisionSpec) -> CubicleResult<DriverHandle>;

    /// Starts a provisioned sandbox. Idempotent.
    async fn start(&self, handle: &DriverHandle) -> CubicleResult<()>;

    /// Freezes a running sandbox. Idempotent.
    async fn pause(&self, handle: &DriverHandle) -> CubicleResult<()>;

    /// Unfreezes a paused sandbox. Idempotent.
    async fn resume(&self, handle: &DriverHandle) -> CubicleResult<()>;

    /// Halts a sandbox. Idempotent.
    async fn stop(&self, handle: &DriverHandle) -> CubicleResult<()>;

    /// Runs one command inside a running sandbox.
    async fn exec(&self, handle: &DriverHandle, request: ExecRequest) -> CubicleResult<ExecOutcome>;

    /// Opens a bidirectional byte stream into a running sandbox.
    async fn open_stream(&self, handle: &DriverHandle) -> CubicleResult<DriverStream>;

    /// Attaches a host path inside the sandbox.
    async fn mount(
        &self,
        handle: &DriverHandle,
        host_path: &Path,
        guest_path: &str,
        read_only: bool,
    ) -> CubicleResult<()>;

    /// Releases all driver resources.
    ///
    /// The workspace stays on disk unless `remove_workspace` is set.
    async fn destroy(&self, handle: &DriverHandle, remove_workspace: bool) -> CubicleResult<()>;

    /// Samples current resource usage, when the driver can observe it.
    async fn sample(&self, handle: &DriverHandle) -> Option<ResourceSample> {
        let _ = handle;
        None
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HandleState {
    /// Validates a lifecycle transition.
    ///
    /// Returns `Ok(false)` when the sandbox is already in the target state (the
    /// operation is an idempotent no-op) and `PreconditionFailed` for
    /// transitions outside the state diagram.
    pub fn check_transition(self, target: HandleState) -> CubicleResult<bool> {
        if self == target {
            return Ok(false);
        }
        let allowed = matches!(
            (self, target),
            (HandleState::Uninitialized, HandleState::Provisioned)
                | (HandleState::Provisioned, HandleState::Running)
                | (HandleState::Running, HandleState::Paused)
                | (HandleState::Paused, HandleState::Running)
                | (HandleState::Running, HandleState::Stopped)
                | (HandleState::Paused, HandleState::Stopped)
                | (HandleState::Provisioned, HandleState::Destroyed)
                | (HandleState::Running, HandleState::Destroyed)
                | (HandleState::Paused, HandleState::Destroyed)
                | (HandleState::Stopped, HandleState::Destroyed)
        );
        if allowed {
            Ok(true)
        } else {
            Err(CubicleError::PreconditionFailed(format!(
                "invalid transition {:?} -> {:?}",
                self, target
            )))
        }
    }

    /// Fails unless exec and streams are valid in this state.
    pub fn require_running(self, sandbox_id: &str) -> CubicleResult<()> {
        if self == HandleState::Running {
            Ok(())
        } else {
            Err(CubicleError::PreconditionFailed(format!(
                "sandbox {} is {:?}, not running",
                sandbox_id, self
            )))
        }
    }
}

impl DriverKind {
    /// The label used in logs and upstream descriptors.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::MicroVm => "microvm",
            DriverKind::Container => "container",
            DriverKind::Process => "process",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the driver selected by configuration.
///
/// `auto` picks the microVM driver when its binary, kernel, and rootfs are all
/// present, else the container driver when the container daemon answers, else
/// the process driver.
pub async fn select_driver(config: &Config) -> CubicleResult<Arc<dyn IsolationDriver>> {
    let driver: Arc<dyn IsolationDriver> = match config.get_isolation_backend() {
        IsolationKind::MicroVm => Arc::new(MicroVmDriver::new(config.get_microvm().clone())),
        IsolationKind::Container => Arc::new(ContainerDriver::new(config.get_container().clone())),
        IsolationKind::Process => Arc::new(ProcessDriver::new(
            config.get_process_allowed_commands().clone(),
        )),
        IsolationKind::Auto => {
            let microvm = MicroVmDriver::new(config.get_microvm().clone());
            if microvm.available().await {
                info!("auto-selected microvm isolation");
                return Ok(Arc::new(microvm));
            }
            let container = ContainerDriver::new(config.get_container().clone());
            if container.available().await {
                info!("auto-selected container isolation");
                return Ok(Arc::new(container));
            }
            info!("auto-selected process isolation");
            Arc::new(ProcessDriver::new(
                config.get_process_allowed_commands().clone(),
            ))
        }
    };
    Ok(driver)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_accepts_diagram_edges() {
        assert!(HandleState::Uninitialized
            .check_transition(HandleState::Provisioned)
            .unwrap());
        assert!(HandleState::Provisioned
            .check_transition(HandleState::Running)
            .unwrap());
        assert!(HandleState::Running
            .check_transition(HandleState::Paused)
            .unwrap());
        assert!(HandleState::Paused
            .check_transition(HandleState::Running)
            .unwrap());
        assert!(HandleState::Paused
            .check_transition(HandleState::Stopped)
            .unwrap());
        assert!(HandleState::Stopped
            .check_transition(HandleState::Destroyed)
            .unwrap());
    }

    #[test]
    fn test_state_machine_idempotent_same_state() {
        assert!(!HandleState::Running
            .check_transition(HandleState::Running)
            .unwrap());
        assert!(!HandleState::Stopped
            .check_transition(HandleState::Stopped)
            .unwrap());
    }

    #[test]
    fn test_state_machine_rejects_unlisted_edges() {
        assert!(HandleState::Stopped
            .check_transition(HandleState::Running)
            .is_err());
        assert!(HandleState::Provisioned
            .check_transition(HandleState::Paused)
            .is_err());
        assert!(HandleState::Destroyed
            .check_transition(HandleState::Running)
            .is_err());
        assert!(HandleState::Uninitialized
            .check_transition(HandleState::Running)
            .is_err());
    }

    #[test]
    fn test_require_running() {
        assert!(HandleState::Running.require_running("s").is_ok());
        assert!(matches!(
            HandleState::Paused.require_running("s"),
            Err(CubicleError::PreconditionFailed(_))
        ));
    }
}
